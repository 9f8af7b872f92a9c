//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. `config/txm.toml` (base configuration; every key has a default)
//! 2. Environment variables prefixed with `TXM_`, nesting with `__`
//!
//! Example: `TXM_INSTRUMENT__HAS_PERMIT=true` grants the beamline permit.
//!
//! # Example
//! ```no_run
//! use txm_control::config::TxmConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TxmConfig::load()?;
//! config.validate()?;
//! println!("Instrument: {}", config.instrument.variant);
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{TxmError, TxmResult};
use crate::names::InstrumentVariant;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/txm.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxmConfig {
    /// `[application]`
    pub application: ApplicationConfig,
    /// `[instrument]`
    pub instrument: InstrumentConfig,
    /// `[optics]`
    pub optics: OpticsConfig,
    /// `[timing]`
    pub timing: TimingConfig,
    /// `[storage]`
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "TXM control".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Which instrument, and what it is allowed to touch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    /// Nano or micro stage
    pub variant: InstrumentVariant,
    /// Substituted for `{ioc_prefix}` in detector and plugin PV names
    pub ioc_prefix: String,
    /// Beamline permit: shutters and source energy may be changed
    pub has_permit: bool,
    /// Operate the front-end shutter
    pub use_shutter_a: bool,
    /// Operate the station shutter
    pub use_shutter_b: bool,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            variant: InstrumentVariant::Nano,
            ioc_prefix: "32idcPG3:".to_string(),
            has_permit: false,
            use_shutter_a: false,
            use_shutter_b: true,
        }
    }
}

/// Zone-plate geometry and energy limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpticsConfig {
    /// Zone plate diameter (µm)
    pub zone_plate_diameter: f64,
    /// Outermost zone width (nm)
    pub outer_zone_width: f64,
    /// Added to the undulator gap energy (keV)
    pub gap_offset: f64,
    /// Lowest selectable energy (keV)
    pub energy_min: f64,
    /// Highest selectable energy (keV)
    pub energy_max: f64,
    /// Zone-plate x correction per unit of zone-plate z travel
    pub zone_plate_drift_x: f64,
    /// Zone-plate y correction per unit of zone-plate z travel
    pub zone_plate_drift_y: f64,
}

impl Default for OpticsConfig {
    fn default() -> Self {
        Self {
            zone_plate_diameter: 180.0,
            outer_zone_width: 60.0,
            gap_offset: 0.17,
            energy_min: 6.4,
            energy_max: 30.0,
            zone_plate_drift_x: 0.0,
            zone_plate_drift_y: 0.0,
        }
    }
}

impl OpticsConfig {
    /// Whether `energy` keV lies within the configured limits.
    pub fn energy_in_range(&self, energy: f64) -> bool {
        (self.energy_min..=self.energy_max).contains(&energy)
    }

    /// Whether either drift coefficient is set.
    pub fn has_drift_correction(&self) -> bool {
        self.zone_plate_drift_x != 0.0 || self.zone_plate_drift_y != 0.0
    }
}

/// Polling and settle times
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Interval between reads while waiting on a channel
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Timeout for waits that do not name their own
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
    /// Sleep after each undulator gap move
    #[serde(with = "humantime_serde")]
    pub energy_settle: Duration,
    /// Wait for a station shutter status
    #[serde(with = "humantime_serde")]
    pub shutter_timeout: Duration,
    /// Wait for the HDF5 writer to release its file
    #[serde(with = "humantime_serde")]
    pub hdf_release_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            default_timeout: Duration::from_secs(20),
            energy_settle: Duration::from_secs(1),
            shutter_timeout: Duration::from_secs(20),
            hdf_release_timeout: Duration::from_secs(30),
        }
    }
}

/// Dataset output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// HDF5 file receiving scan datasets
    pub hdf_file: Option<PathBuf>,
}

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl TxmConfig {
    /// Load configuration from `config/txm.toml` and environment variables.
    pub fn load() -> TxmResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error; defaults and environment apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> TxmResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("TXM_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> TxmResult<()> {
        let level = self.application.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(TxmError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        let optics = &self.optics;
        if !(optics.energy_min > 0.0 && optics.energy_min < optics.energy_max) {
            return Err(TxmError::Configuration(format!(
                "Invalid energy range {} - {} keV",
                optics.energy_min, optics.energy_max
            )));
        }
        if optics.zone_plate_diameter <= 0.0 || optics.outer_zone_width <= 0.0 {
            return Err(TxmError::Configuration(format!(
                "Zone plate geometry must be positive (diameter {}, outer zone width {})",
                optics.zone_plate_diameter, optics.outer_zone_width
            )));
        }

        if self.timing.poll_interval.is_zero() {
            return Err(TxmError::Configuration(
                "poll_interval must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Render as TOML, e.g. for `txm check-config`.
    pub fn to_toml_string(&self) -> TxmResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| TxmError::Configuration(format!("Could not serialize configuration: {e}")))
    }
}
