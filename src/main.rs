//! CLI Entry Point for txm
//!
//! Dry-run front end for the instrument-control runtime. The commands run
//! against the mock device client seeded with nominal beamline values, so
//! they exercise configuration, permit handling and the optics calculation
//! without touching hardware.
//!
//! # Usage
//!
//! ```bash
//! txm check-config --config config/txm.toml
//! txm position
//! txm move-energy 8.6 --variable-mag
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use txm_control::config::{TxmConfig, DEFAULT_CONFIG_PATH};
use txm_control::device::mock::MockDeviceClient;
use txm_control::energy::{EnergyMove, MoveEnergyOptions};
use txm_control::names::DeviceNameTable;
use txm_control::{storage, tracing_setup, Txm};

#[derive(Parser)]
#[command(name = "txm")]
#[command(about = "Transmission X-ray microscope control (dry run)", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load, validate and print the configuration
    CheckConfig,

    /// Print the sample stage position
    Position,

    /// Move to a new beam energy
    MoveEnergy {
        /// Target energy in keV
        energy: f64,

        /// Keep the detector in place and let the magnification change
        #[arg(long)]
        variable_mag: bool,

        /// Move the undulator gap straight to its final value
        #[arg(long)]
        no_backlash: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = TxmConfig::load_from(&cli.config)?;
    config.validate()?;
    tracing_setup::init_from_config(&config)?;

    match cli.command {
        Commands::CheckConfig => {
            println!("{}", config.to_toml_string()?);
            match storage::configured_sink(&config.storage) {
                Some(_) => println!("Dataset sink: HDF5"),
                None => println!("Dataset sink: none"),
            }
            Ok(())
        }
        Commands::Position => {
            let txm = dry_run(config);
            let position = txm.sample_position().await?;
            println!("Sample at {position}, energy {:.4} keV", txm.energy().await?);
            Ok(())
        }
        Commands::MoveEnergy {
            energy,
            variable_mag,
            no_backlash,
        } => {
            let txm = dry_run(config);
            let options = MoveEnergyOptions {
                constant_magnification: !variable_mag,
                correct_backlash: !no_backlash,
            };
            match txm.move_energy(energy, options).await? {
                EnergyMove::Moved(plan) => {
                    println!("Energy {:.4} keV", plan.energy);
                    println!("  zone plate z  {:.4} mm", plan.zone_plate_z);
                    if let Some(ccd) = plan.ccd_position {
                        println!("  detector      {ccd:.4} mm");
                    }
                    println!("  magnification {:.3}", plan.magnification);
                }
                other => println!("Energy not changed: {other:?}"),
            }
            Ok(())
        }
    }
}

fn dry_run(config: TxmConfig) -> Txm {
    let names = DeviceNameTable::for_variant(config.instrument.variant);
    let client = MockDeviceClient::beamline(&names, &config.instrument.ioc_prefix);
    info!("Using simulated beamline");
    Txm::new(Arc::new(client), config)
}
