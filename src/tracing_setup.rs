//! Tracing Infrastructure
//!
//! Structured logging for the instrument-control runtime, built on the
//! `tracing` and `tracing-subscriber` crates:
//! - Console output in pretty, compact or JSON format
//! - Environment-based filtering (`RUST_LOG` overrides the configured level)
//! - A session log file that a scan can attach for its duration
//!
//! The session log file is written by a second fmt layer that is always
//! installed but discards events until [`attach_log_file`] points it at a file.
//!
//! # Example
//! ```no_run
//! use txm_control::{config::TxmConfig, tracing_setup};
//! use tracing::{info, Level};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TxmConfig::load()?;
//! tracing_setup::init_from_config(&config)?;
//!
//! let guard = tracing_setup::attach_log_file("/local/data/scan_0001.log", Level::DEBUG)?;
//! info!("Scan started");
//! guard.detach();
//! # Ok(())
//! # }
//! ```

use once_cell::sync::Lazy;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn, Level, Metadata};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::TxmConfig;
use crate::error::{TxmError, TxmResult};

/// Output format for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty-printed format with colors (for development)
    Pretty,
    /// Compact format without colors (for production)
    Compact,
    /// JSON format for structured logging (for log aggregation)
    Json,
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Whether to include span events (NEW, CLOSE)
    pub with_span_events: bool,
    /// Whether to include file and line numbers
    pub with_file_and_line: bool,
    /// Whether to enable ANSI colors (only for Pretty format)
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_span_events: false,
            with_file_and_line: false,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Create tracing config from the application configuration
    pub fn from_config(config: &TxmConfig) -> TxmResult<Self> {
        let level = parse_log_level(&config.application.log_level)?;
        Ok(Self {
            level,
            ..Default::default()
        })
    }

    /// Create tracing config with custom settings
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span events
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Enable or disable ANSI colors
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialize tracing from the application configuration
pub fn init_from_config(config: &TxmConfig) -> TxmResult<()> {
    init(TracingConfig::from_config(config)?)
}

/// Initialize tracing with custom configuration
///
/// This function is idempotent - if a global subscriber is already set, it
/// returns Ok(()) without error, so it is safe to call from tests.
pub fn init(config: TracingConfig) -> TxmResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(config.level)));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let console: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_ansi(config.with_ansi)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(session_log_layer())
        .try_init()
        .or_else(|e| {
            // Already initialized: expected in tests and when several
            // components try to init tracing
            if e
                .to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(TxmError::Configuration(format!(
                    "Failed to initialize tracing: {e}"
                )))
            }
        })
}

/// The fmt layer that writes to the attached session log file.
///
/// [`init`] installs it; custom subscribers may add it themselves.
pub fn session_log_layer<S>() -> impl Layer<S> + Send + Sync
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    LAYER_INSTALLED.store(true, Ordering::SeqCst);
    fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_writer(SessionLogWriter)
}

static LAYER_INSTALLED: AtomicBool = AtomicBool::new(false);
static NEXT_ATTACHMENT: AtomicU64 = AtomicU64::new(1);
static SESSION_LOG: Lazy<Mutex<Option<SessionTarget>>> = Lazy::new(|| Mutex::new(None));

struct SessionTarget {
    id: u64,
    level: Level,
    path: PathBuf,
    file: File,
}

fn session_log() -> MutexGuard<'static, Option<SessionTarget>> {
    SESSION_LOG
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Removes the session log file when detached or dropped.
#[derive(Debug)]
#[must_use = "the log file is detached when the guard is dropped"]
pub struct LogFileGuard {
    id: Option<u64>,
    path: PathBuf,
}

impl LogFileGuard {
    /// Path the guard writes to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when events are actually reaching the file.
    pub fn is_active(&self) -> bool {
        self.id.is_some()
    }

    /// Stop writing to the file.
    pub fn detach(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let mut slot = session_log();
        if slot.as_ref().map(|t| t.id) == Some(id) {
            if let Some(mut target) = slot.take() {
                let _ = target.file.flush();
            }
            drop(slot);
            debug!(path = %self.path.display(), "Detached session log file");
        }
    }
}

impl Drop for LogFileGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Write events at `level` and above to `path` (appending) until the guard
/// is detached.
///
/// Attaching replaces any file attached earlier. Without an installed
/// session log layer this logs a warning and returns an inactive guard.
pub fn attach_log_file(path: impl AsRef<Path>, level: Level) -> TxmResult<LogFileGuard> {
    let path = path.as_ref().to_path_buf();
    if !LAYER_INSTALLED.load(Ordering::SeqCst) {
        warn!(path = %path.display(), "Tracing not initialized; session log file not attached");
        return Ok(LogFileGuard { id: None, path });
    }

    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    let id = NEXT_ATTACHMENT.fetch_add(1, Ordering::SeqCst);
    let previous = session_log().replace(SessionTarget {
        id,
        level,
        path: path.clone(),
        file,
    });
    if let Some(previous) = previous {
        warn!(
            previous = %previous.path.display(),
            "Replaced an attached session log file"
        );
    }
    debug!(path = %path.display(), %level, "Attached session log file");
    Ok(LogFileGuard { id: Some(id), path })
}

#[derive(Debug, Clone, Copy)]
struct SessionLogWriter;

/// Per-event writer; `enabled` is decided from the event level up front.
struct SessionLogLine {
    enabled: bool,
}

impl<'a> MakeWriter<'a> for SessionLogWriter {
    type Writer = SessionLogLine;

    fn make_writer(&'a self) -> Self::Writer {
        SessionLogLine { enabled: false }
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        let enabled = session_log()
            .as_ref()
            .is_some_and(|target| *meta.level() <= target.level);
        SessionLogLine { enabled }
    }
}

impl Write for SessionLogLine {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.enabled {
            if let Some(target) = session_log().as_mut() {
                target.file.write_all(buf)?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(target) = session_log().as_mut() {
            target.file.flush()?;
        }
        Ok(())
    }
}

/// Parse log level string into tracing Level
pub fn parse_log_level(level: &str) -> TxmResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(TxmError::Configuration(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))),
    }
}

/// Convert Level to env filter string
fn level_to_filter_string(level: Level) -> String {
    match level {
        Level::TRACE => "trace".to_string(),
        Level::DEBUG => "debug".to_string(),
        Level::INFO => "info".to_string(),
        Level::WARN => "warn".to_string(),
        Level::ERROR => "error".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tracing::{debug, info, warn};

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("warn"), Ok(Level::WARN)));
        // Case insensitive
        assert!(matches!(parse_log_level("Debug"), Ok(Level::DEBUG)));
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn test_tracing_config_from_config() {
        let mut config = TxmConfig::default();
        config.application.log_level = "debug".into();
        let tracing_config = TracingConfig::from_config(&config).unwrap();
        assert_eq!(tracing_config.level, Level::DEBUG);
    }

    #[test]
    fn test_tracing_config_builder() {
        let config = TracingConfig::new(Level::WARN)
            .with_format(OutputFormat::Json)
            .with_span_events(false)
            .with_ansi(false);
        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.format, OutputFormat::Json);
        assert!(!config.with_ansi);
    }

    #[test]
    #[serial]
    fn session_log_file_receives_events_while_attached() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.log");
        let subscriber = tracing_subscriber::registry().with(session_log_layer());

        tracing::subscriber::with_default(subscriber, || {
            info!("before attach");
            let guard = attach_log_file(&path, Level::INFO).unwrap();
            assert!(guard.is_active());
            debug!("below the file level");
            warn!("energy restore failed");
            guard.detach();
            info!("after detach");
        });

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("energy restore failed"));
        assert!(!contents.contains("below the file level"));
        assert!(!contents.contains("before attach"));
        assert!(!contents.contains("after detach"));
    }

    #[test]
    #[serial]
    fn dropping_the_guard_detaches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dropped.log");
        let subscriber = tracing_subscriber::registry().with(session_log_layer());

        tracing::subscriber::with_default(subscriber, || {
            {
                let _guard = attach_log_file(&path, Level::TRACE).unwrap();
                info!("inside");
            }
            info!("outside");
        });

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("inside"));
        assert!(!contents.contains("outside"));
    }
}
