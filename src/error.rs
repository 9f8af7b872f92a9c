//! Error types for the instrument-control runtime.
//!
//! Using the `thiserror` crate, this module defines the two error enums that
//! flow through the crate:
//!
//! - **`ChannelError`**: a device channel could not be read or written. This is
//!   the only error the device protocol boundary produces.
//! - **`TxmError`**: the application-level error. It wraps `ChannelError` and
//!   adds configuration, storage and energy-range failures.
//!
//! ## Fatal vs. advisory
//!
//! Only `TxmError::Energy` (and programming errors) are meant to abort an
//! experiment. Permit refusals and wait timeouts degrade gracefully: the
//! `PermitDenied` and `WaitTimeout` variants exist so warnings carry a uniform,
//! greppable message, but the operations that emit those warnings never return
//! them. Storage failures at the end of a scan are logged and swallowed by
//! [`crate::storage::persist_dataset`].

use std::time::Duration;
use thiserror::Error;

use crate::device::PvValue;

/// Convenience alias for results using the application error type.
pub type TxmResult<T> = std::result::Result<T, TxmError>;

/// Failure talking to a single process variable.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    /// The client reported an error for this PV.
    #[error("Communication with '{channel}' failed: {reason}")]
    Communication {
        /// Resolved PV name
        channel: String,
        /// Client's description
        reason: String,
    },

    /// No connection to the PV.
    #[error("Channel '{channel}' is not connected")]
    Disconnected {
        /// Resolved PV name
        channel: String,
    },

    /// A numeric read got text or an array.
    #[error("Channel '{channel}' returned non-numeric value {value}")]
    NotNumeric {
        /// Resolved PV name
        channel: String,
        /// Value actually read
        value: PvValue,
    },
}

impl ChannelError {
    /// Name of the channel the error refers to.
    pub fn channel(&self) -> &str {
        match self {
            ChannelError::Communication { channel, .. }
            | ChannelError::Disconnected { channel }
            | ChannelError::NotNumeric { channel, .. } => channel,
        }
    }
}

/// Application-level error.
#[derive(Error, Debug)]
pub enum TxmError {
    /// Requested energy outside the configured limits; nothing was moved.
    #[error("Energy {requested} keV not in range {min} - {max} keV")]
    Energy {
        /// Requested energy, keV
        requested: f64,
        /// Lower limit, keV
        min: f64,
        /// Upper limit, keV
        max: f64,
    },

    /// Device channel failure.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// A dataset could not be written.
    #[error("Could not write dataset '{path}': {reason}")]
    Storage {
        /// Dataset path inside the file
        path: String,
        /// Underlying failure
        reason: String,
    },

    /// Configuration loaded but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Configuration could not be loaded or parsed.
    #[error("Configuration error: {0}")]
    Figment(#[from] Box<figment::Error>),

    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Scan session misuse, such as beginning twice.
    #[error("Scan session error: {0}")]
    Session(String),

    /// An operation needed the beamline permit.
    #[error("{operation} skipped: beamline permit not granted")]
    PermitDenied {
        /// What was skipped
        operation: String,
    },

    /// A channel never reached its target value.
    #[error("Timed out waiting for '{channel}' to reach {target} after {elapsed:?}")]
    WaitTimeout {
        /// Resolved PV name
        channel: String,
        /// Value waited for
        target: PvValue,
        /// Time spent waiting
        elapsed: Duration,
    },
}

impl From<figment::Error> for TxmError {
    fn from(err: figment::Error) -> Self {
        TxmError::Figment(Box::new(err))
    }
}
