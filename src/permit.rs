//! Permit-gated hardware access.
//!
//! Some writes affect infrastructure shared with the rest of the beamline:
//! the station shutters, the undulator gap and the monochromator. Those writes
//! may only reach the device when the instrument holds the beamline permit.
//!
//! Running without the permit is not an error. A gated operation is skipped,
//! one warning is logged, and a neutral result is returned, so an experiment
//! script can be exercised end-to-end without ever moving source or shutter
//! hardware.
//!
//! # Example
//!
//! ```rust,ignore
//! let gate = PermitGate::new(PermitState::denied());
//! let outcome = gate
//!     .guard("open shutter B", true, || async { shutter.set(1).await })
//!     .await;
//! assert!(outcome.is_skipped());
//! ```

use std::future::Future;
use tracing::warn;

use crate::error::TxmError;

/// Process-wide authorization flag, fixed when the instrument is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PermitState {
    granted: bool,
}

impl PermitState {
    /// Permit with the given grant.
    pub const fn new(granted: bool) -> Self {
        Self { granted }
    }

    /// Permit granted.
    pub const fn granted() -> Self {
        Self::new(true)
    }

    /// Permit not granted.
    pub const fn denied() -> Self {
        Self::new(false)
    }

    /// Whether gated writes may proceed.
    pub const fn is_granted(&self) -> bool {
        self.granted
    }
}

/// Result of a guarded operation.
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub enum Gated<T> {
    /// The operation ran and produced `T`.
    Ran(T),
    /// The operation required a permit that was not granted; it never ran.
    Skipped,
}

impl<T> Gated<T> {
    /// True when the operation was skipped for lack of permit.
    pub fn is_skipped(&self) -> bool {
        matches!(self, Gated::Skipped)
    }

    /// The operation's result, if it ran.
    pub fn ran(self) -> Option<T> {
        match self {
            Gated::Ran(value) => Some(value),
            Gated::Skipped => None,
        }
    }
}

/// Authorization check wrapped around hardware-affecting operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermitGate {
    state: PermitState,
}

impl PermitGate {
    /// Gate enforcing `state`.
    pub const fn new(state: PermitState) -> Self {
        Self { state }
    }

    /// The permit this gate enforces.
    pub const fn state(&self) -> PermitState {
        self.state
    }

    /// True when an operation with `requires_permit` may run.
    pub const fn allows(&self, requires_permit: bool) -> bool {
        !requires_permit || self.state.is_granted()
    }

    /// Run `op` only if it needs no permit or the permit is granted.
    ///
    /// Otherwise `op` is never invoked, exactly one warning naming `operation`
    /// is logged, and `Gated::Skipped` is returned.
    pub async fn guard<F, Fut, T>(&self, operation: &str, requires_permit: bool, op: F) -> Gated<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if self.allows(requires_permit) {
            Gated::Ran(op().await)
        } else {
            self.deny(operation);
            Gated::Skipped
        }
    }

    fn deny(&self, operation: &str) {
        let advisory = TxmError::PermitDenied {
            operation: operation.to_string(),
        };
        warn!(operation, "{advisory}");
    }
}
