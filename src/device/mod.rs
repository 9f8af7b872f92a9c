//! Device protocol boundary.
//!
//! The runtime never speaks the control-system wire protocol itself. It only
//! needs three primitives from an existing client library:
//!
//! - `get(name)`: read the current value of a process variable
//! - `put(name, value, wait)`: write, optionally blocking until the IOC acknowledges
//! - `put_with_callback(name, value, on_complete)`: write without blocking; the
//!   client invokes `on_complete` from its own background thread once the IOC
//!   reports completion
//!
//! Anything that implements [`DeviceClient`] can drive the instrument. The
//! [`mock`] module provides an in-memory client for tests and dry runs.

pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ChannelError;

/// Callback fired by the device client when an asynchronous put completes.
///
/// Dropping the callback without calling it means the completion will never be
/// reported; the write queue treats that promise as abandoned.
pub type CompletionCallback = Box<dyn FnOnce() + Send + 'static>;

/// A raw process-variable value as delivered by the device client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PvValue {
    /// Integer / enum / binary records
    Int(i64),
    /// Analog records
    Float(f64),
    /// String and char-array records
    Str(String),
    /// Waveform records
    FloatArray(Vec<f64>),
}

impl PvValue {
    /// Numeric view of the value, if it has one.
    ///
    /// Strings are parsed, so a char-array PV holding `"8.5"` still reads as a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PvValue::Int(v) => Some(*v as f64),
            PvValue::Float(v) => Some(*v),
            PvValue::Str(s) => s.trim().parse().ok(),
            PvValue::FloatArray(_) => None,
        }
    }

    /// Integer view of the value. Floats are accepted only when integral.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PvValue::Int(v) => Some(*v),
            PvValue::Float(v) if v.fract() == 0.0 && v.is_finite() => Some(*v as i64),
            PvValue::Float(_) => None,
            PvValue::Str(s) => s.trim().parse().ok(),
            PvValue::FloatArray(_) => None,
        }
    }

    /// String view of the value, if it is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PvValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

// Int and Float compare numerically so that polling an enum PV against `1`
// matches a readback of `1.0`.
impl PartialEq for PvValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PvValue::Int(a), PvValue::Int(b)) => a == b,
            (PvValue::Float(a), PvValue::Float(b)) => a == b,
            (PvValue::Int(a), PvValue::Float(b)) | (PvValue::Float(b), PvValue::Int(a)) => {
                (*a as f64) == *b
            }
            (PvValue::Str(a), PvValue::Str(b)) => a == b,
            (PvValue::FloatArray(a), PvValue::FloatArray(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for PvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PvValue::Int(v) => write!(f, "{v}"),
            PvValue::Float(v) => write!(f, "{v}"),
            PvValue::Str(s) => write!(f, "'{s}'"),
            PvValue::FloatArray(v) => write!(f, "[{} values]", v.len()),
        }
    }
}

impl From<i64> for PvValue {
    fn from(v: i64) -> Self {
        PvValue::Int(v)
    }
}

impl From<i32> for PvValue {
    fn from(v: i32) -> Self {
        PvValue::Int(i64::from(v))
    }
}

impl From<u32> for PvValue {
    fn from(v: u32) -> Self {
        PvValue::Int(i64::from(v))
    }
}

impl From<bool> for PvValue {
    fn from(v: bool) -> Self {
        PvValue::Int(i64::from(v))
    }
}

impl From<f64> for PvValue {
    fn from(v: f64) -> Self {
        PvValue::Float(v)
    }
}

impl From<&str> for PvValue {
    fn from(v: &str) -> Self {
        PvValue::Str(v.to_string())
    }
}

impl From<String> for PvValue {
    fn from(v: String) -> Self {
        PvValue::Str(v)
    }
}

impl From<Vec<f64>> for PvValue {
    fn from(v: Vec<f64>) -> Self {
        PvValue::FloatArray(v)
    }
}

/// Declared type of a channel; reads are coerced to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    /// Coerce to `PvValue::Int`
    Int,
    /// Coerce to `PvValue::Float`
    Float,
    /// Coerce to `PvValue::Str`
    Str,
}

impl ValueType {
    /// Convert `raw` to this type.
    ///
    /// Returns `None` when the conversion is impossible; callers keep the raw
    /// value in that case.
    pub fn coerce(self, raw: &PvValue) -> Option<PvValue> {
        match self {
            ValueType::Int => raw.as_i64().map(PvValue::Int),
            ValueType::Float => raw.as_f64().map(PvValue::Float),
            ValueType::Str => match raw {
                PvValue::Str(s) => Some(PvValue::Str(s.clone())),
                PvValue::Int(v) => Some(PvValue::Str(v.to_string())),
                PvValue::Float(v) => Some(PvValue::Str(v.to_string())),
                PvValue::FloatArray(_) => None,
            },
        }
    }
}

/// The network client that gets and puts named values.
///
/// # Contract
/// - `get` returns the value currently held by the IOC
/// - `put` with `wait = true` returns once the IOC acknowledges the write;
///   `Ok(false)` means the write was sent but not acknowledged
/// - `put_with_callback` returns as soon as the write is sent and invokes the
///   callback (possibly from another thread) once it completes
///
/// # Thread Safety
/// Implementations must be `Send + Sync`; the completion callback may be
/// invoked from any thread.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Read the current value of `name`.
    async fn get(&self, name: &str) -> Result<PvValue, ChannelError>;

    /// Write `value` to `name`, blocking for acknowledgement when `wait` is true.
    async fn put(&self, name: &str, value: PvValue, wait: bool) -> Result<bool, ChannelError>;

    /// Write `value` to `name` and report completion through `on_complete`.
    async fn put_with_callback(
        &self,
        name: &str,
        value: PvValue,
        on_complete: CompletionCallback,
    ) -> Result<(), ChannelError>;
}
