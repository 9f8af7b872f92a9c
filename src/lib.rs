//! # TXM Control Library
//!
//! Instrument-control runtime for the 32-ID-C transmission X-ray microscopes.
//! It positions the sample stage, moves the source energy together with the
//! zone-plate optics, operates the shutters and triggers the detector, and
//! guarantees that an experiment leaves the instrument in a safe state however
//! it ends.
//!
//! ## Crate Structure
//!
//! - **`device`**: The device protocol boundary (`DeviceClient`), raw values,
//!   and an in-memory mock client.
//! - **`channel`**: Named, typed handles to process variables and the
//!   registry that shares them.
//! - **`permit`**: Gating of writes that touch shared beamline hardware.
//! - **`queue`**: Scoped tracking of asynchronous write completions.
//! - **`wait`**: Poll-until-value with an advisory timeout.
//! - **`names`**: Process-variable name tables per instrument variant.
//! - **`instrument`**: The `Txm` facade.
//! - **`energy`**: Zone-plate optics calculation and the energy move sequence.
//! - **`frames`**: Dark / white / data frame acquisition.
//! - **`session`**: Scan lifecycle with guaranteed restoration.
//! - **`storage`**: Dataset sinks for scan metadata.
//! - **`config`**: Figment-based configuration.
//! - **`tracing_setup`**: Logging initialization and session log files.
//! - **`error`**: `ChannelError` and `TxmError`.

pub mod channel;
pub mod config;
pub mod device;
pub mod energy;
pub mod error;
pub mod frames;
pub mod instrument;
pub mod names;
pub mod permit;
pub mod queue;
pub mod session;
pub mod storage;
pub mod tracing_setup;
pub mod wait;

pub use channel::{Channel, ChannelSpec, Registry, SetOutcome};
pub use config::TxmConfig;
pub use device::{DeviceClient, PvValue, ValueType};
pub use energy::{EnergyMove, EnergyPositioner, MoveEnergyOptions};
pub use error::{ChannelError, TxmError, TxmResult};
pub use frames::{FrameSequencer, FrameType};
pub use instrument::{SamplePosition, SampleTarget, Txm};
pub use names::{DeviceNameTable, InstrumentVariant};
pub use permit::{Gated, PermitGate, PermitState};
pub use session::{ScanContext, ScanOptions, ScanSession};
pub use wait::Timeout;
