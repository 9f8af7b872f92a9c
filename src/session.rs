//! Scan session lifecycle.
//!
//! A [`ScanSession`] brackets one experiment: it snapshots the instrument on
//! entry and, however the experiment ends, puts the instrument back in a safe
//! state before handing the outcome to the caller.
//!
//! # States
//!
//! ```text
//! NotStarted ──begin()──► Running ──finish(Ok)──► Completing ──► Closed
//!                            └─────finish(Err)──► Aborting   ──► Closed
//! ```
//!
//! # Teardown
//!
//! Every step runs even when an earlier one fails; failures are logged and
//! never replace the experiment's own result.
//!
//! 1. Stop rotation and fly motion
//! 2. Close the station shutters (permit-gated)
//! 3. Stop file capture and wait for the HDF5 writer
//! 4. Restore the sample position, waiting for every axis, then the energy
//!    if it changed
//! 5. Reset the detector to free-running internal triggering
//! 6. Restore the fast shutter mode and exposure time, detach the session log
//!
//! Datasets recorded through [`ScanContext::record_dataset`] are written to
//! the session's [`DatasetSink`] only when the experiment succeeded.
//!
//! # Example
//!
//! ```rust,ignore
//! let angles = session::run(txm.clone(), ScanOptions::default(), |scan| async move {
//!     scan.txm().move_sample(SampleTarget::theta(90.0)).await?;
//!     scan.txm().frames().capture_projections(1).await?;
//!     let theta = scan.txm().theta_array().await?;
//!     scan.record_dataset(THETA_DATASET, theta.clone());
//!     Ok(theta)
//! })
//! .await?;
//! ```

use chrono::Local;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, error, info, warn, Level};
use uuid::Uuid;

use crate::energy::MoveEnergyOptions;
use crate::error::{TxmError, TxmResult};
use crate::instrument::{SamplePosition, Txm, FAST_SHUTTER_DEFAULT_DELAY};
use crate::storage::{persist_dataset, DatasetSink};
use crate::tracing_setup::{attach_log_file, LogFileGuard};

/// Where a [`ScanSession`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, [`ScanSession::begin`] not yet called
    NotStarted,
    /// Experiment body running
    Running,
    /// Tearing down after the experiment succeeded
    Completing,
    /// Tearing down after the experiment failed
    Aborting,
    /// Teardown done
    Closed,
}

/// Instrument state captured when the session begins.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanSnapshot {
    /// Stage position to return to
    pub sample_position: SamplePosition,
    /// Beam energy, keV
    pub energy: f64,
    /// Exposure, seconds
    pub exposure: f64,
    /// Fast shutter mode
    pub fast_shutter_enabled: bool,
}

impl ScanSnapshot {
    /// Read the instrument state.
    pub async fn capture(txm: &Txm) -> TxmResult<Self> {
        Ok(Self {
            sample_position: txm.sample_position().await?,
            energy: txm.energy().await?,
            exposure: txm.exposure_time().await?,
            fast_shutter_enabled: txm.fast_shutter_enabled(),
        })
    }
}

/// Per-session settings.
#[derive(Clone, Default)]
pub struct ScanOptions {
    /// Write a session log file at this level
    pub log_level: Option<Level>,
    /// Session log file; defaults to the HDF5 file name with a `.log` extension
    pub log_file: Option<PathBuf>,
    /// Receives recorded datasets on success
    pub sink: Option<Arc<dyn DatasetSink>>,
}

impl std::fmt::Debug for ScanOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanOptions")
            .field("log_level", &self.log_level)
            .field("log_file", &self.log_file)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl ScanOptions {
    /// Attach a session log at `level`.
    pub fn with_log(mut self, level: Level, file: Option<PathBuf>) -> Self {
        self.log_level = Some(level);
        self.log_file = file;
        self
    }

    /// Write recorded datasets to `sink` on success.
    pub fn with_sink(mut self, sink: Arc<dyn DatasetSink>) -> Self {
        self.sink = Some(sink);
        self
    }
}

type RecordedDatasets = Arc<Mutex<Vec<(String, Vec<f64>)>>>;

/// What the experiment body gets to work with.
#[derive(Clone)]
pub struct ScanContext {
    id: Uuid,
    txm: Arc<Txm>,
    datasets: RecordedDatasets,
}

impl ScanContext {
    /// Session identifier, as logged.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The instrument under the session.
    pub fn txm(&self) -> &Txm {
        &self.txm
    }

    /// Queue a dataset to be written when the scan succeeds.
    pub fn record_dataset(&self, path: impl Into<String>, data: Vec<f64>) {
        let path = path.into();
        debug!(dataset = %path, len = data.len(), "Recorded dataset");
        lock(&self.datasets).push((path, data));
    }
}

fn lock(datasets: &RecordedDatasets) -> MutexGuard<'_, Vec<(String, Vec<f64>)>> {
    datasets
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// One experiment on one instrument.
pub struct ScanSession {
    id: Uuid,
    txm: Arc<Txm>,
    options: ScanOptions,
    state: SessionState,
    snapshot: Option<ScanSnapshot>,
    log_guard: Option<LogFileGuard>,
    datasets: RecordedDatasets,
    started: Instant,
}

impl ScanSession {
    /// New session; nothing is read until [`ScanSession::begin`].
    pub fn new(txm: Arc<Txm>, options: ScanOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            txm,
            options,
            state: SessionState::NotStarted,
            snapshot: None,
            log_guard: None,
            datasets: Arc::default(),
            started: Instant::now(),
        }
    }

    /// Session identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// State captured by `begin`, until teardown consumes it.
    pub fn snapshot(&self) -> Option<&ScanSnapshot> {
        self.snapshot.as_ref()
    }

    /// Attach the session log, snapshot the instrument and start running.
    pub async fn begin(&mut self) -> TxmResult<ScanContext> {
        if self.state != SessionState::NotStarted {
            return Err(TxmError::Session(format!(
                "session {} already begun (state {:?})",
                self.id, self.state
            )));
        }

        if let Some(level) = self.options.log_level {
            self.attach_log(level).await;
        }
        self.started = Instant::now();
        info!(
            session_id = %self.id,
            started_at = %Local::now().to_rfc3339(),
            "Scan started"
        );

        let snapshot = ScanSnapshot::capture(&self.txm).await?;
        debug!(
            position = %snapshot.sample_position,
            energy = snapshot.energy,
            exposure = snapshot.exposure,
            fast_shutter = snapshot.fast_shutter_enabled,
            "Captured instrument state"
        );
        self.snapshot = Some(snapshot);
        self.state = SessionState::Running;

        Ok(ScanContext {
            id: self.id,
            txm: Arc::clone(&self.txm),
            datasets: Arc::clone(&self.datasets),
        })
    }

    async fn attach_log(&mut self, level: Level) {
        let path = match &self.options.log_file {
            Some(path) => path.clone(),
            None => match self.txm.hdf_filename().await {
                Ok(file) => PathBuf::from(file).with_extension("log"),
                Err(err) => {
                    warn!(error = %err, "No HDF file name; session log not attached");
                    return;
                }
            },
        };
        match attach_log_file(&path, level) {
            Ok(guard) => self.log_guard = Some(guard),
            Err(err) => warn!(path = %path.display(), error = %err, "Could not open session log file"),
        }
    }

    /// Restore the instrument and return the experiment's `outcome` unchanged.
    pub async fn finish<T>(mut self, outcome: anyhow::Result<T>) -> anyhow::Result<T> {
        let Some(snapshot) = self.snapshot.take() else {
            // Never started: nothing to restore.
            self.state = SessionState::Closed;
            return outcome;
        };

        match &outcome {
            Ok(_) => {
                self.state = SessionState::Completing;
                info!(session_id = %self.id, "Scan finished");
            }
            Err(err) => {
                self.state = SessionState::Aborting;
                error!(session_id = %self.id, "Scan finished with error: {err:#}");
            }
        }

        self.teardown(&snapshot).await;

        if outcome.is_ok() {
            self.persist_datasets().await;
        }

        info!(
            session_id = %self.id,
            duration_ms = self.started.elapsed().as_millis() as u64,
            "Scan session closed"
        );
        if let Some(guard) = self.log_guard.take() {
            guard.detach();
        }
        self.state = SessionState::Closed;
        outcome
    }

    async fn teardown(&self, snapshot: &ScanSnapshot) {
        let txm = &*self.txm;
        debug!("Restoring previous state");

        step("stop motion", txm.stop_motion()).await;
        step("close shutters", txm.close_shutters()).await;
        step("stop capture", txm.stop_capture()).await;
        step("restore sample position", restore_position(txm, snapshot.sample_position)).await;
        step("restore energy", restore_energy(txm, snapshot.energy)).await;
        step("reset detector", txm.reset_ccd()).await;
        let fast_shutter = async {
            if snapshot.fast_shutter_enabled {
                txm.enable_fast_shutter(false, FAST_SHUTTER_DEFAULT_DELAY).await
            } else {
                txm.disable_fast_shutter().await
            }
        };
        step("restore fast shutter", fast_shutter).await;
        step("restore exposure", txm.set_exposure_time(snapshot.exposure)).await;

        debug!("Finished shutting down");
    }

    async fn persist_datasets(&self) {
        let datasets = std::mem::take(&mut *lock(&self.datasets));
        if datasets.is_empty() {
            return;
        }
        let Some(sink) = &self.options.sink else {
            warn!(count = datasets.len(), "No dataset sink configured; recorded datasets discarded");
            return;
        };
        // The writer must have released the file before datasets are added.
        match self.txm.wait_for_hdf_file(self.txm.config().timing.hdf_release_timeout).await {
            Ok(file) => debug!(file = %file, "HDF5 file released"),
            Err(err) => warn!(error = %err, "Could not read the HDF5 file name"),
        }
        for (path, data) in &datasets {
            persist_dataset(sink.as_ref(), path, data);
        }
    }
}

impl Drop for ScanSession {
    fn drop(&mut self) {
        if self.state == SessionState::Running {
            warn!(
                session_id = %self.id,
                "Scan session dropped while running; instrument state was not restored"
            );
        }
    }
}

async fn step(name: &str, operation: impl Future<Output = TxmResult<()>>) -> bool {
    match operation.await {
        Ok(()) => true,
        Err(err) => {
            warn!(step = name, error = %err, "Teardown step failed; continuing");
            false
        }
    }
}

/// Move all four axes together and wait for every one to report done.
async fn restore_position(txm: &Txm, position: SamplePosition) -> TxmResult<()> {
    let scope = txm.registry().write_scope(true);
    let moved = txm.move_sample(position).await;
    let report = scope.close().await;
    debug!(
        completed = report.completed,
        abandoned = report.abandoned.len(),
        "Sample position restored"
    );
    moved
}

async fn restore_energy(txm: &Txm, energy: f64) -> TxmResult<()> {
    if txm.energy().await? == energy {
        return Ok(());
    }
    debug!(energy, "Restoring energy");
    if let Err(err) = txm.move_energy(energy, MoveEnergyOptions::default()).await {
        error!(energy, error = %err, "Could not restore energy");
    }
    Ok(())
}

/// Run `body` inside a scan session.
///
/// Teardown runs whether the body returns `Ok`, returns `Err` or panics.
/// The body's error is returned unchanged; a panic resumes after teardown.
pub async fn run<F, Fut, T>(txm: Arc<Txm>, options: ScanOptions, body: F) -> anyhow::Result<T>
where
    F: FnOnce(ScanContext) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut session = ScanSession::new(txm, options);
    let context = session.begin().await?;

    match AssertUnwindSafe(async move { body(context).await })
        .catch_unwind()
        .await
    {
        Ok(outcome) => session.finish(outcome).await,
        Err(panic) => {
            let _ = session
                .finish::<()>(Err(anyhow::anyhow!("scan body panicked")))
                .await;
            std::panic::resume_unwind(panic)
        }
    }
}
