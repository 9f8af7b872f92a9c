//! The transmission X-ray microscope as one object.
//!
//! [`Txm`] owns the channel registry and the name table for the configured
//! instrument variant, and exposes the operations experiment code builds on:
//! sample motion, energy, station shutters, the fast shutter, exposure, and
//! detector / file-writer setup and teardown.
//!
//! # Example
//!
//! ```rust,ignore
//! let txm = Txm::new(Arc::new(client), TxmConfig::load()?);
//! txm.setup_detector(0.5, true).await?;
//! txm.open_shutters().await?;
//! txm.frames().capture_projections(10).await?;
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelSpec, Registry};
use crate::config::TxmConfig;
use crate::device::{DeviceClient, PvValue};
use crate::energy::{EnergyMove, EnergyPositioner, MoveEnergyOptions};
use crate::error::{ChannelError, TxmResult};
use crate::frames::{AcquisitionReport, FrameSequencer};
use crate::names::{self, DeviceNameTable};
use crate::permit::{Gated, PermitState};
use crate::wait::Timeout;

/// Fast-shutter camera delay used when none is given, in seconds.
pub const FAST_SHUTTER_DEFAULT_DELAY: f64 = 0.02;

/// Exposure used for the dummy frame that primes the file plugins.
const PRIMING_EXPOSURE: f64 = 0.01;

/// How long `reset_ccd` waits for the detector to resume acquiring.
const RESET_TIMEOUT: Duration = Duration::from_secs(2);

/// Sample stage coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplePosition {
    /// Horizontal, across the beam
    pub x: f64,
    /// Vertical
    pub y: f64,
    /// Along the beam
    pub z: f64,
    /// Rotation angle, degrees
    pub theta: f64,
}

impl fmt::Display for SamplePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(x={:.2}, y={:.2}, z={:.2}, θ={:.2}°)",
            self.x, self.y, self.z, self.theta
        )
    }
}

/// Target for [`Txm::move_sample`]; `None` axes stay where they are.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SampleTarget {
    /// See [`SamplePosition::x`]
    pub x: Option<f64>,
    /// See [`SamplePosition::y`]
    pub y: Option<f64>,
    /// See [`SamplePosition::z`]
    pub z: Option<f64>,
    /// Rotation angle, degrees
    pub theta: Option<f64>,
}

impl SampleTarget {
    /// Rotate only.
    pub fn theta(theta: f64) -> Self {
        Self {
            theta: Some(theta),
            ..Self::default()
        }
    }
}

impl From<SamplePosition> for SampleTarget {
    fn from(p: SamplePosition) -> Self {
        Self {
            x: Some(p.x),
            y: Some(p.y),
            z: Some(p.z),
            theta: Some(p.theta),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutterAction {
    Open,
    Close,
}

impl ShutterAction {
    fn status(self) -> i64 {
        match self {
            ShutterAction::Open => names::SHUTTER_OPEN,
            ShutterAction::Close => names::SHUTTER_CLOSED,
        }
    }
}

/// Instrument facade.
///
/// # Thread Safety
/// Shared as `Arc<Txm>`. The shutter and fast-shutter flags are atomics; all
/// other state lives in the devices.
pub struct Txm {
    registry: Registry,
    names: DeviceNameTable,
    config: TxmConfig,
    shutters_open: AtomicBool,
    fast_shutter_enabled: AtomicBool,
}

impl fmt::Debug for Txm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Txm")
            .field("variant", &self.config.instrument.variant)
            .field("registry", &self.registry)
            .field("shutters_open", &self.shutters_are_open())
            .field("fast_shutter_enabled", &self.fast_shutter_enabled())
            .finish()
    }
}

impl Txm {
    /// Build the instrument for `config` on top of `client`.
    ///
    /// The permit, name table, IOC prefix and poll interval are fixed here.
    pub fn new(client: Arc<dyn DeviceClient>, config: TxmConfig) -> Self {
        let names = DeviceNameTable::for_variant(config.instrument.variant);
        let registry = Registry::new(
            client,
            PermitState::new(config.instrument.has_permit),
            config.instrument.ioc_prefix.clone(),
        )
        .with_poll_interval(config.timing.poll_interval);
        info!(
            variant = %config.instrument.variant,
            has_permit = config.instrument.has_permit,
            "TXM initialized"
        );
        Self {
            registry,
            names,
            config,
            shutters_open: AtomicBool::new(false),
            fast_shutter_enabled: AtomicBool::new(false),
        }
    }

    /// Channel registry shared by every operation.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Process-variable names for the configured variant.
    pub fn names(&self) -> &DeviceNameTable {
        &self.names
    }

    /// Configuration the instrument was built with.
    pub fn config(&self) -> &TxmConfig {
        &self.config
    }

    /// Shared handle for `spec`.
    pub fn channel(&self, spec: &ChannelSpec) -> Arc<Channel> {
        self.registry.channel(spec)
    }

    /// Poll `spec` until it reads `target`; `false` means the state is unknown.
    pub async fn wait_until(
        &self,
        spec: &ChannelSpec,
        target: impl Into<PvValue>,
        timeout: impl Into<Timeout>,
    ) -> bool {
        self.registry.wait_until(spec, target, timeout.into()).await
    }

    fn default_timeout(&self) -> Timeout {
        Timeout::After(self.config.timing.default_timeout)
    }

    // ---- Sample stage -------------------------------------------------

    /// Read all four stage axes.
    pub async fn sample_position(&self) -> TxmResult<SamplePosition> {
        Ok(SamplePosition {
            x: self.channel(&self.names.sample_x).get_f64().await?,
            y: self.channel(&self.names.sample_y).get_f64().await?,
            z: self.channel(&self.names.sample_z).get_f64().await?,
            theta: self.channel(&self.names.sample_rotation).get_f64().await?,
        })
    }

    /// Move the sample; rotation first, then x, y, z.
    pub async fn move_sample(&self, target: impl Into<SampleTarget>) -> TxmResult<()> {
        let target = target.into();
        debug!(?target, "Moving sample");
        for (spec, value) in [
            (&self.names.sample_rotation, target.theta),
            (&self.names.sample_x, target.x),
            (&self.names.sample_y, target.y),
            (&self.names.sample_z, target.z),
        ] {
            if let Some(value) = value {
                self.channel(spec).set(value).await?;
            }
        }
        match self.sample_position().await {
            Ok(position) => debug!("Sample moved to {position}"),
            Err(err) => debug!(error = %err, "Sample moved; position readback failed"),
        }
        Ok(())
    }

    // ---- Energy -------------------------------------------------------

    /// Current beam energy (keV).
    pub async fn energy(&self) -> TxmResult<f64> {
        self.energy_positioner().energy().await
    }

    /// Energy mover bound to this instrument's optics and timing.
    pub fn energy_positioner(&self) -> EnergyPositioner<'_> {
        EnergyPositioner::new(
            &self.registry,
            &self.names,
            &self.config.optics,
            self.config.timing.energy_settle,
        )
    }

    /// See [`EnergyPositioner::move_energy`].
    pub async fn move_energy(&self, energy: f64, options: MoveEnergyOptions) -> TxmResult<EnergyMove> {
        self.energy_positioner().move_energy(energy, options).await
    }

    // ---- Station shutters ---------------------------------------------

    /// Whether the last shutter operation left the beam on the sample.
    pub fn shutters_are_open(&self) -> bool {
        self.shutters_open.load(Ordering::SeqCst)
    }

    /// Open the enabled station shutters and wait for their status.
    ///
    /// Skipped with a warning when the permit is not granted.
    pub async fn open_shutters(&self) -> TxmResult<()> {
        self.drive_shutters(ShutterAction::Open).await
    }

    /// Close the enabled station shutters and wait for their status.
    pub async fn close_shutters(&self) -> TxmResult<()> {
        self.drive_shutters(ShutterAction::Close).await
    }

    async fn drive_shutters(&self, action: ShutterAction) -> TxmResult<()> {
        let operation = match action {
            ShutterAction::Open => "Open shutters",
            ShutterAction::Close => "Close shutters",
        };
        match self
            .registry
            .gate()
            .guard(operation, true, || self.move_shutters(action))
            .await
        {
            Gated::Ran(result) => result,
            Gated::Skipped => Ok(()),
        }
    }

    async fn move_shutters(&self, action: ShutterAction) -> TxmResult<()> {
        let instrument = &self.config.instrument;
        let n = &self.names;
        let shutters = [
            ("A", instrument.use_shutter_a, &n.shutter_a_open, &n.shutter_a_close, &n.shutter_a_status),
            ("B", instrument.use_shutter_b, &n.shutter_b_open, &n.shutter_b_close, &n.shutter_b_status),
        ];

        let start = Instant::now();
        let mut moved = Vec::new();
        for (label, enabled, open, close, status) in shutters {
            if !enabled {
                continue;
            }
            let command = match action {
                ShutterAction::Open => open,
                ShutterAction::Close => close,
            };
            debug!(shutter = label, ?action, "Moving shutter");
            self.channel(command).set(1).await?;
            self.wait_until(status, action.status(), self.config.timing.shutter_timeout)
                .await;
            moved.push(label);
        }

        self.shutters_open
            .store(action == ShutterAction::Open && !moved.is_empty(), Ordering::SeqCst);

        if moved.is_empty() {
            warn!("Neither shutter A nor B enabled");
        } else {
            info!(
                shutters = %moved.join(", "),
                ?action,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Shutters moved"
            );
        }
        Ok(())
    }

    // ---- Fast shutter -------------------------------------------------

    /// Whether the FPGA owns the fast shutter.
    pub fn fast_shutter_enabled(&self) -> bool {
        self.fast_shutter_enabled.load(Ordering::SeqCst)
    }

    /// Hand the fast shutter to the FPGA, leaving it closed.
    ///
    /// With `rotation_trigger` the rotation encoder fires the shutter and
    /// camera (fly scans); otherwise software triggers do. `delay` is the
    /// camera delay in seconds.
    pub async fn enable_fast_shutter(&self, rotation_trigger: bool, delay: f64) -> TxmResult<()> {
        let n = &self.names;
        self.channel(&n.fast_shutter_control)
            .set(names::FAST_SHUTTER_CONTROL_MANUAL)
            .await?;
        self.channel(&n.fast_shutter_open)
            .set(names::FAST_SHUTTER_CLOSED)
            .await?;
        let trigger_mode = if rotation_trigger {
            names::FAST_SHUTTER_TRIGGER_ROTATION
        } else {
            names::FAST_SHUTTER_TRIGGER_MANUAL
        };
        self.channel(&n.fast_shutter_trigger_mode).set(trigger_mode).await?;
        self.channel(&n.fast_shutter_control)
            .set(names::FAST_SHUTTER_CONTROL_AUTO)
            .await?;
        self.channel(&n.fast_shutter_relay)
            .set(names::FAST_SHUTTER_RELAY_SYNCED)
            .await?;
        self.channel(&n.fast_shutter_trigger_source)
            .set(n.fast_shutter_trigger_encoder)
            .await?;
        self.fast_shutter_enabled.store(true, Ordering::SeqCst);
        self.channel(&n.fast_shutter_delay).set(delay).await?;
        debug!(rotation_trigger, delay, "Fast shutter enabled");
        Ok(())
    }

    /// Return to software triggering with the fast shutter held open.
    pub async fn disable_fast_shutter(&self) -> TxmResult<()> {
        let n = &self.names;
        self.channel(&n.fast_shutter_trigger_mode)
            .set(names::FAST_SHUTTER_TRIGGER_ROTATION)
            .await?;
        self.channel(&n.fast_shutter_control)
            .set(names::FAST_SHUTTER_CONTROL_MANUAL)
            .await?;
        self.channel(&n.fast_shutter_relay)
            .set(names::FAST_SHUTTER_RELAY_DIRECT)
            .await?;
        self.channel(&n.fast_shutter_trigger_source)
            .set(n.fast_shutter_trigger_encoder)
            .await?;
        self.fast_shutter_enabled.store(false, Ordering::SeqCst);
        self.channel(&n.fast_shutter_open)
            .set(names::FAST_SHUTTER_OPEN)
            .await?;
        debug!("Fast shutter disabled");
        Ok(())
    }

    // ---- Exposure -----------------------------------------------------

    /// Exposure in seconds: the longer of acquire time and acquire period.
    pub async fn exposure_time(&self) -> TxmResult<f64> {
        let time = self.channel(&self.names.cam_acquire_time).get_f64().await?;
        let period = self.channel(&self.names.cam_acquire_period).get_f64().await?;
        Ok(time.max(period))
    }

    /// Set camera acquire time, period and fast-shutter exposure together.
    pub async fn set_exposure_time(&self, seconds: f64) -> TxmResult<()> {
        for spec in [
            &self.names.cam_acquire_time,
            &self.names.cam_acquire_period,
            &self.names.fast_shutter_exposure,
        ] {
            self.channel(spec).set(seconds).await?;
        }
        Ok(())
    }

    // ---- Detector and file writers ------------------------------------

    /// Prime the file plugins with a dummy frame, then configure the camera
    /// for externally triggered acquisition at `exposure` seconds.
    pub async fn setup_detector(&self, exposure: f64, live_display: bool) -> TxmResult<()> {
        let n = &self.names;
        debug!(live_display, "Setting up detector");
        self.channel(&n.cam_image_mode).set(names::IMAGE_MODE_SINGLE).await?;
        self.channel(&n.cam_trigger_mode).set(names::TRIGGER_INTERNAL).await?;
        self.set_exposure_time(PRIMING_EXPOSURE).await?;
        self.channel(&n.cam_acquire).set(names::DETECTOR_ACQUIRE).await?;
        self.wait_until(&n.cam_acquire, names::DETECTOR_IDLE, self.default_timeout())
            .await;

        self.channel(&n.cam_display).set(live_display).await?;
        self.channel(&n.cam_array_callbacks).set("Enable").await?;
        self.channel(&n.soft_glue_step).set("0").await?;
        self.channel(&n.cam_frame_rate_on_off).set(false).await?;
        self.channel(&n.cam_trigger_mode).set(names::TRIGGER_OVERLAPPED).await?;
        self.set_exposure_time(exposure).await?;
        debug!("Finished setting up detector");
        Ok(())
    }

    /// Arm the HDF5 writer for `num_projections` frames.
    ///
    /// With `num_recursive_images > 1` frames are routed through the
    /// processing plugin's recursive-average filter first.
    pub async fn setup_hdf_writer(
        &self,
        num_projections: u32,
        write_mode: &str,
        num_recursive_images: u32,
    ) -> TxmResult<()> {
        let n = &self.names;
        if num_recursive_images > 1 {
            self.channel(&n.proc_callbacks).set("Enable").await?;
            self.channel(&n.proc_filter_enable).set("Disable").await?;
            self.channel(&n.hdf_array_port).set(names::PROC_PORT).await?;
            self.channel(&n.proc_filter_type)
                .set(names::RECURSIVE_FILTER_TYPE)
                .await?;
            self.channel(&n.proc_num_filter).set(num_recursive_images).await?;
            self.channel(&n.proc_reset_filter).set(1).await?;
            self.channel(&n.proc_autoreset_filter).set("Yes").await?;
            self.channel(&n.proc_filter_callbacks).set("Array N only").await?;
            self.channel(&n.proc_filter_enable).set("Enable").await?;
        } else {
            self.channel(&n.proc_filter_enable).set("Disable").await?;
            let source_port = self.channel(&n.proc_array_port).get().await?;
            self.channel(&n.hdf_array_port).set(source_port).await?;
        }

        self.channel(&n.hdf_num_capture).set(num_projections).await?;
        self.channel(&n.hdf_write_mode).set(write_mode).await?;
        self.channel(&n.hdf_capture).set(names::CAPTURE_ENABLED).await?;
        self.wait_until(&n.hdf_capture, names::CAPTURE_ENABLED, self.default_timeout())
            .await;
        match self.hdf_filename().await {
            Ok(file) => debug!(file = %file, "Finished setting up HDF writer"),
            Err(err) => debug!(error = %err, "Finished setting up HDF writer"),
        }
        Ok(())
    }

    /// File the HDF5 writer is writing to.
    pub async fn hdf_filename(&self) -> TxmResult<String> {
        Ok(self.channel(&self.names.hdf_full_file_name).get_string().await?)
    }

    /// Wait for the HDF5 writer to close its file, then return the path.
    ///
    /// A timeout is logged and the path returned anyway; the file may still
    /// be open.
    pub async fn wait_for_hdf_file(&self, timeout: impl Into<Timeout>) -> TxmResult<String> {
        if !self
            .wait_until(&self.names.hdf_capture_rbv, names::HDF_IDLE, timeout)
            .await
        {
            warn!("HDF5 writer still capturing; file may be incomplete");
        }
        self.hdf_filename().await
    }

    /// Arm the TIFF writer to save `num_projections` frames to `filename`.
    ///
    /// With `num_recursive_images > 1` frames are routed through the
    /// recursive-average filter, which the acquisition itself switches on.
    pub async fn setup_tiff_writer(
        &self,
        filename: &str,
        num_projections: u32,
        write_mode: &str,
        num_recursive_images: u32,
    ) -> TxmResult<()> {
        let n = &self.names;
        if num_recursive_images > 1 {
            self.channel(&n.proc_callbacks).set("Enable").await?;
            self.channel(&n.proc_filter_enable).set("Disable").await?;
            self.channel(&n.tiff_array_port).set(names::PROC_PORT).await?;
            self.channel(&n.proc_filter_type)
                .set(names::RECURSIVE_FILTER_TYPE)
                .await?;
            self.channel(&n.proc_num_filter).set(num_recursive_images).await?;
            self.channel(&n.proc_reset_filter).set(1).await?;
            self.channel(&n.proc_autoreset_filter).set("Yes").await?;
            self.channel(&n.proc_filter_callbacks).set("Array N only").await?;
        }
        self.channel(&n.tiff_autosave).set("Yes").await?;
        self.channel(&n.tiff_delete_driver_file).set("No").await?;
        self.channel(&n.tiff_enable_callbacks).set("Enable").await?;
        self.channel(&n.tiff_blocking_callbacks).set("No").await?;
        self.channel(&n.tiff_num_capture).set(num_projections).await?;
        self.channel(&n.tiff_write_mode).set(write_mode).await?;
        self.channel(&n.tiff_file_name).set(filename).await?;
        self.channel(&n.tiff_capture).set(names::CAPTURE_ENABLED).await?;
        if !self
            .wait_until(&n.tiff_capture_rbv, names::CAPTURE_ENABLED, self.default_timeout())
            .await
        {
            warn!(file = filename, "TIFF writer did not report capturing");
        }
        debug!(file = filename, "Finished setting up TIFF writer");
        Ok(())
    }

    /// Rotation angles recorded by the fly-scan controller.
    pub async fn theta_array(&self) -> TxmResult<Vec<f64>> {
        let channel = self.channel(&self.names.theta_array);
        match channel.get().await? {
            PvValue::FloatArray(values) => Ok(values),
            other => match other.as_f64() {
                Some(value) => Ok(vec![value]),
                None => Err(ChannelError::NotNumeric {
                    channel: channel.name().to_string(),
                    value: other,
                }
                .into()),
            },
        }
    }

    /// Stop the TIFF and HDF5 writers and wait for HDF5 capture to end.
    pub async fn stop_capture(&self) -> TxmResult<()> {
        let n = &self.names;
        self.channel(&n.tiff_autosave).set("No").await?;
        self.channel(&n.tiff_capture).set(names::CAPTURE_DISABLED).await?;
        self.channel(&n.hdf_capture).set(names::CAPTURE_DISABLED).await?;
        self.wait_until(&n.hdf_capture, names::CAPTURE_DISABLED, self.default_timeout())
            .await;
        Ok(())
    }

    /// Stop file capture and put the detector back in free-running mode.
    pub async fn stop_scan(&self) -> TxmResult<()> {
        debug!("Stopping scan");
        self.stop_capture().await?;
        // Twice: the camera does not always take the first reset.
        self.reset_ccd().await?;
        self.reset_ccd().await
    }

    /// Return the detector to continuous, internally triggered acquisition
    /// with the live display on.
    pub async fn reset_ccd(&self) -> TxmResult<()> {
        let n = &self.names;
        debug!("Resetting CCD");
        let trigger_mode = self.channel(&n.cam_trigger_mode);
        // The camera only leaves a stuck trigger mode when cycled through
        // Overlapped.
        for mode in [
            names::TRIGGER_INTERNAL,
            names::TRIGGER_OVERLAPPED,
            names::TRIGGER_INTERNAL,
        ] {
            trigger_mode.set(mode).await?;
        }
        self.channel(&n.proc_filter_callbacks).set("Every array").await?;
        self.channel(&n.cam_image_mode)
            .set(names::IMAGE_MODE_CONTINUOUS)
            .await?;
        self.channel(&n.cam_display).set(1).await?;
        self.channel(&n.cam_acquire).set(names::DETECTOR_ACQUIRE).await?;
        self.wait_until(&n.cam_acquire, names::DETECTOR_ACQUIRE, RESET_TIMEOUT)
            .await;
        Ok(())
    }

    /// Stop the rotation stage and return the fly-scan controller to
    /// standard mode.
    pub async fn stop_motion(&self) -> TxmResult<()> {
        self.channel(&self.names.rotation_stop).set(1).await?;
        self.channel(&self.names.fly_scan_control)
            .set(names::FLY_CONTROL_STANDARD)
            .await?;
        Ok(())
    }

    /// Frame acquisition on this instrument.
    pub fn frames(&self) -> FrameSequencer<'_> {
        FrameSequencer::new(self)
    }

    /// Step-scan tomogram; see [`FrameSequencer::capture_tomogram`].
    pub async fn capture_tomogram(
        &self,
        angles: &[f64],
        num_recursive_images: u32,
        stabilize: Duration,
    ) -> TxmResult<Vec<AcquisitionReport>> {
        self.frames()
            .with_recursive_images(num_recursive_images)
            .capture_tomogram(angles, stabilize)
            .await
    }
}
