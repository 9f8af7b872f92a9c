//! Frame acquisition.
//!
//! [`FrameSequencer`] tags frames as data, dark or white field and triggers
//! the detector. Three trigger paths exist, chosen from the instrument state
//! at the time of the call:
//!
//! | Path | When | Per frame |
//! |------|------|-----------|
//! | Fast shutter | fast shutter enabled | fire the shutter FPGA, wait for it to finish |
//! | Internal | camera trigger mode `Internal` | one batched multi-frame acquisition |
//! | External | any other trigger mode | arm, software trigger, wait for the image counter |
//!
//! Shutter state that contradicts the frame type (dark field with the beam on,
//! data or white field with it off) is logged as one warning; acquisition
//! goes ahead regardless.

use std::fmt;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::device::PvValue;
use crate::error::TxmResult;
use crate::instrument::{SampleTarget, Txm};
use crate::names;
use crate::wait::Timeout;

/// Frame tag written to the detector before triggering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Sample projection
    Data,
    /// Beam off
    Dark,
    /// Beam on, sample out
    White,
}

impl FrameType {
    /// Value of the detector's frame-type record.
    pub fn value(self) -> i64 {
        match self {
            FrameType::Data => names::FRAME_DATA,
            FrameType::Dark => names::FRAME_DARK,
            FrameType::White => names::FRAME_WHITE,
        }
    }

    /// Whether frames of this type are meant to see the beam.
    pub fn needs_beam(self) -> bool {
        !matches!(self, FrameType::Dark)
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameType::Data => write!(f, "projections"),
            FrameType::Dark => write!(f, "dark field"),
            FrameType::White => write!(f, "white field"),
        }
    }
}

/// One acquisition call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameRequest {
    /// Tag written before triggering
    pub frame_type: FrameType,
    /// Frames to take
    pub count: u32,
    /// Seconds per frame; read from the detector when `None`
    pub exposure: Option<f64>,
}

impl FrameRequest {
    /// `count` frames at the detector's current exposure.
    pub fn new(frame_type: FrameType, count: u32) -> Self {
        Self {
            frame_type,
            count,
            exposure: None,
        }
    }

    /// Override the exposure used for wait timeouts.
    pub fn with_exposure(mut self, seconds: f64) -> Self {
        self.exposure = Some(seconds);
        self
    }
}

/// Whether a [`FrameSequencer`] is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquisitionState {
    /// No acquisition running
    #[default]
    Idle,
    /// Collecting frames of this type
    Acquiring(FrameType),
}

/// How the detector was triggered; see the module table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerPath {
    /// Shutter FPGA per frame
    FastShutter,
    /// One batched acquisition
    Internal,
    /// Software trigger per frame
    External,
}

/// What an acquisition did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionReport {
    /// Tag the frames were written with
    pub frame_type: FrameType,
    /// Trigger path taken
    pub path: TriggerPath,
    /// Frames asked for
    pub requested: u32,
    /// Triggers sent
    pub triggered: u32,
    /// Frames the detector confirmed before its wait timed out
    pub confirmed: u32,
}

impl AcquisitionReport {
    /// Every requested frame was confirmed.
    pub fn is_complete(&self) -> bool {
        self.confirmed == self.requested
    }
}

/// Drives the detector for one instrument.
pub struct FrameSequencer<'a> {
    txm: &'a Txm,
    state: AcquisitionState,
    recursive_images: u32,
}

impl<'a> FrameSequencer<'a> {
    /// Idle sequencer without frame averaging.
    pub fn new(txm: &'a Txm) -> Self {
        Self {
            txm,
            state: AcquisitionState::Idle,
            recursive_images: 1,
        }
    }

    /// Enable the recursive-average filter around each batch when `n > 1`.
    pub fn with_recursive_images(mut self, n: u32) -> Self {
        self.recursive_images = n;
        self
    }

    /// Current acquisition state.
    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    /// Sample projections.
    pub async fn capture_projections(&mut self, count: u32) -> TxmResult<AcquisitionReport> {
        self.acquire(FrameRequest::new(FrameType::Data, count)).await
    }

    /// Beam on, sample out of the field of view.
    pub async fn capture_white_field(&mut self, count: u32) -> TxmResult<AcquisitionReport> {
        self.acquire(FrameRequest::new(FrameType::White, count)).await
    }

    /// Beam off.
    pub async fn capture_dark_field(&mut self, count: u32) -> TxmResult<AcquisitionReport> {
        self.acquire(FrameRequest::new(FrameType::Dark, count)).await
    }

    /// Tag, trigger and count `request.count` frames of one type.
    ///
    /// A zero count reports the path that would have been used and writes
    /// nothing.
    pub async fn acquire(&mut self, request: FrameRequest) -> TxmResult<AcquisitionReport> {
        let frame_type = request.frame_type;
        self.check_shutters(frame_type);
        if request.count == 0 {
            let path = self.trigger_path().await?;
            debug!(frame_type = %frame_type, ?path, "No frames requested");
            return Ok(AcquisitionReport {
                frame_type,
                path,
                requested: 0,
                triggered: 0,
                confirmed: 0,
            });
        }

        self.state = AcquisitionState::Acquiring(frame_type);
        let result = self.run(request).await;
        self.state = AcquisitionState::Idle;
        result
    }

    /// Rotate through `angles`, collecting one averaged projection at each.
    ///
    /// The stage settles for `stabilize` after every move. Each angle takes
    /// as many frames as the recursive filter averages.
    pub async fn capture_tomogram(
        &mut self,
        angles: &[f64],
        stabilize: Duration,
    ) -> TxmResult<Vec<AcquisitionReport>> {
        self.check_shutters(FrameType::Data);
        if angles.is_empty() {
            debug!("No tomogram angles given");
            return Ok(Vec::new());
        }

        self.state = AcquisitionState::Acquiring(FrameType::Data);
        let result = self.run_tomogram(angles, stabilize).await;
        self.state = AcquisitionState::Idle;
        result
    }

    fn check_shutters(&self, frame_type: FrameType) {
        let shutters_open = self.txm.shutters_are_open();
        if frame_type.needs_beam() != shutters_open {
            let state = if shutters_open { "open" } else { "closed" };
            warn!(frame_type = %frame_type, "Collecting {frame_type} with shutters {state}.");
        }
    }

    async fn run(&self, request: FrameRequest) -> TxmResult<AcquisitionReport> {
        let txm = self.txm;
        txm.channel(&txm.names().cam_frame_type)
            .set(request.frame_type.value())
            .await?;

        let exposure = match request.exposure {
            Some(seconds) => seconds,
            None => txm.exposure_time().await?,
        };

        let previous_filter = self.enable_filter().await?;
        let result = self.trigger(request, exposure).await;
        self.restore_filter(previous_filter).await;

        let report = result?;
        debug!(
            frame_type = %report.frame_type,
            path = ?report.path,
            confirmed = report.confirmed,
            requested = report.requested,
            "Acquisition finished"
        );
        Ok(report)
    }

    async fn run_tomogram(&self, angles: &[f64], stabilize: Duration) -> TxmResult<Vec<AcquisitionReport>> {
        let txm = self.txm;
        txm.channel(&txm.names().cam_frame_type)
            .set(FrameType::Data.value())
            .await?;
        let exposure = txm.exposure_time().await?;

        let previous_filter = self.enable_filter().await?;
        let result = self.step_through(angles, stabilize, exposure).await;
        self.restore_filter(previous_filter).await;

        let reports = result?;
        debug!(
            angles = angles.len(),
            complete = reports.iter().filter(|r| r.is_complete()).count(),
            "Tomogram finished"
        );
        Ok(reports)
    }

    async fn step_through(
        &self,
        angles: &[f64],
        stabilize: Duration,
        exposure: f64,
    ) -> TxmResult<Vec<AcquisitionReport>> {
        let per_angle = FrameRequest::new(FrameType::Data, self.recursive_images.max(1));
        let mut reports = Vec::with_capacity(angles.len());
        for &angle in angles {
            self.txm.move_sample(SampleTarget::theta(angle)).await?;
            sleep(stabilize).await;
            reports.push(self.trigger(per_angle, exposure).await?);
        }
        Ok(reports)
    }

    /// Turn the recursive filter on when averaging; returns the state to
    /// put back.
    async fn enable_filter(&self) -> TxmResult<Option<PvValue>> {
        if self.recursive_images <= 1 {
            return Ok(None);
        }
        let filter = self.txm.channel(&self.txm.names().proc_filter_enable);
        let previous = filter.get().await?;
        filter.set("Enable").await?;
        Ok(Some(previous))
    }

    async fn restore_filter(&self, previous: Option<PvValue>) {
        let Some(previous) = previous else {
            return;
        };
        let filter = self.txm.channel(&self.txm.names().proc_filter_enable);
        if let Err(err) = filter.set(previous).await {
            warn!(error = %err, "Could not restore the recursive filter");
        }
    }

    async fn trigger_path(&self) -> TxmResult<TriggerPath> {
        let txm = self.txm;
        if txm.fast_shutter_enabled() {
            return Ok(TriggerPath::FastShutter);
        }
        let mode = txm.channel(&txm.names().cam_trigger_mode).get_string().await?;
        Ok(if mode == names::TRIGGER_INTERNAL {
            TriggerPath::Internal
        } else {
            TriggerPath::External
        })
    }

    async fn trigger(&self, request: FrameRequest, exposure: f64) -> TxmResult<AcquisitionReport> {
        let txm = self.txm;
        let n = txm.names();
        let count = request.count;
        let per_frame = frame_timeout(txm, exposure, 1);

        let path = self.trigger_path().await?;
        debug!(count, exposure, ?path, "Triggering {}", request.frame_type);

        let mut triggered = 0;
        let mut confirmed = 0;
        match path {
            TriggerPath::Internal => {
                txm.channel(&n.cam_image_mode)
                    .set(names::IMAGE_MODE_MULTIPLE)
                    .await?;
                txm.channel(&n.cam_num_images).set(count).await?;
                txm.channel(&n.cam_acquire)
                    .set(names::DETECTOR_ACQUIRE)
                    .await?;
                triggered = count;
                let timeout = frame_timeout(txm, exposure, count);
                if txm
                    .wait_until(&n.cam_acquire, names::DETECTOR_IDLE, timeout)
                    .await
                {
                    confirmed = count;
                }
            }
            TriggerPath::FastShutter => {
                self.single_image_mode().await?;
                let trigger = txm.channel(&n.fast_shutter_trigger);
                for _ in 0..count {
                    trigger.set(names::FAST_SHUTTER_TRIGGERED).await?;
                    triggered += 1;
                    if txm
                        .wait_until(&n.fast_shutter_trigger, names::FAST_SHUTTER_DONE, per_frame)
                        .await
                    {
                        confirmed += 1;
                    }
                }
            }
            TriggerPath::External => {
                self.single_image_mode().await?;
                let acquire = txm.channel(&n.cam_acquire);
                let counter = txm.channel(&n.cam_num_images_counter);
                let software_trigger = txm.channel(&n.cam_software_trigger);
                for _ in 0..count {
                    acquire.set(names::DETECTOR_ACQUIRE).await?;
                    txm.wait_until(&n.cam_status, names::DETECTOR_WAITING, per_frame)
                        .await;
                    let before = counter.get().await?.as_i64().unwrap_or(0);
                    software_trigger.set(1).await?;
                    triggered += 1;
                    if txm
                        .wait_until(&n.cam_num_images_counter, before + 1, per_frame)
                        .await
                    {
                        confirmed += 1;
                    }
                }
            }
        }

        Ok(AcquisitionReport {
            frame_type: request.frame_type,
            path,
            requested: count,
            triggered,
            confirmed,
        })
    }

    async fn single_image_mode(&self) -> TxmResult<()> {
        let n = self.txm.names();
        self.txm
            .channel(&n.cam_image_mode)
            .set(names::IMAGE_MODE_SINGLE)
            .await?;
        self.txm.channel(&n.cam_num_images).set(1).await?;
        Ok(())
    }
}

/// Exposure time for `frames` frames on top of the configured timeout.
fn frame_timeout(txm: &Txm, exposure: f64, frames: u32) -> Timeout {
    let exposing = Duration::try_from_secs_f64(exposure * f64::from(frames)).unwrap_or_default();
    Timeout::After(txm.config().timing.default_timeout + exposing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TxmConfig;
    use crate::device::mock::MockDeviceClient;
    use crate::names::DeviceNameTable;
    use std::sync::Arc;
    use tracing_test::traced_test;

    fn txm() -> (Txm, MockDeviceClient) {
        let mut config = TxmConfig::default();
        config.instrument.has_permit = true;
        config.timing.default_timeout = Duration::from_millis(200);
        let mock = MockDeviceClient::beamline(&DeviceNameTable::nano(), "32idcPG3:");
        (Txm::new(Arc::new(mock.clone()), config), mock)
    }

    #[tokio::test]
    async fn internal_trigger_batches_the_frames() {
        let (txm, mock) = txm();
        let report = txm.frames().capture_white_field(5).await.unwrap();
        assert_eq!(report.path, TriggerPath::Internal);
        assert!(report.is_complete());
        assert_eq!(mock.writes_to("32idcPG3:cam1:Acquire").len(), 1);
        assert_eq!(mock.value("32idcPG3:cam1:NumImages"), Some(PvValue::Int(5)));
        assert_eq!(
            mock.value("32idcPG3:cam1:FrameType"),
            Some(PvValue::Int(names::FRAME_WHITE))
        );
    }

    #[tokio::test]
    async fn external_trigger_counts_each_frame() {
        let (txm, mock) = txm();
        mock.set_value("32idcPG3:cam1:TriggerMode", names::TRIGGER_OVERLAPPED);
        let report = txm.frames().capture_projections(3).await.unwrap();
        assert_eq!(report.path, TriggerPath::External);
        assert_eq!(report.triggered, 3);
        assert_eq!(report.confirmed, 3);
        assert_eq!(
            mock.value("32idcPG3:cam1:NumImagesCounter_RBV"),
            Some(PvValue::Int(3))
        );
    }

    #[tokio::test]
    async fn fast_shutter_fires_once_per_frame() {
        let (txm, mock) = txm();
        txm.enable_fast_shutter(false, 0.02).await.unwrap();
        let report = txm
            .frames()
            .acquire(FrameRequest::new(FrameType::Data, 2).with_exposure(0.01))
            .await
            .unwrap();
        assert_eq!(report.path, TriggerPath::FastShutter);
        assert!(report.is_complete());
        assert_eq!(mock.writes_to("32idcTXM:shutCam:go").len(), 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn projections_with_closed_shutters_warn() {
        let (txm, _mock) = txm();
        txm.frames().capture_projections(1).await.unwrap();
        assert!(logs_contain("Collecting projections with shutters closed."));
    }

    #[tokio::test]
    async fn recursive_filter_is_restored_after_the_batch() {
        let (txm, mock) = txm();
        let mut frames = txm.frames().with_recursive_images(3);
        frames.capture_projections(2).await.unwrap();
        assert_eq!(frames.state(), AcquisitionState::Idle);
        assert_eq!(
            mock.writes_to("32idcPG3:Proc1:EnableFilter"),
            vec![PvValue::from("Enable"), PvValue::from("Disable")]
        );
    }

    #[tokio::test]
    async fn zero_frames_touch_nothing() {
        let (txm, mock) = txm();
        let report = txm.frames().capture_projections(0).await.unwrap();
        assert_eq!(report.path, TriggerPath::Internal);
        assert_eq!(report.triggered, 0);
        assert!(report.is_complete());
        assert!(mock.writes_to("32idcPG3:cam1:Acquire").is_empty());
        assert!(mock.writes().is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_filter_restore_keeps_the_frames() {
        let (txm, mock) = txm();
        mock.reject_put("32idcPG3:Proc1:EnableFilter", "Disable");
        let mut frames = txm.frames().with_recursive_images(2);
        let report = frames.capture_white_field(2).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(frames.state(), AcquisitionState::Idle);
        assert!(logs_contain("Could not restore the recursive filter"));
    }

    #[tokio::test]
    async fn tomogram_steps_the_rotation_stage() {
        let (txm, mock) = txm();
        let mut frames = txm.frames().with_recursive_images(2);
        let reports = frames
            .capture_tomogram(&[0.0, 90.0, 180.0], Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(|r| r.requested == 2 && r.is_complete()));
        assert_eq!(
            mock.writes_to("32idcTXM:ens:c1:m1.VAL"),
            vec![PvValue::Float(0.0), PvValue::Float(90.0), PvValue::Float(180.0)]
        );
        assert_eq!(
            mock.writes_to("32idcPG3:Proc1:EnableFilter"),
            vec![PvValue::from("Enable"), PvValue::from("Disable")]
        );
        assert_eq!(mock.writes_to("32idcPG3:cam1:Acquire").len(), 3);
        assert_eq!(frames.state(), AcquisitionState::Idle);
    }

    #[tokio::test]
    async fn empty_tomogram_is_a_no_op() {
        let (txm, mock) = txm();
        let reports = txm
            .frames()
            .capture_tomogram(&[], Duration::ZERO)
            .await
            .unwrap();
        assert!(reports.is_empty());
        assert!(mock.writes().is_empty());
    }

    #[test]
    fn frame_tags_match_the_detector_enum() {
        assert_eq!(FrameType::Data.value(), 0);
        assert_eq!(FrameType::Dark.value(), 1);
        assert_eq!(FrameType::White.value(), 2);
        assert!(!FrameType::Dark.needs_beam());
    }
}
