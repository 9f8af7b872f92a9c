//! Integration tests for frame acquisition
//!
//! Exercises the dark / white / data capture calls on a detector set up for
//! external triggering, including the shutter-consistency warnings.

use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;
use txm_control::device::mock::MockDeviceClient;
use txm_control::frames::{AcquisitionState, TriggerPath};
use txm_control::{DeviceNameTable, PvValue, Txm, TxmConfig};

const SOFTWARE_TRIGGER: &str = "32idcPG3:cam1:SoftwareTrigger";
const FRAME_TYPE: &str = "32idcPG3:cam1:FrameType";

async fn armed_beamline() -> (Txm, MockDeviceClient) {
    let mut config = TxmConfig::default();
    config.instrument.has_permit = true;
    config.timing.default_timeout = Duration::from_millis(500);
    config.timing.shutter_timeout = Duration::from_millis(500);
    let mock = MockDeviceClient::beamline(&DeviceNameTable::nano(), &config.instrument.ioc_prefix);
    let txm = Txm::new(Arc::new(mock.clone()), config);
    txm.setup_detector(0.01, false).await.unwrap();
    mock.clear_history();
    (txm, mock)
}

fn count_warnings(lines: &[&str], needle: &str) -> usize {
    lines
        .iter()
        .filter(|l| l.contains("WARN") && l.contains(needle))
        .count()
}

#[tokio::test]
#[traced_test]
async fn test_dark_field_with_open_shutters_warns_once_and_acquires() {
    let (txm, mock) = armed_beamline().await;
    txm.open_shutters().await.unwrap();
    assert!(txm.shutters_are_open());

    let report = txm.frames().capture_dark_field(3).await.unwrap();

    assert_eq!(report.path, TriggerPath::External);
    assert_eq!(report.triggered, 3);
    assert_eq!(report.confirmed, 3);
    assert_eq!(mock.writes_to(SOFTWARE_TRIGGER).len(), 3);
    assert_eq!(mock.value(FRAME_TYPE), Some(PvValue::Int(1)));
    logs_assert(|lines: &[&str]| match count_warnings(lines, "dark field") {
        1 => Ok(()),
        n => Err(format!("expected exactly one dark-field warning, saw {n}")),
    });
}

#[tokio::test]
#[traced_test]
async fn test_dark_field_with_closed_shutters_is_quiet() {
    let (txm, _mock) = armed_beamline().await;
    txm.close_shutters().await.unwrap();

    let report = txm.frames().capture_dark_field(2).await.unwrap();

    assert!(report.is_complete());
    assert!(!logs_contain("Collecting dark field"));
}

#[tokio::test]
#[traced_test]
async fn test_white_field_with_closed_shutters_warns() {
    let (txm, mock) = armed_beamline().await;

    let report = txm.frames().capture_white_field(1).await.unwrap();

    assert_eq!(report.confirmed, 1);
    assert_eq!(mock.value(FRAME_TYPE), Some(PvValue::Int(2)));
    assert!(logs_contain("Collecting white field with shutters closed."));
}

#[tokio::test]
async fn test_counter_readback_failure_ends_the_acquisition() {
    let (txm, mock) = armed_beamline().await;
    // Triggers are accepted but the image counter cannot be read.
    mock.fail_on("32idcPG3:cam1:NumImagesCounter_RBV");

    let mut frames = txm.frames();
    let result = frames.capture_projections(1).await;

    assert!(result.is_err(), "counter readback failure surfaces as a channel error");
    assert_eq!(frames.state(), AcquisitionState::Idle);
}
