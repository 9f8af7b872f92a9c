//! Integration tests for the scan session lifecycle
//!
//! A scan body moves the instrument away from its starting state and then
//! fails, succeeds or panics; the session must restore position, energy,
//! exposure and fast-shutter mode every time and hand back the body's
//! outcome unchanged.

use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;
use tracing_test::traced_test;
use tracing_subscriber::layer::SubscriberExt;
use txm_control::device::mock::MockDeviceClient;
use txm_control::energy::MoveEnergyOptions;
use txm_control::session::{self, ScanOptions, ScanSession, SessionState};
use txm_control::storage::{MemorySink, ENERGY_DATASET, THETA_DATASET};
use txm_control::tracing_setup;
use txm_control::{DeviceNameTable, PvValue, SamplePosition, Txm, TxmConfig};

const SAMPLE_X: &str = "32idcTXM:mcs:c3:m7.VAL";
const SAMPLE_Y: &str = "32idcTXM:mxv:c1:m1.VAL";
const SAMPLE_Z: &str = "32idcTXM:mcs:c3:m8.VAL";
const ROTATION: &str = "32idcTXM:ens:c1:m1.VAL";
const DCM_ENERGY: &str = "32ida:BraggEAO.VAL";

/// Simulated beamline at (3, 4, 5, 90°) and 8.7 keV with the permit granted.
fn beamline() -> (Arc<Txm>, MockDeviceClient) {
    let mut config = TxmConfig::default();
    config.instrument.has_permit = true;
    config.timing.energy_settle = Duration::from_millis(1);
    config.timing.default_timeout = Duration::from_millis(500);
    config.timing.shutter_timeout = Duration::from_millis(500);

    let mock = MockDeviceClient::beamline(&DeviceNameTable::nano(), &config.instrument.ioc_prefix);
    mock.set_value(SAMPLE_X, 3.0);
    mock.set_value(SAMPLE_Y, 4.0);
    mock.set_value(SAMPLE_Z, 5.0);
    mock.set_value(ROTATION, 90.0);
    mock.set_value(DCM_ENERGY, 8.7);

    (Arc::new(Txm::new(Arc::new(mock.clone()), config)), mock)
}

fn starting_position() -> SamplePosition {
    SamplePosition {
        x: 3.0,
        y: 4.0,
        z: 5.0,
        theta: 90.0,
    }
}

// =============================================================================
// Restoration
// =============================================================================

#[tokio::test]
async fn test_failed_scan_restores_position_and_energy() {
    let (txm, mock) = beamline();

    let result: anyhow::Result<()> = session::run(Arc::clone(&txm), ScanOptions::default(), |scan| async move {
        let txm = scan.txm();
        txm.move_sample(SamplePosition {
            x: 1.0,
            y: 2.0,
            z: 3.0,
            theta: 45.0,
        })
        .await?;
        txm.move_energy(9.0, MoveEnergyOptions::default()).await?;
        assert_eq!(txm.energy().await?, 9.0);
        anyhow::bail!("sample drifted out of the field of view")
    })
    .await;

    let err = result.unwrap_err();
    assert_eq!(err.to_string(), "sample drifted out of the field of view");

    assert_eq!(txm.sample_position().await.unwrap(), starting_position());
    assert_eq!(mock.value(DCM_ENERGY), Some(PvValue::Float(8.7)));
    assert_eq!(txm.energy().await.unwrap(), 8.7);
}

#[tokio::test]
async fn test_successful_scan_returns_body_value_and_restores() {
    let (txm, mock) = beamline();
    let sink = Arc::new(MemorySink::new());
    let options = ScanOptions::default().with_sink(sink.clone());

    let frames = session::run(Arc::clone(&txm), options, |scan| async move {
        let txm = scan.txm();
        txm.set_exposure_time(1.5).await?;
        txm.enable_fast_shutter(true, 0.05).await?;
        txm.open_shutters().await?;
        let report = txm.frames().capture_projections(4).await?;
        scan.record_dataset(THETA_DATASET, vec![0.0, 45.0, 90.0, 135.0]);
        scan.record_dataset(ENERGY_DATASET, vec![8.7; 4]);
        Ok(report.confirmed)
    })
    .await
    .unwrap();

    assert_eq!(frames, 4);
    assert_eq!(txm.exposure_time().await.unwrap(), 0.5);
    assert!(!txm.fast_shutter_enabled());
    assert!(!txm.shutters_are_open());
    assert_eq!(sink.get(ENERGY_DATASET), Some(vec![8.7; 4]));
    assert_eq!(sink.paths().len(), 2);
    // Energy did not change, so the monochromator was never commanded.
    assert!(mock.writes_to(DCM_ENERGY).is_empty());
}

#[tokio::test]
async fn test_teardown_survives_communication_failures() {
    let (txm, mock) = beamline();

    let result = session::run(Arc::clone(&txm), ScanOptions::default(), |scan| async move {
        scan.txm().move_sample(SamplePosition {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            theta: 10.0,
        })
        .await?;
        Ok(())
    });
    // The HDF writer disappears: capture cannot be stopped.
    mock.fail_on("32idcPG3:HDF1:Capture");
    result.await.unwrap();

    assert_eq!(txm.sample_position().await.unwrap(), starting_position());
    assert_eq!(
        mock.value("32idcPG3:cam1:ImageMode"),
        Some(PvValue::from("Continuous"))
    );
}

#[tokio::test]
async fn test_position_restore_waits_for_every_axis() {
    let (txm, mock) = beamline();

    session::run(Arc::clone(&txm), ScanOptions::default(), |scan| async move {
        scan.txm()
            .move_sample(SamplePosition {
                x: -1.0,
                y: -2.0,
                z: -3.0,
                theta: 180.0,
            })
            .await?;
        Ok(())
    })
    .await
    .unwrap();

    for (axis, home) in [(SAMPLE_X, 3.0), (SAMPLE_Y, 4.0), (SAMPLE_Z, 5.0), (ROTATION, 90.0)] {
        let writes: Vec<_> = mock.writes().into_iter().filter(|w| w.name == axis).collect();
        let (body, restore) = match writes.as_slice() {
            [body, restore] => (body, restore),
            other => panic!("{axis}: expected two writes, saw {other:?}"),
        };
        assert!(!body.with_callback, "{axis}: body move is a plain write");
        assert!(restore.with_callback, "{axis}: restore is tracked to completion");
        assert_eq!(restore.value, PvValue::Float(home));
    }
}

#[tokio::test]
#[traced_test]
async fn test_datasets_wait_for_the_hdf_writer_to_finish() {
    let (txm, mock) = beamline();
    mock.set_value("32idcPG3:HDF1:Capture_RBV", 1);
    let sink = Arc::new(MemorySink::new());
    let options = ScanOptions::default().with_sink(sink.clone());

    let writer = mock.clone();
    let closer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        writer.set_value("32idcPG3:HDF1:Capture_RBV", 0);
    });

    session::run(Arc::clone(&txm), options, |scan| async move {
        scan.record_dataset(THETA_DATASET, vec![0.0, 90.0]);
        Ok(())
    })
    .await
    .unwrap();
    closer.await.unwrap();

    assert_eq!(sink.get(THETA_DATASET), Some(vec![0.0, 90.0]));
    assert!(logs_contain("HDF5 file released"));
    assert!(!logs_contain("HDF5 writer still capturing"));
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_session_states() {
    let (txm, _mock) = beamline();
    let mut session = ScanSession::new(txm, ScanOptions::default());
    assert_eq!(session.state(), SessionState::NotStarted);
    assert!(session.snapshot().is_none());

    let context = session.begin().await.unwrap();
    assert_eq!(context.id(), session.id());
    assert_eq!(session.state(), SessionState::Running);
    assert_eq!(
        session.snapshot().map(|s| s.sample_position),
        Some(starting_position())
    );
    assert_eq!(session.snapshot().map(|s| s.energy), Some(8.7));

    session.finish(Ok(())).await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_session_log_file_is_attached_for_the_scan() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("scan_0001.log");
    let subscriber = tracing_subscriber::registry().with(tracing_setup::session_log_layer());
    let _default = tracing::subscriber::set_default(subscriber);

    let (txm, _mock) = beamline();
    let options = ScanOptions::default().with_log(Level::INFO, Some(log_path.clone()));
    session::run(txm, options, |_scan| async move {
        tracing::info!("Inside the scan body");
        Ok(())
    })
    .await
    .unwrap();
    tracing::info!("After the scan");

    let contents = std::fs::read_to_string(&log_path).unwrap();
    assert!(contents.contains("Scan started"));
    assert!(contents.contains("Inside the scan body"));
    assert!(!contents.contains("After the scan"));
}
