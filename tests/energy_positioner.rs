//! Integration tests for the energy move sequence
//!
//! Runs `Txm::move_energy` against the simulated beamline and checks the
//! writes that reach the devices: detector and zone-plate targets from the
//! optics calculation, monochromator mode save/restore, and the undulator gap
//! backlash protocol.

use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;
use txm_control::device::mock::MockDeviceClient;
use txm_control::energy::{EnergyMove, MoveEnergyOptions};
use txm_control::{DeviceNameTable, PvValue, Txm, TxmConfig, TxmError};

const CCD: &str = "32idcTXM:mxv:c1:m6.VAL";
const ZONE_PLATE_X: &str = "32idcTXM:mcs:c2:m2.VAL";
const ZONE_PLATE_Z: &str = "32idcTXM:mcs:c0:m2.VAL";
const DCM_ENERGY: &str = "32ida:BraggEAO.VAL";
const DCM_MODE: &str = "32ida:KohzuModeBO.VAL";
const GAP: &str = "32id:ID32us_energy";

const TOLERANCE: f64 = 1e-9;

fn beamline(configure: impl FnOnce(&mut TxmConfig)) -> (Txm, MockDeviceClient) {
    let mut config = TxmConfig::default();
    config.instrument.has_permit = true;
    config.timing.energy_settle = Duration::from_millis(1);
    configure(&mut config);
    let mock = MockDeviceClient::beamline(&DeviceNameTable::nano(), &config.instrument.ioc_prefix);
    (Txm::new(Arc::new(mock.clone()), config), mock)
}

fn float(mock: &MockDeviceClient, name: &str) -> f64 {
    mock.value(name).and_then(|v| v.as_f64()).unwrap()
}

// =============================================================================
// Optics
// =============================================================================

#[tokio::test]
async fn test_constant_magnification_moves_detector_and_zone_plate() {
    let (txm, mock) = beamline(|_| {});

    let outcome = txm
        .move_energy(8.6, MoveEnergyOptions::default())
        .await
        .unwrap();
    let EnergyMove::Moved(plan) = outcome else {
        panic!("expected a move, got {outcome:?}");
    };

    assert!((float(&mock, CCD) - 3440.0).abs() < TOLERANCE);
    assert!((float(&mock, ZONE_PLATE_Z) - 76.60932726700482).abs() < TOLERANCE);
    assert!((plan.magnification - 43.90314851624585).abs() < TOLERANCE);
    assert_eq!(mock.value(DCM_ENERGY), Some(PvValue::Float(8.6)));
}

#[tokio::test]
async fn test_variable_magnification_leaves_detector() {
    let (txm, mock) = beamline(|_| {});
    let options = MoveEnergyOptions {
        constant_magnification: false,
        ..MoveEnergyOptions::default()
    };

    txm.move_energy(8.6, options).await.unwrap();

    assert!(mock.writes_to(CCD).is_empty());
    assert!((float(&mock, ZONE_PLATE_Z) - 76.63034639116636).abs() < TOLERANCE);
}

#[tokio::test]
async fn test_drift_correction_follows_zone_plate_travel() {
    let (txm, mock) = beamline(|c| c.optics.zone_plate_drift_x = 0.01);

    txm.move_energy(8.6, MoveEnergyOptions::default())
        .await
        .unwrap();

    let expected = 0.01 * (76.60932726700482 - 74.7);
    assert!((float(&mock, ZONE_PLATE_X) - expected).abs() < 1e-6);
    assert!(mock.writes_to("32idc01:m110.VAL").is_empty());
}

// =============================================================================
// Source sequencing
// =============================================================================

#[tokio::test]
async fn test_gap_approaches_from_below_and_mode_is_restored() {
    let (txm, mock) = beamline(|_| {});

    txm.move_energy(8.6, MoveEnergyOptions::default())
        .await
        .unwrap();

    assert_eq!(
        mock.writes_to(GAP),
        vec![PvValue::Float(8.6), PvValue::Float(8.6 + 0.17)]
    );
    assert_eq!(
        mock.writes_to(DCM_MODE),
        vec![PvValue::Int(1), PvValue::Int(0)]
    );
}

#[tokio::test]
async fn test_failed_zone_plate_move_still_restores_mode() {
    let (txm, mock) = beamline(|_| {});
    mock.fail_on(ZONE_PLATE_Z);

    let result = txm.move_energy(8.6, MoveEnergyOptions::default()).await;

    assert!(result.is_err(), "zone plate failure surfaces as an error");
    assert_eq!(
        mock.writes_to(DCM_MODE),
        vec![PvValue::Int(1), PvValue::Int(0)]
    );
    assert_eq!(mock.value(DCM_MODE), Some(PvValue::Int(0)));
    assert!(mock.writes_to(DCM_ENERGY).is_empty());
    assert!(mock.writes_to(GAP).is_empty());
}

#[tokio::test]
async fn test_without_backlash_correction_gap_is_written_once() {
    let (txm, mock) = beamline(|_| {});
    let options = MoveEnergyOptions {
        correct_backlash: false,
        ..MoveEnergyOptions::default()
    };

    txm.move_energy(9.0, options).await.unwrap();

    assert_eq!(mock.writes_to(GAP), vec![PvValue::Float(9.0 + 0.17)]);
}

// =============================================================================
// Refusals
// =============================================================================

#[tokio::test]
async fn test_out_of_range_energy_is_an_error_without_writes() {
    let (txm, mock) = beamline(|_| {});

    for energy in [8500.0, 5.0, -1.0] {
        let err = txm
            .move_energy(energy, MoveEnergyOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TxmError::Energy { .. }), "{err}");
    }

    assert!(mock.writes().is_empty());
    assert_eq!(mock.read_count(), 0);
}

#[tokio::test]
#[traced_test]
async fn test_current_energy_is_not_commanded_again() {
    let (txm, mock) = beamline(|_| {});

    let outcome = txm
        .move_energy(8.5, MoveEnergyOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome, EnergyMove::AlreadyAtTarget);
    assert!(mock.writes().is_empty());
    assert!(logs_contain("Already at requested energy"));
}

#[tokio::test]
#[traced_test]
async fn test_without_permit_energy_move_is_skipped_once() {
    let (txm, mock) = beamline(|c| c.instrument.has_permit = false);

    let outcome = txm
        .move_energy(9.0, MoveEnergyOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome, EnergyMove::PermitDenied);
    assert!(mock.writes().is_empty());
    logs_assert(|lines: &[&str]| {
        let warnings = lines
            .iter()
            .filter(|l| l.contains("WARN") && l.contains("beamline permit not granted"))
            .count();
        match warnings {
            1 => Ok(()),
            n => Err(format!("expected one permit warning, saw {n}")),
        }
    });
}

#[tokio::test]
#[traced_test]
async fn test_unreachable_focus_is_refused() {
    let (txm, mock) = beamline(|_| {});
    mock.set_value(CCD, 200.0);

    let outcome = txm
        .move_energy(8.6, MoveEnergyOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome, EnergyMove::Unsolvable);
    assert!(mock.writes().is_empty());
    assert!(logs_contain("energy not changed"));
}
