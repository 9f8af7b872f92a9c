//! Energy repositioning for the zone-plate optics.
//!
//! Changing the X-ray energy changes the zone plate's focal length, so the
//! zone plate (and, for constant magnification, the detector) must move with
//! the monochromator and undulator gap.
//!
//! The geometry is the thin-lens relation between the zone plate focal
//! length `f`, the source-to-detector distance `CCD` and the object distance
//! `D` (zone plate to detector):
//!
//! ```text
//! λ(E)  = 1240 / (E · 1000)                 nm, E in keV
//! f(E)  = diameter · outer_zone_width / (1000 · λ(E))
//! D     = (CCD + sqrt(CCD² − 4·CCD·f)) / 2
//! ```
//!
//! [`plan_energy_move`] is the pure calculation; [`EnergyPositioner`] applies a
//! plan to the hardware.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::channel::Registry;
use crate::config::OpticsConfig;
use crate::error::{TxmError, TxmResult};
use crate::names::DeviceNameTable;
use crate::permit::Gated;

/// Photon energy–wavelength product, eV·nm.
pub const HC_EV_NM: f64 = 1240.0;

/// Wavelength in nm for an energy in keV.
pub fn wavelength_nm(energy_kev: f64) -> f64 {
    HC_EV_NM / (energy_kev * 1000.0)
}

/// Zone plate focal length (mm) at `energy_kev`.
pub fn zone_plate_focal(diameter: f64, outer_zone_width: f64, energy_kev: f64) -> f64 {
    diameter * outer_zone_width / (1000.0 * wavelength_nm(energy_kev))
}

/// Larger root of `D² − CCD·D + CCD·f = 0`, or `None` when the detector is
/// too close for the focal length to form an image.
pub fn object_distance(ccd_distance: f64, focal: f64) -> Option<f64> {
    let discriminant = ccd_distance * ccd_distance - 4.0 * ccd_distance * focal;
    if discriminant < 0.0 || !discriminant.is_finite() {
        return None;
    }
    Some((ccd_distance + discriminant.sqrt()) / 2.0)
}

/// Optics parameters for one calculation. Read fresh for every move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OpticsState {
    /// Zone plate diameter (µm)
    pub zone_plate_diameter: f64,
    /// Outermost zone width (nm)
    pub outer_zone_width: f64,
    /// Detector motor readback (mm)
    pub ccd_distance: f64,
    /// Current energy (keV)
    pub energy: f64,
}

/// Motor targets for an energy change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyPlan {
    /// Target energy (keV)
    pub energy: f64,
    /// Focal length at the current energy (mm)
    pub old_focal: f64,
    /// Focal length at the target energy (mm)
    pub new_focal: f64,
    /// Object distance before the move
    pub old_object_distance: f64,
    /// Magnification after the move
    pub magnification: f64,
    /// New zone plate working distance
    pub zone_plate_z: f64,
    /// New detector position, when magnification is held constant
    pub ccd_position: Option<f64>,
}

/// Compute motor targets for moving `optics` to `target_energy`.
///
/// Returns `None` when either geometry has no real solution.
pub fn plan_energy_move(
    optics: &OpticsState,
    target_energy: f64,
    constant_magnification: bool,
) -> Option<EnergyPlan> {
    let ccd = optics.ccd_distance;
    let old_focal = zone_plate_focal(optics.zone_plate_diameter, optics.outer_zone_width, optics.energy);
    let new_focal = zone_plate_focal(optics.zone_plate_diameter, optics.outer_zone_width, target_energy);
    let old_object_distance = object_distance(ccd, old_focal)?;
    let old_magnification = (old_object_distance - old_focal) / old_focal;

    let (zone_plate_z, ccd_position, magnification) = if constant_magnification {
        let dist = old_magnification * new_focal + new_focal;
        let working_distance = dist * new_focal / (dist - new_focal);
        (working_distance, Some(working_distance + dist), old_magnification)
    } else {
        let new_object_distance = object_distance(ccd, new_focal)?;
        let working_distance = new_object_distance * new_focal / (new_object_distance - new_focal);
        let magnification = (new_object_distance - new_focal) / new_focal;
        (working_distance, None, magnification)
    };

    if !zone_plate_z.is_finite() {
        return None;
    }

    Some(EnergyPlan {
        energy: target_energy,
        old_focal,
        new_focal,
        old_object_distance,
        magnification,
        zone_plate_z,
        ccd_position,
    })
}

/// How to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveEnergyOptions {
    /// Move the detector so the magnification stays the same
    pub constant_magnification: bool,
    /// Approach the gap target from below
    pub correct_backlash: bool,
}

impl Default for MoveEnergyOptions {
    fn default() -> Self {
        Self {
            constant_magnification: true,
            correct_backlash: true,
        }
    }
}

/// What [`EnergyPositioner::move_energy`] did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EnergyMove {
    /// Hardware moved according to the plan
    Moved(EnergyPlan),
    /// Already at the requested energy; nothing written
    AlreadyAtTarget,
    /// The optics geometry has no solution; nothing written
    Unsolvable,
    /// No beamline permit; nothing written
    PermitDenied,
}

/// Moves monochromator, undulator gap, zone plate and detector together.
pub struct EnergyPositioner<'a> {
    registry: &'a Registry,
    names: &'a DeviceNameTable,
    optics: &'a OpticsConfig,
    settle: Duration,
}

impl<'a> EnergyPositioner<'a> {
    /// Positioner over `registry`, waiting `settle` after each gap write.
    pub fn new(
        registry: &'a Registry,
        names: &'a DeviceNameTable,
        optics: &'a OpticsConfig,
        settle: Duration,
    ) -> Self {
        Self {
            registry,
            names,
            optics,
            settle,
        }
    }

    /// Current monochromator energy (keV).
    pub async fn energy(&self) -> TxmResult<f64> {
        Ok(self.registry.channel(&self.names.dcm_energy).get_f64().await?)
    }

    /// Change the beam energy to `target` keV.
    ///
    /// Out-of-range targets fail with [`TxmError::Energy`] before any device
    /// I/O. Every other refusal (already there, no permit, no geometric
    /// solution) is logged and reported through [`EnergyMove`] without
    /// writing anything.
    pub async fn move_energy(&self, target: f64, options: MoveEnergyOptions) -> TxmResult<EnergyMove> {
        if !self.optics.energy_in_range(target) {
            return Err(TxmError::Energy {
                requested: target,
                min: self.optics.energy_min,
                max: self.optics.energy_max,
            });
        }

        let operation = format!("Energy change to {target} keV");
        match self
            .registry
            .gate()
            .guard(&operation, true, || self.apply(target, options))
            .await
        {
            Gated::Ran(result) => result,
            Gated::Skipped => Ok(EnergyMove::PermitDenied),
        }
    }

    async fn apply(&self, target: f64, options: MoveEnergyOptions) -> TxmResult<EnergyMove> {
        let reg = self.registry;
        let energy = reg.channel(&self.names.dcm_energy);
        let current = energy.get_f64().await?;
        if current == target {
            // Some gap actuators fault when commanded to their current value.
            info!(energy = target, "Already at requested energy; not moving");
            return Ok(EnergyMove::AlreadyAtTarget);
        }

        let ccd = reg.channel(&self.names.ccd_motor);
        let optics = OpticsState {
            zone_plate_diameter: self.optics.zone_plate_diameter,
            outer_zone_width: self.optics.outer_zone_width,
            ccd_distance: ccd.get_f64().await?,
            energy: current,
        };
        let Some(plan) = plan_energy_move(&optics, target, options.constant_magnification) else {
            warn!(
                from = current,
                to = target,
                ccd = optics.ccd_distance,
                "No zone plate position focuses at this detector distance; energy not changed"
            );
            return Ok(EnergyMove::Unsolvable);
        };

        let dcm_mode = reg.channel(&self.names.dcm_mode);
        let old_mode = dcm_mode.get().await?;
        dcm_mode.set(1).await?;
        let moved = self.drive(&plan, target, options).await;
        if let Err(err) = dcm_mode.set(old_mode).await {
            warn!(error = %err, "Could not restore monochromator mode");
        }
        moved?;

        info!(
            energy = target,
            wavelength_nm = wavelength_nm(target),
            "Changed energy"
        );
        Ok(EnergyMove::Moved(plan))
    }

    /// Detector, zone plate, monochromator and gap writes for `plan`.
    async fn drive(&self, plan: &EnergyPlan, target: f64, options: MoveEnergyOptions) -> TxmResult<()> {
        let reg = self.registry;
        if let Some(ccd_position) = plan.ccd_position {
            debug!(magnification = plan.magnification, ccd = ccd_position, "Constant magnification");
            reg.channel(&self.names.ccd_motor).set(ccd_position).await?;
        } else {
            debug!(magnification = plan.magnification, "Variable magnification");
        }

        let zone_plate_z = reg.channel(&self.names.zone_plate_z);
        if self.optics.has_drift_correction() {
            let dz = plan.zone_plate_z - zone_plate_z.get_f64().await?;
            for (spec, coefficient) in [
                (&self.names.zone_plate_x, self.optics.zone_plate_drift_x),
                (&self.names.zone_plate_y, self.optics.zone_plate_drift_y),
            ] {
                if coefficient != 0.0 {
                    let axis = reg.channel(spec);
                    let corrected = axis.get_f64().await? + coefficient * dz;
                    debug!(channel = axis.name(), position = corrected, "Zone plate drift correction");
                    axis.set(corrected).await?;
                }
            }
        }
        debug!(position = plan.zone_plate_z, "New zone plate z-position");
        zone_plate_z.set(plan.zone_plate_z).await?;

        reg.channel(&self.names.dcm_energy).set(target).await?;
        let gap = reg.channel(&self.names.gap_energy);
        if options.correct_backlash {
            debug!("Correcting gap backlash");
            gap.set(target).await?;
            sleep(self.settle).await;
        }
        gap.set(target + self.optics.gap_offset).await?;
        sleep(self.settle).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: f64 = 1e-9;

    fn worked_example() -> OpticsState {
        OpticsState {
            zone_plate_diameter: 180.0,
            outer_zone_width: 60.0,
            ccd_distance: 3400.0,
            energy: 8.5,
        }
    }

    #[test]
    fn constant_magnification_chain() {
        let plan = plan_energy_move(&worked_example(), 8.6, true).unwrap();
        assert!((plan.old_focal - 74.03225806451613).abs() < TOLERANCE);
        assert!((plan.new_focal - 74.9032258064516).abs() < TOLERANCE);
        assert!((plan.old_object_distance - 3324.281478864007).abs() < TOLERANCE);
        assert!((plan.magnification - 43.90314851624585).abs() < TOLERANCE);
        assert!((plan.zone_plate_z - 76.60932726700482).abs() < TOLERANCE);
        let ccd = plan.ccd_position.unwrap();
        assert!((ccd - 3440.0).abs() < TOLERANCE);
    }

    #[test]
    fn variable_magnification_keeps_the_detector() {
        let plan = plan_energy_move(&worked_example(), 8.6, false).unwrap();
        assert_eq!(plan.ccd_position, None);
        assert!((plan.zone_plate_z - 76.63034639116636).abs() < TOLERANCE);
    }

    #[test]
    fn detector_too_close_has_no_solution() {
        let optics = OpticsState {
            ccd_distance: 200.0,
            ..worked_example()
        };
        assert_eq!(plan_energy_move(&optics, 8.6, true), None);
        assert_eq!(object_distance(200.0, 74.0), None);
    }

    #[test]
    fn wavelength_of_known_energy() {
        assert!((wavelength_nm(12.4) - 0.1).abs() < 1e-12);
    }
}
