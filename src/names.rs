//! Process-variable name tables for the 32-ID-C microscopes.
//!
//! Both instruments share the detector, writer, optics and shutter records.
//! They differ in the sample stage and the fly-scan controller, so the micro
//! table is the nano table with those entries replaced.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::channel::ChannelSpec;
use crate::device::ValueType;

// Station shutter status records
/// Status reads 0 with the beam on the station.
pub const SHUTTER_OPEN: i64 = 0;
/// Status reads 1 with the shutter closed.
pub const SHUTTER_CLOSED: i64 = 1;

// Fast shutter (shutCam FPGA)
/// Manual fast-shutter state: closed.
pub const FAST_SHUTTER_CLOSED: i64 = 0;
/// Manual fast-shutter state: open.
pub const FAST_SHUTTER_OPEN: i64 = 1;
/// Written to fire the shutter; reads back while the exposure runs.
pub const FAST_SHUTTER_TRIGGERED: i64 = 1;
/// Trigger record after the exposure finished.
pub const FAST_SHUTTER_DONE: i64 = 0;
/// Software-triggered fast shutter.
pub const FAST_SHUTTER_TRIGGER_MANUAL: i64 = 0;
/// Fast shutter fired by the rotation encoder.
pub const FAST_SHUTTER_TRIGGER_ROTATION: i64 = 1;
/// Shutter follows the manual record.
pub const FAST_SHUTTER_CONTROL_MANUAL: i64 = 0;
/// Shutter follows the FPGA.
pub const FAST_SHUTTER_CONTROL_AUTO: i64 = 1;
/// Relay drives the shutter directly.
pub const FAST_SHUTTER_RELAY_DIRECT: i64 = 0;
/// Relay synchronised with the camera.
pub const FAST_SHUTTER_RELAY_SYNCED: i64 = 1;

// File plugins
/// File plugin capturing.
pub const CAPTURE_ENABLED: i64 = 1;
/// File plugin stopped.
pub const CAPTURE_DISABLED: i64 = 0;
/// HDF5 capture readback once the file is closed.
pub const HDF_IDLE: i64 = 0;

// Detector
/// Frame tag for projections.
pub const FRAME_DATA: i64 = 0;
/// Frame tag for dark fields.
pub const FRAME_DARK: i64 = 1;
/// Frame tag for white fields.
pub const FRAME_WHITE: i64 = 2;
/// Acquire record when the camera is idle.
pub const DETECTOR_IDLE: i64 = 0;
/// Acquire record while the camera runs.
pub const DETECTOR_ACQUIRE: i64 = 1;
/// Detector state while armed and waiting for a trigger.
pub const DETECTOR_WAITING: i64 = 7;

/// Free-running camera trigger mode.
pub const TRIGGER_INTERNAL: &str = "Internal";
/// Externally triggered camera mode.
pub const TRIGGER_OVERLAPPED: &str = "Overlapped";
/// One frame per acquire.
pub const IMAGE_MODE_SINGLE: &str = "Single";
/// Multi-frame batches.
pub const IMAGE_MODE_MULTIPLE: &str = "Multiple";
/// Live view.
pub const IMAGE_MODE_CONTINUOUS: &str = "Continuous";

/// Processing-plugin filter used to average repeated frames.
pub const RECURSIVE_FILTER_TYPE: &str = "RecursiveAve";
/// Array port the HDF writer reads from while the recursive filter is active.
pub const PROC_PORT: &str = "PROC1";

/// Fly-scan controller mode outside fly scans.
pub const FLY_CONTROL_STANDARD: &str = "Standard";

const fn float(template: &'static str) -> ChannelSpec {
    ChannelSpec::new(template).typed(ValueType::Float)
}

/// Which microscope stage the runtime drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentVariant {
    /// Nano-CT TXM on the air-bearing rotation stage
    #[default]
    Nano,
    /// Front micro-CT stage
    Micro,
}

impl fmt::Display for InstrumentVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstrumentVariant::Nano => write!(f, "nano"),
            InstrumentVariant::Micro => write!(f, "micro"),
        }
    }
}

/// Every process variable the runtime touches, for one instrument variant.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceNameTable {
    // Sample stage
    /// Sample stage x
    pub sample_x: ChannelSpec,
    /// Sample stage y (vertical)
    pub sample_y: ChannelSpec,
    /// Sample stage z (along the beam)
    pub sample_z: ChannelSpec,
    /// Rotation stage angle, degrees
    pub sample_rotation: ChannelSpec,
    /// Rotation stage stop
    pub rotation_stop: ChannelSpec,

    // Optics
    /// Zone plate x
    pub zone_plate_x: ChannelSpec,
    /// Zone plate y
    pub zone_plate_y: ChannelSpec,
    /// Zone plate working distance
    pub zone_plate_z: ChannelSpec,
    /// Detector distance from the source
    pub ccd_motor: ChannelSpec,

    // Source
    /// Monochromator mode; 1 while the energy is driven from here
    pub dcm_mode: ChannelSpec,
    /// Monochromator energy, keV
    pub dcm_energy: ChannelSpec,
    /// Undulator gap energy, keV
    pub gap_energy: ChannelSpec,
    /// Undulator busy flag
    pub energy_busy: ChannelSpec,

    // Station shutters
    /// Shutter A open command
    pub shutter_a_open: ChannelSpec,
    /// Shutter A close command
    pub shutter_a_close: ChannelSpec,
    /// Front-end shutter (A) status
    pub shutter_a_status: ChannelSpec,
    /// Shutter B open command
    pub shutter_b_open: ChannelSpec,
    /// Shutter B close command
    pub shutter_b_close: ChannelSpec,
    /// Station shutter (B) status
    pub shutter_b_status: ChannelSpec,

    // Fast shutter
    /// Manual fast-shutter position
    pub fast_shutter_open: ChannelSpec,
    /// Camera delay after the shutter opens, seconds
    pub fast_shutter_delay: ChannelSpec,
    /// Fast-shutter exposure, seconds
    pub fast_shutter_exposure: ChannelSpec,
    /// Fires one fast-shutter exposure
    pub fast_shutter_trigger: ChannelSpec,
    /// Fast shutter trigger mode
    pub fast_shutter_trigger_mode: ChannelSpec,
    /// Fast shutter control
    pub fast_shutter_control: ChannelSpec,
    /// Fast shutter relay
    pub fast_shutter_relay: ChannelSpec,
    /// Encoder that fires the fast shutter
    pub fast_shutter_trigger_source: ChannelSpec,
    /// Value of the trigger source selecting this stage's rotary encoder
    pub fast_shutter_trigger_encoder: i64,

    // Fly scan controller
    /// Fly scan taxi
    pub fly_taxi: ChannelSpec,
    /// Fly scan run
    pub fly_run: ChannelSpec,
    /// Fly scan control mode
    pub fly_scan_control: ChannelSpec,
    /// Number of triggers the controller will emit
    pub fly_calc_projections: ChannelSpec,
    /// Angles recorded during the last fly scan
    pub theta_array: ChannelSpec,

    // Detector
    /// Camera image mode
    pub cam_image_mode: ChannelSpec,
    /// Camera trigger mode
    pub cam_trigger_mode: ChannelSpec,
    /// Camera software trigger
    pub cam_software_trigger: ChannelSpec,
    /// Camera acquire time
    pub cam_acquire_time: ChannelSpec,
    /// Camera acquire period
    pub cam_acquire_period: ChannelSpec,
    /// Camera array callbacks
    pub cam_array_callbacks: ChannelSpec,
    /// Camera frame-rate limiter
    pub cam_frame_rate_on_off: ChannelSpec,
    /// Data / dark / white tag stored with each frame
    pub cam_frame_type: ChannelSpec,
    /// Frames per acquire
    pub cam_num_images: ChannelSpec,
    /// Frames taken since the last acquire
    pub cam_num_images_counter: ChannelSpec,
    /// Start or stop acquisition
    pub cam_acquire: ChannelSpec,
    /// Detector state readback
    pub cam_status: ChannelSpec,
    /// Live image display callbacks
    pub cam_display: ChannelSpec,
    /// Soft-glue step-scan selector
    pub soft_glue_step: ChannelSpec,

    // HDF5 writer
    /// HDF5 writer capture
    pub hdf_capture: ChannelSpec,
    /// HDF5 capture readback; idle once the file is closed
    pub hdf_capture_rbv: ChannelSpec,
    /// HDF5 writer num capture
    pub hdf_num_capture: ChannelSpec,
    /// HDF5 writer write mode
    pub hdf_write_mode: ChannelSpec,
    /// Source port of the HDF5 writer
    pub hdf_array_port: ChannelSpec,
    /// Path of the open HDF5 file
    pub hdf_full_file_name: ChannelSpec,

    // TIFF writer
    /// TIFF writer autosave
    pub tiff_autosave: ChannelSpec,
    /// TIFF writer capture
    pub tiff_capture: ChannelSpec,
    /// TIFF writer capture readback
    pub tiff_capture_rbv: ChannelSpec,
    /// TIFF writer delete driver file
    pub tiff_delete_driver_file: ChannelSpec,
    /// TIFF writer enable callbacks
    pub tiff_enable_callbacks: ChannelSpec,
    /// TIFF writer blocking callbacks
    pub tiff_blocking_callbacks: ChannelSpec,
    /// TIFF writer num capture
    pub tiff_num_capture: ChannelSpec,
    /// TIFF writer write mode
    pub tiff_write_mode: ChannelSpec,
    /// TIFF writer file name
    pub tiff_file_name: ChannelSpec,
    /// Source port of the TIFF writer
    pub tiff_array_port: ChannelSpec,

    // Processing plugin (recursive filter)
    /// Processing plugin callbacks
    pub proc_callbacks: ChannelSpec,
    /// Source port of the processing plugin
    pub proc_array_port: ChannelSpec,
    /// Recursive filter on/off
    pub proc_filter_enable: ChannelSpec,
    /// Processing plugin filter type
    pub proc_filter_type: ChannelSpec,
    /// Frames averaged by the recursive filter
    pub proc_num_filter: ChannelSpec,
    /// Processing plugin reset filter
    pub proc_reset_filter: ChannelSpec,
    /// Processing plugin autoreset filter
    pub proc_autoreset_filter: ChannelSpec,
    /// Processing plugin filter callbacks
    pub proc_filter_callbacks: ChannelSpec,
}

impl DeviceNameTable {
    /// Nano-CT instrument.
    pub fn nano() -> Self {
        Self {
            sample_x: float("32idcTXM:mcs:c3:m7.VAL"),
            sample_y: float("32idcTXM:mxv:c1:m1.VAL"),
            sample_z: float("32idcTXM:mcs:c3:m8.VAL"),
            sample_rotation: float("32idcTXM:ens:c1:m1.VAL"),
            rotation_stop: ChannelSpec::new("32idcTXM:ens:c1:m1.STOP").no_wait(),

            zone_plate_x: float("32idcTXM:mcs:c2:m2.VAL"),
            zone_plate_y: float("32idc01:m110.VAL"),
            zone_plate_z: float("32idcTXM:mcs:c0:m2.VAL"),
            ccd_motor: float("32idcTXM:mxv:c1:m6.VAL"),

            dcm_mode: ChannelSpec::new("32ida:KohzuModeBO.VAL").permit_required(),
            dcm_energy: float("32ida:BraggEAO.VAL").permit_required(),
            gap_energy: ChannelSpec::new("32id:ID32us_energy")
                .permit_required()
                .no_wait(),
            energy_busy: ChannelSpec::new("ID32us:Busy"),

            shutter_a_open: ChannelSpec::new("32idb:rshtrA:Open").permit_required(),
            shutter_a_close: ChannelSpec::new("32idb:rshtrA:Close").permit_required(),
            shutter_a_status: ChannelSpec::new("PB:32ID:STA_A_FES_CLSD_PL"),
            shutter_b_open: ChannelSpec::new("32idb:fbShutter:Open.PROC").permit_required(),
            shutter_b_close: ChannelSpec::new("32idb:fbShutter:Close.PROC").permit_required(),
            shutter_b_status: ChannelSpec::new("PB:32ID:STA_B_SBS_CLSD_PL"),

            fast_shutter_open: ChannelSpec::new("32idcTXM:shutCam:ShutterManual"),
            fast_shutter_delay: ChannelSpec::new("32idcTXM:shutCam:tDly"),
            fast_shutter_exposure: ChannelSpec::new("32idcTXM:shutCam:tExpose"),
            fast_shutter_trigger: ChannelSpec::new("32idcTXM:shutCam:go").no_wait(),
            fast_shutter_trigger_mode: ChannelSpec::new("32idcTXM:shutCam:Triggered"),
            fast_shutter_control: ChannelSpec::new("32idcTXM:shutCam:ShutterCtrl"),
            fast_shutter_relay: ChannelSpec::new("32idcTXM:shutCam:Enable"),
            fast_shutter_trigger_source: ChannelSpec::new("32idcTXM:flyTriggerSelect"),
            fast_shutter_trigger_encoder: 1,

            fly_taxi: ChannelSpec::new("32idcTXM:PSOFly3:taxi"),
            fly_run: ChannelSpec::new("32idcTXM:PSOFly3:fly"),
            fly_scan_control: ChannelSpec::new("32idcTXM:PSOFly3:scanControl"),
            fly_calc_projections: float("32idcTXM:PSOFly3:numTriggers"),
            theta_array: ChannelSpec::new("32idcTXM:PSOFly3:motorPos.AVAL"),

            cam_image_mode: ChannelSpec::new("{ioc_prefix}cam1:ImageMode"),
            cam_trigger_mode: ChannelSpec::new("{ioc_prefix}cam1:TriggerMode"),
            cam_software_trigger: ChannelSpec::new("{ioc_prefix}cam1:SoftwareTrigger"),
            cam_acquire_time: float("{ioc_prefix}cam1:AcquireTime"),
            cam_acquire_period: float("{ioc_prefix}cam1:AcquirePeriod"),
            cam_array_callbacks: ChannelSpec::new("{ioc_prefix}cam1:ArrayCallbacks"),
            cam_frame_rate_on_off: ChannelSpec::new("{ioc_prefix}cam1:FrameRateOnOff"),
            cam_frame_type: ChannelSpec::new("{ioc_prefix}cam1:FrameType"),
            cam_num_images: ChannelSpec::new("{ioc_prefix}cam1:NumImages"),
            cam_num_images_counter: ChannelSpec::new("{ioc_prefix}cam1:NumImagesCounter_RBV")
                .typed(ValueType::Int),
            cam_acquire: ChannelSpec::new("{ioc_prefix}cam1:Acquire").no_wait(),
            cam_status: ChannelSpec::new("{ioc_prefix}cam1:DetectorState_RBV"),
            cam_display: ChannelSpec::new("{ioc_prefix}image1:EnableCallbacks"),
            soft_glue_step: ChannelSpec::new("32idcTXM:SG3:MUX2-1_SEL_Signal"),

            hdf_capture: ChannelSpec::new("{ioc_prefix}HDF1:Capture").no_wait(),
            hdf_capture_rbv: ChannelSpec::new("{ioc_prefix}HDF1:Capture_RBV"),
            hdf_num_capture: ChannelSpec::new("{ioc_prefix}HDF1:NumCapture"),
            hdf_write_mode: ChannelSpec::new("{ioc_prefix}HDF1:FileWriteMode"),
            hdf_array_port: ChannelSpec::new("{ioc_prefix}HDF1:NDArrayPort"),
            hdf_full_file_name: ChannelSpec::new("{ioc_prefix}HDF1:FullFileName_RBV")
                .typed(ValueType::Str),

            tiff_autosave: ChannelSpec::new("{ioc_prefix}TIFF1:AutoSave"),
            tiff_capture: ChannelSpec::new("{ioc_prefix}TIFF1:Capture").no_wait(),
            tiff_capture_rbv: ChannelSpec::new("{ioc_prefix}TIFF1:Capture_RBV"),
            tiff_delete_driver_file: ChannelSpec::new("{ioc_prefix}TIFF1:DeleteDriverFile"),
            tiff_enable_callbacks: ChannelSpec::new("{ioc_prefix}TIFF1:EnableCallbacks"),
            tiff_blocking_callbacks: ChannelSpec::new("{ioc_prefix}TIFF1:BlockingCallbacks"),
            tiff_num_capture: ChannelSpec::new("{ioc_prefix}TIFF1:NumCapture"),
            tiff_write_mode: ChannelSpec::new("{ioc_prefix}TIFF1:FileWriteMode"),
            tiff_file_name: ChannelSpec::new("{ioc_prefix}TIFF1:FileName").typed(ValueType::Str),
            tiff_array_port: ChannelSpec::new("{ioc_prefix}TIFF1:NDArrayPort"),

            proc_callbacks: ChannelSpec::new("{ioc_prefix}Proc1:EnableCallbacks"),
            proc_array_port: ChannelSpec::new("{ioc_prefix}Proc1:NDArrayPort"),
            proc_filter_enable: ChannelSpec::new("{ioc_prefix}Proc1:EnableFilter"),
            proc_filter_type: ChannelSpec::new("{ioc_prefix}Proc1:FilterType"),
            proc_num_filter: ChannelSpec::new("{ioc_prefix}Proc1:NumFilter"),
            proc_reset_filter: ChannelSpec::new("{ioc_prefix}Proc1:ResetFilter"),
            proc_autoreset_filter: ChannelSpec::new("{ioc_prefix}Proc1:AutoResetFilter"),
            proc_filter_callbacks: ChannelSpec::new("{ioc_prefix}Proc1:FilterCallbacks"),
        }
    }

    /// Micro-CT instrument: SmarAct XZ on the Hydra rotation stage, eFly
    /// fly-scan records.
    pub fn micro() -> Self {
        Self {
            sample_x: float("32idcTXM:mcs:c1:m2.VAL"),
            sample_y: float("32idc02:m15.VAL"),
            sample_z: float("32idcTXM:mcs:c1:m1.VAL"),
            sample_rotation: float("32idcTXM:hydra:c0:m1.VAL"),
            rotation_stop: ChannelSpec::new("32idcTXM:hydra:c0:m1.STOP").no_wait(),
            fast_shutter_trigger_encoder: 0,
            fly_taxi: ChannelSpec::new("32idcTXM:eFly:taxi"),
            fly_run: ChannelSpec::new("32idcTXM:eFly:fly"),
            fly_scan_control: ChannelSpec::new("32idcTXM:eFly:scanControl"),
            fly_calc_projections: float("32idcTXM:eFly:calcNumTriggers"),
            theta_array: ChannelSpec::new("32idcTXM:eFly:motorPos.AVAL"),
            ..Self::nano()
        }
    }

    /// Table for `variant`.
    pub fn for_variant(variant: InstrumentVariant) -> Self {
        match variant {
            InstrumentVariant::Nano => Self::nano(),
            InstrumentVariant::Micro => Self::micro(),
        }
    }
}
