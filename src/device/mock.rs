//! Mock Device Client
//!
//! Provides an in-memory process-variable store for testing without the
//! beamline. All operations are async-safe (tokio::time::sleep, not
//! std::thread::sleep) and the internal lock is never held across an await.
//!
//! # Features
//!
//! - Records every put (blocking and callback) in issue order
//! - Per-PV reactions, e.g. "writing the software trigger bumps the image counter"
//! - Injected communication failures per PV, or per PV and written value
//! - Unacknowledged blocking puts
//! - Delayed, withheld or dropped completion callbacks
//!
//! `MockDeviceClient::beamline` seeds a whole instrument with nominal values
//! and the reactions a real IOC would show (shutter status follows the
//! open/close commands, the detector counts software triggers, ...).

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::{sleep, Duration};

use super::{CompletionCallback, DeviceClient, PvValue};
use crate::error::ChannelError;
use crate::names::{self, DeviceNameTable};

/// Side effect run after a put lands in the store.
pub type Reaction = Arc<dyn Fn(&PvValue, &mut HashMap<String, PvValue>) + Send + Sync>;

/// One recorded put.
#[derive(Debug, Clone, PartialEq)]
pub struct PutRecord {
    /// Resolved PV name
    pub name: String,
    /// Value written
    pub value: PvValue,
    /// True when issued through `put_with_callback`
    pub with_callback: bool,
}

#[derive(Default)]
struct MockState {
    values: HashMap<String, PvValue>,
    writes: Vec<PutRecord>,
    reactions: HashMap<String, Vec<Reaction>>,
    failing: HashSet<String>,
    rejected: Vec<(String, PvValue)>,
    unacknowledged: HashSet<String>,
    withheld: HashSet<String>,
    dropped: HashSet<String>,
    held_callbacks: Vec<(String, CompletionCallback)>,
    completion_delay: Duration,
    reads: usize,
}

/// In-memory device client.
///
/// Cloning shares the underlying store, so a test can keep a handle for
/// inspection while the registry owns another.
#[derive(Clone, Default)]
pub struct MockDeviceClient {
    state: Arc<Mutex<MockState>>,
}

impl MockDeviceClient {
    /// Create an empty store. Reading an unseeded PV reports it disconnected.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with `values`.
    pub fn with_values<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<PvValue>,
    {
        let client = Self::new();
        for (name, value) in values {
            client.set_value(name, value);
        }
        client
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A poisoned lock only means a reaction panicked inside a test; the
        // store itself is still consistent.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Overwrite a PV without recording a put (simulates the IOC changing it).
    pub fn set_value(&self, name: impl Into<String>, value: impl Into<PvValue>) {
        self.lock().values.insert(name.into(), value.into());
    }

    /// Current stored value of a PV.
    pub fn value(&self, name: &str) -> Option<PvValue> {
        self.lock().values.get(name).cloned()
    }

    /// Register a reaction run after every put to `name`.
    pub fn on_put<F>(&self, name: impl Into<String>, reaction: F)
    where
        F: Fn(&PvValue, &mut HashMap<String, PvValue>) + Send + Sync + 'static,
    {
        self.lock()
            .reactions
            .entry(name.into())
            .or_default()
            .push(Arc::new(reaction));
    }

    /// Make every get/put on `name` fail with a communication error.
    pub fn fail_on(&self, name: impl Into<String>) {
        self.lock().failing.insert(name.into());
    }

    /// Make puts of `value` to `name` fail; other values and gets succeed.
    pub fn reject_put(&self, name: impl Into<String>, value: impl Into<PvValue>) {
        self.lock().rejected.push((name.into(), value.into()));
    }

    /// Stop failing `name`.
    pub fn heal(&self, name: &str) {
        self.lock().failing.remove(name);
    }

    /// Blocking puts to `name` are applied but report no acknowledgement.
    pub fn never_acknowledge(&self, name: impl Into<String>) {
        self.lock().unacknowledged.insert(name.into());
    }

    /// Keep completion callbacks for `name` until [`Self::release_completions`].
    pub fn withhold_completion(&self, name: impl Into<String>) {
        self.lock().withheld.insert(name.into());
    }

    /// Drop completion callbacks for `name` without firing them.
    pub fn drop_completion(&self, name: impl Into<String>) {
        self.lock().dropped.insert(name.into());
    }

    /// Fire completion callbacks after `delay` instead of immediately.
    pub fn set_completion_delay(&self, delay: Duration) {
        self.lock().completion_delay = delay;
    }

    /// Fire every withheld completion callback. Returns how many fired.
    pub fn release_completions(&self) -> usize {
        let held = {
            let mut state = self.lock();
            state.withheld.clear();
            std::mem::take(&mut state.held_callbacks)
        };
        let count = held.len();
        for (_, callback) in held {
            callback();
        }
        count
    }

    /// Every put issued so far, in order.
    pub fn writes(&self) -> Vec<PutRecord> {
        self.lock().writes.clone()
    }

    /// Puts issued to `name`, in order.
    pub fn writes_to(&self, name: &str) -> Vec<PvValue> {
        self.lock()
            .writes
            .iter()
            .filter(|w| w.name == name)
            .map(|w| w.value.clone())
            .collect()
    }

    /// Number of gets served so far.
    pub fn read_count(&self) -> usize {
        self.lock().reads
    }

    /// Forget recorded puts and the read count (stored values are kept).
    pub fn clear_history(&self) {
        let mut state = self.lock();
        state.writes.clear();
        state.reads = 0;
    }

    fn apply_put(&self, name: &str, value: PvValue, with_callback: bool) -> Result<(), ChannelError> {
        let mut state = self.lock();
        let rejected = state
            .rejected
            .iter()
            .any(|(pv, refused)| pv == name && *refused == value);
        if state.failing.contains(name) || rejected {
            return Err(ChannelError::Communication {
                channel: name.to_string(),
                reason: "injected failure".into(),
            });
        }
        state.writes.push(PutRecord {
            name: name.to_string(),
            value: value.clone(),
            with_callback,
        });
        state.values.insert(name.to_string(), value.clone());
        let reactions = state.reactions.get(name).cloned().unwrap_or_default();
        for reaction in reactions {
            reaction(&value, &mut state.values);
        }
        Ok(())
    }

    /// Seed a whole instrument with nominal values and IOC-like reactions.
    ///
    /// Sample at the origin, 8.5 keV, detector at 3400 mm, shutters closed,
    /// detector idle, HDF writer idle.
    pub fn beamline(table: &DeviceNameTable, ioc_prefix: &str) -> Self {
        let client = Self::new();
        let name = |spec: &crate::channel::ChannelSpec| spec.resolve(ioc_prefix);

        let floats = [
            (&table.sample_x, 0.0),
            (&table.sample_y, 0.0),
            (&table.sample_z, 0.0),
            (&table.sample_rotation, 0.0),
            (&table.zone_plate_x, 0.0),
            (&table.zone_plate_y, 0.0),
            (&table.zone_plate_z, 74.7),
            (&table.ccd_motor, 3400.0),
            (&table.dcm_energy, 8.5),
            (&table.gap_energy, 8.67),
            (&table.cam_acquire_time, 0.5),
            (&table.cam_acquire_period, 0.5),
            (&table.fast_shutter_exposure, 0.5),
            (&table.fast_shutter_delay, 0.02),
            (&table.fly_calc_projections, 0.0),
        ];
        for (spec, value) in floats {
            client.set_value(name(spec), value);
        }

        let ints = [
            (&table.dcm_mode, 0),
            (&table.energy_busy, 0),
            (&table.shutter_a_status, names::SHUTTER_CLOSED),
            (&table.shutter_b_status, names::SHUTTER_CLOSED),
            (&table.cam_acquire, names::DETECTOR_IDLE),
            (&table.cam_status, names::DETECTOR_IDLE),
            (&table.cam_num_images, 1),
            (&table.cam_num_images_counter, 0),
            (&table.cam_frame_type, names::FRAME_DATA),
            (&table.cam_display, 1),
            (&table.hdf_capture, names::CAPTURE_DISABLED),
            (&table.hdf_capture_rbv, names::HDF_IDLE),
            (&table.fast_shutter_trigger_source, table.fast_shutter_trigger_encoder),
            (&table.hdf_num_capture, 0),
            (&table.tiff_capture, names::CAPTURE_DISABLED),
            (&table.tiff_capture_rbv, names::CAPTURE_DISABLED),
            (&table.tiff_num_capture, 0),
            (&table.fast_shutter_open, names::FAST_SHUTTER_OPEN),
            (&table.fast_shutter_trigger, names::FAST_SHUTTER_DONE),
            (&table.fast_shutter_trigger_mode, names::FAST_SHUTTER_TRIGGER_ROTATION),
            (&table.fast_shutter_control, names::FAST_SHUTTER_CONTROL_MANUAL),
            (&table.fast_shutter_relay, names::FAST_SHUTTER_RELAY_DIRECT),
            (&table.fly_run, 0),
            (&table.fly_taxi, 0),
            (&table.rotation_stop, 0),
        ];
        for (spec, value) in ints {
            client.set_value(name(spec), value);
        }

        let strings = [
            (&table.cam_trigger_mode, "Internal"),
            (&table.cam_image_mode, "Continuous"),
            (&table.proc_array_port, "CAM1"),
            (&table.hdf_array_port, "CAM1"),
            (&table.proc_filter_enable, "Disable"),
            (&table.fly_scan_control, "Standard"),
            (&table.hdf_full_file_name, "/local/data/txm_scan_0001.h5"),
            (&table.tiff_autosave, "No"),
            (&table.tiff_array_port, "CAM1"),
            (&table.tiff_file_name, ""),
        ];
        for (spec, value) in strings {
            client.set_value(name(spec), value);
        }
        client.set_value(name(&table.theta_array), Vec::<f64>::new());

        // Shutter status records follow the open/close commands.
        let status_a = name(&table.shutter_a_status);
        let status_b = name(&table.shutter_b_status);
        for (cmd, status, target) in [
            (&table.shutter_a_open, status_a.clone(), names::SHUTTER_OPEN),
            (&table.shutter_a_close, status_a, names::SHUTTER_CLOSED),
            (&table.shutter_b_open, status_b.clone(), names::SHUTTER_OPEN),
            (&table.shutter_b_close, status_b, names::SHUTTER_CLOSED),
        ] {
            client.on_put(name(cmd), move |_, values| {
                values.insert(status.clone(), PvValue::from(target));
            });
        }

        // Acquire follows the camera's trigger and image modes: externally
        // triggered acquisitions wait for a trigger, continuous ones keep
        // running, single and multiple acquisitions complete at once.
        let status = name(&table.cam_status);
        let acquire = name(&table.cam_acquire);
        let image_mode = name(&table.cam_image_mode);
        let trigger_mode = name(&table.cam_trigger_mode);
        client.on_put(acquire.clone(), move |value, values| {
            let text = |key: &String| values.get(key).and_then(|v| v.as_str().map(str::to_string));
            let continuous = text(&image_mode).as_deref() == Some(names::IMAGE_MODE_CONTINUOUS);
            let external = text(&trigger_mode).is_some_and(|m| m != names::TRIGGER_INTERNAL);
            let next = if value.as_i64() != Some(names::DETECTOR_ACQUIRE) {
                names::DETECTOR_IDLE
            } else if external {
                names::DETECTOR_WAITING
            } else if continuous {
                names::DETECTOR_ACQUIRE
            } else {
                values.insert(acquire.clone(), PvValue::from(names::DETECTOR_IDLE));
                names::DETECTOR_IDLE
            };
            values.insert(status.clone(), PvValue::from(next));
        });

        // A software trigger exposes one frame; in single mode the
        // acquisition is then over.
        let counter = name(&table.cam_num_images_counter);
        let status = name(&table.cam_status);
        let acquire = name(&table.cam_acquire);
        let image_mode = name(&table.cam_image_mode);
        client.on_put(name(&table.cam_software_trigger), move |_, values| {
            let next = values.get(&counter).and_then(PvValue::as_i64).unwrap_or(0) + 1;
            values.insert(counter.clone(), PvValue::Int(next));
            let single = values
                .get(&image_mode)
                .and_then(|v| v.as_str().map(|m| m == names::IMAGE_MODE_SINGLE))
                .unwrap_or(false);
            if single {
                values.insert(status.clone(), PvValue::from(names::DETECTOR_IDLE));
                values.insert(acquire.clone(), PvValue::from(names::DETECTOR_IDLE));
            }
        });

        let tiff_rbv = name(&table.tiff_capture_rbv);
        client.on_put(name(&table.tiff_capture), move |value, values| {
            values.insert(tiff_rbv.clone(), value.clone());
        });

        let fast = name(&table.fast_shutter_trigger);
        client.on_put(fast.clone(), move |_, values| {
            values.insert(fast.clone(), PvValue::from(names::FAST_SHUTTER_DONE));
        });

        client.clear_history();
        client
    }
}

#[async_trait]
impl DeviceClient for MockDeviceClient {
    async fn get(&self, name: &str) -> Result<PvValue, ChannelError> {
        let mut state = self.lock();
        state.reads += 1;
        if state.failing.contains(name) {
            return Err(ChannelError::Communication {
                channel: name.to_string(),
                reason: "injected failure".into(),
            });
        }
        state
            .values
            .get(name)
            .cloned()
            .ok_or_else(|| ChannelError::Disconnected {
                channel: name.to_string(),
            })
    }

    async fn put(&self, name: &str, value: PvValue, wait: bool) -> Result<bool, ChannelError> {
        self.apply_put(name, value, false)?;
        let acknowledged = !self.lock().unacknowledged.contains(name);
        Ok(!wait || acknowledged)
    }

    async fn put_with_callback(
        &self,
        name: &str,
        value: PvValue,
        on_complete: CompletionCallback,
    ) -> Result<(), ChannelError> {
        self.apply_put(name, value, true)?;
        let delay = {
            let mut state = self.lock();
            if state.dropped.contains(name) {
                return Ok(());
            }
            if state.withheld.contains(name) {
                state.held_callbacks.push((name.to_string(), on_complete));
                return Ok(());
            }
            state.completion_delay
        };
        if delay.is_zero() {
            on_complete();
        } else {
            // Completion arrives from the client's own background task.
            tokio::spawn(async move {
                sleep(delay).await;
                on_complete();
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn put_records_and_stores() {
        let client = MockDeviceClient::new();
        assert!(client.put("a", PvValue::Int(3), true).await.unwrap());
        assert_eq!(client.get("a").await.unwrap(), PvValue::Int(3));
        assert_eq!(client.writes_to("a"), vec![PvValue::Int(3)]);
    }

    #[tokio::test]
    async fn unseeded_pv_is_disconnected() {
        let client = MockDeviceClient::new();
        let err = client.get("missing").await.unwrap_err();
        assert_eq!(
            err,
            ChannelError::Disconnected {
                channel: "missing".into()
            }
        );
    }

    #[tokio::test]
    async fn reactions_see_the_store() {
        let client = MockDeviceClient::with_values([("counter", 0)]);
        client.on_put("trigger", |_, values| {
            let n = values.get("counter").and_then(PvValue::as_i64).unwrap_or(0);
            values.insert("counter".into(), PvValue::Int(n + 1));
        });
        client.put("trigger", PvValue::Int(1), false).await.unwrap();
        client.put("trigger", PvValue::Int(1), false).await.unwrap();
        assert_eq!(client.value("counter"), Some(PvValue::Int(2)));
    }

    #[tokio::test]
    async fn withheld_callbacks_fire_on_release() {
        let client = MockDeviceClient::new();
        client.withhold_completion("motor");
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        client
            .put_with_callback(
                "motor",
                PvValue::Float(1.0),
                Box::new(move || flag.store(true, Ordering::SeqCst)),
            )
            .await
            .unwrap();
        assert!(!fired.load(Ordering::SeqCst));
        assert_eq!(client.release_completions(), 1);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn injected_failure_blocks_the_write() {
        let client = MockDeviceClient::new();
        client.fail_on("bad");
        assert!(client.put("bad", PvValue::Int(1), true).await.is_err());
        assert!(client.writes().is_empty());
        client.heal("bad");
        assert!(client.put("bad", PvValue::Int(1), true).await.is_ok());
    }
}
