//! Named, typed handles to device values.
//!
//! A [`ChannelSpec`] is the static description of one process variable: its
//! name template, declared type, and write policy. A [`Registry`] resolves
//! specs against the instrument's IOC prefix and hands out one shared
//! [`Channel`] per resolved name, so repeated lookups of the same PV reuse the
//! same handle and cache.
//!
//! All device I/O is explicit: [`Channel::get`] reads, [`Channel::set`]
//! writes. Writes are routed through the registry's [`PermitGate`] and, while
//! a write scope is open, through the [`WriteQueueStack`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::device::{DeviceClient, PvValue, ValueType};
use crate::error::ChannelError;
use crate::permit::{Gated, PermitGate, PermitState};
use crate::queue::{WritePromise, WriteQueueStack, WriteScope};
use crate::wait::{self, Timeout};

/// Placeholder substituted with the IOC prefix when a spec is resolved.
pub const IOC_PREFIX_PLACEHOLDER: &str = "{ioc_prefix}";

/// Static description of one process variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSpec {
    /// Name, possibly containing `{ioc_prefix}`
    pub template: &'static str,
    /// Type reads are coerced to; `None` keeps the raw value
    pub value_type: Option<ValueType>,
    /// Writes need the beamline permit
    pub requires_permit: bool,
    /// Default blocking policy for writes outside a write scope
    pub wait: bool,
}

impl ChannelSpec {
    /// Untyped, ungated, blocking channel.
    pub const fn new(template: &'static str) -> Self {
        Self {
            template,
            value_type: None,
            requires_permit: false,
            wait: true,
        }
    }

    /// Coerce reads to `value_type`.
    pub const fn typed(self, value_type: ValueType) -> Self {
        Self {
            value_type: Some(value_type),
            ..self
        }
    }

    /// Gate writes behind the beamline permit.
    pub const fn permit_required(self) -> Self {
        Self {
            requires_permit: true,
            ..self
        }
    }

    /// Never block on writes outside a write scope.
    pub const fn no_wait(self) -> Self {
        Self { wait: false, ..self }
    }

    /// Wire name of this channel for the given IOC prefix.
    pub fn resolve(&self, ioc_prefix: &str) -> String {
        self.template.replace(IOC_PREFIX_PLACEHOLDER, ioc_prefix)
    }
}

/// What happened to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// Sent; acknowledged if the write was blocking
    Written,
    /// Sent with `wait = true` but the device never acknowledged it
    Unacknowledged,
    /// Sent without blocking; completion is tracked by the open write scope
    Queued,
    /// Not sent: the channel needs the beamline permit
    PermitDenied,
}

impl SetOutcome {
    /// True when the value reached the device.
    pub fn was_sent(self) -> bool {
        !matches!(self, SetOutcome::PermitDenied)
    }
}

/// Handle to one process variable.
///
/// # Thread Safety
/// Channels are shared through `Arc`; the value cache is behind a mutex that
/// is never held across an await.
pub struct Channel {
    name: String,
    value_type: Option<ValueType>,
    requires_permit: bool,
    blocking: bool,
    cache: Mutex<Option<PvValue>>,
    client: Arc<dyn DeviceClient>,
    gate: PermitGate,
    queues: WriteQueueStack,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("value_type", &self.value_type)
            .field("requires_permit", &self.requires_permit)
            .field("blocking", &self.blocking)
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Resolved wire name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether writes need the beamline permit.
    pub fn requires_permit(&self) -> bool {
        self.requires_permit
    }

    fn cache(&self) -> MutexGuard<'_, Option<PvValue>> {
        self.cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Last value read from or written to this channel, without device I/O.
    pub fn cached(&self) -> Option<PvValue> {
        self.cache().clone()
    }

    /// Read the device and coerce to the declared type.
    ///
    /// A value that cannot be coerced is logged and returned raw.
    pub async fn get(&self) -> Result<PvValue, ChannelError> {
        let raw = self.client.get(&self.name).await?;
        let value = match self.value_type {
            Some(value_type) => value_type.coerce(&raw).unwrap_or_else(|| {
                warn!(
                    channel = %self.name,
                    value = %raw,
                    "Could not cast value to {value_type:?}"
                );
                raw
            }),
            None => raw,
        };
        *self.cache() = Some(value.clone());
        Ok(value)
    }

    /// Read the device as a float.
    pub async fn get_f64(&self) -> Result<f64, ChannelError> {
        let value = self.get().await?;
        value.as_f64().ok_or_else(|| ChannelError::NotNumeric {
            channel: self.name.clone(),
            value,
        })
    }

    /// Read the device as a string; numbers are formatted.
    pub async fn get_string(&self) -> Result<String, ChannelError> {
        Ok(match self.get().await? {
            PvValue::Str(s) => s,
            other => other.to_string(),
        })
    }

    /// Write using the channel's default blocking policy.
    pub async fn set(&self, value: impl Into<PvValue>) -> Result<SetOutcome, ChannelError> {
        self.set_with(value, self.blocking).await
    }

    /// Write, blocking for acknowledgement when `wait` is true.
    ///
    /// Inside a write scope the write never blocks and a promise is tracked
    /// instead. Permit-gated channels without a permit skip the write and
    /// return [`SetOutcome::PermitDenied`].
    pub async fn set_with(
        &self,
        value: impl Into<PvValue>,
        wait: bool,
    ) -> Result<SetOutcome, ChannelError> {
        let value = value.into();
        let operation = format!("Write {} = {}", self.name, value);
        match self
            .gate
            .guard(&operation, self.requires_permit, || self.write(value, wait))
            .await
        {
            Gated::Ran(outcome) => outcome,
            Gated::Skipped => Ok(SetOutcome::PermitDenied),
        }
    }

    async fn write(&self, value: PvValue, wait: bool) -> Result<SetOutcome, ChannelError> {
        debug!(channel = %self.name, value = %value, "Setting PV value");

        if self.queues.is_active() {
            let (promise, on_complete) = WritePromise::issue(self.name.clone());
            self.client
                .put_with_callback(&self.name, value.clone(), on_complete)
                .await?;
            *self.cache() = Some(value);
            self.queues.track(promise);
            return Ok(SetOutcome::Queued);
        }

        let acknowledged = self.client.put(&self.name, value.clone(), wait).await?;
        *self.cache() = Some(value);
        if wait && !acknowledged {
            error!(channel = %self.name, "Write was not acknowledged by the IOC");
            return Ok(SetOutcome::Unacknowledged);
        }
        Ok(SetOutcome::Written)
    }
}

/// Process-wide table of channels, keyed by resolved name.
///
/// One registry per instrument. Tests build their own around a mock client.
pub struct Registry {
    client: Arc<dyn DeviceClient>,
    gate: PermitGate,
    queues: WriteQueueStack,
    ioc_prefix: String,
    poll_interval: Duration,
    channels: Mutex<HashMap<String, Arc<Channel>>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("ioc_prefix", &self.ioc_prefix)
            .field("permit", &self.gate.state())
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Default interval between polls of a channel.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

    /// Empty registry over `client`, gated by `permit`.
    pub fn new(client: Arc<dyn DeviceClient>, permit: PermitState, ioc_prefix: impl Into<String>) -> Self {
        Self {
            client,
            gate: PermitGate::new(permit),
            queues: WriteQueueStack::new(),
            ioc_prefix: ioc_prefix.into(),
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Override the poll interval used by [`Registry::wait_until`].
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Permit gate shared by every channel.
    pub fn gate(&self) -> PermitGate {
        self.gate
    }

    /// Substituted for `{ioc_prefix}` in channel templates.
    pub fn ioc_prefix(&self) -> &str {
        &self.ioc_prefix
    }

    /// Interval between reads in [`Registry::wait_until`].
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Shared handle for `spec`, created on first use.
    ///
    /// The first spec registered under a resolved name decides the channel's
    /// type and write policy.
    pub fn channel(&self, spec: &ChannelSpec) -> Arc<Channel> {
        let name = spec.resolve(&self.ioc_prefix);
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        channels
            .entry(name.clone())
            .or_insert_with(|| {
                Arc::new(Channel {
                    name,
                    value_type: spec.value_type,
                    requires_permit: spec.requires_permit,
                    blocking: spec.wait,
                    cache: Mutex::new(None),
                    client: Arc::clone(&self.client),
                    gate: self.gate,
                    queues: self.queues.clone(),
                })
            })
            .clone()
    }

    /// Number of distinct channels created so far.
    pub fn len(&self) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// No channel created yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open a write scope shared by every channel of this registry.
    pub fn write_scope(&self, block: bool) -> WriteScope {
        self.queues.open(block)
    }

    /// Poll the channel for `spec` until it equals `target`.
    ///
    /// See [`wait::wait_until`].
    pub async fn wait_until(
        &self,
        spec: &ChannelSpec,
        target: impl Into<PvValue>,
        timeout: Timeout,
    ) -> bool {
        let channel = self.channel(spec);
        wait::wait_until(&channel, target, timeout, self.poll_interval).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockDeviceClient;
    use tracing_test::traced_test;

    const DCM_ENERGY: ChannelSpec = ChannelSpec::new("32ida:BraggEAO.VAL")
        .typed(ValueType::Float)
        .permit_required();
    const ACQUIRE: ChannelSpec = ChannelSpec::new("{ioc_prefix}cam1:Acquire").no_wait();

    fn registry(mock: &MockDeviceClient, permit: PermitState) -> Registry {
        Registry::new(Arc::new(mock.clone()), permit, "32idcPG3:")
    }

    #[test]
    fn spec_resolves_the_prefix() {
        assert_eq!(ACQUIRE.resolve("32idcPG3:"), "32idcPG3:cam1:Acquire");
        assert_eq!(DCM_ENERGY.resolve("ignored:"), "32ida:BraggEAO.VAL");
        assert!(!ACQUIRE.wait);
        assert!(DCM_ENERGY.requires_permit);
    }

    #[test]
    fn registry_reuses_channels_by_resolved_name() {
        let mock = MockDeviceClient::new();
        let reg = registry(&mock, PermitState::granted());
        let a = reg.channel(&ACQUIRE);
        let b = reg.channel(&ChannelSpec::new("32idcPG3:cam1:Acquire"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn get_coerces_and_caches() {
        let mock = MockDeviceClient::with_values([("32ida:BraggEAO.VAL", "8.5")]);
        let reg = registry(&mock, PermitState::granted());
        let energy = reg.channel(&DCM_ENERGY);
        assert_eq!(energy.cached(), None);
        assert_eq!(energy.get().await.unwrap(), PvValue::Float(8.5));
        assert_eq!(energy.cached(), Some(PvValue::Float(8.5)));
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_coercion_returns_raw_value() {
        let mock = MockDeviceClient::with_values([("32ida:BraggEAO.VAL", "moving")]);
        let reg = registry(&mock, PermitState::granted());
        let energy = reg.channel(&DCM_ENERGY);
        assert_eq!(energy.get().await.unwrap(), PvValue::Str("moving".into()));
        assert!(logs_contain("Could not cast value"));
        assert!(matches!(
            energy.get_f64().await,
            Err(ChannelError::NotNumeric { .. })
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn permit_gated_write_never_reaches_the_device() {
        let mock = MockDeviceClient::with_values([("32ida:BraggEAO.VAL", 8.5)]);
        let reg = registry(&mock, PermitState::denied());
        let outcome = reg.channel(&DCM_ENERGY).set(9.0).await.unwrap();
        assert_eq!(outcome, SetOutcome::PermitDenied);
        assert!(mock.writes().is_empty());
        assert!(logs_contain("beamline permit not granted"));
    }

    #[tokio::test]
    #[traced_test]
    async fn unacknowledged_blocking_write_is_reported() {
        let mock = MockDeviceClient::new();
        mock.never_acknowledge("32ida:BraggEAO.VAL");
        let reg = registry(&mock, PermitState::granted());
        let energy = reg.channel(&DCM_ENERGY);
        assert_eq!(energy.set(9.0).await.unwrap(), SetOutcome::Unacknowledged);
        // Non-blocking writes do not wait for an acknowledgement.
        assert_eq!(energy.set_with(9.1, false).await.unwrap(), SetOutcome::Written);
        assert!(logs_contain("not acknowledged"));
    }

    #[tokio::test]
    async fn writes_inside_a_scope_are_queued() {
        let mock = MockDeviceClient::new();
        mock.withhold_completion("32idcPG3:cam1:Acquire");
        let reg = registry(&mock, PermitState::granted());
        let acquire = reg.channel(&ACQUIRE);

        let scope = reg.write_scope(true);
        assert_eq!(acquire.set(1).await.unwrap(), SetOutcome::Queued);
        assert_eq!(acquire.set(0).await.unwrap(), SetOutcome::Queued);
        assert_eq!(scope.tracked(), vec!["32idcPG3:cam1:Acquire".to_string()]);
        assert_eq!(mock.release_completions(), 2);
        let report = scope.close().await;
        assert_eq!(report.tracked, 1);
        assert_eq!(report.completed, 1);
        assert!(mock.writes().iter().all(|w| w.with_callback));
    }

    #[tokio::test]
    async fn communication_failure_is_a_channel_error() {
        let mock = MockDeviceClient::new();
        mock.fail_on("32idcPG3:cam1:Acquire");
        let reg = registry(&mock, PermitState::granted());
        let err = reg.channel(&ACQUIRE).set(1).await.unwrap_err();
        assert_eq!(err.channel(), "32idcPG3:cam1:Acquire");
    }
}
