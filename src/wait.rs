//! Poll a channel until it reaches a target value.
//!
//! Timeouts are advisory: giving up stops the caller from waiting, it does
//! not stop the hardware. A `false` return means "state unknown", never
//! "operation failed".

use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::device::PvValue;
use crate::error::TxmError;

/// How long [`wait_until`] may poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Give up once this much time has passed since the call
    After(Duration),
    /// Poll until the value matches
    Forever,
}

impl Timeout {
    /// Seconds, with any negative value meaning [`Timeout::Forever`].
    pub fn from_secs_f64(secs: f64) -> Self {
        if secs < 0.0 || !secs.is_finite() {
            Timeout::Forever
        } else {
            Timeout::After(Duration::from_secs_f64(secs))
        }
    }

    fn expired(self, elapsed: Duration) -> bool {
        match self {
            Timeout::After(limit) => elapsed >= limit,
            Timeout::Forever => false,
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Timeout::After(d)
    }
}

/// Wait until `channel` reads `target`.
///
/// Sleeps one `poll_interval` first so the device can begin reacting, then
/// reads and compares, sleeping `poll_interval` between attempts. Returns
/// `true` on match. On timeout a warning naming the channel, target and
/// elapsed time is logged and `false` is returned. Read failures count as a
/// mismatch; the first one is logged.
pub async fn wait_until(
    channel: &Channel,
    target: impl Into<PvValue>,
    timeout: Timeout,
    poll_interval: Duration,
) -> bool {
    let target = target.into();
    let start = Instant::now();
    debug!(channel = channel.name(), target = %target, ?timeout, "Waiting for PV");

    sleep(poll_interval).await;
    let mut reported_error = false;
    loop {
        match channel.get().await {
            Ok(value) if value == target => {
                debug!(
                    channel = channel.name(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Ended wait"
                );
                return true;
            }
            Ok(_) => {}
            Err(err) if !reported_error => {
                warn!(channel = channel.name(), error = %err, "Read failed while waiting");
                reported_error = true;
            }
            Err(_) => {}
        }

        let elapsed = start.elapsed();
        if timeout.expired(elapsed) {
            let advisory = TxmError::WaitTimeout {
                channel: channel.name().to_string(),
                target,
                elapsed,
            };
            warn!(
                channel = channel.name(),
                elapsed_ms = elapsed.as_millis() as u64,
                "{advisory}"
            );
            return false;
        }
        sleep(poll_interval).await;
    }
}
