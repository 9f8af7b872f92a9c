//! Scoped tracking of asynchronous writes.
//!
//! Motor moves and energy changes are slow and independent of each other.
//! Inside a write scope every channel write is issued without blocking and a
//! [`WritePromise`] is recorded instead; closing the scope is the single point
//! where the caller waits for all of them.
//!
//! # Lifecycle
//!
//! ```text
//! open() ──► Open ──(Channel::set)──► writes queued ──close()──► Draining ──► Closed
//! ```
//!
//! - Scopes nest. Opening a scope makes its queue the active one; closing it
//!   reactivates the enclosing queue.
//! - One promise per channel name: a second write to the same channel replaces
//!   the first promise (last write wins).
//! - A blocking close has no timeout. Hardware motion has no upper bound the
//!   caller knows about.
//! - A non-blocking close abandons outstanding promises; their outcome is
//!   unknown to the code that follows.
//!
//! Completion is delivered by the device client's callback through a
//! `tokio::sync::watch` channel, so draining awaits the notification rather
//! than polling a flag.
//!
//! # Example
//!
//! ```rust,ignore
//! let scope = registry.write_scope(true);
//! ccd.set(3440.0).await?;
//! zone_plate.set(76.6).await?;
//! let report = scope.close().await; // both moves acknowledged here
//! ```

use futures::future::join_all;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::device::CompletionCallback;

/// A pending acknowledgement for one write.
#[derive(Debug)]
pub struct WritePromise {
    channel: String,
    issued_at: Instant,
    done: watch::Receiver<bool>,
}

/// How a promise ended when its scope was drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Completed,
    Abandoned,
}

impl WritePromise {
    /// Create a promise for `channel` and the callback that completes it.
    pub fn issue(channel: impl Into<String>) -> (Self, CompletionCallback) {
        let (tx, rx) = watch::channel(false);
        let promise = Self {
            channel: channel.into(),
            issued_at: Instant::now(),
            done: rx,
        };
        let callback: CompletionCallback = Box::new(move || {
            tx.send_replace(true);
        });
        (promise, callback)
    }

    /// Resolved name of the channel written.
    pub fn channel_name(&self) -> &str {
        &self.channel
    }

    /// When the write was issued.
    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    /// Whether the device has acknowledged the write.
    pub fn is_complete(&self) -> bool {
        *self.done.borrow()
    }

    async fn settle(mut self) -> (String, Settled) {
        let settled = match self.done.wait_for(|complete| *complete).await {
            Ok(_) => Settled::Completed,
            // The client dropped the callback without firing it.
            Err(_) => Settled::Abandoned,
        };
        (self.channel, settled)
    }
}

#[derive(Debug)]
struct ActiveQueue {
    id: u64,
    promises: Vec<WritePromise>,
}

#[derive(Debug, Default)]
struct StackInner {
    next_id: u64,
    scopes: Vec<ActiveQueue>,
}

/// The stack of nested write scopes shared by every channel of a registry.
#[derive(Debug, Clone, Default)]
pub struct WriteQueueStack {
    inner: Arc<Mutex<StackInner>>,
}

impl WriteQueueStack {
    /// Empty stack: writes block per their own policy.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StackInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// True while at least one scope is open.
    pub fn is_active(&self) -> bool {
        !self.lock().scopes.is_empty()
    }

    /// Number of nested scopes currently open.
    pub fn depth(&self) -> usize {
        self.lock().scopes.len()
    }

    /// Open a new scope; it becomes the active queue until closed.
    pub fn open(&self, block: bool) -> WriteScope {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.scopes.push(ActiveQueue {
            id,
            promises: Vec::new(),
        });
        debug!(scope = id, depth = inner.scopes.len(), block, "Opened write scope");
        WriteScope {
            stack: self.clone(),
            id,
            block,
            closed: false,
        }
    }

    /// Record `promise` in the active queue, replacing any promise for the
    /// same channel.
    ///
    /// Returns `false` (and drops the promise) when no scope is open.
    pub fn track(&self, promise: WritePromise) -> bool {
        let mut inner = self.lock();
        let Some(active) = inner.scopes.last_mut() else {
            return false;
        };
        let before = active.promises.len();
        active
            .promises
            .retain(|p| p.channel_name() != promise.channel_name());
        if active.promises.len() != before {
            debug!(channel = promise.channel_name(), "Superseded pending write");
        }
        active.promises.push(promise);
        true
    }

    fn with_scope<R>(&self, id: u64, f: impl FnOnce(&ActiveQueue) -> R) -> Option<R> {
        self.lock().scopes.iter().find(|q| q.id == id).map(f)
    }

    fn take(&self, id: u64) -> Option<ActiveQueue> {
        let mut inner = self.lock();
        let index = inner.scopes.iter().position(|q| q.id == id)?;
        Some(inner.scopes.remove(index))
    }
}

/// Summary of a closed write scope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    /// Promises tracked when the scope closed
    pub tracked: usize,
    /// Promises acknowledged by the device
    pub completed: usize,
    /// Channels whose completion callback was dropped unfired
    pub abandoned: Vec<String>,
    /// Channels still outstanding after a non-blocking close
    pub pending: Vec<String>,
    /// Time spent draining
    pub elapsed: Duration,
}

/// An open write scope. Close it with [`WriteScope::close`].
///
/// Dropping an unclosed scope restores the enclosing queue without waiting,
/// as if closed with `block = false`.
#[derive(Debug)]
#[must_use = "a write scope must be closed to wait for its writes"]
pub struct WriteScope {
    stack: WriteQueueStack,
    id: u64,
    block: bool,
    closed: bool,
}

impl WriteScope {
    /// Whether `close` waits for every tracked write.
    pub fn is_blocking(&self) -> bool {
        self.block
    }

    /// Channel names with a tracked promise, in issue order.
    pub fn tracked(&self) -> Vec<String> {
        self.stack
            .with_scope(self.id, |q| {
                q.promises
                    .iter()
                    .map(|p| p.channel_name().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of tracked promises not yet acknowledged.
    pub fn pending(&self) -> usize {
        self.stack
            .with_scope(self.id, |q| q.promises.iter().filter(|p| !p.is_complete()).count())
            .unwrap_or(0)
    }

    /// Close the scope, waiting for every tracked write if blocking.
    pub async fn close(mut self) -> DrainReport {
        self.closed = true;
        let start = Instant::now();
        let promises = self
            .stack
            .take(self.id)
            .map(|q| q.promises)
            .unwrap_or_default();
        let tracked = promises.len();

        let report = if self.block {
            let outcomes = join_all(promises.into_iter().map(WritePromise::settle)).await;
            let mut report = DrainReport {
                tracked,
                ..Default::default()
            };
            for (channel, settled) in outcomes {
                match settled {
                    Settled::Completed => report.completed += 1,
                    Settled::Abandoned => {
                        warn!(channel = %channel, "Write completion was never reported; outcome unknown");
                        report.abandoned.push(channel);
                    }
                }
            }
            report
        } else {
            let (completed, pending): (Vec<_>, Vec<_>) =
                promises.into_iter().partition(WritePromise::is_complete);
            DrainReport {
                tracked,
                completed: completed.len(),
                pending: pending.into_iter().map(|p| p.channel).collect(),
                ..Default::default()
            }
        };

        let report = DrainReport {
            elapsed: start.elapsed(),
            ..report
        };
        debug!(
            scope = self.id,
            tracked = report.tracked,
            completed = report.completed,
            pending = report.pending.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Completed queued writes"
        );
        report
    }
}

impl Drop for WriteScope {
    fn drop(&mut self) {
        if !self.closed {
            if let Some(queue) = self.stack.take(self.id) {
                debug!(
                    scope = self.id,
                    abandoned = queue.promises.len(),
                    "Write scope dropped without close"
                );
            }
        }
    }
}
