//! Force releases the oldest buffered window once it has been idle for the configured timeout,
//! so that a stalled input (or a stalled partition holding the watermark back) cannot keep a
//! window buffered forever.
//!
//! Exactly one entry is ever pending in the delay queue. It is either the oldest buffered
//! window or an empty sentinel when nothing is buffered, so the loop always has something to
//! wait on. Only the watchdog touches its queue, the window service merely wakes it up through
//! a [Notify] whenever the buffered windows change.
//!
//! [Notify]: tokio::sync::Notify

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tracing::{debug, error, info, warn};

use crate::lifecycle::WindowLifecycle;
use crate::window::{ReleaseTrigger, TumblingWindowService};
use crate::{Error, Result};

/// Time given to the watchdog to finish an in-flight release on shutdown.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(1);

pub struct IdleWindowWatchdog<L> {
    service: Arc<TumblingWindowService<L>>,
    idle_timeout: Duration,
    cancel: CancellationToken,
}

/// Handle of a running watchdog.
pub struct WatchdogHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl WatchdogHandle {
    /// Stops the watchdog, aborting it if it does not exit within the grace period.
    pub async fn shutdown(mut self) -> Result<()> {
        self.cancel.cancel();
        match tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, &mut self.handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Watchdog(format!("watchdog task failed: {e}"))),
            Err(_) => {
                warn!("Idle window watchdog did not stop in time, aborting");
                self.handle.abort();
                Ok(())
            }
        }
    }
}

impl<L> IdleWindowWatchdog<L>
where
    L: WindowLifecycle + Send + Sync + 'static,
{
    pub fn new(
        service: Arc<TumblingWindowService<L>>,
        idle_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            service,
            idle_timeout,
            cancel,
        }
    }

    pub fn start(self) -> WatchdogHandle {
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(self.run());
        WatchdogHandle { cancel, handle }
    }

    async fn run(self) {
        let rearm = self.service.idle_notifier();
        let mut queue: DelayQueue<Option<i64>> = DelayQueue::new();
        let mut armed = self.arm(&mut queue);
        info!(idle_timeout = ?self.idle_timeout, "Started idle window watchdog");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,

                Some(expired) = queue.next(), if !queue.is_empty() => {
                    if let Some(window_start) = expired.into_inner() {
                        info!(window_start, "Window idle for too long, force releasing");
                        let released = self.service.release(window_start, ReleaseTrigger::Idle).await;
                        if let Err(e) = released {
                            error!(window_start, ?e, "Failed to force release idle window");
                        }
                    }
                    armed = self.arm(&mut queue);
                }

                _ = rearm.notified() => {
                    // keep the running timer as long as it watches the oldest window
                    if armed != self.service.oldest_window_start() {
                        armed = self.arm(&mut queue);
                    }
                }
            }
        }

        queue.clear();
        info!("Stopped idle window watchdog");
    }

    /// Replaces the pending entry with one for the current oldest window.
    fn arm(&self, queue: &mut DelayQueue<Option<i64>>) -> Option<i64> {
        queue.clear();
        let oldest = self.service.oldest_window_start();
        queue.insert(oldest, self.idle_timeout);
        debug!(window_start = ?oldest, "Armed idle window watch");
        oldest
    }
}
