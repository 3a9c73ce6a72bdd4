//! Tumbling window orchestration.
//!
//! Every record is mapped to the window `[start, start + interval)` containing its event time,
//! appended to the [WindowStore], and then every buffered window is evaluated against the
//! global watermark. A window goes through
//!
//! ```text
//! absent -> open -> closed
//!              \--> released-pending-lateness -> closed
//! ```
//!
//! and may be force closed (partial) at any point by the idle watchdog. Releasing is
//! idempotent, whoever removes the window from the store first gets to dispatch it.

use std::sync::Arc;

use dashmap::DashSet;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::WindowConfig;
use crate::lifecycle::WindowLifecycle;
use crate::message::{EVENT_TIME_HEADER, Record, WATERMARK_HEADER};
use crate::metrics::{RELEASE_KIND_LABEL, processor_labels, window_metrics};
use crate::store::WindowStore;
use crate::timestamp::{RecordTimestampAssigner, TimestampAssigner};
use crate::watermark::{WatermarkService, WatermarkUpdateStatus};
use crate::{Error, Result};

const NANOS_PER_MILLI: i64 = 1_000_000;

/// What triggered the release of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseTrigger {
    /// The watermark passed the end of the window (and its allowed lateness, if any). The
    /// window is removed and dispatched through `send`.
    Watermark,
    /// The watermark passed the end of the window but the allowed lateness is still running.
    /// The window stays buffered and is dispatched through `handle_late_event`.
    Lateness,
    /// The idle watchdog fired. The window is removed and dispatched as partial.
    Idle,
}

impl ReleaseTrigger {
    fn removes(self) -> bool {
        !matches!(self, ReleaseTrigger::Lateness)
    }

    fn partial(self) -> bool {
        matches!(self, ReleaseTrigger::Idle)
    }

    fn late_event_resend(self) -> bool {
        matches!(self, ReleaseTrigger::Lateness)
    }

    fn as_str(self) -> &'static str {
        match self {
            ReleaseTrigger::Watermark => "watermark",
            ReleaseTrigger::Lateness => "lateness",
            ReleaseTrigger::Idle => "idle",
        }
    }
}

/// Maps records to tumbling windows and drives their release.
pub struct TumblingWindowService<L> {
    interval_ns: i64,
    watermark: WatermarkService,
    store: WindowStore,
    assigner: TimestampAssigner,
    lifecycle: L,
    /// windows already dispatched through the late path and waiting for their lateness to expire
    pending_lateness: DashSet<i64>,
    /// wakes up the idle watchdog whenever the set of buffered windows changes
    idle_rearm: Arc<Notify>,
    labels: Vec<(String, String)>,
}

impl<L> TumblingWindowService<L>
where
    L: WindowLifecycle + Sync,
{
    pub fn new(
        name: &str,
        window: &WindowConfig,
        store: WindowStore,
        assigner: TimestampAssigner,
        lifecycle: L,
    ) -> Result<Self> {
        let interval_ns = i64::try_from(window.length.as_nanos())
            .ok()
            .filter(|ns| *ns > 0)
            .ok_or_else(|| {
                Error::Config(format!("invalid window length {:?}", window.length))
            })?;

        let service = Self {
            interval_ns,
            watermark: WatermarkService::new(window.max_out_of_orderness, window.allowed_lateness),
            store,
            assigner,
            lifecycle,
            pending_lateness: DashSet::new(),
            idle_rearm: Arc::new(Notify::new()),
            labels: processor_labels(name),
        };
        service.update_open_windows();
        Ok(service)
    }

    /// Start (nanoseconds) of the window the event time (millis) belongs to.
    pub fn window_start(&self, event_time_ms: i64) -> i64 {
        event_time_ms
            .saturating_mul(NANOS_PER_MILLI)
            .div_euclid(self.interval_ns)
            .saturating_mul(self.interval_ns)
    }

    /// End (millis, exclusive) of the window starting at `window_start` (nanoseconds).
    pub fn window_end_ms(&self, window_start: i64) -> i64 {
        window_start
            .saturating_add(self.interval_ns)
            .div_euclid(NANOS_PER_MILLI)
    }

    pub fn watermark(&self) -> &WatermarkService {
        &self.watermark
    }

    pub fn store(&self) -> &WindowStore {
        &self.store
    }

    pub fn lifecycle(&self) -> &L {
        &self.lifecycle
    }

    /// Start of the oldest buffered window, None when nothing is buffered.
    pub fn oldest_window_start(&self) -> Option<i64> {
        self.store.oldest()
    }

    pub(crate) fn idle_notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.idle_rearm)
    }

    /// Buffers the record into its window and releases every window the record completes.
    pub async fn on_new_message(&self, record: Record) -> Result<()> {
        let event_time_ms = self.assigner.extract_timestamp(&record)?;
        window_metrics()
            .records_read
            .get_or_create(&self.labels)
            .inc();

        match self.watermark.update_from_record(&record, event_time_ms) {
            WatermarkUpdateStatus::Discarded => {
                window_metrics()
                    .records_discarded
                    .get_or_create(&self.labels)
                    .inc();
                warn!(
                    event_time_ms,
                    watermark = self.watermark.compute_watermark_ms(),
                    "Dropping record older than the allowed lateness"
                );
                return Ok(());
            }
            WatermarkUpdateStatus::Late => {
                window_metrics()
                    .records_late
                    .get_or_create(&self.labels)
                    .inc();
                debug!(event_time_ms, "Late record within the allowed lateness");
            }
            WatermarkUpdateStatus::Valid => {}
        }

        let window_start = self.window_start(event_time_ms);
        let is_new = !self.store.contains(window_start);
        self.store.put(window_start, &record)?;
        if is_new {
            debug!(window_start, "Opened window");
            self.update_open_windows();
        }

        self.evaluate_windows(Some(window_start)).await?;
        self.arm_idle_watch();
        Ok(())
    }

    /// Completion sweep over every buffered window. A single watermark advance may complete
    /// several windows at once. `touched` is the window the triggering record landed in, only
    /// that window is resent while it is pending lateness.
    pub async fn evaluate_windows(&self, touched: Option<i64>) -> Result<()> {
        let mut windows = self.store.keys();
        windows.sort_unstable();

        for window_start in windows {
            let window_end_ms = self.window_end_ms(window_start);
            if !self.watermark.is_older_than_watermark(window_end_ms) {
                // sorted by start, later windows cannot be complete either
                break;
            }

            if !self.watermark.is_allowed_lateness_enabled()
                || self.watermark.is_older_than_allowed_lateness(window_end_ms)
            {
                self.release(window_start, ReleaseTrigger::Watermark).await?;
            } else if self.pending_lateness.insert(window_start)
                || touched == Some(window_start)
            {
                if let Err(e) = self.release(window_start, ReleaseTrigger::Lateness).await {
                    // not dispatched, the next sweep takes the late path again
                    self.pending_lateness.remove(&window_start);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Releases the window. A window which is not buffered anymore (released concurrently or
    /// before) is silently skipped.
    pub async fn release(&self, window_start: i64, trigger: ReleaseTrigger) -> Result<()> {
        let entry = if trigger.removes() {
            self.store.delete(window_start)
        } else {
            self.store.get(window_start)
        };
        let Some(entry) = entry else {
            if trigger == ReleaseTrigger::Lateness {
                self.pending_lateness.remove(&window_start);
            }
            debug!(
                window_start,
                trigger = trigger.as_str(),
                "Window already released"
            );
            return Ok(());
        };
        if trigger.removes() {
            self.pending_lateness.remove(&window_start);
            self.update_open_windows();
        }

        let window_start_ms = window_start.div_euclid(NANOS_PER_MILLI);
        let window_end_ms = self.window_end_ms(window_start);
        let watermark_ms = self.watermark.compute_watermark_ms();
        info!(
            window_start_ms,
            window_end_ms,
            watermark_ms,
            payloads = entry.payloads.len(),
            trigger = trigger.as_str(),
            "Releasing window"
        );

        let outputs = self
            .lifecycle
            .compute_window_aggregate(window_start_ms, window_end_ms, &entry, trigger.partial())
            .await?;

        for output in outputs {
            let output = output
                .with_header(EVENT_TIME_HEADER, window_end_ms)
                .with_header(WATERMARK_HEADER, watermark_ms);
            if trigger.late_event_resend() {
                self.lifecycle
                    .handle_late_event(window_end_ms, watermark_ms, output)
                    .await?;
            } else {
                self.lifecycle
                    .send(window_end_ms, watermark_ms, output)
                    .await?;
            }
        }

        let mut labels = self.labels.clone();
        labels.push((RELEASE_KIND_LABEL.to_string(), trigger.as_str().to_string()));
        window_metrics()
            .windows_released
            .get_or_create(&labels)
            .inc();

        self.arm_idle_watch();
        Ok(())
    }

    /// Asks the idle watchdog to look at the buffered windows again.
    fn arm_idle_watch(&self) {
        self.idle_rearm.notify_one();
    }

    fn update_open_windows(&self) {
        window_metrics()
            .windows_open
            .get_or_create(&self.labels)
            .set(self.store.len() as i64);
    }
}
