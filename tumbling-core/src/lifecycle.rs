use crate::Result;
use crate::message::OutputRecord;
use crate::store::WindowEntry;

/// Turns a released window into output records and dispatches them. The engine only calls it,
/// errors are handed back to whoever triggered the release.
#[trait_variant::make(WindowLifecycle: Send)]
pub trait LocalWindowLifecycle {
    /// Builds the output records of the window. `partial` is set when the window is released by
    /// the idle timeout instead of the watermark.
    async fn compute_window_aggregate(
        &self,
        window_start_ms: i64,
        window_end_ms: i64,
        window: &WindowEntry,
        partial: bool,
    ) -> Result<Vec<OutputRecord>>;

    /// Dispatches an output record of a completed window.
    async fn send(&self, event_time_ms: i64, watermark_ms: i64, record: OutputRecord) -> Result<()>;

    /// Dispatches an output record of a window which already passed the watermark and is
    /// still within its allowed lateness.
    async fn handle_late_event(
        &self,
        event_time_ms: i64,
        watermark_ms: i64,
        record: OutputRecord,
    ) -> Result<()>;
}
