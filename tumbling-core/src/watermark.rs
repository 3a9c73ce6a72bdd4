//! Event time progress tracking. Every partition keeps its own monotonically increasing
//! watermark, the global watermark is the minimum across the partitions seen so far, so the
//! slowest partition gates window completion.
//!
//! The watermark of a partition is derived either from the event time of the record minus the
//! configured out-of-orderness, or, for stages further down a pipeline, adopted as is from the
//! `watermark` header already propagated by the upstream stage.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use crate::message::Record;

/// Watermark before any record has been observed.
pub const INITIAL_WATERMARK: i64 = i64::MIN;

/// Outcome of applying a record's event time to the watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkUpdateStatus {
    /// On time, the watermark may have advanced.
    Valid,
    /// Older than the global watermark but still within the allowed lateness.
    Late,
    /// Older than the global watermark minus the allowed lateness, must be dropped.
    Discarded,
}

/// Tracks per partition watermarks and derives the global one.
#[derive(Debug)]
pub struct WatermarkService {
    partitions: DashMap<u16, AtomicI64>,
    max_out_of_orderness_ms: i64,
    allowed_lateness_ms: i64,
}

impl WatermarkService {
    pub fn new(max_out_of_orderness: Duration, allowed_lateness: Duration) -> Self {
        Self {
            partitions: DashMap::new(),
            max_out_of_orderness_ms: duration_ms(max_out_of_orderness),
            allowed_lateness_ms: duration_ms(allowed_lateness),
        }
    }

    /// Applies the record's event time to the watermark of the partition it was read from. A
    /// `watermark` header propagated by the upstream stage takes precedence over the event time
    /// derived candidate.
    pub fn update_from_record(&self, record: &Record, event_time_ms: i64) -> WatermarkUpdateStatus {
        let candidate = record
            .upstream_watermark()
            .unwrap_or_else(|| event_time_ms.saturating_sub(self.max_out_of_orderness_ms));
        self.update_watermarks(record.partition(), event_time_ms, candidate)
    }

    /// Classifies the event time against the global watermark observed before this update and,
    /// unless the record is discarded, advances the partition's watermark to
    /// `max(current, candidate)`.
    pub fn update_watermarks(
        &self,
        partition: u16,
        event_time_ms: i64,
        candidate_ms: i64,
    ) -> WatermarkUpdateStatus {
        let global = self.compute_watermark_ms();

        let status = if global > event_time_ms {
            if global.saturating_sub(self.allowed_lateness_ms) > event_time_ms {
                debug!(
                    partition,
                    event_time_ms,
                    watermark = global,
                    "Discarding record older than the allowed lateness"
                );
                return WatermarkUpdateStatus::Discarded;
            }
            WatermarkUpdateStatus::Late
        } else {
            WatermarkUpdateStatus::Valid
        };

        // the map guard is only held for the entry lookup, the update itself is a lock free max
        let previous = match self.partitions.get(&partition) {
            Some(wm) => wm.fetch_max(candidate_ms, Ordering::AcqRel),
            None => self
                .partitions
                .entry(partition)
                .or_insert_with(|| AtomicI64::new(INITIAL_WATERMARK))
                .fetch_max(candidate_ms, Ordering::AcqRel),
        };

        if candidate_ms > previous {
            debug!(
                partition,
                watermark = candidate_ms,
                "Partition watermark advanced"
            );
        }
        status
    }

    /// Minimum over every partition's watermark, [INITIAL_WATERMARK] when nothing has been seen.
    pub fn compute_watermark_ms(&self) -> i64 {
        self.partitions
            .iter()
            .map(|wm| wm.value().load(Ordering::Acquire))
            .min()
            .unwrap_or(INITIAL_WATERMARK)
    }

    /// Watermark of a single partition, if it has been observed.
    pub fn partition_watermark_ms(&self, partition: u16) -> Option<i64> {
        self.partitions
            .get(&partition)
            .map(|wm| wm.value().load(Ordering::Acquire))
    }

    /// True when the global watermark has reached the given timestamp.
    pub fn is_older_than_watermark(&self, timestamp_ms: i64) -> bool {
        self.compute_watermark_ms() >= timestamp_ms
    }

    /// True when the global watermark has passed the timestamp plus the allowed lateness.
    pub fn is_older_than_allowed_lateness(&self, timestamp_ms: i64) -> bool {
        self.compute_watermark_ms() >= timestamp_ms.saturating_add(self.allowed_lateness_ms)
    }

    pub fn is_allowed_lateness_enabled(&self) -> bool {
        self.allowed_lateness_ms > 0
    }
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
