//! Metrics collection using metrics-rs.

use crate::queue::FilterId;
use metrics::Unit;
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const FRAMES_PUBLISHED: &str = "framewire_frames_published";
const FRAMES_CONSUMED: &str = "framewire_frames_consumed";
const FRAMES_DISCARDED: &str = "framewire_frames_discarded";
const FILTER_FAULTS: &str = "framewire_filter_faults";
const QUEUE_DEPTH: &str = "framewire_queue_depth";

/// Initialize metrics descriptions.
///
/// Call this once at application startup before using any metrics.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return; // Already initialized
    }

    metrics::describe_counter!(
        FRAMES_PUBLISHED,
        Unit::Count,
        "Total frames published into queues"
    );
    metrics::describe_counter!(
        FRAMES_CONSUMED,
        Unit::Count,
        "Total frames consumed by tail filters"
    );
    metrics::describe_counter!(
        FRAMES_DISCARDED,
        Unit::Count,
        "Total frames discarded by full queues (drop newest)"
    );
    metrics::describe_counter!(
        FILTER_FAULTS,
        Unit::Count,
        "Total processing cycles a filter reported as failed"
    );
    metrics::describe_gauge!(QUEUE_DEPTH, Unit::Count, "Unread frames in a queue");
}

/// Record a frame published by a filter.
#[inline]
pub fn record_frame_published(filter: FilterId) {
    metrics::counter!(FRAMES_PUBLISHED, "filter" => filter.to_string()).increment(1);
}

/// Record a frame consumed by a tail filter.
#[inline]
pub fn record_frame_consumed(filter: FilterId) {
    metrics::counter!(FRAMES_CONSUMED, "filter" => filter.to_string()).increment(1);
}

/// Record a frame discarded by a full queue.
#[inline]
pub fn record_frame_discarded(filter: FilterId) {
    metrics::counter!(FRAMES_DISCARDED, "filter" => filter.to_string()).increment(1);
}

/// Record a failed processing cycle.
#[inline]
pub fn record_filter_fault(filter: FilterId) {
    metrics::counter!(FILTER_FAULTS, "filter" => filter.to_string()).increment(1);
}

/// Record the current depth of a queue.
#[inline]
pub fn record_queue_depth(filter: FilterId, writer: usize, depth: usize) {
    metrics::gauge!(
        QUEUE_DEPTH,
        "filter" => filter.to_string(),
        "writer" => writer.to_string()
    )
    .set(depth as f64);
}
