//! Metrics collection using metrics-rs.

use metrics::{counter, Unit};
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const FRAMES_PRODUCED: &str = "cascade_frames_produced";
const FRAMES_CONSUMED: &str = "cascade_frames_consumed";
const FRAMES_DROPPED: &str = "cascade_frames_dropped";
const IDLE_SWEEPS: &str = "cascade_idle_sweeps";
const DEADLINE_MISSES: &str = "cascade_deadline_misses";

/// Initialize metrics descriptions.
///
/// Call this once at application startup before using any metrics.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return; // Already initialized
    }

    metrics::describe_counter!(
        FRAMES_PRODUCED,
        Unit::Count,
        "Total number of frames committed by writer ports"
    );
    metrics::describe_counter!(
        FRAMES_CONSUMED,
        Unit::Count,
        "Total number of frames released by reader ports"
    );
    metrics::describe_counter!(
        FRAMES_DROPPED,
        Unit::Count,
        "Total number of frames discarded because the queue was full"
    );
    metrics::describe_counter!(
        IDLE_SWEEPS,
        Unit::Count,
        "Worker sweeps that found no work on any filter"
    );
    metrics::describe_counter!(
        DEADLINE_MISSES,
        Unit::Count,
        "Constant-framerate iterations that overran their period"
    );
}

/// Record a frame committed by a writer port.
#[inline]
pub fn record_frame_produced() {
    counter!(FRAMES_PRODUCED).increment(1);
}

/// Record a frame released by a reader port.
#[inline]
pub fn record_frame_consumed() {
    counter!(FRAMES_CONSUMED).increment(1);
}

/// Record a frame dropped at a full queue.
#[inline]
pub fn record_frame_dropped() {
    counter!(FRAMES_DROPPED).increment(1);
}

/// Record a worker sweep that made no progress.
#[inline]
pub fn record_idle_sweep(worker: i32) {
    counter!(IDLE_SWEEPS, "worker" => worker.to_string()).increment(1);
}

/// Record a constant-framerate deadline miss.
#[inline]
pub fn record_deadline_miss(worker: i32) {
    counter!(DEADLINE_MISSES, "worker" => worker.to_string()).increment(1);
}
