//! GC metrics and statistics.

use std::time::Duration;

use parking_lot::Mutex;

/// Kind of a completed collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CollectionKind {
    /// No collection has run yet.
    #[default]
    None = 0,
    /// Quick sweep: the old generation was not touched.
    Quick = 1,
    /// Full sweep: every live object was inspected.
    Full = 2,
}

/// Statistics from the most recent garbage collection.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcMetrics {
    /// Total stop-the-world pause.
    pub pause: Duration,
    /// Time spent marking.
    pub mark_time: Duration,
    /// Time spent sweeping.
    pub sweep_time: Duration,
    /// Time between requesting the stop and the world being stopped.
    pub time_to_safepoint: Duration,
    /// Bytes reclaimed by the cycle.
    pub bytes_freed: usize,
    /// Live bytes after the cycle.
    pub live_bytes: usize,
    /// Pool pages released or retained-empty by the sweep.
    pub pages_freed: usize,
    /// Big objects freed by the sweep.
    pub big_objects_freed: usize,
    /// Sweep kind.
    pub kind: CollectionKind,
    /// The cycle scheduled an immediate follow-up collection.
    pub recollect: bool,
    /// Collections since process start.
    pub total_collections: usize,
}

static LAST: Mutex<GcMetrics> = Mutex::new(GcMetrics {
    pause: Duration::ZERO,
    mark_time: Duration::ZERO,
    sweep_time: Duration::ZERO,
    time_to_safepoint: Duration::ZERO,
    bytes_freed: 0,
    live_bytes: 0,
    pages_freed: 0,
    big_objects_freed: 0,
    kind: CollectionKind::None,
    recollect: false,
    total_collections: 0,
});

/// Records the metrics of a finished collection.
pub(crate) fn record_metrics(mut metrics: GcMetrics) {
    let mut last = LAST.lock();
    metrics.total_collections = last.total_collections + 1;
    *last = metrics;
}

/// Metrics of the most recent collection.
pub fn last_gc_metrics() -> GcMetrics {
    *LAST.lock()
}
