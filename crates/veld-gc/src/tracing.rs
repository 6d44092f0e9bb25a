//! GC tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! tracing spans and events for collection phases. Without the feature,
//! every helper compiles to nothing.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use ::tracing::{span, Level};

    /// High-level GC phases.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GcPhase {
        /// Trace the live object graph.
        Mark,
        /// Reclaim unreachable objects.
        Sweep,
        /// Run scheduled finalizers.
        Finalize,
    }

    /// Stable identifier for a GC run, correlating all its events.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique GC ID.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a span for the entire collection.
    pub fn trace_gc_collection(full: bool, gc_id: GcId) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_collect", full = full, gc_id = gc_id.0).entered()
    }

    /// Create a span for one GC phase.
    pub fn trace_phase(phase: GcPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }

    /// Log the outcome of a finished collection.
    pub fn log_collection_end(full: bool, freed: usize, live: usize, pause_ns: u64) {
        ::tracing::debug!(full, freed, live, pause_ns, "gc_done");
    }
}

#[cfg(not(feature = "tracing"))]
#[allow(dead_code)]
pub mod internal {
    /// No-op stand-in when the `tracing` feature is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Returns a dummy ID.
    pub fn next_gc_id() -> GcId {
        GcId(0)
    }
}
