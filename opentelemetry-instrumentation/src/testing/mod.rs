//! Test utilities: an in-memory recorder and a deterministic id generator.
//!
//! Enabled by the `testing` feature.
use crate::instrumenter::{ObservationData, ObservationRecorder};
use crate::trace::{IdGenerator, SpanId, TraceId};
use crate::Context;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// A recorder keeping every started and finished observation in memory.
///
/// Clones share their storage, so a clone can be handed to an instrumenter
/// while the test inspects the original.
///
/// # Example
///
/// ```
/// use opentelemetry_instrumentation::testing::InMemoryRecorder;
/// use opentelemetry_instrumentation::{Context, Instrumenter};
///
/// let recorder = InMemoryRecorder::default();
/// let instrumenter: Instrumenter<&str, ()> = Instrumenter::builder("demo", |r: &&str| r.to_string())
///     .set_recorder(recorder.clone())
///     .set_enabled(true)
///     .build();
///
/// let (cx, _observation) = instrumenter.start(&Context::new(), &"work");
/// instrumenter.end(&cx, &"work", Some(&()), None);
///
/// assert_eq!(recorder.finished_observations()[0].name, "work");
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryRecorder {
    started: Arc<Mutex<Vec<ObservationData>>>,
    finished: Arc<Mutex<Vec<ObservationData>>>,
}

impl InMemoryRecorder {
    /// Create a new, empty recorder.
    pub fn new() -> Self {
        InMemoryRecorder::default()
    }

    /// Snapshots of the observations as they were when started.
    pub fn started_observations(&self) -> Vec<ObservationData> {
        lock(&self.started).clone()
    }

    /// Observations that reached their terminal state, in end order.
    pub fn finished_observations(&self) -> Vec<ObservationData> {
        lock(&self.finished).clone()
    }

    /// Clears both started and finished observations.
    pub fn reset(&self) {
        lock(&self.started).clear();
        lock(&self.finished).clear();
    }
}

impl ObservationRecorder for InMemoryRecorder {
    fn on_start(&self, observation: &ObservationData, _parent_cx: &Context) {
        lock(&self.started).push(observation.clone());
    }

    fn on_end(&self, observation: ObservationData) {
        lock(&self.finished).push(observation);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Id generator handing out 1, 2, 3, ... for trace and span ids.
#[derive(Debug, Default)]
pub struct IncrementIdGenerator {
    trace_id: AtomicU64,
    span_id: AtomicU64,
}

impl IncrementIdGenerator {
    /// Create a generator starting at 1.
    pub fn new() -> Self {
        IncrementIdGenerator::default()
    }
}

impl IdGenerator for IncrementIdGenerator {
    fn new_trace_id(&self) -> TraceId {
        TraceId::from(u128::from(self.trace_id.fetch_add(1, Ordering::Relaxed) + 1))
    }

    fn new_span_id(&self) -> SpanId {
        SpanId::from(self.span_id.fetch_add(1, Ordering::Relaxed) + 1)
    }
}
