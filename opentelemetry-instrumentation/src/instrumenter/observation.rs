//! Observation handles and the data they hand to a recorder.
use crate::error::{ErrorDetail, InstrumentationError, InstrumentationResult};
use crate::trace::{SpanContext, SpanId, SpanKind};
use crate::{otel_debug, otel_warn, Context, Key, KeyValue, Value};
use indexmap::IndexMap;
use std::borrow::Cow;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

/// Lifecycle state of an observation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Started and not yet ended.
    Pending,
    /// Ended, the operation succeeded.
    Success,
    /// Ended, the operation failed, was cancelled or was abandoned.
    Failure,
}

impl Outcome {
    /// Returns `true` once the observation reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::Pending)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = match self {
            Outcome::Pending => "pending",
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        };
        f.write_str(outcome)
    }
}

/// Everything recorded about one observation.
///
/// Handed to [`ObservationRecorder::on_end`] exactly once, after the
/// terminal transition.
#[derive(Clone, Debug, PartialEq)]
pub struct ObservationData {
    /// Identity of the observation.
    pub span_context: SpanContext,
    /// Span id of the causal parent, [`SpanId::INVALID`] for a root.
    pub parent_span_id: SpanId,
    /// Whether the causal parent was extracted from a carrier.
    pub parent_is_remote: bool,
    /// Relationship to the parent and children.
    pub kind: SpanKind,
    /// Operation name.
    pub name: Cow<'static, str>,
    /// Name of the instrumenter that started the observation.
    pub instrumentation_name: Cow<'static, str>,
    /// Time the observation started.
    pub start_time: SystemTime,
    /// Time of the terminal transition, `None` while pending.
    pub end_time: Option<SystemTime>,
    /// Lifecycle state.
    pub outcome: Outcome,
    /// Attributes in insertion order. A repeated key keeps its first
    /// position and takes the last value.
    pub attributes: IndexMap<Key, Value>,
    /// Error detail of a failed observation.
    pub error: Option<ErrorDetail>,
}

impl ObservationData {
    /// Value of an attribute.
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Time between start and the terminal transition, `None` while
    /// pending. A clock that went backwards yields zero.
    pub fn duration(&self) -> Option<Duration> {
        self.end_time
            .map(|end_time| end_time.duration_since(self.start_time).unwrap_or_default())
    }

    pub(crate) fn merge_attributes<I: IntoIterator<Item = KeyValue>>(&mut self, attributes: I) {
        for KeyValue { key, value } in attributes {
            self.attributes.insert(key, value);
        }
    }
}

/// Receives observations as they start and end.
///
/// Implementations are called synchronously on the thread that starts or
/// ends the observation and must not block. Panics are caught and logged.
pub trait ObservationRecorder: Send + Sync + fmt::Debug {
    /// Called when an observation is started.
    fn on_start(&self, _observation: &ObservationData, _parent_cx: &Context) {}

    /// Called exactly once per observation, after its terminal transition.
    fn on_end(&self, observation: ObservationData);
}

/// A recorder that drops every observation.
#[derive(Clone, Debug, Default)]
pub struct NoopRecorder {
    _private: (),
}

impl NoopRecorder {
    /// Create a new `NoopRecorder`.
    pub fn new() -> Self {
        NoopRecorder::default()
    }
}

impl ObservationRecorder for NoopRecorder {
    fn on_end(&self, _observation: ObservationData) {}
}

/// Handle to a started observation.
///
/// Handles are cheap to clone and share one observation. The observation is
/// ended through [`Instrumenter::end`]; if every handle, including the ones
/// held by child contexts, is dropped while it is still pending, it is ended
/// as a failure with [`ErrorKind::Abandoned`].
///
/// [`Instrumenter::end`]: crate::Instrumenter::end
/// [`ErrorKind::Abandoned`]: crate::ErrorKind::Abandoned
#[derive(Clone)]
pub struct Observation {
    inner: Arc<ObservationInner>,
}

struct ObservationInner {
    span_context: SpanContext,
    kind: SpanKind,
    parent: Option<Observation>,
    data: Mutex<Option<ObservationData>>,
    recorder: Arc<dyn ObservationRecorder>,
}

impl Observation {
    pub(crate) fn new(
        data: ObservationData,
        parent: Option<Observation>,
        recorder: Arc<dyn ObservationRecorder>,
    ) -> Self {
        Observation {
            inner: Arc::new(ObservationInner {
                span_context: data.span_context.clone(),
                kind: data.kind,
                parent,
                data: Mutex::new(Some(data)),
                recorder,
            }),
        }
    }

    /// Identity of the observation.
    pub fn span_context(&self) -> &SpanContext {
        &self.inner.span_context
    }

    /// Kind of the observation.
    pub fn kind(&self) -> SpanKind {
        self.inner.kind
    }

    /// The enclosing local observation, if any.
    pub fn parent(&self) -> Option<&Observation> {
        self.inner.parent.as_ref()
    }

    /// Returns `true` once the terminal transition happened.
    pub fn is_ended(&self) -> bool {
        self.inner
            .data
            .lock()
            .map(|data| data.is_none())
            .unwrap_or(true)
    }

    /// Sets an attribute on a pending observation.
    ///
    /// Returns `false`, without effect, once the observation has ended.
    pub fn set_attribute(&self, attribute: KeyValue) -> bool {
        self.set_attributes([attribute])
    }

    /// Sets attributes on a pending observation.
    ///
    /// Returns `false`, without effect, once the observation has ended.
    pub fn set_attributes<I: IntoIterator<Item = KeyValue>>(&self, attributes: I) -> bool {
        self.with_data(|data| data.merge_attributes(attributes))
            .is_some()
    }

    /// A copy of the data of a pending observation.
    pub fn snapshot(&self) -> Option<ObservationData> {
        self.inner
            .data
            .lock()
            .ok()
            .and_then(|data| data.as_ref().cloned())
    }

    fn with_data<T, F>(&self, f: F) -> Option<T>
    where
        F: FnOnce(&mut ObservationData) -> T,
    {
        self.inner
            .data
            .lock()
            .ok()
            .and_then(|mut guard| guard.as_mut().map(f))
    }

    /// Performs the terminal transition and hands the data to the recorder.
    ///
    /// The data is taken out of the mutex, so only the first caller gets
    /// past this point; later calls are reported as lifecycle violations.
    pub(crate) fn finish(
        &self,
        outcome: Outcome,
        attributes: Vec<KeyValue>,
        error: Option<ErrorDetail>,
    ) -> InstrumentationResult<()> {
        let data = self
            .inner
            .data
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        let Some(mut data) = data else {
            return Err(report_double_end(&self.inner.span_context));
        };

        data.merge_attributes(attributes);
        data.outcome = outcome;
        data.error = error;
        data.end_time = Some(SystemTime::now());
        record_end(self.inner.recorder.as_ref(), data);
        Ok(())
    }
}

fn report_double_end(span_context: &SpanContext) -> InstrumentationError {
    otel_warn!(
        name: "Observation.DoubleEnd",
        message = "end called on an observation that already ended; the call is ignored",
        span_id = span_context.span_id().to_string(),
    );
    #[cfg(feature = "strict-lifecycle")]
    panic!("observation {} ended more than once", span_context.span_id());
    #[cfg(not(feature = "strict-lifecycle"))]
    InstrumentationError::Lifecycle(format!(
        "observation {} ended more than once",
        span_context.span_id()
    ))
}

fn record_end(recorder: &dyn ObservationRecorder, data: ObservationData) {
    if panic::catch_unwind(AssertUnwindSafe(|| recorder.on_end(data))).is_err() {
        otel_warn!(name: "ObservationRecorder.OnEndPanicked");
    }
}

impl Drop for ObservationInner {
    fn drop(&mut self) {
        let data = match self.data.get_mut() {
            Ok(data) => data.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mut data) = data {
            otel_debug!(
                name: "Observation.Abandoned",
                span_id = self.span_context.span_id().to_string(),
            );
            data.outcome = Outcome::Failure;
            data.error = Some(ErrorDetail::abandoned());
            data.end_time = Some(SystemTime::now());
            record_end(self.recorder.as_ref(), data);
        }
    }
}

impl fmt::Debug for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observation")
            .field("span_context", &self.inner.span_context)
            .field("kind", &self.inner.kind)
            .field("ended", &self.is_ended())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testing::InMemoryRecorder;
    use crate::trace::{TraceFlags, TraceId, TraceState};

    fn observation(recorder: &InMemoryRecorder) -> Observation {
        let data = ObservationData {
            span_context: SpanContext::new(
                TraceId::from(1u128),
                SpanId::from(2u64),
                TraceFlags::SAMPLED,
                false,
                TraceState::NONE,
            ),
            parent_span_id: SpanId::INVALID,
            parent_is_remote: false,
            kind: SpanKind::Internal,
            name: "test".into(),
            instrumentation_name: "test".into(),
            start_time: SystemTime::now(),
            end_time: None,
            outcome: Outcome::Pending,
            attributes: IndexMap::new(),
            error: None,
        };
        Observation::new(data, None, Arc::new(recorder.clone()))
    }

    #[test]
    #[cfg(not(feature = "strict-lifecycle"))]
    fn finish_is_exactly_once() {
        let recorder = InMemoryRecorder::default();
        let observation = observation(&recorder);

        assert!(observation
            .finish(Outcome::Success, vec![KeyValue::new("a", 1i64)], None)
            .is_ok());
        assert!(matches!(
            observation.finish(Outcome::Failure, vec![KeyValue::new("a", 2i64)], None),
            Err(InstrumentationError::Lifecycle(_))
        ));

        let finished = recorder.finished_observations();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].outcome, Outcome::Success);
        assert_eq!(finished[0].attribute("a"), Some(&Value::I64(1)));
        assert!(finished[0].end_time.is_some());
    }

    #[test]
    fn attributes_rejected_after_end() {
        let recorder = InMemoryRecorder::default();
        let observation = observation(&recorder);

        assert!(observation.set_attribute(KeyValue::new("k", "first")));
        assert!(observation.set_attributes([KeyValue::new("z", "z"), KeyValue::new("k", "last")]));
        observation.finish(Outcome::Success, Vec::new(), None).unwrap();
        assert!(!observation.set_attribute(KeyValue::new("late", true)));

        let finished = recorder.finished_observations();
        let keys: Vec<&str> = finished[0].attributes.keys().map(Key::as_str).collect();
        assert_eq!(keys, vec!["k", "z"]);
        assert_eq!(finished[0].attribute("k"), Some(&Value::from("last")));
    }

    #[test]
    fn dropped_pending_observation_is_abandoned() {
        let recorder = InMemoryRecorder::default();
        let observation = observation(&recorder);
        let clone = observation.clone();
        drop(observation);
        assert!(recorder.finished_observations().is_empty());
        drop(clone);

        let finished = recorder.finished_observations();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].outcome, Outcome::Failure);
        assert_eq!(
            finished[0].error.as_ref().map(|e| e.kind),
            Some(ErrorKind::Abandoned)
        );
    }

    #[test]
    fn ended_observation_is_not_abandoned_on_drop() {
        let recorder = InMemoryRecorder::default();
        let observation = observation(&recorder);
        observation.finish(Outcome::Success, Vec::new(), None).unwrap();
        drop(observation);
        assert_eq!(recorder.finished_observations().len(), 1);
    }
}
