//! The observation lifecycle: decide, start, end.
//!
//! An [`Instrumenter`] is built once per instrumented library and shared by
//! every call site. A call site follows the same three steps for every
//! operation:
//!
//! 1. [`Instrumenter::should_start`] decides whether the operation is
//!    observed at all. It has no side effects.
//! 2. [`Instrumenter::start`] opens an [`Observation`] and returns the child
//!    [`Context`] that downstream code must receive.
//! 3. [`Instrumenter::end`] closes the observation with the response or
//!    error of the operation.
//!
//! Every observation reaches its terminal state exactly once. A second
//! `end` is reported and ignored, and an observation whose handles are all
//! dropped while pending is ended as abandoned.
//!
//! Faults of the extractors never reach the instrumented operation: a
//! panicking extractor is caught, logged, and the observation continues with
//! what could be determined.
use crate::config::InstrumentationConfig;
use crate::error::{ErrorDetail, ErrorKind, InstrumentationError};
use crate::trace::{
    IdGenerator, RandomIdGenerator, SpanContext, SpanId, SpanKind, TraceFlags, TraceState,
};
use crate::{otel_debug, otel_warn, Context, KeyValue};
use indexmap::IndexMap;
use std::borrow::Cow;
use std::error::Error;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::SystemTime;

mod extractor;
mod listener;
mod observation;

pub use extractor::{
    AttributesExtractor, ConstantKind, DefaultStatusExtractor, SpanKindExtractor,
    SpanNameExtractor, SpanStatusExtractor,
};
use listener::ListeningRecorder;
pub use listener::OperationListener;
pub use observation::{
    NoopRecorder, Observation, ObservationData, ObservationRecorder, Outcome,
};

const UNKNOWN_NAME: &str = "unknown";
const UNKNOWN_ERROR_TYPE: &str = "unknown";
const ERROR_TYPE_ATTRIBUTE: &str = "error.type";

/// Decides whether an operation is observed, and records its observation.
///
/// `Req` is the request type of the instrumented operation and `Resp` its
/// response type. Cloning an instrumenter is cheap and clones share their
/// configuration.
pub struct Instrumenter<Req, Resp> {
    inner: Arc<InstrumenterInner<Req, Resp>>,
}

struct InstrumenterInner<Req, Resp> {
    instrumentation_name: Cow<'static, str>,
    enabled: bool,
    span_name_extractor: Box<dyn SpanNameExtractor<Req>>,
    span_kind_extractor: Box<dyn SpanKindExtractor<Req>>,
    status_extractor: Box<dyn SpanStatusExtractor<Req, Resp>>,
    attributes_extractors: Vec<Box<dyn AttributesExtractor<Req, Resp>>>,
    recorder: Arc<dyn ObservationRecorder>,
    id_generator: Arc<dyn IdGenerator>,
}

impl<Req, Resp> Clone for Instrumenter<Req, Resp> {
    fn clone(&self) -> Self {
        Instrumenter {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Req, Resp> fmt::Debug for Instrumenter<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrumenter")
            .field("instrumentation_name", &self.inner.instrumentation_name)
            .field("enabled", &self.inner.enabled)
            .field(
                "attributes_extractors",
                &self.inner.attributes_extractors.len(),
            )
            .field("recorder", &self.inner.recorder)
            .field("id_generator", &self.inner.id_generator)
            .finish()
    }
}

impl<Req, Resp> Instrumenter<Req, Resp> {
    /// Create a builder for an instrumenter named `instrumentation_name`
    /// that names observations with `span_name_extractor`.
    pub fn builder<N, S>(instrumentation_name: N, span_name_extractor: S) -> InstrumenterBuilder<Req, Resp>
    where
        N: Into<Cow<'static, str>>,
        S: SpanNameExtractor<Req> + 'static,
    {
        InstrumenterBuilder {
            instrumentation_name: instrumentation_name.into(),
            enabled: None,
            span_name_extractor: Box::new(span_name_extractor),
            span_kind_extractor: None,
            status_extractor: None,
            attributes_extractors: Vec::new(),
            recorder: None,
            operation_listeners: Vec::new(),
            id_generator: None,
        }
    }

    /// Name of the instrumentation this instrumenter belongs to.
    pub fn instrumentation_name(&self) -> &str {
        &self.inner.instrumentation_name
    }

    /// Whether the instrumenter was enabled by its configuration.
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    /// Decides whether the operation for `request` is observed.
    ///
    /// Returns `false` when the instrumenter is disabled, instrumentation
    /// is suppressed in `parent_cx`, an enclosing observation of the same
    /// kind is active (for every kind but [`SpanKind::Internal`]), or the
    /// causal parent is not sampled.
    pub fn should_start(&self, parent_cx: &Context, request: &Req) -> bool {
        if !self.inner.enabled || parent_cx.is_instrumentation_suppressed() {
            return false;
        }

        let kind = self.span_kind(request);
        if kind.suppresses_nested()
            && parent_cx
                .observations()
                .any(|observation| observation.kind() == kind)
        {
            otel_debug!(
                name: "Instrumenter.NestedSuppressed",
                instrumentation_name = self.instrumentation_name(),
                kind = kind.to_string(),
            );
            return false;
        }

        parent_cx
            .parent_span_context()
            .map_or(true, |parent| parent.is_sampled())
    }

    /// Starts an observation for `request` as a child of `parent_cx`.
    ///
    /// Returns the child context to hand to the operation, and to
    /// [`Instrumenter::end`] once it finished, together with a handle to the
    /// new observation.
    pub fn start(&self, parent_cx: &Context, request: &Req) -> (Context, Observation) {
        let inner = &self.inner;
        let kind = self.span_kind(request);
        let span_id = inner.id_generator.new_span_id();

        let span_context = match parent_cx.parent_span_context() {
            Some(parent) => SpanContext::new(
                parent.trace_id(),
                span_id,
                parent.trace_flags(),
                false,
                parent.trace_state().clone(),
            ),
            None => SpanContext::new(
                inner.id_generator.new_trace_id(),
                span_id,
                TraceFlags::SAMPLED,
                false,
                TraceState::NONE,
            ),
        };
        let (parent_span_id, parent_is_remote) = parent_cx
            .parent_span_context()
            .map_or((SpanId::INVALID, false), |parent| {
                (parent.span_id(), parent.is_remote())
            });

        let name = guarded("span_name", || inner.span_name_extractor.extract(request))
            .unwrap_or_else(|| UNKNOWN_NAME.to_string());

        let mut attributes = Vec::new();
        for extractor in &inner.attributes_extractors {
            guarded("attributes.on_start", || {
                extractor.on_start(&mut attributes, parent_cx, request)
            });
        }

        let mut data = ObservationData {
            span_context,
            parent_span_id,
            parent_is_remote,
            kind,
            name: name.into(),
            instrumentation_name: inner.instrumentation_name.clone(),
            start_time: SystemTime::now(),
            end_time: None,
            outcome: Outcome::Pending,
            attributes: IndexMap::with_capacity(attributes.len()),
            error: None,
        };
        data.merge_attributes(attributes);

        guarded("recorder.on_start", || inner.recorder.on_start(&data, parent_cx));

        let observation = Observation::new(
            data,
            parent_cx.active_observation().cloned(),
            Arc::clone(&inner.recorder),
        );
        (parent_cx.with_observation(observation.clone()), observation)
    }

    /// Ends the observation active in `cx`, the context returned by
    /// [`Instrumenter::start`].
    ///
    /// Runs every attributes extractor's `on_end`, classifies the outcome
    /// through the status extractor and records the error, if any. The
    /// error's type is recorded as `unknown`; use
    /// [`Instrumenter::end_with_error`] when the concrete type is known.
    pub fn end(
        &self,
        cx: &Context,
        request: &Req,
        response: Option<&Resp>,
        error: Option<&(dyn Error + 'static)>,
    ) {
        self.end_internal(cx, request, response, error, None, None)
    }

    /// Ends the observation active in `cx` with a failed operation's error,
    /// recording the concrete error type.
    pub fn end_with_error<E>(&self, cx: &Context, request: &Req, response: Option<&Resp>, error: &E)
    where
        E: Error + 'static,
    {
        self.end_internal(
            cx,
            request,
            response,
            Some(error),
            Some(std::any::type_name::<E>()),
            None,
        )
    }

    /// Ends the observation active in `cx` as a failure with
    /// [`ErrorKind::Cancelled`].
    pub fn end_cancelled(&self, cx: &Context, request: &Req) {
        self.end_internal(cx, request, None, None, None, Some(ErrorDetail::cancelled()))
    }

    /// Runs `f` under a new observation when [`should_start`] allows it.
    ///
    /// `f` receives the context to use for nested operations. Its result is
    /// returned unchanged; an `Err` ends the observation as a failure. If
    /// `f` panics, the observation is ended as abandoned while unwinding.
    ///
    /// [`should_start`]: Instrumenter::should_start
    pub fn instrument<E, F>(&self, parent_cx: &Context, request: &Req, f: F) -> Result<Resp, E>
    where
        E: Error + 'static,
        F: FnOnce(&Context, &Req) -> Result<Resp, E>,
    {
        if !self.should_start(parent_cx, request) {
            return f(parent_cx, request);
        }

        let (cx, _observation) = self.start(parent_cx, request);
        let result = f(&cx, request);
        match &result {
            Ok(response) => self.end(&cx, request, Some(response), None),
            Err(error) => self.end_with_error(&cx, request, None, error),
        }
        result
    }

    fn span_kind(&self, request: &Req) -> SpanKind {
        guarded("span_kind", || self.inner.span_kind_extractor.extract(request))
            .unwrap_or_default()
    }

    fn end_internal(
        &self,
        cx: &Context,
        request: &Req,
        response: Option<&Resp>,
        error: Option<&(dyn Error + 'static)>,
        error_type: Option<&'static str>,
        forced: Option<ErrorDetail>,
    ) {
        let Some(observation) = cx.active_observation() else {
            otel_warn!(
                name: "Instrumenter.EndWithoutObservation",
                message = "end called with a context holding no observation; the call is ignored",
                instrumentation_name = self.instrumentation_name(),
            );
            return;
        };

        if observation.is_ended() {
            let _ = observation.finish(Outcome::Failure, Vec::new(), None);
            return;
        }

        let inner = &self.inner;
        let mut attributes = Vec::new();
        for extractor in &inner.attributes_extractors {
            guarded("attributes.on_end", || {
                extractor.on_end(&mut attributes, cx, request, response, error)
            });
        }

        let (outcome, detail) = match forced {
            Some(detail) => (Outcome::Failure, Some(detail)),
            None => {
                let outcome = guarded("status", || {
                    inner.status_extractor.extract(request, response, error)
                })
                .filter(Outcome::is_terminal)
                .unwrap_or_else(|| DefaultStatusExtractor::classify(error));
                let detail = match outcome {
                    Outcome::Failure => Some(failure_detail(error, error_type, &attributes)),
                    _ => None,
                };
                (outcome, detail)
            }
        };

        // A concurrent `end` may have won since the check above; `finish`
        // reports it.
        let _ = observation.finish(outcome, attributes, detail);
    }
}

/// Error detail of a failed observation. The `error.type` attribute, when an
/// extractor set one, names the failure.
fn failure_detail(
    error: Option<&(dyn Error + 'static)>,
    error_type: Option<&'static str>,
    attributes: &[KeyValue],
) -> ErrorDetail {
    let error_type_attribute = attributes
        .iter()
        .rev()
        .find(|kv| kv.key.as_str() == ERROR_TYPE_ATTRIBUTE)
        .map(|kv| Cow::Owned(kv.value.as_str().into_owned()));

    match error {
        Some(error) => {
            let type_name = error_type_attribute
                .unwrap_or(Cow::Borrowed(error_type.unwrap_or(UNKNOWN_ERROR_TYPE)));
            ErrorDetail::from_error(error).with_type_name(type_name)
        }
        None => {
            let type_name = error_type_attribute.unwrap_or(Cow::Borrowed(UNKNOWN_ERROR_TYPE));
            ErrorDetail {
                kind: ErrorKind::Operation,
                message: format!("operation classified as failed: {type_name}"),
                type_name,
            }
        }
    }
}

/// Runs one extractor, catching and logging a panic.
fn guarded<T>(extractor: &'static str, f: impl FnOnce() -> T) -> Option<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(_) => {
            otel_warn!(
                name: "Instrumenter.ExtractorPanicked",
                error = InstrumentationError::Extractor(extractor.to_string()).to_string(),
            );
            None
        }
    }
}

/// Builder for [`Instrumenter`].
pub struct InstrumenterBuilder<Req, Resp> {
    instrumentation_name: Cow<'static, str>,
    enabled: Option<bool>,
    span_name_extractor: Box<dyn SpanNameExtractor<Req>>,
    span_kind_extractor: Option<Box<dyn SpanKindExtractor<Req>>>,
    status_extractor: Option<Box<dyn SpanStatusExtractor<Req, Resp>>>,
    attributes_extractors: Vec<Box<dyn AttributesExtractor<Req, Resp>>>,
    recorder: Option<Arc<dyn ObservationRecorder>>,
    operation_listeners: Vec<Box<dyn OperationListener>>,
    id_generator: Option<Arc<dyn IdGenerator>>,
}

impl<Req, Resp> fmt::Debug for InstrumenterBuilder<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumenterBuilder")
            .field("instrumentation_name", &self.instrumentation_name)
            .field("enabled", &self.enabled)
            .field("attributes_extractors", &self.attributes_extractors.len())
            .field("operation_listeners", &self.operation_listeners)
            .finish()
    }
}

impl<Req, Resp> InstrumenterBuilder<Req, Resp> {
    /// Appends an attributes extractor. Extractors run in the order they
    /// were added.
    pub fn add_attributes_extractor<A>(mut self, extractor: A) -> Self
    where
        A: AttributesExtractor<Req, Resp> + 'static,
    {
        self.attributes_extractors.push(Box::new(extractor));
        self
    }

    /// Appends several boxed attributes extractors.
    pub fn add_attributes_extractors<I>(mut self, extractors: I) -> Self
    where
        I: IntoIterator<Item = Box<dyn AttributesExtractor<Req, Resp>>>,
    {
        self.attributes_extractors.extend(extractors);
        self
    }

    /// Sets the extractor deciding the kind of each observation.
    pub fn set_span_kind_extractor<K>(mut self, extractor: K) -> Self
    where
        K: SpanKindExtractor<Req> + 'static,
    {
        self.span_kind_extractor = Some(Box::new(extractor));
        self
    }

    /// Sets the extractor classifying the outcome of each operation.
    /// Defaults to [`DefaultStatusExtractor`].
    pub fn set_status_extractor<S>(mut self, extractor: S) -> Self
    where
        S: SpanStatusExtractor<Req, Resp> + 'static,
    {
        self.status_extractor = Some(Box::new(extractor));
        self
    }

    /// Sets the recorder receiving finished observations. Defaults to a
    /// [`NoopRecorder`].
    pub fn set_recorder<R>(mut self, recorder: R) -> Self
    where
        R: ObservationRecorder + 'static,
    {
        self.recorder = Some(Arc::new(recorder));
        self
    }

    /// Sets a recorder shared with other instrumenters.
    pub fn set_shared_recorder(mut self, recorder: Arc<dyn ObservationRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Adds a listener notified of every operation, e.g. to record its
    /// duration. Listeners run in the order they were added.
    pub fn add_operation_listener<L>(mut self, listener: L) -> Self
    where
        L: OperationListener + 'static,
    {
        self.operation_listeners.push(Box::new(listener));
        self
    }

    /// Sets the id generator. Defaults to [`RandomIdGenerator`].
    pub fn set_id_generator<G>(mut self, id_generator: G) -> Self
    where
        G: IdGenerator + 'static,
    {
        self.id_generator = Some(Arc::new(id_generator));
        self
    }

    /// Enables or disables the instrumenter, overriding the environment.
    pub fn set_enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Takes enablement from `config`.
    ///
    /// Without this call, or [`set_enabled`], the environment decides: see
    /// [`InstrumentationConfig`].
    ///
    /// [`set_enabled`]: InstrumenterBuilder::set_enabled
    pub fn with_config(mut self, config: &InstrumentationConfig) -> Self {
        self.enabled = Some(config.is_enabled(&self.instrumentation_name));
        self
    }

    /// Builds an instrumenter whose kind comes from the kind extractor,
    /// [`SpanKind::Internal`] when none was set.
    pub fn build(mut self) -> Instrumenter<Req, Resp> {
        let span_kind_extractor = match self.span_kind_extractor.take() {
            Some(extractor) => extractor,
            None => Box::new(ConstantKind(SpanKind::Internal)),
        };
        self.finish(span_kind_extractor)
    }

    /// Builds an instrumenter of [`SpanKind::Client`] observations.
    pub fn build_client(self) -> Instrumenter<Req, Resp> {
        self.finish(Box::new(ConstantKind(SpanKind::Client)))
    }

    /// Builds an instrumenter of [`SpanKind::Server`] observations.
    pub fn build_server(self) -> Instrumenter<Req, Resp> {
        self.finish(Box::new(ConstantKind(SpanKind::Server)))
    }

    /// Builds an instrumenter of [`SpanKind::Producer`] observations.
    pub fn build_producer(self) -> Instrumenter<Req, Resp> {
        self.finish(Box::new(ConstantKind(SpanKind::Producer)))
    }

    /// Builds an instrumenter of [`SpanKind::Consumer`] observations.
    pub fn build_consumer(self) -> Instrumenter<Req, Resp> {
        self.finish(Box::new(ConstantKind(SpanKind::Consumer)))
    }

    fn finish(self, span_kind_extractor: Box<dyn SpanKindExtractor<Req>>) -> Instrumenter<Req, Resp> {
        let enabled = self.enabled.unwrap_or_else(|| {
            InstrumentationConfig::default().is_enabled(&self.instrumentation_name)
        });
        let status_extractor = match self.status_extractor {
            Some(extractor) => extractor,
            None => Box::new(DefaultStatusExtractor),
        };
        let recorder = self
            .recorder
            .unwrap_or_else(|| Arc::new(NoopRecorder::new()));
        let recorder: Arc<dyn ObservationRecorder> = if self.operation_listeners.is_empty() {
            recorder
        } else {
            Arc::new(ListeningRecorder::new(recorder, self.operation_listeners))
        };
        Instrumenter {
            inner: Arc::new(InstrumenterInner {
                instrumentation_name: self.instrumentation_name,
                enabled,
                span_name_extractor: self.span_name_extractor,
                span_kind_extractor,
                status_extractor,
                attributes_extractors: self.attributes_extractors,
                recorder,
                id_generator: self
                    .id_generator
                    .unwrap_or_else(|| Arc::new(RandomIdGenerator::default())),
            }),
        }
    }
}
