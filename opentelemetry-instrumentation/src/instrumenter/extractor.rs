//! Pluggable functions deriving the name, kind, status and attributes of an
//! observation from the request and response of the wrapped operation.
//!
//! Every extractor trait is implemented for plain closures of the matching
//! shape, so most instrumentations never name these traits.
use crate::instrumenter::Outcome;
use crate::trace::SpanKind;
use crate::{Context, KeyValue};
use std::error::Error;

/// Derives attributes of an observation.
///
/// [`on_start`] runs when the observation starts, [`on_end`] when it ends,
/// and the attributes pushed by both are merged into the observation. A
/// request-only extractor implements `on_start` and keeps the default
/// `on_end`.
///
/// Closures `Fn(&mut Vec<KeyValue>, &Context, &Req)` are request-only
/// extractors:
///
/// ```
/// use opentelemetry_instrumentation::{AttributesExtractor, Context, KeyValue};
///
/// struct Query(&'static str);
///
/// fn extractor() -> impl AttributesExtractor<Query, ()> {
///     |attributes: &mut Vec<KeyValue>, _cx: &Context, query: &Query| {
///         attributes.push(KeyValue::new("db.statement", query.0));
///     }
/// }
/// ```
///
/// [`on_start`]: AttributesExtractor::on_start
/// [`on_end`]: AttributesExtractor::on_end
pub trait AttributesExtractor<Req, Resp>: Send + Sync {
    /// Extracts attributes from the request before the operation runs.
    fn on_start(&self, attributes: &mut Vec<KeyValue>, parent_cx: &Context, request: &Req);

    /// Extracts attributes once the operation finished. Exactly one of
    /// `response` and `error` is usually set; both are `None` when the
    /// operation was cancelled.
    fn on_end(
        &self,
        _attributes: &mut Vec<KeyValue>,
        _cx: &Context,
        _request: &Req,
        _response: Option<&Resp>,
        _error: Option<&(dyn Error + 'static)>,
    ) {
    }
}

impl<Req, Resp, F> AttributesExtractor<Req, Resp> for F
where
    F: Fn(&mut Vec<KeyValue>, &Context, &Req) + Send + Sync,
{
    fn on_start(&self, attributes: &mut Vec<KeyValue>, parent_cx: &Context, request: &Req) {
        self(attributes, parent_cx, request)
    }
}

/// Derives the name of an observation from the request.
pub trait SpanNameExtractor<Req>: Send + Sync {
    /// The observation name.
    fn extract(&self, request: &Req) -> String;
}

impl<Req, F> SpanNameExtractor<Req> for F
where
    F: Fn(&Req) -> String + Send + Sync,
{
    fn extract(&self, request: &Req) -> String {
        self(request)
    }
}

/// Derives the [`SpanKind`] of an observation from the request.
pub trait SpanKindExtractor<Req>: Send + Sync {
    /// The observation kind.
    fn extract(&self, request: &Req) -> SpanKind;
}

impl<Req, F> SpanKindExtractor<Req> for F
where
    F: Fn(&Req) -> SpanKind + Send + Sync,
{
    fn extract(&self, request: &Req) -> SpanKind {
        self(request)
    }
}

/// A kind extractor returning the same kind for every request.
#[derive(Clone, Copy, Debug)]
pub struct ConstantKind(pub SpanKind);

impl<Req> SpanKindExtractor<Req> for ConstantKind {
    fn extract(&self, _request: &Req) -> SpanKind {
        self.0
    }
}

/// Classifies a finished operation as [`Outcome::Success`] or
/// [`Outcome::Failure`].
pub trait SpanStatusExtractor<Req, Resp>: Send + Sync {
    /// The terminal outcome. Returning [`Outcome::Pending`] is treated as
    /// the default classification.
    fn extract(
        &self,
        request: &Req,
        response: Option<&Resp>,
        error: Option<&(dyn Error + 'static)>,
    ) -> Outcome;
}

impl<Req, Resp, F> SpanStatusExtractor<Req, Resp> for F
where
    F: Fn(&Req, Option<&Resp>, Option<&(dyn Error + 'static)>) -> Outcome + Send + Sync,
{
    fn extract(
        &self,
        request: &Req,
        response: Option<&Resp>,
        error: Option<&(dyn Error + 'static)>,
    ) -> Outcome {
        self(request, response, error)
    }
}

/// The default classification: an error means failure.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultStatusExtractor;

impl DefaultStatusExtractor {
    pub(crate) fn classify(error: Option<&(dyn Error + 'static)>) -> Outcome {
        if error.is_some() {
            Outcome::Failure
        } else {
            Outcome::Success
        }
    }
}

impl<Req, Resp> SpanStatusExtractor<Req, Resp> for DefaultStatusExtractor {
    fn extract(
        &self,
        _request: &Req,
        _response: Option<&Resp>,
        error: Option<&(dyn Error + 'static)>,
    ) -> Outcome {
        DefaultStatusExtractor::classify(error)
    }
}
