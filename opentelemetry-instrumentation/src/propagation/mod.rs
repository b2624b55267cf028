//! # Context carrier codec
//!
//! Moves the causal identifiers of a [`Context`] into an outgoing carrier
//! (request headers, message properties) and back out of an incoming one.
//!
//! The codec only needs get, set and enumerate operations on a carrier,
//! expressed by the [`Injector`] and [`Extractor`] traits. A
//! [`TextMapPropagator`] encodes one cross-cutting concern, such as the W3C
//! [`TraceContextPropagator`] or the [`BaggagePropagator`], and
//! [`ContextPropagators`] is the façade used by instrumentations.
//!
//! ## Multi-valued carriers
//!
//! A carrier may hold several values under one key. On extraction every
//! propagator folds them with the same rule used when baggage is built:
//! the **first** value wins. On injection a reserved key is replaced by a
//! single value, overwriting whatever stale values the carrier held.
//!
//! [`Context`]: crate::Context
use crate::baggage::Baggage;
use crate::trace::SpanContext;
use crate::Context;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

mod baggage;
mod composite;
mod trace_context;

pub use baggage::BaggagePropagator;
pub use composite::TextMapCompositePropagator;
pub use trace_context::TraceContextPropagator;

/// Injector provides an interface for adding fields to an underlying carrier
/// like a `HashMap`.
pub trait Injector {
    /// Set a key to a single value, replacing any existing values.
    fn set(&mut self, key: &str, value: String);

    #[allow(unused_variables)]
    /// Hint to reserve capacity for at least `additional` more entries to be inserted.
    fn reserve(&mut self, additional: usize) {}
}

/// Extractor provides an interface for reading fields from an underlying
/// carrier like a `HashMap`.
pub trait Extractor {
    /// Get the first value for a key from the underlying data.
    fn get(&self, key: &str) -> Option<Cow<'_, str>>;

    /// Collect all the keys from the underlying data.
    fn keys(&self) -> Vec<Cow<'_, str>>;

    /// Get all values for a key from the underlying data, in carrier order.
    fn get_all(&self, key: &str) -> Option<Vec<Cow<'_, str>>> {
        self.get(key).map(|value| vec![value])
    }
}

impl<S: std::hash::BuildHasher> Injector for HashMap<String, String, S> {
    /// Set a key and value in the HashMap. Keys are lowercased.
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_lowercase(), value);
    }

    fn reserve(&mut self, additional: usize) {
        self.reserve(additional);
    }
}

impl<S: std::hash::BuildHasher> Extractor for HashMap<String, String, S> {
    /// Get a value for a key from the HashMap, case-insensitively.
    fn get(&self, key: &str) -> Option<Cow<'_, str>> {
        self.get(&key.to_lowercase())
            .map(|v| Cow::Borrowed(v.as_str()))
    }

    fn keys(&self) -> Vec<Cow<'_, str>> {
        self.keys()
            .map(|k| Cow::Borrowed(k.as_str()))
            .collect::<Vec<_>>()
    }
}

impl<S: std::hash::BuildHasher> Injector for HashMap<String, Vec<String>, S> {
    /// Replace every value of a key with a single one. Keys are lowercased.
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_lowercase(), vec![value]);
    }

    fn reserve(&mut self, additional: usize) {
        self.reserve(additional);
    }
}

impl<S: std::hash::BuildHasher> Extractor for HashMap<String, Vec<String>, S> {
    /// The first value of a key, case-insensitively.
    fn get(&self, key: &str) -> Option<Cow<'_, str>> {
        self.get(&key.to_lowercase())
            .and_then(|values| values.first())
            .map(|v| Cow::Borrowed(v.as_str()))
    }

    fn keys(&self) -> Vec<Cow<'_, str>> {
        self.keys()
            .map(|k| Cow::Borrowed(k.as_str()))
            .collect::<Vec<_>>()
    }

    fn get_all(&self, key: &str) -> Option<Vec<Cow<'_, str>>> {
        self.get(&key.to_lowercase())
            .filter(|values| !values.is_empty())
            .map(|values| values.iter().map(|v| Cow::Borrowed(v.as_str())).collect())
    }
}

/// Immutable snapshot of the identifiers injected into one carrier: the span
/// context of the causal parent and the baggage.
///
/// Derived from a [`Context`] with [`Context::carrier_context`].
#[derive(Clone, Debug, PartialEq)]
pub struct CarrierContext {
    span_context: SpanContext,
    baggage: Baggage,
}

impl CarrierContext {
    /// Create a snapshot from its parts.
    pub fn new(span_context: SpanContext, baggage: Baggage) -> Self {
        CarrierContext {
            span_context,
            baggage,
        }
    }

    /// The propagated span context, invalid when there is no parent.
    pub fn span_context(&self) -> &SpanContext {
        &self.span_context
    }

    /// The propagated baggage.
    pub fn baggage(&self) -> &Baggage {
        &self.baggage
    }

    /// Returns a copy with the span context replaced.
    pub fn with_span_context(self, span_context: SpanContext) -> Self {
        CarrierContext {
            span_context,
            ..self
        }
    }

    /// Returns a copy with the baggage replaced.
    pub fn with_baggage(self, baggage: Baggage) -> Self {
        CarrierContext { baggage, ..self }
    }
}

impl Default for CarrierContext {
    fn default() -> Self {
        CarrierContext::new(SpanContext::empty_context(), Baggage::default())
    }
}

/// Methods to inject and extract a [`CarrierContext`] as text into carriers
/// that travel in-band across process boundaries.
pub trait TextMapPropagator: fmt::Debug {
    /// Encodes the values of the snapshot and injects them into the `Injector`.
    fn inject(&self, cx: &CarrierContext, injector: &mut dyn Injector);

    /// Decodes the carrier's values on top of `cx`. Concerns whose keys are
    /// absent or malformed leave `cx` unchanged.
    fn extract(&self, cx: CarrierContext, extractor: &dyn Extractor) -> CarrierContext;

    /// Returns an iterator over the keys this propagator reads and writes.
    fn fields(&self) -> FieldIter<'_>;
}

/// An iterator over the fields of a [`TextMapPropagator`].
#[derive(Debug)]
pub struct FieldIter<'a>(std::slice::Iter<'a, String>);

impl<'a> FieldIter<'a> {
    /// Create a new `FieldIter` from a slice of propagator fields
    pub fn new(fields: &'a [String]) -> Self {
        FieldIter(fields.iter())
    }
}

impl<'a> Iterator for FieldIter<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|field| field.as_str())
    }
}

/// The propagators used by instrumentations to inject into and extract from
/// carriers.
///
/// Defaults to W3C trace context followed by W3C baggage.
#[derive(Clone, Debug)]
pub struct ContextPropagators {
    propagator: Arc<dyn TextMapPropagator + Send + Sync>,
}

impl Default for ContextPropagators {
    fn default() -> Self {
        ContextPropagators::new(TextMapCompositePropagator::new(vec![
            Box::new(TraceContextPropagator::new()),
            Box::new(BaggagePropagator::new()),
        ]))
    }
}

impl ContextPropagators {
    /// Wrap a single, possibly composite, propagator.
    pub fn new<P>(propagator: P) -> Self
    where
        P: TextMapPropagator + Send + Sync + 'static,
    {
        ContextPropagators {
            propagator: Arc::new(propagator),
        }
    }

    /// Propagators that neither inject nor extract anything.
    pub fn noop() -> Self {
        ContextPropagators::new(TextMapCompositePropagator::new(Vec::new()))
    }

    /// The underlying text map propagator.
    pub fn text_map_propagator(&self) -> &(dyn TextMapPropagator + Send + Sync) {
        self.propagator.as_ref()
    }

    /// Injects the identifiers of `cx` into a carrier that is mutable by
    /// contract, overwriting stale values of reserved keys.
    pub fn inject_context(&self, cx: &Context, injector: &mut dyn Injector) {
        self.propagator.inject(&cx.carrier_context(), injector);
    }

    /// Returns a copy of `carrier` with the identifiers of `cx` merged in.
    ///
    /// Unrelated entries are preserved, reserved keys are overwritten, and the
    /// caller's carrier is left untouched.
    ///
    /// ```
    /// use opentelemetry_instrumentation::propagation::ContextPropagators;
    /// use opentelemetry_instrumentation::Context;
    /// use std::collections::HashMap;
    ///
    /// let mut headers = HashMap::new();
    /// headers.insert("accept".to_string(), "text/plain".to_string());
    ///
    /// let cx = Context::new().with_baggage([opentelemetry_instrumentation::KeyValue::new("k", "v")]);
    /// let injected = ContextPropagators::default().inject(&cx, &headers);
    ///
    /// assert_eq!(injected.get("baggage").map(String::as_str), Some("k=v"));
    /// assert_eq!(injected.get("accept").map(String::as_str), Some("text/plain"));
    /// assert!(!headers.contains_key("baggage"));
    /// ```
    pub fn inject<C>(&self, cx: &Context, carrier: &C) -> C
    where
        C: Injector + Clone,
    {
        let mut injected = carrier.clone();
        self.inject_context(cx, &mut injected);
        injected
    }

    /// Extracts a context from the carrier. Without recognised keys the
    /// result has no parent.
    pub fn extract(&self, extractor: &dyn Extractor) -> Context {
        self.extract_with_context(&Context::new(), extractor)
    }

    /// Extracts on top of `cx`: an extracted span context becomes its remote
    /// parent and extracted baggage replaces its baggage.
    pub fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
        let seed = CarrierContext::new(SpanContext::empty_context(), cx.baggage().clone());
        let extracted = self.propagator.extract(seed, extractor);

        let cx = if extracted.baggage() != cx.baggage() {
            cx.with_baggage(extracted.baggage().clone())
        } else {
            cx.clone()
        };
        if extracted.span_context().is_valid() {
            cx.with_remote_parent(extracted.span_context().clone())
        } else {
            cx
        }
    }

    /// The keys the propagators read and write.
    pub fn fields(&self) -> FieldIter<'_> {
        self.propagator.fields()
    }
}
