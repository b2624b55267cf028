//! Explicitly passed causal context.
//!
//! A [`Context`] is an immutable value handed from caller to callee through
//! every instrumented call boundary. It answers three questions for the
//! [`Instrumenter`]:
//!
//! * which observation is the causal parent of a new one
//!   ([`Context::active_observation`], else [`Context::remote_parent`]);
//! * which observations enclose the current point, nearest first
//!   ([`Context::observations`]), used to suppress nested duplicates;
//! * whether instrumentation is suppressed altogether.
//!
//! There is no thread-local "current" context: whoever calls into an
//! instrumented operation passes the context it holds.
//!
//! [`Instrumenter`]: crate::Instrumenter
use crate::baggage::{self, Baggage};
use crate::instrumenter::Observation;
use crate::propagation::CarrierContext;
use crate::trace::SpanContext;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

type EntryMap = HashMap<TypeId, Arc<dyn Any + Sync + Send>>;

/// An immutable collection of execution-scoped values.
///
/// Write operations return a new context containing the original values and
/// the new one; clones are cheap.
///
/// # Examples
///
/// ```
/// use opentelemetry_instrumentation::Context;
///
/// #[derive(Debug, PartialEq)]
/// struct TenantId(u64);
///
/// let cx = Context::new().with_value(TenantId(7));
/// let suppressed = cx.with_instrumentation_suppressed();
///
/// assert_eq!(suppressed.get::<TenantId>(), Some(&TenantId(7)));
/// assert!(suppressed.is_instrumentation_suppressed());
/// assert!(!cx.is_instrumentation_suppressed());
/// ```
#[derive(Clone, Default)]
pub struct Context {
    observation: Option<Observation>,
    remote_parent: Option<Arc<SpanContext>>,
    entries: Option<Arc<EntryMap>>,
    suppress_instrumentation: bool,
}

impl Context {
    /// Creates an empty `Context`: no parent, no baggage, not suppressed.
    pub fn new() -> Self {
        Context::default()
    }

    /// Returns a reference to the entry for the corresponding value type.
    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.entries
            .as_ref()?
            .get(&TypeId::of::<T>())?
            .downcast_ref()
    }

    /// Returns a copy of the context with the new value included.
    pub fn with_value<T: 'static + Send + Sync>(&self, value: T) -> Self {
        let mut entries = self
            .entries
            .as_ref()
            .map(|current| (**current).clone())
            .unwrap_or_default();
        entries.insert(TypeId::of::<T>(), Arc::new(value));
        Context {
            entries: Some(Arc::new(entries)),
            ..self.clone()
        }
    }

    /// Returns a copy of the context whose causal parent is the given remote
    /// span context, typically one extracted from an incoming carrier.
    ///
    /// Any local active observation is cleared: the remote parent becomes the
    /// nearest parent.
    pub fn with_remote_parent(&self, span_context: SpanContext) -> Self {
        Context {
            observation: None,
            remote_parent: Some(Arc::new(span_context)),
            ..self.clone()
        }
    }

    /// The remote parent, if one was extracted into this context.
    pub fn remote_parent(&self) -> Option<&SpanContext> {
        self.remote_parent.as_deref()
    }

    pub(crate) fn with_observation(&self, observation: Observation) -> Self {
        Context {
            observation: Some(observation),
            ..self.clone()
        }
    }

    /// The nearest enclosing observation started in this process, if any.
    pub fn active_observation(&self) -> Option<&Observation> {
        self.observation.as_ref()
    }

    /// Iterates over the enclosing observations, nearest first.
    pub fn observations(&self) -> Observations<'_> {
        Observations {
            next: self.observation.as_ref(),
        }
    }

    /// The span context of the causal parent: the active observation, else
    /// the remote parent.
    pub fn parent_span_context(&self) -> Option<&SpanContext> {
        self.observation
            .as_ref()
            .map(Observation::span_context)
            .or_else(|| self.remote_parent())
            .filter(|span_context| span_context.is_valid())
    }

    /// Returns a copy of the context in which no instrumenter starts an
    /// observation.
    pub fn with_instrumentation_suppressed(&self) -> Self {
        Context {
            suppress_instrumentation: true,
            ..self.clone()
        }
    }

    /// Returns whether instrumentation is suppressed in this context.
    #[inline]
    pub fn is_instrumentation_suppressed(&self) -> bool {
        self.suppress_instrumentation
    }

    /// Returns a copy of the context carrying the given baggage, replacing any
    /// previous baggage.
    ///
    /// ```
    /// use opentelemetry_instrumentation::{Context, KeyValue};
    ///
    /// let cx = Context::new().with_baggage([KeyValue::new("user.id", "42")]);
    /// assert_eq!(cx.baggage().get("user.id"), Some("42"));
    /// ```
    pub fn with_baggage<T: Into<Baggage>>(&self, baggage: T) -> Self {
        self.with_value(BaggageContextValue(baggage.into()))
    }

    /// The baggage of this context, empty when none was set.
    pub fn baggage(&self) -> &Baggage {
        self.get::<BaggageContextValue>()
            .map_or(baggage::empty(), |b| &b.0)
    }

    /// Snapshot of the identifiers to inject into one outgoing carrier.
    pub fn carrier_context(&self) -> CarrierContext {
        CarrierContext::new(
            self.parent_span_context()
                .cloned()
                .unwrap_or_else(SpanContext::empty_context),
            self.baggage().clone(),
        )
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("Context");
        match &self.observation {
            Some(observation) => dbg.field("observation", observation.span_context()),
            None => dbg.field("observation", &"None"),
        };
        dbg.field("remote_parent", &self.remote_parent)
            .field("entries count", &self.entries.as_ref().map_or(0, |e| e.len()))
            .field("suppress_instrumentation", &self.suppress_instrumentation)
            .finish()
    }
}

#[derive(Debug)]
struct BaggageContextValue(Baggage);

/// Iterator over the enclosing observations of a [`Context`], nearest first.
#[derive(Debug)]
pub struct Observations<'a> {
    next: Option<&'a Observation>,
}

impl<'a> Iterator for Observations<'a> {
    type Item = &'a Observation;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.parent();
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{SpanId, TraceFlags, TraceId, TraceState};
    use crate::KeyValue;

    fn remote() -> SpanContext {
        SpanContext::new(
            TraceId::from(0xabu128),
            SpanId::from(0xcdu64),
            TraceFlags::SAMPLED,
            true,
            TraceState::NONE,
        )
    }

    #[test]
    fn values_are_copied_on_write() {
        #[derive(Debug, PartialEq)]
        struct ValueA(&'static str);
        #[derive(Debug, PartialEq)]
        struct ValueB(u64);

        let cx_a = Context::new().with_value(ValueA("a"));
        let cx_ab = cx_a.with_value(ValueB(42));

        assert_eq!(cx_a.get::<ValueB>(), None);
        assert_eq!(cx_ab.get::<ValueA>(), Some(&ValueA("a")));
        assert_eq!(cx_ab.get::<ValueB>(), Some(&ValueB(42)));
    }

    #[test]
    fn empty_context_has_no_parent() {
        let cx = Context::new();
        assert!(cx.parent_span_context().is_none());
        assert!(cx.active_observation().is_none());
        assert_eq!(cx.observations().count(), 0);
        assert!(!cx.carrier_context().span_context().is_valid());
    }

    #[test]
    fn remote_parent_is_the_causal_parent() {
        let cx = Context::new().with_remote_parent(remote());
        assert_eq!(cx.parent_span_context(), Some(&remote()));
        assert_eq!(cx.carrier_context().span_context(), &remote());
    }

    #[test]
    fn invalid_remote_parent_is_ignored() {
        let cx = Context::new().with_remote_parent(SpanContext::empty_context());
        assert!(cx.parent_span_context().is_none());
    }

    #[test]
    fn baggage_survives_other_writes() {
        let cx = Context::new()
            .with_baggage([KeyValue::new("k", "v")])
            .with_instrumentation_suppressed()
            .with_remote_parent(remote());
        assert_eq!(cx.baggage().get("k"), Some("v"));
        assert_eq!(cx.carrier_context().baggage().get("k"), Some("v"));
        assert!(Context::new().baggage().is_empty());
    }
}
