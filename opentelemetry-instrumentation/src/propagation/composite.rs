//! # Composite Propagator
//!
//! Groups several [`TextMapPropagator`]s into one, so that an instrumentation
//! injects and extracts every concern with a single call.
use crate::propagation::{CarrierContext, Extractor, FieldIter, Injector, TextMapPropagator};
use std::collections::HashSet;

/// Composite propagator for [`TextMapPropagator`]s.
///
/// Injection and extraction preserve the order of the propagators passed in
/// during initialization; each extraction builds on the result of the
/// previous one.
#[derive(Debug)]
pub struct TextMapCompositePropagator {
    propagators: Vec<Box<dyn TextMapPropagator + Send + Sync>>,
    fields: Vec<String>,
}

impl TextMapCompositePropagator {
    /// Constructs a new propagator out of instances of [`TextMapPropagator`].
    pub fn new(propagators: Vec<Box<dyn TextMapPropagator + Send + Sync>>) -> Self {
        let mut seen = HashSet::new();
        let mut fields = Vec::new();
        for propagator in &propagators {
            for field in propagator.fields() {
                if seen.insert(field.to_string()) {
                    fields.push(field.to_string());
                }
            }
        }

        TextMapCompositePropagator {
            propagators,
            fields,
        }
    }
}

impl TextMapPropagator for TextMapCompositePropagator {
    fn inject(&self, cx: &CarrierContext, injector: &mut dyn Injector) {
        injector.reserve(self.fields.len());
        for propagator in &self.propagators {
            propagator.inject(cx, injector)
        }
    }

    fn extract(&self, cx: CarrierContext, extractor: &dyn Extractor) -> CarrierContext {
        self.propagators
            .iter()
            .fold(cx, |current_cx, propagator| {
                propagator.extract(current_cx, extractor)
            })
    }

    fn fields(&self) -> FieldIter<'_> {
        FieldIter::new(self.fields.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::propagation::{BaggagePropagator, TraceContextPropagator};
    use crate::trace::{SpanContext, SpanId, TraceFlags, TraceId, TraceState};
    use crate::KeyValue;
    use std::collections::HashMap;

    fn composite() -> TextMapCompositePropagator {
        TextMapCompositePropagator::new(vec![
            Box::new(TraceContextPropagator::new()),
            Box::new(BaggagePropagator::new()),
        ])
    }

    fn snapshot() -> CarrierContext {
        CarrierContext::new(
            SpanContext::new(
                TraceId::from(1u128),
                SpanId::from(11u64),
                TraceFlags::SAMPLED,
                false,
                TraceState::default(),
            ),
            [KeyValue::new("baggagekey", "value")].into_iter().collect(),
        )
    }

    #[test]
    fn zero_propagators_are_noop() {
        let propagator = TextMapCompositePropagator::new(vec![]);
        let mut injector: HashMap<String, String> = HashMap::new();
        propagator.inject(&snapshot(), &mut injector);
        assert!(injector.is_empty());

        let extracted = propagator.extract(CarrierContext::default(), &injector);
        assert_eq!(extracted, CarrierContext::default());
        assert_eq!(propagator.fields().count(), 0);
    }

    #[test]
    fn inject_then_extract_round_trips() {
        let propagator = composite();
        let mut carrier: HashMap<String, String> = HashMap::new();
        propagator.inject(&snapshot(), &mut carrier);

        assert!(carrier.contains_key("traceparent"));
        assert_eq!(carrier.get("baggage").map(String::as_str), Some("baggagekey=value"));

        let extracted = propagator.extract(CarrierContext::default(), &carrier);
        assert_eq!(extracted.span_context().trace_id(), TraceId::from(1u128));
        assert_eq!(extracted.span_context().span_id(), SpanId::from(11u64));
        assert!(extracted.span_context().is_sampled());
        assert!(extracted.span_context().is_remote());
        assert_eq!(extracted.baggage().get("baggagekey"), Some("value"));
    }

    #[test]
    fn fields_are_deduplicated_in_order() {
        let propagator = TextMapCompositePropagator::new(vec![
            Box::new(TraceContextPropagator::new()),
            Box::new(BaggagePropagator::new()),
            Box::new(TraceContextPropagator::new()),
        ]);
        let fields: Vec<&str> = propagator.fields().collect();
        assert_eq!(fields, vec!["traceparent", "tracestate", "baggage"]);
    }
}
