//! # W3C Trace Context Propagator
//!
use crate::propagation::{CarrierContext, Extractor, FieldIter, Injector, TextMapPropagator};
use crate::error::{InstrumentationError, InstrumentationResult};
use crate::otel_debug;
use crate::trace::{SpanContext, SpanId, TraceFlags, TraceId, TraceState};
use once_cell::sync::Lazy;
use std::str::FromStr;

const SUPPORTED_VERSION: u8 = 0;
const MAX_VERSION: u8 = 254;
const TRACEPARENT_HEADER: &str = "traceparent";
const TRACESTATE_HEADER: &str = "tracestate";

static TRACE_CONTEXT_HEADER_FIELDS: Lazy<[String; 2]> =
    Lazy::new(|| [TRACEPARENT_HEADER.to_owned(), TRACESTATE_HEADER.to_owned()]);

/// Propagates span contexts in [W3C TraceContext] format under the
/// `traceparent` and `tracestate` keys.
///
/// `traceparent: 00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01`
///
/// The four dash separated fields are version, trace id, parent span id and
/// trace flags. Only the `sampled` flag is propagated.
///
/// When a carrier holds several `traceparent` or `tracestate` values, the
/// first one is used.
///
/// [W3C TraceContext]: https://www.w3.org/TR/trace-context/
#[derive(Clone, Debug, Default)]
pub struct TraceContextPropagator {
    _private: (),
}

impl TraceContextPropagator {
    /// Create a new `TraceContextPropagator`.
    pub fn new() -> Self {
        TraceContextPropagator { _private: () }
    }

    /// Decodes a `traceparent` value, with the carrier's `tracestate`.
    fn decode(
        &self,
        traceparent: &str,
        extractor: &dyn Extractor,
    ) -> InstrumentationResult<SpanContext> {
        let parts = traceparent.trim().split_terminator('-').collect::<Vec<&str>>();
        if parts.len() < 4 {
            return Err(invalid("expected at least four fields"));
        }

        let is_lower_hex =
            |part: &str, len: usize| part.len() == len && part.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));

        if !is_lower_hex(parts[0], 2) {
            return Err(invalid("malformed version"));
        }
        let version = u8::from_str_radix(parts[0], 16).map_err(|_| invalid("malformed version"))?;
        if version > MAX_VERSION {
            return Err(invalid("forbidden version"));
        }
        // Version 0 has exactly four fields.
        if version == SUPPORTED_VERSION && parts.len() != 4 {
            return Err(invalid("unexpected fields for version 00"));
        }

        if !is_lower_hex(parts[1], 32) {
            return Err(invalid("malformed trace id"));
        }
        if !is_lower_hex(parts[2], 16) {
            return Err(invalid("malformed parent id"));
        }
        if !is_lower_hex(parts[3], 2) {
            return Err(invalid("malformed trace flags"));
        }
        let trace_id = TraceId::from_hex(parts[1]).map_err(|_| invalid("malformed trace id"))?;
        let span_id = SpanId::from_hex(parts[2]).map_err(|_| invalid("malformed parent id"))?;
        let opts = u8::from_str_radix(parts[3], 16).map_err(|_| invalid("malformed trace flags"))?;
        if version == SUPPORTED_VERSION && opts > 2 {
            return Err(invalid("unknown trace flags for version 00"));
        }

        // Only the sampled bit is kept.
        let trace_flags = TraceFlags::default().with_sampled(TraceFlags::new(opts).is_sampled());

        let trace_state = match extractor.get(TRACESTATE_HEADER) {
            Some(trace_state_str) => TraceState::from_str(&trace_state_str).unwrap_or_else(|err| {
                otel_debug!(
                    name: "TraceContextPropagator.InvalidTraceState",
                    reason = err.to_string(),
                );
                TraceState::default()
            }),
            None => TraceState::default(),
        };

        let span_context = SpanContext::new(trace_id, span_id, trace_flags, true, trace_state);
        if !span_context.is_valid() {
            return Err(invalid("all-zero trace id or parent id"));
        }
        Ok(span_context)
    }
}

fn invalid(reason: &str) -> InstrumentationError {
    InstrumentationError::Propagation(format!("invalid {TRACEPARENT_HEADER}: {reason}"))
}

impl TextMapPropagator for TraceContextPropagator {
    /// Encodes the span context and injects it, replacing any previous
    /// `traceparent` and `tracestate` values. Nothing is injected for an
    /// invalid span context.
    fn inject(&self, cx: &CarrierContext, injector: &mut dyn Injector) {
        let span_context = cx.span_context();
        if span_context.is_valid() {
            let header_value = format!(
                "{:02x}-{}-{}-{:02x}",
                SUPPORTED_VERSION,
                span_context.trace_id(),
                span_context.span_id(),
                u8::from(span_context.is_sampled())
            );
            injector.set(TRACEPARENT_HEADER, header_value);
            injector.set(TRACESTATE_HEADER, span_context.trace_state().header());
        }
    }

    /// Decodes a remote span context. A missing or invalid `traceparent`
    /// leaves `cx` unchanged.
    fn extract(&self, cx: CarrierContext, extractor: &dyn Extractor) -> CarrierContext {
        let Some(traceparent) = extractor.get(TRACEPARENT_HEADER) else {
            return cx;
        };
        match self.decode(&traceparent, extractor) {
            Ok(span_context) => cx.with_span_context(span_context),
            Err(err) => {
                otel_debug!(
                    name: "TraceContextPropagator.InvalidTraceParent",
                    error = err.to_string(),
                );
                cx
            }
        }
    }

    fn fields(&self) -> FieldIter<'_> {
        FieldIter::new(&*TRACE_CONTEXT_HEADER_FIELDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    const TRACE_ID: u128 = 0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736;
    const SPAN_ID: u64 = 0x00f0_67aa_0ba9_02b7;

    fn span_context(flags: TraceFlags, trace_state: &str) -> SpanContext {
        SpanContext::new(
            TraceId::from(TRACE_ID),
            SpanId::from(SPAN_ID),
            flags,
            true,
            TraceState::from_str(trace_state).unwrap(),
        )
    }

    fn extract(traceparent: &str, tracestate: Option<&str>) -> SpanContext {
        let mut extractor = HashMap::new();
        extractor.insert(TRACEPARENT_HEADER.to_string(), traceparent.to_string());
        if let Some(state) = tracestate {
            extractor.insert(TRACESTATE_HEADER.to_string(), state.to_string());
        }
        TraceContextPropagator::new()
            .extract(CarrierContext::default(), &extractor)
            .span_context()
            .clone()
    }

    #[rstest]
    #[case("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-00", TraceFlags::default())]
    #[case("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01", TraceFlags::SAMPLED)]
    #[case("02-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01", TraceFlags::SAMPLED)]
    #[case("02-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-09", TraceFlags::SAMPLED)]
    #[case("02-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-08", TraceFlags::default())]
    #[case("02-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-09-XYZxsf09", TraceFlags::SAMPLED)]
    #[case("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01-", TraceFlags::SAMPLED)]
    fn extract_w3c(#[case] traceparent: &str, #[case] flags: TraceFlags) {
        assert_eq!(
            extract(traceparent, Some("foo=bar")),
            span_context(flags, "foo=bar")
        );
    }

    #[rstest]
    #[case("0000-00000000000000000000000000000000-0000000000000000-01", "wrong version length")]
    #[case("00-ab00000000000000000000000000000000-cd00000000000000-01", "wrong trace ID length")]
    #[case("00-ab000000000000000000000000000000-cd0000000000000000-01", "wrong span ID length")]
    #[case("00-ab000000000000000000000000000000-cd00000000000000-0100", "wrong trace flag length")]
    #[case("qw-00000000000000000000000000000000-0000000000000000-01", "bogus version")]
    #[case("00-qw000000000000000000000000000000-cd00000000000000-01", "bogus trace ID")]
    #[case("00-ab000000000000000000000000000000-qw00000000000000-01", "bogus span ID")]
    #[case("00-ab000000000000000000000000000000-cd00000000000000-qw", "bogus trace flag")]
    #[case("A0-00000000000000000000000000000000-0000000000000000-01", "upper case version")]
    #[case("00-AB000000000000000000000000000000-cd00000000000000-01", "upper case trace ID")]
    #[case("00-ab000000000000000000000000000000-CD00000000000000-01", "upper case span ID")]
    #[case("00-ab000000000000000000000000000000-cd00000000000000-A1", "upper case trace flag")]
    #[case("00-00000000000000000000000000000000-0000000000000000-01", "zero trace ID and span ID")]
    #[case("00-ab000000000000000000000000000000-cd00000000000000-09", "trace-flag unused bits set")]
    #[case("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7", "missing options")]
    #[case("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-", "empty options")]
    #[case("ff-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01", "forbidden version")]
    #[case("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01-extra", "extra part for version 0")]
    fn extract_w3c_reject_invalid(#[case] traceparent: &str, #[case] reason: &str) {
        assert_eq!(
            extract(traceparent, None),
            SpanContext::empty_context(),
            "{}",
            reason
        );
        let decoded =
            TraceContextPropagator::new().decode(traceparent, &HashMap::<String, String>::new());
        assert!(
            matches!(decoded, Err(InstrumentationError::Propagation(_))),
            "{}",
            reason
        );
    }

    #[test]
    fn decode_error_names_the_field() {
        let err = TraceContextPropagator::new()
            .decode(
                "00-4bf92f3577b34da6a3ce929d0e0e4736-qw00000000000000-01",
                &HashMap::<String, String>::new(),
            )
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "propagation failed: invalid traceparent: malformed parent id"
        );
    }

    #[test]
    fn invalid_tracestate_keeps_traceparent() {
        let extracted = extract(
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
            Some("Not Valid"),
        );
        assert!(extracted.is_valid());
        assert_eq!(extracted.trace_state(), &TraceState::default());
    }

    #[test]
    fn first_traceparent_wins() {
        let mut extractor: HashMap<String, Vec<String>> = HashMap::new();
        extractor.insert(
            TRACEPARENT_HEADER.to_string(),
            vec![
                "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01".to_string(),
                "00-11111111111111111111111111111111-2222222222222222-01".to_string(),
            ],
        );
        let cx = TraceContextPropagator::new().extract(CarrierContext::default(), &extractor);
        assert_eq!(cx.span_context().trace_id(), TraceId::from(TRACE_ID));
    }

    #[rstest]
    #[case(TraceFlags::SAMPLED, "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")]
    #[case(TraceFlags::default(), "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-00")]
    #[case(TraceFlags::new(0xff), "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")]
    fn inject_w3c(#[case] flags: TraceFlags, #[case] expected: &str) {
        let mut injector: HashMap<String, String> = HashMap::new();
        let cx = CarrierContext::default().with_span_context(span_context(flags, "foo=bar"));
        TraceContextPropagator::new().inject(&cx, &mut injector);

        assert_eq!(injector.get(TRACEPARENT_HEADER).map(String::as_str), Some(expected));
        assert_eq!(injector.get(TRACESTATE_HEADER).map(String::as_str), Some("foo=bar"));
    }

    #[test]
    fn inject_nothing_without_parent() {
        let mut injector: HashMap<String, String> = HashMap::new();
        injector.set(TRACESTATE_HEADER, "stale=1".to_string());

        TraceContextPropagator::new().inject(&CarrierContext::default(), &mut injector);

        assert_eq!(injector.len(), 1);
        assert_eq!(injector.get(TRACESTATE_HEADER).map(String::as_str), Some("stale=1"));
    }

    #[test]
    fn inject_overwrites_stale_values() {
        let mut injector: HashMap<String, String> = HashMap::new();
        injector.set(TRACEPARENT_HEADER, "00-stale".to_string());
        let cx = CarrierContext::default().with_span_context(span_context(TraceFlags::SAMPLED, ""));

        TraceContextPropagator::new().inject(&cx, &mut injector);

        assert_eq!(
            injector.get(TRACEPARENT_HEADER).map(String::as_str),
            Some("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
        );
    }
}
