//! Trace identifiers and span metadata shared by observations and the
//! propagation codec.
//!
//! An observation is identified by a [`SpanContext`]: a [`TraceId`] shared by
//! every observation of one causal tree, a [`SpanId`] unique to the
//! observation, and [`TraceFlags`] carrying the sampling decision.
use std::fmt;

mod id_generator;
mod span_context;

pub use id_generator::{IdGenerator, RandomIdGenerator};
pub use span_context::{
    SpanContext, SpanId, TraceFlags, TraceId, TraceState, TraceStateError,
};

/// `SpanKind` describes the relationship between the observation, its parent,
/// and its children in a trace.
///
/// Two nested observations of the same non-[`Internal`] kind describe the
/// same logical operation twice, so the inner one is suppressed.
///
/// [`Internal`]: SpanKind::Internal
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SpanKind {
    /// Outgoing request to a remote service, e.g. an HTTP client call.
    Client,
    /// Handling of an incoming request from a remote client.
    Server,
    /// Enqueueing a message for asynchronous processing.
    Producer,
    /// Processing a message enqueued by a producer.
    Consumer,
    /// In-process operation, the default.
    #[default]
    Internal,
}

impl SpanKind {
    /// Whether an active ancestor of this kind suppresses a nested
    /// observation of the same kind.
    pub fn suppresses_nested(&self) -> bool {
        !matches!(self, SpanKind::Internal)
    }
}

impl fmt::Display for SpanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            SpanKind::Client => "client",
            SpanKind::Server => "server",
            SpanKind::Producer => "producer",
            SpanKind::Consumer => "consumer",
            SpanKind::Internal => "internal",
        };
        f.write_str(kind)
    }
}
