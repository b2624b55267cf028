//! Instrumentation lifecycle engine for request/response style operations.
//!
//! This crate wraps arbitrary operations, an outbound network call or a
//! stateful session handle, so that every invocation produces an
//! [`Observation`] (a trace span), carries causal context to downstream
//! systems, and can attach auxiliary state to objects the instrumentation
//! does not own.
//!
//! # Overview
//!
//! - **[`Instrumenter`]**: the lifecycle state machine. A call site asks
//!   [`Instrumenter::should_start`] whether the operation is observed, calls
//!   [`Instrumenter::start`] to open an observation, and later
//!   [`Instrumenter::end`] to close it. Every observation is closed exactly
//!   once, including on error, panic unwinding and cancellation paths.
//! - **[`propagation`]**: injects the causal identifiers of a [`Context`]
//!   into an outgoing carrier (W3C `traceparent`, `tracestate` and
//!   `baggage`) and extracts them on the receiving side.
//! - **[`binder::AsyncCompletionBinder`]**: closes the observation of an
//!   operation that completes asynchronously, exactly when its future
//!   resolves or is dropped.
//! - **[`cache::KeyedCache`]** and **[`cache::ContextStore`]**: side tables
//!   keyed by object identity with at-most-once computation per key.
//! - **[`OperationListener`]** and **[`metrics::Histogram`]**: aggregates
//!   recorded alongside the observations, such as request durations.
//!
//! Context is passed explicitly through every call boundary; there is no
//! implicit "current" context.
//!
//! # Example
//!
//! ```
//! use opentelemetry_instrumentation::{Context, Instrumenter, KeyValue};
//! use opentelemetry_instrumentation::propagation::ContextPropagators;
//! use std::collections::HashMap;
//!
//! struct Query(&'static str);
//!
//! let instrumenter: Instrumenter<Query, usize> =
//!     Instrumenter::builder("example.db", |query: &Query| query.0.to_string())
//!         .add_attributes_extractor(|attributes: &mut Vec<KeyValue>, _cx: &Context, query: &Query| {
//!             attributes.push(KeyValue::new("db.statement", query.0));
//!         })
//!         .build_client();
//!
//! let parent = Context::new();
//! let request = Query("SELECT 1");
//! if instrumenter.should_start(&parent, &request) {
//!     let (cx, _observation) = instrumenter.start(&parent, &request);
//!
//!     let mut headers: HashMap<String, String> = HashMap::new();
//!     ContextPropagators::default().inject_context(&cx, &mut headers);
//!     assert!(headers.contains_key("traceparent"));
//!
//!     instrumenter.end(&cx, &request, Some(&1), None);
//! }
//! ```
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod common;
mod macros;

pub mod baggage;
pub mod binder;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod instrumenter;
pub mod metrics;
pub mod propagation;
pub mod trace;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use common::{Key, KeyValue, Value};
pub use context::Context;
pub use error::{ErrorDetail, ErrorKind, InstrumentationError};
pub use instrumenter::{
    AttributesExtractor, Instrumenter, InstrumenterBuilder, Observation, ObservationData,
    ObservationRecorder, OperationListener, Outcome,
};

#[doc(hidden)]
#[cfg(feature = "internal-logs")]
pub mod _private {
    pub use tracing::{debug, error, info, warn};
}
