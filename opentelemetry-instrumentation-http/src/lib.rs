//! HTTP client instrumentation.
//!
//! Wraps an HTTP client so that every request it sends is observed as a
//! [`SpanKind::Client`] observation and carries the causal identifiers of
//! the caller's [`Context`] in its headers (W3C `traceparent`, `tracestate`
//! and `baggage`). The duration of every request is recorded in the
//! `http.client.request.duration` histogram of [`HttpClientMetrics`].
//!
//! ```no_run
//! use opentelemetry_instrumentation::propagation::ContextPropagators;
//! use opentelemetry_instrumentation::Context;
//! use opentelemetry_instrumentation_http::{
//!     Bytes, HttpClient, HttpClientTelemetry, HttpError, Request, Response,
//! };
//!
//! #[derive(Debug)]
//! struct MyClient;
//!
//! #[async_trait::async_trait]
//! impl HttpClient for MyClient {
//!     async fn send_bytes(&self, _request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
//!         Ok(Response::new(Bytes::new()))
//!     }
//! }
//!
//! # async fn run() -> Result<(), HttpError> {
//! let telemetry = HttpClientTelemetry::builder(ContextPropagators::default())
//!     .set_captured_request_headers(["content-type"])
//!     .build();
//! let client = telemetry.wrap(MyClient);
//!
//! let mut request = Request::get("http://example.com/items").body(Bytes::new())?;
//! request.extensions_mut().insert(Context::new());
//! let response = client.send_bytes(request).await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`SpanKind::Client`]: opentelemetry_instrumentation::trace::SpanKind::Client
//! [`Context`]: opentelemetry_instrumentation::Context
use async_trait::async_trait;
use opentelemetry_instrumentation::propagation::{Extractor, Injector};
use std::borrow::Cow;
use std::error::Error;
use std::fmt::{self, Debug};

#[doc(no_inline)]
pub use bytes::Bytes;
#[doc(no_inline)]
pub use http::{Request, Response};

mod attributes;
mod client;
mod metrics;

pub use attributes::{HttpClientAttributesExtractor, HttpStatusExtractor};
pub use client::{HttpClientTelemetry, HttpClientTelemetryBuilder, InstrumentedHttpClient};
pub use metrics::{HttpClientMetrics, HTTP_CLIENT_REQUEST_DURATION};

/// Helper for injecting headers into HTTP requests.
pub struct HeaderInjector<'a>(pub &'a mut http::HeaderMap);

impl Injector for HeaderInjector<'_> {
    /// Set a key and value in the HeaderMap, replacing every previous value of
    /// the key. Does nothing if the key or value are not valid inputs.
    fn set(&mut self, key: &str, value: String) {
        if let Ok(name) = http::header::HeaderName::from_bytes(key.as_bytes()) {
            if let Ok(val) = http::header::HeaderValue::from_str(&value) {
                self.0.insert(name, val);
            }
        }
    }

    fn reserve(&mut self, additional: usize) {
        self.0.reserve(additional);
    }
}

impl Debug for HeaderInjector<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HeaderInjector").field(&self.0).finish()
    }
}

/// Helper for extracting headers from HTTP requests and responses.
pub struct HeaderExtractor<'a>(pub &'a http::HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    /// Get the first value for a key from the HeaderMap. If the value is not
    /// valid ASCII, returns None.
    fn get(&self, key: &str) -> Option<Cow<'_, str>> {
        self.0
            .get(key)
            .and_then(|value| value.to_str().ok())
            .map(Cow::Borrowed)
    }

    /// Collect all the keys from the HeaderMap.
    fn keys(&self) -> Vec<Cow<'_, str>> {
        self.0
            .keys()
            .map(|name| Cow::Borrowed(name.as_str()))
            .collect::<Vec<_>>()
    }

    /// Every valid ASCII value of a key, in header order.
    fn get_all(&self, key: &str) -> Option<Vec<Cow<'_, str>>> {
        let values: Vec<Cow<'_, str>> = self
            .0
            .get_all(key)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(Cow::Borrowed)
            .collect();
        (!values.is_empty()).then_some(values)
    }
}

impl Debug for HeaderExtractor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HeaderExtractor").field(&self.0).finish()
    }
}

/// Error returned by an HTTP client: the request could not be sent or no
/// response was received.
pub struct HttpError {
    source: Box<dyn Error + Send + Sync + 'static>,
    type_name: &'static str,
}

impl HttpError {
    /// Wraps the error of an HTTP client, remembering its type.
    pub fn new<E>(error: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        HttpError {
            source: Box::new(error),
            type_name: std::any::type_name::<E>(),
        }
    }

    /// Type name of the wrapped error.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// The wrapped error.
    pub fn get_ref(&self) -> &(dyn Error + Send + Sync + 'static) {
        self.source.as_ref()
    }

    /// Unwraps the error.
    pub fn into_inner(self) -> Box<dyn Error + Send + Sync + 'static> {
        self.source
    }
}

impl Debug for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpError")
            .field("type_name", &self.type_name)
            .field("source", &self.source)
            .finish()
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.source, f)
    }
}

impl Error for HttpError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.source.as_ref())
    }
}

impl From<http::Error> for HttpError {
    fn from(error: http::Error) -> Self {
        HttpError::new(error)
    }
}

impl From<Box<dyn Error + Send + Sync + 'static>> for HttpError {
    fn from(source: Box<dyn Error + Send + Sync + 'static>) -> Self {
        HttpError {
            source,
            type_name: "unknown",
        }
    }
}

impl From<String> for HttpError {
    fn from(message: String) -> Self {
        HttpError {
            source: message.into(),
            type_name: "message",
        }
    }
}

impl From<&'static str> for HttpError {
    fn from(message: &'static str) -> Self {
        HttpError::from(message.to_string())
    }
}

/// A minimal interface for sending requests over HTTP asynchronously.
///
/// Users bring the HTTP client of their choice, and the async runtime it
/// relies on, by implementing this trait.
#[async_trait]
pub trait HttpClient: Debug + Send + Sync {
    /// Send the specified HTTP request with `Bytes` payload.
    ///
    /// Returns the HTTP response including the status code and body.
    ///
    /// Returns an error if it can't connect to the server or the request could not be completed,
    /// e.g. because of a timeout, infinite redirects, or a loss of connection.
    async fn send_bytes(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError>;
}

/// A minimal interface for sending requests over HTTP from blocking code.
pub trait BlockingHttpClient: Debug + Send + Sync {
    /// Send the specified HTTP request and wait for the response.
    fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError>;
}

#[cfg(feature = "reqwest")]
mod reqwest {
    use opentelemetry_instrumentation::otel_debug;

    use super::{async_trait, BlockingHttpClient, Bytes, HttpClient, HttpError, Request, Response};

    #[async_trait]
    impl HttpClient for reqwest::Client {
        async fn send_bytes(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
            otel_debug!(name: "ReqwestClient.Send");
            let request = request.try_into().map_err(HttpError::new)?;
            let mut response = self.execute(request).await.map_err(HttpError::new)?;
            let headers = std::mem::take(response.headers_mut());
            let mut http_response = Response::builder()
                .status(response.status())
                .body(response.bytes().await.map_err(HttpError::new)?)?;
            *http_response.headers_mut() = headers;

            Ok(http_response)
        }
    }

    #[cfg(not(target_arch = "wasm32"))]
    impl BlockingHttpClient for reqwest::blocking::Client {
        fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
            otel_debug!(name: "ReqwestBlockingClient.Send");
            let request = request.try_into().map_err(HttpError::new)?;
            let mut response = self.execute(request).map_err(HttpError::new)?;
            let headers = std::mem::take(response.headers_mut());
            let mut http_response = Response::builder()
                .status(response.status())
                .body(response.bytes().map_err(HttpError::new)?)?;
            *http_response.headers_mut() = headers;

            Ok(http_response)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn http_headers_get() {
        let mut carrier = http::HeaderMap::new();
        HeaderInjector(&mut carrier).set("headerName", "value".to_string());

        assert_eq!(
            HeaderExtractor(&carrier).get("HEADERNAME"),
            Some(Cow::Borrowed("value")),
            "case insensitive extraction"
        )
    }

    #[test]
    fn http_headers_keys() {
        let mut carrier = http::HeaderMap::new();
        HeaderInjector(&mut carrier).set("headerName1", "value1".to_string());
        HeaderInjector(&mut carrier).set("headerName2", "value2".to_string());

        let extractor = HeaderExtractor(&carrier);
        let got = extractor.keys();
        assert_eq!(got.len(), 2);
        assert!(got.contains(&Cow::Borrowed("headername1")));
        assert!(got.contains(&Cow::Borrowed("headername2")));
    }

    #[test]
    fn set_replaces_every_value() {
        let mut carrier = http::HeaderMap::new();
        carrier.append("traceparent", "stale-1".parse().unwrap());
        carrier.append("traceparent", "stale-2".parse().unwrap());

        HeaderInjector(&mut carrier).set("traceparent", "fresh".to_string());
        assert_eq!(
            HeaderExtractor(&carrier).get_all("traceparent"),
            Some(vec![Cow::Borrowed("fresh")])
        );
    }

    #[rstest]
    #[case(&["a=1", "b=2"], Some(vec!["a=1", "b=2"]))]
    #[case(&[], None)]
    fn get_all_in_order(#[case] values: &[&str], #[case] expected: Option<Vec<&str>>) {
        let mut carrier = http::HeaderMap::new();
        for value in values {
            carrier.append("baggage", value.parse().unwrap());
        }
        let got = HeaderExtractor(&carrier)
            .get_all("baggage")
            .map(|values| values.into_iter().map(Cow::into_owned).collect::<Vec<_>>());
        assert_eq!(
            got,
            expected.map(|values| values.into_iter().map(str::to_string).collect())
        );
    }

    #[test]
    fn invalid_header_is_skipped() {
        let mut carrier = http::HeaderMap::new();
        HeaderInjector(&mut carrier).set("bad header", "value".to_string());
        HeaderInjector(&mut carrier).set("good", "bad\nvalue".to_string());
        assert!(carrier.is_empty());
    }

    #[test]
    fn http_error_keeps_type_and_source() {
        let error = HttpError::new(std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out"));
        assert_eq!(error.type_name(), std::any::type_name::<std::io::Error>());
        assert_eq!(error.to_string(), "timed out");
        assert!(error.source().is_some());

        let message = HttpError::from("no route");
        assert_eq!(message.to_string(), "no route");
    }
}
