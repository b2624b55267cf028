use crate::attributes::{HttpClientAttributesExtractor, HttpStatusExtractor};
use crate::metrics::HttpClientMetrics;
use crate::{BlockingHttpClient, Bytes, HeaderInjector, HttpClient, HttpError, Request, Response};
use async_trait::async_trait;
use opentelemetry_instrumentation::binder::AsyncCompletionBinder;
use opentelemetry_instrumentation::config::{list_from_env, InstrumentationConfig};
use opentelemetry_instrumentation::propagation::ContextPropagators;
use opentelemetry_instrumentation::{
    AttributesExtractor, Context, Instrumenter, ObservationRecorder,
};
use std::fmt;
use std::sync::Arc;

/// Name of the HTTP client instrumentation, as used by
/// `OTEL_INSTRUMENTATION_HTTP_CLIENT_ENABLED`.
pub(crate) const INSTRUMENTATION_NAME: &str = "http-client";
const CAPTURE_REQUEST_HEADERS: &str = "OTEL_INSTRUMENTATION_HTTP_CLIENT_CAPTURE_REQUEST_HEADERS";
const CAPTURE_RESPONSE_HEADERS: &str = "OTEL_INSTRUMENTATION_HTTP_CLIENT_CAPTURE_RESPONSE_HEADERS";

type HttpInstrumenter = Instrumenter<Request<Bytes>, Response<Bytes>>;
type BoxedExtractor = Box<dyn AttributesExtractor<Request<Bytes>, Response<Bytes>>>;

/// Entrypoint for instrumenting HTTP clients.
///
/// Holds the instrumenter, propagators and metrics shared by every client
/// it wraps.
#[derive(Clone)]
pub struct HttpClientTelemetry {
    binder: AsyncCompletionBinder<Request<Bytes>, Response<Bytes>>,
    propagators: ContextPropagators,
    metrics: HttpClientMetrics,
}

impl fmt::Debug for HttpClientTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClientTelemetry")
            .field("instrumenter", self.binder.instrumenter())
            .field("propagators", &self.propagators)
            .field("metrics", &self.metrics)
            .finish()
    }
}

impl HttpClientTelemetry {
    /// Builder propagating context with `propagators`.
    pub fn builder(propagators: ContextPropagators) -> HttpClientTelemetryBuilder {
        HttpClientTelemetryBuilder::new(propagators)
    }

    /// Wraps `client` so that its requests are observed.
    pub fn wrap<C>(&self, client: C) -> InstrumentedHttpClient<C> {
        InstrumentedHttpClient {
            inner: client,
            telemetry: self.clone(),
        }
    }

    /// The instrumenter observing requests.
    pub fn instrumenter(&self) -> &HttpInstrumenter {
        self.binder.instrumenter()
    }

    /// The request duration metrics.
    pub fn metrics(&self) -> &HttpClientMetrics {
        &self.metrics
    }

    /// Starts an observation for `request` if one should be started and
    /// injects its context into the request headers.
    ///
    /// Returns the child context together with a copy of the request kept
    /// for the end of the observation, `None` when the request is not
    /// observed and its headers were left untouched.
    ///
    /// Either way the request extensions end up holding the context the
    /// wrapped client runs in, so an instrumented client further down sees
    /// the observation already active.
    fn start(&self, parent_cx: &Context, request: &mut Request<Bytes>) -> Option<(Context, Request<Bytes>)> {
        let instrumenter = self.binder.instrumenter();
        if !instrumenter.should_start(parent_cx, request) {
            request.extensions_mut().insert(parent_cx.clone());
            return None;
        }
        let (cx, _) = instrumenter.start(parent_cx, request);
        self.propagators
            .inject_context(&cx, &mut HeaderInjector(request.headers_mut()));
        let copy = request_copy(request);
        request.extensions_mut().insert(cx.clone());
        Some((cx, copy))
    }
}

/// `http::Request` is not `Clone`: the extensions are left behind.
fn request_copy(request: &Request<Bytes>) -> Request<Bytes> {
    let mut copy = Request::new(request.body().clone());
    *copy.method_mut() = request.method().clone();
    *copy.uri_mut() = request.uri().clone();
    *copy.version_mut() = request.version();
    *copy.headers_mut() = request.headers().clone();
    copy
}

fn parent_context(request: &Request<Bytes>) -> Context {
    request
        .extensions()
        .get::<Context>()
        .cloned()
        .unwrap_or_default()
}

/// Builder for [`HttpClientTelemetry`].
///
/// Captured header lists default to the comma separated names in
/// `OTEL_INSTRUMENTATION_HTTP_CLIENT_CAPTURE_REQUEST_HEADERS` and
/// `OTEL_INSTRUMENTATION_HTTP_CLIENT_CAPTURE_RESPONSE_HEADERS`.
pub struct HttpClientTelemetryBuilder {
    propagators: ContextPropagators,
    attributes_extractors: Vec<BoxedExtractor>,
    captured_request_headers: Vec<String>,
    captured_response_headers: Vec<String>,
    recorder: Option<Arc<dyn ObservationRecorder>>,
    config: Option<InstrumentationConfig>,
    metrics: HttpClientMetrics,
}

impl fmt::Debug for HttpClientTelemetryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClientTelemetryBuilder")
            .field("propagators", &self.propagators)
            .field("attributes_extractors", &self.attributes_extractors.len())
            .field("captured_request_headers", &self.captured_request_headers)
            .field("captured_response_headers", &self.captured_response_headers)
            .field("recorder", &self.recorder)
            .field("config", &self.config)
            .field("metrics", &self.metrics)
            .finish()
    }
}

impl HttpClientTelemetryBuilder {
    fn new(propagators: ContextPropagators) -> Self {
        HttpClientTelemetryBuilder {
            propagators,
            attributes_extractors: Vec::new(),
            captured_request_headers: list_from_env(CAPTURE_REQUEST_HEADERS).unwrap_or_default(),
            captured_response_headers: list_from_env(CAPTURE_RESPONSE_HEADERS).unwrap_or_default(),
            recorder: None,
            config: None,
            metrics: HttpClientMetrics::new(),
        }
    }

    /// Adds an extractor running after the standard HTTP attributes.
    pub fn add_attributes_extractor<A>(mut self, extractor: A) -> Self
    where
        A: AttributesExtractor<Request<Bytes>, Response<Bytes>> + 'static,
    {
        self.attributes_extractors.push(Box::new(extractor));
        self
    }

    /// Request headers recorded as `http.request.header.<name>`.
    pub fn set_captured_request_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.captured_request_headers = headers.into_iter().map(Into::into).collect();
        self
    }

    /// Response headers recorded as `http.response.header.<name>`.
    pub fn set_captured_response_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.captured_response_headers = headers.into_iter().map(Into::into).collect();
        self
    }

    /// Recorder receiving the observations.
    pub fn set_recorder(mut self, recorder: Arc<dyn ObservationRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Configuration deciding whether the instrumentation is enabled.
    /// Defaults to the environment.
    pub fn set_config(mut self, config: InstrumentationConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Metrics recording the duration of every request. Defaults to fresh
    /// metrics owned by the built telemetry.
    pub fn set_metrics(mut self, metrics: HttpClientMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Builds the telemetry.
    pub fn build(self) -> HttpClientTelemetry {
        let mut builder = HttpInstrumenter::builder(INSTRUMENTATION_NAME, |request: &Request<Bytes>| {
            request.method().as_str().to_string()
        })
        .add_attributes_extractor(HttpClientAttributesExtractor::new(
            &self.captured_request_headers,
            &self.captured_response_headers,
        ))
        .add_attributes_extractors(self.attributes_extractors)
        .set_status_extractor(HttpStatusExtractor)
        .add_operation_listener(self.metrics.clone());
        if let Some(recorder) = self.recorder {
            builder = builder.set_shared_recorder(recorder);
        }
        if let Some(config) = &self.config {
            builder = builder.with_config(config);
        }

        HttpClientTelemetry {
            binder: AsyncCompletionBinder::new(builder.build_client()),
            propagators: self.propagators,
            metrics: self.metrics,
        }
    }
}

/// An HTTP client whose requests are observed.
///
/// Implements the client trait of the wrapped client. The parent of each
/// observation is the [`Context`] found in the request extensions, a root
/// observation when there is none.
#[derive(Debug)]
pub struct InstrumentedHttpClient<C> {
    inner: C,
    telemetry: HttpClientTelemetry,
}

impl<C> InstrumentedHttpClient<C> {
    /// The wrapped client.
    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C: HttpClient> InstrumentedHttpClient<C> {
    /// Sends `request` as a child of `parent_cx`.
    pub async fn send_with_context(
        &self,
        parent_cx: &Context,
        mut request: Request<Bytes>,
    ) -> Result<Response<Bytes>, HttpError> {
        match self.telemetry.start(parent_cx, &mut request) {
            Some((cx, copy)) => {
                let response = self.inner.send_bytes(request);
                self.telemetry.binder.bind(response, cx, copy).await
            }
            None => self.inner.send_bytes(request).await,
        }
    }
}

impl<C: BlockingHttpClient> InstrumentedHttpClient<C> {
    /// Sends `request` as a child of `parent_cx` and waits for the response.
    pub fn send_blocking_with_context(
        &self,
        parent_cx: &Context,
        mut request: Request<Bytes>,
    ) -> Result<Response<Bytes>, HttpError> {
        match self.telemetry.start(parent_cx, &mut request) {
            Some((cx, copy)) => {
                let result = self.inner.send(request);
                self.telemetry.binder.bind_settled(result, &cx, &copy)
            }
            None => self.inner.send(request),
        }
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for InstrumentedHttpClient<C> {
    async fn send_bytes(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
        let parent_cx = parent_context(&request);
        self.send_with_context(&parent_cx, request).await
    }
}

impl<C: BlockingHttpClient> BlockingHttpClient for InstrumentedHttpClient<C> {
    fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
        let parent_cx = parent_context(&request);
        self.send_blocking_with_context(&parent_cx, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry_instrumentation::testing::InMemoryRecorder;

    fn request() -> Request<Bytes> {
        let mut request = Request::put("http://example.com/items/7")
            .header("x-request-id", "abc")
            .body(Bytes::from_static(b"payload"))
            .unwrap();
        request.extensions_mut().insert(7u8);
        request
    }

    #[test]
    fn copy_keeps_everything_but_extensions() {
        let request = request();
        let copy = request_copy(&request);
        assert_eq!(copy.method(), request.method());
        assert_eq!(copy.uri(), request.uri());
        assert_eq!(copy.version(), request.version());
        assert_eq!(copy.headers(), request.headers());
        assert_eq!(copy.body(), request.body());
        assert!(copy.extensions().get::<u8>().is_none());
    }

    #[test]
    fn parent_from_extensions() {
        let mut request = request();
        assert!(parent_context(&request).active_observation().is_none());

        let recorder = InMemoryRecorder::default();
        let instrumenter: Instrumenter<(), ()> = Instrumenter::builder("parent", |_: &()| "parent".to_string())
            .set_recorder(recorder.clone())
            .set_enabled(true)
            .build_server();
        let (cx, observation) = instrumenter.start(&Context::new(), &());
        request.extensions_mut().insert(cx.clone());

        let parent = parent_context(&request);
        assert_eq!(
            parent.active_observation().map(|o| o.span_context().span_id()),
            Some(observation.span_context().span_id())
        );
        instrumenter.end(&cx, &(), Some(&()), None);
    }

    #[test]
    fn builder_seeds_captured_headers_from_env() {
        temp_env::with_vars(
            [
                (CAPTURE_REQUEST_HEADERS, Some("x-request-id, content-type")),
                (CAPTURE_RESPONSE_HEADERS, None),
            ],
            || {
                let builder = HttpClientTelemetry::builder(ContextPropagators::noop());
                assert_eq!(
                    builder.captured_request_headers,
                    vec!["x-request-id".to_string(), "content-type".to_string()]
                );
                assert!(builder.captured_response_headers.is_empty());

                let builder = builder.set_captured_request_headers(["etag"]);
                assert_eq!(builder.captured_request_headers, vec!["etag".to_string()]);
            },
        );
    }

    #[test]
    fn disabled_by_config() {
        let telemetry = HttpClientTelemetry::builder(ContextPropagators::default())
            .set_config(InstrumentationConfig::builder().with_disabled(true).build())
            .build();
        assert!(!telemetry.instrumenter().is_enabled());

        let mut request = request();
        assert!(telemetry.start(&Context::new(), &mut request).is_none());
        assert!(request.headers().get("traceparent").is_none());
    }
}
