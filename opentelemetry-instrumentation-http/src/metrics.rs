use crate::attributes::{
    ERROR_TYPE, HTTP_REQUEST_METHOD, HTTP_RESPONSE_STATUS_CODE, SERVER_ADDRESS, SERVER_PORT,
};
use opentelemetry_instrumentation::metrics::Histogram;
use opentelemetry_instrumentation::{KeyValue, ObservationData, OperationListener, Outcome};
use std::sync::Arc;

/// Name of the request duration histogram.
pub const HTTP_CLIENT_REQUEST_DURATION: &str = "http.client.request.duration";

/// Bucket bounds, in seconds.
const DURATION_BUCKETS: [f64; 14] = [
    0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

/// Attributes of the observation the duration is recorded with.
const DURATION_ATTRIBUTES: [&str; 4] = [
    HTTP_REQUEST_METHOD,
    HTTP_RESPONSE_STATUS_CODE,
    SERVER_ADDRESS,
    SERVER_PORT,
];

/// Records the duration of every outgoing request in the
/// `http.client.request.duration` histogram, in seconds.
///
/// Each measurement carries the method, status code, server address and
/// port of the request and, for failures, `error.type`. Requests that were
/// cancelled or abandoned carry the error kind instead.
///
/// Clones share one histogram, so the same metrics can be handed to several
/// telemetry builders.
#[derive(Clone, Debug)]
pub struct HttpClientMetrics {
    duration: Arc<Histogram>,
}

impl Default for HttpClientMetrics {
    fn default() -> Self {
        HttpClientMetrics::new()
    }
}

impl HttpClientMetrics {
    /// Metrics with an empty duration histogram.
    pub fn new() -> Self {
        HttpClientMetrics {
            duration: Arc::new(Histogram::new(
                HTTP_CLIENT_REQUEST_DURATION,
                "s",
                DURATION_BUCKETS.to_vec(),
            )),
        }
    }

    /// The request duration histogram.
    pub fn duration(&self) -> &Histogram {
        &self.duration
    }
}

impl OperationListener for HttpClientMetrics {
    fn on_end(&self, observation: &ObservationData) {
        let Some(duration) = observation.duration() else {
            return;
        };
        let mut attributes: Vec<KeyValue> = DURATION_ATTRIBUTES
            .iter()
            .filter_map(|key| {
                observation
                    .attribute(key)
                    .map(|value| KeyValue::new(*key, value.clone()))
            })
            .collect();
        let error_type = observation
            .attribute(ERROR_TYPE)
            .map(|value| value.as_str().into_owned())
            .or_else(|| match observation.outcome {
                Outcome::Failure => observation
                    .error
                    .as_ref()
                    .map(|error| error.kind.as_str().to_string()),
                _ => None,
            });
        if let Some(error_type) = error_type {
            attributes.push(KeyValue::new(ERROR_TYPE, error_type));
        }
        self.duration.record(duration.as_secs_f64(), &attributes);
    }
}
