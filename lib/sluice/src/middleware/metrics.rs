//! Metrics middleware using the metrics crate facade.
//!
//! Records per-call counters, latency and in-flight gauges with the `metrics`
//! crate, leaving the choice of exporter to the application. Calls answered
//! by a throttling cache below this layer are labelled `cache="hit"`.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use tower::{Layer, Service};

use crate::{Error, Request, Response, Result};

const LABEL_METHOD: &str = "method";
const LABEL_STATUS: &str = "status";
const LABEL_CACHE: &str = "cache";

const METRIC_REQUESTS_TOTAL: &str = "http_client_requests_total";
const METRIC_REQUEST_DURATION: &str = "http_client_request_duration_seconds";
const METRIC_REQUESTS_IN_FLIGHT: &str = "http_client_requests_in_flight";

/// Layer that records HTTP metrics.
///
/// Records the following metrics:
/// - `http_client_requests_total` (counter): labelled by method, status and cache
/// - `http_client_request_duration_seconds` (histogram): labelled by method
/// - `http_client_requests_in_flight` (gauge)
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsLayer {
    _private: (),
}

impl MetricsLayer {
    /// Create a new metrics layer.
    #[must_use]
    pub fn new() -> Self {
        Self { _private: () }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = Metrics<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Metrics { inner }
    }
}

/// Service that records HTTP metrics.
#[derive(Debug, Clone)]
pub struct Metrics<S> {
    inner: S,
}

/// Keeps the in-flight gauge balanced when a call is dropped mid-way.
struct InFlight;

impl InFlight {
    fn enter() -> Self {
        metrics::gauge!(METRIC_REQUESTS_IN_FLIGHT).increment(1.0);
        Self
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        metrics::gauge!(METRIC_REQUESTS_IN_FLIGHT).decrement(1.0);
    }
}

impl<S> Service<Request<Bytes>> for Metrics<S>
where
    S: Service<Request<Bytes>, Response = Response<Bytes>, Error = Error> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Bytes>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Bytes>) -> Self::Future {
        let method = request.method().to_string();
        let start = Instant::now();
        let mut inner = self.inner.clone();
        let in_flight = InFlight::enter();

        Box::pin(async move {
            let result = inner.call(request).await;
            drop(in_flight);

            metrics::histogram!(METRIC_REQUEST_DURATION, LABEL_METHOD => method.clone())
                .record(start.elapsed().as_secs_f64());

            let (status, cache) = match &result {
                Ok(response) => {
                    let cache = if response.cache_hit().is_some() { "hit" } else { "miss" };
                    (response.status().to_string(), cache)
                }
                Err(err) if err.is_retry_exhausted() => ("retry_exhausted".to_string(), "miss"),
                Err(_) => ("error".to_string(), "miss"),
            };

            metrics::counter!(
                METRIC_REQUESTS_TOTAL,
                LABEL_METHOD => method,
                LABEL_STATUS => status,
                LABEL_CACHE => cache
            )
            .increment(1);

            result
        })
    }
}
