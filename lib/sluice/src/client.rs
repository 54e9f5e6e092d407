//! Hyper-backed base transport and its builder.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use tower::Layer;
use tower::util::BoxCloneService;
use tower_service::Service;
use tracing::trace;

use crate::compose::{BoxTransport, Composer, Middleware, Pipeline, TransportFuture};
use crate::config::{TransportConfig, TransportConfigBuilder};
use crate::connector::https_connector;
use crate::middleware::{
    DedupeConfig, DedupeLayer, RetryConfig, RetryLayer, ThrottlingCacheConfig,
    ThrottlingCacheLayer,
};
use crate::{Error, Request, Response, Result};

#[cfg(feature = "middleware-logging")]
use crate::middleware::LoggingLayer;
#[cfg(feature = "middleware-metrics")]
use crate::middleware::MetricsLayer;

// ============================================================================
// Network leaf
// ============================================================================

/// The leaf transport: one hyper call per request, no policy.
#[derive(Clone)]
struct HyperLeaf {
    inner: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    config: TransportConfig,
}

impl HyperLeaf {
    fn new(config: TransportConfig) -> Self {
        let inner = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_idle_per_host)
            .build(https_connector(config.connect_timeout));

        Self { inner, config }
    }

    fn build_hyper_request(request: Request<Bytes>) -> Result<http::Request<Full<Bytes>>> {
        let (url, options) = request.into_parts();

        let mut builder = http::Request::builder()
            .method(http::Method::from(options.method))
            .uri(url.as_str());

        for (name, value) in &options.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder
            .body(options.body.map_or_else(Full::default, Full::new))
            .map_err(|e| Error::invalid_request(e.to_string()))
    }

    fn extract_headers(headers: &http::HeaderMap) -> HashMap<String, String> {
        headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect()
    }

    async fn execute(self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        let hyper_request = Self::build_hyper_request(request)?;
        trace!(uri = %hyper_request.uri(), "dispatching");

        let exchange = async {
            let response = self
                .inner
                .request(hyper_request)
                .await
                .map_err(Self::map_hyper_error)?;

            let status = response.status().as_u16();
            let headers = Self::extract_headers(response.headers());
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| Error::connection(e.to_string()))?
                .to_bytes();

            Ok::<_, Error>(Response::new(status, headers, body))
        };

        tokio::time::timeout(self.config.timeout, exchange)
            .await
            .map_err(|_| Error::Timeout)?
    }

    #[allow(clippy::needless_pass_by_value)]
    fn map_hyper_error(err: hyper_util::client::legacy::Error) -> Error {
        let msg = err.to_string();

        if err.is_connect() {
            return Error::connection(msg);
        }

        if msg.contains("ssl") || msg.contains("tls") || msg.contains("certificate") {
            return Error::tls(msg);
        }

        Error::connection(msg)
    }
}

impl Service<Request<Bytes>> for HyperLeaf {
    type Response = Response<Bytes>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send + 'static>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Bytes>) -> Self::Future {
        Box::pin(self.clone().execute(request))
    }
}

// ============================================================================
// Public transport
// ============================================================================

/// HTTP transport over hyper-util with connection pooling, TLS and a
/// middleware pipeline.
///
/// # Example
///
/// ```ignore
/// use sluice::{HyperTransport, TransportExt};
/// use std::time::Duration;
///
/// let transport = HyperTransport::builder()
///     .timeout(Duration::from_secs(10))
///     .with_dedupe()
///     .with_retry(3)
///     .build();
///
/// let response = transport.get("https://api.example.com/health").await?;
/// ```
#[derive(Clone)]
pub struct HyperTransport {
    pipeline: Pipeline,
    config: TransportConfig,
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperTransport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HyperTransport {
    /// Create a transport with default configuration and no middleware.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(TransportConfig::default())
    }

    /// Create a transport with custom configuration and no middleware.
    #[must_use]
    pub fn with_config(config: TransportConfig) -> Self {
        Self {
            pipeline: Pipeline::new(Self::leaf(config.clone())),
            config,
        }
    }

    /// The bare network transport, boxed for composition.
    #[must_use]
    pub fn leaf(config: TransportConfig) -> BoxTransport {
        BoxCloneService::new(HyperLeaf::new(config))
    }

    /// Create a new transport builder.
    #[must_use]
    pub fn builder() -> HyperTransportBuilder {
        HyperTransportBuilder::default()
    }

    /// Get the transport configuration.
    #[must_use]
    pub const fn config(&self) -> &TransportConfig {
        &self.config
    }
}

impl Default for HyperTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl crate::Transport for HyperTransport {
    async fn execute(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        self.pipeline.call(request).await
    }
}

impl Service<Request<Bytes>> for HyperTransport {
    type Response = Response<Bytes>;
    type Error = Error;
    type Future = TransportFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Bytes>) -> Self::Future {
        self.pipeline.call(request)
    }
}

/// Builder for [`HyperTransport`].
///
/// Middlewares run in registration order: the first one added is the
/// outermost and sees each request first.
///
/// # Example
///
/// ```ignore
/// use sluice::HyperTransport;
/// use sluice::middleware::{ThrottlingCacheConfig, ThrottlingCacheLayer};
/// use std::time::Duration;
///
/// // Keep a handle on the cache to seed or invalidate it later
/// let cache = ThrottlingCacheLayer::new(
///     ThrottlingCacheConfig::default().with_throttle(Duration::from_secs(5)),
/// );
/// let transport = HyperTransport::builder()
///     .with_logging()
///     .layer(cache.clone())
///     .with_retry(3)
///     .build();
/// ```
#[derive(Debug, Default)]
pub struct HyperTransportBuilder {
    config: TransportConfigBuilder,
    composer: Composer,
}

impl HyperTransportBuilder {
    // ========================================================================
    // Core Configuration
    // ========================================================================

    /// Set the request timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.timeout(timeout);
        self
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.connect_timeout(timeout);
        self
    }

    /// Set the maximum idle connections per host.
    #[must_use]
    pub fn pool_idle_per_host(mut self, count: usize) -> Self {
        self.config = self.config.pool_idle_per_host(count);
        self
    }

    /// Set the idle connection timeout.
    #[must_use]
    pub fn pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.pool_idle_timeout(timeout);
        self
    }

    // ========================================================================
    // Generic Middleware API
    // ========================================================================

    /// Add a Tower layer; it runs after every layer added before it.
    #[must_use]
    pub fn layer<L>(mut self, layer: L) -> Self
    where
        L: Layer<BoxTransport> + Send + Sync + 'static,
        L::Service: Service<Request<Bytes>, Response = Response<Bytes>, Error = Error>
            + Clone
            + Send
            + 'static,
        <L::Service as Service<Request<Bytes>>>::Future: Send,
    {
        self.composer = self.composer.layer(layer);
        self
    }

    /// Alias for [`layer`](Self::layer).
    #[must_use]
    pub fn with<L>(self, layer: L) -> Self
    where
        L: Layer<BoxTransport> + Send + Sync + 'static,
        L::Service: Service<Request<Bytes>, Response = Response<Bytes>, Error = Error>
            + Clone
            + Send
            + 'static,
        <L::Service as Service<Request<Bytes>>>::Future: Send,
    {
        self.layer(layer)
    }

    /// Add an already type-erased middleware.
    #[must_use]
    pub fn middleware(mut self, middleware: Middleware) -> Self {
        self.composer = self.composer.push(middleware);
        self
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Coalesce concurrent identical `GET` requests.
    #[must_use]
    pub fn with_dedupe(self) -> Self {
        self.layer(DedupeLayer::default())
    }

    /// Coalesce concurrent identical requests with a custom configuration.
    #[must_use]
    pub fn with_dedupe_config(self, config: DedupeConfig) -> Self {
        self.layer(DedupeLayer::new(config))
    }

    /// Retry unsuccessful responses up to `max_attempts` times.
    #[must_use]
    pub fn with_retry(self, max_attempts: u32) -> Self {
        self.layer(RetryLayer::with_max_attempts(max_attempts))
    }

    /// Retry with a custom configuration.
    #[must_use]
    pub fn with_retry_config(self, config: RetryConfig) -> Self {
        self.layer(RetryLayer::new(config))
    }

    /// Serve repeated `GET` requests from cache for `window`.
    #[must_use]
    pub fn with_throttling_cache(self, window: Duration) -> Self {
        self.layer(ThrottlingCacheLayer::new(
            ThrottlingCacheConfig::default().with_throttle(window),
        ))
    }

    /// Add a throttling cache with a custom configuration.
    #[must_use]
    pub fn with_throttling_cache_config(self, config: ThrottlingCacheConfig) -> Self {
        self.layer(ThrottlingCacheLayer::new(config))
    }

    /// Add request/response logging.
    #[cfg(feature = "middleware-logging")]
    #[must_use]
    pub fn with_logging(self) -> Self {
        self.layer(LoggingLayer::new())
    }

    /// Add debug-level logging (includes headers and flags).
    #[cfg(feature = "middleware-logging")]
    #[must_use]
    pub fn with_debug_logging(self) -> Self {
        self.layer(LoggingLayer::debug())
    }

    /// Add metrics recording.
    ///
    /// Records the following metrics:
    /// - `http_client_requests_total`: Counter by method, status and cache
    /// - `http_client_request_duration_seconds`: Histogram by method
    /// - `http_client_requests_in_flight`: Gauge
    #[cfg(feature = "middleware-metrics")]
    #[must_use]
    pub fn with_metrics(self) -> Self {
        self.layer(MetricsLayer::new())
    }

    // ========================================================================
    // Build
    // ========================================================================

    /// Build the transport with all configured middleware.
    #[must_use]
    pub fn build(self) -> HyperTransport {
        let config = self.config.build();
        let pipeline = self.composer.build(HyperTransport::leaf(config.clone()));
        HyperTransport { pipeline, config }
    }
}
