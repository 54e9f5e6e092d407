//! Request/response logging middleware.
//!
//! Every call runs inside an `http_request` span carrying its method, URL and
//! request key, so the decisions logged by the stateful middlewares below this
//! layer are attributed to the call that caused them.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use tower::{Layer, Service};
use tracing::{Instrument, Level, debug, info, span, warn};

use crate::{CacheHit, Error, Request, Response, Result, request_key};

/// Layer that adds request/response logging.
///
/// # Example
///
/// ```ignore
/// use sluice::Composer;
/// use sluice::middleware::{DedupeLayer, LoggingLayer};
///
/// let pipeline = Composer::new()
///     .layer(LoggingLayer::new())
///     .layer(DedupeLayer::default())
///     .build(base);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingLayer {
    level: LogLevel,
}

/// Log level for the logging middleware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    /// Request headers and flags as well as the outcome.
    Debug,
    /// Outcome only.
    #[default]
    Info,
}

impl LoggingLayer {
    /// Create a new logging layer with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a logging layer that logs at debug level.
    #[must_use]
    pub fn debug() -> Self {
        Self {
            level: LogLevel::Debug,
        }
    }

    /// Configured level.
    #[must_use]
    pub fn level(&self) -> LogLevel {
        self.level
    }
}

impl<S> Layer<S> for LoggingLayer {
    type Service = Logging<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Logging {
            inner,
            level: self.level,
        }
    }
}

/// Service that logs requests and responses.
#[derive(Debug, Clone)]
pub struct Logging<S> {
    inner: S,
    level: LogLevel,
}

impl<S> Service<Request<Bytes>> for Logging<S>
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
        let method = request.method();
        let key = request_key(&request);
        let level = self.level;

        let span = span!(Level::INFO, "http_request", %method, url = %request.url(), %key);

        let mut inner = self.inner.clone();
        Box::pin(
            async move {
                let start = Instant::now();

                match level {
                    LogLevel::Debug => debug!(
                        headers = ?request.headers(),
                        flags = ?request.flags(),
                        "sending request"
                    ),
                    LogLevel::Info => info!("sending request"),
                }

                let result = inner.call(request).await;

                // Saturating conversion to u64
                let elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

                match &result {
                    Ok(response) => {
                        let status = response.status();
                        let cache = response.cache_hit().map(CacheHit::marker);
                        if response.is_success() {
                            info!(status, elapsed_ms, cache, "request completed");
                        } else {
                            warn!(status, elapsed_ms, cache, "request completed with HTTP error");
                        }
                    }
                    Err(Error::RetryExhausted { attempts }) => {
                        warn!(attempts, elapsed_ms, "request gave up after retries");
                    }
                    Err(err) => warn!(error = %err, elapsed_ms, "request failed"),
                }

                result
            }
            .instrument(span),
        )
    }
}
