//! Retry middleware with backoff.
//!
//! A call is re-issued until the `until` predicate accepts its outcome or the
//! attempt budget runs out. The first call is attempt 0; `max_attempts`
//! retries follow at most, each one delayed by `delay_ramp(delay, attempt)`.
//! Transport errors are propagated immediately unless
//! [`RetryConfig::with_retry_on_network_error`] is set, in which case they
//! enter the same loop as unsatisfying responses.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tower::{Layer, Service, ServiceExt};
use tracing::{debug, warn};

use super::registry::RequestPredicate;
use crate::{Error, Request, RequestOptions, Response, Result};

/// Boxed future returned by the async hooks.
pub type HookFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Decides whether an outcome ends the loop.
pub type UntilFn =
    Arc<dyn Fn(Option<Response<Bytes>>, Option<Error>) -> HookFuture<bool> + Send + Sync>;

/// Runs before each retry; may retarget it.
pub type OnRetryFn = Arc<dyn Fn(RetryContext) -> HookFuture<Option<RetryOverride>> + Send + Sync>;

/// Maps the base delay and the attempt number to the wait before that attempt.
pub type DelayRampFn = Arc<dyn Fn(Duration, u32) -> Duration + Send + Sync>;

/// What the `on_retry` hook sees before a retry.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Response of the previous attempt, if it resolved.
    pub response: Option<Response<Bytes>>,
    /// Error of the previous attempt, if it failed.
    pub error: Option<Error>,
    /// Request about to be re-issued.
    pub request: Request<Bytes>,
    /// Number of the upcoming retry, starting at 1.
    pub attempt: u32,
}

/// Replacement target for the next attempt.
///
/// Fields left to `None` keep the current value.
#[derive(Debug, Clone, Default)]
pub struct RetryOverride {
    /// New target URL.
    pub url: Option<url::Url>,
    /// New method, headers, body and flags.
    pub options: Option<RequestOptions<Bytes>>,
}

impl RetryOverride {
    /// Retarget the next attempt to `url`.
    #[must_use]
    pub fn url(url: url::Url) -> Self {
        Self {
            url: Some(url),
            options: None,
        }
    }

    /// Replace the options of the next attempt.
    #[must_use]
    pub fn options(options: RequestOptions<Bytes>) -> Self {
        Self {
            url: None,
            options: Some(options),
        }
    }

    fn apply(self, request: Request<Bytes>) -> Request<Bytes> {
        let (url, options) = request.into_parts();
        Request::from_parts(self.url.unwrap_or(url), self.options.unwrap_or(options))
    }
}

/// Configuration for the retry middleware.
///
/// # Example
///
/// ```ignore
/// use std::time::Duration;
/// use sluice::middleware::{RetryConfig, RetryLayer};
///
/// let config = RetryConfig::default()
///     .with_delay(Duration::from_millis(200))
///     .with_max_attempts(3)
///     .with_until(|response, _| response.is_some_and(|r| r.status() != 503));
/// let layer = RetryLayer::new(config);
/// ```
#[derive(Clone)]
pub struct RetryConfig {
    delay: Duration,
    delay_ramp: DelayRampFn,
    max_attempts: u32,
    until: UntilFn,
    on_retry: Option<OnRetryFn>,
    skip: RequestPredicate,
    retry_on_network_error: bool,
    resolve_with_latest_response: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(500),
            delay_ramp: Arc::new(|delay, attempt| delay.saturating_mul(attempt)),
            max_attempts: 10,
            until: Arc::new(|response: Option<Response<Bytes>>, _| -> HookFuture<bool> {
                let done = response.is_some_and(|response| response.is_success());
                Box::pin(std::future::ready(done))
            }),
            on_retry: None,
            skip: Arc::new(|request| request.flags().skip_retry),
            retry_on_network_error: false,
            resolve_with_latest_response: false,
        }
    }
}

impl std::fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryConfig")
            .field("delay", &self.delay)
            .field("max_attempts", &self.max_attempts)
            .field("retry_on_network_error", &self.retry_on_network_error)
            .field(
                "resolve_with_latest_response",
                &self.resolve_with_latest_response,
            )
            .finish_non_exhaustive()
    }
}

impl RetryConfig {
    /// Set the base delay (default 500 ms).
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the backoff ramp (default `delay * attempt`).
    #[must_use]
    pub fn with_delay_ramp(
        mut self,
        ramp: impl Fn(Duration, u32) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.delay_ramp = Arc::new(ramp);
        self
    }

    /// Set the retry budget (default 10); `0` retries forever.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Stop retrying once `until` returns `true`.
    ///
    /// Default: a successful response.
    #[must_use]
    pub fn with_until(
        mut self,
        until: impl Fn(Option<&Response<Bytes>>, Option<&Error>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.until = Arc::new(
            move |response: Option<Response<Bytes>>, error: Option<Error>| -> HookFuture<bool> {
                let done = until(response.as_ref(), error.as_ref());
                Box::pin(std::future::ready(done))
            },
        );
        self
    }

    /// Asynchronous variant of [`with_until`](Self::with_until).
    #[must_use]
    pub fn with_until_async<F, Fut>(mut self, until: F) -> Self
    where
        F: Fn(Option<Response<Bytes>>, Option<Error>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.until = Arc::new(move |response, error| -> HookFuture<bool> {
            Box::pin(until(response, error))
        });
        self
    }

    /// Run `hook` after each backoff delay, right before the retry.
    ///
    /// A returned [`RetryOverride`] retargets that retry and every later one.
    #[must_use]
    pub fn with_on_retry(
        mut self,
        hook: impl Fn(&RetryContext) -> Option<RetryOverride> + Send + Sync + 'static,
    ) -> Self {
        self.on_retry = Some(Arc::new(
            move |context: RetryContext| -> HookFuture<Option<RetryOverride>> {
                Box::pin(std::future::ready(hook(&context)))
            },
        ));
        self
    }

    /// Asynchronous variant of [`with_on_retry`](Self::with_on_retry).
    #[must_use]
    pub fn with_on_retry_async<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(RetryContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<RetryOverride>> + Send + 'static,
    {
        self.on_retry = Some(Arc::new(
            move |context| -> HookFuture<Option<RetryOverride>> { Box::pin(hook(context)) },
        ));
        self
    }

    /// Decide per call whether to bypass retries (default: `Flags::skip_retry`).
    #[must_use]
    pub fn with_skip(
        mut self,
        skip: impl Fn(&Request<Bytes>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.skip = Arc::new(skip);
        self
    }

    /// Retry transport errors instead of propagating them (default `false`).
    #[must_use]
    pub fn with_retry_on_network_error(mut self, enabled: bool) -> Self {
        self.retry_on_network_error = enabled;
        self
    }

    /// On exhaustion, resolve with the last response rather than failing
    /// with [`Error::RetryExhausted`] (default `false`).
    #[must_use]
    pub fn with_resolve_with_latest_response(mut self, enabled: bool) -> Self {
        self.resolve_with_latest_response = enabled;
        self
    }

    /// Configured base delay.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Configured retry budget.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts != 0 && attempt > self.max_attempts
    }
}

/// Layer re-issuing requests until they satisfy [`RetryConfig`].
#[derive(Debug, Clone, Default)]
pub struct RetryLayer {
    config: RetryConfig,
}

impl RetryLayer {
    /// Create a retry layer with the given configuration.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Retry layer with default settings and `max_attempts` retries.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self::new(RetryConfig::default().with_max_attempts(max_attempts))
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = Retry<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Retry {
            inner,
            config: self.config.clone(),
        }
    }
}

/// Service re-issuing requests until they satisfy [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct Retry<S> {
    inner: S,
    config: RetryConfig,
}

impl<S> Service<Request<Bytes>> for Retry<S>
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
        let mut inner = self.inner.clone();

        if (self.config.skip)(&request) {
            return Box::pin(async move { inner.call(request).await });
        }

        let config = self.config.clone();
        Box::pin(retry_loop(inner, config, request))
    }
}

async fn retry_loop<S>(
    mut inner: S,
    config: RetryConfig,
    mut request: Request<Bytes>,
) -> Result<Response<Bytes>>
where
    S: Service<Request<Bytes>, Response = Response<Bytes>, Error = Error> + Send,
    S::Future: Send,
{
    let mut attempt: u32 = 0;
    loop {
        let outcome = inner.ready().await?.call(request.clone()).await;

        if let Err(err) = &outcome
            && !config.retry_on_network_error
        {
            debug!(url = %request.url(), error = %err, "transport error, not retried");
            return outcome;
        }

        let response = outcome.as_ref().ok().cloned();
        let error = outcome.as_ref().err().cloned();
        if (config.until)(response, error).await {
            return outcome;
        }

        attempt = attempt.saturating_add(1);
        if config.exhausted(attempt) {
            warn!(
                url = %request.url(),
                attempts = config.max_attempts,
                "retry budget exhausted"
            );
            return match outcome {
                Err(err) => Err(err),
                Ok(response) if config.resolve_with_latest_response => Ok(response),
                Ok(_) => Err(Error::RetryExhausted {
                    attempts: config.max_attempts,
                }),
            };
        }

        let delay = (config.delay_ramp)(config.delay, attempt);
        debug!(
            url = %request.url(),
            attempt,
            delay_ms = delay.as_millis(),
            status = outcome.as_ref().ok().map(Response::status),
            "retrying request"
        );
        #[cfg(feature = "middleware-metrics")]
        metrics::counter!("sluice_retries_total").increment(1);

        tokio::time::sleep(delay).await;

        if let Some(on_retry) = &config.on_retry {
            let (response, error) = match outcome {
                Ok(response) => (Some(response), None),
                Err(err) => (None, Some(err)),
            };
            let context = RetryContext {
                response,
                error,
                request: request.clone(),
                attempt,
            };
            if let Some(retarget) = on_retry(context).await {
                request = retarget.apply(request);
            }
        }
    }
}
