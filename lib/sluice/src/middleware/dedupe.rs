//! Request coalescing middleware.
//!
//! Concurrent calls sharing a key are collapsed into one call to the wrapped
//! transport. The first caller (the leader) performs the call; every caller
//! arriving while it is in flight waits for the leader's outcome and receives
//! its own copy of the response, or the very same error.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::registry::{
    CycleGuard, HasInflight, Inflight, KeyFn, RequestPredicate, Slot, follow, lock, notify,
};
use crate::{Error, Request, Response, Result, request_key};

/// Builds the response handed to each waiting caller.
pub type ResolverFn = Arc<dyn Fn(&Response<Bytes>) -> Response<Bytes> + Send + Sync>;

/// Configuration for the dedupe middleware.
///
/// Defaults:
/// - `skip`: the call sets [`Flags::skip_dedupe`](crate::Flags) or is not a `GET`
/// - `key`: [`request_key`] (`"{METHOD}@{url}"`)
/// - `resolver`: clone of the leader's response
#[derive(Clone)]
pub struct DedupeConfig {
    skip: RequestPredicate,
    key: KeyFn,
    resolver: ResolverFn,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            skip: Arc::new(|request| {
                request.flags().skip_dedupe || !request.method().is_cacheable()
            }),
            key: Arc::new(request_key),
            resolver: Arc::new(Response::clone),
        }
    }
}

impl std::fmt::Debug for DedupeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupeConfig").finish_non_exhaustive()
    }
}

impl DedupeConfig {
    /// Decide per call whether to bypass coalescing.
    #[must_use]
    pub fn with_skip(
        mut self,
        skip: impl Fn(&Request<Bytes>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.skip = Arc::new(skip);
        self
    }

    /// Set the function identifying "the same" request.
    #[must_use]
    pub fn with_key(
        mut self,
        key: impl Fn(&Request<Bytes>) -> String + Send + Sync + 'static,
    ) -> Self {
        self.key = Arc::new(key);
        self
    }

    /// Set how each waiter's response is derived from the leader's.
    #[must_use]
    pub fn with_resolver(
        mut self,
        resolver: impl Fn(&Response<Bytes>) -> Response<Bytes> + Send + Sync + 'static,
    ) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }
}

#[derive(Debug, Default)]
struct DedupeState {
    inflight: Inflight,
}

impl HasInflight for DedupeState {
    fn inflight_mut(&mut self) -> &mut Inflight {
        &mut self.inflight
    }
}

/// Layer that coalesces concurrent identical requests.
///
/// Every `DedupeLayer::new` owns a fresh registry; clones of a layer, and the
/// services it produces, share it.
///
/// # Example
///
/// ```ignore
/// use sluice::middleware::{DedupeConfig, DedupeLayer};
///
/// let layer = DedupeLayer::new(
///     DedupeConfig::default().with_key(|request| request.url().path().to_string()),
/// );
/// ```
#[derive(Debug, Clone, Default)]
pub struct DedupeLayer {
    config: DedupeConfig,
    state: Arc<Mutex<DedupeState>>,
}

impl DedupeLayer {
    /// Create a dedupe layer with the given configuration.
    #[must_use]
    pub fn new(config: DedupeConfig) -> Self {
        Self {
            config,
            state: Arc::default(),
        }
    }

    /// Number of keys currently led by an in-flight call.
    #[must_use]
    pub fn inflight_count(&self) -> usize {
        lock(&self.state).inflight.len()
    }
}

impl<S> Layer<S> for DedupeLayer {
    type Service = Dedupe<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Dedupe {
            inner,
            config: self.config.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

/// Service that coalesces concurrent identical requests.
#[derive(Debug, Clone)]
pub struct Dedupe<S> {
    inner: S,
    config: DedupeConfig,
    state: Arc<Mutex<DedupeState>>,
}

impl<S> Service<Request<Bytes>> for Dedupe<S>
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

        let key = (self.config.key)(&request);

        // Join and open share one critical section: one leader per key.
        let slot = lock(&self.state).inflight.join_or_open(&key);

        let id = match slot {
            Slot::Lead(id) => id,
            Slot::Follow(receiver) => {
                debug!(%key, "joining in-flight request");
                #[cfg(feature = "middleware-metrics")]
                metrics::counter!("sluice_dedupe_coalesced_total").increment(1);
                return Box::pin(follow(receiver));
            }
        };

        let guard = CycleGuard::new(Arc::clone(&self.state), key, id);
        let resolver = Arc::clone(&self.config.resolver);

        Box::pin(async move {
            let result = inner.call(request).await;
            if let Err(err) = &result {
                warn!(key = %guard.key(), error = %err, "coalesced request failed");
            }
            let waiters = guard.finish(|_, _| {});
            notify(waiters, &result, |response| resolver(response));
            result
        })
    }
}
