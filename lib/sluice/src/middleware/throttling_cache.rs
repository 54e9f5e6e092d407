//! Throttling cache middleware.
//!
//! The first call for a key marks it *hot* for the throttle window. While a
//! key is hot, calls are served from the cached response when one was
//! admitted, or join the call still in flight. Once the window elapses the key
//! goes cold again and its cached row is dropped.
//!
//! ```text
//! cold -> hot+pending -> hot+cached -> cold
//!                     \-> cold (response not admitted)
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use regex::Regex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tower::{Layer, Service};
use tracing::{debug, trace, warn};

use super::registry::{
    CycleGuard, HasInflight, Inflight, KeyFn, RequestPredicate, follow, lock, notify,
};
use crate::{CacheHit, Error, Request, Response, Result, request_key};

/// Cache rows to drop before a call proceeds.
#[derive(Debug, Clone)]
pub enum Invalidation {
    /// One exact key.
    Key(String),
    /// Every key matching the pattern.
    Pattern(Regex),
}

impl Invalidation {
    /// Returns `true` if `key` is targeted.
    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Key(target) => target == key,
            Self::Pattern(pattern) => pattern.is_match(key),
        }
    }
}

impl From<Regex> for Invalidation {
    fn from(pattern: Regex) -> Self {
        Self::Pattern(pattern)
    }
}

/// Per-call invalidation targets.
pub type InvalidateFn = Arc<dyn Fn(&Request<Bytes>) -> Vec<Invalidation> + Send + Sync>;

/// Cache admission predicate.
pub type ConditionFn = Arc<dyn Fn(&Response<Bytes>) -> bool + Send + Sync>;

/// Configuration for the throttling cache.
///
/// Defaults:
/// - `throttle`: 1 second
/// - `skip`: the call sets [`Flags::skip_cache`](crate::Flags) or is not a `GET`
/// - `key`: [`request_key`]
/// - `clear`: the call sets [`Flags::clear_cache`](crate::Flags)
/// - `invalidate`: nothing
/// - `condition`: successful responses
#[derive(Clone)]
pub struct ThrottlingCacheConfig {
    throttle: Duration,
    skip: RequestPredicate,
    key: KeyFn,
    clear: RequestPredicate,
    invalidate: InvalidateFn,
    condition: ConditionFn,
    cache_hit_marker: Option<Arc<str>>,
}

impl Default for ThrottlingCacheConfig {
    fn default() -> Self {
        Self {
            throttle: Duration::from_secs(1),
            skip: Arc::new(|request| {
                request.flags().skip_cache || !request.method().is_cacheable()
            }),
            key: Arc::new(request_key),
            clear: Arc::new(|request| request.flags().clear_cache),
            invalidate: Arc::new(|_| Vec::new()),
            condition: Arc::new(Response::is_success),
            cache_hit_marker: None,
        }
    }
}

impl std::fmt::Debug for ThrottlingCacheConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottlingCacheConfig")
            .field("throttle", &self.throttle)
            .field("cache_hit_marker", &self.cache_hit_marker)
            .finish_non_exhaustive()
    }
}

impl ThrottlingCacheConfig {
    /// Set the throttle window. A zero window never marks keys hot.
    #[must_use]
    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    /// Decide per call whether to bypass the cache.
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

    /// Wipe the whole cache before serving calls for which `clear` holds.
    #[must_use]
    pub fn with_clear(
        mut self,
        clear: impl Fn(&Request<Bytes>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.clear = Arc::new(clear);
        self
    }

    /// Drop the returned cache rows before each call proceeds.
    #[must_use]
    pub fn with_invalidate(
        mut self,
        invalidate: impl Fn(&Request<Bytes>) -> Vec<Invalidation> + Send + Sync + 'static,
    ) -> Self {
        self.invalidate = Arc::new(invalidate);
        self
    }

    /// Only cache responses for which `condition` holds.
    #[must_use]
    pub fn with_condition(
        mut self,
        condition: impl Fn(&Response<Bytes>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.condition = Arc::new(condition);
        self
    }

    /// Attach a [`CacheHit`] carrying `marker` to responses served from cache.
    #[must_use]
    pub fn with_flag_response_on_cache_hit(mut self, marker: impl Into<Arc<str>>) -> Self {
        self.cache_hit_marker = Some(marker.into());
        self
    }

    /// Configured throttle window.
    #[must_use]
    pub fn throttle(&self) -> Duration {
        self.throttle
    }

    fn replay(&self, cached: &Response<Bytes>) -> Response<Bytes> {
        let mut response = cached.clone();
        if let Some(marker) = &self.cache_hit_marker {
            response
                .extensions_mut()
                .insert(CacheHit::new(Arc::clone(marker)));
        }
        response
    }
}

#[derive(Debug, Default)]
struct CacheState {
    cache: HashMap<String, Response<Bytes>>,
    inflight: Inflight,
    /// Hot keys, with the timer that cools them down.
    throttling: HashMap<String, AbortHandle>,
}

impl HasInflight for CacheState {
    fn inflight_mut(&mut self) -> &mut Inflight {
        &mut self.inflight
    }
}

impl CacheState {
    fn invalidate(&mut self, target: &Invalidation) -> usize {
        let before = self.cache.len();
        match target {
            Invalidation::Key(key) => {
                self.cache.remove(key);
            }
            Invalidation::Pattern(pattern) => self.cache.retain(|key, _| !pattern.is_match(key)),
        }
        before - self.cache.len()
    }

    /// Mark `key` hot for `window`, unless it already is. Returns whether
    /// `key` is hot afterwards.
    fn arm(&mut self, owner: Weak<Mutex<Self>>, key: &str, window: Duration) -> bool {
        if self.throttling.contains_key(key) {
            return true;
        }
        if window.is_zero() {
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(%key, "no tokio runtime, throttle window not armed");
            return false;
        };

        let expired = key.to_string();
        let timer = runtime.spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(owner) = owner.upgrade() {
                let mut state = lock(&owner);
                state.throttling.remove(&expired);
                state.cache.remove(&expired);
                trace!(key = %expired, "throttle window elapsed");
            }
        });
        trace!(%key, window_ms = window.as_millis(), "throttle window armed");
        self.throttling
            .insert(key.to_string(), timer.abort_handle());
        true
    }
}

impl Drop for CacheState {
    fn drop(&mut self) {
        for timer in self.throttling.values() {
            timer.abort();
        }
    }
}

/// Layer serving recent responses from cache for a throttle window.
///
/// Every `ThrottlingCacheLayer::new` owns a fresh cache; clones of a layer,
/// and the services it produces, share it. The layer also gives direct access
/// to that cache.
///
/// # Example
///
/// ```ignore
/// use std::time::Duration;
/// use sluice::middleware::{Invalidation, ThrottlingCacheConfig, ThrottlingCacheLayer};
///
/// let layer = ThrottlingCacheLayer::new(
///     ThrottlingCacheConfig::default()
///         .with_throttle(Duration::from_secs(5))
///         .with_flag_response_on_cache_hit("throttling-cache"),
/// );
/// layer.invalidate(&Invalidation::Key("GET@https://api.example.com/me".into()));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ThrottlingCacheLayer {
    config: ThrottlingCacheConfig,
    state: Arc<Mutex<CacheState>>,
}

impl ThrottlingCacheLayer {
    /// Create a throttling cache with the given configuration.
    #[must_use]
    pub fn new(config: ThrottlingCacheConfig) -> Self {
        Self {
            config,
            state: Arc::default(),
        }
    }

    /// Seed the cache for `key` without a network call.
    ///
    /// Arms the throttle window and hands a copy of `response` to every call
    /// currently waiting on `key`. With a zero window the row is not stored,
    /// though waiters are still resolved.
    pub fn cache_response(&self, key: impl Into<String>, response: Response<Bytes>) {
        let key = key.into();
        let waiters = {
            let mut state = lock(&self.state);
            if state.arm(Arc::downgrade(&self.state), &key, self.config.throttle) {
                state.cache.insert(key.clone(), response.clone());
            }
            state.inflight.drain(&key)
        };
        debug!(%key, waiters = waiters.len(), "cache seeded");
        notify(waiters, &Ok(response), Response::clone);
    }

    /// The cached response for `key`, if any.
    #[must_use]
    pub fn cached(&self, key: &str) -> Option<Response<Bytes>> {
        lock(&self.state).cache.get(key).cloned()
    }

    /// Returns `true` while `key` is inside its throttle window.
    #[must_use]
    pub fn is_throttled(&self, key: &str) -> bool {
        lock(&self.state).throttling.contains_key(key)
    }

    /// Drop the cache rows targeted by `target`; returns how many were removed.
    pub fn invalidate(&self, target: &Invalidation) -> usize {
        lock(&self.state).invalidate(target)
    }

    /// Empty the cache.
    pub fn clear(&self) {
        lock(&self.state).cache.clear();
    }
}

impl<S> Layer<S> for ThrottlingCacheLayer {
    type Service = ThrottlingCache<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ThrottlingCache {
            inner,
            config: self.config.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

enum Decision {
    Bypass,
    Hit(Response<Bytes>),
    Follow(oneshot::Receiver<Result<Response<Bytes>>>),
    Lead(String, u64),
}

/// Service serving recent responses from cache for a throttle window.
#[derive(Debug, Clone)]
pub struct ThrottlingCache<S> {
    inner: S,
    config: ThrottlingCacheConfig,
    state: Arc<Mutex<CacheState>>,
}

impl<S> ThrottlingCache<S> {
    fn decide(&self, request: &Request<Bytes>) -> Decision {
        let targets = (self.config.invalidate)(request);
        let clear = (self.config.clear)(request);
        let key = (!(self.config.skip)(request)).then(|| (self.config.key)(request));

        let mut state = lock(&self.state);
        for target in &targets {
            let removed = state.invalidate(target);
            debug!(?target, removed, "cache invalidated");
        }
        if clear {
            state.cache.clear();
            debug!("cache cleared");
        }
        let Some(key) = key else {
            return Decision::Bypass;
        };

        if state.throttling.contains_key(&key) {
            if let Some(cached) = state.cache.get(&key) {
                debug!(%key, "serving from cache");
                #[cfg(feature = "middleware-metrics")]
                metrics::counter!("sluice_cache_hits_total").increment(1);
                return Decision::Hit(self.config.replay(cached));
            }
            if let Some(receiver) = state.inflight.join(&key) {
                debug!(%key, "joining in-flight request");
                return Decision::Follow(receiver);
            }
        }

        let id = state.inflight.open(&key);
        state.arm(Arc::downgrade(&self.state), &key, self.config.throttle);
        Decision::Lead(key, id)
    }
}

impl<S> Service<Request<Bytes>> for ThrottlingCache<S>
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

        let (key, id) = match self.decide(&request) {
            Decision::Bypass => return Box::pin(async move { inner.call(request).await }),
            Decision::Hit(response) => return Box::pin(std::future::ready(Ok(response))),
            Decision::Follow(receiver) => return Box::pin(follow(receiver)),
            Decision::Lead(key, id) => (key, id),
        };

        let guard = CycleGuard::new(Arc::clone(&self.state), key, id);
        let condition = Arc::clone(&self.config.condition);

        Box::pin(async move {
            let result = inner.call(request).await;
            let admitted = result.as_ref().ok().filter(|response| condition(*response));
            let waiters = guard.finish(|state, key| {
                // A row outside its window would never be served.
                match admitted {
                    Some(response) if state.throttling.contains_key(key) => {
                        state.cache.insert(key.to_string(), response.clone());
                    }
                    _ => debug!(%key, "response not cached"),
                }
            });
            notify(waiters, &result, Response::clone);
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use futures_util::future::join_all;
    use tokio::time::sleep;
    use tower::ServiceExt;

    use super::*;
    use crate::Method;
    use crate::middleware::test_support::{MockTransport, get, request};

    const ONE: &str = "GET@https://example.com/one";

    fn body(result: Result<Response<Bytes>>) -> String {
        result.expect("response").text().expect("utf-8")
    }

    #[tokio::test(start_paused = true)]
    async fn serves_cache_inside_the_window() {
        let mock = MockTransport::ok();
        let layer = ThrottlingCacheLayer::default();
        let service = layer.layer(mock.clone());

        assert_eq!(body(service.clone().oneshot(get("/one")).await), "call-1");
        assert_eq!(body(service.clone().oneshot(get("/one")).await), "call-1");
        assert_eq!(mock.call_count(), 1);
        assert!(layer.is_throttled(ONE));

        sleep(Duration::from_millis(1100)).await;
        assert!(!layer.is_throttled(ONE));
        assert!(layer.cached(ONE).is_none());

        assert_eq!(body(service.clone().oneshot(get("/one")).await), "call-2");
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_join_the_leader() {
        let mock = MockTransport::ok().with_latency(Duration::from_millis(50));
        let service = ThrottlingCacheLayer::default().layer(mock.clone());

        let calls = (0..4).map(|_| service.clone().oneshot(get("/one")));
        let bodies: Vec<_> = join_all(calls).await.into_iter().map(body).collect();

        assert_eq!(mock.call_count(), 1);
        assert!(bodies.iter().all(|body| body == "call-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn invalidation_forces_a_fresh_call() {
        let mock = MockTransport::ok();
        let config = ThrottlingCacheConfig::default().with_invalidate(|request| {
            if request.header("X-Invalidate").is_some() {
                vec![Invalidation::Pattern(Regex::new("/one").expect("regex"))]
            } else {
                Vec::new()
            }
        });
        let layer = ThrottlingCacheLayer::new(config);
        let service = layer.layer(mock.clone());

        service.clone().oneshot(get("/one")).await.expect("first");
        assert!(layer.cached(ONE).is_some());

        let mut invalidating = get("/two");
        invalidating
            .headers_mut()
            .insert("X-Invalidate".to_string(), "1".to_string());
        service.clone().oneshot(invalidating).await.expect("invalidating");
        assert!(layer.cached(ONE).is_none());

        assert_eq!(body(service.clone().oneshot(get("/one")).await), "call-3");
        assert_eq!(mock.paths(), ["/one", "/two", "/one"]);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_flag_wipes_every_row() {
        let mock = MockTransport::ok();
        let service = ThrottlingCacheLayer::default().layer(mock.clone());

        service.clone().oneshot(get("/one")).await.expect("one");
        service.clone().oneshot(get("/two")).await.expect("two");

        let mut clearing = get("/two");
        clearing.flags_mut().clear_cache = true;
        assert_eq!(body(service.clone().oneshot(clearing).await), "call-3");
        assert_eq!(body(service.clone().oneshot(get("/one")).await), "call-4");
    }

    #[tokio::test(start_paused = true)]
    async fn unsuccessful_responses_are_not_admitted() {
        let mock = MockTransport::status(500);
        let layer = ThrottlingCacheLayer::default();
        let service = layer.layer(mock.clone());

        service.clone().oneshot(get("/one")).await.expect("first");
        service.clone().oneshot(get("/one")).await.expect("second");

        assert_eq!(mock.call_count(), 2);
        assert!(layer.cached(ONE).is_none());
        assert!(layer.is_throttled(ONE));
    }

    #[tokio::test(start_paused = true)]
    async fn custom_condition_gates_admission() {
        let mock = MockTransport::status(404);
        let config =
            ThrottlingCacheConfig::default().with_condition(|response| response.status() < 500);
        let service = ThrottlingCacheLayer::new(config).layer(mock.clone());

        service.clone().oneshot(get("/one")).await.expect("first");
        service.clone().oneshot(get("/one")).await.expect("second");

        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn leader_failure_is_replayed() {
        let mock = MockTransport::failing(Error::Timeout).with_latency(Duration::from_millis(50));
        let service = ThrottlingCacheLayer::default().layer(mock.clone());

        let calls = (0..3).map(|_| service.clone().oneshot(get("/one")));
        let results = join_all(calls).await;

        assert_eq!(mock.call_count(), 1);
        assert!(results.iter().all(|result| {
            result.as_ref().is_err_and(Error::is_timeout)
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn cache_hits_can_be_flagged() {
        let config = ThrottlingCacheConfig::default().with_flag_response_on_cache_hit("cached");
        let service = ThrottlingCacheLayer::new(config).layer(MockTransport::ok());

        let fresh = service.clone().oneshot(get("/one")).await.expect("fresh");
        let replayed = service.clone().oneshot(get("/one")).await.expect("replayed");

        assert!(fresh.cache_hit().is_none());
        assert_eq!(replayed.cache_hit().map(CacheHit::marker), Some("cached"));
        assert!(replayed.headers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn seeded_responses_are_served_and_expire() {
        let mock = MockTransport::ok();
        let layer = ThrottlingCacheLayer::default();
        let service = layer.layer(mock.clone());

        layer.cache_response(ONE, Response::new(200, HashMap::new(), Bytes::from("seeded")));
        assert!(layer.is_throttled(ONE));
        assert_eq!(body(service.clone().oneshot(get("/one")).await), "seeded");
        assert_eq!(mock.call_count(), 0);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(body(service.clone().oneshot(get("/one")).await), "call-1");
    }

    #[tokio::test(start_paused = true)]
    async fn seeding_resolves_waiting_calls() {
        let mock = MockTransport::ok().with_latency(Duration::from_secs(10));
        let layer = ThrottlingCacheLayer::default();
        let service = layer.layer(mock.clone());

        let leader = tokio::spawn(service.clone().oneshot(get("/one")));
        tokio::task::yield_now().await;
        let follower = tokio::spawn(service.clone().oneshot(get("/one")));
        tokio::task::yield_now().await;

        layer.cache_response(ONE, Response::new(200, HashMap::new(), Bytes::from("seeded")));

        assert_eq!(body(follower.await.expect("join")), "seeded");
        assert_eq!(body(leader.await.expect("join")), "call-1");
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn non_get_and_flagged_calls_bypass() {
        let mock = MockTransport::ok();
        let layer = ThrottlingCacheLayer::default();
        let service = layer.layer(mock.clone());

        service.clone().oneshot(request(Method::Post, "/one")).await.expect("post");
        service.clone().oneshot(request(Method::Post, "/one")).await.expect("post");

        let mut skipped = get("/one");
        skipped.flags_mut().skip_cache = true;
        service.clone().oneshot(skipped).await.expect("skipped");

        assert_eq!(mock.call_count(), 3);
        assert!(!layer.is_throttled(ONE));
    }

    #[tokio::test(start_paused = true)]
    async fn programmatic_invalidation_and_clear() {
        let layer = ThrottlingCacheLayer::default();
        let service = layer.layer(MockTransport::ok());
        service.clone().oneshot(get("/one")).await.expect("one");
        service.clone().oneshot(get("/two")).await.expect("two");

        assert_eq!(layer.invalidate(&Invalidation::Key(ONE.to_string())), 1);
        assert!(layer.cached(ONE).is_none());
        assert!(layer.cached("GET@https://example.com/two").is_some());

        layer.clear();
        assert!(layer.cached("GET@https://example.com/two").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_window_never_caches() {
        let mock = MockTransport::ok();
        let config = ThrottlingCacheConfig::default().with_throttle(Duration::ZERO);
        let service = ThrottlingCacheLayer::new(config).layer(mock.clone());

        service.clone().oneshot(get("/one")).await.expect("first");
        service.clone().oneshot(get("/one")).await.expect("second");

        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_window_seeding_stores_nothing() {
        let mock = MockTransport::ok();
        let layer = ThrottlingCacheLayer::new(
            ThrottlingCacheConfig::default().with_throttle(Duration::ZERO),
        );
        let service = layer.layer(mock.clone());

        layer.cache_response(ONE, Response::new(200, HashMap::new(), Bytes::from("seeded")));
        assert!(layer.cached(ONE).is_none());
        assert!(!layer.is_throttled(ONE));

        sleep(Duration::from_secs(100)).await;
        assert_eq!(body(service.clone().oneshot(get("/one")).await), "call-1");
        assert_eq!(mock.call_count(), 1);
        assert!(layer.cached(ONE).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn independent_layers_do_not_share_rows() {
        let first = ThrottlingCacheLayer::default();
        let second = ThrottlingCacheLayer::default();

        first
            .layer(MockTransport::ok())
            .oneshot(get("/one"))
            .await
            .expect("first");

        assert!(first.cached(ONE).is_some());
        assert!(second.cached(ONE).is_none());
        assert!(!second.is_throttled(ONE));
    }

    #[test]
    fn invalidation_targets() {
        assert!(Invalidation::Key(ONE.to_string()).matches(ONE));
        assert!(!Invalidation::Key(ONE.to_string()).matches("GET@https://example.com/two"));

        let pattern = Invalidation::from(Regex::new(r"example\.com/t").expect("regex"));
        assert!(pattern.matches("GET@https://example.com/two"));
        assert!(!pattern.matches(ONE));
    }
}
