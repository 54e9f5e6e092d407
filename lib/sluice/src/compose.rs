//! Pipeline composition.
//!
//! A transport is any Tower service from [`Request`] to [`Response`]; a
//! middleware is a function from one boxed transport to another. The
//! [`Composer`] folds an ordered list of middlewares around a base transport:
//! the first middleware is the outermost decorator and the last one sits
//! closest to the base.
//!
//! ```text
//! caller -> m[0] -> m[1] -> ... -> m[n-1] -> base
//! ```
//!
//! # Example
//!
//! ```ignore
//! use sluice::{Composer, transport_fn};
//! use sluice::middleware::{DedupeLayer, RetryLayer};
//!
//! let base = transport_fn(|request| async move { my_send(request).await });
//! let pipeline = Composer::new()
//!     .layer(DedupeLayer::default())
//!     .layer(RetryLayer::default())
//!     .build(base);
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use bytes::Bytes;
use tower::Layer;
use tower::util::BoxCloneService;
use tower_service::Service;

use crate::{Error, Request, Response, Result};

/// Type-erased transport, the unit every middleware wraps and returns.
pub type BoxTransport = BoxCloneService<Request<Bytes>, Response<Bytes>, Error>;

/// Future returned by pipeline transports.
pub type TransportFuture = Pin<Box<dyn Future<Output = Result<Response<Bytes>>> + Send + 'static>>;

/// A middleware: decorates one transport into another.
pub type Middleware = Arc<dyn Fn(BoxTransport) -> BoxTransport + Send + Sync>;

/// Adapt an async function into a [`BoxTransport`].
///
/// Handy as a base transport for tests or for plugging a foreign HTTP stack.
pub fn transport_fn<F, Fut>(f: F) -> BoxTransport
where
    F: Fn(Request<Bytes>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Result<Response<Bytes>>> + Send + 'static,
{
    BoxCloneService::new(tower::service_fn(f))
}

/// Turn a Tower layer into a [`Middleware`].
pub fn middleware<L>(layer: L) -> Middleware
where
    L: Layer<BoxTransport> + Send + Sync + 'static,
    L::Service: Service<Request<Bytes>, Response = Response<Bytes>, Error = Error>
        + Clone
        + Send
        + 'static,
    <L::Service as Service<Request<Bytes>>>::Future: Send,
{
    Arc::new(move |inner| BoxCloneService::new(layer.layer(inner)))
}

/// Apply `middlewares` around `base`, first element outermost.
///
/// An empty slice returns `base` unchanged.
#[must_use]
pub fn compose(middlewares: &[Middleware], base: BoxTransport) -> BoxTransport {
    middlewares
        .iter()
        .rev()
        .fold(base, |inner, middleware| middleware(inner))
}

/// Ordered list of middlewares.
///
/// Composing is pure wiring: the same composer applied twice produces two
/// pipelines that behave alike. Layers keep their own state, so both
/// pipelines share whatever registries those layers own.
#[derive(Clone, Default)]
pub struct Composer {
    middlewares: Vec<Middleware>,
}

impl std::fmt::Debug for Composer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Composer")
            .field("middlewares", &self.middlewares.len())
            .finish()
    }
}

impl Composer {
    /// Create an empty composer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a Tower layer; it runs after every layer added before it.
    #[must_use]
    pub fn layer<L>(self, layer: L) -> Self
    where
        L: Layer<BoxTransport> + Send + Sync + 'static,
        L::Service: Service<Request<Bytes>, Response = Response<Bytes>, Error = Error>
            + Clone
            + Send
            + 'static,
        <L::Service as Service<Request<Bytes>>>::Future: Send,
    {
        self.push(middleware(layer))
    }

    /// Append an already type-erased middleware.
    #[must_use]
    pub fn push(mut self, middleware: Middleware) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Number of middlewares.
    #[must_use]
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    /// Returns `true` if no middleware was added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Wrap `base` with every middleware, first added outermost.
    #[must_use]
    pub fn compose(&self, base: BoxTransport) -> BoxTransport {
        compose(&self.middlewares, base)
    }

    /// Wrap `base` and return a shareable [`Pipeline`].
    #[must_use]
    pub fn build(&self, base: BoxTransport) -> Pipeline {
        Pipeline::new(self.compose(base))
    }
}

/// A composed transport that is `Sync` and implements [`crate::Transport`].
///
/// The boxed service is kept behind a mutex only long enough to clone it, so
/// concurrent calls never wait on each other.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Mutex<BoxTransport>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Wrap an already composed transport.
    #[must_use]
    pub fn new(transport: BoxTransport) -> Self {
        Self {
            inner: Arc::new(Mutex::new(transport)),
        }
    }

    /// Dispatch a request through the whole stack.
    pub fn call(&self, request: Request<Bytes>) -> TransportFuture {
        let mut service = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        Box::pin(async move { service.call(request).await })
    }
}

impl crate::Transport for Pipeline {
    async fn execute(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        self.call(request).await
    }
}

impl Service<Request<Bytes>> for Pipeline {
    type Response = Response<Bytes>;
    type Error = Error;
    type Future = TransportFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Bytes>) -> Self::Future {
        Pipeline::call(self, request)
    }
}
