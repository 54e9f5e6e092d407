//! Tower middleware layers for sluice transports.
//!
//! Every layer here maps a `Service<Request, Response = Response, Error =
//! Error>` to another one with the same contract, so they stack with each
//! other and with any base transport.
//!
//! # Stateful layers (always available)
//!
//! - [`DedupeLayer`] - Coalesces concurrent identical requests
//! - [`RetryLayer`] - Re-issues requests with backoff until they satisfy a predicate
//! - [`ThrottlingCacheLayer`] - Serves recent responses for a throttle window
//!
//! Each `*Layer::new` owns fresh registries. Clones share them.
//!
//! # Observability
//!
//! - [`LoggingLayer`] - Logs requests/responses using `tracing`
//! - [`MetricsLayer`] - Records HTTP metrics (feature `middleware-metrics`)
//!
//! # Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `middleware-logging` | `.with_logging()` helper |
//! | `middleware-metrics` | [`MetricsLayer`], `.with_metrics()` helper and middleware counters |
//! | `middleware-full` | All of the above |
//!
//! # Example
//!
//! ```ignore
//! use sluice::HyperTransport;
//! use sluice::middleware::{RetryConfig, RetryLayer};
//! use std::time::Duration;
//!
//! let transport = HyperTransport::builder()
//!     .with_dedupe()
//!     .layer(RetryLayer::new(
//!         RetryConfig::default()
//!             .with_delay(Duration::from_millis(100))
//!             .with_retry_on_network_error(true),
//!     ))
//!     .build();
//! ```

mod dedupe;
mod logging;
#[cfg(feature = "middleware-metrics")]
mod metrics;
mod registry;
mod retry;
#[cfg(test)]
pub(crate) mod test_support;
mod throttling_cache;

pub use dedupe::{Dedupe, DedupeConfig, DedupeLayer, ResolverFn};
pub use logging::{LogLevel, Logging, LoggingLayer};
#[cfg(feature = "middleware-metrics")]
pub use metrics::{Metrics, MetricsLayer};
pub use registry::{KeyFn, RequestPredicate};
pub use retry::{
    DelayRampFn, HookFuture, OnRetryFn, Retry, RetryConfig, RetryContext, RetryLayer,
    RetryOverride, UntilFn,
};
pub use throttling_cache::{
    ConditionFn, InvalidateFn, Invalidation, ThrottlingCache, ThrottlingCacheConfig,
    ThrottlingCacheLayer,
};

// Re-export tower types for convenience
pub use tower::{Layer, ServiceBuilder};
