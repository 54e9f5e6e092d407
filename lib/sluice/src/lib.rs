//! Composable HTTP transport pipeline for Rust.
//!
//! A base [`Transport`] is wrapped by an ordered stack of Tower layers that add
//! resilience without changing the transport contract:
//!
//! - [`DedupeLayer`](middleware::DedupeLayer) coalesces concurrent identical calls
//! - [`RetryLayer`](middleware::RetryLayer) re-issues failed or unsatisfying calls with backoff
//! - [`ThrottlingCacheLayer`](middleware::ThrottlingCacheLayer) replays recent responses
//!   for a bounded window and coalesces misses
//!
//! # Example
//!
//! ```ignore
//! use sluice::prelude::*;
//! use std::time::Duration;
//!
//! let transport = HyperTransport::builder()
//!     .with_dedupe()
//!     .with_throttling_cache(Duration::from_secs(1))
//!     .with_retry(3)
//!     .build();
//!
//! let response = transport.get("https://api.example.com/users/42").await?;
//! ```
//!
//! Middlewares registered first run first: in the example above, the dedupe
//! layer sees each call before the cache, and the retry layer sits closest to
//! the network.

mod client;
pub mod compose;
mod config;
mod connector;
pub mod middleware;
pub mod prelude;

pub use client::{HyperTransport, HyperTransportBuilder};
pub use compose::{
    BoxTransport, Composer, Middleware, Pipeline, TransportFuture, compose, middleware,
    transport_fn,
};
pub use config::{TransportConfig, TransportConfigBuilder};

// Re-export tower for middleware composition
pub use tower;

// Re-export core types
pub use sluice_core::{
    CacheHit, Error, Extensions, Flags, Method, Request, RequestBuilder, RequestOptions, Response,
    Result, Transport, TransportExt, from_json, request_key, to_json,
};

// Re-export http types for status codes and headers
pub use sluice_core::{StatusCode, header};

pub use url;
