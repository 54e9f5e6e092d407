//! Prelude module for convenient imports.
//!
//! ```ignore
//! use sluice::prelude::*;
//! ```

pub use crate::middleware::{
    DedupeConfig, DedupeLayer, Invalidation, RetryConfig, RetryLayer, ThrottlingCacheConfig,
    ThrottlingCacheLayer,
};
pub use crate::{
    BoxTransport, Composer, Error, Flags, HyperTransport, Method, Request, Response, Result,
    StatusCode, Transport, TransportConfig, TransportExt, compose, from_json, header,
    transport_fn,
};
