//! Prelude module for convenient imports.
//!
//! This module re-exports the most commonly used types and functions
//! for easy glob importing:
//!
//! ```ignore
//! use sluice_core::prelude::*;
//! ```

pub use crate::{
    CacheHit, Error, Flags, Method, Request, RequestBuilder, RequestOptions, Response, Result,
    Transport, TransportExt, from_json, request_key, to_json,
};
