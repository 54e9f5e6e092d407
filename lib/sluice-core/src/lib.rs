//! Core types and traits for the sluice middleware pipeline.
//!
//! This crate provides the foundational types shared by every layer:
//! - [`Method`] - HTTP method enum
//! - [`Request`], [`RequestOptions`] and [`RequestBuilder`] - the `(url, options)` pair
//! - [`Flags`] - per-call side-channel switches read by the middlewares
//! - [`Response`] - buffered HTTP response, cheap to clone
//! - [`Error`] and [`Result`] - Error handling
//! - [`Transport`] - the single-method capability every layer wraps
//! - [`request_key`] - default key correlating coalesced or cached calls
//! - [`StatusCode`] - HTTP status codes (re-exported from `http` crate)
//! - [`header`] - HTTP header names (re-exported from `http` crate)

mod body;
mod client;
mod error;
mod key;
mod method;
pub mod prelude;
mod request;
mod response;

pub use body::{from_json, to_json};
pub use client::{Transport, TransportExt};
pub use error::{Error, Result};
pub use key::request_key;
pub use method::Method;
pub use request::{Flags, Request, RequestBuilder, RequestOptions};
pub use response::{CacheHit, Response};

// Re-export http crate types for status codes and headers
pub use http::{Extensions, StatusCode, header};
