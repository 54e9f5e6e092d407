//! HTTP request building.
//!
//! A [`Request`] is the `(url, options)` pair handed down the middleware
//! stack. [`RequestOptions`] carries the method, headers, body and the
//! [`Flags`] side channel that individual middlewares consult.
//!
//! # Example
//!
//! ```
//! use sluice_core::{Request, Method};
//! use bytes::Bytes;
//!
//! let request = Request::<Bytes>::builder(Method::Get, "https://api.example.com".parse().unwrap())
//!     .header("Accept", "application/json")
//!     .query("page", "1")
//!     .skip_cache()
//!     .build();
//! assert!(request.flags().skip_cache);
//! ```

use std::collections::HashMap;

use bytes::Bytes;

use crate::Method;

/// Per-call switches read by the middlewares.
///
/// Each flag only matters to the middleware named after it; a stack without
/// that middleware ignores it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct Flags {
    /// Never coalesce this call with concurrent duplicates.
    pub skip_dedupe: bool,
    /// Bypass the throttling cache entirely.
    pub skip_cache: bool,
    /// Do not retry this call.
    pub skip_retry: bool,
    /// Wipe the whole throttling cache before serving this call.
    pub clear_cache: bool,
}

/// Everything about a call except its target URL.
#[derive(Debug, Clone)]
pub struct RequestOptions<B = Bytes> {
    /// HTTP method.
    pub method: Method,
    /// Request headers.
    pub headers: HashMap<String, String>,
    /// Request body.
    pub body: Option<B>,
    /// Middleware side channel.
    pub flags: Flags,
}

impl<B> Default for RequestOptions<B> {
    fn default() -> Self {
        Self {
            method: Method::Get,
            headers: HashMap::new(),
            body: None,
            flags: Flags::default(),
        }
    }
}

impl<B> RequestOptions<B> {
    /// Options for the given method, everything else empty.
    #[must_use]
    pub fn new(method: Method) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }
}

/// An HTTP request: target URL plus [`RequestOptions`].
#[derive(Debug, Clone)]
pub struct Request<B = Bytes> {
    url: url::Url,
    options: RequestOptions<B>,
}

impl<B> Request<B> {
    /// Creates a new [`RequestBuilder`].
    #[must_use]
    pub fn builder(method: Method, url: url::Url) -> RequestBuilder<B> {
        RequestBuilder::new(method, url)
    }

    /// Re-join a `(url, options)` pair.
    #[must_use]
    pub fn from_parts(url: url::Url, options: RequestOptions<B>) -> Self {
        Self { url, options }
    }

    /// HTTP method.
    #[must_use]
    pub const fn method(&self) -> Method {
        self.options.method
    }

    /// Request URL.
    #[must_use]
    pub fn url(&self) -> &url::Url {
        &self.url
    }

    /// Request options.
    #[must_use]
    pub fn options(&self) -> &RequestOptions<B> {
        &self.options
    }

    /// Request headers.
    #[must_use]
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.options.headers
    }

    /// Mutable access to headers.
    #[must_use]
    pub fn headers_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.options.headers
    }

    /// Single header value by name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.options.headers.get(name).map(String::as_str)
    }

    /// Request body.
    #[must_use]
    pub const fn body(&self) -> Option<&B> {
        self.options.body.as_ref()
    }

    /// Middleware flags.
    #[must_use]
    pub const fn flags(&self) -> &Flags {
        &self.options.flags
    }

    /// Mutable access to the middleware flags.
    #[must_use]
    pub fn flags_mut(&mut self) -> &mut Flags {
        &mut self.options.flags
    }

    /// Consume into the `(url, options)` pair.
    #[must_use]
    pub fn into_parts(self) -> (url::Url, RequestOptions<B>) {
        (self.url, self.options)
    }
}

/// Builder for constructing [`Request`] instances.
#[derive(Debug, Clone)]
pub struct RequestBuilder<B = Bytes> {
    url: url::Url,
    options: RequestOptions<B>,
}

impl<B> RequestBuilder<B> {
    /// Creates a new builder.
    #[must_use]
    pub fn new(method: Method, url: url::Url) -> Self {
        Self {
            url,
            options: RequestOptions::new(method),
        }
    }

    /// Sets a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.headers.insert(name.into(), value.into());
        self
    }

    /// Appends a query parameter to the URL.
    #[must_use]
    pub fn query(mut self, name: &str, value: &str) -> Self {
        self.url.query_pairs_mut().append_pair(name, value);
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn body(mut self, body: B) -> Self {
        self.options.body = Some(body);
        self
    }

    /// Replace all middleware flags at once.
    #[must_use]
    pub const fn flags(mut self, flags: Flags) -> Self {
        self.options.flags = flags;
        self
    }

    /// Never coalesce this call.
    #[must_use]
    pub const fn skip_dedupe(mut self) -> Self {
        self.options.flags.skip_dedupe = true;
        self
    }

    /// Bypass the throttling cache.
    #[must_use]
    pub const fn skip_cache(mut self) -> Self {
        self.options.flags.skip_cache = true;
        self
    }

    /// Do not retry this call.
    #[must_use]
    pub const fn skip_retry(mut self) -> Self {
        self.options.flags.skip_retry = true;
        self
    }

    /// Empty the throttling cache before this call is processed.
    #[must_use]
    pub const fn clear_cache(mut self) -> Self {
        self.options.flags.clear_cache = true;
        self
    }

    /// Builds the [`Request`].
    #[must_use]
    pub fn build(self) -> Request<B> {
        Request {
            url: self.url,
            options: self.options,
        }
    }
}

impl RequestBuilder<Bytes> {
    /// Set a JSON body.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn json<T: serde::Serialize>(self, value: &T) -> crate::Result<Self> {
        let body = crate::to_json(value)?;
        Ok(self.header("Content-Type", "application/json").body(body))
    }
}
