//! HTTP response handling.
//!
//! [`Response`] provides access to status, headers, and a fully buffered body.
//! Cloning is a cheap snapshot: every clone reads the same immutable bytes
//! independently, which is what lets one network call answer many callers.
//!
//! # Example
//!
//! ```ignore
//! let user: User = response.json()?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

/// Marker attached to responses replayed from a cache.
///
/// Stored in [`Response::extensions`], so it never shows up among the headers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheHit {
    marker: Arc<str>,
}

impl CacheHit {
    /// Create a marker with the given name.
    #[must_use]
    pub fn new(marker: impl Into<Arc<str>>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    /// Marker name configured on the cache.
    #[must_use]
    pub fn marker(&self) -> &str {
        &self.marker
    }
}

/// HTTP response with status, headers, and body.
#[derive(Debug, Clone)]
pub struct Response<B = Bytes> {
    status: u16,
    headers: HashMap<String, String>,
    body: B,
    extensions: http::Extensions,
}

impl<B> Response<B> {
    /// Creates a new response.
    #[must_use]
    pub fn new(status: u16, headers: HashMap<String, String>, body: B) -> Self {
        Self {
            status,
            headers,
            body,
            extensions: http::Extensions::new(),
        }
    }

    /// HTTP status code.
    #[must_use]
    pub const fn status(&self) -> u16 {
        self.status
    }

    /// Response headers.
    #[must_use]
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Single header value by name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Response body.
    #[must_use]
    pub const fn body(&self) -> &B {
        &self.body
    }

    /// Typed side data attached by middlewares.
    #[must_use]
    pub fn extensions(&self) -> &http::Extensions {
        &self.extensions
    }

    /// Mutable access to the extensions.
    #[must_use]
    pub fn extensions_mut(&mut self) -> &mut http::Extensions {
        &mut self.extensions
    }

    /// Cache marker, present when the response was replayed from a cache
    /// configured to flag its hits.
    #[must_use]
    pub fn cache_hit(&self) -> Option<&CacheHit> {
        self.extensions.get::<CacheHit>()
    }

    /// Consume into body.
    #[must_use]
    pub fn into_body(self) -> B {
        self.body
    }

    /// Consume into (status, headers, body).
    #[must_use]
    pub fn into_parts(self) -> (u16, HashMap<String, String>, B) {
        (self.status, self.headers, self.body)
    }

    /// Status is 2xx.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Status is 3xx.
    #[must_use]
    pub const fn is_redirection(&self) -> bool {
        self.status >= 300 && self.status < 400
    }

    /// Status is 4xx.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        self.status >= 400 && self.status < 500
    }

    /// Status is 5xx.
    #[must_use]
    pub const fn is_server_error(&self) -> bool {
        self.status >= 500 && self.status < 600
    }
}

impl Response<Bytes> {
    /// Deserialize the response body as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if deserialization fails.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
        crate::from_json(&self.body)
    }

    /// Get the response body as text.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not valid UTF-8.
    pub fn text(&self) -> Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.body.to_vec())
    }

    /// Raw body bytes (a cheap handle on the shared buffer).
    #[must_use]
    pub fn bytes(&self) -> Bytes {
        self.body.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_basic() {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());

        let response = Response::new(200, headers, Bytes::from(r#"{"id":1}"#));

        assert_eq!(response.status(), 200);
        assert_eq!(response.header("Content-Type"), Some("application/json"));
        assert!(response.is_success());
        assert!(!response.is_client_error());
        assert!(!response.is_server_error());
        assert!(response.cache_hit().is_none());
    }

    #[test]
    fn response_status_checks() {
        let response = Response::new(301, HashMap::new(), Bytes::new());
        assert!(response.is_redirection());

        let response = Response::new(404, HashMap::new(), Bytes::new());
        assert!(response.is_client_error());

        let response = Response::new(500, HashMap::new(), Bytes::new());
        assert!(response.is_server_error());
    }

    #[test]
    fn clones_read_body_independently() {
        #[derive(Debug, PartialEq, serde::Deserialize)]
        struct User {
            id: u64,
            name: String,
        }

        let body = Bytes::from(r#"{"id":1,"name":"test"}"#);
        let response = Response::new(200, HashMap::new(), body);
        let replay = response.clone();

        let user: User = response.json().expect("deserialize");
        assert_eq!(user.id, 1);
        let text = replay.text().expect("text");
        assert_eq!(text, r#"{"id":1,"name":"test"}"#);
        assert_eq!(replay.bytes(), response.bytes());
    }

    #[test]
    fn cache_hit_marker_is_not_a_header() {
        let mut response = Response::new(200, HashMap::new(), Bytes::from("cached"));
        response.extensions_mut().insert(CacheHit::new("__cached"));

        assert_eq!(response.cache_hit().map(CacheHit::marker), Some("__cached"));
        assert!(response.headers().is_empty());

        let cloned = response.clone();
        assert!(cloned.cache_hit().is_some());
    }
}
