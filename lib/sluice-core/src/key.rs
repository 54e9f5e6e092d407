//! Request fingerprinting.

use crate::Request;

/// Default key correlating coalesced or cached calls: `"{METHOD}@{url}"`.
///
/// The method is part of the key, so a `POST` never shares a slot with a
/// `GET` on the same URL.
#[must_use]
pub fn request_key<B>(request: &Request<B>) -> String {
    format!("{}@{}", request.method(), request.url())
}

#[cfg(test)]
mod tests {
    use assert2::check;
    use bytes::Bytes;

    use super::*;
    use crate::Method;

    fn request(method: Method, url: &str) -> Request<Bytes> {
        Request::builder(method, url::Url::parse(url).expect("valid url")).build()
    }

    #[test]
    fn key_combines_method_and_url() {
        let key = request_key(&request(Method::Get, "https://example.com/one"));
        check!(key == "GET@https://example.com/one");
    }

    #[test]
    fn method_is_part_of_the_key() {
        let get = request_key(&request(Method::Get, "https://example.com/one"));
        let post = request_key(&request(Method::Post, "https://example.com/one"));
        check!(get != post);
    }

    #[test]
    fn identical_requests_share_a_key() {
        let first = request(Method::Get, "https://example.com/one?a=1");
        let mut second = first.clone();
        second
            .headers_mut()
            .insert("Accept".to_string(), "text/plain".to_string());
        assert_eq!(request_key(&first), request_key(&second));
    }
}
