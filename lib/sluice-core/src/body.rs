//! Body serialization utilities.

use bytes::Bytes;

use crate::{Error, Result};

/// Serialize a value to JSON bytes.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
///
/// # Example
///
/// ```
/// use sluice_core::to_json;
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct User { name: String }
///
/// let user = User { name: "Alice".to_string() };
/// let bytes = to_json(&user).expect("serialize");
/// assert_eq!(bytes.as_ref(), br#"{"name":"Alice"}"#);
/// ```
pub fn to_json<T: serde::Serialize>(value: &T) -> Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|err| Error::Json(err.to_string()))
}

/// Deserialize JSON bytes, reporting the path of the failing field.
///
/// # Errors
///
/// Returns [`Error::JsonDeserialization`] with the JSON path on failure.
pub fn from_json<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let deserializer = &mut serde_json::Deserializer::from_slice(bytes);
    serde_path_to_error::deserialize(deserializer).map_err(|err| {
        let path = err.path().to_string();
        Error::json_deserialization(path, err.into_inner().to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Address {
        city: String,
    }

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct User {
        name: String,
        address: Address,
    }

    #[test]
    fn from_json_reports_path() {
        let err = from_json::<User>(br#"{"name":"a","address":{}}"#).expect_err("missing city");
        let Error::JsonDeserialization { path, .. } = err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(path, "address");
    }

    #[test]
    fn json_roundtrip_value() {
        let user = User {
            name: "Alice".to_string(),
            address: Address {
                city: "Lyon".to_string(),
            },
        };
        let bytes = to_json(&user).expect("serialize");
        assert_eq!(from_json::<User>(&bytes).expect("deserialize"), user);
    }
}
