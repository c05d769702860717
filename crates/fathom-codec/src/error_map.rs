//! Decoding the server's error map, the one JSON payload this codec
//! understands; every other KV payload is opaque bytes.

use std::collections::HashSet;

use fathom_core::status::{ErrorMap, ErrorMapAttribute, ErrorMapEntry};
use serde::Deserialize;
use thiserror::Error;

#[derive(Deserialize)]
struct RawErrorMap {
    errors: std::collections::HashMap<String, RawErrorEntry>,
}

#[derive(Deserialize)]
struct RawErrorEntry {
    name: String,
    desc: String,
    #[serde(default)]
    attrs: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ErrorMapDecodeError {
    #[error("malformed error map JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("error map entry key {0:?} is not a hex status code")]
    BadKey(String),
}

/// Decode the `get_error_map` response body into a [`fathom_core::status::ErrorMap`].
pub fn decode_error_map(body: &[u8]) -> Result<ErrorMap, ErrorMapDecodeError> {
    let raw: RawErrorMap = serde_json::from_slice(body)?;
    let mut map = ErrorMap::new();
    for (key, entry) in raw.errors {
        let code = u16::from_str_radix(key.trim_start_matches("0x"), 16)
            .map_err(|_| ErrorMapDecodeError::BadKey(key.clone()))?;
        let attributes: HashSet<ErrorMapAttribute> =
            entry.attrs.iter().map(|tag| ErrorMapAttribute::parse(tag)).collect();
        map.insert(
            code,
            ErrorMapEntry {
                name: entry.name,
                description: entry.desc,
                attributes,
            },
        );
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "version": 2,
        "revision": 1,
        "errors": {
            "86": {"name": "TMPFAIL", "desc": "temporary failure", "attrs": ["temp", "retry-later"]},
            "07": {"name": "NOT_MY_VBUCKET", "desc": "", "attrs": ["retry-now"]}
        }
    }"#;

    #[test]
    fn decodes_known_entries_with_attributes() {
        let map = decode_error_map(SAMPLE.as_bytes()).unwrap();
        assert!(map.indicates_retry(0x86));
        assert!(map.indicates_retry(0x07));
        assert!(!map.invalidates_connection(0x86));
    }

    #[test]
    fn malformed_json_is_an_error_not_a_panic() {
        assert!(decode_error_map(b"not json").is_err());
    }
}
