//! Request fingerprinting.
//!
//! A fingerprint is the SHA-256 of `{"endpoint": ..., "params": ...}` with every
//! object's keys sorted recursively, so logically identical requests share cache
//! and dedupe entries regardless of parameter order. Array order is preserved.
//!
//! Omitted parameters and parameters set through [`Params::set_opt`] with `None`
//! hash the same; an explicit JSON `null` does not.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Recursively rebuild `value` with object keys in lexicographic order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::with_capacity(entries.len());
            for (k, v) in entries {
                sorted.insert(k.clone(), canonicalize(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Fingerprint an endpoint and its parameters as 64 lowercase hex characters.
pub fn fingerprint(endpoint: &str, params: &Value) -> String {
    let mut body = Map::new();
    body.insert("endpoint".into(), Value::String(endpoint.to_string()));
    body.insert("params".into(), canonicalize(params));
    // Serializing a Value cannot fail: every map key is already a string.
    let canonical = serde_json::to_string(&Value::Object(body)).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Fingerprint any serializable parameter struct.
///
/// Fields skipped by serde (`skip_serializing_if = "Option::is_none"`) behave as omitted.
pub fn fingerprint_of<P: Serialize>(endpoint: &str, params: &P) -> crate::Result<String> {
    let value = serde_json::to_value(params)?;
    Ok(fingerprint(endpoint, &value))
}

/// Ordered-insensitive parameter bag for building request fingerprints.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    inner: Map<String, Value>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inner.insert(key.into(), value.into());
        self
    }

    /// `None` leaves the key out entirely.
    pub fn set_opt<V: Into<Value>>(self, key: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(v) => self.set(key, v),
            None => self,
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.inner.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.inner.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.inner.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.inner.clone())
    }
}

impl From<Map<String, Value>> for Params {
    fn from(inner: Map<String, Value>) -> Self {
        Self { inner }
    }
}

/// A fingerprinted upstream call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub endpoint: String,
    pub hash: String,
}

impl RequestKey {
    pub fn new(endpoint: impl Into<String>, params: &Params) -> Self {
        let endpoint = endpoint.into();
        let hash = fingerprint(&endpoint, &params.to_value());
        Self { endpoint, hash }
    }

    pub fn as_str(&self) -> &str {
        &self.hash
    }
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_does_not_matter() {
        let a = json!({"limit": 10, "filter": {"name": "batman", "id": 3}, "sort": "id"});
        let b = json!({"sort": "id", "filter": {"id": 3, "name": "batman"}, "limit": 10});
        assert_eq!(fingerprint("issues", &a), fingerprint("issues", &b));
    }

    #[test]
    fn test_values_and_endpoint_matter() {
        assert_ne!(
            fingerprint("issues", &json!({"a": 1})),
            fingerprint("issues", &json!({"a": 2}))
        );
        assert_ne!(
            fingerprint("issues", &json!({"a": 1})),
            fingerprint("volumes", &json!({"a": 1}))
        );
    }

    #[test]
    fn test_array_order_is_preserved() {
        assert_ne!(
            fingerprint("issues", &json!({"ids": [1, 2]})),
            fingerprint("issues", &json!({"ids": [2, 1]}))
        );
    }

    #[test]
    fn test_omitted_versus_null() {
        let empty = Params::new();
        let omitted = Params::new().set_opt("a", None::<i64>);
        let null = Params::new().set("a", Value::Null);
        assert_eq!(
            RequestKey::new("issues", &omitted),
            RequestKey::new("issues", &empty)
        );
        assert_ne!(RequestKey::new("issues", &null), RequestKey::new("issues", &empty));
    }

    #[test]
    fn test_serializable_params() {
        #[derive(Serialize)]
        struct ListParams {
            limit: u32,
            #[serde(skip_serializing_if = "Option::is_none")]
            offset: Option<u32>,
        }
        let typed = fingerprint_of("issues", &ListParams { limit: 5, offset: None }).unwrap();
        assert_eq!(typed, fingerprint("issues", &json!({"limit": 5})));
    }

    #[test]
    fn test_digest_shape() {
        let fp = fingerprint("issues", &json!({}));
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
