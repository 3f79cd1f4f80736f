//! Canonical cache keys.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Canonical identifier for one query's cached result.
///
/// Derived from the endpoint name and its arguments. Object keys inside the
/// arguments are sorted before hashing, so `{a, b}` and `{b, a}` land on the
/// same key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
  pub fn new(endpoint: &str, args: &Value) -> Self {
    let canonical = canonical_json(args);

    // Fixed length no matter how large the arguments are
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hex::encode(hasher.finalize());

    Self(format!("{}:{}", endpoint, digest).into())
  }

  /// Name of the endpoint this key belongs to.
  pub fn endpoint(&self) -> &str {
    self.0.split(':').next().unwrap_or_default()
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    // Endpoint plus a short digest prefix is plenty for logs
    let short = self.0.len().min(self.endpoint().len() + 13);
    f.write_str(&self.0[..short])
  }
}

impl fmt::Debug for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "CacheKey({})", self)
  }
}

/// Serialize `value` with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
  sort_keys(value).to_string()
}

fn sort_keys(value: &Value) -> Value {
  match value {
    Value::Object(map) => {
      let mut entries: Vec<(&String, &Value)> = map.iter().collect();
      entries.sort_by(|a, b| a.0.cmp(b.0));
      let sorted: Map<String, Value> = entries
        .into_iter()
        .map(|(k, v)| (k.clone(), sort_keys(v)))
        .collect();
      Value::Object(sorted)
    }
    Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
    other => other.clone(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_argument_order_is_irrelevant() {
    let a = CacheKey::new("getClients", &json!({ "page": 1, "search": "" }));
    let b = CacheKey::new("getClients", &json!({ "search": "", "page": 1 }));
    assert_eq!(a, b);
  }

  #[test]
  fn test_nested_objects_are_canonical() {
    let a = json!({ "filter": { "x": 1, "y": [ { "b": 2, "a": 1 } ] } });
    let b = json!({ "filter": { "y": [ { "a": 1, "b": 2 } ], "x": 1 } });
    assert_eq!(canonical_json(&a), canonical_json(&b));
  }

  #[test]
  fn test_endpoint_and_args_both_matter() {
    let args = json!({ "id": 42 });
    assert_ne!(CacheKey::new("getClient", &args), CacheKey::new("getContract", &args));
    assert_ne!(
      CacheKey::new("getClient", &args),
      CacheKey::new("getClient", &json!({ "id": 43 }))
    );
  }

  #[test]
  fn test_endpoint_accessor() {
    let key = CacheKey::new("getClients", &Value::Null);
    assert_eq!(key.endpoint(), "getClients");
    assert!(key.to_string().starts_with("getClients:"));
  }
}
