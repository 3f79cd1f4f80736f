//! Error types for the cache engine.

use std::collections::BTreeMap;

/// Failure of a single request against the backend.
///
/// Cloneable so one failed fetch can be handed to every de-duplicated awaiter.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
  #[error("network error: {0}")]
  Network(String),

  #[error("server returned HTTP {code}: {body}")]
  HttpStatus { code: u16, body: String },

  #[error("validation failed (HTTP {code}): {}", format_fields(.fields))]
  Validation {
    code: u16,
    fields: BTreeMap<String, Vec<String>>,
  },

  #[error("failed to decode response: {0}")]
  Decode(String),

  /// Arguments could not be turned into a request
  #[error("invalid request arguments: {0}")]
  InvalidArgs(String),

  /// The fetch was aborted because the cache was disposed
  #[error("request cancelled")]
  Cancelled,
}

impl FetchError {
  pub fn status_code(&self) -> Option<u16> {
    match self {
      FetchError::HttpStatus { code, .. } | FetchError::Validation { code, .. } => Some(*code),
      _ => None,
    }
  }
}

fn format_fields(fields: &BTreeMap<String, Vec<String>>) -> String {
  fields
    .iter()
    .map(|(field, messages)| format!("{}: {}", field, messages.join("; ")))
    .collect::<Vec<_>>()
    .join(", ")
}

/// Errors raised by the engine itself, as opposed to the backend.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
  #[error("unknown endpoint '{0}'")]
  UnknownEndpoint(String),

  #[error("endpoint '{name}' is not a {expected}")]
  WrongEndpointKind { name: String, expected: &'static str },

  #[error("endpoint '{0}' is already registered")]
  DuplicateEndpoint(String),

  #[error("endpoint '{endpoint}' uses undeclared tag type '{tag_type}'")]
  UndeclaredTagType { endpoint: String, tag_type: String },

  #[error("cache has been disposed")]
  Disposed,

  #[error("no async runtime available: {0}")]
  NoRuntime(String),

  #[error(transparent)]
  Fetch(#[from] FetchError),
}
