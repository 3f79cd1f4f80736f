//! Request descriptors and the transport boundary.

use async_trait::async_trait;
use serde_json::Value;

use super::error::FetchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }
}

/// One field of a multipart form.
#[derive(Debug, Clone, PartialEq)]
pub enum FormPart {
  Text {
    name: String,
    value: String,
  },
  File {
    name: String,
    file_name: String,
    mime: String,
    bytes: Vec<u8>,
  },
}

impl FormPart {
  pub fn name(&self) -> &str {
    match self {
      FormPart::Text { name, .. } | FormPart::File { name, .. } => name,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum RequestBody {
  #[default]
  Empty,
  Json(Value),
  Multipart(Vec<FormPart>),
}

/// Shape of one HTTP request, produced by an endpoint from its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
  pub method: Method,
  /// Path relative to the API base URL
  pub path: String,
  pub query: Vec<(String, String)>,
  pub body: RequestBody,
}

impl RequestDescriptor {
  pub fn get(path: impl Into<String>) -> Self {
    Self::new(Method::Get, path)
  }

  pub fn new(method: Method, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      query: Vec::new(),
      body: RequestBody::Empty,
    }
  }

  /// Add a query parameter. Empty values are skipped.
  pub fn param(mut self, name: &str, value: impl ToString) -> Self {
    let value = value.to_string();
    if !value.is_empty() {
      self.query.push((name.to_string(), value));
    }
    self
  }

  pub fn json(mut self, body: Value) -> Self {
    self.body = RequestBody::Json(body);
    self
  }

  pub fn multipart(mut self, parts: Vec<FormPart>) -> Self {
    self.body = RequestBody::Multipart(parts);
    self
  }
}

/// Sends requests to the backing REST service.
///
/// The only place the engine suspends. Implementations map transport and
/// HTTP failures onto [`FetchError`].
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: RequestDescriptor) -> Result<Value, FetchError>;
}
