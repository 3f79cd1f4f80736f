//! HTTP transport for the CRM backend.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::cache::{FetchError, FormPart, Method, RequestBody, RequestDescriptor, Transport};

/// Sends [`RequestDescriptor`]s with reqwest.
#[derive(Clone, Debug)]
pub struct HttpTransport {
  client: Client,
  base: Url,
  token: Option<String>,
}

impl HttpTransport {
  /// `base_url` is the site root; descriptor paths are resolved under it.
  pub fn new(
    base_url: &str,
    token: Option<String>,
    timeout: Option<Duration>,
  ) -> Result<Self, FetchError> {
    let mut base = Url::parse(base_url).map_err(|e| FetchError::InvalidArgs(format!("invalid API URL: {}", e)))?;
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let mut builder = Client::builder().user_agent(concat!("crmq/", env!("CARGO_PKG_VERSION")));
    if let Some(timeout) = timeout {
      builder = builder.timeout(timeout);
    }
    let client = builder.build().map_err(|e| FetchError::Network(e.to_string()))?;

    Ok(Self { client, base, token })
  }

  pub fn base(&self) -> &Url {
    &self.base
  }

  fn url(&self, request: &RequestDescriptor) -> Result<Url, FetchError> {
    let mut url = self
      .base
      .join(request.path.trim_start_matches('/'))
      .map_err(|e| FetchError::InvalidArgs(format!("invalid path {}: {}", request.path, e)))?;
    if !request.query.is_empty() {
      url.query_pairs_mut().extend_pairs(&request.query);
    }
    Ok(url)
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, request: RequestDescriptor) -> Result<Value, FetchError> {
    let url = self.url(&request)?;
    debug!(method = request.method.as_str(), url = %url, "request");

    let mut req = self.client.request(method(request.method), url);
    if let Some(token) = &self.token {
      req = req.bearer_auth(token);
    }
    req = match request.body {
      RequestBody::Empty => req,
      RequestBody::Json(body) => req.json(&body),
      RequestBody::Multipart(parts) => req.multipart(form(parts)?),
    };

    let resp = req.send().await.map_err(|e| FetchError::Network(e.to_string()))?;
    let status = resp.status();
    let bytes = resp.bytes().await.map_err(|e| FetchError::Network(e.to_string()))?;

    if !status.is_success() {
      return Err(status_error(status, &bytes));
    }
    if status == StatusCode::NO_CONTENT || bytes.is_empty() {
      return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes).map_err(|e| FetchError::Decode(e.to_string()))
  }
}

fn method(method: Method) -> reqwest::Method {
  match method {
    Method::Get => reqwest::Method::GET,
    Method::Post => reqwest::Method::POST,
    Method::Put => reqwest::Method::PUT,
    Method::Patch => reqwest::Method::PATCH,
    Method::Delete => reqwest::Method::DELETE,
  }
}

fn form(parts: Vec<FormPart>) -> Result<Form, FetchError> {
  parts.into_iter().try_fold(Form::new(), |form, part| {
    Ok(match part {
      FormPart::Text { name, value } => form.text(name, value),
      FormPart::File {
        name,
        file_name,
        mime,
        bytes,
      } => {
        let part = Part::bytes(bytes)
          .file_name(file_name)
          .mime_str(&mime)
          .map_err(|e| FetchError::InvalidArgs(format!("invalid mime type {}: {}", mime, e)))?;
        form.part(name, part)
      }
    })
  })
}

/// Map a non-2xx response. A 4xx whose body is a field → messages object
/// becomes [`FetchError::Validation`].
fn status_error(status: StatusCode, body: &[u8]) -> FetchError {
  let code = status.as_u16();
  if status.is_client_error() {
    if let Some(fields) = validation_fields(body) {
      return FetchError::Validation { code, fields };
    }
  }
  FetchError::HttpStatus {
    code,
    body: String::from_utf8_lossy(body).into_owned(),
  }
}

fn validation_fields(body: &[u8]) -> Option<BTreeMap<String, Vec<String>>> {
  let Value::Object(map) = serde_json::from_slice::<Value>(body).ok()? else {
    return None;
  };
  // {"detail": "..."} is a plain error, not a field map
  if map.len() == 1 && map.contains_key("detail") {
    return None;
  }

  let fields: BTreeMap<String, Vec<String>> = map
    .into_iter()
    .map(|(field, messages)| {
      let messages = match messages {
        Value::Array(items) => items
          .into_iter()
          .map(|m| match m {
            Value::String(s) => s,
            other => other.to_string(),
          })
          .collect(),
        Value::String(s) => vec![s],
        other => vec![other.to_string()],
      };
      (field, messages)
    })
    .collect();

  (!fields.is_empty()).then_some(fields)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_paths_resolve_under_base_prefix() {
    let transport = HttpTransport::new("https://crm.example.com/backend", None, None).unwrap();
    let url = transport
      .url(&RequestDescriptor::get("/api/clients/").param("page", 2).param("search", "acme co"))
      .unwrap();
    assert_eq!(
      url.as_str(),
      "https://crm.example.com/backend/api/clients/?page=2&search=acme+co"
    );
  }

  #[test]
  fn test_field_errors_become_validation() {
    let err = status_error(
      StatusCode::BAD_REQUEST,
      br#"{"inn": ["Invalid INN"], "name": "Required"}"#,
    );
    let FetchError::Validation { code, fields } = err else {
      panic!("expected validation error");
    };
    assert_eq!(code, 400);
    assert_eq!(fields["inn"], vec!["Invalid INN"]);
    assert_eq!(fields["name"], vec!["Required"]);
  }

  #[test]
  fn test_detail_and_server_errors_stay_http_status() {
    assert!(matches!(
      status_error(StatusCode::NOT_FOUND, br#"{"detail": "Not found."}"#),
      FetchError::HttpStatus { code: 404, .. }
    ));
    assert!(matches!(
      status_error(StatusCode::INTERNAL_SERVER_ERROR, br#"{"name": ["x"]}"#),
      FetchError::HttpStatus { code: 500, .. }
    ));
  }

  #[test]
  fn test_bad_base_url_rejected() {
    assert!(HttpTransport::new("not a url", None, None).is_err());
  }
}
