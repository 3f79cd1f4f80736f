//! Test fixtures: the CRM endpoint registry and an in-memory backend.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::cache::{EndpointRegistry, FetchError, FormPart, Method, RequestBody, RequestDescriptor, Transport};

const PAGE_SIZE: usize = 20;

pub(crate) fn client_registry() -> EndpointRegistry {
  crate::crm::registry().unwrap()
}

#[derive(Default)]
struct FakeState {
  /// Rows per resource segment ("clients", "contracts", ...)
  rows: HashMap<String, BTreeMap<u64, Value>>,
  next_id: u64,
  calls: Vec<String>,
  delays: VecDeque<Duration>,
  failures: VecDeque<FetchError>,
}

/// DRF-shaped backend held in memory.
///
/// Responses are computed when the request arrives; a queued delay only
/// postpones delivery, so a slow request reports the state it saw.
pub(crate) struct FakeBackend {
  state: Mutex<FakeState>,
}

impl FakeBackend {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      state: Mutex::new(FakeState {
        next_id: 1,
        ..Default::default()
      }),
    })
  }

  /// Backend with one client per name, ids starting at 1.
  pub fn with_clients(names: &[&str]) -> Arc<Self> {
    let backend = Self::new();
    for name in names {
      backend.seed("clients", json!({ "name": name }));
    }
    backend
  }

  /// Insert a row, assigning an id when it has none. Returns the id.
  pub fn seed(&self, resource: &str, mut row: Value) -> u64 {
    let mut state = self.state.lock().unwrap();
    let id = match row["id"].as_u64() {
      Some(id) => id,
      None => {
        let id = state.next_id;
        state.next_id += 1;
        row["id"] = json!(id);
        id
      }
    };
    state.next_id = state.next_id.max(id + 1);
    state.rows.entry(resource.to_string()).or_default().insert(id, row);
    id
  }

  pub fn set_next_id(&self, id: u64) {
    self.state.lock().unwrap().next_id = id;
  }

  pub fn rename(&self, id: u64, name: &str) {
    let mut state = self.state.lock().unwrap();
    if let Some(row) = state.rows.get_mut("clients").and_then(|r| r.get_mut(&id)) {
      row["name"] = json!(name);
    }
  }

  /// Number of requests with this method and path, query ignored.
  pub fn calls(&self, method: &str, path: &str) -> usize {
    let needle = format!("{} {}", method, path);
    self.state.lock().unwrap().calls.iter().filter(|c| **c == needle).count()
  }

  pub fn total_calls(&self) -> usize {
    self.state.lock().unwrap().calls.len()
  }

  /// Hold the next response back for `delay`.
  pub fn delay_next(&self, delay: Duration) {
    self.state.lock().unwrap().delays.push_back(delay);
  }

  /// Fail the next request with `error`.
  pub fn fail_next(&self, error: FetchError) {
    self.state.lock().unwrap().failures.push_back(error);
  }
}

#[async_trait]
impl Transport for FakeBackend {
  async fn send(&self, request: RequestDescriptor) -> Result<Value, FetchError> {
    let (delay, response) = {
      let mut state = self.state.lock().unwrap();
      state.calls.push(format!("{} {}", request.method.as_str(), request.path));
      let delay = state.delays.pop_front();
      let response = match state.failures.pop_front() {
        Some(error) => Err(error),
        None => state.handle(&request),
      };
      (delay, response)
    };

    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }
    response
  }
}

impl FakeState {
  fn handle(&mut self, request: &RequestDescriptor) -> Result<Value, FetchError> {
    let route = request
      .path
      .trim_start_matches("/api/")
      .trim_start_matches("documents/")
      .trim_matches('/');
    let segments: Vec<&str> = route.split('/').collect();

    match (request.method, segments.as_slice()) {
      (Method::Post, ["extract-pdf-data"]) => Ok(extracted(&request.body)),
      (Method::Get, [resource]) => Ok(self.list(resource, request, |_| true)),
      (Method::Get, [parent, id, child]) => {
        let parent_id = parse_id(id)?;
        let link = parent.trim_end_matches('s').to_string();
        Ok(self.list(child, request, |row| {
          row[&link].as_u64() == Some(parent_id) || row[&link]["id"].as_u64() == Some(parent_id)
        }))
      }
      (Method::Get, [resource, id]) => self.row(resource, parse_id(id)?).cloned(),
      (Method::Post, [resource]) => {
        let body = body_fields(&request.body);
        let required = if matches!(*resource, "clients" | "contracts") {
          "name"
        } else {
          "number"
        };
        let missing = match &body[required] {
          Value::Null => true,
          Value::String(s) => s.is_empty(),
          _ => false,
        };
        if missing {
          return Err(required_field(required));
        }
        let id = self.next_id;
        self.next_id += 1;
        let mut row = body;
        row["id"] = json!(id);
        self.rows.entry(resource.to_string()).or_default().insert(id, row.clone());
        Ok(row)
      }
      (Method::Patch | Method::Put, [resource, id]) => {
        let id = parse_id(id)?;
        let patch = body_fields(&request.body);
        let row = self
          .rows
          .get_mut(*resource)
          .and_then(|rows| rows.get_mut(&id))
          .ok_or_else(not_found)?;
        if let (Some(row), Value::Object(patch)) = (row.as_object_mut(), patch) {
          row.extend(patch);
        }
        Ok(row.clone())
      }
      (Method::Delete, [resource, id]) => {
        let id = parse_id(id)?;
        self
          .rows
          .get_mut(*resource)
          .and_then(|rows| rows.remove(&id))
          .ok_or_else(not_found)?;
        Ok(Value::Null)
      }
      _ => Err(not_found()),
    }
  }

  fn row(&self, resource: &str, id: u64) -> Result<&Value, FetchError> {
    self.rows.get(resource).and_then(|rows| rows.get(&id)).ok_or_else(not_found)
  }

  /// Clients are paginated; document lists come back as bare arrays.
  fn list(&self, resource: &str, request: &RequestDescriptor, keep: impl Fn(&Value) -> bool) -> Value {
    let param = |name: &str| {
      request
        .query
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.to_lowercase())
    };
    let search = param("search").unwrap_or_default();

    let rows: Vec<Value> = self
      .rows
      .get(resource)
      .into_iter()
      .flat_map(|rows| rows.values())
      .filter(|row| keep(*row))
      .filter(|row| {
        search.is_empty()
          || ["name", "number"]
            .iter()
            .filter_map(|f| row[*f].as_str())
            .any(|s| s.to_lowercase().contains(&search))
      })
      .cloned()
      .collect();

    if resource != "clients" {
      return Value::Array(rows);
    }

    let page: usize = param("page").and_then(|p| p.parse().ok()).unwrap_or(1).max(1);
    let size: usize = param("page_size").and_then(|p| p.parse().ok()).unwrap_or(PAGE_SIZE);
    let count = rows.len();
    let results: Vec<Value> = rows.into_iter().skip((page - 1) * size).take(size).collect();
    let next = (page * size < count).then(|| format!("?page={}", page + 1));
    let previous = (page > 1).then(|| format!("?page={}", page - 1));
    json!({
      "count": count,
      "next": next,
      "previous": previous,
      "results": results,
    })
  }
}

fn body_fields(body: &RequestBody) -> Value {
  match body {
    RequestBody::Json(value) => value.clone(),
    RequestBody::Multipart(parts) => {
      let mut fields = Map::new();
      for part in parts {
        let value = match part {
          FormPart::Text { value, .. } => value
            .parse::<u64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(value.as_str())),
          FormPart::File { file_name, .. } => json!(format!("/media/documents/{}", file_name)),
        };
        fields.insert(part.name().to_string(), value);
      }
      Value::Object(fields)
    }
    RequestBody::Empty => json!({}),
  }
}

fn extracted(body: &RequestBody) -> Value {
  let has_file = matches!(body, RequestBody::Multipart(parts)
    if parts.iter().any(|p| matches!(p, FormPart::File { .. })));
  if !has_file {
    return json!({});
  }
  json!({
    "number": "СЧ-118",
    "date": "2024-05-14",
    "client_name": "Acme",
    "client_id": 1,
    "contract_number": null,
    "contract_id": null,
    "total_amount": 15000.5
  })
}

fn parse_id(raw: &str) -> Result<u64, FetchError> {
  raw.parse().map_err(|_| not_found())
}

fn not_found() -> FetchError {
  FetchError::HttpStatus {
    code: 404,
    body: r#"{"detail":"Not found."}"#.to_string(),
  }
}

fn required_field(field: &str) -> FetchError {
  let mut fields = BTreeMap::new();
  fields.insert(field.to_string(), vec!["This field is required.".to_string()]);
  FetchError::Validation { code: 400, fields }
}
