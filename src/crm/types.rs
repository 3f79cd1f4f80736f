//! CRM domain types as returned by the REST API.
//!
//! Fields the backend may omit default to empty values; amounts stay as the
//! decimal strings the backend sends.

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

// ============================================================================
// Pagination
// ============================================================================

/// One page of a list endpoint.
///
/// Accepts both the paginated envelope `{count, next, previous, results}`
/// and a bare JSON array (endpoints without pagination).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
  pub count: u64,
  pub next: Option<String>,
  pub previous: Option<String>,
  pub results: Vec<T>,
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Page<T> {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr<T> {
      Paged {
        count: u64,
        #[serde(default)]
        next: Option<String>,
        #[serde(default)]
        previous: Option<String>,
        results: Vec<T>,
      },
      Plain(Vec<T>),
    }

    Ok(match Repr::deserialize(deserializer)? {
      Repr::Paged {
        count,
        next,
        previous,
        results,
      } => Page {
        count,
        next,
        previous,
        results,
      },
      Repr::Plain(results) => Page {
        count: results.len() as u64,
        next: None,
        previous: None,
        results,
      },
    })
  }
}

impl<T> Page<T> {
  pub fn has_next(&self) -> bool {
    self.next.is_some()
  }
}

/// Arguments shared by every list endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListParams {
  #[serde(default = "first_page")]
  pub page: u32,
  #[serde(default)]
  pub search: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub page_size: Option<u32>,
}

fn first_page() -> u32 {
  1
}

impl Default for ListParams {
  fn default() -> Self {
    Self::new(first_page(), "")
  }
}

impl ListParams {
  pub fn new(page: u32, search: impl Into<String>) -> Self {
    Self {
      page,
      search: search.into(),
      page_size: None,
    }
  }
}

// ============================================================================
// Clients
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedRef {
  pub id: u64,
  pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
  pub id: u64,
  pub name: String,
  #[serde(default)]
  pub client_type: Option<String>,
  #[serde(default)]
  pub email: Option<String>,
  #[serde(default)]
  pub phone: Option<String>,
  #[serde(default)]
  pub company: Option<String>,
  #[serde(default)]
  pub inn: Option<String>,
  #[serde(default)]
  pub kpp: Option<String>,
  #[serde(default)]
  pub legal_address: Option<String>,
  #[serde(default)]
  pub contact_person: Option<String>,
  #[serde(default)]
  pub group: Option<NamedRef>,
  #[serde(default)]
  pub tags: Vec<NamedRef>,
  #[serde(default)]
  pub created_at: Option<String>,
}

/// Body for creating or updating a client. Unset fields are not sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientInput {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub client_type: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub email: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub phone: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub company: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub inn: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub group_id: Option<u64>,
  #[serde(skip_serializing_if = "Vec::is_empty", default)]
  pub tag_ids: Vec<u64>,
}

// ============================================================================
// Documents
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
  pub id: u64,
  #[serde(default)]
  pub number: String,
  pub name: String,
  pub date: Option<NaiveDate>,
  pub client: u64,
  /// Copied from the client; refreshed only when contract tags are invalidated
  #[serde(default)]
  pub client_name: Option<String>,
  #[serde(default)]
  pub status: Option<String>,
  #[serde(default)]
  pub igk_number: Option<String>,
  #[serde(default)]
  pub file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Specification {
  pub id: u64,
  pub number: i64,
  pub date: Option<NaiveDate>,
  pub client: u64,
  #[serde(default)]
  pub client_name: Option<String>,
  pub contract: u64,
  #[serde(default)]
  pub contract_number: Option<String>,
  #[serde(default)]
  pub igk_number: Option<String>,
  #[serde(default)]
  pub goods_services: Option<String>,
  #[serde(default)]
  pub total_amount: Option<String>,
  #[serde(default)]
  pub file: Option<String>,
}

/// Summary of a related document embedded in invoices and UPDs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRef {
  pub id: u64,
  #[serde(default)]
  pub number: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
  pub id: u64,
  pub number: String,
  pub date: Option<NaiveDate>,
  #[serde(default)]
  pub client: Option<NamedRef>,
  #[serde(default)]
  pub contract: Option<DocumentRef>,
  #[serde(default)]
  pub specification: Option<DocumentRef>,
  #[serde(default)]
  pub status: Option<String>,
  #[serde(default)]
  pub payment_due_date: Option<NaiveDate>,
  #[serde(default)]
  pub total_amount: Option<String>,
  #[serde(default)]
  pub comment: Option<String>,
  #[serde(default)]
  pub file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upd {
  pub id: u64,
  pub number: String,
  pub date: Option<NaiveDate>,
  #[serde(default)]
  pub client: Option<NamedRef>,
  #[serde(default)]
  pub contract: Option<DocumentRef>,
  #[serde(default)]
  pub specification: Option<DocumentRef>,
  #[serde(default)]
  pub invoice: Option<DocumentRef>,
  #[serde(default)]
  pub status: Option<String>,
  #[serde(default)]
  pub signing_status: Option<String>,
  #[serde(default)]
  pub total_amount: Option<String>,
  #[serde(default)]
  pub file: Option<String>,
}

/// A file attached to a document create/update.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
  pub file_name: String,
  pub mime: String,
  pub bytes: Vec<u8>,
}

impl Attachment {
  pub fn pdf(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
    Self {
      file_name: file_name.into(),
      mime: "application/pdf".to_string(),
      bytes,
    }
  }
}

/// Fields the backend managed to pull out of an uploaded PDF.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedDocument {
  #[serde(default)]
  pub number: Option<String>,
  #[serde(default)]
  pub date: Option<NaiveDate>,
  #[serde(default)]
  pub client_name: Option<String>,
  #[serde(default)]
  pub client_id: Option<u64>,
  #[serde(default)]
  pub contract_number: Option<String>,
  #[serde(default)]
  pub contract_id: Option<u64>,
  #[serde(default)]
  pub total_amount: Option<f64>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_page_from_paginated_envelope() {
    let page: Page<NamedRef> = serde_json::from_value(json!({
      "count": 41,
      "next": "http://crm/api/clients/?page=2",
      "previous": null,
      "results": [{ "id": 1, "name": "Acme" }]
    }))
    .unwrap();
    assert_eq!(page.count, 41);
    assert!(page.has_next());
    assert_eq!(page.results.len(), 1);
  }

  #[test]
  fn test_page_from_bare_array() {
    let page: Page<NamedRef> =
      serde_json::from_value(json!([{ "id": 1, "name": "a" }, { "id": 2, "name": "b" }])).unwrap();
    assert_eq!(page.count, 2);
    assert!(!page.has_next());
  }

  #[test]
  fn test_contract_parses_backend_shape() {
    let contract: Contract = serde_json::from_value(json!({
      "id": 3,
      "number": "Д-2024/17",
      "name": "Supply agreement",
      "date": "2024-03-01",
      "client": 42,
      "client_name": "Acme",
      "status": "Подписан",
      "igk_number": "",
      "file": null,
      "change_history": null
    }))
    .unwrap();
    assert_eq!(contract.date, NaiveDate::from_ymd_opt(2024, 3, 1));
    assert_eq!(contract.client_name.as_deref(), Some("Acme"));
  }

  #[test]
  fn test_client_input_skips_unset_fields() {
    let input = ClientInput {
      name: Some("Acme".into()),
      ..Default::default()
    };
    assert_eq!(serde_json::to_value(&input).unwrap(), json!({ "name": "Acme" }));
  }
}
