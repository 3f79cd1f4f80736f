//! Typed access to the CRM through the cache engine.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use super::endpoints::{registry, DocumentKind};
use super::types::{
  Attachment, Client, ClientInput, Contract, ExtractedDocument, Invoice, ListParams, Page,
  Specification, Upd,
};
use crate::cache::{CacheEngine, CacheError, CacheOptions, FetchError, QueryBinding, Transport};

/// CRM client whose reads are cached and whose writes keep them fresh.
#[derive(Clone, Debug)]
pub struct CrmApi {
  engine: CacheEngine,
}

impl CrmApi {
  /// Start a cache engine with the CRM endpoint table over `transport`.
  pub fn init(transport: Arc<dyn Transport>, options: CacheOptions) -> Result<Self, CacheError> {
    Ok(Self::new(CacheEngine::init(registry()?, transport, options)?))
  }

  pub fn new(engine: CacheEngine) -> Self {
    Self { engine }
  }

  pub fn engine(&self) -> &CacheEngine {
    &self.engine
  }

  pub fn dispose(&self) {
    self.engine.dispose();
  }

  // Clients

  pub fn clients(&self, params: &ListParams) -> Result<QueryBinding<Page<Client>>, CacheError> {
    self.engine.bind_query("getClients", to_args(params)?)
  }

  pub fn client(&self, id: u64) -> Result<QueryBinding<Client>, CacheError> {
    self.engine.bind_query("getClient", json!({ "id": id }))
  }

  pub async fn create_client(&self, input: &ClientInput) -> Result<Client, CacheError> {
    self.mutate("createClient", to_args(input)?).await
  }

  pub async fn update_client(&self, id: u64, input: &ClientInput) -> Result<Client, CacheError> {
    self
      .mutate("updateClient", json!({ "id": id, "fields": to_args(input)? }))
      .await
  }

  pub async fn delete_client(&self, id: u64) -> Result<(), CacheError> {
    self.mutate("deleteClient", json!({ "id": id })).await
  }

  // Documents

  pub fn contracts(&self, params: &ListParams) -> Result<QueryBinding<Page<Contract>>, CacheError> {
    self.documents(DocumentKind::Contract, params)
  }

  pub fn contract(&self, id: u64) -> Result<QueryBinding<Contract>, CacheError> {
    self.document(DocumentKind::Contract, id)
  }

  pub fn contract_specifications(
    &self,
    contract_id: u64,
  ) -> Result<QueryBinding<Page<Specification>>, CacheError> {
    self.engine.bind_query(
      "getContractSpecifications",
      json!({ "contract_id": contract_id }),
    )
  }

  pub fn specifications(
    &self,
    params: &ListParams,
  ) -> Result<QueryBinding<Page<Specification>>, CacheError> {
    self.documents(DocumentKind::Specification, params)
  }

  pub fn specification(&self, id: u64) -> Result<QueryBinding<Specification>, CacheError> {
    self.document(DocumentKind::Specification, id)
  }

  pub fn specification_invoices(
    &self,
    specification_id: u64,
  ) -> Result<QueryBinding<Page<Invoice>>, CacheError> {
    self.engine.bind_query(
      "getSpecificationInvoices",
      json!({ "specification_id": specification_id }),
    )
  }

  pub fn invoices(&self, params: &ListParams) -> Result<QueryBinding<Page<Invoice>>, CacheError> {
    self.documents(DocumentKind::Invoice, params)
  }

  pub fn invoice(&self, id: u64) -> Result<QueryBinding<Invoice>, CacheError> {
    self.document(DocumentKind::Invoice, id)
  }

  pub fn upds(&self, params: &ListParams) -> Result<QueryBinding<Page<Upd>>, CacheError> {
    self.documents(DocumentKind::Upd, params)
  }

  pub fn upd(&self, id: u64) -> Result<QueryBinding<Upd>, CacheError> {
    self.document(DocumentKind::Upd, id)
  }

  /// List any document family, decoded as `T`.
  pub fn documents<T: DeserializeOwned>(
    &self,
    kind: DocumentKind,
    params: &ListParams,
  ) -> Result<QueryBinding<Page<T>>, CacheError> {
    self.engine.bind_query(&kind.list_endpoint(), to_args(params)?)
  }

  pub fn document<T: DeserializeOwned>(
    &self,
    kind: DocumentKind,
    id: u64,
  ) -> Result<QueryBinding<T>, CacheError> {
    self.engine.bind_query(&kind.get_endpoint(), json!({ "id": id }))
  }

  /// Create a document from form `fields`, optionally uploading a file.
  pub async fn create_document<T: DeserializeOwned>(
    &self,
    kind: DocumentKind,
    fields: &impl Serialize,
    file: Option<&Attachment>,
  ) -> Result<T, CacheError> {
    let args = document_args(None, fields, file)?;
    self.mutate(&kind.create_endpoint(), args).await
  }

  /// Patch a document. Only the given fields change.
  pub async fn update_document<T: DeserializeOwned>(
    &self,
    kind: DocumentKind,
    id: u64,
    fields: &impl Serialize,
    file: Option<&Attachment>,
  ) -> Result<T, CacheError> {
    let args = document_args(Some(id), fields, file)?;
    self.mutate(&kind.update_endpoint(), args).await
  }

  pub async fn delete_document(&self, kind: DocumentKind, id: u64) -> Result<(), CacheError> {
    self.mutate(&kind.delete_endpoint(), json!({ "id": id })).await
  }

  /// Ask the backend to read structured fields out of a PDF.
  pub async fn extract_pdf(&self, file: &Attachment) -> Result<ExtractedDocument, CacheError> {
    self
      .mutate("extractPdfData", json!({ "file": file_arg(file) }))
      .await
  }

  async fn mutate<T: DeserializeOwned>(&self, endpoint: &str, args: Value) -> Result<T, CacheError> {
    self.engine.bind_mutation::<T>(endpoint)?.trigger(args).await
  }
}

fn to_args(value: &impl Serialize) -> Result<Value, CacheError> {
  serde_json::to_value(value).map_err(|e| FetchError::InvalidArgs(e.to_string()).into())
}

fn document_args(
  id: Option<u64>,
  fields: &impl Serialize,
  file: Option<&Attachment>,
) -> Result<Value, CacheError> {
  let mut args = json!({ "fields": to_args(fields)? });
  if let Some(id) = id {
    args["id"] = json!(id);
  }
  if let Some(file) = file {
    args["file"] = file_arg(file);
  }
  Ok(args)
}

fn file_arg(file: &Attachment) -> Value {
  json!({
    "file_name": file.file_name,
    "mime": file.mime,
    "content": hex::encode(&file.bytes),
  })
}
