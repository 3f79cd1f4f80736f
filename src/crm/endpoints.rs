//! Endpoint table for the CRM REST API.
//!
//! Lists and items use separate tag namespaces: a list query provides
//! `<Type>List:LIST`, an item query provides `<Type>:<id>`. Creates only
//! invalidate the list tag; updates and deletes invalidate both.

use serde_json::Value;

use crate::cache::{
  CacheError, EndpointRegistry, FetchError, FormPart, Method, MutationDefinition, QueryDefinition,
  RequestDescriptor, TagRef,
};

const CLIENTS: &str = "/api/clients/";
const DOCUMENTS: &str = "/api/documents/";

/// The four document families served under `/api/documents/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
  Contract,
  Specification,
  Invoice,
  Upd,
}

impl DocumentKind {
  pub const ALL: [DocumentKind; 4] = [
    DocumentKind::Contract,
    DocumentKind::Specification,
    DocumentKind::Invoice,
    DocumentKind::Upd,
  ];

  /// Tag type for single documents, also the endpoint name stem.
  pub fn tag_type(self) -> &'static str {
    match self {
      DocumentKind::Contract => "Contract",
      DocumentKind::Specification => "Specification",
      DocumentKind::Invoice => "Invoice",
      DocumentKind::Upd => "Upd",
    }
  }

  pub fn list_tag_type(self) -> &'static str {
    match self {
      DocumentKind::Contract => "ContractList",
      DocumentKind::Specification => "SpecificationList",
      DocumentKind::Invoice => "InvoiceList",
      DocumentKind::Upd => "UpdList",
    }
  }

  fn segment(self) -> &'static str {
    match self {
      DocumentKind::Contract => "contracts",
      DocumentKind::Specification => "specifications",
      DocumentKind::Invoice => "invoices",
      DocumentKind::Upd => "upds",
    }
  }

  fn collection(self) -> String {
    format!("{}{}/", DOCUMENTS, self.segment())
  }

  fn item(self, id: u64) -> String {
    format!("{}{}/{}/", DOCUMENTS, self.segment(), id)
  }

  pub fn list_endpoint(self) -> String {
    format!("get{}s", self.tag_type())
  }

  pub fn get_endpoint(self) -> String {
    format!("get{}", self.tag_type())
  }

  pub fn create_endpoint(self) -> String {
    format!("create{}", self.tag_type())
  }

  pub fn update_endpoint(self) -> String {
    format!("update{}", self.tag_type())
  }

  pub fn delete_endpoint(self) -> String {
    format!("delete{}", self.tag_type())
  }
}

/// Every tag type the CRM API uses.
pub fn tag_types() -> Vec<&'static str> {
  let mut types = vec!["Client", "ClientList"];
  for kind in DocumentKind::ALL {
    types.push(kind.tag_type());
    types.push(kind.list_tag_type());
  }
  types
}

/// Build the registry with every CRM endpoint.
pub fn registry() -> Result<EndpointRegistry, CacheError> {
  let mut registry = EndpointRegistry::new(tag_types());
  register_clients(&mut registry)?;
  for kind in DocumentKind::ALL {
    register_documents(&mut registry, kind)?;
  }
  register_nested(&mut registry)?;

  registry.register(
    MutationDefinition::new("extractPdfData", |args| {
      Ok(
        RequestDescriptor::new(Method::Post, format!("{}extract-pdf-data/", DOCUMENTS))
          .multipart(vec![file_part(args)?]),
      )
    })
    .invalidates(&[], |_, _| Vec::new()),
  )?;

  Ok(registry)
}

fn register_clients(registry: &mut EndpointRegistry) -> Result<(), CacheError> {
  registry.register(
    QueryDefinition::new("getClients", |args| Ok(list_request(CLIENTS, args)))
      .provides(&["ClientList", "Client"], |result, _| {
        let mut tags = vec![TagRef::list("ClientList")];
        tags.extend(rows(result).filter_map(|row| row["id"].as_u64()).map(|id| TagRef::id("Client", id)));
        tags
      }),
  )?;

  registry.register(
    QueryDefinition::new("getClient", |args| {
      Ok(RequestDescriptor::get(format!("{}{}/", CLIENTS, id_arg(args, "id")?)))
    })
    .provides(&["Client"], |_, args| item_tag("Client", args)),
  )?;

  registry.register(
    MutationDefinition::new("createClient", |args| {
      Ok(RequestDescriptor::new(Method::Post, CLIENTS).json(args.clone()))
    })
    .invalidates(&["ClientList"], |_, _| vec![TagRef::list("ClientList")]),
  )?;

  registry.register(
    MutationDefinition::new("updateClient", |args| {
      let id = id_arg(args, "id")?;
      Ok(RequestDescriptor::new(Method::Patch, format!("{}{}/", CLIENTS, id)).json(args["fields"].clone()))
    })
    .invalidates(&["ClientList", "Client"], |_, args| list_and_item("Client", args)),
  )?;

  registry.register(
    MutationDefinition::new("deleteClient", |args| {
      Ok(RequestDescriptor::new(Method::Delete, format!("{}{}/", CLIENTS, id_arg(args, "id")?)))
    })
    .invalidates(&["ClientList", "Client"], |_, args| list_and_item("Client", args)),
  )?;

  Ok(())
}

fn register_documents(registry: &mut EndpointRegistry, kind: DocumentKind) -> Result<(), CacheError> {
  let (item, list) = (kind.tag_type(), kind.list_tag_type());

  registry.register(
    QueryDefinition::new(kind.list_endpoint(), move |args| Ok(list_request(&kind.collection(), args)))
      .provides(&[list], move |_, _| vec![TagRef::list(list)]),
  )?;

  registry.register(
    QueryDefinition::new(kind.get_endpoint(), move |args| {
      Ok(RequestDescriptor::get(kind.item(id_arg(args, "id")?)))
    })
    .provides(&[item], move |_, args| item_tag(item, args)),
  )?;

  registry.register(
    MutationDefinition::new(kind.create_endpoint(), move |args| {
      Ok(RequestDescriptor::new(Method::Post, kind.collection()).multipart(document_parts(args)?))
    })
    .invalidates(&[list], move |_, _| vec![TagRef::list(list)]),
  )?;

  registry.register(
    MutationDefinition::new(kind.update_endpoint(), move |args| {
      let id = id_arg(args, "id")?;
      Ok(RequestDescriptor::new(Method::Patch, kind.item(id)).multipart(document_parts(args)?))
    })
    .invalidates(&[list, item], move |_, args| list_and_item(item, args)),
  )?;

  registry.register(
    MutationDefinition::new(kind.delete_endpoint(), move |args| {
      Ok(RequestDescriptor::new(Method::Delete, kind.item(id_arg(args, "id")?)))
    })
    .invalidates(&[list, item], move |_, args| list_and_item(item, args)),
  )?;

  Ok(())
}

/// Lists scoped to a parent document.
fn register_nested(registry: &mut EndpointRegistry) -> Result<(), CacheError> {
  registry.register(
    QueryDefinition::new("getContractSpecifications", |args| {
      let path = format!(
        "{}{}/specifications/",
        DocumentKind::Contract.collection(),
        id_arg(args, "contract_id")?
      );
      Ok(RequestDescriptor::get(path))
    })
    .provides(&["SpecificationList"], |_, _| vec![TagRef::list("SpecificationList")]),
  )?;

  registry.register(
    QueryDefinition::new("getSpecificationInvoices", |args| {
      let path = format!(
        "{}{}/invoices/",
        DocumentKind::Specification.collection(),
        id_arg(args, "specification_id")?
      );
      Ok(RequestDescriptor::get(path))
    })
    .provides(&["InvoiceList"], |_, _| vec![TagRef::list("InvoiceList")]),
  )?;

  Ok(())
}

fn list_request(path: &str, args: &Value) -> RequestDescriptor {
  RequestDescriptor::get(path)
    .param("page", scalar(&args["page"]))
    .param("page_size", scalar(&args["page_size"]))
    .param("search", scalar(&args["search"]))
}

/// Rows of a list response, paginated or bare.
fn rows(result: &Value) -> impl Iterator<Item = &Value> {
  let rows = match result {
    Value::Array(items) => items.as_slice(),
    other => other["results"].as_array().map(Vec::as_slice).unwrap_or_default(),
  };
  rows.iter()
}

fn item_tag(tag_type: &str, args: &Value) -> Vec<TagRef> {
  args["id"]
    .as_u64()
    .map(|id| vec![TagRef::id(tag_type, id)])
    .unwrap_or_default()
}

fn list_and_item(tag_type: &str, args: &Value) -> Vec<TagRef> {
  let mut tags = vec![TagRef::list(format!("{}List", tag_type))];
  tags.extend(item_tag(tag_type, args));
  tags
}

fn id_arg(args: &Value, name: &str) -> Result<u64, FetchError> {
  args[name]
    .as_u64()
    .ok_or_else(|| FetchError::InvalidArgs(format!("missing numeric '{}'", name)))
}

/// Query/form value of a JSON scalar. Null becomes empty and is skipped.
fn scalar(value: &Value) -> String {
  match value {
    Value::Null => String::new(),
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

/// `fields` as text parts, plus the optional `file` attachment.
fn document_parts(args: &Value) -> Result<Vec<FormPart>, FetchError> {
  let mut parts: Vec<FormPart> = args["fields"]
    .as_object()
    .into_iter()
    .flatten()
    .filter(|(_, value)| !value.is_null())
    .map(|(name, value)| FormPart::Text {
      name: name.clone(),
      value: scalar(value),
    })
    .collect();

  if !args["file"].is_null() {
    parts.push(file_part(args)?);
  }
  Ok(parts)
}

/// The `file` argument: `{file_name, mime, content}` with hex-encoded content.
fn file_part(args: &Value) -> Result<FormPart, FetchError> {
  let file = &args["file"];
  let file_name = file["file_name"]
    .as_str()
    .ok_or_else(|| FetchError::InvalidArgs("file is missing 'file_name'".into()))?;
  let bytes = file["content"]
    .as_str()
    .ok_or_else(|| FetchError::InvalidArgs("file is missing 'content'".into()))
    .and_then(|content| hex::decode(content).map_err(|e| FetchError::InvalidArgs(e.to_string())))?;

  Ok(FormPart::File {
    name: "file".to_string(),
    file_name: file_name.to_string(),
    mime: file["mime"].as_str().unwrap_or("application/octet-stream").to_string(),
    bytes,
  })
}
