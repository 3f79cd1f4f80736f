//! Endpoint definitions and the registry that validates them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use super::error::{CacheError, FetchError};
use super::request::RequestDescriptor;
use super::tags::TagRef;

/// Builds the request for an endpoint from its arguments.
pub type RequestFn = Arc<dyn Fn(&Value) -> Result<RequestDescriptor, FetchError> + Send + Sync>;

/// Computes tags from `(result, args)`.
pub type TagFn = Arc<dyn Fn(&Value, &Value) -> Vec<TagRef> + Send + Sync>;

/// A read endpoint whose results are cached under the tags it provides.
#[derive(Clone)]
pub struct QueryDefinition {
  pub name: String,
  tag_types: Vec<String>,
  request: RequestFn,
  provides: TagFn,
}

impl QueryDefinition {
  pub fn new<F>(name: impl Into<String>, request: F) -> Self
  where
    F: Fn(&Value) -> Result<RequestDescriptor, FetchError> + Send + Sync + 'static,
  {
    Self {
      name: name.into(),
      tag_types: Vec::new(),
      request: Arc::new(request),
      provides: Arc::new(|_, _| Vec::new()),
    }
  }

  /// Set the tag provider. `tag_types` lists every tag type it may emit.
  pub fn provides<F>(mut self, tag_types: &[&str], provides: F) -> Self
  where
    F: Fn(&Value, &Value) -> Vec<TagRef> + Send + Sync + 'static,
  {
    self.tag_types = tag_types.iter().map(|t| t.to_string()).collect();
    self.provides = Arc::new(provides);
    self
  }

  pub fn request(&self, args: &Value) -> Result<RequestDescriptor, FetchError> {
    (self.request)(args)
  }

  /// Tags for a fulfilled result, with undeclared types dropped.
  pub fn tags_for(&self, result: &Value, args: &Value) -> HashSet<TagRef> {
    filter_declared(&self.name, &self.tag_types, (self.provides)(result, args))
  }
}

/// A write endpoint that invalidates tags on success.
#[derive(Clone)]
pub struct MutationDefinition {
  pub name: String,
  tag_types: Vec<String>,
  request: RequestFn,
  invalidates: TagFn,
}

impl MutationDefinition {
  pub fn new<F>(name: impl Into<String>, request: F) -> Self
  where
    F: Fn(&Value) -> Result<RequestDescriptor, FetchError> + Send + Sync + 'static,
  {
    Self {
      name: name.into(),
      tag_types: Vec::new(),
      request: Arc::new(request),
      invalidates: Arc::new(|_, _| Vec::new()),
    }
  }

  /// Set the tag invalidator. `tag_types` lists every tag type it may emit.
  pub fn invalidates<F>(mut self, tag_types: &[&str], invalidates: F) -> Self
  where
    F: Fn(&Value, &Value) -> Vec<TagRef> + Send + Sync + 'static,
  {
    self.tag_types = tag_types.iter().map(|t| t.to_string()).collect();
    self.invalidates = Arc::new(invalidates);
    self
  }

  pub fn request(&self, args: &Value) -> Result<RequestDescriptor, FetchError> {
    (self.request)(args)
  }

  pub fn invalidated_tags(&self, result: &Value, args: &Value) -> HashSet<TagRef> {
    filter_declared(&self.name, &self.tag_types, (self.invalidates)(result, args))
  }
}

fn filter_declared(endpoint: &str, declared: &[String], tags: Vec<TagRef>) -> HashSet<TagRef> {
  tags
    .into_iter()
    .filter(|tag| {
      let ok = declared.iter().any(|t| *t == tag.tag_type);
      if !ok {
        warn!(endpoint, tag = %tag, "dropping tag of undeclared type");
      }
      ok
    })
    .collect()
}

/// Either kind of endpoint.
#[derive(Clone)]
pub enum EndpointDefinition {
  Query(QueryDefinition),
  Mutation(MutationDefinition),
}

impl EndpointDefinition {
  pub fn name(&self) -> &str {
    match self {
      EndpointDefinition::Query(q) => &q.name,
      EndpointDefinition::Mutation(m) => &m.name,
    }
  }

  fn tag_types(&self) -> &[String] {
    match self {
      EndpointDefinition::Query(q) => &q.tag_types,
      EndpointDefinition::Mutation(m) => &m.tag_types,
    }
  }
}

impl From<QueryDefinition> for EndpointDefinition {
  fn from(def: QueryDefinition) -> Self {
    EndpointDefinition::Query(def)
  }
}

impl From<MutationDefinition> for EndpointDefinition {
  fn from(def: MutationDefinition) -> Self {
    EndpointDefinition::Mutation(def)
  }
}

/// All endpoints of one API, plus the tag types they may reference.
pub struct EndpointRegistry {
  tag_types: HashSet<String>,
  endpoints: HashMap<String, EndpointDefinition>,
}

impl EndpointRegistry {
  pub fn new<I, S>(tag_types: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      tag_types: tag_types.into_iter().map(Into::into).collect(),
      endpoints: HashMap::new(),
    }
  }

  /// Add an endpoint.
  ///
  /// Fails if the name is taken or the endpoint declares a tag type the API
  /// does not know about.
  pub fn register(&mut self, def: impl Into<EndpointDefinition>) -> Result<(), CacheError> {
    let def = def.into();
    let name = def.name().to_string();

    if self.endpoints.contains_key(&name) {
      return Err(CacheError::DuplicateEndpoint(name));
    }
    if let Some(unknown) = def.tag_types().iter().find(|t| !self.tag_types.contains(*t)) {
      return Err(CacheError::UndeclaredTagType {
        endpoint: name,
        tag_type: unknown.clone(),
      });
    }

    self.endpoints.insert(name, def);
    Ok(())
  }

  /// Chainable form of [`register`](Self::register).
  pub fn with(mut self, def: impl Into<EndpointDefinition>) -> Result<Self, CacheError> {
    self.register(def)?;
    Ok(self)
  }

  pub fn query(&self, name: &str) -> Result<&QueryDefinition, CacheError> {
    match self.endpoints.get(name) {
      Some(EndpointDefinition::Query(q)) => Ok(q),
      Some(EndpointDefinition::Mutation(_)) => Err(CacheError::WrongEndpointKind {
        name: name.to_string(),
        expected: "query",
      }),
      None => Err(CacheError::UnknownEndpoint(name.to_string())),
    }
  }

  pub fn mutation(&self, name: &str) -> Result<&MutationDefinition, CacheError> {
    match self.endpoints.get(name) {
      Some(EndpointDefinition::Mutation(m)) => Ok(m),
      Some(EndpointDefinition::Query(_)) => Err(CacheError::WrongEndpointKind {
        name: name.to_string(),
        expected: "mutation",
      }),
      None => Err(CacheError::UnknownEndpoint(name.to_string())),
    }
  }

  pub fn len(&self) -> usize {
    self.endpoints.len()
  }

  pub fn is_empty(&self) -> bool {
    self.endpoints.is_empty()
  }
}
