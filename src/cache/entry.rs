//! Cache entries and their lifecycle state.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use super::error::FetchError;
use super::key::CacheKey;
use super::tags::TagRef;

/// Outcome of one fetch, shared by every awaiter of that fetch.
pub type FetchOutcome = Result<Arc<Value>, FetchError>;

/// A fetch that any number of callers can await.
pub type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
  /// First fetch (or a refetch of rejected data) is running
  Pending,
  Fulfilled,
  Rejected,
  /// Tags were invalidated; last data stays visible until the refetch lands
  Stale,
}

/// The fetch currently running for an entry.
#[derive(Clone)]
pub(crate) struct InFlight {
  pub generation: u64,
  pub result: SharedFetch,
  pub abort: AbortHandle,
}

/// Armed eviction timer for an idle entry.
#[derive(Debug)]
pub(crate) struct Eviction {
  pub token: u64,
  pub abort: Option<AbortHandle>,
}

/// At most one per key.
pub struct CacheEntry {
  pub key: CacheKey,
  pub endpoint: String,
  /// Arguments the entry was created with, reused for refetches
  pub args: Value,
  pub status: EntryStatus,
  pub data: Option<Arc<Value>>,
  pub error: Option<FetchError>,
  pub tags: HashSet<TagRef>,
  pub subscriber_count: usize,
  pub last_active_at: Instant,
  /// Generation of the fetch whose outcome is currently stored
  pub generation: u64,
  pub(crate) in_flight: Option<InFlight>,
  pub(crate) eviction: Option<Eviction>,
}

impl CacheEntry {
  pub fn new(key: CacheKey, endpoint: impl Into<String>, args: Value) -> Self {
    Self {
      key,
      endpoint: endpoint.into(),
      args,
      status: EntryStatus::Pending,
      data: None,
      error: None,
      tags: HashSet::new(),
      subscriber_count: 0,
      last_active_at: Instant::now(),
      generation: 0,
      in_flight: None,
      eviction: None,
    }
  }

  pub fn is_fetching(&self) -> bool {
    self.in_flight.is_some()
  }

  /// Loading means fetching with nothing to show yet.
  pub fn is_loading(&self) -> bool {
    self.is_fetching() && self.data.is_none()
  }

  pub fn snapshot(&self) -> EntrySnapshot {
    EntrySnapshot {
      status: self.status,
      data: self.data.clone(),
      error: self.error.clone(),
      tags: self.tags.clone(),
      subscriber_count: self.subscriber_count,
      generation: self.generation,
      is_fetching: self.is_fetching(),
    }
  }
}

impl std::fmt::Debug for CacheEntry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CacheEntry")
      .field("key", &self.key)
      .field("status", &self.status)
      .field("generation", &self.generation)
      .field("subscriber_count", &self.subscriber_count)
      .field("tags", &self.tags)
      .field("is_fetching", &self.is_fetching())
      .finish_non_exhaustive()
  }
}

/// Point-in-time copy of an entry, safe to hold outside the store lock.
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySnapshot {
  pub status: EntryStatus,
  pub data: Option<Arc<Value>>,
  pub error: Option<FetchError>,
  pub tags: HashSet<TagRef>,
  pub subscriber_count: usize,
  pub generation: u64,
  pub is_fetching: bool,
}

/// Partial update for [`CacheStore::upsert`](super::store::CacheStore::upsert).
#[derive(Debug, Default)]
pub struct EntryPatch {
  pub status: Option<EntryStatus>,
  pub data: Option<Arc<Value>>,
  pub error: Option<Option<FetchError>>,
  pub tags: Option<HashSet<TagRef>>,
  pub generation: Option<u64>,
}

impl EntryPatch {
  pub fn status(mut self, status: EntryStatus) -> Self {
    self.status = Some(status);
    self
  }

  pub fn fulfilled(data: Arc<Value>, tags: HashSet<TagRef>, generation: u64) -> Self {
    Self {
      status: Some(EntryStatus::Fulfilled),
      data: Some(data),
      error: Some(None),
      tags: Some(tags),
      generation: Some(generation),
    }
  }

  pub fn rejected(error: FetchError, generation: u64) -> Self {
    Self {
      status: Some(EntryStatus::Rejected),
      error: Some(Some(error)),
      generation: Some(generation),
      ..Self::default()
    }
  }
}
