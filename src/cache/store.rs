//! In-memory cache store.
//!
//! Owns every [`CacheEntry`] together with the [`TagIndex`] built from their
//! tags. All methods are synchronous; timers and fetches are driven by the
//! executor and subscription manager, which report back through
//! [`commit`](CacheStore::commit) and [`evict_if_idle`](CacheStore::evict_if_idle).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

use super::entry::{CacheEntry, EntryPatch, EntryStatus, Eviction, InFlight};
use super::error::FetchError;
use super::key::CacheKey;
use super::tags::{TagIndex, TagRef};

/// Proof that an entry went idle at a particular moment.
///
/// An eviction only proceeds if the entry still carries the same token,
/// so a re-subscribe in between makes the ticket worthless.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionTicket {
  pub key: CacheKey,
  pub token: u64,
}

/// What happened to a completed fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitResult {
  /// Outcome stored on the entry
  Committed,
  /// A newer generation was already stored; outcome dropped
  Superseded,
  /// The entry no longer exists
  Discarded,
}

#[derive(Default)]
pub struct CacheStore {
  entries: HashMap<CacheKey, CacheEntry>,
  index: TagIndex,
  next_generation: u64,
  next_token: u64,
}

impl CacheStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, key: &CacheKey) -> Option<&CacheEntry> {
    self.entries.get(key)
  }

  /// Get the entry for `key`, creating a pending one if absent.
  ///
  /// A new entry starts at the latest issued generation, so fetches issued
  /// for an earlier entry under the same key can never commit into it.
  pub fn ensure(&mut self, key: &CacheKey, endpoint: &str, args: &Value) -> &mut CacheEntry {
    let floor = self.next_generation;
    self.entries.entry(key.clone()).or_insert_with(|| {
      let mut entry = CacheEntry::new(key.clone(), endpoint, args.clone());
      entry.generation = floor;
      entry
    })
  }

  /// Apply `patch` to an existing entry.
  ///
  /// New tags reach the index before this returns. Returns false if the
  /// entry does not exist.
  pub fn upsert(&mut self, key: &CacheKey, patch: EntryPatch) -> bool {
    let Some(entry) = self.entries.get_mut(key) else {
      return false;
    };

    if let Some(status) = patch.status {
      entry.status = status;
    }
    if let Some(data) = patch.data {
      entry.data = Some(data);
    }
    if let Some(error) = patch.error {
      entry.error = error;
    }
    if let Some(generation) = patch.generation {
      entry.generation = generation;
    }
    if let Some(tags) = patch.tags {
      if tags != entry.tags {
        self.index.set_tags(key, tags.clone());
        entry.tags = tags;
      }
    }
    entry.last_active_at = Instant::now();
    true
  }

  /// Remove an entry and its tag records.
  ///
  /// A fetch still running for the entry is left alone; its outcome will be
  /// discarded on completion.
  pub fn delete(&mut self, key: &CacheKey) -> Option<CacheEntry> {
    let mut entry = self.entries.remove(key)?;
    self.index.clear(key);
    if let Some(abort) = entry.eviction.take().and_then(|e| e.abort) {
      abort.abort();
    }
    debug!(key = %key, "cache entry deleted");
    Some(entry)
  }

  /// Register one more subscriber and cancel any pending eviction.
  pub fn subscribe(&mut self, key: &CacheKey, endpoint: &str, args: &Value) -> usize {
    let entry = self.ensure(key, endpoint, args);
    entry.subscriber_count += 1;
    entry.last_active_at = Instant::now();
    if let Some(abort) = entry.eviction.take().and_then(|e| e.abort) {
      abort.abort();
    }
    entry.subscriber_count
  }

  /// Drop one subscriber.
  ///
  /// Returns a ticket when the count reaches zero; the caller arms a timer
  /// and hands the ticket back to [`evict_if_idle`](Self::evict_if_idle).
  pub fn unsubscribe(&mut self, key: &CacheKey) -> Option<EvictionTicket> {
    let entry = self.entries.get_mut(key)?;
    entry.subscriber_count = entry.subscriber_count.saturating_sub(1);
    entry.last_active_at = Instant::now();
    if entry.subscriber_count > 0 {
      return None;
    }
    self.idle_ticket(key)
  }

  /// Issue an eviction ticket for an unobserved entry that has none armed.
  pub fn idle_ticket(&mut self, key: &CacheKey) -> Option<EvictionTicket> {
    let entry = self.entries.get_mut(key)?;
    if entry.subscriber_count > 0 || entry.eviction.is_some() {
      return None;
    }
    self.next_token += 1;
    let token = self.next_token;
    entry.eviction = Some(Eviction { token, abort: None });
    Some(EvictionTicket {
      key: key.clone(),
      token,
    })
  }

  /// Attach the timer task for `ticket` so it can be cancelled.
  pub fn arm_eviction(&mut self, ticket: &EvictionTicket, abort: AbortHandle) {
    match self.entries.get_mut(&ticket.key) {
      Some(entry) => match entry.eviction.as_mut() {
        Some(eviction) if eviction.token == ticket.token => eviction.abort = Some(abort),
        _ => abort.abort(),
      },
      None => abort.abort(),
    }
  }

  /// Delete the entry if it is still idle under `ticket`.
  pub fn evict_if_idle(&mut self, ticket: &EvictionTicket) -> bool {
    let idle = self.entries.get(&ticket.key).is_some_and(|entry| {
      entry.subscriber_count == 0
        && entry
          .eviction
          .as_ref()
          .is_some_and(|e| e.token == ticket.token)
    });
    if idle {
      if let Some(entry) = self.entries.get_mut(&ticket.key) {
        // The timer task is the one calling us; nothing left to abort
        entry.eviction = None;
      }
      self.delete(&ticket.key);
    }
    idle
  }

  /// Allocate the next fetch generation.
  pub fn issue_generation(&mut self) -> u64 {
    self.next_generation += 1;
    self.next_generation
  }

  /// Record a newly issued fetch on its entry.
  pub(crate) fn begin_fetch(&mut self, key: &CacheKey, in_flight: InFlight) {
    if let Some(entry) = self.entries.get_mut(key) {
      if entry.status != EntryStatus::Stale {
        entry.status = EntryStatus::Pending;
      }
      entry.last_active_at = Instant::now();
      entry.in_flight = Some(in_flight);
    }
  }

  /// Store the outcome of fetch `generation` for `key`.
  ///
  /// Outcomes older than what is already stored are dropped, so a slow
  /// early fetch never overwrites a fast later one.
  pub fn commit(
    &mut self,
    key: &CacheKey,
    generation: u64,
    outcome: Result<(Arc<Value>, HashSet<TagRef>), FetchError>,
  ) -> CommitResult {
    let Some(entry) = self.entries.get_mut(key) else {
      return CommitResult::Discarded;
    };

    let newer_in_flight = match &entry.in_flight {
      Some(f) if f.generation == generation => {
        entry.in_flight = None;
        false
      }
      Some(f) => f.generation > generation,
      None => false,
    };

    if generation <= entry.generation {
      debug!(key = %key, generation, stored = entry.generation, "fetch superseded");
      return CommitResult::Superseded;
    }

    let patch = match outcome {
      Ok((data, tags)) => EntryPatch::fulfilled(data, tags, generation),
      Err(error) => EntryPatch::rejected(error, generation),
    };
    let patch = if newer_in_flight {
      // Keep pending/stale until the latest fetch lands
      EntryPatch {
        status: None,
        ..patch
      }
    } else {
      patch
    };
    self.upsert(key, patch);
    CommitResult::Committed
  }

  /// Every key tagged with any of `tags`.
  pub fn invalidate(&self, tags: &HashSet<TagRef>) -> HashSet<CacheKey> {
    self.index.invalidate(tags)
  }

  /// Flag an entry stale, keeping its data.
  pub fn mark_stale(&mut self, key: &CacheKey) -> bool {
    self.upsert(key, EntryPatch::default().status(EntryStatus::Stale))
  }

  pub fn index(&self) -> &TagIndex {
    &self.index
  }

  pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
    self.entries.keys()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Drop everything, aborting fetches and timers.
  pub fn clear(&mut self) {
    for (_, entry) in self.entries.drain() {
      if let Some(in_flight) = entry.in_flight {
        in_flight.abort.abort();
      }
      if let Some(abort) = entry.eviction.and_then(|e| e.abort) {
        abort.abort();
      }
    }
    self.index.reset();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn clients_key() -> (CacheKey, Value) {
    let args = json!({ "page": 1, "search": "" });
    (CacheKey::new("getClients", &args), args)
  }

  fn ok(data: Value, tags: &[TagRef]) -> Result<(Arc<Value>, HashSet<TagRef>), FetchError> {
    Ok((Arc::new(data), tags.iter().cloned().collect()))
  }

  #[test]
  fn test_commit_publishes_tags() {
    let mut store = CacheStore::new();
    let (key, args) = clients_key();
    store.ensure(&key, "getClients", &args);
    let generation = store.issue_generation();

    let result = store.commit(&key, generation, ok(json!([1]), &[TagRef::list("ClientList")]));

    assert_eq!(result, CommitResult::Committed);
    let entry = store.get(&key).unwrap();
    assert_eq!(entry.status, EntryStatus::Fulfilled);
    assert_eq!(
      store.invalidate(&[TagRef::list("ClientList")].into_iter().collect()),
      [key.clone()].into_iter().collect()
    );
    assert_eq!(store.index().tags_for(&key), Some(&entry.tags));
  }

  #[test]
  fn test_older_generation_never_overwrites_newer() {
    let mut store = CacheStore::new();
    let (key, args) = clients_key();
    store.ensure(&key, "getClients", &args);
    let first = store.issue_generation();
    let second = store.issue_generation();

    store.commit(&key, second, ok(json!("new"), &[]));
    let late = store.commit(&key, first, ok(json!("old"), &[]));

    assert_eq!(late, CommitResult::Superseded);
    let entry = store.get(&key).unwrap();
    assert_eq!(entry.data.as_deref(), Some(&json!("new")));
    assert_eq!(entry.generation, second);
  }

  #[test]
  fn test_rejected_keeps_last_good_data() {
    let mut store = CacheStore::new();
    let (key, args) = clients_key();
    store.ensure(&key, "getClients", &args);
    let g1 = store.issue_generation();
    store.commit(&key, g1, ok(json!([1, 2]), &[TagRef::list("ClientList")]));
    let g2 = store.issue_generation();
    store.commit(&key, g2, Err(FetchError::Network("down".into())));

    let entry = store.get(&key).unwrap();
    assert_eq!(entry.status, EntryStatus::Rejected);
    assert_eq!(entry.data.as_deref(), Some(&json!([1, 2])));
    assert!(entry.error.is_some());
    assert_eq!(entry.tags.len(), 1);
  }

  #[test]
  fn test_commit_to_missing_entry_is_discarded() {
    let mut store = CacheStore::new();
    let (key, _) = clients_key();
    assert_eq!(
      store.commit(&key, 1, ok(json!(null), &[])),
      CommitResult::Discarded
    );
  }

  #[test]
  fn test_fetch_from_deleted_entry_never_lands_in_recreated_one() {
    let mut store = CacheStore::new();
    let (key, args) = clients_key();
    store.ensure(&key, "getClients", &args);
    let old = store.issue_generation();

    store.delete(&key);
    store.ensure(&key, "getClients", &args);

    assert_eq!(store.commit(&key, old, ok(json!("old"), &[])), CommitResult::Superseded);
    let entry = store.get(&key).unwrap();
    assert_eq!(entry.status, EntryStatus::Pending);
    assert!(entry.data.is_none());

    let fresh = store.issue_generation();
    assert_eq!(store.commit(&key, fresh, ok(json!("new"), &[])), CommitResult::Committed);
  }

  #[test]
  fn test_subscribe_counts_and_unsubscribe_tickets() {
    let mut store = CacheStore::new();
    let (key, args) = clients_key();

    assert_eq!(store.subscribe(&key, "getClients", &args), 1);
    assert_eq!(store.subscribe(&key, "getClients", &args), 2);
    assert!(store.unsubscribe(&key).is_none());

    let ticket = store.unsubscribe(&key).expect("idle ticket");
    assert!(store.evict_if_idle(&ticket));
    assert!(store.get(&key).is_none());
  }

  #[test]
  fn test_resubscribe_invalidates_ticket() {
    let mut store = CacheStore::new();
    let (key, args) = clients_key();
    store.subscribe(&key, "getClients", &args);
    let ticket = store.unsubscribe(&key).unwrap();

    store.subscribe(&key, "getClients", &args);
    assert!(!store.evict_if_idle(&ticket));
    assert!(store.get(&key).is_some());

    // A second idle period gets a fresh token
    let next = store.unsubscribe(&key).unwrap();
    assert_ne!(next.token, ticket.token);
    assert!(!store.evict_if_idle(&ticket));
    assert!(store.evict_if_idle(&next));
  }

  #[test]
  fn test_delete_clears_tag_index() {
    let mut store = CacheStore::new();
    let (key, args) = clients_key();
    store.ensure(&key, "getClients", &args);
    let generation = store.issue_generation();
    store.commit(&key, generation, ok(json!([]), &[TagRef::list("ClientList")]));

    assert!(store.delete(&key).is_some());
    assert_eq!(store.index().key_count(), 0);
    assert!(store.is_empty());
  }

  #[test]
  fn test_mark_stale_keeps_data() {
    let mut store = CacheStore::new();
    let (key, args) = clients_key();
    store.ensure(&key, "getClients", &args);
    let generation = store.issue_generation();
    store.commit(&key, generation, ok(json!([7]), &[]));

    assert!(store.mark_stale(&key));
    let entry = store.get(&key).unwrap();
    assert_eq!(entry.status, EntryStatus::Stale);
    assert_eq!(entry.data.as_deref(), Some(&json!([7])));
  }
}
