//! Mutation execution and tag invalidation.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::engine::{CacheEvent, EngineInner};
use super::error::CacheError;
use super::key::CacheKey;
use super::query::refetch_locked;
use super::tags::TagRef;

/// Keys touched by one invalidation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
  /// Subscribed entries marked stale and refetched
  pub refetched: Vec<CacheKey>,
  /// Unsubscribed entries deleted outright
  pub removed: Vec<CacheKey>,
}

impl InvalidationReport {
  pub fn is_empty(&self) -> bool {
    self.refetched.is_empty() && self.removed.is_empty()
  }
}

/// Runs write endpoints and fans their invalidations out over the cache.
#[derive(Clone)]
pub struct MutationCoordinator {
  inner: Arc<EngineInner>,
}

impl MutationCoordinator {
  pub(crate) fn new(inner: Arc<EngineInner>) -> Self {
    Self { inner }
  }

  /// Perform the write request for `endpoint`.
  ///
  /// Identical calls are never merged. On failure the error is returned and
  /// the cache is left exactly as it was.
  pub async fn execute(&self, endpoint: &str, args: Value) -> Result<Arc<Value>, CacheError> {
    self.inner.check_live()?;
    let def = self.inner.registry.mutation(endpoint)?.clone();
    let request = def.request(&args)?;

    debug!(endpoint, method = request.method.as_str(), path = %request.path, "mutation sent");
    let result = match self.inner.transport.send(request).await {
      Ok(value) => Arc::new(value),
      Err(error) => {
        warn!(endpoint, error = %error, "mutation failed, cache untouched");
        return Err(error.into());
      }
    };

    let tags = def.invalidated_tags(&result, &args);
    if !tags.is_empty() && !self.inner.is_disposed() {
      let report = self.invalidate_tags(&tags)?;
      info!(
        endpoint,
        tags = %format_tags(&tags),
        refetched = report.refetched.len(),
        removed = report.removed.len(),
        "mutation invalidated cache"
      );
    }

    Ok(result)
  }

  /// Invalidate `tags` directly, without a mutation.
  ///
  /// Subscribed entries are marked stale and refetched in the background;
  /// their data stays readable meanwhile. Unsubscribed entries are deleted.
  /// The whole fan-out happens under one lock, so every refetch starts
  /// after the tag graph has been fully updated.
  pub fn invalidate_tags(&self, tags: &HashSet<TagRef>) -> Result<InvalidationReport, CacheError> {
    self.inner.check_live()?;
    let mut report = InvalidationReport::default();
    let mut events = Vec::new();

    {
      let mut store = self.inner.lock();
      let mut keys: Vec<CacheKey> = store.invalidate(tags).into_iter().collect();
      keys.sort();

      for key in keys {
        let subscribed = match store.get(&key) {
          Some(entry) => entry.subscriber_count > 0,
          None => continue,
        };

        if subscribed {
          store.mark_stale(&key);
          refetch_locked(&self.inner, &mut store, &key)?;
          events.push(CacheEvent::Invalidated(key.clone()));
          report.refetched.push(key);
        } else {
          store.delete(&key);
          events.push(CacheEvent::Removed(key.clone()));
          report.removed.push(key);
        }
      }
    }

    for event in events {
      self.inner.notify(event);
    }
    Ok(report)
  }
}

fn format_tags(tags: &HashSet<TagRef>) -> String {
  let mut names: Vec<String> = tags.iter().map(ToString::to_string).collect();
  names.sort();
  names.join(",")
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use serde_json::{json, Value};

  use crate::cache::engine::{CacheEngine, CacheOptions};
  use crate::cache::entry::EntryStatus;
  use crate::cache::error::{CacheError, FetchError};
  use crate::cache::tags::TagRef;
  use crate::testing::{client_registry, FakeBackend};

  fn engine(backend: &std::sync::Arc<FakeBackend>) -> CacheEngine {
    CacheEngine::init(client_registry(), backend.clone(), CacheOptions::default()).unwrap()
  }

  #[tokio::test(start_paused = true)]
  async fn test_create_refetches_subscribed_and_drops_unsubscribed() {
    let backend = FakeBackend::with_clients(&["Globex"]);
    let engine = engine(&backend);

    let watched = engine
      .bind_query::<Value>("getClients", json!({ "page": 1, "search": "" }))
      .unwrap();
    watched.settled().await.unwrap();

    // Fetched but never subscribed
    let unwatched_key = engine
      .queries()
      .execute("getClients", json!({ "page": 2, "search": "" }))
      .unwrap()
      .key()
      .clone();
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(engine.contains(&unwatched_key));

    let mut events = engine.events();
    engine
      .mutations()
      .execute("createClient", json!({ "name": "Acme" }))
      .await
      .unwrap();

    let snapshot = engine.snapshot(watched.key()).unwrap();
    assert_eq!(snapshot.status, EntryStatus::Stale);
    assert!(snapshot.is_fetching);
    assert_eq!(snapshot.data.unwrap()["count"], json!(1));
    assert!(!engine.contains(&unwatched_key));
    assert!(events.recv().await.is_ok());

    let fresh = watched.settled().await.unwrap();
    assert_eq!(fresh["count"], json!(2));
    assert_eq!(engine.snapshot(watched.key()).unwrap().status, EntryStatus::Fulfilled);
  }

  #[tokio::test]
  async fn test_failed_mutation_leaves_cache_untouched() {
    let backend = FakeBackend::with_clients(&["Acme"]);
    let engine = engine(&backend);

    let list = engine
      .bind_query::<Value>("getClients", json!({ "page": 1, "search": "" }))
      .unwrap();
    let detail = engine.bind_query::<Value>("getClient", json!({ "id": 1 })).unwrap();
    list.settled().await.unwrap();
    detail.settled().await.unwrap();
    let before = engine.snapshot_all();
    let calls_before = backend.total_calls();

    let err = engine
      .mutations()
      .execute("createClient", json!({ "name": "" }))
      .await
      .unwrap_err();
    assert!(matches!(
      err,
      CacheError::Fetch(FetchError::Validation { code: 400, .. })
    ));

    backend.fail_next(FetchError::HttpStatus {
      code: 500,
      body: "boom".into(),
    });
    assert!(engine
      .mutations()
      .execute("deleteClient", json!({ "id": 1 }))
      .await
      .is_err());

    assert_eq!(engine.snapshot_all(), before);
    // Only the two failed writes hit the backend
    assert_eq!(backend.total_calls(), calls_before + 2);
  }

  #[tokio::test]
  async fn test_identical_mutations_are_not_deduplicated() {
    let backend = FakeBackend::new();
    let engine = engine(&backend);
    let mutations = engine.mutations();

    let (a, b) = tokio::join!(
      mutations.execute("createClient", json!({ "name": "Twin" })),
      mutations.execute("createClient", json!({ "name": "Twin" })),
    );

    assert_ne!(a.unwrap()["id"], b.unwrap()["id"]);
    assert_eq!(backend.calls("POST", "/api/clients/"), 2);
  }

  #[tokio::test]
  async fn test_manual_invalidation_with_no_matches() {
    let backend = FakeBackend::new();
    let engine = engine(&backend);
    let report = engine
      .mutations()
      .invalidate_tags(&[TagRef::list("ClientList")].into_iter().collect())
      .unwrap();
    assert!(report.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidation_supersedes_fetch_already_in_flight() {
    let backend = FakeBackend::with_clients(&["Globex"]);
    let engine = engine(&backend);
    let args = json!({ "page": 1, "search": "" });

    let list = engine.bind_query::<Value>("getClients", args.clone()).unwrap();
    list.settled().await.unwrap();

    // A slow manual refetch issued before the write sees pre-write data
    backend.delay_next(Duration::from_secs(3));
    list.refetch().unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;

    engine
      .mutations()
      .execute("createClient", json!({ "name": "Acme" }))
      .await
      .unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    let snapshot = engine.snapshot(list.key()).unwrap();
    assert_eq!(snapshot.data.unwrap()["count"], json!(2));
    assert_eq!(snapshot.status, EntryStatus::Fulfilled);
  }

  #[tokio::test(start_paused = true)]
  async fn test_deleted_record_not_revived_by_earlier_fetch() {
    let backend = FakeBackend::with_clients(&["Acme"]);
    let engine = engine(&backend);
    let args = json!({ "id": 1 });

    let key = {
      let detail = engine.bind_query::<Value>("getClient", args.clone()).unwrap();
      detail.settled().await.unwrap();
      detail.key().clone()
    };

    // Issued before the delete, answers with the old row after it
    backend.delay_next(Duration::from_millis(100));
    let slow = engine.queries().refetch(&key).unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;

    engine
      .mutations()
      .execute("deleteClient", args.clone())
      .await
      .unwrap();
    assert!(!engine.contains(&key));

    backend.delay_next(Duration::from_millis(200));
    let reopened = engine.bind_query::<Value>("getClient", args).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(slow.result().await.unwrap()["name"], json!("Acme"));
    assert!(reopened.data().is_none());
    assert!(reopened.is_loading());

    let err = reopened.settled().await.unwrap_err();
    assert!(matches!(err, FetchError::HttpStatus { code: 404, .. }));
    let snapshot = engine.snapshot(&key).unwrap();
    assert_eq!(snapshot.status, EntryStatus::Rejected);
    assert!(snapshot.data.is_none());
  }
}
