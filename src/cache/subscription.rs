//! Subscription tracking and deferred garbage collection.
//!
//! Each live binding holds a [`Subscription`]. When the last one for a key
//! goes away the entry is scheduled for eviction after the grace period;
//! subscribing again before then cancels the eviction.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use serde_json::Value;
use tracing::debug;

use super::engine::{CacheEvent, EngineInner};
use super::error::CacheError;
use super::key::CacheKey;
use super::store::{CacheStore, EvictionTicket};

/// Tracks which bindings observe which cache keys.
#[derive(Clone)]
pub struct SubscriptionManager {
  inner: Arc<EngineInner>,
}

impl SubscriptionManager {
  pub(crate) fn new(inner: Arc<EngineInner>) -> Self {
    Self { inner }
  }

  /// Start observing the result of `endpoint` with `args`.
  ///
  /// Does not fetch; pair with [`QueryExecutor::execute`](super::query::QueryExecutor::execute).
  pub fn subscribe(&self, endpoint: &str, args: &Value) -> Result<Subscription, CacheError> {
    self.inner.check_live()?;
    self.inner.registry.query(endpoint)?;
    let key = CacheKey::new(endpoint, args);

    let count = self.inner.lock().subscribe(&key, endpoint, args);
    let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed) + 1;
    self.inner.lock_subscriptions().insert(id, key.clone());
    debug!(key = %key, subscribers = count, "subscribed");

    Ok(Subscription {
      id,
      key,
      inner: Arc::downgrade(&self.inner),
      released: false,
    })
  }

  /// Current subscriber count for `key`.
  pub fn subscriber_count(&self, key: &CacheKey) -> usize {
    self
      .inner
      .lock()
      .get(key)
      .map(|e| e.subscriber_count)
      .unwrap_or(0)
  }

  /// Number of live subscription handles across all keys.
  pub fn active(&self) -> usize {
    self.inner.lock_subscriptions().len()
  }
}

/// Handle bound to one cache key. Dropping it unsubscribes.
pub struct Subscription {
  id: u64,
  key: CacheKey,
  inner: Weak<EngineInner>,
  released: bool,
}

impl Subscription {
  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  pub fn id(&self) -> u64 {
    self.id
  }

  /// Release the subscription now instead of on drop.
  pub fn unsubscribe(mut self) {
    self.release();
  }

  fn release(&mut self) {
    if std::mem::replace(&mut self.released, true) {
      return;
    }
    let Some(inner) = self.inner.upgrade() else {
      return;
    };
    if inner.is_disposed() {
      return;
    }

    inner.lock_subscriptions().remove(&self.id);
    let mut store = inner.lock();
    if let Some(ticket) = store.unsubscribe(&self.key) {
      debug!(key = %self.key, "last subscriber gone, eviction scheduled");
      schedule_eviction(&inner, &mut store, ticket);
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.release();
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("id", &self.id)
      .field("key", &self.key)
      .finish()
  }
}

/// Arm the eviction timer for `ticket`.
///
/// The timer only holds a weak reference, so it never keeps a disposed
/// engine alive.
pub(crate) fn schedule_eviction(
  inner: &Arc<EngineInner>,
  store: &mut CacheStore,
  ticket: EvictionTicket,
) {
  let grace = inner.options.gc_grace;
  let weak = Arc::downgrade(inner);
  let timer_ticket = ticket.clone();

  let task = inner.runtime.spawn(async move {
    tokio::time::sleep(grace).await;
    let Some(inner) = weak.upgrade() else {
      return;
    };
    let evicted = inner.lock().evict_if_idle(&timer_ticket);
    if evicted {
      debug!(key = %timer_ticket.key, "idle entry evicted");
      inner.notify(CacheEvent::Removed(timer_ticket.key));
    }
  });

  store.arm_eviction(&ticket, task.abort_handle());
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use serde_json::json;

  use crate::cache::engine::{CacheEngine, CacheOptions};
  use crate::testing::{client_registry, FakeBackend};

  const GRACE: Duration = Duration::from_secs(60);

  fn engine(backend: &std::sync::Arc<FakeBackend>) -> CacheEngine {
    CacheEngine::init(
      client_registry(),
      backend.clone(),
      CacheOptions { gc_grace: GRACE },
    )
    .unwrap()
  }

  #[tokio::test(start_paused = true)]
  async fn test_resubscribe_within_grace_needs_no_fetch() {
    let backend = FakeBackend::with_clients(&["Acme"]);
    let engine = engine(&backend);
    let args = json!({ "id": 1 });

    let binding = engine.bind_query::<serde_json::Value>("getClient", args.clone()).unwrap();
    binding.settled().await.unwrap();
    drop(binding);

    tokio::time::sleep(GRACE / 2).await;

    let binding = engine.bind_query::<serde_json::Value>("getClient", args).unwrap();
    assert!(!binding.is_fetching());
    assert_eq!(binding.data().unwrap()["name"], json!("Acme"));
    assert_eq!(backend.total_calls(), 1);

    // The cancelled timer must not fire later
    tokio::time::sleep(GRACE * 2).await;
    assert!(engine.contains(binding.key()));
  }

  #[tokio::test(start_paused = true)]
  async fn test_idle_entry_reaped_after_grace() {
    let backend = FakeBackend::with_clients(&["Acme"]);
    let engine = engine(&backend);
    let args = json!({ "id": 1 });

    let binding = engine.bind_query::<serde_json::Value>("getClient", args.clone()).unwrap();
    binding.settled().await.unwrap();
    let key = binding.key().clone();
    drop(binding);

    tokio::time::sleep(GRACE + Duration::from_secs(1)).await;
    assert!(!engine.contains(&key));
    assert_eq!(engine.subscriptions().active(), 0);

    let binding = engine.bind_query::<serde_json::Value>("getClient", args).unwrap();
    assert!(binding.is_loading());
    binding.settled().await.unwrap();
    assert_eq!(backend.total_calls(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_counts_follow_handles() {
    let backend = FakeBackend::with_clients(&["Acme"]);
    let engine = engine(&backend);
    let subs = engine.subscriptions();
    let args = json!({ "id": 1 });

    let a = subs.subscribe("getClient", &args).unwrap();
    let b = subs.subscribe("getClient", &args).unwrap();
    assert_eq!(a.key(), b.key());
    assert_eq!(subs.subscriber_count(a.key()), 2);
    assert_eq!(subs.active(), 2);

    let key = a.key().clone();
    a.unsubscribe();
    assert_eq!(subs.subscriber_count(&key), 1);
    drop(b);
    assert_eq!(subs.subscriber_count(&key), 0);

    tokio::time::sleep(GRACE + Duration::from_secs(1)).await;
    assert!(!engine.contains(&key));
  }

  #[tokio::test(start_paused = true)]
  async fn test_unsubscribe_does_not_cancel_fetch() {
    let backend = FakeBackend::with_clients(&["Acme"]);
    backend.delay_next(Duration::from_secs(5));
    let engine = engine(&backend);
    let args = json!({ "id": 1 });

    let subscription = engine.subscriptions().subscribe("getClient", &args).unwrap();
    let handle = engine.queries().execute("getClient", args).unwrap();
    let key = handle.key().clone();
    drop(subscription);

    assert_eq!(handle.result().await.unwrap()["name"], json!("Acme"));
    assert!(engine.snapshot(&key).unwrap().data.is_some());
  }

  #[tokio::test]
  async fn test_subscribe_rejects_mutations() {
    let backend = FakeBackend::new();
    let engine = engine(&backend);
    assert!(engine
      .subscriptions()
      .subscribe("createClient", &json!({}))
      .is_err());
  }
}
