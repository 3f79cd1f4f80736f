//! Process-scoped cache engine.
//!
//! One [`CacheEngine`] is created at startup with [`CacheEngine::init`] and
//! torn down with [`CacheEngine::dispose`]. Clones share the same state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::info;

use super::binding::{MutationBinding, QueryBinding};
use super::endpoint::EndpointRegistry;
use super::entry::EntrySnapshot;
use super::error::CacheError;
use super::key::CacheKey;
use super::mutation::MutationCoordinator;
use super::query::QueryExecutor;
use super::request::Transport;
use super::store::CacheStore;
use super::subscription::SubscriptionManager;

/// Default time an unobserved entry is retained.
pub const DEFAULT_GC_GRACE: Duration = Duration::from_secs(60);

const EVENT_CAPACITY: usize = 256;

/// Tunables for the engine.
#[derive(Debug, Clone)]
pub struct CacheOptions {
  /// How long an entry with no subscribers survives before eviction
  pub gc_grace: Duration,
}

impl Default for CacheOptions {
  fn default() -> Self {
    Self {
      gc_grace: DEFAULT_GC_GRACE,
    }
  }
}

/// Change notifications for bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
  /// A fetch outcome was stored
  Updated(CacheKey),
  /// Tags covering the entry were invalidated
  Invalidated(CacheKey),
  /// The entry was deleted
  Removed(CacheKey),
}

impl CacheEvent {
  pub fn key(&self) -> &CacheKey {
    match self {
      CacheEvent::Updated(k) | CacheEvent::Invalidated(k) | CacheEvent::Removed(k) => k,
    }
  }
}

pub(crate) struct EngineInner {
  pub registry: EndpointRegistry,
  pub transport: Arc<dyn Transport>,
  pub options: CacheOptions,
  pub runtime: Handle,
  store: Mutex<CacheStore>,
  subscriptions: Mutex<HashMap<u64, CacheKey>>,
  pub next_subscription: AtomicU64,
  disposed: AtomicBool,
  events: broadcast::Sender<CacheEvent>,
}

impl EngineInner {
  /// Lock the store. The guard must never be held across an await.
  pub fn lock(&self) -> MutexGuard<'_, CacheStore> {
    self.store.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn lock_subscriptions(&self) -> MutexGuard<'_, HashMap<u64, CacheKey>> {
    self
      .subscriptions
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  pub fn check_live(&self) -> Result<(), CacheError> {
    if self.is_disposed() {
      return Err(CacheError::Disposed);
    }
    Ok(())
  }

  pub fn is_disposed(&self) -> bool {
    self.disposed.load(Ordering::Acquire)
  }

  pub fn notify(&self, event: CacheEvent) {
    // No receivers is fine
    let _ = self.events.send(event);
  }

  pub fn subscribe_events(&self) -> broadcast::Receiver<CacheEvent> {
    self.events.subscribe()
  }
}

/// Tag-indexed query cache bound to one backend.
#[derive(Clone)]
pub struct CacheEngine {
  inner: Arc<EngineInner>,
}

impl CacheEngine {
  /// Create the engine. Must be called from within a tokio runtime.
  pub fn init(
    registry: EndpointRegistry,
    transport: Arc<dyn Transport>,
    options: CacheOptions,
  ) -> Result<Self, CacheError> {
    let runtime = Handle::try_current().map_err(|e| CacheError::NoRuntime(e.to_string()))?;
    let (events, _) = broadcast::channel(EVENT_CAPACITY);

    info!(
      endpoints = registry.len(),
      gc_grace_secs = options.gc_grace.as_secs_f64(),
      "cache engine initialized"
    );

    Ok(Self {
      inner: Arc::new(EngineInner {
        registry,
        transport,
        options,
        runtime,
        store: Mutex::new(CacheStore::new()),
        subscriptions: Mutex::new(HashMap::new()),
        next_subscription: AtomicU64::new(0),
        disposed: AtomicBool::new(false),
        events,
      }),
    })
  }

  /// Abort every fetch and timer and drop all entries.
  ///
  /// Later operations fail with [`CacheError::Disposed`].
  pub fn dispose(&self) {
    if self.inner.disposed.swap(true, Ordering::AcqRel) {
      return;
    }
    let dropped = {
      let mut store = self.inner.lock();
      let n = store.len();
      store.clear();
      n
    };
    self.inner.lock_subscriptions().clear();
    info!(entries = dropped, "cache engine disposed");
  }

  pub fn is_disposed(&self) -> bool {
    self.inner.is_disposed()
  }

  pub fn queries(&self) -> QueryExecutor {
    QueryExecutor::new(Arc::clone(&self.inner))
  }

  pub fn mutations(&self) -> MutationCoordinator {
    MutationCoordinator::new(Arc::clone(&self.inner))
  }

  pub fn subscriptions(&self) -> SubscriptionManager {
    SubscriptionManager::new(Arc::clone(&self.inner))
  }

  /// Subscribe to a query and start resolving it.
  pub fn bind_query<T: DeserializeOwned>(
    &self,
    endpoint: &str,
    args: Value,
  ) -> Result<QueryBinding<T>, CacheError> {
    QueryBinding::new(Arc::clone(&self.inner), endpoint, args)
  }

  /// Handle for triggering a mutation endpoint.
  pub fn bind_mutation<T: DeserializeOwned>(
    &self,
    endpoint: &str,
  ) -> Result<MutationBinding<T>, CacheError> {
    MutationBinding::new(Arc::clone(&self.inner), endpoint)
  }

  pub fn snapshot(&self, key: &CacheKey) -> Option<EntrySnapshot> {
    self.inner.lock().get(key).map(|entry| entry.snapshot())
  }

  /// Snapshot of every entry, keyed by cache key.
  pub fn snapshot_all(&self) -> HashMap<CacheKey, EntrySnapshot> {
    let store = self.inner.lock();
    store
      .keys()
      .filter_map(|key| store.get(key).map(|e| (key.clone(), e.snapshot())))
      .collect()
  }

  pub fn contains(&self, key: &CacheKey) -> bool {
    self.inner.lock().get(key).is_some()
  }

  pub fn len(&self) -> usize {
    self.inner.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn events(&self) -> broadcast::Receiver<CacheEvent> {
    self.inner.subscribe_events()
  }

  pub fn options(&self) -> &CacheOptions {
    &self.inner.options
  }
}

impl std::fmt::Debug for CacheEngine {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CacheEngine")
      .field("options", &self.inner.options)
      .field("disposed", &self.is_disposed())
      .finish_non_exhaustive()
  }
}
