//! Query execution with request de-duplication.
//!
//! A query is resolved in one of three ways:
//! 1. Fulfilled entry: returned synchronously, no network call
//! 2. Fetch already running for the key: the caller awaits that same fetch
//! 3. Otherwise (absent, stale, rejected): exactly one new fetch is issued
//!
//! Every fetch runs on its own task and commits its outcome to the store
//! under the generation it was issued with.

use std::sync::Arc;

use futures::future::FutureExt;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::endpoint::QueryDefinition;
use super::engine::{CacheEvent, EngineInner};
use super::entry::{EntryStatus, FetchOutcome, InFlight, SharedFetch};
use super::error::{CacheError, FetchError};
use super::key::CacheKey;
use super::store::{CacheStore, CommitResult};
use super::subscription::schedule_eviction;

enum HandleState {
  Ready(Arc<Value>),
  InFlight(SharedFetch),
}

/// Result of [`QueryExecutor::execute`].
pub struct QueryHandle {
  key: CacheKey,
  state: HandleState,
}

impl QueryHandle {
  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  /// Whether the result was served from cache without waiting.
  pub fn is_ready(&self) -> bool {
    matches!(self.state, HandleState::Ready(_))
  }

  /// Data available without waiting, if any.
  pub fn ready_data(&self) -> Option<Arc<Value>> {
    match &self.state {
      HandleState::Ready(data) => Some(Arc::clone(data)),
      HandleState::InFlight(_) => None,
    }
  }

  /// Wait for the fetch this handle is attached to.
  pub async fn result(self) -> FetchOutcome {
    match self.state {
      HandleState::Ready(data) => Ok(data),
      HandleState::InFlight(fetch) => fetch.await,
    }
  }
}

impl std::fmt::Debug for QueryHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryHandle")
      .field("key", &self.key)
      .field("ready", &self.is_ready())
      .finish()
  }
}

/// Resolves read endpoints against the cache.
#[derive(Clone)]
pub struct QueryExecutor {
  inner: Arc<EngineInner>,
}

impl QueryExecutor {
  pub(crate) fn new(inner: Arc<EngineInner>) -> Self {
    Self { inner }
  }

  /// Resolve `endpoint` with `args`.
  ///
  /// Backend failures never surface here; they end up as a rejected entry
  /// and as the outcome of [`QueryHandle::result`].
  pub fn execute(&self, endpoint: &str, args: Value) -> Result<QueryHandle, CacheError> {
    self.inner.check_live()?;
    let def = self.inner.registry.query(endpoint)?;
    let key = CacheKey::new(endpoint, &args);

    let mut store = self.inner.lock();
    if let Some(entry) = store.get(&key) {
      if entry.status == EntryStatus::Fulfilled {
        if let Some(data) = &entry.data {
          debug!(key = %key, "cache hit");
          return Ok(QueryHandle {
            key,
            state: HandleState::Ready(Arc::clone(data)),
          });
        }
      }
      if let Some(in_flight) = &entry.in_flight {
        debug!(key = %key, generation = in_flight.generation, "joining in-flight fetch");
        return Ok(QueryHandle {
          key,
          state: HandleState::InFlight(in_flight.result.clone()),
        });
      }
    }

    store.ensure(&key, endpoint, &args);
    let fetch = start_fetch(&self.inner, &mut store, def, &key, args);
    Ok(QueryHandle {
      key,
      state: HandleState::InFlight(fetch),
    })
  }

  /// Issue a new fetch for an existing entry, even if one is running.
  ///
  /// The new fetch gets a higher generation, so whatever it returns wins
  /// over any older fetch still in flight. Returns `None` if the key is
  /// not cached.
  pub fn refetch(&self, key: &CacheKey) -> Result<Option<QueryHandle>, CacheError> {
    self.inner.check_live()?;
    let mut store = self.inner.lock();
    let Some(fetch) = refetch_locked(&self.inner, &mut store, key)? else {
      return Ok(None);
    };
    Ok(Some(QueryHandle {
      key: key.clone(),
      state: HandleState::InFlight(fetch),
    }))
  }
}

/// Refetch with the store already locked.
pub(crate) fn refetch_locked(
  inner: &Arc<EngineInner>,
  store: &mut CacheStore,
  key: &CacheKey,
) -> Result<Option<SharedFetch>, CacheError> {
  let Some(entry) = store.get(key) else {
    return Ok(None);
  };
  let endpoint = entry.endpoint.clone();
  let args = entry.args.clone();
  let def = inner.registry.query(&endpoint)?;
  Ok(Some(start_fetch(inner, store, def, key, args)))
}

/// Spawn a fetch for `key` and record it on the entry.
///
/// The store lock is held by the caller, so the spawned task cannot commit
/// before the in-flight record exists.
fn start_fetch(
  inner: &Arc<EngineInner>,
  store: &mut CacheStore,
  def: &QueryDefinition,
  key: &CacheKey,
  args: Value,
) -> SharedFetch {
  let generation = store.issue_generation();
  let (tx, rx) = oneshot::channel::<FetchOutcome>();
  let result: SharedFetch = async move { rx.await.unwrap_or(Err(FetchError::Cancelled)) }
    .boxed()
    .shared();

  let task_inner = Arc::clone(inner);
  let task_def = def.clone();
  let task_key = key.clone();
  let task = inner.runtime.spawn(async move {
    let outcome = run_request(&task_inner, &task_def, &args).await;
    finish_fetch(&task_inner, &task_def, &task_key, &args, generation, &outcome);
    // Awaiters may all be gone
    let _ = tx.send(outcome);
  });

  debug!(key = %key, generation, endpoint = %def.name, "fetch issued");
  store.begin_fetch(
    key,
    InFlight {
      generation,
      result: result.clone(),
      abort: task.abort_handle(),
    },
  );
  result
}

async fn run_request(inner: &EngineInner, def: &QueryDefinition, args: &Value) -> FetchOutcome {
  let request = def.request(args)?;
  let data = inner.transport.send(request).await?;
  Ok(Arc::new(data))
}

fn finish_fetch(
  inner: &Arc<EngineInner>,
  def: &QueryDefinition,
  key: &CacheKey,
  args: &Value,
  generation: u64,
  outcome: &FetchOutcome,
) {
  let committed = {
    let mut store = inner.lock();
    let result = match outcome {
      Ok(data) => {
        let tags = def.tags_for(data, args);
        store.commit(key, generation, Ok((Arc::clone(data), tags)))
      }
      Err(error) => store.commit(key, generation, Err(error.clone())),
    };
    if result == CommitResult::Committed {
      // Fetched data nobody watches still only lives for the grace period
      if let Some(ticket) = store.idle_ticket(key) {
        schedule_eviction(inner, &mut store, ticket);
      }
    }
    result
  };

  match (committed, outcome) {
    (CommitResult::Committed, Ok(_)) => {
      debug!(key = %key, generation, "fetch fulfilled");
      inner.notify(CacheEvent::Updated(key.clone()));
    }
    (CommitResult::Committed, Err(error)) => {
      warn!(key = %key, generation, error = %error, "fetch rejected");
      inner.notify(CacheEvent::Updated(key.clone()));
    }
    (CommitResult::Superseded, _) => {
      debug!(key = %key, generation, "late fetch outcome dropped");
    }
    (CommitResult::Discarded, _) => {
      debug!(key = %key, generation, "entry gone, fetch outcome discarded");
    }
  }
}
