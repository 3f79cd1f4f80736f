//! Consumer-facing bindings.
//!
//! A [`QueryBinding`] is what a view holds while it is on screen: it keeps
//! the entry subscribed and exposes `data`, `error`, `is_loading`,
//! `is_fetching` and `refetch`. A [`MutationBinding`] wraps one write
//! endpoint with its own loading and error state.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use super::engine::{CacheEvent, EngineInner};
use super::entry::{EntrySnapshot, EntryStatus};
use super::error::{CacheError, FetchError};
use super::key::CacheKey;
use super::mutation::MutationCoordinator;
use super::query::QueryExecutor;
use super::subscription::{Subscription, SubscriptionManager};

/// Decode a cached JSON value into `T`.
pub fn decode<T: DeserializeOwned>(value: &Value) -> Result<T, FetchError> {
  T::deserialize(value).map_err(|e| FetchError::Decode(e.to_string()))
}

/// Live view of one query.
pub struct QueryBinding<T> {
  inner: Arc<EngineInner>,
  subscription: Subscription,
  events: broadcast::Receiver<CacheEvent>,
  _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> QueryBinding<T> {
  pub(crate) fn new(inner: Arc<EngineInner>, endpoint: &str, args: Value) -> Result<Self, CacheError> {
    let events = inner.subscribe_events();
    let subscription = SubscriptionManager::new(Arc::clone(&inner)).subscribe(endpoint, &args)?;
    QueryExecutor::new(Arc::clone(&inner)).execute(endpoint, args)?;

    Ok(Self {
      inner,
      subscription,
      events,
      _marker: PhantomData,
    })
  }

  pub fn key(&self) -> &CacheKey {
    self.subscription.key()
  }

  fn snapshot(&self) -> Option<EntrySnapshot> {
    self.inner.lock().get(self.key()).map(|e| e.snapshot())
  }

  pub fn status(&self) -> Option<EntryStatus> {
    self.snapshot().map(|s| s.status)
  }

  /// Last good data, including while stale or refetching.
  pub fn data(&self) -> Option<T> {
    let data = self.snapshot()?.data?;
    match decode(&data) {
      Ok(value) => Some(value),
      Err(error) => {
        warn!(key = %self.key(), error = %error, "cached data does not match binding type");
        None
      }
    }
  }

  /// Error of the last fetch, or a decode error for the cached data.
  pub fn error(&self) -> Option<FetchError> {
    let snapshot = self.snapshot()?;
    if let Some(error) = snapshot.error {
      return Some(error);
    }
    snapshot.data.and_then(|data| decode::<T>(&data).err())
  }

  /// Fetching with nothing to show yet.
  pub fn is_loading(&self) -> bool {
    self
      .snapshot()
      .is_some_and(|s| s.is_fetching && s.data.is_none())
  }

  /// Any fetch running, including background refetches.
  pub fn is_fetching(&self) -> bool {
    self.snapshot().is_some_and(|s| s.is_fetching)
  }

  /// Force a new fetch for this binding's key.
  pub fn refetch(&self) -> Result<(), CacheError> {
    QueryExecutor::new(Arc::clone(&self.inner)).refetch(self.key())?;
    Ok(())
  }

  /// Wait until no fetch is running, then return the stored outcome.
  pub async fn settled(&self) -> Result<T, FetchError> {
    loop {
      let fetch = {
        let store = self.inner.lock();
        store
          .get(self.key())
          .and_then(|e| e.in_flight.as_ref().map(|f| f.result.clone()))
      };
      match fetch {
        // Outcome is read back from the store; a newer fetch may have landed
        Some(fetch) => {
          let _ = fetch.await;
        }
        None => break,
      }
    }

    let snapshot = self.snapshot().ok_or(FetchError::Cancelled)?;
    match (snapshot.status, snapshot.error, snapshot.data) {
      (EntryStatus::Rejected, Some(error), _) => Err(error),
      (_, _, Some(data)) => decode(&data),
      (_, Some(error), None) => Err(error),
      // Subscribed but never executed
      (_, None, None) => Err(FetchError::Cancelled),
    }
  }

  /// Wait for the next change to this binding's entry.
  pub async fn changed(&mut self) -> Result<(), CacheError> {
    loop {
      match self.events.recv().await {
        Ok(event) if event.key() == self.key() => return Ok(()),
        Ok(_) => continue,
        // Missed events may have included ours
        Err(RecvError::Lagged(_)) => return Ok(()),
        Err(RecvError::Closed) => return Err(CacheError::Disposed),
      }
    }
  }
}

impl<T> std::fmt::Debug for QueryBinding<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryBinding")
      .field("key", self.subscription.key())
      .finish_non_exhaustive()
  }
}

#[derive(Debug, Default)]
struct MutationState {
  running: usize,
  error: Option<FetchError>,
}

/// Trigger handle for one write endpoint.
pub struct MutationBinding<T> {
  coordinator: MutationCoordinator,
  endpoint: String,
  state: Arc<Mutex<MutationState>>,
  _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> MutationBinding<T> {
  pub(crate) fn new(inner: Arc<EngineInner>, endpoint: &str) -> Result<Self, CacheError> {
    inner.registry.mutation(endpoint)?;
    Ok(Self {
      coordinator: MutationCoordinator::new(inner),
      endpoint: endpoint.to_string(),
      state: Arc::new(Mutex::new(MutationState::default())),
      _marker: PhantomData,
    })
  }

  /// Run the mutation and decode its response.
  pub async fn trigger(&self, args: Value) -> Result<T, CacheError> {
    {
      let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
      state.running += 1;
      state.error = None;
    }

    let outcome = self
      .coordinator
      .execute(&self.endpoint, args)
      .await
      .and_then(|value| decode(&value).map_err(CacheError::from));

    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    state.running -= 1;
    if let Err(CacheError::Fetch(error)) = &outcome {
      state.error = Some(error.clone());
    }
    outcome
  }

  pub fn is_loading(&self) -> bool {
    self
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .running
      > 0
  }

  /// Error of the most recent trigger.
  pub fn error(&self) -> Option<FetchError> {
    self
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .error
      .clone()
  }

  pub fn endpoint(&self) -> &str {
    &self.endpoint
  }
}
