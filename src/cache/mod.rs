//! Tag-indexed query cache.
//!
//! This module is API-agnostic. It provides:
//! - Canonical cache keys derived from endpoint name + arguments
//! - A tag index mapping cached results to the entities they depend on
//! - Request de-duplication: one in-flight fetch per key
//! - Invalidation by tag after successful mutations (refetch if watched,
//!   delete if not)
//! - Generation numbers so late fetch results never overwrite newer ones
//! - Reference-counted subscriptions with delayed eviction of idle entries

mod binding;
mod endpoint;
mod engine;
mod entry;
mod error;
mod key;
mod mutation;
mod query;
mod request;
mod store;
mod subscription;
mod tags;

pub use binding::{decode, MutationBinding, QueryBinding};
pub use endpoint::{EndpointDefinition, EndpointRegistry, MutationDefinition, QueryDefinition};
pub use engine::{CacheEngine, CacheEvent, CacheOptions, DEFAULT_GC_GRACE};
pub use entry::{CacheEntry, EntryPatch, EntrySnapshot, EntryStatus};
pub use error::{CacheError, FetchError};
pub use key::{canonical_json, CacheKey};
pub use mutation::{InvalidationReport, MutationCoordinator};
pub use query::{QueryExecutor, QueryHandle};
pub use request::{FormPart, Method, RequestBody, RequestDescriptor, Transport};
pub use store::{CacheStore, CommitResult, EvictionTicket};
pub use subscription::{Subscription, SubscriptionManager};
pub use tags::{TagId, TagIndex, TagRef};
