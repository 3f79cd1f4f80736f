//! Tags and the bidirectional tag index.
//!
//! A tag describes one thing a cached result depends on: either a single
//! entity (`Client:42`) or a whole collection view (`ClientList:LIST`).

use std::collections::{HashMap, HashSet};
use std::fmt;

use super::key::CacheKey;

/// Identifier half of a tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TagId {
  /// The collection view for a tag type
  List,
  /// A specific entity
  Id(String),
}

impl fmt::Display for TagId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TagId::List => f.write_str("LIST"),
      TagId::Id(id) => f.write_str(id),
    }
  }
}

/// A typed label `{type, id}` describing a dependency of cached data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TagRef {
  pub tag_type: String,
  pub id: TagId,
}

impl TagRef {
  /// Tag for the collection view of `tag_type`.
  pub fn list(tag_type: impl Into<String>) -> Self {
    Self {
      tag_type: tag_type.into(),
      id: TagId::List,
    }
  }

  /// Tag for a single entity of `tag_type`.
  pub fn id(tag_type: impl Into<String>, id: impl ToString) -> Self {
    Self {
      tag_type: tag_type.into(),
      id: TagId::Id(id.to_string()),
    }
  }
}

impl fmt::Display for TagRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.tag_type, self.id)
  }
}

/// Maps tags to cache keys and cache keys to tags, kept in lock-step.
#[derive(Debug, Default)]
pub struct TagIndex {
  tag_to_keys: HashMap<TagRef, HashSet<CacheKey>>,
  key_to_tags: HashMap<CacheKey, HashSet<TagRef>>,
}

impl TagIndex {
  pub fn new() -> Self {
    Self::default()
  }

  /// Replace the tag set of `key`.
  ///
  /// Only the difference between the old and new set touches the reverse
  /// index. An empty set removes the key entirely.
  pub fn set_tags(&mut self, key: &CacheKey, tags: HashSet<TagRef>) {
    let old = self.key_to_tags.remove(key).unwrap_or_default();

    for removed in old.difference(&tags) {
      self.detach(removed, key);
    }
    for added in tags.difference(&old) {
      self
        .tag_to_keys
        .entry(added.clone())
        .or_default()
        .insert(key.clone());
    }

    if !tags.is_empty() {
      self.key_to_tags.insert(key.clone(), tags);
    }
  }

  /// Every key whose tag set intersects `tags`.
  ///
  /// Read-only: the caller decides what happens to the returned keys.
  pub fn invalidate<'a>(&self, tags: impl IntoIterator<Item = &'a TagRef>) -> HashSet<CacheKey> {
    tags
      .into_iter()
      .filter_map(|tag| self.tag_to_keys.get(tag))
      .flatten()
      .cloned()
      .collect()
  }

  /// Drop every record for `key`.
  pub fn clear(&mut self, key: &CacheKey) {
    if let Some(tags) = self.key_to_tags.remove(key) {
      for tag in &tags {
        self.detach(tag, key);
      }
    }
  }

  /// Tags currently recorded for `key`.
  pub fn tags_for(&self, key: &CacheKey) -> Option<&HashSet<TagRef>> {
    self.key_to_tags.get(key)
  }

  /// Number of distinct tags in the index.
  pub fn tag_count(&self) -> usize {
    self.tag_to_keys.len()
  }

  /// Number of keys with at least one tag.
  pub fn key_count(&self) -> usize {
    self.key_to_tags.len()
  }

  pub fn reset(&mut self) {
    self.tag_to_keys.clear();
    self.key_to_tags.clear();
  }

  fn detach(&mut self, tag: &TagRef, key: &CacheKey) {
    if let Some(keys) = self.tag_to_keys.get_mut(tag) {
      keys.remove(key);
      if keys.is_empty() {
        self.tag_to_keys.remove(tag);
      }
    }
  }
}
