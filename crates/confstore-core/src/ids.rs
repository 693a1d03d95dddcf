//! # Unique Id Registry
//!
//! Bijective, append-only maps between names and compact numeric ids, one
//! space per `IdCategory`. The codec writes these ids instead of names, so
//! once a binding exists it must never change or be removed.
//!
//! Implementations:
//! - `InMemoryUniqueIds`: per-category mutex, ids start at 1
//! - `CachedUniqueIds`: read-through cache over any other store
//! - `storage::RedbUniqueIds`: durable bindings in redb

use crate::ConfstoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, PoisonError, RwLock};

/// Independent id spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IdCategory {
    Schema,
    Property,
    Instance,
}

impl IdCategory {
    pub const ALL: [Self; 3] = [Self::Schema, Self::Property, Self::Instance];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Schema => "schema",
            Self::Property => "property",
            Self::Instance => "instance",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Schema => 0,
            Self::Property => 1,
            Self::Instance => 2,
        }
    }
}

impl fmt::Display for IdCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name <-> id bindings.
///
/// Implementations must be safe for concurrent use: two concurrent
/// `get_or_create_id` calls for the same `(category, name)` return the same id.
pub trait UniqueIdStore: Send + Sync {
    /// Id bound to `name`, creating the binding if it does not exist yet.
    fn get_or_create_id(&self, category: IdCategory, name: &str) -> Result<u64, ConfstoreError>;

    /// Id bound to `name`, without creating one.
    fn find_id(&self, category: IdCategory, name: &str) -> Result<Option<u64>, ConfstoreError>;

    /// Name bound to `id`. Fails with `UnknownId` if no binding exists.
    fn get_name(&self, category: IdCategory, id: u64) -> Result<String, ConfstoreError>;
}

// =============================================================================
// IN-MEMORY
// =============================================================================

#[derive(Debug, Default)]
struct Bindings {
    by_name: BTreeMap<String, u64>,
    by_id: BTreeMap<u64, String>,
    last: u64,
}

/// Process-local id registry.
#[derive(Debug, Default)]
pub struct InMemoryUniqueIds {
    spaces: [Mutex<Bindings>; 3],
}

impl InMemoryUniqueIds {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bindings in a category.
    #[must_use]
    pub fn len(&self, category: IdCategory) -> usize {
        self.space(category).by_name.len()
    }

    #[must_use]
    pub fn is_empty(&self, category: IdCategory) -> bool {
        self.len(category) == 0
    }

    fn space(&self, category: IdCategory) -> std::sync::MutexGuard<'_, Bindings> {
        self.spaces[category.index()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl UniqueIdStore for InMemoryUniqueIds {
    fn get_or_create_id(&self, category: IdCategory, name: &str) -> Result<u64, ConfstoreError> {
        let mut space = self.space(category);
        if let Some(&id) = space.by_name.get(name) {
            return Ok(id);
        }
        let id = space
            .last
            .checked_add(1)
            .ok_or_else(|| ConfstoreError::Storage(format!("{} id space exhausted", category)))?;
        space.last = id;
        space.by_name.insert(name.to_string(), id);
        space.by_id.insert(id, name.to_string());
        tracing::trace!(%category, name, id, "created unique id");
        Ok(id)
    }

    fn find_id(&self, category: IdCategory, name: &str) -> Result<Option<u64>, ConfstoreError> {
        Ok(self.space(category).by_name.get(name).copied())
    }

    fn get_name(&self, category: IdCategory, id: u64) -> Result<String, ConfstoreError> {
        self.space(category)
            .by_id
            .get(&id)
            .cloned()
            .ok_or(ConfstoreError::UnknownId { category, id })
    }
}

// =============================================================================
// CACHE
// =============================================================================

/// Read-through cache in front of a slower id store.
///
/// Bindings never change, so cached entries never need invalidation.
#[derive(Debug, Default)]
pub struct CachedUniqueIds<S> {
    inner: S,
    names: RwLock<BTreeMap<(IdCategory, String), u64>>,
    ids: RwLock<BTreeMap<(IdCategory, u64), String>>,
}

impl<S: UniqueIdStore> CachedUniqueIds<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            names: RwLock::new(BTreeMap::new()),
            ids: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn cached_id(&self, category: IdCategory, name: &str) -> Option<u64> {
        self.names
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(category, name.to_string()))
            .copied()
    }

    fn remember(&self, category: IdCategory, name: &str, id: u64) {
        self.names
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((category, name.to_string()), id);
        self.ids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((category, id), name.to_string());
    }
}

impl<S: UniqueIdStore> UniqueIdStore for CachedUniqueIds<S> {
    fn get_or_create_id(&self, category: IdCategory, name: &str) -> Result<u64, ConfstoreError> {
        if let Some(id) = self.cached_id(category, name) {
            return Ok(id);
        }
        let id = self.inner.get_or_create_id(category, name)?;
        self.remember(category, name, id);
        Ok(id)
    }

    fn find_id(&self, category: IdCategory, name: &str) -> Result<Option<u64>, ConfstoreError> {
        if let Some(id) = self.cached_id(category, name) {
            return Ok(Some(id));
        }
        let found = self.inner.find_id(category, name)?;
        if let Some(id) = found {
            self.remember(category, name, id);
        }
        Ok(found)
    }

    fn get_name(&self, category: IdCategory, id: u64) -> Result<String, ConfstoreError> {
        let cached = self
            .ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(category, id))
            .cloned();
        if let Some(name) = cached {
            return Ok(name);
        }
        let name = self.inner.get_name(category, id)?;
        self.remember(category, &name, id);
        Ok(name)
    }
}

// =============================================================================
// TESTS
// =============================================================================
