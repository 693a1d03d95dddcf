//! # In-Memory Backend
//!
//! Reference implementation of `BeanManager`. Beans live in one
//! `BTreeMap` keyed by `BeanId`, so listings and query results come back
//! sorted by schema name, then instance id. A single `RwLock` makes every
//! batch atomic: it is checked completely before anything is written.

use crate::manager::BeanManager;
use crate::query::{BeanQuery, QueryResult, QuerySpec};
use crate::schema::{Schema, SchemaRegistry};
use crate::validation::{check_references, merge_into, prepare_batch};
use crate::{Bean, BeanId, ConfstoreError};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug)]
pub struct MemoryBeanManager {
    schemas: Arc<SchemaRegistry>,
    beans: RwLock<BTreeMap<BeanId, Bean>>,
}

impl MemoryBeanManager {
    pub fn new(schemas: Arc<SchemaRegistry>) -> Self {
        Self {
            schemas,
            beans: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of stored beans across all schemas.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<BeanId, Bean>> {
        self.beans.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<BeanId, Bean>> {
        self.beans.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stored copy with the current schema attached.
    fn hydrate(&self, bean: &Bean) -> Result<Bean, ConfstoreError> {
        let mut bean = bean.clone();
        bean.attach_schema(self.schemas.get(bean.schema_name())?);
        Ok(bean)
    }

    fn schema_range<'a>(
        store: &'a BTreeMap<BeanId, Bean>,
        schema_name: &'a str,
    ) -> impl Iterator<Item = &'a Bean> + 'a {
        store
            .range(BeanId::new(schema_name, "")..)
            .take_while(move |(id, _)| id.schema_name() == schema_name)
            .map(|(_, bean)| bean)
    }
}

impl BeanManager for MemoryBeanManager {
    fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    fn create_all(&self, mut beans: Vec<Bean>) -> Result<(), ConfstoreError> {
        prepare_batch(&self.schemas, &mut beans)?;
        let mut store = self.write();

        let mut pending = Vec::with_capacity(beans.len());
        for bean in beans {
            if store.contains_key(bean.id()) {
                if bean.is_default() {
                    tracing::debug!(bean = %bean.id(), "default bean already stored, skipping");
                    continue;
                }
                return Err(ConfstoreError::BeanAlreadyExists(bean.id().detached()));
            }
            pending.push(bean);
        }
        let batch: BTreeSet<BeanId> = pending.iter().map(|b| b.id().detached()).collect();
        check_references(&pending, &batch, |id| Ok(store.contains_key(id)))?;

        for bean in pending {
            tracing::debug!(bean = %bean.id(), "created");
            store.insert(bean.id().detached(), bean);
        }
        Ok(())
    }

    fn set_all(&self, mut beans: Vec<Bean>) -> Result<(), ConfstoreError> {
        prepare_batch(&self.schemas, &mut beans)?;
        let mut store = self.write();
        for bean in &beans {
            if !store.contains_key(bean.id()) {
                return Err(ConfstoreError::BeanNotFound(bean.id().detached()));
            }
        }
        let batch: BTreeSet<BeanId> = beans.iter().map(|b| b.id().detached()).collect();
        check_references(&beans, &batch, |id| Ok(store.contains_key(id)))?;

        for mut bean in beans {
            if let Some(previous) = store.get(bean.id()) {
                bean.set_default(previous.is_default());
            }
            tracing::debug!(bean = %bean.id(), "replaced");
            store.insert(bean.id().detached(), bean);
        }
        Ok(())
    }

    fn merge_all(&self, mut patches: Vec<Bean>) -> Result<(), ConfstoreError> {
        prepare_batch(&self.schemas, &mut patches)?;
        let mut store = self.write();
        let mut merged = Vec::with_capacity(patches.len());
        for patch in &patches {
            let mut target = store
                .get(patch.id())
                .cloned()
                .ok_or_else(|| ConfstoreError::BeanNotFound(patch.id().detached()))?;
            merge_into(&mut target, patch);
            merged.push(target);
        }
        let batch: BTreeSet<BeanId> = merged.iter().map(|b| b.id().detached()).collect();
        check_references(&merged, &batch, |id| Ok(store.contains_key(id)))?;

        for bean in merged {
            tracing::debug!(bean = %bean.id(), "merged");
            store.insert(bean.id().detached(), bean);
        }
        Ok(())
    }

    fn delete_all(
        &self,
        schema_name: &str,
        instance_ids: &[String],
    ) -> Result<Vec<Bean>, ConfstoreError> {
        let schema = self.schemas.get(schema_name)?;
        let mut store = self.write();
        let doomed: BTreeSet<BeanId> = instance_ids
            .iter()
            .map(|i| BeanId::new(schema_name, i.as_str()))
            .collect();

        for id in &doomed {
            let bean = store
                .get(id)
                .ok_or_else(|| ConfstoreError::BeanNotFound(id.clone()))?;
            if bean.is_default() {
                return Err(ConfstoreError::InvalidData(format!(
                    "default bean {} cannot be deleted",
                    id
                )));
            }
            let referenced_by: Vec<BeanId> = store
                .values()
                .filter(|other| !doomed.contains(other.id()) && other.refers_to(id))
                .map(|other| other.id().detached())
                .collect();
            if !referenced_by.is_empty() {
                return Err(ConfstoreError::ReferentialIntegrity {
                    id: id.clone(),
                    referenced_by,
                });
            }
        }

        let mut removed = Vec::with_capacity(doomed.len());
        for id in &doomed {
            if let Some(mut bean) = store.remove(id) {
                tracing::debug!(bean = %id, "deleted");
                bean.attach_schema(Arc::clone(&schema));
                removed.push(bean);
            }
        }
        Ok(removed)
    }

    fn get_lazy(&self, id: &BeanId) -> Result<Option<Bean>, ConfstoreError> {
        let store = self.read();
        store.get(id).map(|bean| self.hydrate(bean)).transpose()
    }

    fn list(&self, schema_name: &str) -> Result<Vec<Bean>, ConfstoreError> {
        self.schemas.get(schema_name)?;
        let store = self.read();
        Self::schema_range(&store, schema_name)
            .map(|bean| self.hydrate(bean))
            .collect()
    }

    fn new_query(&self, schema: Arc<Schema>) -> BeanQuery<'_> {
        BeanQuery::new(self, schema)
    }

    fn retrieve(&self, query: &QuerySpec) -> Result<QueryResult, ConfstoreError> {
        let schema_name = query.schema().name.as_str();
        let store = self.read();
        let candidates: Vec<Result<Bean, ConfstoreError>> = Self::schema_range(&store, schema_name)
            .map(|bean| {
                let mut bean = bean.clone();
                bean.attach_schema(Arc::clone(query.schema()));
                Ok(bean)
            })
            .collect();
        drop(store);
        query.paginate(candidates)
    }
}

// =============================================================================
// TESTS
// =============================================================================
