//! # Config Store
//!
//! Host-owned entry point. A `ConfigStore` ties together the schema
//! registry, one backend, the notification manager and an optional
//! provider of default instances. There is no process-global state: hosts
//! create as many independent stores as they need.
//!
//! Writes go through the store so that observers see every committed
//! change; reads resolve references and singleton defaults.

use crate::manager::BeanManager;
use crate::memory::MemoryBeanManager;
use crate::notify::{Change, NotificationManager, Observer};
use crate::query::BeanQuery;
use crate::resolver::{DefaultInstanceProvider, LazyRef, Resolver};
use crate::schema::{Schema, SchemaRegistry};
use crate::storage::RedbBeanManager;
use crate::validation::prepare_batch;
use crate::{Bean, BeanId, ConfstoreError};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

pub struct ConfigStore {
    schemas: Arc<SchemaRegistry>,
    manager: Arc<dyn BeanManager>,
    notifications: NotificationManager,
    defaults: Option<Arc<dyn DefaultInstanceProvider>>,
}

impl fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigStore")
            .field("schemas", &self.schemas.names())
            .field("notifications", &self.notifications)
            .field("defaults", &self.defaults.is_some())
            .finish_non_exhaustive()
    }
}

impl ConfigStore {
    /// Store over an arbitrary backend sharing `schemas`.
    pub fn with_manager(schemas: Arc<SchemaRegistry>, manager: Arc<dyn BeanManager>) -> Self {
        Self {
            schemas,
            manager,
            notifications: NotificationManager::new(),
            defaults: None,
        }
    }

    /// Store over a fresh in-memory backend.
    #[must_use]
    pub fn in_memory() -> Self {
        let schemas = Arc::new(SchemaRegistry::new());
        let manager = Arc::new(MemoryBeanManager::new(Arc::clone(&schemas)));
        Self::with_manager(schemas, manager)
    }

    /// Store over a redb database file, created if missing.
    pub fn open_redb(path: impl AsRef<Path>) -> Result<Self, ConfstoreError> {
        let schemas = Arc::new(SchemaRegistry::new());
        let manager = Arc::new(RedbBeanManager::open(path, Arc::clone(&schemas))?);
        Ok(Self::with_manager(schemas, manager))
    }

    #[must_use]
    pub fn with_defaults(mut self, provider: Arc<dyn DefaultInstanceProvider>) -> Self {
        self.defaults = Some(provider);
        self
    }

    #[must_use]
    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.schemas
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<dyn BeanManager> {
        &self.manager
    }

    #[must_use]
    pub fn notifications(&self) -> &NotificationManager {
        &self.notifications
    }

    // =========================================================================
    // SCHEMAS
    // =========================================================================

    pub fn register_schema(&self, schema: Schema) -> Result<Arc<Schema>, ConfstoreError> {
        self.schemas.register(schema)
    }

    pub fn register_schemas(&self, schemas: Vec<Schema>) -> Result<Vec<Arc<Schema>>, ConfstoreError> {
        self.schemas.register_all(schemas)
    }

    pub fn unregister_schema(&self, name: &str) -> Option<Arc<Schema>> {
        self.schemas.unregister(name)
    }

    pub fn schema(&self, name: &str) -> Result<Arc<Schema>, ConfstoreError> {
        self.schemas.get(name)
    }

    // =========================================================================
    // WRITES
    // =========================================================================

    pub fn create(&self, bean: Bean) -> Result<(), ConfstoreError> {
        self.create_all(vec![bean])
    }

    pub fn create_all(&self, mut beans: Vec<Bean>) -> Result<(), ConfstoreError> {
        prepare_batch(&self.schemas, &mut beans)?;
        // defaults that already exist are skipped by the backend
        let mut fresh = Vec::with_capacity(beans.len());
        for bean in &beans {
            fresh.push(!bean.is_default() || self.manager.get_lazy(bean.id())?.is_none());
        }
        self.manager.create_all(beans.clone())?;
        let changes: Vec<Change> = beans
            .into_iter()
            .zip(fresh)
            .filter(|(_, fresh)| *fresh)
            .map(|(bean, _)| Change::created(bean))
            .collect();
        self.notifications.fire(&changes);
        Ok(())
    }

    pub fn set(&self, bean: Bean) -> Result<(), ConfstoreError> {
        self.set_all(vec![bean])
    }

    pub fn set_all(&self, mut beans: Vec<Bean>) -> Result<(), ConfstoreError> {
        prepare_batch(&self.schemas, &mut beans)?;
        let before = self.snapshot(&beans)?;
        self.manager.set_all(beans)?;
        self.fire_updates(before);
        Ok(())
    }

    pub fn merge(&self, bean: Bean) -> Result<(), ConfstoreError> {
        self.merge_all(vec![bean])
    }

    pub fn merge_all(&self, mut patches: Vec<Bean>) -> Result<(), ConfstoreError> {
        prepare_batch(&self.schemas, &mut patches)?;
        let before = self.snapshot(&patches)?;
        self.manager.merge_all(patches)?;
        self.fire_updates(before);
        Ok(())
    }

    pub fn delete(&self, id: &BeanId) -> Result<Bean, ConfstoreError> {
        let bean = self.manager.delete(id)?;
        self.notifications.fire(&[Change::deleted(bean.clone())]);
        Ok(bean)
    }

    pub fn delete_all(
        &self,
        schema_name: &str,
        instance_ids: &[String],
    ) -> Result<Vec<Bean>, ConfstoreError> {
        let removed = self.manager.delete_all(schema_name, instance_ids)?;
        let changes: Vec<Change> = removed.iter().cloned().map(Change::deleted).collect();
        self.notifications.fire(&changes);
        Ok(removed)
    }

    /// Create the empty instance of a singleton unless it exists.
    pub fn create_singleton(&self, schema_name: &str) -> Result<bool, ConfstoreError> {
        let created = self.manager.create_singleton(schema_name)?;
        if created {
            match self.manager.get_singleton(schema_name) {
                Ok(Some(bean)) => {
                    self.notifications.fire(&[Change::created(bean)]);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(schema = schema_name, error = %e, "cannot read created singleton, not notifying");
                }
            }
        }
        Ok(created)
    }

    /// Store the provider's default instance of every singleton schema that
    /// has none stored yet. Returns how many were created.
    pub fn provision_defaults(&self) -> Result<usize, ConfstoreError> {
        let Some(provider) = &self.defaults else {
            return Ok(0);
        };
        let mut pending = Vec::new();
        for schema in self.schemas.all().iter().filter(|s| s.singleton) {
            let Some(mut bean) = provider.default_instance(schema) else {
                continue;
            };
            if self.manager.get_singleton(&schema.name)?.is_none() {
                bean.set_default(true);
                pending.push(bean);
            }
        }
        let count = pending.len();
        if count > 0 {
            self.create_all(pending)?;
            tracing::info!(count, "provisioned default instances");
        }
        Ok(count)
    }

    fn snapshot(&self, beans: &[Bean]) -> Result<Vec<Bean>, ConfstoreError> {
        beans
            .iter()
            .map(|bean| {
                self.manager
                    .get_lazy(bean.id())?
                    .ok_or_else(|| ConfstoreError::BeanNotFound(bean.id().detached()))
            })
            .collect()
    }

    /// Notify updates of committed beans. Runs after the write, so a failed
    /// read only drops that change.
    fn fire_updates(&self, before: Vec<Bean>) {
        let mut changes = Vec::with_capacity(before.len());
        for old in before {
            match self.manager.get_lazy(old.id()) {
                Ok(Some(new)) => changes.push(Change::updated(old, new)),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(bean = %old.id(), error = %e, "cannot read updated bean, not notifying");
                }
            }
        }
        self.notifications.fire(&changes);
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// Stored bean with references as bare ids.
    pub fn get(&self, id: &BeanId) -> Result<Option<Bean>, ConfstoreError> {
        self.manager.get_lazy(id)
    }

    /// Bean with singleton references resolved, defaults applied.
    pub fn get_eager(&self, id: &BeanId) -> Result<Option<Bean>, ConfstoreError> {
        self.resolver().get_eager(id)
    }

    /// The instance of a singleton schema, stored or default.
    pub fn singleton(&self, schema_name: &str) -> Result<Bean, ConfstoreError> {
        let id = BeanId::singleton(schema_name);
        self.resolver()
            .get_eager(&id)?
            .ok_or(ConfstoreError::BeanNotFound(id))
    }

    /// Every bean of a schema, references attached one level deep.
    pub fn list(&self, schema_name: &str) -> Result<Vec<Bean>, ConfstoreError> {
        self.resolver().list(schema_name)
    }

    /// Deferred reference to a bean.
    #[must_use]
    pub fn lazy(&self, id: BeanId) -> LazyRef {
        LazyRef::new(id, Arc::clone(&self.manager))
    }

    pub fn query(&self, schema_name: &str) -> Result<BeanQuery<'_>, ConfstoreError> {
        Ok(self.manager.new_query(self.schemas.get(schema_name)?))
    }

    fn resolver(&self) -> Resolver<'_, dyn BeanManager> {
        Resolver::new(&self.schemas, self.manager.as_ref()).with_defaults(self.defaults.as_deref())
    }

    // =========================================================================
    // OBSERVERS
    // =========================================================================

    pub fn register_observer(&self, observer: Arc<dyn Observer>) {
        self.notifications.register(observer);
    }
}

// =============================================================================
// TESTS
// =============================================================================
