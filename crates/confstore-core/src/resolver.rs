//! # Reference Resolver
//!
//! Turns stored beans, whose references are bare ids, into usable object
//! graphs.
//!
//! - `get_eager` loads a bean and recursively attaches every singleton it
//!   references. Each singleton is fetched at most once per traversal: a
//!   finished one is reused, and a reference back into one still being
//!   resolved is left unresolved.
//! - `list` loads every bean of a schema and attaches non-singleton
//!   references one level deep.
//! - `LazyRef` defers loading to first access and memoizes the result.
//!
//! A singleton that was never stored resolves to a default instance: the
//! host's `DefaultInstanceProvider` if it has one for the schema, otherwise
//! an empty bean with the schema's declared defaults.

use crate::manager::BeanManager;
use crate::schema::{Schema, SchemaRegistry};
use crate::{Bean, BeanId, ConfstoreError};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Host-supplied default instances of singleton schemas.
pub trait DefaultInstanceProvider: Send + Sync {
    /// Default instance of `schema`, or `None` to fall back to schema defaults.
    fn default_instance(&self, schema: &Schema) -> Option<Bean>;
}

/// Provider backed by a fixed map of beans.
#[derive(Debug, Default)]
pub struct StaticDefaults {
    beans: BTreeMap<String, Bean>,
}

impl StaticDefaults {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: register a default for the bean's schema.
    #[must_use]
    pub fn with(mut self, bean: Bean) -> Self {
        self.beans.insert(bean.schema_name().to_string(), bean);
        self
    }
}

impl DefaultInstanceProvider for StaticDefaults {
    fn default_instance(&self, schema: &Schema) -> Option<Bean> {
        self.beans.get(&schema.name).cloned()
    }
}

// =============================================================================
// RESOLVER
// =============================================================================

/// Singleton schemas seen by one eager traversal. Entries are never removed.
#[derive(Debug, Default)]
struct Traversal {
    in_progress: BTreeSet<String>,
    resolved: BTreeMap<String, Arc<Bean>>,
}

impl Traversal {
    fn starting_at(schema: &Schema) -> Self {
        let mut traversal = Self::default();
        traversal.in_progress.insert(schema.name.clone());
        traversal
    }
}

pub struct Resolver<'a, M: BeanManager + ?Sized> {
    schemas: &'a SchemaRegistry,
    manager: &'a M,
    defaults: Option<&'a dyn DefaultInstanceProvider>,
}

impl<M: BeanManager + ?Sized> fmt::Debug for Resolver<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("defaults", &self.defaults.is_some())
            .finish_non_exhaustive()
    }
}

impl<'a, M: BeanManager + ?Sized> Resolver<'a, M> {
    pub fn new(schemas: &'a SchemaRegistry, manager: &'a M) -> Self {
        Self {
            schemas,
            manager,
            defaults: None,
        }
    }

    #[must_use]
    pub fn with_defaults(mut self, defaults: Option<&'a dyn DefaultInstanceProvider>) -> Self {
        self.defaults = defaults;
        self
    }

    /// Load a bean with its singleton references resolved.
    ///
    /// `None` when a non-singleton bean does not exist; singletons always
    /// resolve, falling back to a default instance.
    pub fn get_eager(&self, id: &BeanId) -> Result<Option<Bean>, ConfstoreError> {
        let schema = self.schemas.get(id.schema_name())?;
        let Some(mut bean) = self.fetch(id, &schema)? else {
            return Ok(None);
        };
        let mut traversal = Traversal::starting_at(&schema);
        self.resolve_singletons(&mut bean, &schema, &mut traversal)?;
        Ok(Some(bean))
    }

    /// Every bean of a schema, with singletons resolved and other
    /// references attached one level deep.
    pub fn list(&self, schema_name: &str) -> Result<Vec<Bean>, ConfstoreError> {
        let schema = self.schemas.get(schema_name)?;
        let mut beans = self.manager.list(schema_name)?;

        let mut wanted: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for bean in &beans {
            for property in schema.properties.iter().filter(|p| p.is_reference()) {
                let Some(target) = property.target_schema() else {
                    continue;
                };
                if self.schemas.find(target).is_some_and(|s| s.singleton) {
                    continue;
                }
                for id in bean.references(&property.name).unwrap_or_default() {
                    wanted
                        .entry(id.schema_name().to_string())
                        .or_default()
                        .insert(id.instance_id().to_string());
                }
            }
        }

        let mut loaded: BTreeMap<BeanId, Arc<Bean>> = BTreeMap::new();
        for (target, instances) in wanted {
            let instances: Vec<String> = instances.into_iter().collect();
            for bean in self.manager.list_ids(&target, &instances)? {
                loaded.insert(bean.id().detached(), Arc::new(bean));
            }
        }

        for bean in &mut beans {
            let mut traversal = Traversal::starting_at(&schema);
            self.resolve_singletons(bean, &schema, &mut traversal)?;
            for property in schema.properties.iter().filter(|p| p.is_reference()) {
                let Some(targets) = bean.references_mut(&property.name) else {
                    continue;
                };
                for target in targets.iter_mut().filter(|t| t.bean().is_none()) {
                    if let Some(found) = loaded.get(target) {
                        target.set_bean(Arc::clone(found));
                    }
                }
            }
        }
        Ok(beans)
    }

    fn fetch(&self, id: &BeanId, schema: &Arc<Schema>) -> Result<Option<Bean>, ConfstoreError> {
        if !schema.singleton {
            return self.manager.get_lazy(id);
        }
        if let Some(bean) = self.manager.get_lazy(&BeanId::singleton(schema.name.as_str()))? {
            return Ok(Some(bean));
        }
        let provided = self
            .defaults
            .and_then(|d| d.default_instance(schema))
            .filter(|b| b.id() == &BeanId::singleton(schema.name.as_str()));
        let mut bean = match provided {
            Some(bean) => bean,
            None => Bean::default_instance(schema),
        };
        bean.set_default(true);
        bean.attach_schema(Arc::clone(schema));
        tracing::debug!(schema = %schema.name, "singleton not stored, using default instance");
        Ok(Some(bean))
    }

    fn resolve_singletons(
        &self,
        bean: &mut Bean,
        schema: &Schema,
        traversal: &mut Traversal,
    ) -> Result<(), ConfstoreError> {
        for property in schema.properties.iter().filter(|p| p.is_reference()) {
            let Some(target_name) = property.target_schema() else {
                continue;
            };
            let target = self.schemas.get(target_name)?;
            if !target.singleton {
                continue;
            }
            if bean.references(&property.name).is_none_or(<[BeanId]>::is_empty) {
                bean.set_references(
                    property.name.clone(),
                    vec![BeanId::singleton(target_name)],
                );
            }

            let resolved = if let Some(done) = traversal.resolved.get(target_name) {
                Arc::clone(done)
            } else if traversal.in_progress.contains(target_name) {
                tracing::trace!(
                    bean = %bean.id(),
                    property = %property.name,
                    "singleton still being resolved"
                );
                continue;
            } else {
                let Some(mut fetched) = self.fetch(&BeanId::singleton(target_name), &target)?
                else {
                    continue;
                };
                traversal.in_progress.insert(target.name.clone());
                self.resolve_singletons(&mut fetched, &target, traversal)?;
                let fetched = Arc::new(fetched);
                traversal
                    .resolved
                    .insert(target.name.clone(), Arc::clone(&fetched));
                fetched
            };

            if let Some(refs) = bean.references_mut(&property.name) {
                for id in refs.iter_mut() {
                    id.set_bean(Arc::clone(&resolved));
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// LAZY REFERENCE
// =============================================================================

/// A reference loaded on first access.
///
/// The loaded bean is memoized; a failed load is not, so the next access
/// retries.
pub struct LazyRef {
    id: BeanId,
    manager: Arc<dyn BeanManager>,
    cell: OnceLock<Arc<Bean>>,
}

impl fmt::Debug for LazyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyRef")
            .field("id", &self.id)
            .field("loaded", &self.cell.get().is_some())
            .finish()
    }
}

impl LazyRef {
    pub fn new(id: BeanId, manager: Arc<dyn BeanManager>) -> Self {
        Self {
            id: id.detached(),
            manager,
            cell: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &BeanId {
        &self.id
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.cell.get().is_some()
    }

    /// The referenced bean, loading it eagerly on first call.
    pub fn get(&self) -> Result<Arc<Bean>, ConfstoreError> {
        if let Some(bean) = self.cell.get() {
            return Ok(Arc::clone(bean));
        }
        let bean = self
            .manager
            .get_eager(&self.id)?
            .ok_or_else(|| ConfstoreError::BeanNotFound(self.id.clone()))?;
        Ok(Arc::clone(self.cell.get_or_init(|| Arc::new(bean))))
    }
}

// =============================================================================
// TESTS
// =============================================================================
