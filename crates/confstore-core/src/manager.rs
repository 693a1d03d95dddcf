//! # Bean Manager SPI
//!
//! The contract every storage backend implements. Backends are synchronous
//! and shared: every method takes `&self` and implementations synchronize
//! internally.
//!
//! Contract for the batch writes:
//! - a batch is all-or-nothing
//! - `create_all` fails with `BeanAlreadyExists` for a stored id, except for
//!   beans flagged default, which are silently skipped
//! - `set_all` and `merge_all` fail with `BeanNotFound` for a missing id
//! - every reference must point at a stored bean or a member of the batch
//! - `delete_all` fails with `ReferentialIntegrity` while other beans still
//!   reference a target, and refuses default beans
//!
//! Beans handed to a backend have passed `validation::validate_bean`; the
//! backend re-checks only what depends on stored state.

use crate::query::{BeanQuery, QueryResult, QuerySpec};
use crate::resolver::Resolver;
use crate::schema::{Schema, SchemaRegistry};
use crate::{Bean, BeanId, ConfstoreError};
use std::sync::Arc;

pub trait BeanManager: Send + Sync {
    /// Registry the backend validates and decodes against.
    fn schemas(&self) -> &SchemaRegistry;

    // -------------------------------------------------------------------------
    // writes
    // -------------------------------------------------------------------------

    fn create_all(&self, beans: Vec<Bean>) -> Result<(), ConfstoreError>;

    fn create(&self, bean: Bean) -> Result<(), ConfstoreError> {
        self.create_all(vec![bean])
    }

    /// Create the empty instance of a singleton schema unless one exists.
    ///
    /// Returns whether a bean was created.
    fn create_singleton(&self, schema_name: &str) -> Result<bool, ConfstoreError> {
        let schema = self.schemas().get(schema_name)?;
        if !schema.singleton {
            return Err(ConfstoreError::InvalidData(format!(
                "schema '{}' is not a singleton",
                schema_name
            )));
        }
        if self.get_singleton(schema_name)?.is_some() {
            return Ok(false);
        }
        let mut bean = Bean::new(BeanId::singleton(schema_name));
        bean.attach_schema(schema);
        match self.create(bean) {
            Ok(()) => Ok(true),
            Err(ConfstoreError::BeanAlreadyExists(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Overwrite stored beans completely.
    fn set_all(&self, beans: Vec<Bean>) -> Result<(), ConfstoreError>;

    fn set(&self, bean: Bean) -> Result<(), ConfstoreError> {
        self.set_all(vec![bean])
    }

    /// Apply partial updates; see `validation::merge_into`.
    fn merge_all(&self, beans: Vec<Bean>) -> Result<(), ConfstoreError>;

    fn merge(&self, bean: Bean) -> Result<(), ConfstoreError> {
        self.merge_all(vec![bean])
    }

    /// Delete beans of one schema. Returns the deleted beans.
    fn delete_all(
        &self,
        schema_name: &str,
        instance_ids: &[String],
    ) -> Result<Vec<Bean>, ConfstoreError>;

    fn delete(&self, id: &BeanId) -> Result<Bean, ConfstoreError> {
        self.delete_all(id.schema_name(), &[id.instance_id().to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| ConfstoreError::BeanNotFound(id.detached()))
    }

    // -------------------------------------------------------------------------
    // reads
    // -------------------------------------------------------------------------

    /// Stored bean with unresolved references.
    fn get_lazy(&self, id: &BeanId) -> Result<Option<Bean>, ConfstoreError>;

    /// Bean with singleton references resolved transitively.
    fn get_eager(&self, id: &BeanId) -> Result<Option<Bean>, ConfstoreError> {
        Resolver::new(self.schemas(), self).get_eager(id)
    }

    /// Stored instance of a singleton schema.
    fn get_singleton(&self, schema_name: &str) -> Result<Option<Bean>, ConfstoreError> {
        let schema = self.schemas().get(schema_name)?;
        if !schema.singleton {
            return Err(ConfstoreError::InvalidData(format!(
                "schema '{}' is not a singleton",
                schema_name
            )));
        }
        self.get_lazy(&BeanId::singleton(schema_name))
    }

    /// Every bean of a schema in the backend's stable order.
    fn list(&self, schema_name: &str) -> Result<Vec<Bean>, ConfstoreError>;

    /// The named beans of a schema that exist, in the backend's stable order.
    fn list_ids(
        &self,
        schema_name: &str,
        instance_ids: &[String],
    ) -> Result<Vec<Bean>, ConfstoreError> {
        let mut ids: Vec<&String> = instance_ids.iter().collect();
        ids.sort();
        ids.dedup();
        let mut beans = Vec::with_capacity(ids.len());
        for instance_id in ids {
            if let Some(bean) = self.get_lazy(&BeanId::new(schema_name, instance_id.as_str()))? {
                beans.push(bean);
            }
        }
        Ok(beans)
    }

    // -------------------------------------------------------------------------
    // queries
    // -------------------------------------------------------------------------

    fn new_query(&self, schema: Arc<Schema>) -> BeanQuery<'_>;

    /// Run a checked query spec.
    fn retrieve(&self, query: &QuerySpec) -> Result<QueryResult, ConfstoreError>;
}
