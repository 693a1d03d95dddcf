//! # Core Type Definitions
//!
//! This module contains the data model shared by every other module:
//! - Bean identity (`BeanId`)
//! - Bean instances (`Bean`)
//! - Scalar value types (`ValueType`, `ScalarValue`)
//! - Error types (`ConfstoreError`)
//!
//! ## Value Model
//!
//! A bean stores every property as an ordered list of canonical strings and
//! every reference as an ordered list of `BeanId`s. Single-valued properties
//! are lists of length one. Typing happens against the schema, never inside
//! the bean itself.

mod value;

pub use value::{ScalarValue, ValueType};

use crate::ids::IdCategory;
use crate::schema::{Schema, SchemaRule};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;

// =============================================================================
// BEAN IDENTITY
// =============================================================================

/// Identity of a bean: the schema it belongs to plus an instance id unique
/// within that schema.
///
/// A `BeanId` may carry the bean it points at once the resolver has loaded
/// it. The attached bean is a cache only: equality, ordering and hashing
/// look at the two names and nothing else, and it is never serialized.
#[derive(Clone, Serialize, Deserialize)]
pub struct BeanId {
    schema_name: String,
    instance_id: String,
    #[serde(skip)]
    resolved: Option<Arc<Bean>>,
}

impl BeanId {
    #[must_use]
    pub fn new(schema_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            schema_name: schema_name.into(),
            instance_id: instance_id.into(),
            resolved: None,
        }
    }

    /// Id of the single instance of a singleton schema.
    ///
    /// Singletons use their schema name as instance id.
    #[must_use]
    pub fn singleton(schema_name: impl Into<String>) -> Self {
        let schema_name = schema_name.into();
        Self {
            instance_id: schema_name.clone(),
            schema_name,
            resolved: None,
        }
    }

    #[must_use]
    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// The bean attached by the resolver, if any.
    #[must_use]
    pub fn bean(&self) -> Option<&Arc<Bean>> {
        self.resolved.as_ref()
    }

    pub fn set_bean(&mut self, bean: Arc<Bean>) {
        self.resolved = Some(bean);
    }

    pub fn clear_bean(&mut self) {
        self.resolved = None;
    }

    /// Copy of this id without any attached bean.
    #[must_use]
    pub fn detached(&self) -> Self {
        Self::new(self.schema_name.clone(), self.instance_id.clone())
    }
}

impl PartialEq for BeanId {
    fn eq(&self, other: &Self) -> bool {
        self.schema_name == other.schema_name && self.instance_id == other.instance_id
    }
}

impl Eq for BeanId {}

impl PartialOrd for BeanId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BeanId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.schema_name
            .cmp(&other.schema_name)
            .then_with(|| self.instance_id.cmp(&other.instance_id))
    }
}

impl Hash for BeanId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.schema_name.hash(state);
        self.instance_id.hash(state);
    }
}

impl fmt::Debug for BeanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeanId")
            .field("schema_name", &self.schema_name)
            .field("instance_id", &self.instance_id)
            .field("resolved", &self.resolved.is_some())
            .finish()
    }
}

impl fmt::Display for BeanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.instance_id, self.schema_name)
    }
}

// =============================================================================
// BEAN
// =============================================================================

/// A configuration instance.
///
/// Properties and references are kept in `BTreeMap`s so iteration order,
/// and therefore every derived output, is deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bean {
    id: BeanId,
    #[serde(skip)]
    schema: Option<Arc<Schema>>,
    #[serde(default)]
    properties: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    references: BTreeMap<String, Vec<BeanId>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    default: bool,
}

impl Bean {
    #[must_use]
    pub fn new(id: BeanId) -> Self {
        Self {
            id,
            schema: None,
            properties: BTreeMap::new(),
            references: BTreeMap::new(),
            default: false,
        }
    }

    /// Empty default instance of a schema with its declared defaults applied.
    ///
    /// The result is flagged as a default bean. Singleton schemas get their
    /// singleton id; other schemas get an empty instance id that the caller
    /// is expected to replace.
    #[must_use]
    pub fn default_instance(schema: &Arc<Schema>) -> Self {
        let id = if schema.singleton {
            BeanId::singleton(schema.name.clone())
        } else {
            BeanId::new(schema.name.clone(), String::new())
        };
        let mut bean = Self::new(id);
        for property in schema.properties.iter().filter(|p| !p.id && !p.is_reference()) {
            let defaults = property.defaults();
            if !defaults.is_empty() {
                bean.properties.insert(property.name.clone(), defaults);
            }
        }
        bean.schema = Some(Arc::clone(schema));
        bean.default = true;
        bean
    }

    /// Builder: append a value to a property.
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.add_property(name, value);
        self
    }

    /// Builder: append a reference.
    #[must_use]
    pub fn with_reference(mut self, name: impl Into<String>, id: BeanId) -> Self {
        self.add_reference(name, id);
        self
    }

    #[must_use]
    pub fn id(&self) -> &BeanId {
        &self.id
    }

    #[must_use]
    pub fn schema_name(&self) -> &str {
        self.id.schema_name()
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        self.id.instance_id()
    }

    #[must_use]
    pub fn schema(&self) -> Option<&Arc<Schema>> {
        self.schema.as_ref()
    }

    pub fn attach_schema(&mut self, schema: Arc<Schema>) {
        self.schema = Some(schema);
    }

    /// The attached schema, or `SchemaNotFound` when none is attached.
    pub fn require_schema(&self) -> Result<&Arc<Schema>, ConfstoreError> {
        self.schema
            .as_ref()
            .ok_or_else(|| ConfstoreError::SchemaNotFound(self.id.schema_name().to_string()))
    }

    #[must_use]
    pub fn is_default(&self) -> bool {
        self.default
    }

    pub fn set_default(&mut self, default: bool) {
        self.default = default;
    }

    // -------------------------------------------------------------------------
    // properties
    // -------------------------------------------------------------------------

    pub fn add_property(&mut self, name: impl Into<String>, value: impl ToString) {
        self.properties
            .entry(name.into())
            .or_default()
            .push(value.to_string());
    }

    /// Replace all values of a property.
    pub fn set_property(&mut self, name: impl Into<String>, values: Vec<String>) {
        self.properties.insert(name.into(), values);
    }

    #[must_use]
    pub fn values(&self, name: &str) -> Option<&[String]> {
        self.properties.get(name).map(Vec::as_slice)
    }

    /// First value of a property.
    #[must_use]
    pub fn single_value(&self, name: &str) -> Option<&str> {
        self.properties
            .get(name)
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    #[must_use]
    pub fn properties(&self) -> &BTreeMap<String, Vec<String>> {
        &self.properties
    }

    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }

    // -------------------------------------------------------------------------
    // references
    // -------------------------------------------------------------------------

    pub fn add_reference(&mut self, name: impl Into<String>, id: BeanId) {
        self.references.entry(name.into()).or_default().push(id);
    }

    pub fn set_references(&mut self, name: impl Into<String>, ids: Vec<BeanId>) {
        self.references.insert(name.into(), ids);
    }

    #[must_use]
    pub fn references(&self, name: &str) -> Option<&[BeanId]> {
        self.references.get(name).map(Vec::as_slice)
    }

    pub fn references_mut(&mut self, name: &str) -> Option<&mut Vec<BeanId>> {
        self.references.get_mut(name)
    }

    #[must_use]
    pub fn first_reference(&self, name: &str) -> Option<&BeanId> {
        self.references.get(name).and_then(|r| r.first())
    }

    #[must_use]
    pub fn reference_map(&self) -> &BTreeMap<String, Vec<BeanId>> {
        &self.references
    }

    pub fn reference_names(&self) -> impl Iterator<Item = &str> {
        self.references.keys().map(String::as_str)
    }

    /// Every outgoing reference, in property order.
    pub fn all_references(&self) -> impl Iterator<Item = &BeanId> {
        self.references.values().flatten()
    }

    /// Whether any reference of this bean points at `target`.
    #[must_use]
    pub fn refers_to(&self, target: &BeanId) -> bool {
        self.all_references().any(|r| r == target)
    }

    /// Drop every bean attached to outgoing references.
    pub fn detach_references(&mut self) {
        for id in self.references.values_mut().flatten() {
            id.clear_bean();
        }
    }

    // -------------------------------------------------------------------------
    // whole-bean edits
    // -------------------------------------------------------------------------

    /// Remove a property or reference by name. Returns true if anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let property = self.properties.remove(name).is_some();
        let reference = self.references.remove(name).is_some();
        property || reference
    }

    pub fn clear(&mut self) {
        self.properties.clear();
        self.references.clear();
    }

    /// Names of every property and reference carried by this bean.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.property_names().chain(self.reference_names())
    }
}

impl PartialEq for Bean {
    /// Compares identity and stored state; attached schemas and resolved
    /// beans are ignored.
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.properties == other.properties
            && self.references == other.references
            && self.default == other.default
    }
}

impl Eq for Bean {}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur anywhere in the store.
///
/// - No silent failures
/// - Use `Result<T, ConfstoreError>` for fallible operations
/// - Backends map their native errors into `Storage` / `Serialization`
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfstoreError {
    /// A schema violates a structural rule.
    #[error("Schema validation failed ({rule}) at '{field}'")]
    SchemaValidation { rule: SchemaRule, field: String },

    /// No schema is registered under the given name.
    #[error("Schema not found: {0}")]
    SchemaNotFound(String),

    /// A bean with this id already exists.
    #[error("Bean already exists: {0}")]
    BeanAlreadyExists(BeanId),

    /// The requested bean does not exist.
    #[error("Bean not found: {0}")]
    BeanNotFound(BeanId),

    /// A numeric id has no registered name.
    #[error("Unknown {category} id: {id}")]
    UnknownId { category: IdCategory, id: u64 },

    /// A delete was refused because other beans still reference the target.
    #[error("{id} is still referenced by {}", format_ids(referenced_by))]
    ReferentialIntegrity {
        id: BeanId,
        referenced_by: Vec<BeanId>,
    },

    /// A write tried to assign an immutable property.
    #[error("Property '{property}' of {id} is immutable")]
    ImmutableProperty { id: BeanId, property: String },

    /// Stored state changed between read and write of an update.
    #[error("Concurrent modification of {0}")]
    ModificationConflict(BeanId),

    /// The input is malformed.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// A restriction cannot be evaluated by this backend.
    #[error("Unsupported restriction: {0}")]
    UnsupportedRestriction(String),

    /// A value does not parse as the declared type.
    #[error("Property '{property}' of {id} expects {expected}, got '{value}'")]
    WrongPropertyType {
        id: BeanId,
        property: String,
        expected: String,
        value: String,
    },

    /// A single-valued property or reference was given several values.
    #[error("Property '{property}' of {id} is single-valued but has {count} values")]
    WrongMultiplicity {
        id: BeanId,
        property: String,
        count: usize,
    },

    /// The bean carries a property its schema does not declare.
    #[error("Property '{property}' is not declared by schema '{schema}'")]
    PropertyNotInSchema { schema: String, property: String },

    /// The bean carries a reference its schema does not declare.
    #[error("Reference '{reference}' is not declared by schema '{schema}'")]
    ReferenceNotInSchema { schema: String, reference: String },

    /// A reference points at a bean that neither exists nor is part of the batch.
    #[error("{id} references missing bean {missing}")]
    MissingReference { id: BeanId, missing: BeanId },

    /// Backend I/O or transaction failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Encoding or decoding failure.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

fn format_ids(ids: &[BeanId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bean_id_equality_ignores_attached_bean() {
        let mut a = BeanId::new("Parent", "p1");
        let b = BeanId::new("Parent", "p1");
        a.set_bean(Arc::new(Bean::new(b.clone())));
        assert_eq!(a, b);
        assert!(a.bean().is_some());
        assert!(a.detached().bean().is_none());
    }

    #[test]
    fn bean_id_orders_by_schema_then_instance() {
        let mut ids = vec![
            BeanId::new("B", "a"),
            BeanId::new("A", "z"),
            BeanId::new("A", "b"),
        ];
        ids.sort();
        assert_eq!(ids[0], BeanId::new("A", "b"));
        assert_eq!(ids[2], BeanId::new("B", "a"));
    }

    #[test]
    fn singleton_id_uses_schema_name() {
        let id = BeanId::singleton("Settings");
        assert_eq!(id.instance_id(), "Settings");
        assert_eq!(id.to_string(), "Settings@Settings");
    }

    #[test]
    fn bean_values_are_ordered_lists() {
        let bean = Bean::new(BeanId::new("S", "i"))
            .with_property("list", "b")
            .with_property("list", "a")
            .with_property("single", 7);
        assert_eq!(bean.values("list"), Some(&["b".to_string(), "a".to_string()][..]));
        assert_eq!(bean.single_value("single"), Some("7"));
        assert_eq!(bean.single_value("missing"), None);
    }

    #[test]
    fn remove_clears_property_and_reference() {
        let mut bean = Bean::new(BeanId::new("S", "i"))
            .with_property("a", "1")
            .with_reference("r", BeanId::new("T", "t"));
        assert!(bean.remove("a"));
        assert!(bean.remove("r"));
        assert!(!bean.remove("a"));
        assert_eq!(bean.field_names().count(), 0);
    }

    #[test]
    fn refers_to_scans_every_reference() {
        let target = BeanId::new("T", "t2");
        let bean = Bean::new(BeanId::new("S", "i"))
            .with_reference("one", BeanId::new("T", "t1"))
            .with_reference("many", target.clone());
        assert!(bean.refers_to(&target));
        assert!(!bean.refers_to(&BeanId::new("T", "t3")));
    }

    #[test]
    fn missing_schema_is_reported() {
        let bean = Bean::new(BeanId::new("Nope", "i"));
        assert_eq!(
            bean.require_schema().err(),
            Some(ConfstoreError::SchemaNotFound("Nope".to_string()))
        );
    }

    #[test]
    fn referential_error_lists_referrers() {
        let err = ConfstoreError::ReferentialIntegrity {
            id: BeanId::new("T", "t"),
            referenced_by: vec![BeanId::new("S", "a"), BeanId::new("S", "b")],
        };
        assert_eq!(err.to_string(), "t@T is still referenced by a@S, b@S");
    }
}
