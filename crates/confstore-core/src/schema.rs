//! # Schemas
//!
//! A `Schema` is the declared shape of one kind of configuration bean:
//! its name, whether it is a singleton, and an ordered list of property
//! descriptors. Schemas are plain data so they can be loaded from files
//! (`[[schema]]` tables in TOML) as well as built in code.
//!
//! `SchemaRegistry` owns every registered schema. Registration validates
//! the schema structurally and replaces any previous version atomically:
//! readers observe either the old or the new schema, never a partial one.

use crate::types::ValueType;
use crate::ConfstoreError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

// =============================================================================
// SCHEMA RULES
// =============================================================================

/// Structural rules a schema must satisfy to be registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchemaRule {
    /// Schema or property name is empty.
    EmptyName,
    /// A non-singleton schema declares no id property.
    MissingId,
    /// More than one property is flagged as id.
    MultipleIds,
    /// A singleton schema declares an id property.
    SingletonWithId,
    /// The id property is not a single string.
    IdNotString,
    /// Transient or static final fields cannot be stored.
    IllegalModifiers,
    /// Two properties share a name.
    DuplicateProperty,
    /// A reference targets a schema that is not registered.
    UnknownReferenceTarget,
}

impl fmt::Display for SchemaRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::EmptyName => "empty name",
            Self::MissingId => "missing id property",
            Self::MultipleIds => "multiple id properties",
            Self::SingletonWithId => "singleton declares an id",
            Self::IdNotString => "id property is not a string",
            Self::IllegalModifiers => "illegal field modifiers",
            Self::DuplicateProperty => "duplicate property",
            Self::UnknownReferenceTarget => "unknown reference target",
        };
        f.write_str(name)
    }
}

fn violation(rule: SchemaRule, field: impl Into<String>) -> ConfstoreError {
    ConfstoreError::SchemaValidation {
        rule,
        field: field.into(),
    }
}

// =============================================================================
// PROPERTY DESCRIPTORS
// =============================================================================

/// How a collection property treats its values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    /// Ordered, duplicates allowed.
    List,
    /// Ordered as written, duplicates rejected.
    Set,
    /// Entries written as `key=value`; the value part has the element type.
    Map,
}

/// The storage shape of a property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PropertyKind {
    Scalar {
        value_type: ValueType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
    Collection {
        value_type: ValueType,
        collection: CollectionKind,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        defaults: Vec<String>,
    },
    Reference {
        schema: String,
    },
    ReferenceList {
        schema: String,
    },
    ReferenceMap {
        schema: String,
    },
}

/// Field modifiers carried over from the declaring type.
///
/// Only used to reject fields that cannot be stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldModifiers {
    #[serde(default)]
    pub transient: bool,
    #[serde(default, rename = "static")]
    pub is_static: bool,
    #[serde(default, rename = "final")]
    pub is_final: bool,
}

/// One declared property of a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    pub name: String,
    #[serde(flatten)]
    pub kind: PropertyKind,
    #[serde(default)]
    pub id: bool,
    #[serde(default)]
    pub immutable: bool,
    #[serde(default)]
    pub indexed: bool,
    #[serde(default)]
    pub modifiers: FieldModifiers,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl PropertyDescriptor {
    fn with_kind(name: impl Into<String>, kind: PropertyKind) -> Self {
        Self {
            name: name.into(),
            kind,
            id: false,
            immutable: false,
            indexed: false,
            modifiers: FieldModifiers::default(),
            description: String::new(),
        }
    }

    /// String identity property.
    #[must_use]
    pub fn id(name: impl Into<String>) -> Self {
        let mut descriptor = Self::scalar(name, ValueType::String);
        descriptor.id = true;
        descriptor
    }

    #[must_use]
    pub fn scalar(name: impl Into<String>, value_type: ValueType) -> Self {
        Self::with_kind(
            name,
            PropertyKind::Scalar {
                value_type,
                default: None,
            },
        )
    }

    #[must_use]
    pub fn collection(
        name: impl Into<String>,
        value_type: ValueType,
        collection: CollectionKind,
    ) -> Self {
        Self::with_kind(
            name,
            PropertyKind::Collection {
                value_type,
                collection,
                defaults: Vec::new(),
            },
        )
    }

    #[must_use]
    pub fn list(name: impl Into<String>, value_type: ValueType) -> Self {
        Self::collection(name, value_type, CollectionKind::List)
    }

    #[must_use]
    pub fn reference(name: impl Into<String>, schema: impl Into<String>) -> Self {
        Self::with_kind(
            name,
            PropertyKind::Reference {
                schema: schema.into(),
            },
        )
    }

    #[must_use]
    pub fn reference_list(name: impl Into<String>, schema: impl Into<String>) -> Self {
        Self::with_kind(
            name,
            PropertyKind::ReferenceList {
                schema: schema.into(),
            },
        )
    }

    #[must_use]
    pub fn reference_map(name: impl Into<String>, schema: impl Into<String>) -> Self {
        Self::with_kind(
            name,
            PropertyKind::ReferenceMap {
                schema: schema.into(),
            },
        )
    }

    #[must_use]
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    #[must_use]
    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }

    #[must_use]
    pub fn with_modifiers(mut self, modifiers: FieldModifiers) -> Self {
        self.modifiers = modifiers;
        self
    }

    /// Declared default values. A scalar default applies to scalars, the
    /// defaults list to collections.
    #[must_use]
    pub fn with_defaults<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: ToString,
    {
        let values: Vec<String> = values.into_iter().map(|v| v.to_string()).collect();
        match &mut self.kind {
            PropertyKind::Scalar { default, .. } => *default = values.into_iter().next(),
            PropertyKind::Collection { defaults, .. } => *defaults = values,
            _ => {}
        }
        self
    }

    /// Whether the property holds references rather than values.
    #[must_use]
    pub fn is_reference(&self) -> bool {
        matches!(
            self.kind,
            PropertyKind::Reference { .. }
                | PropertyKind::ReferenceList { .. }
                | PropertyKind::ReferenceMap { .. }
        )
    }

    /// Whether more than one value or reference is allowed.
    #[must_use]
    pub fn is_multi_valued(&self) -> bool {
        matches!(
            self.kind,
            PropertyKind::Collection { .. }
                | PropertyKind::ReferenceList { .. }
                | PropertyKind::ReferenceMap { .. }
        )
    }

    /// Element type. References compare by instance id, i.e. as strings.
    #[must_use]
    pub fn value_type(&self) -> ValueType {
        match &self.kind {
            PropertyKind::Scalar { value_type, .. }
            | PropertyKind::Collection { value_type, .. } => *value_type,
            _ => ValueType::String,
        }
    }

    #[must_use]
    pub fn collection_kind(&self) -> Option<CollectionKind> {
        match &self.kind {
            PropertyKind::Collection { collection, .. } => Some(*collection),
            _ => None,
        }
    }

    /// Schema name a reference property points at.
    #[must_use]
    pub fn target_schema(&self) -> Option<&str> {
        match &self.kind {
            PropertyKind::Reference { schema }
            | PropertyKind::ReferenceList { schema }
            | PropertyKind::ReferenceMap { schema } => Some(schema),
            _ => None,
        }
    }

    #[must_use]
    pub fn defaults(&self) -> Vec<String> {
        match &self.kind {
            PropertyKind::Scalar { default, .. } => default.iter().cloned().collect(),
            PropertyKind::Collection { defaults, .. } => defaults.clone(),
            _ => Vec::new(),
        }
    }

    fn check(&self) -> Result<(), ConfstoreError> {
        if self.name.trim().is_empty() {
            return Err(violation(SchemaRule::EmptyName, "<property>"));
        }
        if self.modifiers.transient || (self.modifiers.is_static && self.modifiers.is_final) {
            return Err(violation(SchemaRule::IllegalModifiers, &self.name));
        }
        if self.id
            && !matches!(
                self.kind,
                PropertyKind::Scalar {
                    value_type: ValueType::String,
                    ..
                }
            )
        {
            return Err(violation(SchemaRule::IdNotString, &self.name));
        }
        for value in self.defaults() {
            let element = match self.collection_kind() {
                Some(CollectionKind::Map) => map_entry_value(&value)?,
                _ => value.as_str(),
            };
            if !self.value_type().accepts(element) {
                return Err(ConfstoreError::InvalidData(format!(
                    "default '{}' of property '{}' is not a valid {}",
                    value,
                    self.name,
                    self.value_type()
                )));
            }
        }
        Ok(())
    }
}

/// Value part of a `key=value` map entry.
pub(crate) fn map_entry_value(entry: &str) -> Result<&str, ConfstoreError> {
    entry
        .split_once('=')
        .map(|(_, value)| value)
        .ok_or_else(|| ConfstoreError::InvalidData(format!("map entry '{}' is not key=value", entry)))
}

// =============================================================================
// SCHEMA
// =============================================================================

/// Declared shape of a bean type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    #[serde(default)]
    pub singleton: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, rename = "property")]
    pub properties: Vec<PropertyDescriptor>,
}

impl Schema {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            singleton: false,
            description: String::new(),
            properties: Vec::new(),
        }
    }

    #[must_use]
    pub fn singleton(name: impl Into<String>) -> Self {
        let mut schema = Self::new(name);
        schema.singleton = true;
        schema
    }

    /// Builder: append a property descriptor.
    #[must_use]
    pub fn with_property(mut self, property: PropertyDescriptor) -> Self {
        self.properties.push(property);
        self
    }

    #[must_use]
    pub fn property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.name == name)
    }

    #[must_use]
    pub fn id_property(&self) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.id)
    }

    /// Whether `name` is a declared value (non-reference, non-id) property.
    #[must_use]
    pub fn is_property(&self, name: &str) -> bool {
        self.property(name)
            .is_some_and(|p| !p.id && !p.is_reference())
    }

    #[must_use]
    pub fn is_reference(&self, name: &str) -> bool {
        self.property(name).is_some_and(PropertyDescriptor::is_reference)
    }

    /// Target schema of a declared reference.
    #[must_use]
    pub fn reference_schema(&self, name: &str) -> Option<&str> {
        self.property(name).and_then(PropertyDescriptor::target_schema)
    }

    /// Properties eligible for restriction queries.
    pub fn indexed(&self) -> impl Iterator<Item = &PropertyDescriptor> {
        self.properties.iter().filter(|p| p.indexed)
    }

    /// Properties whose values may never be written.
    pub fn immutable(&self) -> impl Iterator<Item = &PropertyDescriptor> {
        self.properties.iter().filter(|p| p.immutable)
    }

    /// Names of every schema referenced by this one.
    #[must_use]
    pub fn referenced_schemas(&self) -> BTreeSet<&str> {
        self.properties
            .iter()
            .filter_map(PropertyDescriptor::target_schema)
            .collect()
    }

    /// Structural validation.
    ///
    /// Reference targets are not checked here; see `SchemaRegistry::register_all`.
    pub fn validate(&self) -> Result<(), ConfstoreError> {
        if self.name.trim().is_empty() {
            return Err(violation(SchemaRule::EmptyName, "<schema>"));
        }
        let mut seen = BTreeSet::new();
        for property in &self.properties {
            property.check()?;
            if !seen.insert(property.name.as_str()) {
                return Err(violation(
                    SchemaRule::DuplicateProperty,
                    format!("{}.{}", self.name, property.name),
                ));
            }
        }
        let ids: Vec<&PropertyDescriptor> = self.properties.iter().filter(|p| p.id).collect();
        match (self.singleton, ids.as_slice()) {
            (true, [first, ..]) => Err(violation(
                SchemaRule::SingletonWithId,
                format!("{}.{}", self.name, first.name),
            )),
            (true, []) | (false, [_]) => Ok(()),
            (false, []) => Err(violation(SchemaRule::MissingId, &self.name)),
            (false, [_, second, ..]) => Err(violation(
                SchemaRule::MultipleIds,
                format!("{}.{}", self.name, second.name),
            )),
        }
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Thread-safe registry of validated schemas, keyed by name.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: RwLock<BTreeMap<String, Arc<Schema>>>,
}

impl SchemaRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a schema, replacing any previous version.
    pub fn register(&self, schema: Schema) -> Result<Arc<Schema>, ConfstoreError> {
        schema.validate()?;
        let schema = Arc::new(schema);
        let previous = self
            .schemas
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(schema.name.clone(), Arc::clone(&schema));
        tracing::info!(
            schema = %schema.name,
            replaced = previous.is_some(),
            "registered schema"
        );
        Ok(schema)
    }

    /// Register a set of schemas at once.
    ///
    /// Every schema is validated and every reference target must resolve
    /// either within the set or among already registered schemas. Nothing is
    /// registered unless all of them pass.
    pub fn register_all(
        &self,
        schemas: Vec<Schema>,
    ) -> Result<Vec<Arc<Schema>>, ConfstoreError> {
        for schema in &schemas {
            schema.validate()?;
        }
        let mut guard = self.schemas.write().unwrap_or_else(PoisonError::into_inner);
        let incoming: BTreeSet<&str> = schemas.iter().map(|s| s.name.as_str()).collect();
        for schema in &schemas {
            for property in &schema.properties {
                if let Some(target) = property.target_schema()
                    && !incoming.contains(target)
                    && !guard.contains_key(target)
                {
                    return Err(violation(
                        SchemaRule::UnknownReferenceTarget,
                        format!("{}.{}", schema.name, property.name),
                    ));
                }
            }
        }
        let registered: Vec<Arc<Schema>> = schemas.into_iter().map(Arc::new).collect();
        for schema in &registered {
            guard.insert(schema.name.clone(), Arc::clone(schema));
        }
        tracing::info!(count = registered.len(), "registered schema set");
        Ok(registered)
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<Schema>> {
        let removed = self
            .schemas
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        if removed.is_some() {
            tracing::info!(schema = name, "unregistered schema");
        }
        removed
    }

    /// Schema by name, or `SchemaNotFound`.
    pub fn get(&self, name: &str) -> Result<Arc<Schema>, ConfstoreError> {
        self.find(name)
            .ok_or_else(|| ConfstoreError::SchemaNotFound(name.to_string()))
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<Arc<Schema>> {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Registered schema names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Snapshot of every registered schema, sorted by name.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Schema>> {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Indexed property descriptors of a schema.
    pub fn get_indexed(&self, name: &str) -> Result<Vec<PropertyDescriptor>, ConfstoreError> {
        Ok(self.get(name)?.indexed().cloned().collect())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_of(result: Result<(), ConfstoreError>) -> Option<SchemaRule> {
        match result {
            Err(ConfstoreError::SchemaValidation { rule, .. }) => Some(rule),
            _ => None,
        }
    }

    fn parent() -> Schema {
        Schema::new("Parent")
            .with_property(PropertyDescriptor::id("id"))
            .with_property(PropertyDescriptor::scalar("name", ValueType::String).indexed())
    }

    #[test]
    fn valid_schema_passes() {
        assert!(parent().validate().is_ok());
        assert!(Schema::singleton("Settings").validate().is_ok());
    }

    #[test]
    fn empty_name_rejected() {
        assert_eq!(rule_of(Schema::new("").validate()), Some(SchemaRule::EmptyName));
        let schema = parent().with_property(PropertyDescriptor::scalar("", ValueType::Long));
        assert_eq!(rule_of(schema.validate()), Some(SchemaRule::EmptyName));
    }

    #[test]
    fn id_rules() {
        let missing = Schema::new("S").with_property(PropertyDescriptor::scalar("a", ValueType::Long));
        assert_eq!(rule_of(missing.validate()), Some(SchemaRule::MissingId));

        let multiple = parent().with_property(PropertyDescriptor::id("other"));
        assert_eq!(rule_of(multiple.validate()), Some(SchemaRule::MultipleIds));

        let singleton = Schema::singleton("S").with_property(PropertyDescriptor::id("id"));
        assert_eq!(rule_of(singleton.validate()), Some(SchemaRule::SingletonWithId));

        let mut numeric = PropertyDescriptor::scalar("id", ValueType::Long);
        numeric.id = true;
        let schema = Schema::new("S").with_property(numeric);
        assert_eq!(rule_of(schema.validate()), Some(SchemaRule::IdNotString));
    }

    #[test]
    fn modifiers_and_duplicates() {
        let transient = parent().with_property(
            PropertyDescriptor::scalar("t", ValueType::Long).with_modifiers(FieldModifiers {
                transient: true,
                ..FieldModifiers::default()
            }),
        );
        assert_eq!(rule_of(transient.validate()), Some(SchemaRule::IllegalModifiers));

        let static_only = parent().with_property(
            PropertyDescriptor::scalar("s", ValueType::Long).with_modifiers(FieldModifiers {
                is_static: true,
                ..FieldModifiers::default()
            }),
        );
        assert!(static_only.validate().is_ok());

        let duplicate = parent().with_property(PropertyDescriptor::scalar("name", ValueType::Long));
        assert_eq!(rule_of(duplicate.validate()), Some(SchemaRule::DuplicateProperty));
    }

    #[test]
    fn invalid_default_rejected() {
        let schema = parent().with_property(
            PropertyDescriptor::scalar("n", ValueType::Integer).with_defaults(["x"]),
        );
        assert!(matches!(schema.validate(), Err(ConfstoreError::InvalidData(_))));
    }

    #[test]
    fn registry_replaces_and_unregisters() {
        let registry = SchemaRegistry::new();
        registry.register(parent()).expect("register");
        let updated = parent().with_property(PropertyDescriptor::scalar("extra", ValueType::Long));
        registry.register(updated).expect("replace");
        assert_eq!(registry.len(), 1);
        assert!(registry.get("Parent").expect("get").property("extra").is_some());
        assert!(registry.unregister("Parent").is_some());
        assert_eq!(
            registry.get("Parent").err(),
            Some(ConfstoreError::SchemaNotFound("Parent".to_string()))
        );
    }

    #[test]
    fn register_all_checks_reference_targets() {
        let registry = SchemaRegistry::new();
        let child = Schema::new("Child")
            .with_property(PropertyDescriptor::id("id"))
            .with_property(PropertyDescriptor::reference("parent", "Parent"));

        let err = registry.register_all(vec![child.clone()]).err();
        assert!(matches!(
            err,
            Some(ConfstoreError::SchemaValidation {
                rule: SchemaRule::UnknownReferenceTarget,
                ..
            })
        ));
        assert!(registry.is_empty());

        registry.register_all(vec![child, parent()]).expect("register set");
        assert_eq!(registry.names(), vec!["Child".to_string(), "Parent".to_string()]);
    }

    #[test]
    fn indexed_properties_listed() {
        let registry = SchemaRegistry::new();
        registry.register(parent()).expect("register");
        let indexed = registry.get_indexed("Parent").expect("indexed");
        assert_eq!(indexed.len(), 1);
        assert_eq!(indexed[0].name, "name");
    }

    mod logging {
        use super::*;
        use std::sync::{Arc, Mutex};
        use tracing::field::{Field, Visit};
        use tracing::{Event, Level, Subscriber};
        use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
        use tracing_subscriber::registry::Registry;

        type Events = Arc<Mutex<Vec<(Level, String)>>>;

        struct CaptureLayer {
            events: Events,
        }

        #[derive(Default)]
        struct MessageVisitor {
            message: String,
        }

        impl Visit for MessageVisitor {
            fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
                if field.name() == "message" {
                    self.message = format!("{:?}", value);
                }
            }
        }

        impl<S: Subscriber> Layer<S> for CaptureLayer {
            fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
                let mut visitor = MessageVisitor::default();
                event.record(&mut visitor);
                self.events
                    .lock()
                    .expect("events lock")
                    .push((*event.metadata().level(), visitor.message));
            }
        }

        fn level_of(events: &Events, message: &str) -> Option<Level> {
            events
                .lock()
                .expect("events lock")
                .iter()
                .find(|(_, m)| m == message)
                .map(|(level, _)| *level)
        }

        #[test]
        fn registry_changes_log_at_info() {
            let events: Events = Arc::new(Mutex::new(Vec::new()));
            let subscriber = Registry::default().with(CaptureLayer {
                events: Arc::clone(&events),
            });

            tracing::dispatcher::with_default(&tracing::Dispatch::new(subscriber), || {
                let registry = SchemaRegistry::new();
                registry.register(parent()).expect("register");
                registry
                    .register_all(vec![Schema::singleton("Settings")])
                    .expect("register all");
                assert!(registry.unregister("Parent").is_some());
            });

            assert_eq!(level_of(&events, "registered schema"), Some(Level::INFO));
            assert_eq!(level_of(&events, "registered schema set"), Some(Level::INFO));
            assert_eq!(level_of(&events, "unregistered schema"), Some(Level::INFO));
        }
    }
}
