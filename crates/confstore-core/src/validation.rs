//! # Bean Validation
//!
//! Checks a bean against its schema before any backend sees it, plus the
//! integrity helpers shared by the backends (merge semantics, reference
//! existence, referrer lookup).

use crate::primitives::{MAX_NAME_LENGTH, MAX_VALUES_PER_PROPERTY};
use crate::schema::{map_entry_value, CollectionKind, PropertyKind, Schema, SchemaRegistry};
use crate::{Bean, BeanId, ConfstoreError};
use std::collections::BTreeSet;

/// Validate a bean against a schema.
///
/// - instance id present and within limits, singleton ids equal the schema name
/// - every property and reference is declared, with the right kind
/// - immutable properties carry no value
/// - single-valued fields carry at most one value
/// - every value parses with its declared type
/// - references point at the declared target schema
pub fn validate_bean(bean: &Bean, schema: &Schema) -> Result<(), ConfstoreError> {
    let id = bean.id();
    if id.schema_name() != schema.name {
        return Err(ConfstoreError::InvalidData(format!(
            "{} validated against schema '{}'",
            id, schema.name
        )));
    }
    if id.instance_id().is_empty() {
        return Err(ConfstoreError::InvalidData(format!(
            "bean of schema '{}' has no instance id",
            schema.name
        )));
    }
    if id.instance_id().len() > MAX_NAME_LENGTH {
        return Err(ConfstoreError::InvalidData(format!(
            "instance id of {} exceeds {} bytes",
            schema.name, MAX_NAME_LENGTH
        )));
    }
    if schema.singleton && id.instance_id() != schema.name {
        return Err(ConfstoreError::InvalidData(format!(
            "singleton '{}' cannot have instance id '{}'",
            schema.name,
            id.instance_id()
        )));
    }

    for (name, values) in bean.properties() {
        let property = schema
            .property(name)
            .filter(|p| !p.is_reference())
            .ok_or_else(|| ConfstoreError::PropertyNotInSchema {
                schema: schema.name.clone(),
                property: name.clone(),
            })?;
        if property.id {
            if values.iter().any(|v| v != id.instance_id()) {
                return Err(ConfstoreError::InvalidData(format!(
                    "id property '{}' of {} disagrees with the bean id",
                    name, id
                )));
            }
            continue;
        }
        if property.immutable && !values.is_empty() {
            return Err(ConfstoreError::ImmutableProperty {
                id: id.detached(),
                property: name.clone(),
            });
        }
        check_count(id, name, values.len(), property.is_multi_valued())?;
        let value_type = property.value_type();
        for value in values {
            let element = match &property.kind {
                PropertyKind::Collection {
                    collection: CollectionKind::Map,
                    ..
                } => map_entry_value(value)?,
                _ => value.as_str(),
            };
            if !value_type.accepts(element) {
                return Err(ConfstoreError::WrongPropertyType {
                    id: id.detached(),
                    property: name.clone(),
                    expected: value_type.to_string(),
                    value: value.clone(),
                });
            }
        }
        if property.collection_kind() == Some(CollectionKind::Set) {
            let distinct: BTreeSet<&String> = values.iter().collect();
            if distinct.len() != values.len() {
                return Err(ConfstoreError::InvalidData(format!(
                    "set property '{}' of {} contains duplicates",
                    name, id
                )));
            }
        }
    }

    for (name, targets) in bean.reference_map() {
        let property = schema
            .property(name)
            .filter(|p| p.is_reference())
            .ok_or_else(|| ConfstoreError::ReferenceNotInSchema {
                schema: schema.name.clone(),
                reference: name.clone(),
            })?;
        if property.immutable && !targets.is_empty() {
            return Err(ConfstoreError::ImmutableProperty {
                id: id.detached(),
                property: name.clone(),
            });
        }
        check_count(id, name, targets.len(), property.is_multi_valued())?;
        let expected = property.target_schema().unwrap_or_default();
        for target in targets {
            if target.schema_name() != expected {
                return Err(ConfstoreError::WrongPropertyType {
                    id: id.detached(),
                    property: name.clone(),
                    expected: format!("reference to {}", expected),
                    value: target.to_string(),
                });
            }
        }
    }
    Ok(())
}

fn check_count(
    id: &BeanId,
    name: &str,
    count: usize,
    multi_valued: bool,
) -> Result<(), ConfstoreError> {
    if (!multi_valued && count > 1) || count > MAX_VALUES_PER_PROPERTY {
        return Err(ConfstoreError::WrongMultiplicity {
            id: id.detached(),
            property: name.to_string(),
            count,
        });
    }
    Ok(())
}

/// Attach schemas and validate a whole batch before anything is written.
///
/// Also rejects a batch that names the same bean twice.
pub fn prepare_batch(
    registry: &SchemaRegistry,
    beans: &mut [Bean],
) -> Result<(), ConfstoreError> {
    let mut seen = BTreeSet::new();
    for bean in beans.iter_mut() {
        let schema = registry.get(bean.schema_name())?;
        validate_bean(bean, &schema)?;
        canonicalize(bean, &schema)?;
        bean.attach_schema(schema);
        bean.detach_references();
        if !seen.insert(bean.id().clone()) {
            return Err(ConfstoreError::InvalidData(format!(
                "{} appears twice in one batch",
                bean.id()
            )));
        }
    }
    Ok(())
}

/// Rewrite typed values in canonical form, the form every backend reads back.
fn canonicalize(bean: &mut Bean, schema: &Schema) -> Result<(), ConfstoreError> {
    let mut rewritten = Vec::new();
    for (name, values) in bean.properties() {
        let Some(property) = schema.property(name) else {
            continue;
        };
        if property.id || property.collection_kind() == Some(CollectionKind::Map) {
            continue;
        }
        let value_type = property.value_type();
        let canonical = values
            .iter()
            .map(|v| value_type.parse(v).map(|parsed| parsed.to_canonical()))
            .collect::<Result<Vec<_>, _>>()?;
        if &canonical != values {
            rewritten.push((name.clone(), canonical));
        }
    }
    for (name, values) in rewritten {
        bean.set_property(name, values);
    }
    Ok(())
}

/// Apply a partial update.
///
/// Every field present in `patch` replaces the stored field; an empty value
/// list removes it. Fields absent from `patch` are kept.
pub fn merge_into(target: &mut Bean, patch: &Bean) {
    for (name, values) in patch.properties() {
        if values.is_empty() {
            target.remove(name);
        } else {
            target.set_property(name.clone(), values.clone());
        }
    }
    for (name, refs) in patch.reference_map() {
        if refs.is_empty() {
            target.remove(name);
        } else {
            target.set_references(name.clone(), refs.iter().map(BeanId::detached).collect());
        }
    }
}

/// Fail with `MissingReference` on the first reference that points nowhere.
///
/// `exists` answers for stored beans; members of `batch` count as present.
pub fn check_references<F>(
    beans: &[Bean],
    batch: &BTreeSet<BeanId>,
    mut exists: F,
) -> Result<(), ConfstoreError>
where
    F: FnMut(&BeanId) -> Result<bool, ConfstoreError>,
{
    for bean in beans {
        for target in bean.all_references() {
            if !batch.contains(target) && !exists(target)? {
                return Err(ConfstoreError::MissingReference {
                    id: bean.id().detached(),
                    missing: target.detached(),
                });
            }
        }
    }
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::PropertyDescriptor;
    use crate::types::ValueType;

    fn schema() -> Schema {
        Schema::new("Node")
            .with_property(PropertyDescriptor::id("id"))
            .with_property(PropertyDescriptor::scalar("port", ValueType::Integer))
            .with_property(PropertyDescriptor::list("hosts", ValueType::String))
            .with_property(PropertyDescriptor::collection("zones", ValueType::String, CollectionKind::Set))
            .with_property(PropertyDescriptor::scalar("created", ValueType::Long).immutable())
            .with_property(PropertyDescriptor::reference("parent", "Node"))
    }

    fn node(id: &str) -> Bean {
        Bean::new(BeanId::new("Node", id))
    }

    #[test]
    fn valid_bean_passes() {
        let bean = node("n1")
            .with_property("port", 8080)
            .with_property("hosts", "a")
            .with_property("hosts", "b")
            .with_reference("parent", BeanId::new("Node", "n0"));
        assert!(validate_bean(&bean, &schema()).is_ok());
    }

    #[test]
    fn undeclared_fields_rejected() {
        let bean = node("n1").with_property("colour", "red");
        assert!(matches!(
            validate_bean(&bean, &schema()),
            Err(ConfstoreError::PropertyNotInSchema { .. })
        ));
        let bean = node("n1").with_reference("port", BeanId::new("Node", "x"));
        assert!(matches!(
            validate_bean(&bean, &schema()),
            Err(ConfstoreError::ReferenceNotInSchema { .. })
        ));
    }

    #[test]
    fn type_and_multiplicity_enforced() {
        let bean = node("n1").with_property("port", "http");
        assert!(matches!(
            validate_bean(&bean, &schema()),
            Err(ConfstoreError::WrongPropertyType { .. })
        ));
        let bean = node("n1").with_property("port", 1).with_property("port", 2);
        assert!(matches!(
            validate_bean(&bean, &schema()),
            Err(ConfstoreError::WrongMultiplicity { count: 2, .. })
        ));
        let bean = node("n1").with_reference("parent", BeanId::new("Other", "x"));
        assert!(matches!(
            validate_bean(&bean, &schema()),
            Err(ConfstoreError::WrongPropertyType { .. })
        ));
    }

    #[test]
    fn immutable_rejects_any_value() {
        let bean = node("n1").with_property("created", 1);
        assert!(matches!(
            validate_bean(&bean, &schema()),
            Err(ConfstoreError::ImmutableProperty { .. })
        ));
    }

    #[test]
    fn set_rejects_duplicates() {
        let bean = node("n1").with_property("zones", "eu").with_property("zones", "eu");
        assert!(matches!(
            validate_bean(&bean, &schema()),
            Err(ConfstoreError::InvalidData(_))
        ));
    }

    #[test]
    fn id_rules() {
        assert!(validate_bean(&node(""), &schema()).is_err());
        let bean = node("n1").with_property("id", "n1");
        assert!(validate_bean(&bean, &schema()).is_ok());
        let bean = node("n1").with_property("id", "n2");
        assert!(validate_bean(&bean, &schema()).is_err());

        let settings = Schema::singleton("Settings");
        assert!(validate_bean(&Bean::new(BeanId::singleton("Settings")), &settings).is_ok());
        assert!(validate_bean(&Bean::new(BeanId::new("Settings", "x")), &settings).is_err());
    }

    #[test]
    fn merge_replaces_and_removes() {
        let mut stored = node("n1").with_property("port", 1).with_property("hosts", "a");
        let mut patch = node("n1").with_property("port", 2);
        patch.set_property("hosts", Vec::new());
        merge_into(&mut stored, &patch);
        assert_eq!(stored.single_value("port"), Some("2"));
        assert!(stored.values("hosts").is_none());
    }

    #[test]
    fn batch_members_satisfy_references() {
        let a = node("a").with_reference("parent", BeanId::new("Node", "b"));
        let batch: BTreeSet<BeanId> = [BeanId::new("Node", "a"), BeanId::new("Node", "b")].into();
        assert!(check_references(&[a.clone()], &batch, |_| Ok(false)).is_ok());
        let result = check_references(&[a], &BTreeSet::new(), |_| Ok(false));
        assert!(matches!(result, Err(ConfstoreError::MissingReference { .. })));
    }

    #[test]
    fn duplicate_in_batch_rejected() {
        let registry = SchemaRegistry::new();
        registry.register(schema()).expect("register");
        let mut beans = vec![node("a"), node("a")];
        assert!(matches!(
            prepare_batch(&registry, &mut beans),
            Err(ConfstoreError::InvalidData(_))
        ));
    }
}
