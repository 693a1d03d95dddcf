//! # Bean Codec
//!
//! Compact, schema-evolution-tolerant binary form of a bean.
//!
//! ## Layout
//!
//! An encoded bean is a sequence of records, one per stored property, in
//! ascending property-id order:
//!
//! ```text
//! [property id: varint] [type tag: u8] [payload]
//! ```
//!
//! - Integers use postcard's varint (LEB128, zig-zag for signed types).
//! - The tag's low seven bits name the element type, the high bit marks a list.
//! - A reference payload is `(schema id, instance id)`, both varints.
//! - The bean's own id, and therefore its schema, is not part of the payload.
//!
//! ## Evolution
//!
//! Decoding looks every property id up by name in the current schema.
//! Records whose property was removed, or whose tag no longer matches the
//! declared kind, are skipped; new properties simply decode as absent.

use crate::ids::{IdCategory, UniqueIdStore};
use crate::primitives::{
    LIST_TAG_FLAG, MAX_ENCODED_BEAN_SIZE, TAG_BOOLEAN, TAG_BYTE, TAG_DOUBLE, TAG_FLOAT,
    TAG_INTEGER, TAG_LONG, TAG_REFERENCE, TAG_SHORT, TAG_STRING,
};
use crate::schema::{CollectionKind, PropertyDescriptor, PropertyKind, Schema};
use crate::types::{ScalarValue, ValueType};
use crate::{Bean, BeanId, ConfstoreError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// TYPE TAGS
// =============================================================================

/// Element type carried by a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    Value(ValueType),
    Reference,
}

impl ElementType {
    const fn code(self) -> u8 {
        match self {
            Self::Value(ValueType::Byte) => TAG_BYTE,
            Self::Value(ValueType::Short) => TAG_SHORT,
            Self::Value(ValueType::Integer) => TAG_INTEGER,
            Self::Value(ValueType::Long) => TAG_LONG,
            Self::Value(ValueType::Float) => TAG_FLOAT,
            Self::Value(ValueType::Double) => TAG_DOUBLE,
            Self::Value(ValueType::Boolean) => TAG_BOOLEAN,
            Self::Value(ValueType::String) => TAG_STRING,
            Self::Reference => TAG_REFERENCE,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        let element = match code {
            TAG_BYTE => Self::Value(ValueType::Byte),
            TAG_SHORT => Self::Value(ValueType::Short),
            TAG_INTEGER => Self::Value(ValueType::Integer),
            TAG_LONG => Self::Value(ValueType::Long),
            TAG_FLOAT => Self::Value(ValueType::Float),
            TAG_DOUBLE => Self::Value(ValueType::Double),
            TAG_BOOLEAN => Self::Value(ValueType::Boolean),
            TAG_STRING => Self::Value(ValueType::String),
            TAG_REFERENCE => Self::Reference,
            _ => return None,
        };
        Some(element)
    }
}

/// A record's type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeTag {
    pub element: ElementType,
    pub list: bool,
}

impl TypeTag {
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        if self.list {
            self.element.code() | LIST_TAG_FLAG
        } else {
            self.element.code()
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, ConfstoreError> {
        let element = ElementType::from_code(byte & !LIST_TAG_FLAG)
            .ok_or_else(|| ConfstoreError::Serialization(format!("unknown type tag {:#04x}", byte)))?;
        Ok(Self {
            element,
            list: byte & LIST_TAG_FLAG != 0,
        })
    }
}

// =============================================================================
// CODEC
// =============================================================================

/// Encodes and decodes beans against a unique id registry.
#[derive(Clone)]
pub struct BeanCodec {
    ids: Arc<dyn UniqueIdStore>,
}

impl std::fmt::Debug for BeanCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeanCodec").finish_non_exhaustive()
    }
}

impl BeanCodec {
    pub fn new(ids: Arc<dyn UniqueIdStore>) -> Self {
        Self { ids }
    }

    #[must_use]
    pub fn ids(&self) -> &Arc<dyn UniqueIdStore> {
        &self.ids
    }

    /// Numeric `(schema id, instance id)` key of a bean, creating ids as needed.
    pub fn encode_key(&self, id: &BeanId) -> Result<(u64, u64), ConfstoreError> {
        Ok((
            self.ids.get_or_create_id(IdCategory::Schema, id.schema_name())?,
            self.ids
                .get_or_create_id(IdCategory::Instance, id.instance_id())?,
        ))
    }

    /// Numeric key of a bean if both ids already exist.
    pub fn find_key(&self, id: &BeanId) -> Result<Option<(u64, u64)>, ConfstoreError> {
        let Some(schema) = self.ids.find_id(IdCategory::Schema, id.schema_name())? else {
            return Ok(None);
        };
        Ok(self
            .ids
            .find_id(IdCategory::Instance, id.instance_id())?
            .map(|instance| (schema, instance)))
    }

    pub fn decode_key(&self, key: (u64, u64)) -> Result<BeanId, ConfstoreError> {
        Ok(BeanId::new(
            self.ids.get_name(IdCategory::Schema, key.0)?,
            self.ids.get_name(IdCategory::Instance, key.1)?,
        ))
    }

    /// Encode a bean against its attached schema.
    ///
    /// Values are parsed with their declared type; a value that does not
    /// parse fails with `InvalidData`. Undeclared properties are rejected
    /// by validation before they get here and are ignored by the encoder.
    pub fn encode(&self, bean: &Bean) -> Result<Vec<u8>, ConfstoreError> {
        let schema = bean.require_schema()?;
        let mut records: BTreeMap<u64, Vec<u8>> = BTreeMap::new();

        for property in schema.properties.iter().filter(|p| !p.id) {
            let mut record = Vec::new();
            match &property.kind {
                PropertyKind::Scalar { value_type, .. } => {
                    let Some(raw) = bean.single_value(&property.name) else {
                        continue;
                    };
                    record.push(expected_tag(property).to_byte());
                    write_scalar(&mut record, &value_type.parse(raw)?)?;
                }
                PropertyKind::Collection {
                    value_type,
                    collection,
                    ..
                } => {
                    let Some(raws) = bean.values(&property.name) else {
                        continue;
                    };
                    if *collection == CollectionKind::Map {
                        record.push(expected_tag(property).to_byte());
                        write(&mut record, &raws)?;
                    } else {
                        record.push(expected_tag(property).to_byte());
                        let values = raws
                            .iter()
                            .map(|raw| value_type.parse(raw))
                            .collect::<Result<Vec<_>, _>>()?;
                        write_list(&mut record, *value_type, &values)?;
                    }
                }
                PropertyKind::Reference { .. } => {
                    let Some(target) = bean.first_reference(&property.name) else {
                        continue;
                    };
                    record.push(expected_tag(property).to_byte());
                    write(&mut record, &self.encode_key(target)?)?;
                }
                PropertyKind::ReferenceList { .. } | PropertyKind::ReferenceMap { .. } => {
                    let Some(targets) = bean.references(&property.name) else {
                        continue;
                    };
                    record.push(expected_tag(property).to_byte());
                    let keys = targets
                        .iter()
                        .map(|t| self.encode_key(t))
                        .collect::<Result<Vec<_>, _>>()?;
                    write(&mut record, &keys)?;
                }
            }
            let property_id = self
                .ids
                .get_or_create_id(IdCategory::Property, &property.name)?;
            records.insert(property_id, record);
        }

        let mut out = Vec::new();
        for (property_id, record) in records {
            write(&mut out, &property_id)?;
            out.extend_from_slice(&record);
        }
        Ok(out)
    }

    /// Decode a bean. The result has `schema` attached and no resolved references.
    pub fn decode(
        &self,
        id: &BeanId,
        schema: &Arc<Schema>,
        bytes: &[u8],
    ) -> Result<Bean, ConfstoreError> {
        if bytes.len() > MAX_ENCODED_BEAN_SIZE {
            return Err(ConfstoreError::Serialization(format!(
                "encoded bean of {} bytes exceeds limit",
                bytes.len()
            )));
        }
        let mut bean = Bean::new(id.detached());
        bean.attach_schema(Arc::clone(schema));

        let mut rest = bytes;
        let mut previous: Option<u64> = None;
        while !rest.is_empty() {
            let (property_id, tail) = take::<u64>(rest)?;
            let (tag_byte, tail) = take::<u8>(tail)?;
            let tag = TypeTag::from_byte(tag_byte)?;
            let (payload, tail) = read_payload(tag, tail)?;
            rest = tail;

            if previous.is_some_and(|p| p >= property_id) {
                return Err(ConfstoreError::Serialization(format!(
                    "property {} out of order in {}",
                    property_id, id
                )));
            }
            previous = Some(property_id);

            let name = self.ids.get_name(IdCategory::Property, property_id)?;
            let Some(property) = schema.property(&name).filter(|p| !p.id) else {
                tracing::debug!(bean = %id, property = %name, "skipping property not in schema");
                continue;
            };
            if tag != expected_tag(property) {
                tracing::debug!(bean = %id, property = %name, tag = tag_byte, "skipping property with mismatched type tag");
                continue;
            }
            match (payload, property.is_reference()) {
                (Payload::Values(values), false) => {
                    bean.set_property(name, values.iter().map(ScalarValue::to_canonical).collect());
                }
                (Payload::References(keys), true) => {
                    let targets = keys
                        .into_iter()
                        .map(|key| self.decode_key(key))
                        .collect::<Result<Vec<_>, _>>()?;
                    bean.set_references(name, targets);
                }
                _ => {
                    tracing::debug!(bean = %id, property = %name, tag = tag_byte, "skipping property with mismatched type tag");
                }
            }
        }
        Ok(bean)
    }
}

// =============================================================================
// WIRE HELPERS
// =============================================================================

/// Tag a property is written with under its current declaration.
fn expected_tag(property: &PropertyDescriptor) -> TypeTag {
    let element = match &property.kind {
        PropertyKind::Reference { .. }
        | PropertyKind::ReferenceList { .. }
        | PropertyKind::ReferenceMap { .. } => ElementType::Reference,
        // map entries stay as key=value strings
        PropertyKind::Collection {
            collection: CollectionKind::Map,
            ..
        } => ElementType::Value(ValueType::String),
        PropertyKind::Scalar { value_type, .. } | PropertyKind::Collection { value_type, .. } => {
            ElementType::Value(*value_type)
        }
    };
    TypeTag {
        element,
        list: property.is_multi_valued(),
    }
}

enum Payload {
    Values(Vec<ScalarValue>),
    References(Vec<(u64, u64)>),
}

fn write<T: Serialize + ?Sized>(out: &mut Vec<u8>, value: &T) -> Result<(), ConfstoreError> {
    let bytes =
        postcard::to_allocvec(value).map_err(|e| ConfstoreError::Serialization(e.to_string()))?;
    out.extend_from_slice(&bytes);
    Ok(())
}

fn take<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, &[u8]), ConfstoreError> {
    postcard::take_from_bytes(bytes).map_err(|e| ConfstoreError::Serialization(e.to_string()))
}

fn write_scalar(out: &mut Vec<u8>, value: &ScalarValue) -> Result<(), ConfstoreError> {
    match value {
        ScalarValue::Byte(v) => write(out, v),
        ScalarValue::Short(v) => write(out, v),
        ScalarValue::Integer(v) => write(out, v),
        ScalarValue::Long(v) => write(out, v),
        ScalarValue::Float(v) => write(out, v),
        ScalarValue::Double(v) => write(out, v),
        ScalarValue::Boolean(v) => write(out, v),
        ScalarValue::String(v) => write(out, v.as_str()),
    }
}

fn write_list(
    out: &mut Vec<u8>,
    value_type: ValueType,
    values: &[ScalarValue],
) -> Result<(), ConfstoreError> {
    write(out, &values.len())?;
    for value in values {
        if value.value_type() != value_type {
            return Err(ConfstoreError::Serialization(format!(
                "list element {} is not a {}",
                value, value_type
            )));
        }
        write_scalar(out, value)?;
    }
    Ok(())
}

fn read_scalar(value_type: ValueType, bytes: &[u8]) -> Result<(ScalarValue, &[u8]), ConfstoreError> {
    Ok(match value_type {
        ValueType::Byte => take(bytes).map(|(v, r)| (ScalarValue::Byte(v), r))?,
        ValueType::Short => take(bytes).map(|(v, r)| (ScalarValue::Short(v), r))?,
        ValueType::Integer => take(bytes).map(|(v, r)| (ScalarValue::Integer(v), r))?,
        ValueType::Long => take(bytes).map(|(v, r)| (ScalarValue::Long(v), r))?,
        ValueType::Float => take(bytes).map(|(v, r)| (ScalarValue::Float(v), r))?,
        ValueType::Double => take(bytes).map(|(v, r)| (ScalarValue::Double(v), r))?,
        ValueType::Boolean => take(bytes).map(|(v, r)| (ScalarValue::Boolean(v), r))?,
        ValueType::String => take(bytes).map(|(v, r)| (ScalarValue::String(v), r))?,
    })
}

fn read_payload(tag: TypeTag, bytes: &[u8]) -> Result<(Payload, &[u8]), ConfstoreError> {
    match (tag.element, tag.list) {
        (ElementType::Reference, false) => {
            let (key, rest) = take::<(u64, u64)>(bytes)?;
            Ok((Payload::References(vec![key]), rest))
        }
        (ElementType::Reference, true) => {
            let (keys, rest) = take::<Vec<(u64, u64)>>(bytes)?;
            Ok((Payload::References(keys), rest))
        }
        (ElementType::Value(value_type), false) => {
            let (value, rest) = read_scalar(value_type, bytes)?;
            Ok((Payload::Values(vec![value]), rest))
        }
        (ElementType::Value(value_type), true) => {
            let (count, mut rest) = take::<usize>(bytes)?;
            if count > rest.len() {
                return Err(ConfstoreError::Serialization(format!(
                    "list length {} exceeds remaining {} bytes",
                    count,
                    rest.len()
                )));
            }
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                let (value, tail) = read_scalar(value_type, rest)?;
                values.push(value);
                rest = tail;
            }
            Ok((Payload::Values(values), rest))
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
