//! # Scalar Values
//!
//! Every scalar property is stored as a canonical string. `ValueType` names
//! the logical type declared by the schema, `ScalarValue` is the typed form
//! used only at the edges: by the codec when writing compact payloads and by
//! the restriction evaluator when ordering values.

use crate::ConfstoreError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Logical type of a scalar property or of the elements of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Byte,
    Short,
    Integer,
    Long,
    Float,
    Double,
    Boolean,
    String,
}

impl ValueType {
    /// Parse a canonical string into a typed value.
    pub fn parse(self, raw: &str) -> Result<ScalarValue, ConfstoreError> {
        let invalid = || ConfstoreError::InvalidData(format!("'{}' is not a valid {}", raw, self));
        let value = match self {
            Self::Byte => ScalarValue::Byte(raw.trim().parse().map_err(|_| invalid())?),
            Self::Short => ScalarValue::Short(raw.trim().parse().map_err(|_| invalid())?),
            Self::Integer => ScalarValue::Integer(raw.trim().parse().map_err(|_| invalid())?),
            Self::Long => ScalarValue::Long(raw.trim().parse().map_err(|_| invalid())?),
            Self::Float => ScalarValue::Float(raw.trim().parse().map_err(|_| invalid())?),
            Self::Double => ScalarValue::Double(raw.trim().parse().map_err(|_| invalid())?),
            Self::Boolean => match raw.trim().to_ascii_lowercase().as_str() {
                "true" => ScalarValue::Boolean(true),
                "false" => ScalarValue::Boolean(false),
                _ => return Err(invalid()),
            },
            Self::String => ScalarValue::String(raw.to_string()),
        };
        Ok(value)
    }

    /// Check that a canonical string parses as this type.
    pub fn accepts(self, raw: &str) -> bool {
        self.parse(raw).is_ok()
    }

    /// Compare two canonical strings under this type's ordering.
    ///
    /// Returns `None` when either side does not parse.
    pub fn compare(self, left: &str, right: &str) -> Option<Ordering> {
        let left = self.parse(left).ok()?;
        let right = self.parse(right).ok()?;
        left.partial_cmp(&right)
    }

    /// Whether the type has a numeric ordering.
    #[must_use]
    pub const fn is_numeric(self) -> bool {
        matches!(
            self,
            Self::Byte | Self::Short | Self::Integer | Self::Long | Self::Float | Self::Double
        )
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Byte => "byte",
            Self::Short => "short",
            Self::Integer => "integer",
            Self::Long => "long",
            Self::Float => "float",
            Self::Double => "double",
            Self::Boolean => "boolean",
            Self::String => "string",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed scalar.
///
/// `Display` produces the canonical string form. Floating point values use
/// the shortest representation that parses back to the same bits, which
/// keeps encode -> decode -> encode byte-stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    Byte(i8),
    Short(i16),
    Integer(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Boolean(bool),
    String(String),
}

impl ScalarValue {
    #[must_use]
    pub const fn value_type(&self) -> ValueType {
        match self {
            Self::Byte(_) => ValueType::Byte,
            Self::Short(_) => ValueType::Short,
            Self::Integer(_) => ValueType::Integer,
            Self::Long(_) => ValueType::Long,
            Self::Float(_) => ValueType::Float,
            Self::Double(_) => ValueType::Double,
            Self::Boolean(_) => ValueType::Boolean,
            Self::String(_) => ValueType::String,
        }
    }

    /// Canonical string form.
    #[must_use]
    pub fn to_canonical(&self) -> String {
        self.to_string()
    }
}

impl PartialOrd for ScalarValue {
    /// Values of different types are unordered.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Byte(a), Self::Byte(b)) => a.partial_cmp(b),
            (Self::Short(a), Self::Short(b)) => a.partial_cmp(b),
            (Self::Integer(a), Self::Integer(b)) => a.partial_cmp(b),
            (Self::Long(a), Self::Long(b)) => a.partial_cmp(b),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b),
            (Self::Double(a), Self::Double(b)) => a.partial_cmp(b),
            (Self::Boolean(a), Self::Boolean(b)) => a.partial_cmp(b),
            (Self::String(a), Self::String(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Byte(v) => write!(f, "{}", v),
            Self::Short(v) => write!(f, "{}", v),
            Self::Integer(v) => write!(f, "{}", v),
            Self::Long(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Double(v) => write!(f, "{}", v),
            Self::Boolean(v) => write!(f, "{}", v),
            Self::String(v) => f.write_str(v),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
