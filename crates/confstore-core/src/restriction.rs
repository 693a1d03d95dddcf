//! # Restrictions
//!
//! Backend-neutral predicate trees over bean properties.
//!
//! Leaves constrain one property; `And`, `Or` and `Not` combine them. Values
//! are canonical strings and are compared with the declared type of the
//! property, so `"10" > "9"` holds for numeric properties.
//!
//! ## Negation
//!
//! `not` never wraps a leaf. It flips the leaf's `negated` flag instead,
//! which inverts the per-element predicate: for a multi-valued property,
//! `not(equal(p, v))` matches when *some* element differs from `v`.
//! `not(in_list(p, [a, b]))` expands to `and(not(equal(p, a)), not(equal(p, b)))`.
//! Only compound restrictions are wrapped in `Not`.
//!
//! ## Visiting
//!
//! Backends translate a tree by implementing `RestrictionVisitor`; the
//! tree folds bottom-up through `Restriction::accept`. `RestrictionEvaluator`
//! is the reference implementation used by the in-process backends.

use crate::schema::{PropertyDescriptor, Schema};
use crate::types::ValueType;
use crate::{Bean, ConfstoreError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

// =============================================================================
// AST
// =============================================================================

/// Predicate of a single-property restriction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Predicate {
    Equals(String),
    /// Substring match. Strings and reference instance ids only.
    Contains(String),
    /// Inclusive on both ends.
    Between { lower: String, upper: String },
    GreaterThan(String),
    LessThan(String),
    In(Vec<String>),
}

/// Restriction on one property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyRestriction {
    pub property: String,
    pub predicate: Predicate,
    pub negated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Restriction {
    Property(PropertyRestriction),
    And(Vec<Restriction>),
    Or(Vec<Restriction>),
    Not(Box<Restriction>),
}

fn leaf(property: impl Into<String>, predicate: Predicate) -> Restriction {
    Restriction::Property(PropertyRestriction {
        property: property.into(),
        predicate,
        negated: false,
    })
}

// =============================================================================
// BUILDERS
// =============================================================================

pub fn equal(property: impl Into<String>, value: impl ToString) -> Restriction {
    leaf(property, Predicate::Equals(value.to_string()))
}

pub fn contains(property: impl Into<String>, value: impl ToString) -> Restriction {
    leaf(property, Predicate::Contains(value.to_string()))
}

pub fn between(
    property: impl Into<String>,
    lower: impl ToString,
    upper: impl ToString,
) -> Restriction {
    leaf(
        property,
        Predicate::Between {
            lower: lower.to_string(),
            upper: upper.to_string(),
        },
    )
}

pub fn greater_than(property: impl Into<String>, value: impl ToString) -> Restriction {
    leaf(property, Predicate::GreaterThan(value.to_string()))
}

pub fn less_than(property: impl Into<String>, value: impl ToString) -> Restriction {
    leaf(property, Predicate::LessThan(value.to_string()))
}

pub fn in_list<I, V>(property: impl Into<String>, values: I) -> Restriction
where
    I: IntoIterator<Item = V>,
    V: ToString,
{
    leaf(
        property,
        Predicate::In(values.into_iter().map(|v| v.to_string()).collect()),
    )
}

pub fn and(restrictions: impl IntoIterator<Item = Restriction>) -> Restriction {
    Restriction::And(restrictions.into_iter().collect())
}

pub fn or(restrictions: impl IntoIterator<Item = Restriction>) -> Restriction {
    Restriction::Or(restrictions.into_iter().collect())
}

/// Negate a restriction. See the module docs for the rewriting rules.
pub fn not(restriction: Restriction) -> Restriction {
    match restriction {
        Restriction::Property(mut leaf) => match leaf.predicate {
            Predicate::In(values) if !leaf.negated => Restriction::And(
                values
                    .into_iter()
                    .map(|value| {
                        Restriction::Property(PropertyRestriction {
                            property: leaf.property.clone(),
                            predicate: Predicate::Equals(value),
                            negated: true,
                        })
                    })
                    .collect(),
            ),
            _ => {
                leaf.negated = !leaf.negated;
                Restriction::Property(leaf)
            }
        },
        Restriction::Not(inner) => *inner,
        compound => Restriction::Not(Box::new(compound)),
    }
}

// =============================================================================
// VISITOR
// =============================================================================

/// Bottom-up fold over a restriction tree.
pub trait RestrictionVisitor {
    type Output;

    fn visit_property(&mut self, leaf: &PropertyRestriction) -> Result<Self::Output, ConfstoreError>;

    fn visit_and(&mut self, parts: Vec<Self::Output>) -> Result<Self::Output, ConfstoreError>;

    fn visit_or(&mut self, parts: Vec<Self::Output>) -> Result<Self::Output, ConfstoreError>;

    /// Negation of a compound restriction. Backends that cannot express it
    /// keep this default.
    fn visit_not(&mut self, _inner: Self::Output) -> Result<Self::Output, ConfstoreError> {
        Err(ConfstoreError::UnsupportedRestriction(
            "negation of a compound restriction".to_string(),
        ))
    }
}

impl Restriction {
    pub fn accept<V: RestrictionVisitor>(&self, visitor: &mut V) -> Result<V::Output, ConfstoreError> {
        match self {
            Self::Property(leaf) => visitor.visit_property(leaf),
            Self::And(parts) => {
                let parts = parts
                    .iter()
                    .map(|p| p.accept(visitor))
                    .collect::<Result<Vec<_>, _>>()?;
                visitor.visit_and(parts)
            }
            Self::Or(parts) => {
                let parts = parts
                    .iter()
                    .map(|p| p.accept(visitor))
                    .collect::<Result<Vec<_>, _>>()?;
                visitor.visit_or(parts)
            }
            Self::Not(inner) => {
                let inner = inner.accept(visitor)?;
                visitor.visit_not(inner)
            }
        }
    }

    /// Every leaf in the tree, depth first.
    pub fn leaves(&self) -> Vec<&PropertyRestriction> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a PropertyRestriction>) {
        match self {
            Self::Property(leaf) => out.push(leaf),
            Self::And(parts) | Self::Or(parts) => {
                for part in parts {
                    part.collect_leaves(out);
                }
            }
            Self::Not(inner) => inner.collect_leaves(out),
        }
    }

    /// Check the tree against a schema before evaluation.
    ///
    /// - every property must exist and be indexed
    /// - `Contains` applies to strings and references only
    /// - bounds must parse with the property's type
    pub fn check(&self, schema: &Schema) -> Result<(), ConfstoreError> {
        for leaf in self.leaves() {
            let property = schema.property(&leaf.property).ok_or_else(|| {
                ConfstoreError::PropertyNotInSchema {
                    schema: schema.name.clone(),
                    property: leaf.property.clone(),
                }
            })?;
            if !property.indexed {
                return Err(ConfstoreError::UnsupportedRestriction(format!(
                    "property '{}' of '{}' is not indexed",
                    property.name, schema.name
                )));
            }
            leaf.check_operands(property)?;
        }
        Ok(())
    }
}

impl PropertyRestriction {
    fn check_operands(&self, property: &PropertyDescriptor) -> Result<(), ConfstoreError> {
        let value_type = property.value_type();
        let operands: Vec<&String> = match &self.predicate {
            Predicate::Contains(_) => {
                if value_type != ValueType::String {
                    return Err(ConfstoreError::UnsupportedRestriction(format!(
                        "contains on {} property '{}'",
                        value_type, property.name
                    )));
                }
                Vec::new()
            }
            Predicate::Equals(v) | Predicate::GreaterThan(v) | Predicate::LessThan(v) => vec![v],
            Predicate::Between { lower, upper } => vec![lower, upper],
            Predicate::In(values) => values.iter().collect(),
        };
        for operand in operands {
            if !value_type.accepts(operand) {
                return Err(ConfstoreError::InvalidData(format!(
                    "'{}' is not a valid {} for property '{}'",
                    operand, value_type, property.name
                )));
            }
        }
        Ok(())
    }

    /// Whether one element satisfies the predicate, ignoring negation.
    fn element_matches(&self, value_type: ValueType, element: &str) -> bool {
        let cmp = |operand: &str| value_type.compare(element, operand);
        match &self.predicate {
            Predicate::Equals(v) => cmp(v) == Some(Ordering::Equal),
            Predicate::Contains(s) => element.contains(s.as_str()),
            Predicate::Between { lower, upper } => {
                matches!(cmp(lower), Some(Ordering::Greater | Ordering::Equal))
                    && matches!(cmp(upper), Some(Ordering::Less | Ordering::Equal))
            }
            Predicate::GreaterThan(v) => cmp(v) == Some(Ordering::Greater),
            Predicate::LessThan(v) => cmp(v) == Some(Ordering::Less),
            Predicate::In(values) => values.iter().any(|v| cmp(v) == Some(Ordering::Equal)),
        }
    }

    /// Existential match over the elements of a property.
    ///
    /// A property with no elements never matches, negated or not.
    pub fn matches<'a>(
        &self,
        value_type: ValueType,
        elements: impl IntoIterator<Item = &'a str>,
    ) -> bool {
        let elements: Vec<&str> = elements.into_iter().collect();
        match (&self.predicate, self.negated) {
            (Predicate::In(values), true) => values.iter().all(|v| {
                elements
                    .iter()
                    .any(|e| value_type.compare(e, v) != Some(Ordering::Equal))
            }),
            (_, negated) => elements
                .iter()
                .any(|e| self.element_matches(value_type, e) != negated),
        }
    }
}

// =============================================================================
// REFERENCE EVALUATOR
// =============================================================================

/// Evaluates a restriction against one decoded bean.
#[derive(Debug)]
pub struct RestrictionEvaluator<'a> {
    bean: &'a Bean,
    schema: &'a Schema,
}

impl<'a> RestrictionEvaluator<'a> {
    pub fn new(bean: &'a Bean, schema: &'a Schema) -> Self {
        Self { bean, schema }
    }

    pub fn evaluate(bean: &'a Bean, schema: &'a Schema, restriction: &Restriction) -> Result<bool, ConfstoreError> {
        restriction.accept(&mut Self::new(bean, schema))
    }
}

impl RestrictionVisitor for RestrictionEvaluator<'_> {
    type Output = bool;

    fn visit_property(&mut self, leaf: &PropertyRestriction) -> Result<bool, ConfstoreError> {
        let property = self.schema.property(&leaf.property).ok_or_else(|| {
            ConfstoreError::PropertyNotInSchema {
                schema: self.schema.name.clone(),
                property: leaf.property.clone(),
            }
        })?;
        let value_type = property.value_type();
        let matched = if property.is_reference() {
            let targets = self.bean.references(&leaf.property).unwrap_or_default();
            leaf.matches(value_type, targets.iter().map(|t| t.instance_id()))
        } else {
            let values = self.bean.values(&leaf.property).unwrap_or_default();
            leaf.matches(value_type, values.iter().map(String::as_str))
        };
        Ok(matched)
    }

    fn visit_and(&mut self, parts: Vec<bool>) -> Result<bool, ConfstoreError> {
        Ok(parts.into_iter().all(|p| p))
    }

    fn visit_or(&mut self, parts: Vec<bool>) -> Result<bool, ConfstoreError> {
        Ok(parts.into_iter().any(|p| p))
    }

    fn visit_not(&mut self, inner: bool) -> Result<bool, ConfstoreError> {
        Ok(!inner)
    }
}

// =============================================================================
// DISPLAY
// =============================================================================

impl fmt::Display for PropertyRestriction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            f.write_str("!")?;
        }
        match &self.predicate {
            Predicate::Equals(v) => write!(f, "{} = {}", self.property, v),
            Predicate::Contains(v) => write!(f, "{} ~ {}", self.property, v),
            Predicate::Between { lower, upper } => {
                write!(f, "{} in [{}, {}]", self.property, lower, upper)
            }
            Predicate::GreaterThan(v) => write!(f, "{} > {}", self.property, v),
            Predicate::LessThan(v) => write!(f, "{} < {}", self.property, v),
            Predicate::In(values) => write!(f, "{} in {{{}}}", self.property, values.join(", ")),
        }
    }
}

impl fmt::Display for Restriction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |f: &mut fmt::Formatter<'_>, parts: &[Restriction], op: &str| {
            f.write_str("(")?;
            for (i, part) in parts.iter().enumerate() {
                if i > 0 {
                    write!(f, " {} ", op)?;
                }
                write!(f, "{}", part)?;
            }
            f.write_str(")")
        };
        match self {
            Self::Property(leaf) => write!(f, "{}", leaf),
            Self::And(parts) => join(f, parts, "and"),
            Self::Or(parts) => join(f, parts, "or"),
            Self::Not(inner) => write!(f, "not {}", inner),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::BeanId;
    use crate::schema::PropertyDescriptor;

    fn schema() -> Schema {
        Schema::new("Item")
            .with_property(PropertyDescriptor::id("id"))
            .with_property(PropertyDescriptor::scalar("name", ValueType::String).indexed())
            .with_property(PropertyDescriptor::scalar("size", ValueType::Double).indexed())
            .with_property(PropertyDescriptor::list("tags", ValueType::String).indexed())
            .with_property(PropertyDescriptor::reference_list("parts", "Item").indexed())
            .with_property(PropertyDescriptor::scalar("note", ValueType::String))
    }

    fn item() -> Bean {
        Bean::new(BeanId::new("Item", "i1"))
            .with_property("name", "widget")
            .with_property("size", "10")
            .with_property("tags", "a")
            .with_property("tags", "b")
            .with_reference("parts", BeanId::new("Item", "p1"))
            .with_reference("parts", BeanId::new("Item", "p2"))
    }

    fn eval(restriction: &Restriction) -> bool {
        let schema = schema();
        RestrictionEvaluator::evaluate(&item(), &schema, restriction).expect("evaluate")
    }

    #[test]
    fn not_flips_leaf_flag() {
        let negated = not(equal("name", "x"));
        match &negated {
            Restriction::Property(leaf) => assert!(leaf.negated),
            other => panic!("expected leaf, got {:?}", other),
        }
        assert_eq!(not(negated), equal("name", "x"));
    }

    #[test]
    fn not_in_expands_by_de_morgan() {
        let expanded = not(in_list("tags", ["a", "z"]));
        let expected = and([not(equal("tags", "a")), not(equal("tags", "z"))]);
        assert_eq!(expanded, expected);
    }

    #[test]
    fn not_wraps_compound_once() {
        let compound = and([equal("name", "a"), equal("name", "b")]);
        let wrapped = not(compound.clone());
        assert!(matches!(wrapped, Restriction::Not(_)));
        assert_eq!(not(wrapped), compound);
    }

    #[test]
    fn numeric_comparisons_use_declared_type() {
        assert!(eval(&greater_than("size", "9")));
        assert!(!eval(&greater_than("size", "10")));
        assert!(eval(&less_than("size", "10.5")));
        assert!(eval(&between("size", "10", "10")));
        assert!(eval(&equal("size", "10.0")));
    }

    #[test]
    fn collections_match_existentially() {
        assert!(eval(&equal("tags", "b")));
        assert!(eval(&in_list("tags", ["z", "a"])));
        // some element differs from "a"
        assert!(eval(&not(equal("tags", "a"))));
        assert!(eval(&and([not(equal("tags", "a")), not(equal("tags", "b"))])));
        assert!(eval(&not(in_list("tags", ["a", "b", "c"]))));
    }

    #[test]
    fn references_compare_by_instance_id() {
        assert!(eval(&equal("parts", "p2")));
        assert!(eval(&contains("parts", "p")));
        assert!(!eval(&equal("parts", "p3")));
    }

    #[test]
    fn absent_property_never_matches() {
        let schema = schema();
        let bean = Bean::new(BeanId::new("Item", "empty"));
        let negated = not(equal("name", "x"));
        assert!(!RestrictionEvaluator::evaluate(&bean, &schema, &negated).expect("evaluate"));
    }

    #[test]
    fn compound_negation() {
        assert!(eval(&not(or([equal("name", "x"), equal("name", "y")]))));
        assert!(!eval(&not(and([equal("name", "widget"), equal("size", "10")]))));
    }

    #[test]
    fn check_rejects_unusable_restrictions() {
        let schema = schema();
        assert!(matches!(
            equal("note", "x").check(&schema),
            Err(ConfstoreError::UnsupportedRestriction(_))
        ));
        assert!(matches!(
            contains("size", "1").check(&schema),
            Err(ConfstoreError::UnsupportedRestriction(_))
        ));
        assert!(matches!(
            equal("missing", "x").check(&schema),
            Err(ConfstoreError::PropertyNotInSchema { .. })
        ));
        assert!(matches!(
            greater_than("size", "big").check(&schema),
            Err(ConfstoreError::InvalidData(_))
        ));
        assert!(and([contains("name", "w"), between("size", 1, 2)]).check(&schema).is_ok());
    }

    #[test]
    fn display_is_readable() {
        let r = and([equal("a", 1), not(in_list("b", ["x", "y"]))]);
        assert_eq!(r.to_string(), "(a = 1 and (!b = x and !b = y))");
    }
}
