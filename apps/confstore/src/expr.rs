//! # Restriction Expressions
//!
//! Compact command-line syntax for query restrictions.
//!
//! | Expression       | Restriction                |
//! |------------------|----------------------------|
//! | `prop=v`         | equal                      |
//! | `prop!=v`        | not equal                  |
//! | `prop~sub`       | contains                   |
//! | `prop>v`         | greater than               |
//! | `prop<v`         | less than                  |
//! | `prop=a..b`      | between, bounds inclusive  |
//! | `prop in a,b,c`  | in list                    |
//!
//! Property names are made of letters, digits, `_`, `-` and `.`.
//! Whitespace around the operator is ignored.

use confstore_core::ConfstoreError;
use confstore_core::Restriction;
use confstore_core::restriction::{between, contains, equal, greater_than, in_list, less_than, not};

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.')
}

fn invalid(expr: &str, reason: &str) -> ConfstoreError {
    ConfstoreError::InvalidData(format!("Invalid restriction '{}': {}", expr, reason))
}

/// Parse one restriction expression.
pub fn parse_restriction(expr: &str) -> Result<Restriction, ConfstoreError> {
    let trimmed = expr.trim();
    let name_end = trimmed
        .char_indices()
        .find(|(_, c)| !is_name_char(*c))
        .map(|(i, _)| i)
        .unwrap_or(trimmed.len());
    let property = &trimmed[..name_end];
    if property.is_empty() {
        return Err(invalid(expr, "missing property name"));
    }
    let rest = trimmed[name_end..].trim_start();

    if let Some(list) = rest.strip_prefix("in ") {
        let values: Vec<&str> = list.split(',').map(str::trim).collect();
        if values.iter().any(|v| v.is_empty()) {
            return Err(invalid(expr, "empty value in list"));
        }
        return Ok(in_list(property, values));
    }

    let (op, operand) = ["!=", "=", "~", ">", "<"]
        .iter()
        .find_map(|op| rest.strip_prefix(op).map(|operand| (*op, operand.trim())))
        .ok_or_else(|| invalid(expr, "expected one of = != ~ > < in"))?;
    if operand.is_empty() {
        return Err(invalid(expr, "missing value"));
    }

    let restriction = match op {
        "!=" => not(equal(property, operand)),
        "=" => match operand.split_once("..") {
            Some((lower, upper)) => {
                let (lower, upper) = (lower.trim(), upper.trim());
                if lower.is_empty() || upper.is_empty() {
                    return Err(invalid(expr, "range needs both bounds"));
                }
                between(property, lower, upper)
            }
            None => equal(property, operand),
        },
        "~" => contains(property, operand),
        ">" => greater_than(property, operand),
        _ => less_than(property, operand),
    };
    Ok(restriction)
}

/// Parse several expressions; they combine with AND when added to a query.
pub fn parse_all<S: AsRef<str>>(exprs: &[S]) -> Result<Vec<Restriction>, ConfstoreError> {
    exprs.iter().map(|e| parse_restriction(e.as_ref())).collect()
}
