//! Mapping filters and their validation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{MappingError, Result};

/// Kind of predicate a filter applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterType {
    Where,
    Limit,
    OrderBy,
    Custom,
}

impl FilterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterType::Where => "where",
            FilterType::Limit => "limit",
            FilterType::OrderBy => "order_by",
            FilterType::Custom => "custom",
        }
    }
}

impl fmt::Display for FilterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterType {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "where" => Ok(FilterType::Where),
            "limit" => Ok(FilterType::Limit),
            "order_by" => Ok(FilterType::OrderBy),
            "custom" => Ok(FilterType::Custom),
            other => Err(MappingError::invalid(format!(
                "unknown filter type '{}': expected where, limit, order_by or custom",
                other
            ))),
        }
    }
}

/// Boolean operator combining multiple filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FilterOperator {
    #[default]
    And,
    Or,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::And => "AND",
            FilterOperator::Or => "OR",
        }
    }
}

impl FromStr for FilterOperator {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "AND" => Ok(FilterOperator::And),
            "OR" => Ok(FilterOperator::Or),
            other => Err(MappingError::invalid(format!(
                "invalid filter operator '{}': expected AND or OR",
                other
            ))),
        }
    }
}

/// An ordered, typed predicate attached to a mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingFilter {
    pub id: String,
    pub mapping_id: String,
    pub filter_type: FilterType,
    /// Type-specific fields (`field`, `operator`, `value`, `count`, `direction`, ...).
    pub expression: Map<String, Value>,
    pub order: i32,
    pub operator: FilterOperator,
}

fn has_non_empty(expression: &Map<String, Value>, key: &str) -> bool {
    match expression.get(key) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    }
}

/// Validate a filter expression for its declared type.
pub fn validate_filter(filter_type: &str, expression: &Map<String, Value>) -> Result<FilterType> {
    let ty: FilterType = filter_type.parse()?;

    let required: &[&str] = match ty {
        // value is optional so that IS NULL / IS NOT NULL checks are expressible
        FilterType::Where => &["field", "operator"],
        FilterType::Limit => &["count"],
        FilterType::OrderBy => &["field", "direction"],
        FilterType::Custom => &[],
    };

    if let Some(missing) = required.iter().find(|k| !has_non_empty(expression, k)) {
        return Err(MappingError::invalid(format!(
            "{} filter requires '{}'",
            ty, missing
        )));
    }

    match ty {
        FilterType::Limit => {
            let count = expression.get("count").and_then(Value::as_i64);
            if !matches!(count, Some(n) if n >= 0) {
                return Err(MappingError::invalid(
                    "limit filter 'count' must be a non-negative integer",
                ));
            }
        }
        FilterType::OrderBy => {
            let direction = expression
                .get("direction")
                .and_then(Value::as_str)
                .map(str::to_ascii_uppercase);
            if !matches!(direction.as_deref(), Some("ASC") | Some("DESC")) {
                return Err(MappingError::invalid(
                    "order_by filter 'direction' must be ASC or DESC",
                ));
            }
        }
        FilterType::Custom if expression.is_empty() => {
            return Err(MappingError::invalid("custom filter cannot be empty"));
        }
        _ => {}
    }

    Ok(ty)
}

/// Validate the combining operator of a filter set.
pub fn validate_filter_operator(operator: &str) -> Result<FilterOperator> {
    operator.parse()
}
