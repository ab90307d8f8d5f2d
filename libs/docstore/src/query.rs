//! Query building for the document store.
//!
//! Supports the equality-and-range filtering the dispatch core needs
//! (e.g. `status == pending AND scheduled_time <= now`), with ordering
//! and a result limit.

use serde_json::Value;
use std::cmp::Ordering;

/// A single field filter.
#[derive(Debug, Clone)]
pub enum Filter {
    Eq(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    Gte(String, Value),
}

impl Filter {
    /// Field this filter applies to.
    pub fn field(&self) -> &str {
        match self {
            Filter::Eq(f, _) | Filter::Lt(f, _) | Filter::Lte(f, _) | Filter::Gte(f, _) => f,
        }
    }

    /// Whether a document field value satisfies this filter.
    /// A missing field or incomparable type never matches.
    pub fn matches(&self, actual: Option<&Value>) -> bool {
        let Some(actual) = actual else {
            return false;
        };
        match self {
            Filter::Eq(_, expected) => actual == expected,
            Filter::Lt(_, bound) => {
                matches!(compare_values(actual, bound), Some(Ordering::Less))
            }
            Filter::Lte(_, bound) => matches!(
                compare_values(actual, bound),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Filter::Gte(_, bound) => matches!(
                compare_values(actual, bound),
                Some(Ordering::Greater | Ordering::Equal)
            ),
        }
    }
}

/// Result ordering.
#[derive(Debug, Clone)]
pub struct OrderBy {
    pub field: String,
    pub descending: bool,
}

/// A query over one collection.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(field.into(), value.into()));
        self
    }

    pub fn filter_lt(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Lt(field.into(), value.into()));
        self
    }

    pub fn filter_lte(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Lte(field.into(), value.into()));
        self
    }

    pub fn filter_gte(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Gte(field.into(), value.into()));
        self
    }

    pub fn order_by_asc(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            descending: false,
        });
        self
    }

    pub fn order_by_desc(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            descending: true,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Compare two JSON scalars. Numbers compare numerically, strings and
/// booleans by their natural order; mixed or non-scalar types do not compare.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64().partial_cmp(&y.as_f64()),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
