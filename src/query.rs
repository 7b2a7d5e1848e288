//! Predicate filters over record payloads

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison applied by a [`Filter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Equals,
    Not,
    Contains,
    StartsWith,
    EndsWith,
    Lt,
    Lte,
    Gt,
    Gte,
}

/// `field_path <operator> value` against a record's JSON
///
/// `field_path` is dot separated; numeric segments index into arrays
/// (`lines.0.sku`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    pub field_path: String,
    pub operator: FilterOperator,
    pub value: Value,
}

impl Filter {
    pub fn new(field_path: impl Into<String>, operator: FilterOperator, value: impl Into<Value>) -> Self {
        Self {
            field_path: field_path.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn matches(&self, record: &Value) -> bool {
        let field = resolve(record, &self.field_path);
        match self.operator {
            FilterOperator::Equals => field.is_some_and(|f| json_eq(f, &self.value)),
            FilterOperator::Not => !field.is_some_and(|f| json_eq(f, &self.value)),
            FilterOperator::Contains => match (field, &self.value) {
                (Some(Value::String(s)), Value::String(needle)) => s.contains(needle.as_str()),
                (Some(Value::Array(items)), needle) => items.iter().any(|i| json_eq(i, needle)),
                _ => false,
            },
            FilterOperator::StartsWith => match (field, &self.value) {
                (Some(Value::String(s)), Value::String(prefix)) => s.starts_with(prefix.as_str()),
                _ => false,
            },
            FilterOperator::EndsWith => match (field, &self.value) {
                (Some(Value::String(s)), Value::String(suffix)) => s.ends_with(suffix.as_str()),
                _ => false,
            },
            FilterOperator::Lt => compare(field, &self.value) == Some(Ordering::Less),
            FilterOperator::Lte => matches!(
                compare(field, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOperator::Gt => compare(field, &self.value) == Some(Ordering::Greater),
            FilterOperator::Gte => matches!(
                compare(field, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
        }
    }
}

/// True when every filter matches (an empty list matches everything)
pub fn matches_all(filters: &[Filter], record: &Value) -> bool {
    filters.iter().all(|f| f.matches(record))
}

fn resolve<'v>(record: &'v Value, path: &str) -> Option<&'v Value> {
    if path.is_empty() {
        return Some(record);
    }
    path.split('.').try_fold(record, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn json_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

fn compare(field: Option<&Value>, value: &Value) -> Option<Ordering> {
    match (field?, value) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> Value {
        json!({
            "id": "0xabc",
            "amount": 42,
            "pair": { "token0": "WETH", "token1": "USDC" },
            "tags": ["swap", "large"],
            "timestamp": "2024-05-01T00:00:00Z"
        })
    }

    #[test]
    fn test_equals_and_not() {
        let r = record();
        assert!(Filter::new("pair.token0", FilterOperator::Equals, "WETH").matches(&r));
        assert!(Filter::new("amount", FilterOperator::Equals, 42.0).matches(&r));
        assert!(Filter::new("pair.token0", FilterOperator::Not, "DAI").matches(&r));
        assert!(Filter::new("missing", FilterOperator::Not, "DAI").matches(&r));
        assert!(!Filter::new("missing", FilterOperator::Equals, "DAI").matches(&r));
    }

    #[test]
    fn test_string_operators() {
        let r = record();
        assert!(Filter::new("id", FilterOperator::StartsWith, "0x").matches(&r));
        assert!(Filter::new("id", FilterOperator::EndsWith, "abc").matches(&r));
        assert!(Filter::new("id", FilterOperator::Contains, "xa").matches(&r));
        assert!(Filter::new("tags", FilterOperator::Contains, "large").matches(&r));
        assert!(Filter::new("tags.0", FilterOperator::Equals, "swap").matches(&r));
        assert!(!Filter::new("amount", FilterOperator::StartsWith, "4").matches(&r));
    }

    #[test]
    fn test_ordering_operators() {
        let r = record();
        assert!(Filter::new("amount", FilterOperator::Gt, 41).matches(&r));
        assert!(Filter::new("amount", FilterOperator::Gte, 42).matches(&r));
        assert!(Filter::new("amount", FilterOperator::Lte, 42).matches(&r));
        assert!(!Filter::new("amount", FilterOperator::Lt, 42).matches(&r));
        assert!(Filter::new("timestamp", FilterOperator::Lt, "2024-06-01").matches(&r));
        assert!(!Filter::new("amount", FilterOperator::Lt, "100").matches(&r));
    }

    #[test]
    fn test_filters_are_anded() {
        let r = record();
        let filters = vec![
            Filter::new("pair.token1", FilterOperator::Equals, "USDC"),
            Filter::new("amount", FilterOperator::Gt, 100),
        ];
        assert!(!matches_all(&filters, &r));
        assert!(matches_all(&[], &r));
    }

    #[test]
    fn test_operator_wire_names() {
        let f: Filter = serde_json::from_value(json!({
            "fieldPath": "id", "operator": "starts_with", "value": "0x"
        }))
        .unwrap();
        assert_eq!(f.operator, FilterOperator::StartsWith);
    }
}
