//! Row and result representation shared by the messager and its storage backends.
//!
//! The core never owns a wire format; it rides on whatever values the storage
//! layer hands back, normalised into [`Value`] rows.

use std::fmt;

use serde::Serialize;

/// A single typed column value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int64(i64),
    UInt64(u64),
    Float64(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    pub fn bytes(b: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(b.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer view of the value, if it has one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            Value::UInt64(v) => i64::try_from(*v).ok(),
            Value::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// String key used to identify a message by its id column.
    pub fn to_key(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Int64(v) => v.to_string(),
            Value::UInt64(v) => v.to_string(),
            Value::Float64(v) => v.to_string(),
            Value::Text(s) => s.clone(),
            Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }
}

/// Sort order of message identifiers: integers numerically, everything else
/// by its key string, integers before strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IdKey {
    Null,
    Int(i128),
    Text(String),
}

impl From<&Value> for IdKey {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => IdKey::Null,
            Value::Int64(v) => IdKey::Int(i128::from(*v)),
            Value::UInt64(v) => IdKey::Int(i128::from(*v)),
            other => IdKey::Text(other.to_key()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            other => write!(f, "{}", other.to_key()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Column type as reported by storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Int64,
    UInt64,
    Float64,
    Text,
    Bytes,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// Result of executing a statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<Field>,
    pub rows: Vec<Vec<Value>>,
    pub rows_affected: u64,
}

impl QueryResult {
    /// A result carrying only column metadata.
    pub fn fields_only(fields: Vec<Field>) -> Self {
        Self {
            fields,
            ..Default::default()
        }
    }

    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            ..Default::default()
        }
    }

    /// Returns true if any row has a column whose key equals `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.rows
            .iter()
            .any(|row| row.iter().any(|value| value.to_key() == key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_keys() {
        assert_eq!(Value::Int64(42).to_key(), "42");
        assert_eq!(Value::bytes("abc").to_key(), "abc");
        assert_eq!(Value::text("x").to_key(), "x");
        assert_eq!(Value::Null.to_string(), "NULL");
    }

    #[test]
    fn test_id_keys_order_integers_numerically() {
        let mut keys: Vec<IdKey> = [10, 9, 2]
            .into_iter()
            .map(|v| IdKey::from(&Value::Int64(v)))
            .collect();
        keys.sort();
        assert_eq!(keys, vec![IdKey::Int(2), IdKey::Int(9), IdKey::Int(10)]);

        assert!(IdKey::from(&Value::UInt64(3)) < IdKey::from(&Value::Int64(4)));
        assert!(IdKey::from(&Value::Int64(i64::MAX)) < IdKey::from(&Value::text("a")));
        assert_eq!(IdKey::from(&Value::Null), IdKey::Null);
    }

    #[test]
    fn test_as_i64() {
        assert_eq!(Value::Int64(-3).as_i64(), Some(-3));
        assert_eq!(Value::UInt64(u64::MAX).as_i64(), None);
        assert_eq!(Value::text("17").as_i64(), Some(17));
        assert_eq!(Value::Null.as_i64(), None);
    }

    #[test]
    fn test_result_contains_key() {
        let result = QueryResult {
            rows: vec![vec![Value::bytes("1"), Value::text("payload")]],
            ..Default::default()
        };
        assert!(result.contains_key("1"));
        assert!(!result.contains_key("2"));
    }
}
