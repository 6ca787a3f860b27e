//! Property types for built-in context properties

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared type of a built-in context property.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    /// 64-bit signed integer
    Int,
    /// 64-bit floating point
    Float,
    /// Boolean
    Bool,
    /// UTF-8 string
    Str,
    /// Timestamp (milliseconds since epoch)
    Timestamp,
    /// Array of elements
    Array(Box<PropertyType>),
    /// Nested record (one sub-context's properties)
    Record(Vec<(String, PropertyType)>),
    /// Any value (key types not known until runtime)
    Any,
}

impl PropertyType {
    /// Whether a runtime value conforms to this type. `Null` conforms to
    /// every type since absent properties are legal.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) | (PropertyType::Any, _) => true,
            (PropertyType::Int, Value::Int(_)) => true,
            (PropertyType::Float, Value::Float(_) | Value::Int(_)) => true,
            (PropertyType::Bool, Value::Bool(_)) => true,
            (PropertyType::Str, Value::Str(_)) => true,
            (PropertyType::Timestamp, Value::Timestamp(_)) => true,
            (PropertyType::Array(inner), Value::Array(items)) => {
                items.iter().all(|v| inner.accepts(v))
            }
            (PropertyType::Record(fields), Value::Map(m)) => fields
                .iter()
                .all(|(name, ty)| m.get(name).map_or(true, |v| ty.accepts(v))),
            _ => false,
        }
    }

    /// Infer the narrowest type describing a value.
    pub fn of(value: &Value) -> PropertyType {
        match value {
            Value::Null => PropertyType::Any,
            Value::Bool(_) => PropertyType::Bool,
            Value::Int(_) => PropertyType::Int,
            Value::Float(_) => PropertyType::Float,
            Value::Str(_) => PropertyType::Str,
            Value::Timestamp(_) => PropertyType::Timestamp,
            Value::Array(items) => match items.first() {
                Some(first) => PropertyType::Array(Box::new(PropertyType::of(first))),
                None => PropertyType::Array(Box::new(PropertyType::Any)),
            },
            Value::Map(m) => PropertyType::Record(
                m.iter()
                    .map(|(k, v)| (k.clone(), PropertyType::of(v)))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyType::Int => write!(f, "int"),
            PropertyType::Float => write!(f, "float"),
            PropertyType::Bool => write!(f, "bool"),
            PropertyType::Str => write!(f, "str"),
            PropertyType::Timestamp => write!(f, "timestamp"),
            PropertyType::Array(t) => write!(f, "[{}]", t),
            PropertyType::Record(fields) => {
                write!(f, "{{")?;
                for (i, (name, ty)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", name, ty)?;
                }
                write!(f, "}}")
            }
            PropertyType::Any => write!(f, "any"),
        }
    }
}
