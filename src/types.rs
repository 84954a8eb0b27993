//! Typed values exchanged with scripts
//!
//! Inputs and outputs travel between the outer protocol layer, the runtime,
//! and the engine as [`Value`]s. Declared annotation types are a closed
//! [`DataType`] enum so coercion rules are exhaustive.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use strum::{Display, EnumIter, EnumString};

/// Declared type of an input or output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
#[strum(ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[strum(to_string = "double", serialize = "numeric")]
    Double,
    #[strum(to_string = "integer", serialize = "int")]
    Integer,
    #[strum(to_string = "string", serialize = "character")]
    String,
    #[strum(to_string = "boolean", serialize = "logical")]
    Boolean,
    /// A file path on the way in, a file produced in the workspace on the way out
    File,
}

/// A value bound in or read from a session workspace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Number(f64),
    Text(String),
    List(Vec<Value>),
}

/// Invocation inputs keyed by declared input identifier
pub type Inputs = BTreeMap<String, Value>;

/// Invocation results keyed by declared output identifier
pub type Outputs = BTreeMap<String, Value>;

impl Value {
    /// Parse a command-line or annotation literal.
    ///
    /// JSON literals (`3`, `2.5`, `true`, `[1, 2]`, `"text"`) parse as such;
    /// anything else is taken as plain text.
    pub fn parse_literal(raw: &str) -> Self {
        serde_json::from_str(raw.trim()).unwrap_or_else(|_| Value::Text(raw.to_string()))
    }

    /// Number of occurrences this value represents
    pub fn occurrences(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::List(items) => items.len(),
            _ => 1,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Convert a scalar to the declared type, `None` when no sensible
    /// conversion exists. Lists are converted element-wise.
    pub fn coerce(&self, ty: DataType) -> Option<Value> {
        if let Value::List(items) = self {
            return items
                .iter()
                .map(|item| item.coerce(ty))
                .collect::<Option<Vec<_>>>()
                .map(Value::List);
        }
        if matches!(self, Value::Null) {
            return Some(Value::Null);
        }

        match ty {
            DataType::Double => match self {
                Value::Number(n) => Some(Value::Number(*n)),
                Value::Integer(i) => Some(Value::Number(*i as f64)),
                Value::Text(s) => s.trim().parse::<f64>().ok().map(Value::Number),
                _ => None,
            },
            DataType::Integer => match self {
                Value::Integer(i) => Some(Value::Integer(*i)),
                Value::Number(n) if n.fract() == 0.0 && n.is_finite() => {
                    Some(Value::Integer(*n as i64))
                }
                Value::Text(s) => s.trim().parse::<i64>().ok().map(Value::Integer),
                _ => None,
            },
            DataType::Boolean => match self {
                Value::Bool(b) => Some(Value::Bool(*b)),
                Value::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "t" | "yes" => Some(Value::Bool(true)),
                    "false" | "f" | "no" => Some(Value::Bool(false)),
                    _ => None,
                },
                Value::Integer(0) => Some(Value::Bool(false)),
                Value::Integer(1) => Some(Value::Bool(true)),
                _ => None,
            },
            DataType::String => Some(Value::Text(self.to_string())),
            DataType::File => self.as_text().map(|s| Value::Text(s.to_string())),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Number(n) => write!(f, "{}", n),
            Value::Text(s) => write!(f, "{}", s),
            Value::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_data_type_parses_aliases() {
        assert_eq!(DataType::from_str("double").unwrap(), DataType::Double);
        assert_eq!(DataType::from_str("NUMERIC").unwrap(), DataType::Double);
        assert_eq!(DataType::from_str("logical").unwrap(), DataType::Boolean);
        assert_eq!(DataType::from_str("file").unwrap(), DataType::File);
        assert!(DataType::from_str("geotiff").is_err());
        assert_eq!(DataType::Double.to_string(), "double");
    }

    #[test]
    fn test_parse_literal() {
        assert_eq!(Value::parse_literal("3"), Value::Integer(3));
        assert_eq!(Value::parse_literal("2.5"), Value::Number(2.5));
        assert_eq!(Value::parse_literal("true"), Value::Bool(true));
        assert_eq!(Value::parse_literal("hello"), Value::Text("hello".to_string()));
        assert_eq!(
            Value::parse_literal("[1, 2]"),
            Value::List(vec![Value::Integer(1), Value::Integer(2)])
        );
    }

    #[test]
    fn test_coerce_numeric() {
        assert_eq!(Value::Integer(3).coerce(DataType::Double), Some(Value::Number(3.0)));
        assert_eq!(Value::Number(4.0).coerce(DataType::Integer), Some(Value::Integer(4)));
        assert_eq!(Value::Number(4.5).coerce(DataType::Integer), None);
        assert_eq!(
            Value::Text(" 1.5 ".to_string()).coerce(DataType::Double),
            Some(Value::Number(1.5))
        );
        assert_eq!(Value::Text("abc".to_string()).coerce(DataType::Double), None);
    }

    #[test]
    fn test_coerce_list_is_all_or_nothing() {
        let list = Value::List(vec![Value::Integer(1), Value::Text("x".to_string())]);
        assert_eq!(list.coerce(DataType::Double), None);

        let list = Value::List(vec![Value::Integer(1), Value::Integer(2)]);
        assert_eq!(
            list.coerce(DataType::Double),
            Some(Value::List(vec![Value::Number(1.0), Value::Number(2.0)]))
        );
    }

    #[test]
    fn test_coerce_boolean_and_file() {
        assert_eq!(
            Value::Text("TRUE".to_string()).coerce(DataType::Boolean),
            Some(Value::Bool(true))
        );
        assert_eq!(Value::Integer(2).coerce(DataType::Boolean), None);
        assert_eq!(Value::Integer(2).coerce(DataType::File), None);
    }

    #[test]
    fn test_occurrences() {
        assert_eq!(Value::Null.occurrences(), 0);
        assert_eq!(Value::Integer(1).occurrences(), 1);
        assert_eq!(Value::List(vec![Value::Null, Value::Null]).occurrences(), 2);
    }
}
