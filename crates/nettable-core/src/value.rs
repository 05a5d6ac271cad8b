//! Typed values replicated between peers.
//!
//! A [`Value`] is immutable once constructed. Arrays are bounded to 255
//! elements on the wire; the bound is enforced at encode time, not here.

use std::fmt;

use bytes::Bytes;

/// The closed set of value types carried by the protocol.
///
/// `Unassigned` never appears in a live [`Value`]; it is the type of an
/// entry slot that has been reserved but not yet written, and encoding
/// it is always an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Unassigned,
    Boolean,
    Double,
    String,
    Raw,
    Rpc,
    BooleanArray,
    DoubleArray,
    StringArray,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Unassigned => "unassigned",
            ValueType::Boolean => "boolean",
            ValueType::Double => "double",
            ValueType::String => "string",
            ValueType::Raw => "raw",
            ValueType::Rpc => "rpc",
            ValueType::BooleanArray => "boolean[]",
            ValueType::DoubleArray => "double[]",
            ValueType::StringArray => "string[]",
        };
        f.write_str(name)
    }
}

/// A typed, immutable value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    Double(f64),
    Str(String),
    Raw(Bytes),
    Rpc(Bytes),
    BooleanArray(Vec<bool>),
    DoubleArray(Vec<f64>),
    StringArray(Vec<String>),
}

impl Value {
    /// The type tag of this value.
    pub fn ty(&self) -> ValueType {
        match self {
            Value::Boolean(_) => ValueType::Boolean,
            Value::Double(_) => ValueType::Double,
            Value::Str(_) => ValueType::String,
            Value::Raw(_) => ValueType::Raw,
            Value::Rpc(_) => ValueType::Rpc,
            Value::BooleanArray(_) => ValueType::BooleanArray,
            Value::DoubleArray(_) => ValueType::DoubleArray,
            Value::StringArray(_) => ValueType::StringArray,
        }
    }

    /// Extract a boolean, if that is what this value holds.
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Extract a double, if that is what this value holds.
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    /// Extract a string slice, if that is what this value holds.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_type_mapping() {
        assert_eq!(Value::Boolean(true).ty(), ValueType::Boolean);
        assert_eq!(Value::Double(0.5).ty(), ValueType::Double);
        assert_eq!(Value::Str("x".into()).ty(), ValueType::String);
        assert_eq!(Value::Raw(Bytes::from_static(b"x")).ty(), ValueType::Raw);
        assert_eq!(Value::BooleanArray(vec![true]).ty(), ValueType::BooleanArray);
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(Value::Boolean(true).as_boolean(), Some(true));
        assert_eq!(Value::Boolean(true).as_double(), None);
        assert_eq!(Value::from("hello").as_str(), Some("hello"));
    }
}
