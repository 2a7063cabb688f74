//! Decoded scalar values.

use serde::Serialize;

/// The value of a scalar object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    Bool(bool),
    Char(char),
    Pointer(u64),
    Enum { value: i64, name: Option<String> },
    Bitfield { value: u64, width: u32 },
}

impl Value {
    /// The value as an unsigned integer, reinterpreting signed values.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Unsigned(v) | Value::Pointer(v) => Some(*v),
            Value::Signed(v) => Some(*v as u64),
            Value::Bool(b) => Some(*b as u64),
            Value::Char(c) => Some(*c as u64),
            Value::Enum { value, .. } => Some(*value as u64),
            Value::Bitfield { value, .. } => Some(*value),
            Value::Float(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Signed(v) => Some(*v),
            Value::Enum { value, .. } => Some(*value),
            Value::Float(_) => None,
            other => other.as_u64().map(|v| v as i64),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Signed(v) => Some(*v as f64),
            other => other.as_u64().map(|v| v as f64),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Unsigned(v) | Value::Bitfield { value: v, .. } => write!(f, "{}", v),
            Value::Signed(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Char(c) => write!(f, "{:?}", c),
            Value::Pointer(p) => write!(f, "{:#x}", p),
            Value::Enum { value, name: Some(name) } => write!(f, "{} ({})", name, value),
            Value::Enum { value, name: None } => write!(f, "{}", value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions_and_display() {
        assert_eq!(Value::Signed(-1).as_u64(), Some(u64::MAX));
        assert_eq!(Value::Unsigned(7).as_i64(), Some(7));
        assert_eq!(Value::Float(1.5).as_u64(), None);
        assert_eq!(Value::Pointer(0x1000).to_string(), "0x1000");
        let running = Value::Enum {
            value: 0,
            name: Some("RUNNING".into()),
        };
        assert_eq!(running.to_string(), "RUNNING (0)");
        assert_eq!(serde_json::to_value(&running).unwrap()["name"], "RUNNING");
    }
}
