use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

/// Tagged value used for all structured data crossing the host boundary:
/// call results, event attributes, and anything a contract hands back to an
/// embedder. The tag travels with the data, so both sides agree on the shape
/// without an external schema.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub enum Value {
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Signed 64-bit integer.
    Int(i64),
    /// UTF-8 string.
    Str(String),
    /// Ordered key/value pairs. A vector rather than a map type keeps the
    /// encoding deterministic in insertion order.
    Map(Vec<(String, Value)>),
}

impl Value {
    /// Unit result for calls with nothing to return.
    pub fn unit() -> Self {
        Value::Bytes(Vec::new())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Look up a key in a `Map` value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_get() {
        let v = Value::Map(vec![
            ("a".to_string(), Value::Int(1)),
            ("b".to_string(), Value::Str("x".to_string())),
        ]);
        assert_eq!(v.get("a").and_then(Value::as_int), Some(1));
        assert_eq!(v.get("b").and_then(Value::as_str), Some("x"));
        assert!(v.get("c").is_none());
    }

    #[test]
    fn test_accessors_reject_wrong_variant() {
        let v = Value::Int(5);
        assert!(v.as_str().is_none());
        assert!(v.as_bytes().is_none());
        assert!(v.get("k").is_none());
    }
}
