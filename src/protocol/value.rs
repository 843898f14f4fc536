//! Self-describing protocol values.
//!
//! The worker protocol carries a small JSON-like value model with one
//! addition: raw byte buffers, which travel without any transformation so
//! large compiled outputs are never copied into strings.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{PackwireError, Result};

/// A value carried inside a packet.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i32),
    String(String),
    Bytes(Bytes),
    Array(Vec<Value>),
    Map(Map),
}

/// Insertion-ordered string-keyed map.
///
/// Order is part of the wire encoding, so a decoded map re-encodes to the
/// exact same bytes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Map {
    entries: Vec<(String, Value)>,
}

impl Map {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert a value, replacing an existing entry in place.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Map {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Map::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl IntoIterator for Map {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Non-negative integers, used for ids and build keys.
    pub fn as_u32(&self) -> Option<u32> {
        self.as_i32().and_then(|n| u32::try_from(n).ok())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Field lookup on a map value; `None` for any other variant.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Text or bytes as an owned byte buffer.
    pub fn to_bytes(&self) -> Option<Bytes> {
        match self {
            Value::Bytes(b) => Some(b.clone()),
            Value::String(s) => Some(Bytes::copy_from_slice(s.as_bytes())),
            _ => None,
        }
    }

    /// Convert any serde-serializable record into a protocol value.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self> {
        Self::try_from(serde_json::to_value(value)?)
    }

    /// Deserialize a protocol value into a serde record.
    ///
    /// Byte buffers become arrays of numbers on the way, so records that
    /// carry bytes should pull those fields out before calling this.
    pub fn deserialize_into<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(serde_json::Value::from(self))?)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n)
    }
}

impl From<u32> for Value {
    /// Ids and keys stay within [`ID_MASK`](super::codec::ID_MASK); anything
    /// larger has no int32 form and becomes null.
    fn from(n: u32) -> Self {
        i32::try_from(n).map(Value::Int).unwrap_or(Value::Null)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&String> for Value {
    fn from(s: &String) -> Self {
        Value::String(s.clone())
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(Bytes::from(b))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Vec<String>> for Value {
    fn from(items: Vec<String>) -> Self {
        Value::Array(items.into_iter().map(Value::String).collect())
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Value::Map(map)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Value::Null)
    }
}

impl TryFrom<serde_json::Value> for Value {
    type Error = PackwireError;

    fn try_from(json: serde_json::Value) -> Result<Self> {
        Ok(match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                let int = n
                    .as_i64()
                    .and_then(|i| i32::try_from(i).ok())
                    .ok_or_else(|| PackwireError::Malformed(format!("number {} does not fit in int32", n)))?;
                Value::Int(int)
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::try_from).collect::<Result<_>>()?)
            }
            serde_json::Value::Object(obj) => {
                let mut map = Map::with_capacity(obj.len());
                for (k, v) in obj {
                    map.insert(k, Value::try_from(v)?);
                }
                Value::Map(map)
            }
        })
    }
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(n) => serde_json::Value::from(*n),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::Array(b.iter().map(|&x| serde_json::Value::from(x)).collect()),
            Value::Array(items) => serde_json::Value::Array(items.iter().map(serde_json::Value::from).collect()),
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.to_string(), serde_json::Value::from(v))).collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_map_insert_replaces_in_place() {
        let mut map = Map::new().with("a", 1).with("b", 2);
        map.insert("a", 10);
        let keys: Vec<&str> = map.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(map.get("a"), Some(&Value::Int(10)));
    }

    #[test]
    fn test_map_remove() {
        let mut map = Map::new().with("a", 1).with("b", 2);
        assert_eq!(map.remove("a"), Some(Value::Int(1)));
        assert_eq!(map.len(), 1);
        assert!(map.remove("missing").is_none());
    }

    #[test]
    fn test_accessors() {
        let value = Value::Map(Map::new().with("command", "build").with("key", 3u32));
        assert_eq!(value.get("command").and_then(Value::as_str), Some("build"));
        assert_eq!(value.get("key").and_then(Value::as_u32), Some(3));
        assert!(value.get("missing").is_none());
        assert!(Value::Int(-1).as_u32().is_none());
    }

    #[test]
    fn test_option_into_value() {
        let none: Option<&str> = None;
        assert!(Value::from(none).is_null());
        assert_eq!(Value::from(Some("x")), Value::String("x".into()));
    }

    #[test]
    fn test_u32_beyond_int32_becomes_null() {
        assert_eq!(Value::from(7u32), Value::Int(7));
        assert_eq!(Value::from(i32::MAX as u32), Value::Int(i32::MAX));
        assert!(Value::from(u32::MAX).is_null());
    }

    #[test]
    fn test_from_json_rejects_floats() {
        let result = Value::try_from(serde_json::json!({"n": 1.5}));
        assert!(matches!(result, Err(PackwireError::Malformed(_))));
    }

    #[test]
    fn test_serde_round_trip_through_value() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Loc {
            file: String,
            line_text: String,
            line: i32,
        }

        let loc = Loc {
            file: "a.ts".into(),
            line_text: "let x".into(),
            line: 4,
        };
        let value = Value::from_serialize(&loc).unwrap();
        assert_eq!(value.get("lineText").and_then(Value::as_str), Some("let x"));
        let back: Loc = value.deserialize_into().unwrap();
        assert_eq!(back, loc);
    }

    #[test]
    fn test_to_bytes_accepts_text() {
        assert_eq!(Value::from("hi").to_bytes(), Some(Bytes::from_static(b"hi")));
        assert!(Value::Int(1).to_bytes().is_none());
    }
}
