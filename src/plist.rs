//! Property-list shaped values.
//!
//! Kext metadata is a tree of dictionaries, arrays and scalars. The on-disk
//! representation read by default is the JSON form of a property list (as
//! produced by `plutil -convert json`). JSON has no data or date type, so those
//! are wrapped:
//!
//! ```text
//! {"$data": "deadbeef"}                  -> Value::Data
//! {"$date": "2024-01-01T00:00:00Z"}      -> Value::Date
//! ```

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fs;
use std::io;
use std::path::Path;

/// Dictionary keyed by property name. Iteration follows document order.
pub type Dictionary = IndexMap<String, Value>;

const DATA_TAG: &str = "$data";
const DATE_TAG: &str = "$date";

/// A property-list value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Integer(i64),
    Real(f64),
    Boolean(bool),
    Data(Vec<u8>),
    Date(DateTime<Utc>),
    Array(Vec<Value>),
    Dictionary(Dictionary),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_dictionary(&self) -> Option<&Dictionary> {
        match self {
            Value::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Name of the value's type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::Boolean(_) => "boolean",
            Value::Data(_) => "data",
            Value::Date(_) => "date",
            Value::Array(_) => "array",
            Value::Dictionary(_) => "dictionary",
        }
    }

    /// Convert from the JSON representation.
    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::String(String::new()),
            serde_json::Value::Bool(b) => Value::Boolean(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => match n.as_u64() {
                    Some(u) => Value::Integer(u as i64),
                    None => Value::Real(n.as_f64().unwrap_or(0.0)),
                },
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(serde_json::Value::String(encoded)) = map.get(DATA_TAG) {
                        if let Ok(bytes) = hex::decode(encoded) {
                            return Value::Data(bytes);
                        }
                    }
                    if let Some(serde_json::Value::String(stamp)) = map.get(DATE_TAG) {
                        if let Ok(date) = DateTime::parse_from_rfc3339(stamp) {
                            return Value::Date(date.with_timezone(&Utc));
                        }
                    }
                }
                Value::Dictionary(
                    map.into_iter()
                        .map(|(key, value)| (key, Value::from_json(value)))
                        .collect(),
                )
            }
        }
    }

    /// Convert to the JSON representation.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Real(r) => serde_json::Number::from_f64(*r)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Data(bytes) => {
                let mut map = serde_json::Map::new();
                map.insert(DATA_TAG.to_string(), serde_json::Value::String(hex::encode(bytes)));
                serde_json::Value::Object(map)
            }
            Value::Date(date) => {
                let mut map = serde_json::Map::new();
                map.insert(DATE_TAG.to_string(), serde_json::Value::String(date.to_rfc3339()));
                serde_json::Value::Object(map)
            }
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Dictionary(dict) => serde_json::Value::Object(
                dict.iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
        }
    }

    /// Find the first value that cannot be represented in the kernel's
    /// property tables, returning its colon-separated path below `path`.
    ///
    /// Strings, data, booleans, integers, dictionaries and arrays are legal;
    /// reals and dates are not.
    pub fn first_non_kernel_value(&self, path: &str) -> Option<String> {
        self.non_kernel_values(path).into_iter().next()
    }

    /// All values that cannot be represented in the kernel, by path.
    pub fn non_kernel_values(&self, path: &str) -> Vec<String> {
        let mut found = Vec::new();
        collect_non_kernel(self, path, &mut found);
        found
    }
}

fn collect_non_kernel(value: &Value, path: &str, found: &mut Vec<String>) {
    match value {
        Value::Real(_) | Value::Date(_) => found.push(path.to_string()),
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                collect_non_kernel(item, &format!("{}:{}", path, index), found);
            }
        }
        Value::Dictionary(dict) => {
            for (key, item) in dict {
                collect_non_kernel(item, &format!("{}:{}", path, key), found);
            }
        }
        _ => {}
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from_json)
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

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<Dictionary> for Value {
    fn from(d: Dictionary) -> Self {
        Value::Dictionary(d)
    }
}

/// Read a property-list file into a value.
///
/// Returns `Ok(None)` when the file exists but cannot be decoded; IO failures
/// (including a missing file) are returned as errors.
pub fn read_from_path(path: &Path) -> io::Result<Option<Value>> {
    let content = fs::read(path)?;
    match serde_json::from_slice::<serde_json::Value>(&content) {
        Ok(json) => Ok(Some(Value::from_json(json))),
        Err(e) => {
            log::debug!("[Plist] Failed to decode {}: {}", path.display(), e);
            Ok(None)
        }
    }
}

/// Write a value as a pretty-printed JSON property list.
pub fn write_to_path(value: &Value, path: &Path) -> io::Result<()> {
    let content = serde_json::to_vec_pretty(&value.to_json())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    fs::write(path, content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_integer_and_real_are_distinct() {
        let value = Value::from_json(json!({"a": 1, "b": 1.5}));
        let dict = value.as_dictionary().unwrap();
        assert_eq!(dict["a"], Value::Integer(1));
        assert_eq!(dict["b"], Value::Real(1.5));
    }

    #[test]
    fn test_data_and_date_wrappers() {
        let value = Value::from_json(json!({
            "blob": {"$data": "00ff"},
            "when": {"$date": "2024-03-01T12:00:00Z"},
            "plain": {"$data": "not hex"}
        }));
        let dict = value.as_dictionary().unwrap();
        assert_eq!(dict["blob"], Value::Data(vec![0x00, 0xff]));
        assert!(matches!(dict["when"], Value::Date(_)));
        assert!(matches!(dict["plain"], Value::Dictionary(_)));

        let back = Value::from_json(value.to_json());
        assert_eq!(back, value);
    }

    #[test]
    fn test_non_kernel_values_paths() {
        let value = Value::from_json(json!({
            "IOClass": "Driver",
            "Timeout": 2.5,
            "Nested": {"List": [1, 2.0, "x"]}
        }));
        let found = value.non_kernel_values("IOKitPersonalities:Main");
        assert_eq!(
            found,
            vec![
                "IOKitPersonalities:Main:Timeout".to_string(),
                "IOKitPersonalities:Main:Nested:List:1".to_string(),
            ]
        );
        assert!(Value::from("ok").first_non_kernel_value("x").is_none());
    }

    #[test]
    fn test_dictionary_keeps_document_order() {
        let text = r#"{"OSBundleLibraries": {"com.zzz.first": "1.0", "com.aaa.second": "2.0"}}"#;
        let value = Value::from_json(serde_json::from_str(text).unwrap());
        let libraries = value
            .as_dictionary()
            .and_then(|dict| dict.get("OSBundleLibraries"))
            .and_then(Value::as_dictionary)
            .unwrap();
        assert_eq!(
            libraries.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["com.zzz.first", "com.aaa.second"]
        );
        assert_eq!(serde_json::to_string(&value.to_json()).unwrap(), text);
    }

    #[test]
    fn test_read_undecodable_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Info.plist");
        fs::write(&path, b"<?xml version=\"1.0\"?><plist/>").unwrap();
        assert!(read_from_path(&path).unwrap().is_none());
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Info.plist");
        let mut dict = Dictionary::new();
        dict.insert("CFBundleIdentifier".into(), "com.example.a".into());
        write_to_path(&Value::Dictionary(dict.clone()), &path).unwrap();
        assert_eq!(read_from_path(&path).unwrap(), Some(Value::Dictionary(dict)));
    }
}
