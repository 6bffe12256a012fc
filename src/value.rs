use std::collections::BTreeMap;

use crate::key::Key;

/// A stored record
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Build an object from field/value pairs.
    pub fn object<I, K>(fields: I) -> Value
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Look up a dotted key path such as `author.name`.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        path.split('.').try_fold(self, |value, field| match value {
            Value::Object(map) => map.get(field),
            _ => None,
        })
    }

    /// Set a top-level field, used to write back generated keys.
    pub fn set_field(&mut self, field: &str, value: Value) -> bool {
        match self {
            Value::Object(map) => {
                map.insert(field.to_string(), value);
                true
            }
            _ => false,
        }
    }

    /// Convert to a key; `None` for values that cannot be keys.
    pub fn to_key(&self) -> Option<Key> {
        match self {
            Value::Number(n) if !n.is_nan() => Some(Key::Number(*n)),
            Value::String(s) => Some(Key::String(s.clone())),
            Value::Bytes(b) => Some(Key::Binary(b.clone())),
            Value::Array(items) => items
                .iter()
                .map(Value::to_key)
                .collect::<Option<Vec<_>>>()
                .map(Key::Array),
            _ => None,
        }
    }

    /// Extract the key found at `path`.
    pub fn key_at(&self, path: &str) -> Option<Key> {
        self.get_path(path).and_then(Value::to_key)
    }
}

impl From<&Key> for Value {
    fn from(key: &Key) -> Value {
        match key {
            Key::Number(n) => Value::Number(*n),
            Key::Date(ms) => Value::Number(*ms as f64),
            Key::String(s) => Value::String(s.clone()),
            Key::Binary(b) => Value::Bytes(b.clone()),
            Key::Array(items) => Value::Array(items.iter().map(Value::from).collect()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::String(s.to_string())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Value {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Value {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}
