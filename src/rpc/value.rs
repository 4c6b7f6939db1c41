//! Values exchanged as RPC arguments and results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::uri::ResourceUri;
use crate::errors::RemoteError;

/// Dynamically typed RPC value.
///
/// Serialised adjacently tagged (`{"$t": "uri", "v": {...}}`) so rich kinds
/// such as [`ResourceUri`] and binary buffers keep their structure on the
/// wire instead of collapsing into strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "$t", content = "v", rename_all = "snake_case")]
pub enum RpcValue {
    /// Absent value.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number. Non-finite values travel as `"NaN"`,
    /// `"Infinity"` or `"-Infinity"`.
    Float(#[serde(with = "wire_float")] f64),
    /// UTF-8 string.
    String(String),
    /// Raw bytes.
    Buffer(Vec<u8>),
    /// Ordered list.
    List(Vec<RpcValue>),
    /// String-keyed map with deterministic ordering.
    Map(BTreeMap<String, RpcValue>),
    /// Resource identifier.
    Uri(ResourceUri),
}

impl RpcValue {
    /// Whether this is [`RpcValue::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// String content, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Boolean content.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer content.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// List content.
    #[must_use]
    pub fn as_list(&self) -> Option<&[RpcValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Map content.
    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<String, RpcValue>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// URI content.
    #[must_use]
    pub fn as_uri(&self) -> Option<&ResourceUri> {
        match self {
            Self::Uri(uri) => Some(uri),
            _ => None,
        }
    }

    /// Buffer content.
    #[must_use]
    pub fn as_buffer(&self) -> Option<&[u8]> {
        match self {
            Self::Buffer(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Map entry lookup; `None` for non-maps and missing keys.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&RpcValue> {
        self.as_map().and_then(|map| map.get(key))
    }

    /// Build a map from key/value pairs.
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, RpcValue)>,
    {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Human-readable kind name used in argument errors.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Buffer(_) => "buffer",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Uri(_) => "uri",
        }
    }
}

impl From<bool> for RpcValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for RpcValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for RpcValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for RpcValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for RpcValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for RpcValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<ResourceUri> for RpcValue {
    fn from(value: ResourceUri) -> Self {
        Self::Uri(value)
    }
}

impl From<Vec<RpcValue>> for RpcValue {
    fn from(value: Vec<RpcValue>) -> Self {
        Self::List(value)
    }
}

impl From<Vec<String>> for RpcValue {
    fn from(value: Vec<String>) -> Self {
        Self::List(value.into_iter().map(Self::String).collect())
    }
}

impl<T: Into<RpcValue>> From<Option<T>> for RpcValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl From<&toml::Value> for RpcValue {
    fn from(value: &toml::Value) -> Self {
        match value {
            toml::Value::String(s) => Self::String(s.clone()),
            toml::Value::Integer(n) => Self::Int(*n),
            toml::Value::Float(f) => Self::Float(*f),
            toml::Value::Boolean(b) => Self::Bool(*b),
            toml::Value::Datetime(dt) => Self::String(dt.to_string()),
            toml::Value::Array(items) => Self::List(items.iter().map(Self::from).collect()),
            toml::Value::Table(table) => Self::Map(
                table
                    .iter()
                    .map(|(k, v)| (k.clone(), Self::from(v)))
                    .collect(),
            ),
        }
    }
}

/// JSON has no literal for NaN or the infinities; serde_json would write
/// them as `null`, which no peer can read back as a float.
mod wire_float {
    use serde::{de, Deserialize, Deserializer, Serializer};

    const NAN: &str = "NaN";
    const INFINITY: &str = "Infinity";
    const NEG_INFINITY: &str = "-Infinity";

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Named(String),
    }

    pub(super) fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_str(NAN)
        } else if value.is_infinite() {
            serializer.serialize_str(if value.is_sign_positive() { INFINITY } else { NEG_INFINITY })
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(n),
            Repr::Named(name) => match name.as_str() {
                NAN => Ok(f64::NAN),
                INFINITY => Ok(f64::INFINITY),
                NEG_INFINITY => Ok(f64::NEG_INFINITY),
                other => Err(de::Error::custom(format!("invalid float '{other}'"))),
            },
        }
    }
}

/// Positional argument reader that turns shape mismatches into
/// `invalid_arguments` remote errors.
#[derive(Debug)]
pub struct Args<'a> {
    method: &'a str,
    values: &'a [RpcValue],
}

impl<'a> Args<'a> {
    /// Wrap the arguments of `method`.
    #[must_use]
    pub fn new(method: &'a str, values: &'a [RpcValue]) -> Self {
        Self { method, values }
    }

    /// Argument at `index`, or `Null` when absent.
    #[must_use]
    pub fn value(&self, index: usize) -> &'a RpcValue {
        const NULL: &RpcValue = &RpcValue::Null;
        self.values.get(index).unwrap_or(NULL)
    }

    /// Required string argument.
    ///
    /// # Errors
    ///
    /// Returns an `invalid_arguments` error when missing or not a string.
    pub fn string(&self, index: usize, name: &str) -> Result<&'a str, RemoteError> {
        let value = self.value(index);
        value.as_str().ok_or_else(|| self.mismatch(index, name, "string", value))
    }

    /// Optional string argument; `Null` maps to `None`.
    ///
    /// # Errors
    ///
    /// Returns an `invalid_arguments` error when present but not a string.
    pub fn opt_string(&self, index: usize, name: &str) -> Result<Option<&'a str>, RemoteError> {
        match self.value(index) {
            RpcValue::Null => Ok(None),
            RpcValue::String(s) => Ok(Some(s)),
            other => Err(self.mismatch(index, name, "string", other)),
        }
    }

    /// Required integer argument.
    ///
    /// # Errors
    ///
    /// Returns an `invalid_arguments` error when missing or not an integer.
    pub fn int(&self, index: usize, name: &str) -> Result<i64, RemoteError> {
        let value = self.value(index);
        value.as_i64().ok_or_else(|| self.mismatch(index, name, "int", value))
    }

    /// Required URI argument.
    ///
    /// # Errors
    ///
    /// Returns an `invalid_arguments` error when missing or not a URI.
    pub fn uri(&self, index: usize, name: &str) -> Result<&'a ResourceUri, RemoteError> {
        let value = self.value(index);
        value.as_uri().ok_or_else(|| self.mismatch(index, name, "uri", value))
    }

    fn mismatch(&self, index: usize, name: &str, expected: &str, got: &RpcValue) -> RemoteError {
        RemoteError::invalid_args(format!(
            "{}: argument {index} ({name}) must be {expected}, got {}",
            self.method,
            got.kind_name()
        ))
    }
}
