//! Value types for SQL parameters

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A SQL value that can be used as a parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// 32-bit integer
    I32(i32),
    /// 64-bit integer
    I64(i64),
    /// 32-bit float
    F32(f32),
    /// 64-bit float
    F64(f64),
    /// String value
    String(String),
    /// Bytes value
    Bytes(Vec<u8>),
    /// JSON value
    Json(serde_json::Value),
    /// Array of values, expanded to one placeholder per element when rendered
    Array(Vec<Value>),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Decimal(Decimal),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True for `NULL` and for a JSON document that holds nothing
    ///
    /// These are the entries [`Updates::strip_nils`](crate::Updates::strip_nils) removes.
    pub fn is_null_equivalent(&self) -> bool {
        matches!(self, Value::Null | Value::Json(serde_json::Value::Null))
    }

    /// Parse a raw JSON document; zero bytes is an empty (null) document
    pub fn json_document(raw: &[u8]) -> Result<Self> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Json(serde_json::Value::Null));
        }
        let doc = serde_json::from_slice(raw)
            .map_err(|e| Error::not_valid(format!("malformed JSON document: {e}")).with_source(e))?;
        Ok(Value::Json(doc))
    }

    /// Map a JSON value onto the closest parameter type
    ///
    /// Objects and arrays stay JSON documents so they can populate `json`/`jsonb`
    /// and array columns unchanged.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::I64(i),
                None => n.as_f64().map(Value::F64).unwrap_or(Value::Json(n.into())),
            },
            serde_json::Value::String(s) => Value::String(s),
            other => Value::Json(other),
        }
    }

    /// Render as JSON in the text forms Postgres accepts for each column type
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;

        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::I32(i) => Json::from(*i),
            Value::I64(i) => Json::from(*i),
            Value::F32(f) => float_to_json(f64::from(*f)),
            Value::F64(f) => float_to_json(*f),
            Value::String(s) => Json::String(s.clone()),
            Value::Bytes(bytes) => Json::String(bytea_hex(bytes)),
            Value::Json(doc) => doc.clone(),
            Value::Array(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Uuid(id) => Json::String(id.to_string()),
            Value::Timestamp(ts) => Json::String(ts.to_rfc3339()),
            Value::Decimal(d) => Json::String(d.to_string()),
        }
    }
}

fn float_to_json(f: f64) -> serde_json::Value {
    // float8 input accepts 'NaN' and 'Infinity'; JSON numbers cannot carry them
    serde_json::Number::from_f64(f)
        .map(serde_json::Value::Number)
        .unwrap_or_else(|| serde_json::Value::String(f.to_string().replace("inf", "Infinity")))
}

fn bytea_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

impl From<Value> for serde_json::Value {
    fn from(val: Value) -> Self {
        val.to_json()
    }
}

// Implement From for common types
impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(val: bool) -> Self {
        Value::Bool(val)
    }
}

impl From<i32> for Value {
    fn from(val: i32) -> Self {
        Value::I32(val)
    }
}

impl From<i64> for Value {
    fn from(val: i64) -> Self {
        Value::I64(val)
    }
}

impl From<f32> for Value {
    fn from(val: f32) -> Self {
        Value::F32(val)
    }
}

impl From<f64> for Value {
    fn from(val: f64) -> Self {
        Value::F64(val)
    }
}

impl From<String> for Value {
    fn from(val: String) -> Self {
        Value::String(val)
    }
}

impl From<&str> for Value {
    fn from(val: &str) -> Self {
        Value::String(val.to_string())
    }
}

impl From<&String> for Value {
    fn from(val: &String) -> Self {
        Value::String(val.clone())
    }
}

impl From<Vec<u8>> for Value {
    fn from(val: Vec<u8>) -> Self {
        Value::Bytes(val)
    }
}

impl From<serde_json::Value> for Value {
    fn from(val: serde_json::Value) -> Self {
        Value::Json(val)
    }
}

impl From<Uuid> for Value {
    fn from(val: Uuid) -> Self {
        Value::Uuid(val)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(val: DateTime<Utc>) -> Self {
        Value::Timestamp(val)
    }
}

impl From<Decimal> for Value {
    fn from(val: Decimal) -> Self {
        Value::Decimal(val)
    }
}

impl<T> From<Vec<T>> for Value
where
    T: Into<Value>,
{
    fn from(vals: Vec<T>) -> Self {
        Value::Array(vals.into_iter().map(|v| v.into()).collect())
    }
}

impl<T> From<&[T]> for Value
where
    T: Clone + Into<Value>,
{
    fn from(vals: &[T]) -> Self {
        Value::Array(vals.iter().cloned().map(|v| v.into()).collect())
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(val) => val.into(),
            None => Value::Null,
        }
    }
}
