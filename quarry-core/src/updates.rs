//! Column/value maps consumed by `create_from` and `update`

use crate::error::{Error, Result};
use crate::executor::Row;
use crate::value::Value;
use serde::Serialize;
use std::collections::{btree_map, BTreeMap, HashMap};

/// A mapping from column name to new value
///
/// Iteration order is sorted by column name, which keeps rendered SQL stable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Updates {
    columns: BTreeMap<String, Value>,
}

impl Updates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a column, returning the map for chaining
    pub fn set(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.columns.insert(column.into(), value.into())
    }

    pub fn remove(&mut self, column: &str) -> Option<Value> {
        self.columns.remove(column)
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    /// Remove every entry whose value is a NULL equivalent
    ///
    /// Unset options, literal nulls and empty JSON documents go; zero values of
    /// ordinary types (`0`, `false`, `""`) stay.
    pub fn strip_nils(mut self) -> Self {
        self.columns.retain(|_, value| !value.is_null_equivalent());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.columns.iter()
    }

    /// Build from any record that serializes to a JSON object
    ///
    /// Fields serialized as `null` are kept as [`Value::Null`]; chain
    /// [`strip_nils`](Self::strip_nils) to drop them.
    pub fn from_model<T: Serialize + ?Sized>(record: &T) -> Result<Self> {
        match serde_json::to_value(record)? {
            serde_json::Value::Object(fields) => Ok(fields
                .into_iter()
                .map(|(column, value)| (column, Value::from_json(value)))
                .collect()),
            other => Err(Error::missing_data(format!(
                "record serialized to {} rather than an object of columns",
                json_kind(&other)
            ))),
        }
    }

    pub fn to_row(&self) -> Row {
        self.columns
            .iter()
            .map(|(column, value)| (column.clone(), value.to_json()))
            .collect()
    }

    /// The map as one JSON document, the shape `jsonb_populate_record` consumes
    pub fn to_document(&self) -> serde_json::Value {
        serde_json::Value::Object(self.to_row())
    }
}

pub(crate) fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

impl<K, V> FromIterator<(K, V)> for Updates
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            columns: iter
                .into_iter()
                .map(|(column, value)| (column.into(), value.into()))
                .collect(),
        }
    }
}

impl<K, V> From<HashMap<K, V>> for Updates
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from(map: HashMap<K, V>) -> Self {
        map.into_iter().collect()
    }
}

impl<K, V> From<BTreeMap<K, V>> for Updates
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from(map: BTreeMap<K, V>) -> Self {
        map.into_iter().collect()
    }
}

impl IntoIterator for Updates {
    type Item = (String, Value);
    type IntoIter = btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.columns.into_iter()
    }
}

impl<'a> IntoIterator for &'a Updates {
    type Item = (&'a String, &'a Value);
    type IntoIter = btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.columns.iter()
    }
}
