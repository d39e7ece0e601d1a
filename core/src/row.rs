//! Flat result rows as returned by SQL adapters.

use std::collections::HashMap;

use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::value::Value;

/// One fetched row: output column aliases (logical dot paths) to values,
/// plus the to-many child rows the merger attaches under relation paths.
#[derive(Debug, Clone, Default)]
pub struct FlatRow {
    pub values: HashMap<String, Value>,
    pub children: Vec<(String, Vec<FlatRow>)>,
}

impl FlatRow {
    pub fn new() -> FlatRow {
        FlatRow::default()
    }

    pub fn from_values(values: HashMap<String, Value>) -> FlatRow {
        FlatRow {
            values,
            children: Vec::new(),
        }
    }

    pub fn get(&self, alias: &str) -> Option<&Value> {
        self.values.get(alias)
    }

    /// The value under an output alias; absent columns read as NULL.
    pub fn value(&self, alias: &str) -> Value {
        self.values.get(alias).cloned().unwrap_or(Value::Null)
    }

    /// Re-roots the row at `path`: keeps only keys under `path.` with the
    /// prefix stripped, recursing into attached children.
    pub fn rooted_at(&self, path: &str) -> FlatRow {
        let prefix = format!("{path}.");
        let values = self
            .values
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(&prefix)
                    .map(|stripped| (stripped.to_string(), value.clone()))
            })
            .collect();
        let children = self
            .children
            .iter()
            .filter_map(|(key, rows)| {
                key.strip_prefix(&prefix)
                    .map(|stripped| (stripped.to_string(), rows.clone()))
            })
            .collect();
        FlatRow { values, children }
    }

    /// Converts into a flat JSON object: dotted keys for values, arrays for
    /// merged children. The unflattener turns this into the nested shape.
    pub fn into_json(self) -> JsonValue {
        let mut map = JsonMap::new();
        for (key, value) in self.values {
            map.insert(key, value.into_json());
        }
        for (path, rows) in self.children {
            let items = rows.into_iter().map(FlatRow::into_json).collect();
            map.insert(path, JsonValue::Array(items));
        }
        JsonValue::Object(map)
    }
}
