//! CoMap: last-writer-wins map fold
//!
//! Each change is a `set` or `del` on a string key. The fold is LWW per
//! key, ordered by the causal key; since the fold input arrives in
//! causal order, later entries simply overwrite earlier ones. Edit
//! history stays recoverable by walking the underlying transactions.

use cojson_model::CausalKey;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// A decoded CoMap change.
#[derive(Clone, Debug, PartialEq)]
pub enum MapOp {
    Set { key: String, value: Value },
    Del { key: String },
}

impl MapOp {
    /// Decode a change record; unrecognized shapes are skipped by the
    /// fold (None), never an error: a newer writer may know ops this
    /// replica does not.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        match obj.get("op")?.as_str()? {
            "set" => Some(MapOp::Set {
                key: obj.get("key")?.as_str()?.to_string(),
                value: obj.get("value")?.clone(),
            }),
            "del" => Some(MapOp::Del {
                key: obj.get("key")?.as_str()?.to_string(),
            }),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            MapOp::Set { key, value } => json!({"op": "set", "key": key, "value": value}),
            MapOp::Del { key } => json!({"op": "del", "key": key}),
        }
    }

    /// Convenience constructors for the write path.
    pub fn set(key: impl Into<String>, value: Value) -> Value {
        MapOp::Set {
            key: key.into(),
            value,
        }
        .to_value()
    }

    pub fn del(key: impl Into<String>) -> Value {
        MapOp::Del { key: key.into() }.to_value()
    }
}

/// The winner for one key.
#[derive(Clone, Debug, PartialEq)]
pub struct MapEntry {
    /// None means the last write was a deletion.
    pub value: Option<Value>,
    /// Causal key of the winning write.
    pub at: CausalKey,
}

/// Materialized LWW view of a CoMap.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MapView {
    entries: BTreeMap<String, MapEntry>,
}

impl MapView {
    /// Fold transactions (already sorted by causal key) into the view.
    pub fn fold<'a>(txs: impl Iterator<Item = (CausalKey, &'a [Value])>) -> Self {
        let mut view = MapView::default();
        for (at, changes) in txs {
            view.apply(at, changes);
        }
        view
    }

    /// Apply one transaction's changes at its causal position.
    pub fn apply(&mut self, at: CausalKey, changes: &[Value]) {
        for change in changes {
            match MapOp::from_value(change) {
                Some(MapOp::Set { key, value }) => {
                    self.entries.insert(
                        key,
                        MapEntry {
                            value: Some(value),
                            at,
                        },
                    );
                }
                Some(MapOp::Del { key }) => {
                    self.entries.insert(key, MapEntry { value: None, at });
                }
                None => {}
            }
        }
    }

    /// The last-write winner for a key, if present and not deleted.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).and_then(|e| e.value.as_ref())
    }

    /// Causal key of the last edit to a key (set or delete).
    pub fn last_edit(&self, key: &str) -> Option<&CausalKey> {
        self.entries.get(key).map(|e| &e.at)
    }

    /// Keys with a live (non-deleted) value, sorted.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(_, e)| e.value.is_some())
            .map(|(k, _)| k.as_str())
    }

    /// Live entries, sorted by key.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries
            .iter()
            .filter_map(|(k, e)| e.value.as_ref().map(|v| (k.as_str(), v)))
    }

    pub fn len(&self) -> usize {
        self.entries.values().filter(|e| e.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
