//! Changeset value types.
//!
//! A record is an opaque row; the engine touches only the reserved columns
//! `node_id` (originator) and `modified` (HLC of last write).

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::CoreError;
use super::identity::NodeId;
use super::time::Hlc;

pub const COL_NODE_ID: &str = "node_id";
pub const COL_MODIFIED: &str = "modified";

/// One row: opaque key/value mapping.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(pub BTreeMap<String, Value>);

impl Record {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    /// Originating node, from the `node_id` column.
    pub fn node_id(&self) -> Result<NodeId, CoreError> {
        let raw = self
            .0
            .get(COL_NODE_ID)
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::InvalidNodeId {
                reason: format!("record is missing a string {COL_NODE_ID} column"),
            })?;
        NodeId::new(raw)
    }

    /// Last-write timestamp, from the `modified` column.
    pub fn modified(&self) -> Result<Hlc, CoreError> {
        let raw = self
            .0
            .get(COL_MODIFIED)
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::InvalidHlc {
                raw: String::new(),
                reason: format!("record is missing a string {COL_MODIFIED} column"),
            })?;
        Hlc::parse(raw)
    }

    pub fn set_modified(&mut self, hlc: &Hlc) {
        self.0
            .insert(COL_MODIFIED.to_string(), Value::String(hlc.to_string()));
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Delta: table name to ordered rows. Empty tables are elided before
/// transmission.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Changeset(pub BTreeMap<String, Vec<Record>>);

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn records(&self, table: &str) -> &[Record] {
        self.0.get(table).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn push(&mut self, table: impl Into<String>, record: Record) {
        self.0.entry(table.into()).or_default().push(record);
    }

    /// Row count per table, for the changeset hooks.
    pub fn counts(&self) -> BTreeMap<String, usize> {
        self.0
            .iter()
            .filter(|(_, records)| !records.is_empty())
            .map(|(table, records)| (table.clone(), records.len()))
            .collect()
    }

    /// Drop tables left without rows.
    pub fn prune_empty(&mut self) {
        self.0.retain(|_, records| !records.is_empty());
    }
}

/// Change-stream event: one successful local write.
#[derive(Clone, Debug, PartialEq)]
pub struct TableChange {
    pub hlc: Hlc,
    pub tables: BTreeSet<String>,
}
