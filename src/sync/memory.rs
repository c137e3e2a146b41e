//! In-memory reference store.
//!
//! A last-writer-wins row store keyed by the `id` column, with the HLC
//! clock and change stream the engine expects. The integration tests run
//! whole topologies on it; applications embedding a real database implement
//! `SyncStore` against that instead.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use serde_json::Value;

use crate::core::{COL_NODE_ID, Changeset, Hlc, NodeId, Record, TableChange, now_ms};

use super::broadcast::{ChangeBroadcaster, ChangeSubscription};
use super::error::StoreError;
use super::store::{ChangesetQuery, NodeFilter, SyncStore};

const COL_ID: &str = "id";

struct Inner {
    tables: BTreeMap<String, BTreeMap<String, Record>>,
    clock: Hlc,
}

pub struct MemoryStore {
    local: NodeId,
    inner: Mutex<Inner>,
    broadcaster: ChangeBroadcaster,
}

impl MemoryStore {
    pub fn new(local: NodeId) -> Self {
        Self {
            inner: Mutex::new(Inner {
                tables: BTreeMap::new(),
                clock: Hlc::zero(local.clone()),
            }),
            local,
            broadcaster: ChangeBroadcaster::new(),
        }
    }

    /// Local write: upsert one row and notify subscribers. Returns the
    /// write's timestamp.
    pub fn insert(&self, table: &str, id: &str, fields: Value) -> Hlc {
        let hlc = {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            inner.clock = inner.clock.tick(now_ms());
            let hlc = inner.clock.clone();

            let mut record = Record::default();
            if let Value::Object(fields) = fields {
                for (key, value) in fields {
                    record.insert(key, value);
                }
            }
            record.insert(COL_ID, Value::String(id.to_string()));
            record.insert(COL_NODE_ID, Value::String(self.local.to_string()));
            record.set_modified(&hlc);

            inner
                .tables
                .entry(table.to_string())
                .or_default()
                .insert(id.to_string(), record);
            hlc
        };

        self.broadcaster.publish(TableChange {
            hlc: hlc.clone(),
            tables: BTreeSet::from([table.to_string()]),
        });
        hlc
    }

    pub fn get(&self, table: &str, id: &str) -> Option<Record> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .tables
            .get(table)
            .and_then(|rows| rows.get(id))
            .cloned()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .tables
            .get(table)
            .map_or(0, BTreeMap::len)
    }
}

impl SyncStore for MemoryStore {
    fn node_id(&self) -> NodeId {
        self.local.clone()
    }

    fn tables(&self) -> BTreeSet<String> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .tables
            .keys()
            .cloned()
            .collect()
    }

    fn last_modified(&self, filter: &NodeFilter) -> Result<Hlc, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut best: Option<Hlc> = None;
        for rows in inner.tables.values() {
            for record in rows.values() {
                let origin = record.node_id().map_err(|err| StoreError::Query {
                    reason: err.to_string(),
                })?;
                if !filter.matches(&origin) {
                    continue;
                }
                let modified = record.modified().map_err(|err| StoreError::Query {
                    reason: err.to_string(),
                })?;
                if best.as_ref().is_none_or(|current| modified > *current) {
                    best = Some(modified);
                }
            }
        }
        Ok(best.unwrap_or_else(|| Hlc::zero(self.local.clone())))
    }

    fn canonical_time(&self) -> Hlc {
        self.inner.lock().expect("store lock poisoned").clock.clone()
    }

    fn subscribe(&self) -> ChangeSubscription {
        self.broadcaster.subscribe()
    }

    fn changeset(&self, query: &ChangesetQuery) -> Result<Changeset, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut changeset = Changeset::new();
        for (table, rows) in &inner.tables {
            if !query.includes_table(table) {
                continue;
            }
            let mut matches: Vec<(Hlc, Record)> = Vec::new();
            for record in rows.values() {
                let origin = record.node_id().map_err(|err| StoreError::Query {
                    reason: err.to_string(),
                })?;
                if !query.node.matches(&origin) {
                    continue;
                }
                let modified = record.modified().map_err(|err| StoreError::Query {
                    reason: err.to_string(),
                })?;
                if query.modified.matches(&modified) {
                    matches.push((modified, record.clone()));
                }
            }
            matches.sort_by(|a, b| a.0.cmp(&b.0));
            for (_, record) in matches {
                changeset.push(table.clone(), record);
            }
        }
        Ok(changeset)
    }

    fn merge(&self, changeset: Changeset) -> Result<(), StoreError> {
        // One change event per distinct incoming timestamp, so a
        // `ModifiedFilter::On` forwarding query sees every accepted record.
        let mut events: BTreeMap<Hlc, BTreeSet<String>> = BTreeMap::new();
        {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            for (table, records) in changeset.0 {
                for record in records {
                    let id = record
                        .get(COL_ID)
                        .and_then(Value::as_str)
                        .ok_or_else(|| StoreError::Merge {
                            reason: format!("record in {table:?} missing {COL_ID:?}"),
                        })?
                        .to_string();
                    let modified = record.modified().map_err(|err| StoreError::Merge {
                        reason: err.to_string(),
                    })?;
                    if record.get(COL_NODE_ID).and_then(Value::as_str).is_none() {
                        return Err(StoreError::Merge {
                            reason: format!("record in {table:?} missing {COL_NODE_ID:?}"),
                        });
                    }

                    let rows = inner.tables.entry(table.clone()).or_default();
                    let accept = match rows.get(&id).map(Record::modified) {
                        None => true,
                        Some(Ok(existing)) => modified > existing,
                        Some(Err(err)) => {
                            return Err(StoreError::Merge {
                                reason: err.to_string(),
                            });
                        }
                    };
                    if accept {
                        rows.insert(id, record);
                        events
                            .entry(modified.clone())
                            .or_default()
                            .insert(table.clone());
                    }
                    inner.clock = inner.clock.observed(&modified, now_ms());
                }
            }
        }

        for (hlc, tables) in events {
            self.broadcaster.publish(TableChange { hlc, tables });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::COL_MODIFIED;
    use crate::sync::store::ModifiedFilter;

    fn node(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn store(local: &str) -> MemoryStore {
        MemoryStore::new(node(local))
    }

    fn remote_record(id: &str, origin: &str, modified: &Hlc) -> Record {
        [
            (COL_ID.to_string(), json!(id)),
            (COL_NODE_ID.to_string(), json!(origin)),
            (COL_MODIFIED.to_string(), json!(modified.to_string())),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn insert_stamps_reserved_columns_and_notifies() {
        let store = store("a");
        let sub = store.subscribe();
        let hlc = store.insert("t", "u", json!({"title": "x"}));

        let record = store.get("t", "u").unwrap();
        assert_eq!(record.node_id().unwrap(), node("a"));
        assert_eq!(record.modified().unwrap(), hlc);
        assert_eq!(record.get("title"), Some(&json!("x")));

        let change = sub.receiver().try_recv().unwrap();
        assert_eq!(change.hlc, hlc);
        assert_eq!(change.tables, BTreeSet::from(["t".to_string()]));
    }

    #[test]
    fn clock_advances_monotonically() {
        let store = store("a");
        let h1 = store.insert("t", "u1", json!({}));
        let h2 = store.insert("t", "u2", json!({}));
        assert!(h2 > h1);
        assert!(store.canonical_time() >= h2);
    }

    #[test]
    fn merge_is_idempotent() {
        let store = store("s");
        let modified = Hlc::new(1_000, 0, node("s"));
        let mut incoming = Changeset::new();
        incoming.push("t", remote_record("u", "c", &modified));

        store.merge(incoming.clone()).unwrap();
        let sub = store.subscribe();
        store.merge(incoming).unwrap();

        assert_eq!(store.row_count("t"), 1);
        // Re-delivery accepted nothing, so no event fired.
        assert!(sub.receiver().try_recv().is_err());
    }

    #[test]
    fn merge_keeps_newer_row() {
        let store = store("s");
        let old = Hlc::new(1_000, 0, node("s"));
        let new = Hlc::new(2_000, 0, node("s"));

        let mut newer = Changeset::new();
        let mut rec = remote_record("u", "c", &new);
        rec.insert("title", json!("new"));
        newer.push("t", rec);
        store.merge(newer).unwrap();

        let mut older = Changeset::new();
        let mut rec = remote_record("u", "c", &old);
        rec.insert("title", json!("old"));
        older.push("t", rec);
        store.merge(older).unwrap();

        assert_eq!(store.get("t", "u").unwrap().get("title"), Some(&json!("new")));
    }

    #[test]
    fn merge_fires_one_event_per_distinct_timestamp() {
        let store = store("s");
        let h1 = Hlc::new(1_000, 0, node("s"));
        let h2 = Hlc::new(2_000, 0, node("s"));
        let mut incoming = Changeset::new();
        incoming.push("t", remote_record("u1", "c", &h1));
        incoming.push("t", remote_record("u2", "c", &h1));
        incoming.push("t", remote_record("u3", "c", &h2));

        let sub = store.subscribe();
        store.merge(incoming).unwrap();

        let first = sub.receiver().try_recv().unwrap();
        assert_eq!(first.hlc, h1);
        let second = sub.receiver().try_recv().unwrap();
        assert_eq!(second.hlc, h2);
        assert!(sub.receiver().try_recv().is_err());

        // Each event replays its records through an On query.
        let query = ChangesetQuery::new(
            NodeFilter::Except(node("x")),
            ModifiedFilter::On(h1),
        );
        assert_eq!(store.changeset(&query).unwrap().records("t").len(), 2);
    }

    #[test]
    fn last_modified_respects_node_filters() {
        let store = store("s");
        let from_c = Hlc::new(1_000, 0, node("s"));
        let local = Hlc::new(2_000, 0, node("s"));
        let mut incoming = Changeset::new();
        incoming.push("t", remote_record("u1", "c", &from_c));
        incoming.push("t", remote_record("u2", "s", &local));
        store.merge(incoming).unwrap();

        assert_eq!(
            store.last_modified(&NodeFilter::Only(node("c"))).unwrap(),
            from_c
        );
        assert_eq!(
            store.last_modified(&NodeFilter::Except(node("c"))).unwrap(),
            local
        );
        assert!(
            store
                .last_modified(&NodeFilter::Only(node("nobody")))
                .unwrap()
                .is_zero()
        );
    }

    #[test]
    fn changeset_filters_and_sorts() {
        let store = store("s");
        let h1 = Hlc::new(1_000, 0, node("s"));
        let h2 = Hlc::new(2_000, 0, node("s"));
        let h3 = Hlc::new(3_000, 0, node("s"));
        let mut incoming = Changeset::new();
        incoming.push("t", remote_record("u3", "c", &h3));
        incoming.push("t", remote_record("u1", "c", &h1));
        incoming.push("t", remote_record("u2", "other", &h2));
        store.merge(incoming).unwrap();

        let query = ChangesetQuery::new(
            NodeFilter::Only(node("c")),
            ModifiedFilter::After(h1.clone()),
        );
        let result = store.changeset(&query).unwrap();
        let records = result.records("t");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get(COL_ID), Some(&json!("u3")));

        let query = ChangesetQuery::new(
            NodeFilter::Except(node("nobody")),
            ModifiedFilter::After(Hlc::zero(node("s"))),
        );
        let all = store.changeset(&query).unwrap();
        let modifieds: Vec<Hlc> = all
            .records("t")
            .iter()
            .map(|record| record.modified().unwrap())
            .collect();
        assert_eq!(modifieds, vec![h1, h2, h3]);
    }

    #[test]
    fn merge_rejects_rows_without_identity() {
        let store = store("s");
        let mut incoming = Changeset::new();
        incoming.push(
            "t",
            [(COL_MODIFIED.to_string(), json!("2024-01-01T00:00:00.000Z-0000-s"))]
                .into_iter()
                .collect::<Record>(),
        );
        assert!(store.merge(incoming).is_err());
    }
}
