//! Store adapter consumed by sessions.
//!
//! The engine never looks inside the store; it needs identity, the table
//! list, high-water marks, a change stream, filtered changeset builds, and
//! an idempotent merge.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::core::{Changeset, Hlc, NodeId};

use super::broadcast::ChangeSubscription;
use super::error::StoreError;

/// Originator filter: exactly one of the two forms, always on the record's
/// `node_id` column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeFilter {
    Only(NodeId),
    Except(NodeId),
}

impl NodeFilter {
    pub fn matches(&self, node_id: &NodeId) -> bool {
        match self {
            NodeFilter::Only(only) => node_id == only,
            NodeFilter::Except(except) => node_id != except,
        }
    }
}

/// Timestamp filter: a live event selects one write (`On`), a catch-up
/// selects everything past the peer's high-water mark (`After`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModifiedFilter {
    On(Hlc),
    After(Hlc),
}

impl ModifiedFilter {
    pub fn matches(&self, modified: &Hlc) -> bool {
        match self {
            ModifiedFilter::On(hlc) => modified == hlc,
            ModifiedFilter::After(hlc) => modified > hlc,
        }
    }
}

/// One filtered changeset build.
#[derive(Clone, Debug)]
pub struct ChangesetQuery {
    /// Restrict to these tables; `None` means every table the store has.
    pub tables: Option<BTreeSet<String>>,
    pub node: NodeFilter,
    pub modified: ModifiedFilter,
    /// Per-table custom SQL for SQL-shaped stores (see `sync::query`).
    /// Stores that are not SQL-shaped ignore this.
    pub queries: BTreeMap<String, String>,
}

impl ChangesetQuery {
    pub fn new(node: NodeFilter, modified: ModifiedFilter) -> Self {
        Self {
            tables: None,
            node,
            modified,
            queries: BTreeMap::new(),
        }
    }

    pub fn with_tables(mut self, tables: BTreeSet<String>) -> Self {
        self.tables = Some(tables);
        self
    }

    pub fn includes_table(&self, table: &str) -> bool {
        self.tables
            .as_ref()
            .is_none_or(|tables| tables.contains(table))
    }
}

/// The consumed CRDT-store interface.
///
/// All methods take `&self`; implementations synchronize internally. One
/// store instance backs every session of a node.
pub trait SyncStore: Send + Sync {
    /// Stable for the process lifetime.
    fn node_id(&self) -> NodeId;

    fn tables(&self) -> BTreeSet<String>;

    /// Highest `modified` over records matching the filter;
    /// `Hlc::zero(local)` if none.
    fn last_modified(&self, filter: &NodeFilter) -> Result<Hlc, StoreError>;

    /// The store's current clock value.
    fn canonical_time(&self) -> Hlc;

    /// Independent subscription to the hot change stream. Events fire after
    /// each successful local write with that write's timestamp.
    fn subscribe(&self) -> ChangeSubscription;

    /// Build a filtered changeset, sorted by `modified` ascending within
    /// each table, empty tables omitted.
    fn changeset(&self, query: &ChangesetQuery) -> Result<Changeset, StoreError>;

    /// Idempotent merge; advances clocks and fires change events.
    fn merge(&self, changeset: Changeset) -> Result<(), StoreError>;
}

impl<S: SyncStore + ?Sized> SyncStore for Arc<S> {
    fn node_id(&self) -> NodeId {
        (**self).node_id()
    }

    fn tables(&self) -> BTreeSet<String> {
        (**self).tables()
    }

    fn last_modified(&self, filter: &NodeFilter) -> Result<Hlc, StoreError> {
        (**self).last_modified(filter)
    }

    fn canonical_time(&self) -> Hlc {
        (**self).canonical_time()
    }

    fn subscribe(&self) -> ChangeSubscription {
        (**self).subscribe()
    }

    fn changeset(&self, query: &ChangesetQuery) -> Result<Changeset, StoreError> {
        (**self).changeset(query)
    }

    fn merge(&self, changeset: Changeset) -> Result<(), StoreError> {
        (**self).merge(changeset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    #[test]
    fn node_filter() {
        let only = NodeFilter::Only(node("a"));
        assert!(only.matches(&node("a")));
        assert!(!only.matches(&node("b")));
        let except = NodeFilter::Except(node("a"));
        assert!(!except.matches(&node("a")));
        assert!(except.matches(&node("b")));
    }

    #[test]
    fn modified_filter() {
        let t1 = Hlc::new(10, 0, node("a"));
        let t2 = Hlc::new(20, 0, node("a"));
        assert!(ModifiedFilter::On(t1.clone()).matches(&t1));
        assert!(!ModifiedFilter::On(t1.clone()).matches(&t2));
        assert!(ModifiedFilter::After(t1.clone()).matches(&t2));
        assert!(!ModifiedFilter::After(t1.clone()).matches(&t1));
    }

    #[test]
    fn query_table_restriction() {
        let query = ChangesetQuery::new(
            NodeFilter::Except(node("a")),
            ModifiedFilter::After(Hlc::zero(node("a"))),
        );
        assert!(query.includes_table("anything"));
        let query = query.with_tables(BTreeSet::from(["t".to_string()]));
        assert!(query.includes_table("t"));
        assert!(!query.includes_table("u"));
    }
}
