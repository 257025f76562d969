//! Storage and Transaction traits -- the read/write contract of the graph
//! store.
//!
//! The engine depends on these traits rather than on a concrete backend.
//! All graph work happens through a [`Transaction`]; [`Storage`] adds a few
//! convenience reads and the two ways of obtaining a transaction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use arbor_core::blueprint::Blueprint;
use arbor_core::capacity::Capacity;
use arbor_core::enums::{CapacityKind, LinkField};
use arbor_core::node::Node;
use arbor_core::variable::Variable;

use crate::error::Result;

// ---------------------------------------------------------------------------
// View / helper types
// ---------------------------------------------------------------------------

/// A blueprint persisted together with the inputs it was derived from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedBlueprint {
    pub blueprint: Blueprint,
    /// The repeater's declared template list at capture time.
    pub declared_template_ids: Vec<String>,
    pub captured_at: DateTime<Utc>,
}

/// Counts of stored entities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphCounts {
    pub nodes: i64,
    pub capacities: i64,
    pub variables: i64,
}

// ---------------------------------------------------------------------------
// Transaction trait
// ---------------------------------------------------------------------------

/// Graph operations that share one connection and commit or roll back
/// together.
pub trait Transaction {
    // -- Node reads ----------------------------------------------------------

    fn get_node(&self, id: &str) -> Result<Node>;
    fn node_exists(&self, id: &str) -> Result<bool>;
    fn get_nodes_by_parent(&self, parent_id: &str) -> Result<Vec<Node>>;
    fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Nodes whose `metadata.<key>` equals `value` (compared as text).
    fn find_nodes_by_metadata(&self, key: &str, value: &str) -> Result<Vec<Node>>;

    // -- Node writes ---------------------------------------------------------

    /// Inserts or updates a node. Linked-id sets are never written here.
    fn upsert_node(&self, node: &Node) -> Result<()>;
    fn upsert_nodes(&self, nodes: &[Node]) -> Result<()>;

    /// Deletes a node, its descendants, and everything they own. Returns the
    /// ids of every deleted node.
    fn delete_node(&self, id: &str) -> Result<Vec<String>>;

    /// Unions `ids` into one linked-id set; returns the ids actually added.
    fn merge_linked_ids(&self, node_id: &str, field: LinkField, ids: &[String]) -> Result<Vec<String>>;

    /// Removes `ids` from one linked-id set; returns the ids actually removed.
    fn remove_linked_ids(&self, node_id: &str, field: LinkField, ids: &[String]) -> Result<Vec<String>>;

    // -- Capacities ----------------------------------------------------------

    fn get_capacity(&self, kind: CapacityKind, id: &str) -> Result<Capacity>;

    /// Looks up a capacity by id regardless of kind.
    fn find_capacity(&self, id: &str) -> Result<Option<Capacity>>;

    /// Capacities owned by a node, optionally restricted to one kind.
    fn get_capacities_by_owner(&self, node_id: &str, kind: Option<CapacityKind>) -> Result<Vec<Capacity>>;
    fn list_capacities(&self) -> Result<Vec<Capacity>>;
    fn upsert_capacity(&self, capacity: &Capacity) -> Result<()>;
    fn upsert_capacities(&self, capacities: &[Capacity]) -> Result<()>;
    fn delete_capacity(&self, id: &str) -> Result<()>;

    // -- Variables -----------------------------------------------------------

    fn get_variable(&self, id: &str) -> Result<Variable>;
    fn get_variable_by_node(&self, node_id: &str) -> Result<Option<Variable>>;
    fn find_variable_by_exposed_key(&self, key: &str) -> Result<Option<Variable>>;
    fn list_variables(&self) -> Result<Vec<Variable>>;
    fn upsert_variable(&self, variable: &Variable) -> Result<()>;
    fn upsert_variables(&self, variables: &[Variable]) -> Result<()>;
    fn delete_variable(&self, id: &str) -> Result<()>;

    // -- Repeaters -----------------------------------------------------------

    /// Atomically hands out the next occurrence index for a repeater,
    /// starting at 1.
    fn allocate_occurrence_index(&self, repeater_id: &str) -> Result<u32>;

    fn get_cached_blueprint(&self, repeater_id: &str) -> Result<Option<CachedBlueprint>>;
    fn put_cached_blueprint(&self, cached: &CachedBlueprint) -> Result<()>;

    /// Drops cached blueprints whose template contains `node_id`. Returns
    /// the number dropped.
    fn invalidate_blueprints_containing(&self, node_id: &str) -> Result<usize>;
    fn invalidate_blueprint(&self, repeater_id: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Storage trait
// ---------------------------------------------------------------------------

/// The graph store.
pub trait Storage: Send + Sync {
    fn get_node(&self, id: &str) -> Result<Node>;
    fn get_nodes_by_parent(&self, parent_id: &str) -> Result<Vec<Node>>;
    fn get_capacity(&self, kind: CapacityKind, id: &str) -> Result<Capacity>;
    fn get_capacities_by_owner(&self, node_id: &str, kind: Option<CapacityKind>) -> Result<Vec<Capacity>>;
    fn get_variable(&self, id: &str) -> Result<Variable>;
    fn get_variable_by_node(&self, node_id: &str) -> Result<Option<Variable>>;

    /// Returns how many nodes, capacities and variables are stored.
    fn counts(&self) -> Result<GraphCounts>;

    // -- Transactions --------------------------------------------------------

    /// Executes a closure within a database transaction.
    ///
    /// If the closure returns `Ok`, the transaction is committed.
    /// If it returns `Err` or panics, the transaction is rolled back.
    fn run_in_transaction(&self, f: &mut dyn FnMut(&dyn Transaction) -> Result<()>) -> Result<()>;

    /// Executes a closure against a consistent snapshot. Anything the closure
    /// writes is discarded.
    fn read_snapshot(&self, f: &mut dyn FnMut(&dyn Transaction) -> Result<()>) -> Result<()>;

    // -- Lifecycle -----------------------------------------------------------

    /// Flushes the write-ahead log and releases what can be released.
    fn close(&self) -> Result<()>;
}
