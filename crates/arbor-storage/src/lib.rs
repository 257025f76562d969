//! Storage backend for the arbor form graph.
//!
//! Provides the [`Storage`] trait and a SQLite implementation ([`SqliteStore`]).

pub mod error;
pub mod sqlite;
pub mod traits;

// Re-exports for convenience.
pub use error::StorageError;
pub use sqlite::SqliteStore;
pub use traits::{CachedBlueprint, GraphCounts, Storage, Transaction};

// ---------------------------------------------------------------------------
// Storage trait implementation for SqliteStore
// ---------------------------------------------------------------------------

use arbor_core::capacity::Capacity;
use arbor_core::enums::CapacityKind;
use arbor_core::node::Node;
use arbor_core::variable::Variable;

use crate::error::Result;

impl Storage for SqliteStore {
    fn get_node(&self, id: &str) -> Result<Node> {
        self.run_read(|tx| tx.get_node(id))
    }

    fn get_nodes_by_parent(&self, parent_id: &str) -> Result<Vec<Node>> {
        self.run_read(|tx| tx.get_nodes_by_parent(parent_id))
    }

    fn get_capacity(&self, kind: CapacityKind, id: &str) -> Result<Capacity> {
        self.run_read(|tx| tx.get_capacity(kind, id))
    }

    fn get_capacities_by_owner(&self, node_id: &str, kind: Option<CapacityKind>) -> Result<Vec<Capacity>> {
        self.run_read(|tx| tx.get_capacities_by_owner(node_id, kind))
    }

    fn get_variable(&self, id: &str) -> Result<Variable> {
        self.run_read(|tx| tx.get_variable(id))
    }

    fn get_variable_by_node(&self, node_id: &str) -> Result<Option<Variable>> {
        self.run_read(|tx| tx.get_variable_by_node(node_id))
    }

    fn counts(&self) -> Result<GraphCounts> {
        let conn = self.lock_conn()?;
        let count = |table: &str| -> Result<i64> {
            Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?)
        };
        Ok(GraphCounts {
            nodes: count("nodes")?,
            capacities: count("capacities")?,
            variables: count("variables")?,
        })
    }

    fn run_in_transaction(&self, f: &mut dyn FnMut(&dyn Transaction) -> Result<()>) -> Result<()> {
        self.run_in_transaction_impl(f)
    }

    fn read_snapshot(&self, f: &mut dyn FnMut(&dyn Transaction) -> Result<()>) -> Result<()> {
        self.read_snapshot_impl(f)
    }

    fn close(&self) -> Result<()> {
        self.close_impl()
    }
}

impl SqliteStore {
    /// Runs a single read through the snapshot path and returns its value.
    fn run_read<T>(&self, mut read: impl FnMut(&dyn Transaction) -> Result<T>) -> Result<T> {
        let mut out = None;
        self.read_snapshot_impl(&mut |tx| {
            out = Some(read(tx)?);
            Ok(())
        })?;
        out.ok_or_else(|| StorageError::Internal("snapshot produced no value".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::capacity::{CapacityBody, FormulaSpec};
    use arbor_core::node::NodeBuilder;
    use pretty_assertions::assert_eq;

    #[test]
    fn storage_reads_see_committed_writes() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .run_in_transaction(&mut |tx| {
                tx.upsert_node(&NodeBuilder::new("root").build())?;
                tx.upsert_node(&NodeBuilder::new("a").parent("root").build())?;
                tx.upsert_capacity(&Capacity::new("f1", "a", CapacityBody::Formula(FormulaSpec::default())))?;
                tx.upsert_variable(&Variable::new("v1", "a", "a_value"))?;
                Ok(())
            })
            .unwrap();

        assert_eq!(store.get_nodes_by_parent("root").unwrap().len(), 1);
        assert_eq!(store.get_capacity(CapacityKind::Formula, "f1").unwrap().owner_node_id, "a");
        assert_eq!(store.get_capacities_by_owner("a", None).unwrap().len(), 1);
        assert_eq!(store.get_variable_by_node("a").unwrap().map(|v| v.id), Some("v1".into()));
        assert_eq!(
            store.counts().unwrap(),
            GraphCounts {
                nodes: 2,
                capacities: 1,
                variables: 1
            }
        );
    }

    #[test]
    fn missing_node_surfaces_not_found() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.get_node("ghost").unwrap_err().is_not_found());
        assert!(store.get_variable("ghost").unwrap_err().is_not_found());
    }
}
