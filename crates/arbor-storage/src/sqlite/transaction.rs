//! Transaction wrapper for [`SqliteStore`].

use rusqlite::Connection;
use tracing::debug;

use arbor_core::capacity::Capacity;
use arbor_core::enums::{CapacityKind, LinkField};
use arbor_core::node::Node;
use arbor_core::variable::Variable;

use crate::error::{Result, StorageError};
use crate::sqlite::store::SqliteStore;
use crate::sqlite::{capacities, nodes, repeaters, variables};
use crate::traits::{CachedBlueprint, Transaction};

/// A thin wrapper around a SQLite connection that is inside a transaction.
///
/// The [`SqliteTx`] holds a reference to the connection (which already has an
/// active transaction via `BEGIN`). It implements [`Transaction`] by delegating
/// to the same connection-level helpers used by [`SqliteStore`].
pub(crate) struct SqliteTx<'a> {
    pub(crate) conn: &'a Connection,
}

impl Transaction for SqliteTx<'_> {
    fn get_node(&self, id: &str) -> Result<Node> {
        nodes::get_node_on_conn(self.conn, id)
    }

    fn node_exists(&self, id: &str) -> Result<bool> {
        nodes::node_exists_on_conn(self.conn, id)
    }

    fn get_nodes_by_parent(&self, parent_id: &str) -> Result<Vec<Node>> {
        nodes::get_nodes_by_parent_on_conn(self.conn, parent_id)
    }

    fn list_nodes(&self) -> Result<Vec<Node>> {
        nodes::list_nodes_on_conn(self.conn)
    }

    fn find_nodes_by_metadata(&self, key: &str, value: &str) -> Result<Vec<Node>> {
        nodes::find_nodes_by_metadata_on_conn(self.conn, key, value)
    }

    fn upsert_node(&self, node: &Node) -> Result<()> {
        nodes::upsert_node_on_conn(self.conn, node)
    }

    fn upsert_nodes(&self, node_list: &[Node]) -> Result<()> {
        for node in node_list {
            nodes::upsert_node_on_conn(self.conn, node)?;
        }
        Ok(())
    }

    fn delete_node(&self, id: &str) -> Result<Vec<String>> {
        nodes::delete_node_on_conn(self.conn, id)
    }

    fn merge_linked_ids(&self, node_id: &str, field: LinkField, ids: &[String]) -> Result<Vec<String>> {
        nodes::merge_linked_ids_on_conn(self.conn, node_id, field, ids)
    }

    fn remove_linked_ids(&self, node_id: &str, field: LinkField, ids: &[String]) -> Result<Vec<String>> {
        nodes::remove_linked_ids_on_conn(self.conn, node_id, field, ids)
    }

    fn get_capacity(&self, kind: CapacityKind, id: &str) -> Result<Capacity> {
        capacities::get_capacity_on_conn(self.conn, kind, id)
    }

    fn find_capacity(&self, id: &str) -> Result<Option<Capacity>> {
        capacities::find_capacity_on_conn(self.conn, id)
    }

    fn get_capacities_by_owner(&self, node_id: &str, kind: Option<CapacityKind>) -> Result<Vec<Capacity>> {
        capacities::get_capacities_by_owner_on_conn(self.conn, node_id, kind)
    }

    fn list_capacities(&self) -> Result<Vec<Capacity>> {
        capacities::list_capacities_on_conn(self.conn)
    }

    fn upsert_capacity(&self, capacity: &Capacity) -> Result<()> {
        capacities::upsert_capacity_on_conn(self.conn, capacity)
    }

    fn upsert_capacities(&self, capacity_list: &[Capacity]) -> Result<()> {
        for capacity in capacity_list {
            capacities::upsert_capacity_on_conn(self.conn, capacity)?;
        }
        Ok(())
    }

    fn delete_capacity(&self, id: &str) -> Result<()> {
        capacities::delete_capacity_on_conn(self.conn, id)
    }

    fn get_variable(&self, id: &str) -> Result<Variable> {
        variables::get_variable_on_conn(self.conn, id)
    }

    fn get_variable_by_node(&self, node_id: &str) -> Result<Option<Variable>> {
        variables::get_variable_by_node_on_conn(self.conn, node_id)
    }

    fn find_variable_by_exposed_key(&self, key: &str) -> Result<Option<Variable>> {
        variables::find_variable_by_exposed_key_on_conn(self.conn, key)
    }

    fn list_variables(&self) -> Result<Vec<Variable>> {
        variables::list_variables_on_conn(self.conn)
    }

    fn upsert_variable(&self, variable: &Variable) -> Result<()> {
        variables::upsert_variable_on_conn(self.conn, variable)
    }

    fn upsert_variables(&self, variable_list: &[Variable]) -> Result<()> {
        for variable in variable_list {
            variables::upsert_variable_on_conn(self.conn, variable)?;
        }
        Ok(())
    }

    fn delete_variable(&self, id: &str) -> Result<()> {
        variables::delete_variable_on_conn(self.conn, id)
    }

    fn allocate_occurrence_index(&self, repeater_id: &str) -> Result<u32> {
        repeaters::allocate_occurrence_index_on_conn(self.conn, repeater_id)
    }

    fn get_cached_blueprint(&self, repeater_id: &str) -> Result<Option<CachedBlueprint>> {
        repeaters::get_cached_blueprint_on_conn(self.conn, repeater_id)
    }

    fn put_cached_blueprint(&self, cached: &CachedBlueprint) -> Result<()> {
        repeaters::put_cached_blueprint_on_conn(self.conn, cached)
    }

    fn invalidate_blueprints_containing(&self, node_id: &str) -> Result<usize> {
        repeaters::invalidate_blueprints_containing_on_conn(self.conn, node_id)
    }

    fn invalidate_blueprint(&self, repeater_id: &str) -> Result<()> {
        repeaters::invalidate_blueprint_on_conn(self.conn, repeater_id)
    }
}

// ---------------------------------------------------------------------------
// SqliteStore::run_in_transaction
// ---------------------------------------------------------------------------

impl SqliteStore {
    /// Runs a closure inside a database transaction, committing on `Ok`.
    pub(crate) fn run_in_transaction_impl(
        &self,
        f: &mut dyn FnMut(&dyn Transaction) -> Result<()>,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StorageError::Transaction(format!("failed to begin: {e}")))?;

        let sqlite_tx = SqliteTx { conn: &tx };
        match f(&sqlite_tx) {
            Ok(()) => {
                tx.commit()
                    .map_err(|e| StorageError::Transaction(format!("failed to commit: {e}")))?;
                Ok(())
            }
            Err(e) => {
                debug!(error = %e, "rolling back transaction");
                // Transaction is rolled back on drop.
                Err(e)
            }
        }
    }

    /// Runs a closure against a consistent view. The transaction is always
    /// rolled back.
    pub(crate) fn read_snapshot_impl(
        &self,
        f: &mut dyn FnMut(&dyn Transaction) -> Result<()>,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StorageError::Transaction(format!("failed to begin: {e}")))?;
        let sqlite_tx = SqliteTx { conn: &tx };
        let result = f(&sqlite_tx);
        tx.rollback()
            .map_err(|e| StorageError::Transaction(format!("failed to roll back: {e}")))?;
        result
    }
}
