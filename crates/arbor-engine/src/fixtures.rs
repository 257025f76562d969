//! Shared test fixtures.

use arbor_core::capacity::{Capacity, CapacityBody, FormulaSpec, Token};
use arbor_core::node::NodeBuilder;
use arbor_storage::error::Result;
use arbor_storage::{SqliteStore, Storage, Transaction};

/// An in-memory store populated by `f` in one transaction.
pub fn store_with(mut f: impl FnMut(&dyn Transaction) -> Result<()>) -> SqliteStore {
    let store = SqliteStore::open_in_memory().unwrap();
    store.run_in_transaction(&mut f).unwrap();
    store
}

/// Upserts parentless leaf nodes with the given ids.
pub fn seed(tx: &dyn Transaction, ids: &[&str]) {
    for id in ids {
        tx.upsert_node(&NodeBuilder::new(*id).label(id.to_uppercase()).build())
            .unwrap();
    }
}

pub fn formula(id: &str, owner: &str, tokens: Vec<Token>) -> Capacity {
    Capacity::new(id, owner, CapacityBody::Formula(FormulaSpec::new(tokens)))
}
