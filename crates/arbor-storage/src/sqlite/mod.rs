//! SQLite-backed storage implementation.

mod capacities;
mod nodes;
mod repeaters;
pub mod schema;
mod store;
mod transaction;
mod variables;

pub use store::SqliteStore;
