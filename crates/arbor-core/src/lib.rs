//! Core types for the arbor form graph.
//!
//! Nodes, capacities (formula, condition, table) and variables, together with
//! the pieces of the graph core that need no storage: reference parsing,
//! dependency extraction and clone id derivation.

pub mod blueprint;
pub mod capacity;
pub mod enums;
pub mod extract;
pub mod idgen;
pub mod node;
pub mod reference;
pub mod validation;
pub mod variable;
