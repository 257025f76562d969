//! Graph engine for the arbor form tree.
//!
//! Keeps linked-id sets in step with the capacities and variables that
//! reference each node, turns repeater templates into blueprints and
//! occurrences, and evaluates formulas, conditions and tables against a
//! submission. [`engine::Engine`] is the entry point.

pub mod aggregate;
pub mod blueprint;
pub mod engine;
pub mod error;
pub mod evaluate;
pub mod instantiate;
pub mod links;
pub mod rewrite;

#[cfg(test)]
mod fixtures;

pub use engine::{Engine, GraphDocument, ImportReport, NodeView, OccurrenceSummary, RemovalResult};
pub use error::{EngineError, Result};
pub use evaluate::{EvalValue, Evaluation, SubmissionContext, Unresolved};
pub use instantiate::OccurrenceResult;
pub use links::{LinkReport, LinkScope};
