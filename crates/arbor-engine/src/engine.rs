//! The engine facade: the invocation surface over one graph store.
//!
//! Every operation runs in a single store transaction. Whole-graph link
//! recomputes and imports take the batch lock exclusively; edits take it
//! shared, so an edit arriving during a batch pass is refused with
//! [`EngineError::Busy`] rather than interleaved.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use arbor_config::{ArborConfig, IdStrategy};
use arbor_core::blueprint::Blueprint;
use arbor_core::capacity::Capacity;
use arbor_core::enums::{CapacityKind, LinkField};
use arbor_core::extract::Extractor;
use arbor_core::idgen::{HashedIds, IdAllocator, SuffixIds};
use arbor_core::node::{Node, META_REPEATER};
use arbor_core::variable::Variable;
use arbor_storage::{Storage, StorageError, Transaction};

use crate::aggregate::{refresh_total, TotalReport};
use crate::blueprint::BlueprintBuilder;
use crate::error::{EngineError, Result};
use crate::evaluate::{Evaluation, Evaluator, SubmissionContext};
use crate::instantiate::{Instantiator, OccurrenceResult};
use crate::links::{LinkMaintainer, LinkReport, LinkScope};

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// What removing an occurrence deleted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemovalResult {
    pub repeater_id: String,
    pub index: u32,
    pub deleted_node_ids: Vec<String>,
    /// Capacity and variable ids dropped from linked sets.
    pub unlinked: usize,
    pub total: Option<TotalReport>,
}

/// The nodes of one occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OccurrenceSummary {
    pub index: u32,
    pub node_ids: Vec<String>,
}

/// A serialized graph, as read by `import`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDocument {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub capacities: Vec<Capacity>,
    #[serde(default)]
    pub variables: Vec<Variable>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub nodes: usize,
    pub capacities: usize,
    pub variables: usize,
    pub links: LinkReport,
}

/// A node with everything it owns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeView {
    pub node: Node,
    pub capacities: Vec<Capacity>,
    pub variable: Option<Variable>,
    pub children: Vec<String>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    store: Box<dyn Storage>,
    config: ArborConfig,
    extractor: Extractor,
    ids: Box<dyn IdAllocator>,
    batch: RwLock<()>,
}

impl Engine {
    pub fn new(store: Box<dyn Storage>, config: ArborConfig) -> Self {
        let ids: Box<dyn IdAllocator> = match config.ids.strategy {
            IdStrategy::Suffix => Box::new(SuffixIds),
            IdStrategy::Hashed => Box::new(HashedIds::new(&config.ids.hash_prefix, config.ids.hash_length)),
        };
        let extractor = Extractor::new(config.extraction.max_depth, config.extraction.pattern_scan);
        debug!(id_strategy = ids.name(), "engine ready");
        Self {
            store,
            config,
            extractor,
            ids,
            batch: RwLock::new(()),
        }
    }

    pub fn store(&self) -> &dyn Storage {
        self.store.as_ref()
    }

    pub fn config(&self) -> &ArborConfig {
        &self.config
    }

    fn linker(&self) -> LinkMaintainer<'_> {
        LinkMaintainer::new(&self.extractor)
    }

    // -- Locking -------------------------------------------------------------

    fn exclusive(&self) -> Result<RwLockWriteGuard<'_, ()>> {
        match self.batch.try_write() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(p)) => Ok(p.into_inner()),
            Err(TryLockError::WouldBlock) => Err(EngineError::Busy("graph is being modified".into())),
        }
    }

    fn shared(&self) -> Result<RwLockReadGuard<'_, ()>> {
        match self.batch.try_read() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(p)) => Ok(p.into_inner()),
            Err(TryLockError::WouldBlock) => Err(EngineError::Busy("whole-graph link recompute in progress".into())),
        }
    }

    // -- Transactions --------------------------------------------------------

    /// Runs `f` in a write transaction. Engine errors abort the transaction
    /// and are returned as-is.
    fn write<T>(&self, mut f: impl FnMut(&dyn Transaction) -> Result<T>) -> Result<T> {
        let mut out = None;
        let mut failure = None;
        let outcome = self.store.run_in_transaction(&mut |tx| match f(tx) {
            Ok(value) => {
                out = Some(value);
                Ok(())
            }
            Err(EngineError::Storage(e)) => Err(e),
            Err(e) => {
                let abort = StorageError::Internal(e.to_string());
                failure = Some(e);
                Err(abort)
            }
        });
        if let Some(e) = failure {
            return Err(e);
        }
        outcome?;
        out.ok_or_else(|| StorageError::Internal("transaction produced no value".into()).into())
    }

    fn read<T>(&self, mut f: impl FnMut(&dyn Transaction) -> Result<T>) -> Result<T> {
        let mut out = None;
        let mut failure = None;
        let outcome = self.store.read_snapshot(&mut |tx| match f(tx) {
            Ok(value) => {
                out = Some(value);
                Ok(())
            }
            Err(EngineError::Storage(e)) => Err(e),
            Err(e) => {
                let abort = StorageError::Internal(e.to_string());
                failure = Some(e);
                Err(abort)
            }
        });
        if let Some(e) = failure {
            return Err(e);
        }
        outcome?;
        out.ok_or_else(|| StorageError::Internal("snapshot produced no value".into()).into())
    }

    // -- Links ---------------------------------------------------------------

    pub fn recompute_links(&self, scope: &LinkScope) -> Result<LinkReport> {
        let linker = self.linker();
        let run = || self.write(|tx| Ok(linker.recompute(tx, scope)?));
        match scope {
            LinkScope::Graph => {
                let _guard = self.exclusive()?;
                run()
            }
            LinkScope::Node(_) => {
                let _guard = self.shared()?;
                run()
            }
        }
    }

    // -- Repeaters -----------------------------------------------------------

    pub fn build_blueprint(&self, repeater_id: &str, refresh: bool) -> Result<Blueprint> {
        let _guard = self.shared()?;
        let builder = BlueprintBuilder::new(&self.config.blueprint, self.ids.as_ref());
        self.write(|tx| builder.build(tx, repeater_id, refresh))
    }

    /// Creates the next occurrence of `repeater_id`. Returns `None` when the
    /// blueprint is empty.
    pub fn add_occurrence(&self, repeater_id: &str) -> Result<Option<OccurrenceResult>> {
        let _guard = self.shared()?;
        let builder = BlueprintBuilder::new(&self.config.blueprint, self.ids.as_ref());
        let instantiator = Instantiator::new(self.ids.as_ref(), self.linker());

        self.write(|tx| {
            let blueprint = builder.build(tx, repeater_id, false)?;
            if blueprint.is_empty() {
                warn!(repeater_id, "blueprint is empty; no occurrence created");
                return Ok(None);
            }

            let repeater = tx.get_node(repeater_id)?;
            let limit = repeater
                .repeater_config()
                .and_then(|c| c.max_occurrences)
                .or(self.config.repeat.max_occurrences);
            let index = tx.allocate_occurrence_index(repeater_id)?;
            if let Some(max) = limit {
                let existing = occurrences(tx, repeater_id)?.len();
                if existing >= max as usize {
                    return Err(EngineError::instantiation(
                        repeater_id,
                        index,
                        StorageError::validation(format!("repeater allows at most {max} occurrences")),
                    ));
                }
            }

            instantiator
                .instantiate(tx, &blueprint, index)
                .map(Some)
                .map_err(|e| EngineError::instantiation(repeater_id, index, e))
        })
    }

    /// Deletes the occurrence that `node_id` belongs to, then refreshes the
    /// repeater total.
    pub fn remove_occurrence(&self, node_id: &str) -> Result<RemovalResult> {
        let _guard = self.shared()?;
        let linker = self.linker();

        self.write(|tx| {
            let node = tx.get_node(node_id)?;
            let mark = node
                .occurrence_mark()
                .ok_or_else(|| EngineError::NotAnOccurrence(node_id.to_string()))?;

            let members: Vec<String> = occurrences(tx, &mark.repeater_id)?
                .into_iter()
                .find(|o| o.index == mark.index)
                .map(|o| o.node_ids)
                .unwrap_or_default();

            let (deleted, unlinked) = delete_subtrees(tx, &linker, &members)?;

            let total = match tx.get_node(&mark.repeater_id) {
                Ok(repeater) => match repeater.repeater_config().and_then(|c| c.total_field) {
                    Some(spec) => refresh_total(tx, &linker, &mark.repeater_id, &spec)?,
                    None => None,
                },
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e.into()),
            };

            info!(
                repeater_id = %mark.repeater_id,
                index = mark.index,
                deleted = deleted.len(),
                "removed occurrence"
            );
            Ok(RemovalResult {
                repeater_id: mark.repeater_id.clone(),
                index: mark.index,
                deleted_node_ids: deleted,
                unlinked,
                total,
            })
        })
    }

    pub fn list_occurrences(&self, repeater_id: &str) -> Result<Vec<OccurrenceSummary>> {
        self.read(|tx| Ok(occurrences(tx, repeater_id)?))
    }

    // -- Evaluation ----------------------------------------------------------

    pub fn evaluate(&self, reference: &str, ctx: &SubmissionContext) -> Result<Evaluation> {
        self.read(|tx| Ok(Evaluator::new(tx, ctx, &self.config.evaluation).evaluate(reference)?))
    }

    // -- Authoring -----------------------------------------------------------

    pub fn node_view(&self, node_id: &str) -> Result<NodeView> {
        self.read(|tx| {
            let node = tx.get_node(node_id)?;
            let capacities = tx.get_capacities_by_owner(node_id, None)?;
            let variable = tx.get_variable_by_node(node_id)?;
            let children = tx.get_nodes_by_parent(node_id)?.into_iter().map(|n| n.id).collect();
            Ok(NodeView {
                node,
                capacities,
                variable,
                children,
            })
        })
    }

    pub fn save_node(&self, node: &Node) -> Result<()> {
        let _guard = self.shared()?;
        self.write(|tx| {
            tx.upsert_node(node)?;
            tx.invalidate_blueprints_containing(&node.id)?;
            // A new child of a template joins that template's subtree.
            if let Some(parent) = &node.parent_id {
                tx.invalidate_blueprints_containing(parent)?;
            }
            tx.invalidate_blueprint(&node.id)?;
            Ok(())
        })
    }

    /// Stores a capacity, flags its owner and relinks the owner.
    pub fn save_capacity(&self, capacity: &Capacity) -> Result<LinkReport> {
        let _guard = self.shared()?;
        let linker = self.linker();
        self.write(|tx| {
            tx.upsert_capacity(capacity)?;
            let mut owner = tx.get_node(&capacity.owner_node_id)?;
            if set_capability_flag(&mut owner, Some(capacity.kind()), true) {
                tx.upsert_node(&owner)?;
            }
            tx.invalidate_blueprints_containing(&owner.id)?;
            Ok(linker.recompute(tx, &LinkScope::Node(owner.id.clone()))?)
        })
    }

    pub fn save_variable(&self, variable: &Variable) -> Result<LinkReport> {
        let _guard = self.shared()?;
        let linker = self.linker();
        self.write(|tx| {
            tx.upsert_variable(variable)?;
            let mut owner = tx.get_node(&variable.node_id)?;
            if set_capability_flag(&mut owner, None, true) {
                tx.upsert_node(&owner)?;
            }
            tx.invalidate_blueprints_containing(&owner.id)?;
            Ok(linker.recompute(tx, &LinkScope::Node(owner.id.clone()))?)
        })
    }

    /// Deletes a capacity and removes its id from every linked set. Returns
    /// the number of ids removed.
    pub fn delete_capacity(&self, id: &str) -> Result<usize> {
        let _guard = self.shared()?;
        let linker = self.linker();
        self.write(|tx| {
            let capacity = tx
                .find_capacity(id)?
                .ok_or_else(|| StorageError::not_found("capacity", id))?;
            tx.delete_capacity(id)?;
            let removed = linker.unlink(tx, capacity.kind().link_field(), &[capacity.id.clone()])?;

            let kind = capacity.kind();
            if tx.get_capacities_by_owner(&capacity.owner_node_id, Some(kind))?.is_empty() {
                let mut owner = tx.get_node(&capacity.owner_node_id)?;
                if set_capability_flag(&mut owner, Some(kind), false) {
                    tx.upsert_node(&owner)?;
                }
            }
            tx.invalidate_blueprints_containing(&capacity.owner_node_id)?;
            Ok(removed)
        })
    }

    pub fn delete_variable(&self, id: &str) -> Result<usize> {
        let _guard = self.shared()?;
        let linker = self.linker();
        self.write(|tx| {
            let variable = tx.get_variable(id)?;
            tx.delete_variable(id)?;
            let removed = linker.unlink(tx, LinkField::Variable, &[variable.id.clone()])?;
            let mut owner = tx.get_node(&variable.node_id)?;
            if set_capability_flag(&mut owner, None, false) {
                tx.upsert_node(&owner)?;
            }
            tx.invalidate_blueprints_containing(&variable.node_id)?;
            Ok(removed)
        })
    }

    /// Deletes a node and its subtree. Returns the deleted ids.
    pub fn delete_node(&self, id: &str) -> Result<Vec<String>> {
        let _guard = self.shared()?;
        let linker = self.linker();
        self.write(|tx| {
            if !tx.node_exists(id)? {
                return Err(StorageError::not_found("node", id).into());
            }
            tx.invalidate_blueprints_containing(id)?;
            let (deleted, _) = delete_subtrees(tx, &linker, &[id.to_string()])?;
            Ok(deleted)
        })
    }

    /// Loads a graph document and backfills links over the whole graph.
    /// Linked sets present in the document are merged, never replaced.
    pub fn import(&self, doc: &GraphDocument) -> Result<ImportReport> {
        let _guard = self.exclusive()?;
        let linker = self.linker();
        self.write(|tx| {
            tx.upsert_nodes(&doc.nodes)?;
            for node in &doc.nodes {
                tx.invalidate_blueprints_containing(&node.id)?;
                if let Some(parent) = &node.parent_id {
                    tx.invalidate_blueprints_containing(parent)?;
                }
            }
            tx.upsert_capacities(&doc.capacities)?;
            tx.upsert_variables(&doc.variables)?;
            for node in &doc.nodes {
                for field in LinkField::ALL {
                    let ids: Vec<String> = node.linked.get(field).iter().cloned().collect();
                    if !ids.is_empty() {
                        tx.merge_linked_ids(&node.id, field, &ids)?;
                    }
                }
            }
            let links = linker.recompute(tx, &LinkScope::Graph)?;
            info!(
                nodes = doc.nodes.len(),
                capacities = doc.capacities.len(),
                variables = doc.variables.len(),
                "imported graph"
            );
            Ok(ImportReport {
                nodes: doc.nodes.len(),
                capacities: doc.capacities.len(),
                variables: doc.variables.len(),
                links,
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Clones of `repeater_id` grouped by occurrence index.
fn occurrences(tx: &dyn Transaction, repeater_id: &str) -> arbor_storage::error::Result<Vec<OccurrenceSummary>> {
    let mut by_index: BTreeMap<u32, Vec<String>> = BTreeMap::new();
    for node in tx.find_nodes_by_metadata(META_REPEATER, repeater_id)? {
        if let Some(mark) = node.occurrence_mark() {
            by_index.entry(mark.index).or_default().push(node.id);
        }
    }
    Ok(by_index
        .into_iter()
        .map(|(index, mut node_ids)| {
            node_ids.sort();
            OccurrenceSummary { index, node_ids }
        })
        .collect())
}

/// Deletes `roots` with their descendants, unlinking every capacity and
/// variable they owned. Returns the deleted ids and the unlink count.
fn delete_subtrees(
    tx: &dyn Transaction,
    linker: &LinkMaintainer<'_>,
    roots: &[String],
) -> arbor_storage::error::Result<(Vec<String>, usize)> {
    let mut doomed = BTreeSet::new();
    let mut queue: Vec<String> = roots.to_vec();
    while let Some(id) = queue.pop() {
        if doomed.insert(id.clone()) {
            queue.extend(tx.get_nodes_by_parent(&id)?.into_iter().map(|n| n.id));
        }
    }

    let mut capacity_ids: BTreeMap<LinkField, Vec<String>> = BTreeMap::new();
    let mut variable_ids = Vec::new();
    for id in &doomed {
        for cap in tx.get_capacities_by_owner(id, None)? {
            capacity_ids.entry(cap.kind().link_field()).or_default().push(cap.id);
        }
        if let Some(var) = tx.get_variable_by_node(id)? {
            variable_ids.push(var.id);
        }
    }

    let mut deleted = BTreeSet::new();
    for id in roots {
        if deleted.contains(id) {
            continue;
        }
        match tx.delete_node(id) {
            Ok(ids) => deleted.extend(ids),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }

    let mut unlinked = linker.unlink(tx, LinkField::Variable, &variable_ids)?;
    for (field, ids) in &capacity_ids {
        unlinked += linker.unlink(tx, *field, ids)?;
    }
    Ok((deleted.into_iter().collect(), unlinked))
}

/// Sets the owner flag for a capacity kind, or the variable flag when
/// `kind` is `None`. Returns whether the node changed.
fn set_capability_flag(node: &mut Node, kind: Option<CapacityKind>, on: bool) -> bool {
    let flag = match kind {
        Some(CapacityKind::Formula) => &mut node.has_formula,
        Some(CapacityKind::Condition) => &mut node.has_condition,
        Some(CapacityKind::Table) => &mut node.has_table,
        None => &mut node.has_variable,
    };
    let changed = *flag != on;
    *flag = on;
    changed
}
