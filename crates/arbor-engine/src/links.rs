//! Link Maintainer: keeps every node's linked-id sets in step with the
//! capacities and variables that own or reference it.
//!
//! Desired links are computed from ownership plus extracted references and
//! then unioned into the stored sets. Nothing here ever shrinks a set except
//! [`LinkMaintainer::unlink`], which runs when a capacity or variable is
//! deleted.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;
use tracing::{debug, info, warn};

use arbor_core::capacity::Capacity;
use arbor_core::enums::{CapacityKind, LinkField};
use arbor_core::extract::{Dependencies, Extractor};
use arbor_core::variable::Variable;
use arbor_storage::error::Result;
use arbor_storage::Transaction;

/// Which part of the graph a recompute covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkScope {
    /// The capacities and variable owned by one node.
    Node(String),
    /// Every capacity and variable in the store.
    Graph,
}

/// Diagnostics from one recompute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkReport {
    pub capacities_scanned: usize,
    pub variables_scanned: usize,
    /// Nodes whose stored sets grew.
    pub nodes_updated: usize,
    pub ids_added: usize,
    /// References to nodes or capacities that do not exist.
    pub broken_references: usize,
    /// Strings in reference positions that did not parse.
    pub unresolved_references: usize,
    /// Extractions cut short by the depth bound.
    pub truncated_extractions: usize,
}

impl LinkReport {
    pub fn absorb(&mut self, other: &LinkReport) {
        self.capacities_scanned += other.capacities_scanned;
        self.variables_scanned += other.variables_scanned;
        self.nodes_updated += other.nodes_updated;
        self.ids_added += other.ids_added;
        self.broken_references += other.broken_references;
        self.unresolved_references += other.unresolved_references;
        self.truncated_extractions += other.truncated_extractions;
    }

    /// `true` when the recompute wrote nothing.
    pub fn is_noop(&self) -> bool {
        self.ids_added == 0
    }
}

// ---------------------------------------------------------------------------
// Target resolution
// ---------------------------------------------------------------------------

/// Memoized existence checks against the store.
struct Targets<'a> {
    tx: &'a dyn Transaction,
    nodes: HashMap<String, bool>,
    capacities: HashMap<String, Option<(CapacityKind, String)>>,
    /// Set when the maps hold the whole graph; misses are then final.
    complete: bool,
}

impl<'a> Targets<'a> {
    fn lazy(tx: &'a dyn Transaction) -> Self {
        Self {
            tx,
            nodes: HashMap::new(),
            capacities: HashMap::new(),
            complete: false,
        }
    }

    /// Loads every node id and capacity owner up front.
    fn preloaded(tx: &'a dyn Transaction, capacities: &[Capacity]) -> Result<Self> {
        let mut targets = Self::lazy(tx);
        for node in tx.list_nodes()? {
            targets.nodes.insert(node.id, true);
        }
        for cap in capacities {
            targets
                .capacities
                .insert(cap.id.clone(), Some((cap.kind(), cap.owner_node_id.clone())));
        }
        targets.complete = true;
        Ok(targets)
    }

    fn node_exists(&mut self, id: &str) -> Result<bool> {
        if let Some(known) = self.nodes.get(id) {
            return Ok(*known);
        }
        if self.complete {
            return Ok(false);
        }
        let exists = self.tx.node_exists(id)?;
        self.nodes.insert(id.to_string(), exists);
        Ok(exists)
    }

    /// Kind and owner of a capacity id.
    fn capacity(&mut self, id: &str) -> Result<Option<(CapacityKind, String)>> {
        if let Some(known) = self.capacities.get(id) {
            return Ok(known.clone());
        }
        if self.complete {
            return Ok(None);
        }
        let found = self
            .tx
            .find_capacity(id)?
            .map(|c| (c.kind(), c.owner_node_id));
        self.capacities.insert(id.to_string(), found.clone());
        Ok(found)
    }
}

/// node id -> field -> ids that must be present.
#[derive(Default)]
struct Desired(BTreeMap<String, BTreeMap<LinkField, BTreeSet<String>>>);

impl Desired {
    fn add(&mut self, node_id: &str, field: LinkField, id: &str) {
        self.0
            .entry(node_id.to_string())
            .or_default()
            .entry(field)
            .or_default()
            .insert(id.to_string());
    }
}

// ---------------------------------------------------------------------------
// LinkMaintainer
// ---------------------------------------------------------------------------

pub struct LinkMaintainer<'a> {
    extractor: &'a Extractor,
}

impl<'a> LinkMaintainer<'a> {
    pub fn new(extractor: &'a Extractor) -> Self {
        Self { extractor }
    }

    /// Unions the desired links for `scope` into the stored sets. Only nodes
    /// with a delta are written, so a second run over an unchanged graph
    /// writes nothing.
    pub fn recompute(&self, tx: &dyn Transaction, scope: &LinkScope) -> Result<LinkReport> {
        let mut report = LinkReport::default();
        let mut desired = Desired::default();

        let (capacities, variables, mut targets) = match scope {
            LinkScope::Graph => {
                let capacities = tx.list_capacities()?;
                let variables = tx.list_variables()?;
                let targets = Targets::preloaded(tx, &capacities)?;
                (capacities, variables, targets)
            }
            LinkScope::Node(node_id) => {
                let capacities = tx.get_capacities_by_owner(node_id, None)?;
                let variables: Vec<Variable> = tx.get_variable_by_node(node_id)?.into_iter().collect();
                (capacities, variables, Targets::lazy(tx))
            }
        };

        for cap in &capacities {
            self.desire_capacity(&mut targets, cap, &mut desired, &mut report)?;
        }
        for var in &variables {
            self.desire_variable(tx, &mut targets, var, &mut desired, &mut report)?;
        }

        apply(tx, desired, &mut report)?;

        if report.broken_references > 0 {
            warn!(
                broken = report.broken_references,
                ?scope,
                "skipped broken references while linking"
            );
        }
        match scope {
            LinkScope::Graph => info!(
                capacities = report.capacities_scanned,
                variables = report.variables_scanned,
                nodes_updated = report.nodes_updated,
                ids_added = report.ids_added,
                "batch link recompute finished"
            ),
            LinkScope::Node(node_id) => debug!(
                node_id,
                ids_added = report.ids_added,
                "incremental link recompute finished"
            ),
        }
        Ok(report)
    }

    fn desire_capacity(
        &self,
        targets: &mut Targets<'_>,
        cap: &Capacity,
        desired: &mut Desired,
        report: &mut LinkReport,
    ) -> Result<()> {
        report.capacities_scanned += 1;
        let field = cap.kind().link_field();
        desired.add(&cap.owner_node_id, field, &cap.id);

        let deps = self.extractor.capacity(cap);
        desire_dependencies(targets, &deps, field, &cap.id, desired, report)
    }

    fn desire_variable(
        &self,
        tx: &dyn Transaction,
        targets: &mut Targets<'_>,
        var: &Variable,
        desired: &mut Desired,
        report: &mut LinkReport,
    ) -> Result<()> {
        report.variables_scanned += 1;
        desired.add(&var.node_id, LinkField::Variable, &var.id);

        let deps = self.extractor.variable(var);
        desire_dependencies(targets, &deps, LinkField::Variable, &var.id, desired, report)?;

        // One hop through the source capacity.
        let Some(source) = var.source_reference() else {
            return Ok(());
        };
        let Some(kind) = source.kind().capacity_kind() else {
            return Ok(());
        };
        let sources = match tx.find_capacity(source.id())? {
            Some(cap) => vec![cap],
            None if targets.node_exists(source.id())? => tx.get_capacities_by_owner(source.id(), Some(kind))?,
            None => Vec::new(),
        };
        for cap in &sources {
            let hop = self
                .extractor
                .extract(&cap.body, Some(var.node_id.as_str()), Some(cap.id.as_str()));
            desire_dependencies(targets, &hop, LinkField::Variable, &var.id, desired, report)?;
        }
        Ok(())
    }

    /// Removes `ids` from `field` on every node that holds them. Returns the
    /// number of ids removed.
    pub fn unlink(&self, tx: &dyn Transaction, field: LinkField, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut removed = 0;
        for node in tx.list_nodes()? {
            let present: Vec<String> = ids
                .iter()
                .filter(|id| node.linked.contains(field, id))
                .cloned()
                .collect();
            if !present.is_empty() {
                removed += tx.remove_linked_ids(&node.id, field, &present)?.len();
            }
        }
        debug!(%field, removed, "unlinked ids");
        Ok(removed)
    }
}

/// Adds `id` to the sets of every node `deps` resolves to. Capacity
/// references resolve one hop to the capacity's owner; a capacity-style
/// reference whose id is a node resolves to that node.
fn desire_dependencies(
    targets: &mut Targets<'_>,
    deps: &Dependencies,
    field: LinkField,
    id: &str,
    desired: &mut Desired,
    report: &mut LinkReport,
) -> Result<()> {
    report.unresolved_references += deps.unresolved.len();
    if deps.truncated {
        report.truncated_extractions += 1;
    }

    for node_id in &deps.nodes {
        if targets.node_exists(node_id)? {
            desired.add(node_id, field, id);
        } else {
            debug!(from = id, reference = %node_id, "skipping broken node reference");
            report.broken_references += 1;
        }
    }

    for cref in &deps.capacities {
        match targets.capacity(&cref.id)? {
            Some((_, owner)) => desired.add(&owner, field, id),
            None if targets.node_exists(&cref.id)? => desired.add(&cref.id, field, id),
            None => {
                debug!(from = id, reference = %cref.id, "skipping broken capacity reference");
                report.broken_references += 1;
            }
        }
    }
    Ok(())
}

fn apply(tx: &dyn Transaction, desired: Desired, report: &mut LinkReport) -> Result<()> {
    for (node_id, fields) in desired.0 {
        let mut touched = false;
        for (field, ids) in fields {
            let ids: Vec<String> = ids.into_iter().collect();
            let added = tx.merge_linked_ids(&node_id, field, &ids)?;
            if !added.is_empty() {
                touched = true;
                report.ids_added += added.len();
            }
        }
        if touched {
            report.nodes_updated += 1;
        }
    }
    Ok(())
}
