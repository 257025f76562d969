//! Blueprint Builder: derives what one occurrence of a repeater contains.
//!
//! The node, capacity and variable tables are ground truth. A blueprint is
//! a cacheable view over them and is rebuilt whenever the cached copy no
//! longer matches the store.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::Utc;
use tracing::{debug, warn};

use arbor_config::BlueprintConfig;
use arbor_core::blueprint::{Blueprint, CapacityDescriptor, VariableDescriptor};
use arbor_core::enums::{LinkField, NodeType};
use arbor_core::idgen::IdAllocator;
use arbor_core::node::{Node, META_DISPLAY_FOR, META_REPEATER};
use arbor_storage::{CachedBlueprint, Transaction};

use crate::error::{EngineError, Result};

pub struct BlueprintBuilder<'a> {
    config: &'a BlueprintConfig,
    ids: &'a dyn IdAllocator,
}

impl<'a> BlueprintBuilder<'a> {
    pub fn new(config: &'a BlueprintConfig, ids: &'a dyn IdAllocator) -> Self {
        Self { config, ids }
    }

    /// Builds (or fetches from cache) the blueprint of `repeater_id`.
    ///
    /// An empty blueprint is a valid answer meaning "nothing to duplicate";
    /// template ids that no longer resolve are listed in
    /// [`Blueprint::missing_template_ids`].
    pub fn build(&self, tx: &dyn Transaction, repeater_id: &str, refresh: bool) -> Result<Blueprint> {
        let repeater = tx.get_node(repeater_id)?;
        let declared = repeater.declared_template_ids();
        if repeater.node_type != NodeType::Repeater && declared.is_empty() {
            return Err(EngineError::NotARepeater(repeater_id.to_string()));
        }

        if self.config.use_cache && !refresh {
            if let Some(cached) = tx.get_cached_blueprint(repeater_id)? {
                if cached.declared_template_ids == declared && still_valid(tx, &cached.blueprint)? {
                    debug!(repeater_id, "using cached blueprint");
                    return Ok(cached.blueprint);
                }
                debug!(repeater_id, "cached blueprint is stale");
            }
        }

        let candidates = self.candidate_ids(tx, &repeater, &declared)?;
        let mut roots = Vec::new();
        let mut missing = Vec::new();
        for id in candidates {
            if tx.node_exists(&id)? {
                roots.push(id);
            } else {
                missing.push(id);
            }
        }
        let template_ids = self.with_subtrees(tx, &repeater.id, roots)?;
        if !missing.is_empty() {
            warn!(repeater_id, missing = ?missing, "template nodes are missing");
        }
        if template_ids.is_empty() {
            warn!(repeater_id, "no template node resolves; nothing to duplicate");
            let mut empty = Blueprint::empty(repeater_id);
            empty.missing_template_ids = missing;
            return Ok(empty);
        }

        let total_field = repeater.repeater_config().and_then(|c| c.total_field);
        let template_set: BTreeSet<&str> = template_ids.iter().map(String::as_str).collect();

        let mut variables = Vec::new();
        let mut capacities = Vec::new();
        let mut owned_variable_ids = BTreeSet::new();
        let mut templates = Vec::with_capacity(template_ids.len());

        for id in &template_ids {
            let node = tx.get_node(id)?;
            if let Some(var) = tx.get_variable_by_node(id)? {
                owned_variable_ids.insert(var.id.clone());
                variables.push(VariableDescriptor {
                    node_id: var.node_id,
                    variable_id: var.id,
                    source_ref: var.source_ref,
                    source_type: var.source_type,
                    primary_target_node_id: None,
                });
            }
            for cap in tx.get_capacities_by_owner(id, None)? {
                capacities.push(CapacityDescriptor {
                    owner_node_id: cap.owner_node_id.clone(),
                    capacity_id: cap.id.clone(),
                    capacity_type: cap.kind(),
                });
            }
            templates.push(node);
        }

        // Linked-only variables: one descriptor per linking template node.
        let mut linking: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for node in &templates {
            for var_id in node.linked.get(LinkField::Variable) {
                if owned_variable_ids.contains(var_id) {
                    continue;
                }
                let hosts = linking.entry(var_id.clone()).or_default();
                if !hosts.contains(&node.id) {
                    hosts.push(node.id.clone());
                }
            }
        }
        for (var_id, hosts) in linking {
            let var = match tx.get_variable(&var_id) {
                Ok(var) => var,
                Err(e) if e.is_not_found() => {
                    debug!(repeater_id, variable_id = %var_id, "linked variable not found");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let owner = tx.get_node(&var.node_id)?;
            let excluded = var.node_id == repeater_id
                || template_set.contains(var.node_id.as_str())
                || owner.occurrence_mark().is_some()
                || total_field.as_ref().is_some_and(|t| {
                    t.target_node_id == var.node_id || t.target_variable_id.as_deref() == Some(var.id.as_str())
                });
            if excluded {
                continue;
            }
            for host in hosts {
                variables.push(VariableDescriptor {
                    node_id: var.node_id.clone(),
                    variable_id: var.id.clone(),
                    source_ref: var.source_ref.clone(),
                    source_type: var.source_type.clone(),
                    primary_target_node_id: Some(host),
                });
            }
        }

        let blueprint = Blueprint {
            repeater_node_id: repeater_id.to_string(),
            template_node_ids: template_ids,
            variables,
            capacities,
            total_field,
            missing_template_ids: missing,
        };

        if self.config.use_cache && blueprint.is_complete() {
            tx.put_cached_blueprint(&CachedBlueprint {
                blueprint: blueprint.clone(),
                declared_template_ids: declared,
                captured_at: Utc::now(),
            })?;
        }
        debug!(
            repeater_id,
            templates = blueprint.template_node_ids.len(),
            variables = blueprint.variables.len(),
            capacities = blueprint.capacities.len(),
            "built blueprint"
        );
        Ok(blueprint)
    }

    /// Declared ids, then (optionally) templates recovered from existing
    /// clones. Ids that look like clones themselves are never templates.
    fn candidate_ids(&self, tx: &dyn Transaction, repeater: &Node, declared: &[String]) -> Result<Vec<String>> {
        let mut out: Vec<String> = Vec::new();
        let mut push = |id: &str| {
            if !id.is_empty() && id != repeater.id && !out.iter().any(|o| o == id) {
                out.push(id.to_string());
            }
        };
        for id in declared {
            push(id);
        }
        if self.config.enrich_from_occurrences {
            for clone in tx.find_nodes_by_metadata(META_REPEATER, &repeater.id)? {
                if clone.metadata.get(META_DISPLAY_FOR).is_some() {
                    continue;
                }
                let Some(mark) = clone.occurrence_mark() else {
                    continue;
                };
                if !self.ids.is_derived(&mark.source_template_id) {
                    push(&mark.source_template_id);
                }
            }
        }
        Ok(out)
    }

    /// Expands `roots` with every descendant, parents before children.
    /// Clones and display nodes living under a template are not part of it.
    fn with_subtrees(&self, tx: &dyn Transaction, repeater_id: &str, roots: Vec<String>) -> Result<Vec<String>> {
        let mut members: BTreeSet<String> = roots.iter().cloned().collect();
        let mut children: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut queue: VecDeque<String> = roots.iter().cloned().collect();
        while let Some(id) = queue.pop_front() {
            for child in tx.get_nodes_by_parent(&id)? {
                let skip = child.id == repeater_id
                    || child.occurrence_mark().is_some()
                    || child.metadata.get(META_DISPLAY_FOR).is_some()
                    || self.ids.is_derived(&child.id);
                if skip {
                    continue;
                }
                children.entry(id.clone()).or_default().push(child.id.clone());
                if members.insert(child.id.clone()) {
                    queue.push_back(child.id);
                }
            }
        }

        // A declared id nested under another declared id is visited with its
        // ancestor rather than as a root of its own.
        let nested: BTreeSet<&String> = children.values().flatten().collect();
        let mut ordered = Vec::with_capacity(members.len());
        let mut seen = BTreeSet::new();
        for root in roots.iter().filter(|r| !nested.contains(r)) {
            let mut queue = VecDeque::from([root.clone()]);
            while let Some(id) = queue.pop_front() {
                if !seen.insert(id.clone()) {
                    continue;
                }
                if let Some(kids) = children.get(&id) {
                    queue.extend(kids.iter().cloned());
                }
                ordered.push(id);
            }
        }
        Ok(ordered)
    }
}

/// A cached blueprint is usable while everything it names still exists.
fn still_valid(tx: &dyn Transaction, blueprint: &Blueprint) -> Result<bool> {
    for id in &blueprint.template_node_ids {
        if !tx.node_exists(id)? {
            return Ok(false);
        }
    }
    for cap in &blueprint.capacities {
        if tx.find_capacity(&cap.capacity_id)?.is_none() {
            return Ok(false);
        }
    }
    for var in &blueprint.variables {
        if let Err(e) = tx.get_variable(&var.variable_id) {
            if e.is_not_found() {
                return Ok(false);
            }
            return Err(e.into());
        }
    }
    Ok(true)
}
