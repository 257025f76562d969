//! Repeat Instantiator: materializes one occurrence of a blueprint.
//!
//! Everything here runs inside the caller's transaction and returns storage
//! errors unchanged, so any failure rolls the whole occurrence back.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};

use arbor_core::blueprint::{Blueprint, VariableDescriptor};
use arbor_core::capacity::Capacity;
use arbor_core::enums::CapacityKind;
use arbor_core::idgen::IdAllocator;
use arbor_core::node::{LinkedIds, Node, OccurrenceMark, META_DISPLAY_FOR};
use arbor_core::variable::Variable;
use arbor_storage::error::{Result, StorageError};
use arbor_storage::Transaction;

use crate::aggregate::{refresh_total, TotalReport};
use crate::links::{LinkMaintainer, LinkReport, LinkScope};
use crate::rewrite::RewriteMaps;

/// An exposed key that had to be suffixed to stay unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyRename {
    pub variable_id: String,
    pub requested: String,
    pub assigned: String,
}

/// Everything one instantiation created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OccurrenceResult {
    pub repeater_id: String,
    pub index: u32,
    /// Template node id -> clone id.
    pub nodes: BTreeMap<String, String>,
    pub capacity_ids: Vec<String>,
    pub variable_ids: Vec<String>,
    /// Nodes created to host linked-only variables.
    pub display_node_ids: Vec<String>,
    pub renamed_keys: Vec<KeyRename>,
    pub references_rewritten: usize,
    pub links: LinkReport,
    pub total: Option<TotalReport>,
}

impl OccurrenceResult {
    /// Ids of every node created, clones first.
    pub fn created_node_ids(&self) -> Vec<String> {
        self.nodes
            .values()
            .chain(self.display_node_ids.iter())
            .cloned()
            .collect()
    }
}

/// Returns `base` or the first of `base-2`, `base-3`, ... that no stored
/// variable and no entry of `pending` uses.
pub fn unique_exposed_key(tx: &dyn Transaction, base: &str, pending: &[String]) -> Result<String> {
    let free = |candidate: &str| -> Result<bool> {
        Ok(!pending.iter().any(|k| k == candidate) && tx.find_variable_by_exposed_key(candidate)?.is_none())
    };
    if free(base)? {
        return Ok(base.to_string());
    }
    let mut n = 2u32;
    loop {
        let candidate = format!("{base}-{n}");
        if free(&candidate)? {
            return Ok(candidate);
        }
        n += 1;
    }
}

pub struct Instantiator<'a> {
    ids: &'a dyn IdAllocator,
    linker: LinkMaintainer<'a>,
}

/// Accumulates writes for one occurrence.
struct Occurrence<'t> {
    tx: &'t dyn Transaction,
    mark_repeater: String,
    index: u32,
    maps: RewriteMaps,
    keys: Vec<String>,
    result: OccurrenceResult,
}

impl<'a> Instantiator<'a> {
    pub fn new(ids: &'a dyn IdAllocator, linker: LinkMaintainer<'a>) -> Self {
        Self { ids, linker }
    }

    /// Clones every template node, capacity and variable of `blueprint` as
    /// occurrence `index`, then relinks and refreshes the total.
    pub fn instantiate(&self, tx: &dyn Transaction, blueprint: &Blueprint, index: u32) -> Result<OccurrenceResult> {
        let repeater_id = blueprint.repeater_node_id.clone();
        let mut occ = Occurrence {
            tx,
            mark_repeater: repeater_id.clone(),
            index,
            maps: RewriteMaps::default(),
            keys: Vec::new(),
            result: OccurrenceResult {
                repeater_id: repeater_id.clone(),
                index,
                nodes: BTreeMap::new(),
                capacity_ids: Vec::new(),
                variable_ids: Vec::new(),
                display_node_ids: Vec::new(),
                renamed_keys: Vec::new(),
                references_rewritten: 0,
                links: LinkReport::default(),
                total: None,
            },
        };

        // 1. Derive every id up front so references can be rewritten in one pass.
        for template_id in &blueprint.template_node_ids {
            let clone_id = self.ids.derive(template_id, index);
            if tx.node_exists(&clone_id)? {
                return Err(StorageError::collision("node", clone_id));
            }
            occ.maps.nodes.insert(template_id.clone(), clone_id);
        }
        for cap in &blueprint.capacities {
            let clone_id = self.ids.derive(&cap.capacity_id, index);
            if tx.find_capacity(&clone_id)?.is_some() {
                return Err(StorageError::collision("capacity", clone_id));
            }
            occ.maps.capacities.insert(cap.capacity_id.clone(), clone_id);
        }

        // 2. Nodes.
        let mut clones = Vec::with_capacity(blueprint.template_node_ids.len());
        for template_id in &blueprint.template_node_ids {
            let template = tx.get_node(template_id)?;
            let clone_id = occ.mapped_node(template_id)?;
            clones.push(occ.clone_node(&template, &clone_id, None));
        }
        tx.upsert_nodes(&clones)?;
        occ.result.nodes = occ.maps.nodes.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

        // 3. Capacities.
        for desc in &blueprint.capacities {
            let template = tx.get_capacity(desc.capacity_type, &desc.capacity_id)?;
            let owner = occ.mapped_node(&template.owner_node_id)?;
            let clone_id = occ.maps.capacities[&desc.capacity_id].clone();
            let maps = occ.maps.clone();
            occ.copy_capacity(&template, clone_id, owner, &maps)?;
        }

        // 4. Variables.
        let mut hosts_per_variable: HashMap<&str, usize> = HashMap::new();
        for desc in blueprint.variables.iter().filter(|d| d.is_linked_only()) {
            *hosts_per_variable.entry(desc.variable_id.as_str()).or_default() += 1;
        }
        for desc in &blueprint.variables {
            match desc.primary_target_node_id.as_deref() {
                None => self.copy_owned_variable(&mut occ, desc)?,
                Some(primary) => {
                    let shared = hosts_per_variable.get(desc.variable_id.as_str()).copied().unwrap_or(1) > 1;
                    self.copy_linked_variable(&mut occ, desc, primary, shared)?;
                }
            }
        }

        // 5. Links, for every node created.
        for node_id in occ.result.created_node_ids() {
            let report = self.linker.recompute(tx, &LinkScope::Node(node_id))?;
            occ.result.links.absorb(&report);
        }

        // 6. Aggregation.
        if let Some(spec) = &blueprint.total_field {
            occ.result.total = refresh_total(tx, &self.linker, &repeater_id, spec)?;
        }

        info!(
            repeater_id = %repeater_id,
            index,
            nodes = occ.result.nodes.len(),
            capacities = occ.result.capacity_ids.len(),
            variables = occ.result.variable_ids.len(),
            "created occurrence"
        );
        Ok(occ.result)
    }

    fn copy_owned_variable(&self, occ: &mut Occurrence<'_>, desc: &VariableDescriptor) -> Result<()> {
        let template = occ.tx.get_variable(&desc.variable_id)?;
        let node_id = occ.mapped_node(&template.node_id)?;
        let clone_id = self.ids.derive(&template.id, occ.index);
        let maps = occ.maps.clone();
        occ.copy_variable(&template, clone_id, node_id, &maps)
    }

    /// Hosts a copy of a variable owned outside the template under the
    /// clone of `primary`, on a new display node modeled on the variable's
    /// owner.
    fn copy_linked_variable(
        &self,
        occ: &mut Occurrence<'_>,
        desc: &VariableDescriptor,
        primary: &str,
        shared: bool,
    ) -> Result<()> {
        let template = occ.tx.get_variable(&desc.variable_id)?;
        let owner = occ.tx.get_node(&template.node_id)?;
        let host = occ.mapped_node(primary)?;

        let seed = |id: &str| {
            if shared {
                format!("{id}-via-{primary}")
            } else {
                id.to_string()
            }
        };
        let display_id = self.ids.derive(&seed(&owner.id), occ.index);
        if occ.tx.node_exists(&display_id)? {
            return Err(StorageError::collision("node", display_id));
        }

        let mut maps = occ.maps.clone();
        maps.nodes.insert(owner.id.clone(), display_id.clone());

        // The source capacity travels with the variable when the owner holds it.
        let source = match template.source_reference() {
            Some(r) if r.kind().capacity_kind().is_some() => occ.tx.find_capacity(r.id())?,
            _ => None,
        };
        let source = source.filter(|c| c.owner_node_id == owner.id);
        if let Some(cap) = &source {
            let cap_id = self.ids.derive(&seed(&cap.id), occ.index);
            if occ.tx.find_capacity(&cap_id)?.is_some() {
                return Err(StorageError::collision("capacity", cap_id));
            }
            maps.capacities.insert(cap.id.clone(), cap_id);
        }

        let mut display = occ.clone_node(&owner, &display_id, Some(host.as_str()));
        display.has_variable = true;
        display.has_formula = false;
        display.has_condition = false;
        display.has_table = false;
        if let Some(map) = display.metadata.as_object_mut() {
            map.insert(META_DISPLAY_FOR.into(), template.id.clone().into());
        }
        if let Some(cap) = &source {
            match cap.kind() {
                CapacityKind::Formula => display.has_formula = true,
                CapacityKind::Condition => display.has_condition = true,
                CapacityKind::Table => display.has_table = true,
            }
        }
        occ.tx.upsert_node(&display)?;
        occ.result.display_node_ids.push(display_id.clone());

        if let Some(cap) = &source {
            let cap_id = maps.capacities[&cap.id].clone();
            occ.copy_capacity(cap, cap_id, display_id.clone(), &maps)?;
        }
        let var_id = self.ids.derive(&seed(&template.id), occ.index);
        occ.copy_variable(&template, var_id, display_id, &maps)
    }
}

impl Occurrence<'_> {
    fn mapped_node(&self, template_id: &str) -> Result<String> {
        self.maps
            .nodes
            .get(template_id)
            .cloned()
            .ok_or_else(|| StorageError::Internal(format!("{template_id} is not part of the template")))
    }

    /// A copy of `template` under `clone_id`. The parent follows the template
    /// set when it is inside it, else `parent` (or the template's own parent).
    fn clone_node(&mut self, template: &Node, clone_id: &str, parent: Option<&str>) -> Node {
        let mut node = template.clone();
        node.id = clone_id.to_string();
        node.parent_id = match parent {
            Some(p) => Some(p.to_string()),
            None => template
                .parent_id
                .as_ref()
                .map(|p| self.maps.nodes.get(p).cloned().unwrap_or_else(|| p.clone())),
        };
        node.linked = LinkedIds::default();
        self.result.references_rewritten += self.maps.rewrite_value(&mut node.metadata);
        node.set_occurrence_mark(&OccurrenceMark {
            source_template_id: template.id.clone(),
            repeater_id: self.mark_repeater.clone(),
            index: self.index,
        });
        node
    }

    fn copy_capacity(&mut self, template: &Capacity, clone_id: String, owner: String, maps: &RewriteMaps) -> Result<()> {
        let (body, rewritten) = maps.rewrite_body(&template.body)?;
        let now = Utc::now();
        let clone = Capacity {
            id: clone_id,
            owner_node_id: owner,
            name: template.name.clone(),
            is_default: template.is_default,
            created_at: now,
            updated_at: now,
            body,
        };
        self.tx.upsert_capacity(&clone)?;
        debug!(template = %template.id, clone = %clone.id, rewritten, "copied capacity");
        self.result.references_rewritten += rewritten;
        self.result.capacity_ids.push(clone.id);
        Ok(())
    }

    fn copy_variable(&mut self, template: &Variable, clone_id: String, node_id: String, maps: &RewriteMaps) -> Result<()> {
        match self.tx.get_variable(&clone_id) {
            Ok(_) => return Err(StorageError::collision("variable", clone_id)),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let requested = format!("{}-{}", template.exposed_key, self.index);
        let assigned = unique_exposed_key(self.tx, &requested, &self.keys)?;
        if assigned != requested {
            self.result.renamed_keys.push(KeyRename {
                variable_id: clone_id.clone(),
                requested,
                assigned: assigned.clone(),
            });
        }
        self.keys.push(assigned.clone());

        let mut clone = template.clone();
        clone.id = clone_id;
        clone.node_id = node_id;
        clone.exposed_key = assigned;
        self.result.references_rewritten += maps.rewrite_variable(&mut clone);
        self.tx.upsert_variable(&clone)?;
        self.result.variable_ids.push(clone.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::BlueprintBuilder;
    use crate::fixtures::{formula, store_with};
    use arbor_config::BlueprintConfig;
    use arbor_core::capacity::{CapacityBody, Token};
    use arbor_core::enums::{LinkField, SourceType};
    use arbor_core::extract::Extractor;
    use arbor_core::idgen::{HashedIds, SuffixIds};
    use arbor_core::node::{NodeBuilder, RepeaterConfig};
    use arbor_storage::{SqliteStore, Storage};
    use pretty_assertions::assert_eq;

    fn example_store() -> SqliteStore {
        store_with(|tx| {
            tx.upsert_node(
                &NodeBuilder::new("rep")
                    .repeater(RepeaterConfig {
                        template_node_ids: vec!["a".into(), "b".into()],
                        ..Default::default()
                    })
                    .build(),
            )?;
            tx.upsert_node(&NodeBuilder::new("global").label("Rate").build())?;
            tx.upsert_node(&NodeBuilder::new("a").parent("rep").label("Area").build())?;
            tx.upsert_node(&NodeBuilder::new("b").parent("rep").label("Base").build())?;
            tx.upsert_node(&NodeBuilder::new("b-child").parent("b").build())?;
            tx.upsert_capacity(&formula(
                "fa",
                "a",
                vec![Token::reference("@value.b"), Token::op('*'), Token::reference("@value.global")],
            ))?;
            tx.upsert_variable(&Variable::new("vb", "b", "base"))?;
            tx.upsert_variable(&Variable::new("va", "a", "area").with_source(SourceType::Formula, "node-formula:fa"))
        })
    }

    fn run(store: &SqliteStore, ids: &dyn IdAllocator, index: u32) -> Result<OccurrenceResult> {
        let extractor = Extractor::default();
        let config = BlueprintConfig::default();
        let mut out = None;
        store.run_in_transaction(&mut |tx| {
            let blueprint = BlueprintBuilder::new(&config, ids)
                .build(tx, "rep", true)
                .map_err(|e| StorageError::Internal(e.to_string()))?;
            out = Some(Instantiator::new(ids, LinkMaintainer::new(&extractor)).instantiate(tx, &blueprint, index)?);
            Ok(())
        })?;
        Ok(out.unwrap())
    }

    fn tokens_of(store: &SqliteStore, id: &str) -> String {
        let cap = store.get_capacity(CapacityKind::Formula, id).unwrap();
        let CapacityBody::Formula(spec) = cap.body else { panic!("not a formula") };
        serde_json::to_string(&spec.tokens).unwrap()
    }

    #[test]
    fn clones_nodes_with_suffix_ids() {
        let store = example_store();
        let result = run(&store, &SuffixIds, 1).unwrap();
        assert_eq!(
            result.nodes,
            BTreeMap::from([
                ("a".to_string(), "a-1".to_string()),
                ("b".to_string(), "b-1".to_string()),
                ("b-child".to_string(), "b-child-1".to_string()),
            ])
        );
        let a1 = store.get_node("a-1").unwrap();
        assert_eq!(a1.parent_id.as_deref(), Some("rep"));
        assert_eq!(a1.label, "Area");
        let mark = a1.occurrence_mark().unwrap();
        assert_eq!((mark.source_template_id.as_str(), mark.repeater_id.as_str(), mark.index), ("a", "rep", 1));
    }

    #[test]
    fn template_children_are_cloned_under_the_parent_clone() {
        let store = example_store();
        store
            .run_in_transaction(&mut |tx| {
                tx.upsert_capacity(&formula(
                    "fbc",
                    "b-child",
                    vec![Token::reference("@value.b"), Token::op('+'), Token::Number(1.0)],
                ))?;
                LinkMaintainer::new(&Extractor::default()).recompute(tx, &LinkScope::Graph)?;
                Ok(())
            })
            .unwrap();

        let result = run(&store, &SuffixIds, 1).unwrap();
        assert_eq!(result.nodes["b-child"], "b-child-1");
        let child = store.get_node("b-child-1").unwrap();
        assert_eq!(child.parent_id.as_deref(), Some("b-1"));
        assert_eq!(child.occurrence_mark().unwrap().source_template_id, "b-child");
        assert_eq!(tokens_of(&store, "fbc-1"), r#"[{"type":"ref","ref":"@value.b-1"},"+",1.0]"#);
        assert!(store.get_node("b-1").unwrap().linked.contains(LinkField::Formula, "fbc-1"));
        // The template child stays where it was.
        assert_eq!(store.get_node("b-child").unwrap().parent_id.as_deref(), Some("b"));
    }

    #[test]
    fn inside_references_follow_clone_outside_stay() {
        let store = example_store();
        run(&store, &SuffixIds, 1).unwrap();
        assert_eq!(
            tokens_of(&store, "fa-1"),
            r#"[{"type":"ref","ref":"@value.b-1"},"*",{"type":"ref","ref":"@value.global"}]"#
        );
        // The template is untouched.
        assert_eq!(
            tokens_of(&store, "fa"),
            r#"[{"type":"ref","ref":"@value.b"},"*",{"type":"ref","ref":"@value.global"}]"#
        );
    }

    #[test]
    fn variables_get_suffixed_keys_and_rewritten_sources() {
        let store = example_store();
        let result = run(&store, &SuffixIds, 1).unwrap();
        let va1 = store.get_variable("va-1").unwrap();
        assert_eq!(va1.node_id, "a-1");
        assert_eq!(va1.exposed_key, "area-1");
        assert_eq!(va1.source_ref.as_deref(), Some("node-formula:fa-1"));
        assert_eq!(store.get_variable("vb-1").unwrap().exposed_key, "base-1");
        assert!(result.renamed_keys.is_empty());
    }

    #[test]
    fn colliding_exposed_key_is_suffixed() {
        let store = example_store();
        store
            .run_in_transaction(&mut |tx| tx.upsert_variable(&Variable::new("squatter", "global", "base-1")))
            .unwrap();
        let result = run(&store, &SuffixIds, 1).unwrap();
        assert_eq!(
            result.renamed_keys,
            vec![KeyRename {
                variable_id: "vb-1".into(),
                requested: "base-1".into(),
                assigned: "base-1-2".into(),
            }]
        );
    }

    #[test]
    fn links_cover_clones_and_external_nodes() {
        let store = example_store();
        run(&store, &SuffixIds, 1).unwrap();
        let b1 = store.get_node("b-1").unwrap();
        assert!(b1.linked.contains(LinkField::Formula, "fa-1"));
        assert!(b1.linked.contains(LinkField::Variable, "vb-1"));
        let global = store.get_node("global").unwrap();
        assert!(global.linked.contains(LinkField::Formula, "fa-1"));
        // Clone sets never inherit template ids.
        assert!(!b1.linked.contains(LinkField::Formula, "fa"));
    }

    #[test]
    fn collision_rolls_everything_back() {
        let store = example_store();
        // Nodes and capacities are written before variables; the clash
        // happens late.
        store
            .run_in_transaction(&mut |tx| tx.upsert_variable(&Variable::new("vb-1", "global", "taken")))
            .unwrap();
        let before = store.counts().unwrap();
        let err = run(&store, &SuffixIds, 1).unwrap_err();
        assert!(matches!(err, StorageError::IdCollision { .. }));
        assert_eq!(store.counts().unwrap(), before);
        assert!(store.get_node("a-1").unwrap_err().is_not_found());
    }

    #[test]
    fn existing_clone_node_is_a_collision() {
        let store = example_store();
        store
            .run_in_transaction(&mut |tx| tx.upsert_node(&NodeBuilder::new("b-1").build()))
            .unwrap();
        let err = run(&store, &SuffixIds, 1).unwrap_err();
        assert!(matches!(err, StorageError::IdCollision { ref id, .. } if id == "b-1"));
    }

    #[test]
    fn hashed_ids_are_opaque() {
        let store = example_store();
        let ids = HashedIds::default();
        let result = run(&store, &ids, 1).unwrap();
        for clone in result.nodes.values() {
            assert!(ids.is_derived(clone), "{clone}");
        }
        let b1 = &result.nodes["b"];
        let fa1 = &result.capacity_ids[0];
        assert_eq!(
            tokens_of(&store, fa1),
            format!(r#"[{{"type":"ref","ref":"@value.{b1}"}},"*",{{"type":"ref","ref":"@value.global"}}]"#)
        );
    }

    #[test]
    fn linked_only_variable_gets_display_node() {
        let store = example_store();
        store
            .run_in_transaction(&mut |tx| {
                tx.upsert_node(&NodeBuilder::new("orient").label("Orientation").build())?;
                tx.upsert_capacity(&formula("fo", "orient", vec![Token::reference("@value.b"), Token::op('+'), Token::Number(1.0)]))?;
                tx.upsert_variable(&Variable::new("vo", "orient", "orientation").with_source(SourceType::Formula, "node-formula:fo"))?;
                LinkMaintainer::new(&Extractor::default()).recompute(tx, &LinkScope::Graph)?;
                Ok(())
            })
            .unwrap();

        let result = run(&store, &SuffixIds, 1).unwrap();
        assert_eq!(result.display_node_ids, vec!["orient-1"]);
        let display = store.get_node("orient-1").unwrap();
        assert_eq!(display.parent_id.as_deref(), Some("b-1"));
        assert_eq!(display.metadata[META_DISPLAY_FOR], "vo");
        assert_eq!(display.label, "Orientation");

        let vo1 = store.get_variable("vo-1").unwrap();
        assert_eq!(vo1.node_id, "orient-1");
        assert_eq!(vo1.source_ref.as_deref(), Some("node-formula:fo-1"));
        assert_eq!(tokens_of(&store, "fo-1"), r#"[{"type":"ref","ref":"@value.b-1"},"+",1.0]"#);
    }

    #[test]
    fn second_occurrence_uses_its_own_ids() {
        let store = example_store();
        run(&store, &SuffixIds, 1).unwrap();
        let second = run(&store, &SuffixIds, 2).unwrap();
        assert_eq!(second.nodes["a"], "a-2");
        assert_eq!(tokens_of(&store, "fa-2"), r#"[{"type":"ref","ref":"@value.b-2"},"*",{"type":"ref","ref":"@value.global"}]"#);
    }
}
