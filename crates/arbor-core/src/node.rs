//! The [`Node`] type -- one element of the form tree -- and its linked-id sets.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::enums::{LinkField, NodeType};

/// Metadata key naming the template node a clone was copied from.
pub const META_SOURCE_TEMPLATE: &str = "sourceTemplateId";
/// Metadata key naming the repeater that produced a clone.
pub const META_REPEATER: &str = "duplicatedFromRepeater";
/// Metadata key holding a clone's occurrence index.
pub const META_OCCURRENCE: &str = "occurrenceIndex";
/// Metadata key marking a clone that displays a linked-only variable; holds
/// the variable id.
pub const META_DISPLAY_FOR: &str = "displayForVariable";
/// Metadata key holding a repeater's configuration.
pub const META_REPEATER_CONFIG: &str = "repeater";

fn empty_object() -> Value {
    Value::Object(Default::default())
}

fn is_empty_object(v: &Value) -> bool {
    v.as_object().is_some_and(|m| m.is_empty()) || v.is_null()
}

// ---------------------------------------------------------------------------
// LinkedIds
// ---------------------------------------------------------------------------

/// The four per-node sets recording every capacity or variable that is owned
/// by the node or references it.
///
/// The sets only grow through [`LinkedIds::merge`] and only shrink through
/// [`LinkedIds::remove`]; there is no way to assign them wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedIds {
    #[serde(default)]
    linked_formula_ids: BTreeSet<String>,
    #[serde(default)]
    linked_condition_ids: BTreeSet<String>,
    #[serde(default)]
    linked_table_ids: BTreeSet<String>,
    #[serde(default)]
    linked_variable_ids: BTreeSet<String>,
}

impl LinkedIds {
    pub fn get(&self, field: LinkField) -> &BTreeSet<String> {
        match field {
            LinkField::Formula => &self.linked_formula_ids,
            LinkField::Condition => &self.linked_condition_ids,
            LinkField::Table => &self.linked_table_ids,
            LinkField::Variable => &self.linked_variable_ids,
        }
    }

    fn get_mut(&mut self, field: LinkField) -> &mut BTreeSet<String> {
        match field {
            LinkField::Formula => &mut self.linked_formula_ids,
            LinkField::Condition => &mut self.linked_condition_ids,
            LinkField::Table => &mut self.linked_table_ids,
            LinkField::Variable => &mut self.linked_variable_ids,
        }
    }

    pub fn contains(&self, field: LinkField, id: &str) -> bool {
        self.get(field).contains(id)
    }

    /// Ids from `desired` that are not yet in the set.
    pub fn missing<'a>(
        &self,
        field: LinkField,
        desired: impl IntoIterator<Item = &'a String>,
    ) -> BTreeSet<String> {
        let current = self.get(field);
        desired
            .into_iter()
            .filter(|id| !current.contains(id.as_str()))
            .cloned()
            .collect()
    }

    /// Unions `ids` into the set and returns the ids that were actually added.
    pub fn merge<I, S>(&mut self, field: LinkField, ids: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set = self.get_mut(field);
        let mut added = Vec::new();
        for id in ids {
            let id = id.into();
            if id.is_empty() {
                continue;
            }
            if set.insert(id.clone()) {
                added.push(id);
            }
        }
        added
    }

    /// Removes `ids` from the set and returns the ids that were present.
    pub fn remove<'a, I>(&mut self, field: LinkField, ids: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let set = self.get_mut(field);
        ids.into_iter()
            .filter(|id| set.remove(*id))
            .map(str::to_string)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        LinkField::ALL.iter().all(|f| self.get(*f).is_empty())
    }
}

// ---------------------------------------------------------------------------
// Repeater configuration
// ---------------------------------------------------------------------------

/// How the per-occurrence values of a total field are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationKind {
    #[default]
    Sum,
    #[serde(alias = "avg")]
    Average,
    Count,
}

/// Aggregation declared by a repeater: one value summarizing a template node
/// across the template and every occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TotalFieldSpec {
    #[serde(rename = "aggregationType", default)]
    pub aggregation: AggregationKind,

    /// Template node whose value is aggregated.
    pub source_node_id: String,

    /// Node that displays the total and owns the total variable.
    #[serde(rename = "targetDisplayNodeId")]
    pub target_node_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_variable_id: Option<String>,

    /// Exposed key for a total variable that has to be created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposed_key: Option<String>,
}

/// Configuration stored under `metadata.repeater` on a repeater node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeaterConfig {
    #[serde(default)]
    pub template_node_ids: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_field: Option<TotalFieldSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_occurrences: Option<u32>,
}

/// Back-references stamped on every node produced by instantiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OccurrenceMark {
    pub source_template_id: String,
    pub repeater_id: String,
    pub index: u32,
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A single element of the form tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    #[serde(rename = "type", default)]
    pub node_type: NodeType,

    #[serde(default)]
    pub label: String,

    #[serde(default)]
    pub order: i64,

    // ===== Capability flags =====
    #[serde(default)]
    pub has_formula: bool,
    #[serde(default)]
    pub has_condition: bool,
    #[serde(default)]
    pub has_table: bool,
    #[serde(default)]
    pub has_variable: bool,

    /// Free-form JSON; holds repeater configuration and clone back-references.
    #[serde(default = "empty_object", skip_serializing_if = "is_empty_object")]
    pub metadata: Value,

    /// Legacy location of a repeater's template list.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repeater_template_node_ids: Vec<String>,

    /// Read-only from the outside: stores ignore this field on write.
    #[serde(flatten, default)]
    pub linked: LinkedIds,
}

impl Node {
    /// Repeater configuration, if the metadata carries a well-formed one.
    pub fn repeater_config(&self) -> Option<RepeaterConfig> {
        self.metadata
            .get(META_REPEATER_CONFIG)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Template ids declared on the node: `metadata.repeater.templateNodeIds`
    /// first, then the legacy column.
    pub fn declared_template_ids(&self) -> Vec<String> {
        match self.repeater_config() {
            Some(cfg) if !cfg.template_node_ids.is_empty() => cfg.template_node_ids,
            _ => self.repeater_template_node_ids.clone(),
        }
    }

    pub fn occurrence_mark(&self) -> Option<OccurrenceMark> {
        let source = self.metadata.get(META_SOURCE_TEMPLATE)?.as_str()?;
        let repeater = self.metadata.get(META_REPEATER)?.as_str()?;
        let index = self.metadata.get(META_OCCURRENCE)?.as_u64()?;
        Some(OccurrenceMark {
            source_template_id: source.to_string(),
            repeater_id: repeater.to_string(),
            index: u32::try_from(index).ok()?,
        })
    }

    pub fn set_occurrence_mark(&mut self, mark: &OccurrenceMark) {
        if !self.metadata.is_object() {
            self.metadata = empty_object();
        }
        if let Some(map) = self.metadata.as_object_mut() {
            map.insert(META_SOURCE_TEMPLATE.into(), Value::from(mark.source_template_id.clone()));
            map.insert(META_REPEATER.into(), Value::from(mark.repeater_id.clone()));
            map.insert(META_OCCURRENCE.into(), Value::from(mark.index));
        }
    }

    /// Display label for traces: the label when set, otherwise the id.
    pub fn display_label(&self) -> &str {
        if self.label.is_empty() {
            &self.id
        } else {
            &self.label
        }
    }
}

// ---------------------------------------------------------------------------
// NodeBuilder
// ---------------------------------------------------------------------------

/// Builder for [`Node`], used by tests and importers.
pub struct NodeBuilder {
    node: Node,
}

impl NodeBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            node: Node {
                id: id.into(),
                parent_id: None,
                node_type: NodeType::default(),
                label: String::new(),
                order: 0,
                has_formula: false,
                has_condition: false,
                has_table: false,
                has_variable: false,
                metadata: empty_object(),
                repeater_template_node_ids: Vec::new(),
                linked: LinkedIds::default(),
            },
        }
    }

    pub fn parent(mut self, parent_id: impl Into<String>) -> Self {
        self.node.parent_id = Some(parent_id.into());
        self
    }

    pub fn node_type(mut self, node_type: NodeType) -> Self {
        self.node.node_type = node_type;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.node.label = label.into();
        self
    }

    pub fn order(mut self, order: i64) -> Self {
        self.node.order = order;
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.node.metadata = metadata;
        self
    }

    /// Marks the node as a repeater with the given configuration.
    pub fn repeater(mut self, config: RepeaterConfig) -> Self {
        self.node.node_type = NodeType::Repeater;
        if !self.node.metadata.is_object() {
            self.node.metadata = empty_object();
        }
        if let (Some(map), Ok(cfg)) = (self.node.metadata.as_object_mut(), serde_json::to_value(config)) {
            map.insert(META_REPEATER_CONFIG.into(), cfg);
        }
        self
    }

    pub fn build(self) -> Node {
        self.node
    }
}
