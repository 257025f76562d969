//! Blueprint -- the derived description of a repeater's template.

use serde::{Deserialize, Serialize};

use crate::enums::{CapacityKind, SourceType};
use crate::node::TotalFieldSpec;

/// One variable to duplicate per occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDescriptor {
    /// Node that owns the variable in the template (or outside it, for a
    /// linked-only variable).
    pub node_id: String,

    pub variable_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,

    pub source_type: SourceType,

    /// Set for linked-only variables: the template node whose clone hosts
    /// the duplicated variable's display node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_target_node_id: Option<String>,
}

impl VariableDescriptor {
    pub fn is_linked_only(&self) -> bool {
        self.primary_target_node_id.is_some()
    }
}

/// One capacity to duplicate per occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityDescriptor {
    pub owner_node_id: String,
    pub capacity_id: String,
    pub capacity_type: CapacityKind,
}

/// Canonical description of what one occurrence of a repeater contains.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blueprint {
    pub repeater_node_id: String,

    pub template_node_ids: Vec<String>,

    #[serde(default)]
    pub variables: Vec<VariableDescriptor>,

    #[serde(default)]
    pub capacities: Vec<CapacityDescriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_field: Option<TotalFieldSpec>,

    /// Template ids that did not resolve to an existing node.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_template_ids: Vec<String>,
}

impl Blueprint {
    /// A blueprint with nothing to duplicate.
    pub fn empty(repeater_node_id: impl Into<String>) -> Self {
        Self {
            repeater_node_id: repeater_node_id.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.template_node_ids.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.missing_template_ids.is_empty()
    }
}
