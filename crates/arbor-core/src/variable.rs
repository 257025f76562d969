//! Variables -- named, exposed output values owned by a node.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::enums::SourceType;
use crate::reference::{self, Reference};

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// A variable owned 1:1 by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub id: String,

    pub node_id: String,

    /// Unique across the graph.
    pub exposed_key: String,

    #[serde(default)]
    pub display_name: String,

    #[serde(default)]
    pub source_type: SourceType,

    /// Reference to the capacity (or node) producing the value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    #[serde(default = "empty_object")]
    pub metadata: Value,
}

impl Variable {
    pub fn new(id: impl Into<String>, node_id: impl Into<String>, exposed_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_id: node_id.into(),
            exposed_key: exposed_key.into(),
            display_name: String::new(),
            source_type: SourceType::Manual,
            source_ref: None,
            unit: None,
            metadata: empty_object(),
        }
    }

    /// Points the variable at a source, setting `sourceType` to match.
    pub fn with_source(mut self, source_type: SourceType, source_ref: impl Into<String>) -> Self {
        self.source_type = source_type;
        self.source_ref = Some(source_ref.into());
        self
    }

    pub fn source_reference(&self) -> Option<Reference> {
        self.source_ref.as_deref().and_then(reference::parse)
    }

    /// The additional direct node reference kept in `metadata.selectedNodeId`.
    pub fn selected_node_id(&self) -> Option<&str> {
        self.metadata
            .get("selectedNodeId")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::TargetKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn source_reference_is_parsed() {
        let v = Variable::new("v1", "n1", "price").with_source(SourceType::Formula, "node-formula:f1");
        let r = v.source_reference().unwrap();
        assert_eq!(r.kind(), TargetKind::Formula);
        assert_eq!(r.id(), "f1");
    }

    #[test]
    fn selected_node_from_metadata() {
        let v: Variable = serde_json::from_value(json!({
            "id": "v1",
            "nodeId": "n1",
            "exposedKey": "k",
            "metadata": {"selectedNodeId": "other"}
        }))
        .unwrap();
        assert_eq!(v.selected_node_id(), Some("other"));
        assert_eq!(v.source_type, SourceType::Manual);
    }
}
