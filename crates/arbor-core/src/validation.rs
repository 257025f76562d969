//! Structural validation applied before graph entities are persisted.

use crate::capacity::Capacity;
use crate::node::Node;
use crate::reference;
use crate::variable::Variable;

/// Error type for validation failures.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid {entity} id: {id:?}")]
    InvalidId { entity: &'static str, id: String },

    #[error("node {0} cannot be its own parent")]
    SelfParent(String),

    #[error("capacity {id} has invalid owner node id {owner:?}")]
    InvalidOwner { id: String, owner: String },

    #[error("variable {0} has an empty exposed key")]
    EmptyExposedKey(String),

    #[error("variable {id} has unparseable source reference {source_ref:?}")]
    InvalidSourceRef { id: String, source_ref: String },
}

fn check_id(entity: &'static str, id: &str) -> Result<(), ValidationError> {
    if reference::is_identifier(id) {
        Ok(())
    } else {
        Err(ValidationError::InvalidId {
            entity,
            id: id.to_string(),
        })
    }
}

pub fn validate_node(node: &Node) -> Result<(), ValidationError> {
    check_id("node", &node.id)?;
    if let Some(parent) = &node.parent_id {
        check_id("parent", parent)?;
        if parent == &node.id {
            return Err(ValidationError::SelfParent(node.id.clone()));
        }
    }
    Ok(())
}

pub fn validate_capacity(capacity: &Capacity) -> Result<(), ValidationError> {
    check_id("capacity", &capacity.id)?;
    if !reference::is_identifier(&capacity.owner_node_id) {
        return Err(ValidationError::InvalidOwner {
            id: capacity.id.clone(),
            owner: capacity.owner_node_id.clone(),
        });
    }
    Ok(())
}

pub fn validate_variable(variable: &Variable) -> Result<(), ValidationError> {
    check_id("variable", &variable.id)?;
    check_id("node", &variable.node_id)?;
    if variable.exposed_key.trim().is_empty() {
        return Err(ValidationError::EmptyExposedKey(variable.id.clone()));
    }
    if let Some(source) = &variable.source_ref {
        if !source.is_empty() && reference::parse(source).is_none() {
            return Err(ValidationError::InvalidSourceRef {
                id: variable.id.clone(),
                source_ref: source.clone(),
            });
        }
    }
    Ok(())
}
