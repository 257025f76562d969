//! Reference rewriting for clones.
//!
//! When a template is instantiated every reference that targets a node or
//! capacity inside the template set is redirected to the matching clone.
//! References to anything outside the set are left exactly as written.

use std::collections::HashMap;

use serde_json::Value;

use arbor_core::capacity::CapacityBody;
use arbor_core::extract::{DEFAULT_MAX_DEPTH, NODE_ID_KEYS, REF_KEYS};
use arbor_core::reference::{self, Reference};
use arbor_core::variable::Variable;

/// Key of condition action target lists.
const NODE_ID_LIST_KEY: &str = "nodeIds";

/// Template id -> clone id, for nodes and for capacities.
#[derive(Debug, Clone, Default)]
pub struct RewriteMaps {
    pub nodes: HashMap<String, String>,
    pub capacities: HashMap<String, String>,
}

impl RewriteMaps {
    /// The clone-side reference for `r`, or `None` when `r` points outside
    /// the template set. The prefix text is preserved.
    pub fn map_reference(&self, r: &Reference) -> Option<Reference> {
        let target = match r.kind().capacity_kind() {
            None => self.nodes.get(r.id()),
            // `node-formula:<nodeId>` names a node's formula through the node.
            Some(_) => self
                .capacities
                .get(r.id())
                .or_else(|| self.nodes.get(r.id())),
        }?;
        Some(r.with_id(target.clone()))
    }

    /// Rewrites a reference string, bare ids included.
    pub fn map_str(&self, s: &str) -> Option<String> {
        reference::parse(s)
            .and_then(|r| self.map_reference(&r))
            .map(|r| r.to_string())
    }

    /// Rewrites references inside an arbitrary JSON value in place. Returns
    /// the number of references changed.
    pub fn rewrite_value(&self, value: &mut Value) -> usize {
        self.walk(value, 0)
    }

    fn walk(&self, value: &mut Value, depth: usize) -> usize {
        if depth > DEFAULT_MAX_DEPTH {
            return 0;
        }
        match value {
            Value::Object(map) => {
                let mut changed = 0;
                for (key, v) in map.iter_mut() {
                    changed += match (key.as_str(), &mut *v) {
                        (k, Value::String(s)) if NODE_ID_KEYS.contains(&k) => {
                            let mapped = self.nodes.get(s.as_str()).cloned();
                            replace(s, mapped)
                        }
                        (k, Value::String(s)) if REF_KEYS.contains(&k) => {
                            let mapped = self.map_str(s);
                            replace(s, mapped)
                        }
                        (NODE_ID_LIST_KEY, Value::Array(items)) => items
                            .iter_mut()
                            .map(|item| match item {
                                Value::String(s) => {
                                    let mapped = self.map_str(s);
                                    replace(s, mapped)
                                }
                                other => self.walk(other, depth + 1),
                            })
                            .sum(),
                        (_, v) => self.walk(v, depth + 1),
                    };
                }
                changed
            }
            Value::Array(items) => items.iter_mut().map(|v| self.walk(v, depth + 1)).sum(),
            Value::String(s) => self.rewrite_text(s),
            _ => 0,
        }
    }

    /// Rewrites prefixed references embedded in free text.
    fn rewrite_text(&self, s: &mut String) -> usize {
        let mut changed = 0;
        let rewritten = reference::replace_embedded(s, |r| {
            let mapped = self.map_reference(r)?;
            changed += 1;
            Some(mapped.to_string())
        })
        .into_owned();
        if changed > 0 {
            *s = rewritten;
        }
        changed
    }

    /// A copy of `body` with its references redirected.
    pub fn rewrite_body(&self, body: &CapacityBody) -> serde_json::Result<(CapacityBody, usize)> {
        let mut value = serde_json::to_value(body)?;
        let changed = self.rewrite_value(&mut value);
        Ok((serde_json::from_value(value)?, changed))
    }

    /// Redirects `sourceRef` and any references held in the metadata.
    pub fn rewrite_variable(&self, variable: &mut Variable) -> usize {
        let mut changed = 0;
        if let Some(mapped) = variable.source_ref.as_deref().and_then(|s| self.map_str(s)) {
            variable.source_ref = Some(mapped);
            changed += 1;
        }
        changed + self.rewrite_value(&mut variable.metadata)
    }
}

fn replace(slot: &mut String, mapped: Option<String>) -> usize {
    match mapped {
        Some(new) if new != *slot => {
            *slot = new;
            1
        }
        _ => 0,
    }
}
