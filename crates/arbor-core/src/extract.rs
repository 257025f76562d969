//! Dependency extraction over heterogeneous expression structures.
//!
//! Each structure that can reference the graph implements
//! [`ExtractDependencies`]; [`Extractor::extract`] drives it and then runs a
//! pattern scan over the serialized form to catch references hidden in
//! shapes the typed walkers do not model.

use std::collections::BTreeSet;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::capacity::{
    Capacity, CapacityBody, ConditionSet, FormulaSpec, Operand, TableSpec, Token, TokenKind,
    WhenExpr,
};
use crate::enums::CapacityKind;
use crate::reference::{self, Reference};
use crate::variable::Variable;

/// Default recursion bound for nested structures.
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Keys whose string value is a bare node id.
pub const NODE_ID_KEYS: &[&str] = &["fieldId", "nodeId", "selectedNodeId", "rowFieldId", "columnFieldId"];

/// Keys whose string value is a reference, bare ids allowed.
pub const REF_KEYS: &[&str] = &["ref", "sourceRef"];

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// A reference to a capacity found during extraction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CapacityRef {
    pub kind: CapacityKind,
    pub id: String,
}

/// Everything a structure references.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dependencies {
    /// Referenced node ids (the owner itself is never included).
    pub nodes: BTreeSet<String>,
    /// Referenced capacities (the structure's own capacity is never included).
    pub capacities: BTreeSet<CapacityRef>,
    /// Strings in reference positions that did not parse.
    pub unresolved: Vec<String>,
    /// `true` when the depth bound cut extraction short somewhere.
    pub truncated: bool,
}

impl Dependencies {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.capacities.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Accumulator
// ---------------------------------------------------------------------------

/// Mutable state threaded through one extraction.
pub struct Accumulator<'a> {
    deps: Dependencies,
    owner: Option<&'a str>,
    self_capacity: Option<&'a str>,
    max_depth: usize,
}

impl Accumulator<'_> {
    /// Records a parsed reference, applying self-reference exclusion.
    pub fn add_reference(&mut self, r: &Reference) {
        match r.kind().capacity_kind() {
            None => {
                if self.owner != Some(r.id()) {
                    self.deps.nodes.insert(r.id().to_string());
                }
            }
            Some(kind) => {
                if self.self_capacity != Some(r.id()) {
                    self.deps.capacities.insert(CapacityRef {
                        kind,
                        id: r.id().to_string(),
                    });
                }
            }
        }
    }

    /// Records a string found in a reference position. Bare ids count as
    /// field references.
    pub fn add_reference_str(&mut self, s: &str) {
        if s.trim().is_empty() {
            return;
        }
        match reference::parse(s) {
            Some(r) => self.add_reference(&r),
            None => self.deps.unresolved.push(s.to_string()),
        }
    }

    /// Records a string known to be a plain node id.
    pub fn add_node_id(&mut self, id: &str) {
        if reference::is_identifier(id) {
            self.add_reference(&Reference::bare(id));
        } else if !id.is_empty() {
            self.deps.unresolved.push(id.to_string());
        }
    }

    /// Returns `false` (and flags truncation) once `depth` passes the bound.
    pub fn enter(&mut self, depth: usize) -> bool {
        if depth > self.max_depth {
            if !self.deps.truncated {
                warn!(
                    max_depth = self.max_depth,
                    owner = self.owner.unwrap_or(""),
                    "dependency extraction depth exceeded; branch skipped"
                );
            }
            self.deps.truncated = true;
            return false;
        }
        true
    }

    /// Walks an arbitrary JSON structure, recognizing known reference keys
    /// at any level and prefixed references in plain strings.
    pub fn walk_value(&mut self, value: &Value, depth: usize) {
        if !self.enter(depth) {
            return;
        }
        match value {
            Value::Object(map) => {
                for (key, v) in map {
                    match (key.as_str(), v) {
                        (k, Value::String(s)) if REF_KEYS.contains(&k) => self.add_reference_str(s),
                        (k, Value::String(s)) if NODE_ID_KEYS.contains(&k) => self.add_node_id(s),
                        ("nodeIds", Value::Array(items)) => {
                            for item in items.iter().filter_map(Value::as_str) {
                                self.add_reference_str(item);
                            }
                        }
                        _ => self.walk_value(v, depth + 1),
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.walk_value(item, depth + 1);
                }
            }
            Value::String(s) => {
                if let Some(r) = reference::parse_prefixed(s) {
                    self.add_reference(&r);
                }
            }
            _ => {}
        }
    }

    fn scan_text(&mut self, text: &str) {
        for r in reference::find_embedded(text) {
            self.add_reference(&r);
        }
    }
}

// ---------------------------------------------------------------------------
// ExtractDependencies
// ---------------------------------------------------------------------------

/// A structure that can report the nodes and capacities it references.
pub trait ExtractDependencies {
    fn collect(&self, acc: &mut Accumulator<'_>);
}

impl ExtractDependencies for FormulaSpec {
    fn collect(&self, acc: &mut Accumulator<'_>) {
        for token in &self.tokens {
            match token.classify() {
                TokenKind::Reference(r) => acc.add_reference(&r),
                TokenKind::Unknown => {
                    if let Token::Other(v) = token {
                        acc.walk_value(v, 1);
                    }
                }
                TokenKind::Number(_) | TokenKind::Operator(_) => {}
            }
        }
        for v in self.extra.values() {
            acc.walk_value(v, 1);
        }
    }
}

fn collect_when(expr: &WhenExpr, acc: &mut Accumulator<'_>, depth: usize) {
    if !acc.enter(depth) {
        return;
    }
    for operand in [&expr.left, &expr.right].into_iter().flatten() {
        match operand {
            Operand::Expr(inner) => collect_when(inner, acc, depth + 1),
            Operand::Ref { reference } => acc.add_reference_str(reference),
            Operand::Value { .. } => {}
        }
    }
}

impl ExtractDependencies for ConditionSet {
    fn collect(&self, acc: &mut Accumulator<'_>) {
        for branch in &self.branches {
            collect_when(&branch.when, acc, 1);
            for action in &branch.actions {
                for id in &action.node_ids {
                    acc.add_reference_str(id);
                }
            }
        }
        if let Some(fallback) = &self.fallback {
            for action in &fallback.actions {
                for id in &action.node_ids {
                    acc.add_reference_str(id);
                }
            }
        }
        for v in self.extra.values() {
            acc.walk_value(v, 1);
        }
    }
}

impl ExtractDependencies for TableSpec {
    fn collect(&self, acc: &mut Accumulator<'_>) {
        if let Some(lookup) = &self.lookup {
            if let Some(row) = &lookup.selectors.row_field_id {
                acc.add_node_id(row);
            }
            if let Some(col) = &lookup.selectors.column_field_id {
                acc.add_node_id(col);
            }
            for v in lookup.extra.values() {
                acc.walk_value(v, 2);
            }
        }
        for v in self.extra.values() {
            acc.walk_value(v, 1);
        }
    }
}

impl ExtractDependencies for CapacityBody {
    fn collect(&self, acc: &mut Accumulator<'_>) {
        match self {
            Self::Formula(spec) => spec.collect(acc),
            Self::Condition(set) => set.collect(acc),
            Self::Table(spec) => spec.collect(acc),
        }
    }
}

impl ExtractDependencies for Variable {
    fn collect(&self, acc: &mut Accumulator<'_>) {
        if let Some(source) = &self.source_ref {
            acc.add_reference_str(source);
        }
        if let Some(selected) = self.selected_node_id() {
            acc.add_node_id(selected);
        }
        acc.walk_value(&self.metadata, 1);
    }
}

impl ExtractDependencies for Value {
    fn collect(&self, acc: &mut Accumulator<'_>) {
        acc.walk_value(self, 0);
    }
}

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

/// Configured entry point for dependency extraction.
#[derive(Debug, Clone, Copy)]
pub struct Extractor {
    max_depth: usize,
    pattern_scan: bool,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH, true)
    }
}

impl Extractor {
    pub fn new(max_depth: usize, pattern_scan: bool) -> Self {
        Self {
            max_depth,
            pattern_scan,
        }
    }

    /// Extracts references from `item`, excluding `owner` from the node set
    /// and `self_capacity` from the capacity set.
    pub fn extract<T>(&self, item: &T, owner: Option<&str>, self_capacity: Option<&str>) -> Dependencies
    where
        T: ExtractDependencies + Serialize + ?Sized,
    {
        let mut acc = Accumulator {
            deps: Dependencies::default(),
            owner,
            self_capacity,
            max_depth: self.max_depth,
        };
        item.collect(&mut acc);

        if self.pattern_scan {
            match serde_json::to_string(item) {
                Ok(text) => acc.scan_text(&text),
                Err(e) => warn!(error = %e, "could not serialize structure for pattern scan"),
            }
        }
        acc.deps
    }

    pub fn capacity(&self, capacity: &Capacity) -> Dependencies {
        self.extract(
            &capacity.body,
            Some(capacity.owner_node_id.as_str()),
            Some(capacity.id.as_str()),
        )
    }

    pub fn variable(&self, variable: &Variable) -> Dependencies {
        self.extract(variable, Some(variable.node_id.as_str()), None)
    }
}
