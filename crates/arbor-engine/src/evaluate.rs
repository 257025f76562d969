//! Expression Evaluator.
//!
//! Resolves a field, formula, condition or table reference against one
//! submission's values. Every result carries a human-readable trace in which
//! each reference is shown as `Label(value)`.
//!
//! Evaluation never fails on bad data: missing operands, division by zero,
//! cycles and depth overruns become [`EvalValue::Unresolved`]. Only store
//! failures are returned as errors.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use arbor_config::{EvaluationConfig, FormulaPreference};
use arbor_core::capacity::{
    Action, Capacity, CapacityBody, ConditionSet, FormulaSpec, Operand, Operator, TableSpec, TokenKind, WhenExpr,
};
use arbor_core::enums::{ActionKind, CapacityKind, SourceType};
use arbor_core::node::Node;
use arbor_core::reference::{self, Reference, TargetKind};
use arbor_storage::error::Result;
use arbor_storage::Transaction;

// ---------------------------------------------------------------------------
// Submission context
// ---------------------------------------------------------------------------

/// Submitted values, keyed by node id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionContext {
    values: BTreeMap<String, Value>,
}

impl SubmissionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, node_id: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(node_id.into(), value.into());
        self
    }

    pub fn get(&self, node_id: &str) -> Option<&Value> {
        self.values.get(node_id)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// Why a value could not be produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Unresolved {
    /// No submitted or computed value.
    Missing,
    DivisionByZero,
    /// The reference is already being evaluated further up.
    Cycle,
    DepthExceeded,
    /// The referenced node, capacity or table cell does not exist.
    NotFound,
    /// Tokens that do not form an expression, or non-numeric arithmetic.
    Malformed,
    /// The input did not parse as a reference.
    InvalidReference,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum EvalValue {
    Number(f64),
    Text(String),
    Bool(bool),
    Unresolved(Unresolved),
}

impl EvalValue {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Unresolved(Unresolved::Missing),
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => n.as_f64().map_or(Self::Unresolved(Unresolved::Malformed), Self::Number),
            Value::String(s) => Self::Text(s.clone()),
            other => Self::Text(other.to_string()),
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Unresolved(_))
    }

    /// Unresolved values and blank text count as empty.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Unresolved(_) => true,
            Self::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Number(n) => *n != 0.0,
            Self::Text(s) => {
                let s = s.trim();
                !s.is_empty() && s != "false" && s != "0"
            }
            Self::Unresolved(_) => false,
        }
    }

    /// Numeric reading. Text is parsed, accepting a decimal comma.
    pub fn to_number(&self) -> std::result::Result<f64, Unresolved> {
        match self {
            Self::Number(n) => Ok(*n),
            Self::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Self::Text(s) => {
                let s = s.trim();
                if s.is_empty() {
                    return Err(Unresolved::Missing);
                }
                s.replace(',', ".").parse().map_err(|_| Unresolved::Malformed)
            }
            Self::Unresolved(u) => Err(*u),
        }
    }

    /// Plain text form; unresolved values render as the empty string.
    pub fn text(&self) -> String {
        match self {
            Self::Number(n) => format_number(*n),
            Self::Text(s) => s.clone(),
            Self::Bool(b) => b.to_string(),
            Self::Unresolved(_) => String::new(),
        }
    }
}

/// Integral values print without a fractional part.
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "index", rename_all = "lowercase")]
pub enum Selected {
    /// Zero-based index of the first matching branch.
    Branch(usize),
    Fallback,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedAction {
    pub kind: ActionKind,
    pub targets: Vec<String>,
}

/// Which branch of a condition applied, and its actions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionOutcome {
    pub selected: Selected,
    pub actions: Vec<ResolvedAction>,
}

/// The answer to one `evaluate` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub reference: String,
    pub value: EvalValue,
    pub trace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ConditionOutcome>,
    pub cycle_detected: bool,
    pub depth_exceeded: bool,
}

#[derive(Debug, Clone)]
struct Resolved {
    value: EvalValue,
    label: String,
    trace: String,
    outcome: Option<ConditionOutcome>,
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// One evaluation pass. Results are memoized per reference for the life of
/// the evaluator, so diamond-shaped dependencies are computed once.
pub struct Evaluator<'a> {
    tx: &'a dyn Transaction,
    ctx: &'a SubmissionContext,
    config: &'a EvaluationConfig,
    memo: HashMap<String, Resolved>,
    visiting: HashSet<String>,
    cycle_detected: bool,
    depth_exceeded: bool,
}

impl<'a> Evaluator<'a> {
    pub fn new(tx: &'a dyn Transaction, ctx: &'a SubmissionContext, config: &'a EvaluationConfig) -> Self {
        Self {
            tx,
            ctx,
            config,
            memo: HashMap::new(),
            visiting: HashSet::new(),
            cycle_detected: false,
            depth_exceeded: false,
        }
    }

    pub fn evaluate(&mut self, input: &str) -> Result<Evaluation> {
        let Some(target) = reference::parse(input) else {
            return Ok(Evaluation {
                reference: input.to_string(),
                value: EvalValue::Unresolved(Unresolved::InvalidReference),
                trace: format!("{input}({})", self.config.empty_display),
                outcome: None,
                cycle_detected: false,
                depth_exceeded: false,
            });
        };

        let resolved = self.resolve(&target, 0)?;
        debug!(reference = %target, value = ?resolved.value, "evaluated");
        Ok(Evaluation {
            reference: target.to_string(),
            value: resolved.value,
            trace: resolved.trace,
            outcome: resolved.outcome,
            cycle_detected: self.cycle_detected,
            depth_exceeded: self.depth_exceeded,
        })
    }

    fn show(&self, value: &EvalValue) -> String {
        if value.is_empty() {
            self.config.empty_display.clone()
        } else {
            value.text()
        }
    }

    fn labelled(&self, resolved: &Resolved) -> String {
        format!("{}({})", resolved.label, self.show(&resolved.value))
    }

    fn unresolved(&self, label: &str, why: Unresolved) -> Resolved {
        Resolved {
            value: EvalValue::Unresolved(why),
            label: label.to_string(),
            trace: format!("{label}({})", self.config.empty_display),
            outcome: None,
        }
    }

    fn resolve(&mut self, target: &Reference, depth: usize) -> Result<Resolved> {
        let key = target.cache_key();
        if let Some(hit) = self.memo.get(&key) {
            return Ok(hit.clone());
        }
        if self.visiting.contains(&key) {
            if !self.cycle_detected {
                warn!(reference = %target, "evaluation cycle detected; reference left unresolved");
            }
            self.cycle_detected = true;
            return Ok(self.unresolved(target.id(), Unresolved::Cycle));
        }
        if depth > self.config.max_depth {
            if !self.depth_exceeded {
                warn!(reference = %target, max_depth = self.config.max_depth, "evaluation depth exceeded");
            }
            self.depth_exceeded = true;
            return Ok(self.unresolved(target.id(), Unresolved::DepthExceeded));
        }

        self.visiting.insert(key.clone());
        let out = match target.kind().capacity_kind() {
            None => self.resolve_field(target.id(), depth),
            Some(kind) => self.resolve_capacity(kind, target.id(), depth),
        };
        self.visiting.remove(&key);

        let out = out?;
        self.memo.insert(key, out.clone());
        Ok(out)
    }

    // -- Fields --------------------------------------------------------------

    fn resolve_field(&mut self, id: &str, depth: usize) -> Result<Resolved> {
        let node = match self.tx.get_node(id) {
            Ok(node) => Some(node),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        let label = node
            .as_ref()
            .map_or_else(|| id.to_string(), |n| n.display_label().to_string());

        let value = match (self.ctx.get(id), &node) {
            (Some(v), _) => EvalValue::from_json(v),
            (None, Some(node)) => self.computed_field(node, depth)?,
            (None, None) => EvalValue::Unresolved(Unresolved::NotFound),
        };
        let trace = format!("{label}({})", self.show(&value));
        Ok(Resolved {
            value,
            label,
            trace,
            outcome: None,
        })
    }

    /// A field without a submitted value: its variable's source, else its
    /// active formula.
    fn computed_field(&mut self, node: &Node, depth: usize) -> Result<EvalValue> {
        if let Some(var) = self.tx.get_variable_by_node(&node.id)? {
            if var.source_type != SourceType::Manual {
                let source = var
                    .source_reference()
                    .filter(|s| !(s.kind() == TargetKind::Field && s.id() == node.id));
                if let Some(source) = source {
                    return Ok(self.resolve(&source, depth + 1)?.value);
                }
            }
        }
        let formulas = self.tx.get_capacities_by_owner(&node.id, Some(CapacityKind::Formula))?;
        match select_formula(formulas, &self.config.formula_selection) {
            Some(active) => Ok(self.resolve(&active.reference(), depth + 1)?.value),
            None => Ok(EvalValue::Unresolved(Unresolved::Missing)),
        }
    }

    // -- Capacities ----------------------------------------------------------

    /// `id` is a capacity id, or a node id standing for that node's capacity
    /// of `kind`.
    fn resolve_capacity(&mut self, kind: CapacityKind, id: &str, depth: usize) -> Result<Resolved> {
        let capacity = match self.tx.find_capacity(id)? {
            Some(cap) => Some(cap),
            None => {
                let owned = self.tx.get_capacities_by_owner(id, Some(kind))?;
                match kind {
                    CapacityKind::Formula => select_formula(owned, &self.config.formula_selection),
                    _ => owned.into_iter().next(),
                }
            }
        };
        let Some(cap) = capacity else {
            return Ok(self.unresolved(id, Unresolved::NotFound));
        };
        match &cap.body {
            CapacityBody::Formula(spec) => self.eval_formula(&cap, spec, depth),
            CapacityBody::Condition(set) => self.eval_condition(&cap, set, depth),
            CapacityBody::Table(table) => self.eval_table(&cap, table, depth),
        }
    }

    fn eval_formula(&mut self, cap: &Capacity, spec: &FormulaSpec, depth: usize) -> Result<Resolved> {
        let mut items = Vec::with_capacity(spec.tokens.len());
        let mut parts = Vec::with_capacity(spec.tokens.len());
        for token in &spec.tokens {
            match token.classify() {
                TokenKind::Number(n) => {
                    items.push(Item::Operand(EvalValue::Number(n)));
                    parts.push(format_number(n));
                }
                TokenKind::Operator(op) => {
                    items.push(Item::Op(op));
                    parts.push(op.to_string());
                }
                TokenKind::Reference(r) => {
                    let resolved = self.resolve(&r, depth + 1)?;
                    parts.push(self.labelled(&resolved));
                    items.push(Item::Operand(resolved.value));
                }
                TokenKind::Unknown => debug!(capacity_id = %cap.id, ?token, "skipping unrecognized token"),
            }
        }

        let (value, too_deep) = compute(&items, self.config.max_depth);
        if too_deep {
            if !self.depth_exceeded {
                warn!(capacity_id = %cap.id, max_depth = self.config.max_depth, "formula nesting exceeds depth limit");
            }
            self.depth_exceeded = true;
        }
        let trace = format!("{} = {}", parts.join(" "), self.show(&value));
        Ok(Resolved {
            value,
            label: cap.display_name().to_string(),
            trace,
            outcome: None,
        })
    }

    // -- Conditions ----------------------------------------------------------

    fn eval_condition(&mut self, cap: &Capacity, set: &ConditionSet, depth: usize) -> Result<Resolved> {
        let mut clauses = Vec::new();
        let mut selected = Selected::None;
        for (i, branch) in set.branches.iter().enumerate() {
            let (matched, text) = self.eval_when(&branch.when, depth + 1)?;
            clauses.push(format!("If {text}; THEN: {}", self.describe_actions(&branch.actions)?));
            if matched {
                selected = Selected::Branch(i);
                break;
            }
        }

        let actions: &[Action] = if let Selected::Branch(i) = selected {
            &set.branches[i].actions
        } else if let Some(fallback) = &set.fallback {
            selected = Selected::Fallback;
            &fallback.actions
        } else {
            &[]
        };

        let mut trace = clauses.join("; ");
        match selected {
            Selected::Branch(i) => trace.push_str(&format!(" -> [BRANCH {} SELECTED]", i + 1)),
            Selected::Fallback => trace.push_str(&format!(" -> [FALLBACK] {}", self.describe_actions(actions)?)),
            Selected::None => trace.push_str(" -> [NO MATCH]"),
        }

        // The first shown target doubles as the condition's value.
        let shown = actions
            .iter()
            .find(|a| a.kind == ActionKind::Show)
            .and_then(|a| a.node_ids.first())
            .and_then(|t| reference::parse(t));
        let value = match shown {
            Some(target) => {
                let resolved = self.resolve(&target, depth + 1)?;
                trace.push_str(&format!(" Result = {}", self.show(&resolved.value)));
                resolved.value
            }
            None => EvalValue::Bool(matches!(selected, Selected::Branch(_))),
        };

        let outcome = ConditionOutcome {
            selected,
            actions: actions
                .iter()
                .map(|a| ResolvedAction {
                    kind: a.kind.clone(),
                    targets: a.node_ids.clone(),
                })
                .collect(),
        };
        Ok(Resolved {
            value,
            label: cap.display_name().to_string(),
            trace,
            outcome: Some(outcome),
        })
    }

    /// `SHOW [A, B]; HIDE [C]` with targets shown by label.
    fn describe_actions(&self, actions: &[Action]) -> Result<String> {
        if actions.is_empty() {
            return Ok("NO ACTION".into());
        }
        let mut out = Vec::with_capacity(actions.len());
        for action in actions {
            let mut labels = Vec::with_capacity(action.node_ids.len());
            for target in &action.node_ids {
                labels.push(self.target_label(target)?);
            }
            out.push(format!("{} [{}]", action.kind, labels.join(", ")));
        }
        Ok(out.join("; "))
    }

    fn target_label(&self, target: &str) -> Result<String> {
        let Some(r) = reference::parse(target) else {
            return Ok(target.to_string());
        };
        if r.kind().capacity_kind().is_some() {
            if let Some(cap) = self.tx.find_capacity(r.id())? {
                return Ok(cap.display_name().to_string());
            }
        }
        match self.tx.get_node(r.id()) {
            Ok(node) => Ok(node.display_label().to_string()),
            Err(e) if e.is_not_found() => Ok(r.id().to_string()),
            Err(e) => Err(e),
        }
    }

    fn eval_when(&mut self, when: &WhenExpr, depth: usize) -> Result<(bool, String)> {
        if depth > self.config.max_depth {
            self.depth_exceeded = true;
            return Ok((false, self.config.empty_display.clone()));
        }
        let op = when.operator();
        match op {
            Operator::And | Operator::Or => {
                let (l, lt) = self.operand_bool(when.left.as_ref(), depth)?;
                let (r, rt) = self.operand_bool(when.right.as_ref(), depth)?;
                let result = if op == Operator::And { l && r } else { l || r };
                Ok((result, format!("({lt} {} {rt})", op.display_text())))
            }
            Operator::Not => {
                let (v, text) = self.operand_bool(when.left.as_ref(), depth)?;
                Ok((!v, format!("NOT {text}")))
            }
            Operator::IsEmpty | Operator::IsNotEmpty => {
                let (value, text) = self.operand_value(when.left.as_ref(), depth)?;
                let empty = value.is_empty();
                let result = if op == Operator::IsEmpty { empty } else { !empty };
                Ok((result, format!("{text} {}", op.display_text())))
            }
            Operator::Unknown => {
                warn!(op = %when.op, "unknown condition operator; treated as false");
                let (_, lt) = self.operand_value(when.left.as_ref(), depth)?;
                Ok((false, format!("{lt} {}", when.op)))
            }
            _ => {
                let (l, lt) = self.operand_value(when.left.as_ref(), depth)?;
                let (r, rt) = self.operand_value(when.right.as_ref(), depth)?;
                Ok((compare(op, &l, &r), format!("{lt} {} {rt}", op.display_text())))
            }
        }
    }

    fn operand_bool(&mut self, operand: Option<&Operand>, depth: usize) -> Result<(bool, String)> {
        match operand {
            Some(Operand::Expr(inner)) => self.eval_when(inner, depth + 1),
            other => {
                let (value, text) = self.operand_value(other, depth)?;
                Ok((value.is_truthy(), text))
            }
        }
    }

    fn operand_value(&mut self, operand: Option<&Operand>, depth: usize) -> Result<(EvalValue, String)> {
        match operand {
            None => Ok((EvalValue::Unresolved(Unresolved::Missing), self.config.empty_display.clone())),
            Some(Operand::Ref { reference: raw }) => match reference::parse(raw) {
                Some(r) => {
                    let resolved = self.resolve(&r, depth + 1)?;
                    let text = self.labelled(&resolved);
                    Ok((resolved.value, text))
                }
                None => Ok((
                    EvalValue::Unresolved(Unresolved::InvalidReference),
                    format!("{raw}({})", self.config.empty_display),
                )),
            },
            Some(Operand::Value { value }) => {
                let value = EvalValue::from_json(value);
                let text = self.show(&value);
                Ok((value, text))
            }
            Some(Operand::Expr(inner)) => {
                let (b, text) = self.eval_when(inner, depth + 1)?;
                Ok((EvalValue::Bool(b), text))
            }
        }
    }

    // -- Tables --------------------------------------------------------------

    fn eval_table(&mut self, cap: &Capacity, table: &TableSpec, depth: usize) -> Result<Resolved> {
        let selectors = table.lookup.as_ref().map(|l| l.selectors.clone()).unwrap_or_default();
        let row = match selectors.row_field_id.as_deref() {
            Some(id) => Some(self.resolve(&Reference::bare(id), depth + 1)?),
            None => None,
        };
        let column = match selectors.column_field_id.as_deref() {
            Some(id) => Some(self.resolve(&Reference::bare(id), depth + 1)?),
            None => None,
        };

        let value = lookup(table, row.as_ref().map(|r| &r.value), column.as_ref().map(|c| &c.value));

        let selector_text: Vec<String> = row.iter().chain(column.iter()).map(|r| self.labelled(r)).collect();
        let trace = format!(
            "{}[{}] = {}",
            cap.display_name(),
            selector_text.join(", "),
            self.show(&value)
        );
        Ok(Resolved {
            value,
            label: cap.display_name().to_string(),
            trace,
            outcome: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Formula selection
// ---------------------------------------------------------------------------

/// Picks a node's active formula: each preference in turn narrows the
/// candidates when it matches any, then the first candidate wins.
pub fn select_formula(formulas: Vec<Capacity>, preferences: &[FormulaPreference]) -> Option<Capacity> {
    let mut candidates: Vec<Capacity> = formulas
        .into_iter()
        .filter(|c| c.kind() == CapacityKind::Formula)
        .collect();
    for preference in preferences {
        let narrowed: Vec<Capacity> = match preference {
            FormulaPreference::NonEmptyTokens => candidates
                .iter()
                .filter(|c| matches!(&c.body, CapacityBody::Formula(f) if !f.tokens.is_empty()))
                .cloned()
                .collect(),
            FormulaPreference::DefaultFlag => candidates.iter().filter(|c| c.is_default).cloned().collect(),
            FormulaPreference::MostRecent => match candidates.iter().map(|c| c.updated_at).max() {
                Some(latest) => candidates.iter().filter(|c| c.updated_at == latest).cloned().collect(),
                None => Vec::new(),
            },
        };
        if !narrowed.is_empty() {
            candidates = narrowed;
        }
    }
    candidates.into_iter().next()
}

// ---------------------------------------------------------------------------
// Arithmetic
// ---------------------------------------------------------------------------

enum Item {
    Operand(EvalValue),
    Op(char),
}

/// Recursive-descent evaluation with the usual precedence:
/// `expr := term (+|- term)*`, `term := factor (*|/ factor)*`,
/// `factor := (+|-) factor | '(' expr ')' | operand`.
///
/// Parentheses and unary signs nest at most `max_nesting` levels deep.
struct Parser<'i> {
    items: &'i [Item],
    pos: usize,
    nesting: usize,
    max_nesting: usize,
    too_deep: bool,
}

impl Parser<'_> {
    fn peek_op(&self) -> Option<char> {
        match self.items.get(self.pos) {
            Some(Item::Op(c)) => Some(*c),
            _ => None,
        }
    }

    fn expr(&mut self) -> EvalValue {
        let mut acc = self.term();
        while let Some(op @ ('+' | '-')) = self.peek_op() {
            if self.too_deep {
                break;
            }
            self.pos += 1;
            let rhs = self.term();
            acc = arithmetic(op, acc, rhs);
        }
        acc
    }

    fn term(&mut self) -> EvalValue {
        let mut acc = self.factor();
        while let Some(op @ ('*' | '/')) = self.peek_op() {
            if self.too_deep {
                break;
            }
            self.pos += 1;
            let rhs = self.factor();
            acc = arithmetic(op, acc, rhs);
        }
        acc
    }

    fn factor(&mut self) -> EvalValue {
        match self.items.get(self.pos) {
            Some(Item::Op('-' | '+' | '(')) if self.nesting >= self.max_nesting => {
                self.too_deep = true;
                EvalValue::Unresolved(Unresolved::DepthExceeded)
            }
            Some(Item::Op('-')) => {
                self.pos += 1;
                let inner = self.nested(Self::factor);
                match inner.to_number() {
                    Ok(n) => EvalValue::Number(-n),
                    Err(u) => EvalValue::Unresolved(u),
                }
            }
            Some(Item::Op('+')) => {
                self.pos += 1;
                self.nested(Self::factor)
            }
            Some(Item::Op('(')) => {
                self.pos += 1;
                let inner = self.nested(Self::expr);
                if self.peek_op() == Some(')') {
                    self.pos += 1;
                    inner
                } else if self.too_deep {
                    inner
                } else {
                    EvalValue::Unresolved(Unresolved::Malformed)
                }
            }
            Some(Item::Operand(v)) => {
                self.pos += 1;
                v.clone()
            }
            _ => EvalValue::Unresolved(Unresolved::Malformed),
        }
    }

    fn nested(&mut self, rule: fn(&mut Self) -> EvalValue) -> EvalValue {
        self.nesting += 1;
        let value = rule(self);
        self.nesting -= 1;
        value
    }
}

/// Evaluates `items`; the flag reports that nesting went past `max_nesting`.
fn compute(items: &[Item], max_nesting: usize) -> (EvalValue, bool) {
    if items.is_empty() {
        return (EvalValue::Unresolved(Unresolved::Missing), false);
    }
    let mut parser = Parser {
        items,
        pos: 0,
        nesting: 0,
        max_nesting,
        too_deep: false,
    };
    let value = parser.expr();
    if parser.too_deep {
        return (EvalValue::Unresolved(Unresolved::DepthExceeded), true);
    }
    if parser.pos != items.len() {
        return (EvalValue::Unresolved(Unresolved::Malformed), false);
    }
    (value, false)
}

fn arithmetic(op: char, lhs: EvalValue, rhs: EvalValue) -> EvalValue {
    let (a, b) = match (lhs.to_number(), rhs.to_number()) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(u), _) | (_, Err(u)) => return EvalValue::Unresolved(u),
    };
    let n = match op {
        '+' => a + b,
        '-' => a - b,
        '*' => a * b,
        '/' if b == 0.0 => return EvalValue::Unresolved(Unresolved::DivisionByZero),
        '/' => a / b,
        _ => return EvalValue::Unresolved(Unresolved::Malformed),
    };
    if n.is_finite() {
        EvalValue::Number(n)
    } else {
        EvalValue::Unresolved(Unresolved::Malformed)
    }
}

// ---------------------------------------------------------------------------
// Comparison and lookup
// ---------------------------------------------------------------------------

fn loosely_equal(a: &EvalValue, b: &EvalValue) -> bool {
    match (a.to_number(), b.to_number()) {
        (Ok(x), Ok(y)) => x == y,
        _ => a.text().trim() == b.text().trim(),
    }
}

fn compare(op: Operator, a: &EvalValue, b: &EvalValue) -> bool {
    match op {
        Operator::Equals => loosely_equal(a, b),
        Operator::NotEquals => !loosely_equal(a, b),
        _ => {
            let (Ok(x), Ok(y)) = (a.to_number(), b.to_number()) else {
                return false;
            };
            match op {
                Operator::Gt => x > y,
                Operator::Gte => x >= y,
                Operator::Lt => x < y,
                Operator::Lte => x <= y,
                _ => false,
            }
        }
    }
}

fn header_index(headers: &[Value], wanted: &EvalValue) -> Option<usize> {
    headers
        .iter()
        .position(|h| loosely_equal(&EvalValue::from_json(h), wanted))
}

fn lookup(table: &TableSpec, row: Option<&EvalValue>, column: Option<&EvalValue>) -> EvalValue {
    for selector in row.iter().chain(column.iter()) {
        if let EvalValue::Unresolved(u) = selector {
            return EvalValue::Unresolved(*u);
        }
    }
    if row.is_none() && column.is_none() {
        return EvalValue::Unresolved(Unresolved::Missing);
    }
    let r = match row {
        Some(v) => header_index(&table.rows, v),
        None => (table.data.len() == 1).then_some(0),
    };
    let c = match column {
        Some(v) => header_index(&table.columns, v),
        None => table.data.iter().all(|cells| cells.len() == 1).then_some(0),
    };
    match (r, c) {
        (Some(r), Some(c)) => table
            .data
            .get(r)
            .and_then(|cells| cells.get(c))
            .map_or(EvalValue::Unresolved(Unresolved::NotFound), EvalValue::from_json),
        _ => EvalValue::Unresolved(Unresolved::NotFound),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{formula, store_with};
    use arbor_core::capacity::Token;
    use arbor_core::node::NodeBuilder;
    use arbor_core::variable::Variable;
    use arbor_storage::{SqliteStore, Storage};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn node(tx: &dyn Transaction, id: &str, label: &str) -> Result<()> {
        tx.upsert_node(&NodeBuilder::new(id).label(label).build())
    }

    fn eval(store: &SqliteStore, input: &str, ctx: &SubmissionContext) -> Evaluation {
        let config = EvaluationConfig::default();
        let mut out = None;
        store
            .read_snapshot(&mut |tx| {
                out = Some(Evaluator::new(tx, ctx, &config).evaluate(input)?);
                Ok(())
            })
            .unwrap();
        out.unwrap()
    }

    fn pricing() -> SqliteStore {
        store_with(|tx| {
            node(tx, "price", "Price")?;
            node(tx, "qty", "Quantity")?;
            node(tx, "total", "Total")?;
            tx.upsert_capacity(&formula(
                "f-total",
                "total",
                vec![
                    Token::reference("@value.price"),
                    Token::op('*'),
                    Token::reference("@value.qty"),
                    Token::op('+'),
                    Token::Number(10.0),
                ],
            ))
        })
    }

    // -- values --------------------------------------------------------------

    #[test]
    fn truthiness_and_emptiness() {
        assert!(EvalValue::Text("yes".into()).is_truthy());
        assert!(!EvalValue::Text("0".into()).is_truthy());
        assert!(!EvalValue::Text("false".into()).is_truthy());
        assert!(EvalValue::Text("  ".into()).is_empty());
        assert!(!EvalValue::Number(0.0).is_empty());
        assert_eq!(EvalValue::Text("1,5".into()).to_number(), Ok(1.5));
        assert_eq!(format_number(22.0), "22");
        assert_eq!(format_number(0.25), "0.25");
    }

    // -- formulas ------------------------------------------------------------

    #[test]
    fn formula_with_precedence_and_trace() {
        let store = pricing();
        let ctx = SubmissionContext::new().with("price", 3).with("qty", "4");
        let result = eval(&store, "node-formula:f-total", &ctx);
        assert_eq!(result.value, EvalValue::Number(22.0));
        insta::assert_snapshot!(result.trace, @"Price(3) * Quantity(4) + 10 = 22");
    }

    #[test]
    fn evaluation_is_deterministic() {
        let store = pricing();
        let ctx = SubmissionContext::new().with("price", 2.5).with("qty", 2);
        let first = eval(&store, "node-formula:f-total", &ctx);
        let second = eval(&store, "node-formula:f-total", &ctx);
        assert_eq!(first, second);
    }

    #[test]
    fn missing_operand_is_unresolved() {
        let store = pricing();
        let ctx = SubmissionContext::new().with("price", 3);
        let result = eval(&store, "node-formula:f-total", &ctx);
        assert_eq!(result.value, EvalValue::Unresolved(Unresolved::Missing));
        insta::assert_snapshot!(result.trace, @"Price(3) * Quantity(∅) + 10 = ∅");
    }

    #[test]
    fn division_by_zero_is_unresolved() {
        let store = store_with(|tx| {
            node(tx, "a", "A")?;
            tx.upsert_capacity(&formula("f", "a", vec![Token::Number(1.0), Token::op('/'), Token::Number(0.0)]))
        });
        let result = eval(&store, "node-formula:f", &SubmissionContext::new());
        assert_eq!(result.value, EvalValue::Unresolved(Unresolved::DivisionByZero));
    }

    #[test]
    fn parentheses_and_unary_minus() {
        let store = store_with(|tx| {
            node(tx, "a", "A")?;
            tx.upsert_capacity(&formula(
                "f",
                "a",
                vec![
                    Token::op('-'),
                    Token::op('('),
                    Token::Number(2.0),
                    Token::op('+'),
                    Token::Number(3.0),
                    Token::op(')'),
                    Token::op('*'),
                    Token::Number(4.0),
                ],
            ))?;
            tx.upsert_capacity(&formula("bad", "a", vec![Token::op('('), Token::Number(2.0)]))
        });
        let ctx = SubmissionContext::new();
        assert_eq!(eval(&store, "node-formula:f", &ctx).value, EvalValue::Number(-20.0));
        assert_eq!(eval(&store, "node-formula:bad", &ctx).value, EvalValue::Unresolved(Unresolved::Malformed));
    }

    #[test]
    fn deeply_nested_formula_stops_at_depth_limit() {
        let mut tokens = vec![Token::op('('); 5000];
        tokens.push(Token::Number(1.0));
        tokens.extend(vec![Token::op(')'); 5000]);
        let mut negations = vec![Token::op('-'); 5000];
        negations.push(Token::Number(1.0));
        let store = store_with(|tx| {
            node(tx, "n", "N")?;
            tx.upsert_capacity(&formula("deep", "n", tokens.clone()))?;
            tx.upsert_capacity(&formula("negated", "n", negations.clone()))?;
            tx.upsert_capacity(&formula(
                "shallow",
                "n",
                vec![Token::op('('), Token::op('('), Token::Number(1.0), Token::op(')'), Token::op(')')],
            ))
        });
        let ctx = SubmissionContext::new();

        for id in ["deep", "negated"] {
            let result = eval(&store, &format!("node-formula:{id}"), &ctx);
            assert_eq!(result.value, EvalValue::Unresolved(Unresolved::DepthExceeded), "{id}");
            assert!(result.depth_exceeded, "{id}");
        }

        let shallow = eval(&store, "node-formula:shallow", &ctx);
        assert_eq!(shallow.value, EvalValue::Number(1.0));
        assert!(!shallow.depth_exceeded);
    }

    #[test]
    fn node_id_stands_for_its_active_formula() {
        let store = store_with(|tx| {
            node(tx, "a", "A")?;
            tx.upsert_capacity(&formula("empty", "a", vec![]))?;
            tx.upsert_capacity(&formula("real", "a", vec![Token::Number(7.0)]))
        });
        let ctx = SubmissionContext::new();
        assert_eq!(eval(&store, "node-formula:a", &ctx).value, EvalValue::Number(7.0));
        // A field without a submitted value falls back to the same formula.
        assert_eq!(eval(&store, "@value.a", &ctx).value, EvalValue::Number(7.0));
    }

    #[test]
    fn default_flag_breaks_ties() {
        let mut first = formula("one", "a", vec![Token::Number(1.0)]);
        let mut second = formula("two", "a", vec![Token::Number(2.0)]);
        second.is_default = true;
        first.updated_at = second.updated_at;
        let picked = select_formula(vec![first, second], &EvaluationConfig::default().formula_selection);
        assert_eq!(picked.map(|c| c.id), Some("two".to_string()));
    }

    #[test]
    fn submitted_value_wins_over_variable_source() {
        let store = store_with(|tx| {
            node(tx, "a", "A")?;
            node(tx, "b", "B")?;
            tx.upsert_capacity(&formula("fb", "b", vec![Token::Number(5.0)]))?;
            tx.upsert_variable(&Variable::new("va", "a", "a_key").with_source(SourceType::Formula, "node-formula:fb"))
        });
        assert_eq!(eval(&store, "a", &SubmissionContext::new()).value, EvalValue::Number(5.0));
        let ctx = SubmissionContext::new().with("a", 9);
        assert_eq!(eval(&store, "a", &ctx).value, EvalValue::Number(9.0));
    }

    #[test]
    fn cycles_are_short_circuited() {
        let store = store_with(|tx| {
            node(tx, "a", "A")?;
            node(tx, "b", "B")?;
            tx.upsert_capacity(&formula("fa", "a", vec![Token::reference("node-formula:fb"), Token::op('+'), Token::Number(1.0)]))?;
            tx.upsert_capacity(&formula("fb", "b", vec![Token::reference("node-formula:fa")]))
        });
        let result = eval(&store, "node-formula:fa", &SubmissionContext::new());
        assert!(result.cycle_detected);
        assert_eq!(result.value, EvalValue::Unresolved(Unresolved::Cycle));
    }

    #[test]
    fn invalid_reference_is_a_value() {
        let store = pricing();
        let result = eval(&store, "@bogus.x", &SubmissionContext::new());
        assert_eq!(result.value, EvalValue::Unresolved(Unresolved::InvalidReference));
    }

    // -- conditions ----------------------------------------------------------

    fn condition_store(set: serde_json::Value) -> SqliteStore {
        let set: ConditionSet = serde_json::from_value(set).unwrap();
        store_with(|tx| {
            node(tx, "x", "Power")?;
            node(tx, "y", "Manual price")?;
            node(tx, "owner", "Rule")?;
            tx.upsert_capacity(&formula("calc", "owner", vec![Token::Number(1250.0), Token::op('/'), Token::Number(5000.0)]))?;
            let mut cap = Capacity::new("c", "owner", CapacityBody::Condition(set.clone()));
            cap.name = "Price rule".into();
            tx.upsert_capacity(&cap)
        })
    }

    #[test]
    fn unmatched_condition_takes_fallback() {
        let store = condition_store(json!({
            "branches": [{
                "when": {"op": "isNotEmpty", "left": {"ref": "@value.x"}},
                "actions": [{"type": "SHOW", "nodeIds": ["node-formula:calc"]}]
            }],
            "fallback": {"actions": [{"type": "HIDE", "nodeIds": ["y"]}]}
        }));
        let result = eval(&store, "condition:c", &SubmissionContext::new());
        assert_eq!(
            result.outcome,
            Some(ConditionOutcome {
                selected: Selected::Fallback,
                actions: vec![ResolvedAction {
                    kind: ActionKind::Hide,
                    targets: vec!["y".into()],
                }],
            })
        );
        assert_eq!(result.value, EvalValue::Bool(false));
        insta::assert_snapshot!(
            result.trace,
            @"If Power(∅) is not empty; THEN: SHOW [calc] -> [FALLBACK] HIDE [Manual price]"
        );
    }

    #[test]
    fn matched_branch_yields_target_value() {
        let store = condition_store(json!({
            "branches": [{
                "when": {"op": "isEmpty", "left": {"ref": "@value.y"}},
                "actions": [{"type": "SHOW", "nodeIds": ["node-formula:calc"]}]
            }],
            "fallback": {"actions": [{"type": "SHOW", "nodeIds": ["y"]}]}
        }));
        let result = eval(&store, "condition:c", &SubmissionContext::new());
        assert_eq!(result.value, EvalValue::Number(0.25));
        assert_eq!(result.outcome.map(|o| o.selected), Some(Selected::Branch(0)));
        insta::assert_snapshot!(
            result.trace,
            @"If Manual price(∅) is empty; THEN: SHOW [calc] -> [BRANCH 1 SELECTED] Result = 0.25"
        );

        let ctx = SubmissionContext::new().with("y", 150);
        let result = eval(&store, "condition:c", &ctx);
        assert_eq!(result.value, EvalValue::Number(150.0));
    }

    #[test]
    fn nested_boolean_operands() {
        let store = condition_store(json!({
            "branches": [{
                "when": {"op": "and",
                    "left": {"op": "gt", "left": {"ref": "@value.x"}, "right": {"value": 3}},
                    "right": {"op": "equals", "left": {"ref": "@value.y"}, "right": {"value": "on"}}},
                "actions": [{"type": "SHOW", "nodeIds": ["owner"]}]
            }]
        }));
        let ctx = SubmissionContext::new().with("x", 5).with("y", "on");
        let result = eval(&store, "condition:c", &ctx);
        // The shown node has no value of its own and falls back to its formula.
        assert_eq!(result.value, EvalValue::Number(0.25));
        assert_eq!(result.outcome.as_ref().map(|o| o.selected), Some(Selected::Branch(0)));
        insta::assert_snapshot!(
            result.trace,
            @"If (Power(5) > 3 AND Manual price(on) = on); THEN: SHOW [Rule] -> [BRANCH 1 SELECTED] Result = 0.25"
        );

        let ctx = SubmissionContext::new().with("x", 2).with("y", "on");
        let result = eval(&store, "condition:c", &ctx);
        assert_eq!(result.outcome.map(|o| o.selected), Some(Selected::None));
        assert_eq!(result.value, EvalValue::Bool(false));
    }

    // -- tables --------------------------------------------------------------

    fn table_store() -> SqliteStore {
        let table: TableSpec = serde_json::from_value(json!({
            "columns": ["south", "east"],
            "rows": [10, 20],
            "data": [[1.0, 0.9], [0.95, 0.85]],
            "lookup": {"selectors": {"rowFieldId": "tilt", "columnFieldId": "orient"}}
        }))
        .unwrap();
        store_with(|tx| {
            node(tx, "tilt", "Tilt")?;
            node(tx, "orient", "Orientation")?;
            node(tx, "yield", "Yield")?;
            let mut cap = Capacity::new("t", "yield", CapacityBody::Table(table.clone()));
            cap.name = "Yield factor".into();
            tx.upsert_capacity(&cap)
        })
    }

    #[test]
    fn table_lookup_by_row_and_column() {
        let store = table_store();
        let ctx = SubmissionContext::new().with("tilt", "20").with("orient", "east");
        let result = eval(&store, "@table.t", &ctx);
        assert_eq!(result.value, EvalValue::Number(0.85));
        insta::assert_snapshot!(result.trace, @"Yield factor[Tilt(20), Orientation(east)] = 0.85");
    }

    #[test]
    fn table_lookup_misses() {
        let store = table_store();
        let ctx = SubmissionContext::new().with("tilt", 30).with("orient", "east");
        assert_eq!(eval(&store, "@table.t", &ctx).value, EvalValue::Unresolved(Unresolved::NotFound));
        let ctx = SubmissionContext::new().with("orient", "east");
        assert_eq!(eval(&store, "@table.t", &ctx).value, EvalValue::Unresolved(Unresolved::Missing));
    }
}
