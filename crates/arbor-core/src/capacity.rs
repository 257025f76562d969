//! Capacities -- the formula, condition and table capabilities a node owns.
//!
//! [`Capacity`] carries the shared envelope (id, owner, timestamps) and a
//! tagged [`CapacityBody`] with one typed expression structure per variant.
//! Every body keeps unrecognized JSON fields in an `extra` map so authored
//! data is never lost when it passes through the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::enums::{ActionKind, CapacityKind};
use crate::reference::{self, Reference};

/// A formula, condition or table owned by exactly one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capacity {
    pub id: String,

    pub owner_node_id: String,

    #[serde(default)]
    pub name: String,

    /// Marks the owner's preferred capacity when it owns several formulas.
    #[serde(default)]
    pub is_default: bool,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,

    pub body: CapacityBody,
}

impl Capacity {
    pub fn new(id: impl Into<String>, owner: impl Into<String>, body: CapacityBody) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            owner_node_id: owner.into(),
            name: String::new(),
            is_default: false,
            created_at: now,
            updated_at: now,
            body,
        }
    }

    pub fn kind(&self) -> CapacityKind {
        self.body.kind()
    }

    /// A canonical reference to this capacity.
    pub fn reference(&self) -> Reference {
        Reference::new(self.kind().into(), self.id.clone())
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// The expression structure of a capacity, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CapacityBody {
    Formula(FormulaSpec),
    Condition(ConditionSet),
    Table(TableSpec),
}

impl CapacityBody {
    pub fn kind(&self) -> CapacityKind {
        match self {
            Self::Formula(_) => CapacityKind::Formula,
            Self::Condition(_) => CapacityKind::Condition,
            Self::Table(_) => CapacityKind::Table,
        }
    }
}

// ---------------------------------------------------------------------------
// Formula
// ---------------------------------------------------------------------------

/// An ordered token sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormulaSpec {
    #[serde(default)]
    pub tokens: Vec<Token>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FormulaSpec {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            extra: Map::new(),
        }
    }
}

/// One element of a formula. Authored data mixes plain strings (operators,
/// numbers, `@value.` references) with typed objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Token {
    Number(f64),
    Text(String),
    Typed(TypedToken),
    Other(Value),
}

/// Object-shaped tokens, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TypedToken {
    #[serde(rename = "ref")]
    Ref {
        #[serde(rename = "ref")]
        reference: String,
    },
    #[serde(rename = "field")]
    Field {
        #[serde(rename = "fieldId")]
        field_id: String,
    },
    #[serde(rename = "nodeValue")]
    NodeValue {
        #[serde(rename = "nodeId")]
        node_id: String,
    },
    #[serde(rename = "operator")]
    Operator { value: String },
    #[serde(rename = "number")]
    Number { value: f64 },
}

/// What a token means once classified.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Number(f64),
    Operator(char),
    Reference(Reference),
    /// Anything else (free text, unknown objects).
    Unknown,
}

const OPERATORS: &[char] = &['+', '-', '*', '/', '(', ')'];

impl Token {
    /// Shorthand for a `{type: "ref"}` token.
    pub fn reference(reference: impl Into<String>) -> Self {
        Self::Typed(TypedToken::Ref {
            reference: reference.into(),
        })
    }

    pub fn op(op: char) -> Self {
        Self::Text(op.to_string())
    }

    pub fn classify(&self) -> TokenKind {
        match self {
            Self::Number(n) => TokenKind::Number(*n),
            Self::Text(s) => classify_text(s),
            Self::Typed(TypedToken::Ref { reference }) => reference::parse(reference)
                .map(TokenKind::Reference)
                .unwrap_or(TokenKind::Unknown),
            Self::Typed(TypedToken::Field { field_id }) => {
                if reference::is_identifier(field_id) {
                    TokenKind::Reference(Reference::bare(field_id.clone()))
                } else {
                    TokenKind::Unknown
                }
            }
            Self::Typed(TypedToken::NodeValue { node_id }) => {
                if reference::is_identifier(node_id) {
                    TokenKind::Reference(Reference::bare(node_id.clone()))
                } else {
                    TokenKind::Unknown
                }
            }
            Self::Typed(TypedToken::Operator { value }) => classify_text(value),
            Self::Typed(TypedToken::Number { value }) => TokenKind::Number(*value),
            Self::Other(_) => TokenKind::Unknown,
        }
    }
}

fn classify_text(s: &str) -> TokenKind {
    let t = s.trim();
    let mut chars = t.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        if OPERATORS.contains(&c) {
            return TokenKind::Operator(c);
        }
    }
    if let Ok(n) = t.parse::<f64>() {
        return TokenKind::Number(n);
    }
    match reference::parse_prefixed(t) {
        Some(r) => TokenKind::Reference(r),
        None => TokenKind::Unknown,
    }
}

// ---------------------------------------------------------------------------
// Condition
// ---------------------------------------------------------------------------

/// Ordered branches plus an optional fallback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionSet {
    #[serde(default)]
    pub branches: Vec<Branch>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<Fallback>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    pub when: WhenExpr,

    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fallback {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type", default)]
    pub kind: ActionKind,

    /// Node ids, or capacity references such as `node-formula:<id>`.
    #[serde(rename = "nodeIds", default)]
    pub node_ids: Vec<String>,
}

/// A boolean expression node. `op` is kept exactly as authored; use
/// [`WhenExpr::operator`] for the parsed form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhenExpr {
    pub op: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<Operand>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<Operand>,
}

impl WhenExpr {
    pub fn unary(op: &str, left: Operand) -> Self {
        Self {
            op: op.to_string(),
            left: Some(left),
            right: None,
        }
    }

    pub fn binary(op: &str, left: Operand, right: Operand) -> Self {
        Self {
            op: op.to_string(),
            left: Some(left),
            right: Some(right),
        }
    }

    pub fn operator(&self) -> Operator {
        Operator::parse(&self.op)
    }
}

/// An operand: a nested expression, a reference, or a literal value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    Expr(Box<WhenExpr>),
    Ref {
        #[serde(rename = "ref")]
        reference: String,
    },
    Value {
        value: Value,
    },
}

impl Operand {
    pub fn reference(reference: impl Into<String>) -> Self {
        Self::Ref {
            reference: reference.into(),
        }
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value {
            value: value.into(),
        }
    }
}

/// Condition operators, with the spellings found in authored data folded
/// together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    IsEmpty,
    IsNotEmpty,
    Equals,
    NotEquals,
    Gt,
    Gte,
    Lt,
    Lte,
    And,
    Or,
    Not,
    Unknown,
}

impl Operator {
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "isEmpty" | "empty" => Self::IsEmpty,
            "isNotEmpty" | "notEmpty" => Self::IsNotEmpty,
            "equals" | "eq" | "==" | "=" => Self::Equals,
            "notEquals" | "ne" | "!=" => Self::NotEquals,
            "gt" | ">" => Self::Gt,
            "gte" | ">=" => Self::Gte,
            "lt" | "<" => Self::Lt,
            "lte" | "<=" => Self::Lte,
            "and" | "&&" => Self::And,
            "or" | "||" => Self::Or,
            "not" | "!" => Self::Not,
            _ => Self::Unknown,
        }
    }

    /// Text used in human-readable traces.
    pub fn display_text(&self) -> &'static str {
        match self {
            Self::IsEmpty => "is empty",
            Self::IsNotEmpty => "is not empty",
            Self::Equals => "=",
            Self::NotEquals => "≠",
            Self::Gt => ">",
            Self::Gte => "≥",
            Self::Lt => "<",
            Self::Lte => "≤",
            Self::And => "AND",
            Self::Or => "OR",
            Self::Not => "NOT",
            Self::Unknown => "?",
        }
    }

    pub fn is_unary(&self) -> bool {
        matches!(self, Self::IsEmpty | Self::IsNotEmpty | Self::Not)
    }
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// A lookup table: header labels, a data matrix, and the selector fields
/// that choose a row and a column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSpec {
    #[serde(default)]
    pub columns: Vec<Value>,

    #[serde(default)]
    pub rows: Vec<Value>,

    #[serde(default)]
    pub data: Vec<Vec<Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup: Option<TableLookup>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableLookup {
    #[serde(default)]
    pub selectors: Selectors,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selectors {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_field_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_field_id: Option<String>,
}
