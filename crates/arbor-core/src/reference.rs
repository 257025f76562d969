//! Reference strings: parsing typed prefixes into `(TargetKind, id)` pairs.
//!
//! A reference is the wire-level pointer from one expression to a node or a
//! capacity. The exact prefix text is kept alongside the id so that a
//! reference can be re-rendered byte-for-byte after its id is remapped.
//!
//! Recognized forms:
//!
//! | prefix                     | target      |
//! |----------------------------|-------------|
//! | `@value.` `@calculated.` `@select.` | field |
//! | `@value.node-formula:`     | formula     |
//! | `@value.condition:` `@value.node-condition:` | condition |
//! | `@value.node-table:`       | table       |
//! | `@table.` `@table:`        | table       |
//! | `node-formula:` `formula:` | formula     |
//! | `node-condition:` `condition:` | condition |
//! | `node-table:` `table:`     | table       |
//! | *(none)*                   | field       |

use std::borrow::Cow;
use std::fmt;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use serde::{Deserialize, Serialize};

use crate::enums::CapacityKind;

/// What a reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    /// A plain field: the submitted (or computed) value of a node.
    Field,
    Formula,
    Condition,
    Table,
}

impl TargetKind {
    /// The capacity kind this target names, if it is not a plain field.
    pub fn capacity_kind(&self) -> Option<CapacityKind> {
        match self {
            Self::Field => None,
            Self::Formula => Some(CapacityKind::Formula),
            Self::Condition => Some(CapacityKind::Condition),
            Self::Table => Some(CapacityKind::Table),
        }
    }
}

impl From<CapacityKind> for TargetKind {
    fn from(kind: CapacityKind) -> Self {
        match kind {
            CapacityKind::Formula => Self::Formula,
            CapacityKind::Condition => Self::Condition,
            CapacityKind::Table => Self::Table,
        }
    }
}

// ---------------------------------------------------------------------------
// Prefixes
// ---------------------------------------------------------------------------

/// Every prefix the normalizer recognizes, longest first within a family so
/// that `@value.node-formula:` wins over `@value.`.
const PREFIXES: &[(&str, TargetKind)] = &[
    ("@value.node-formula:", TargetKind::Formula),
    ("@value.node-condition:", TargetKind::Condition),
    ("@value.condition:", TargetKind::Condition),
    ("@value.node-table:", TargetKind::Table),
    ("@value.", TargetKind::Field),
    ("@calculated.", TargetKind::Field),
    ("@select.", TargetKind::Field),
    ("@table.", TargetKind::Table),
    ("@table:", TargetKind::Table),
    ("node-formula:", TargetKind::Formula),
    ("formula:", TargetKind::Formula),
    ("node-condition:", TargetKind::Condition),
    ("condition:", TargetKind::Condition),
    ("node-table:", TargetKind::Table),
    ("table:", TargetKind::Table),
];

/// Canonical prefix used when a reference to a capacity must be synthesized.
pub fn canonical_prefix(kind: TargetKind) -> &'static str {
    match kind {
        TargetKind::Field => "@value.",
        TargetKind::Formula => "node-formula:",
        TargetKind::Condition => "condition:",
        TargetKind::Table => "@table.",
    }
}

// ---------------------------------------------------------------------------
// Reference
// ---------------------------------------------------------------------------

/// A parsed reference: the prefix exactly as written, the target kind it
/// implies, and the bare id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    prefix: &'static str,
    kind: TargetKind,
    id: String,
}

impl Reference {
    /// Builds a reference with the canonical prefix for `kind`.
    pub fn new(kind: TargetKind, id: impl Into<String>) -> Self {
        Self {
            prefix: canonical_prefix(kind),
            kind,
            id: id.into(),
        }
    }

    /// Builds a bare field reference (no prefix).
    pub fn bare(id: impl Into<String>) -> Self {
        Self {
            prefix: "",
            kind: TargetKind::Field,
            id: id.into(),
        }
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn prefix(&self) -> &'static str {
        self.prefix
    }

    /// Returns the same reference pointing at a different id. The prefix
    /// text is preserved.
    pub fn with_id(&self, id: impl Into<String>) -> Self {
        Self {
            prefix: self.prefix,
            kind: self.kind,
            id: id.into(),
        }
    }

    /// Key used to memoize evaluations: kind plus id, independent of which
    /// of the equivalent prefixes was written.
    pub fn cache_key(&self) -> String {
        format!("{}:{}", canonical_prefix(self.kind), self.id)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.prefix, self.id)
    }
}

/// Returns `true` if `s` is a syntactically valid bare identifier.
pub fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Parses a reference string.
///
/// Returns `None` for empty input, for an unknown `@sigil.`, or when the id
/// part is not a valid identifier. An unresolved reference is never an
/// error: callers treat `None` as "no dependency".
pub fn parse(input: &str) -> Option<Reference> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }

    for &(prefix, kind) in PREFIXES {
        if let Some(rest) = s.strip_prefix(prefix) {
            return is_identifier(rest).then(|| Reference {
                prefix,
                kind,
                id: rest.to_string(),
            });
        }
    }

    if is_identifier(s) {
        Some(Reference::bare(s))
    } else {
        None
    }
}

/// Parses only prefixed references; bare identifiers yield `None`.
///
/// Used where a plain string could be a literal rather than a field id
/// (formula text tokens, free-form metadata).
pub fn parse_prefixed(input: &str) -> Option<Reference> {
    parse(input).filter(|r| !r.prefix.is_empty())
}

// ---------------------------------------------------------------------------
// Embedded references
// ---------------------------------------------------------------------------

/// Prefixed references embedded anywhere inside a longer string.
static EMBEDDED: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?:@value\.(?:node-formula:|node-condition:|condition:|node-table:)?|@calculated\.|@select\.|@table[.:]|node-formula:|formula:|node-condition:|condition:|node-table:|table:)[A-Za-z0-9_-]+",
    )
    .ok()
});

/// Every prefixed reference occurring inside `text`.
pub fn find_embedded(text: &str) -> Vec<Reference> {
    let Some(re) = EMBEDDED.as_ref() else {
        return Vec::new();
    };
    re.find_iter(text)
        .filter_map(|m| parse_prefixed(m.as_str()))
        .collect()
}

/// Replaces prefixed references inside `text`. `map` returns the new
/// reference text, or `None` to keep the match unchanged.
pub fn replace_embedded<'t>(
    text: &'t str,
    mut map: impl FnMut(&Reference) -> Option<String>,
) -> Cow<'t, str> {
    let Some(re) = EMBEDDED.as_ref() else {
        return Cow::Borrowed(text);
    };
    re.replace_all(text, |caps: &Captures<'_>| {
        let found = &caps[0];
        parse_prefixed(found)
            .and_then(|r| map(&r))
            .unwrap_or_else(|| found.to_string())
    })
}
