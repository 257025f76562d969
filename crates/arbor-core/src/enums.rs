//! Enum types for the arbor form graph.
//!
//! String-valued enums that arrive from authored JSON (node types, variable
//! source types, condition actions) keep a catch-all `Custom(String)` variant
//! so that unknown values survive a load/save round trip unchanged.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

// ---------------------------------------------------------------------------
// Macro: defines an enum with known string variants + a Custom(String) fallback.
// ---------------------------------------------------------------------------
macro_rules! define_enum {
    (
        $(#[$meta:meta])*
        $name:ident, default = $default:ident, custom_variant = $custom_variant:ident,
        variants: [
            $( ($variant:ident, $str:expr) ),+ $(,)?
        ]
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $variant, )+
            $custom_variant(String),
        }

        impl $name {
            /// Returns the string representation.
            pub fn as_str(&self) -> &str {
                match self {
                    $( Self::$variant => $str, )+
                    Self::$custom_variant(s) => s.as_str(),
                }
            }

            /// Returns `true` if this is a built-in (non-custom) variant.
            pub fn is_builtin(&self) -> bool {
                !matches!(self, Self::$custom_variant(_))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::$default
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Ok(Self::from(s.as_str()))
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                match s {
                    $( $str => Self::$variant, )+
                    other => Self::$custom_variant(other.to_owned()),
                }
            }
        }
    };
}

define_enum!(
    /// Kind of element in the form tree.
    NodeType, default = Leaf, custom_variant = Custom,
    variants: [
        (Branch, "branch"),
        (Leaf, "leaf"),
        (Option, "option"),
        (OptionWithField, "option-with-field"),
        (Section, "section"),
        (Repeater, "repeater"),
    ]
);

define_enum!(
    /// Where a variable's value comes from.
    SourceType, default = Manual, custom_variant = Custom,
    variants: [
        (Manual, "manual"),
        (Formula, "formula"),
        (Condition, "condition"),
        (Table, "table"),
        (Auto, "auto"),
    ]
);

define_enum!(
    /// Effect a condition branch applies to its target nodes.
    ActionKind, default = Show, custom_variant = Custom,
    variants: [
        (Show, "SHOW"),
        (Hide, "HIDE"),
    ]
);

// ---------------------------------------------------------------------------
// CapacityKind
// ---------------------------------------------------------------------------

/// The three capability variants a node can own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapacityKind {
    Formula,
    Condition,
    Table,
}

impl CapacityKind {
    pub const ALL: [CapacityKind; 3] = [Self::Formula, Self::Condition, Self::Table];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Formula => "formula",
            Self::Condition => "condition",
            Self::Table => "table",
        }
    }

    /// The linked-id set that records capacities of this kind.
    pub fn link_field(&self) -> LinkField {
        match self {
            Self::Formula => LinkField::Formula,
            Self::Condition => LinkField::Condition,
            Self::Table => LinkField::Table,
        }
    }
}

impl fmt::Display for CapacityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CapacityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "formula" => Ok(Self::Formula),
            "condition" => Ok(Self::Condition),
            "table" => Ok(Self::Table),
            other => Err(format!("unknown capacity kind: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// LinkField
// ---------------------------------------------------------------------------

/// Names one of the four linked-id sets carried by every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LinkField {
    Formula,
    Condition,
    Table,
    Variable,
}

impl LinkField {
    pub const ALL: [LinkField; 4] = [Self::Formula, Self::Condition, Self::Table, Self::Variable];

    /// Column holding this set in the node table.
    pub fn column(&self) -> &'static str {
        match self {
            Self::Formula => "linked_formula_ids",
            Self::Condition => "linked_condition_ids",
            Self::Table => "linked_table_ids",
            Self::Variable => "linked_variable_ids",
        }
    }
}

impl fmt::Display for LinkField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Formula => "linkedFormulaIds",
            Self::Condition => "linkedConditionIds",
            Self::Table => "linkedTableIds",
            Self::Variable => "linkedVariableIds",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn node_type_roundtrip() {
        let t: NodeType = serde_json::from_str("\"option-with-field\"").unwrap();
        assert_eq!(t, NodeType::OptionWithField);
        assert_eq!(serde_json::to_string(&t).unwrap(), "\"option-with-field\"");
    }

    #[test]
    fn unknown_node_type_is_kept() {
        let t: NodeType = serde_json::from_str("\"photo\"").unwrap();
        assert_eq!(t, NodeType::Custom("photo".into()));
        assert!(!t.is_builtin());
        assert_eq!(t.to_string(), "photo");
    }

    #[test]
    fn action_kind_is_uppercase() {
        assert_eq!(ActionKind::from("HIDE"), ActionKind::Hide);
        assert_eq!(ActionKind::default().as_str(), "SHOW");
    }

    #[test]
    fn capacity_kind_maps_to_link_field() {
        assert_eq!(CapacityKind::Table.link_field(), LinkField::Table);
        assert_eq!("condition".parse::<CapacityKind>().unwrap(), CapacityKind::Condition);
        assert!("view".parse::<CapacityKind>().is_err());
    }
}
