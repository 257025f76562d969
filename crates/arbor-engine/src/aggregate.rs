//! Repeater totals: one formula summarizing a template node across the
//! template and every occurrence.

use serde::Serialize;
use tracing::{debug, warn};

use arbor_core::capacity::{Capacity, CapacityBody, FormulaSpec, Token};
use arbor_core::enums::{CapacityKind, SourceType};
use arbor_core::node::{AggregationKind, Node, TotalFieldSpec, META_DISPLAY_FOR, META_REPEATER};
use arbor_core::reference::{Reference, TargetKind};
use arbor_core::variable::Variable;
use arbor_storage::error::{Result, StorageError};
use arbor_storage::Transaction;

use crate::links::{LinkMaintainer, LinkScope};

/// What a total refresh wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TotalReport {
    pub capacity_id: String,
    pub variable_id: String,
    /// Nodes whose values feed the total, template first.
    pub sources: Vec<String>,
}

/// Id of the formula holding the total displayed on `target_node_id`.
pub fn total_formula_id(target_node_id: &str) -> String {
    format!("{target_node_id}-total")
}

/// Rewrites the total formula of `repeater_id` from the current set of
/// occurrences and points the target variable at it.
///
/// Returns `None` when the source or target node is gone.
pub fn refresh_total(
    tx: &dyn Transaction,
    linker: &LinkMaintainer<'_>,
    repeater_id: &str,
    spec: &TotalFieldSpec,
) -> Result<Option<TotalReport>> {
    if !tx.node_exists(&spec.source_node_id)? {
        warn!(repeater_id, source = %spec.source_node_id, "total source node missing; total not refreshed");
        return Ok(None);
    }
    let mut target = match tx.get_node(&spec.target_node_id) {
        Ok(node) => node,
        Err(e) if e.is_not_found() => {
            warn!(repeater_id, target = %spec.target_node_id, "total target node missing; total not refreshed");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let sources = source_nodes(tx, repeater_id, &spec.source_node_id)?;
    let tokens = total_tokens(spec.aggregation, &sources);

    let capacity_id = total_formula_id(&target.id);
    let capacity = match tx.find_capacity(&capacity_id)? {
        Some(existing) if existing.owner_node_id != target.id || existing.kind() != CapacityKind::Formula => {
            return Err(StorageError::collision("capacity", capacity_id));
        }
        Some(mut existing) => {
            existing.body = CapacityBody::Formula(FormulaSpec::new(tokens));
            existing.updated_at = chrono::Utc::now();
            existing
        }
        None => {
            let mut created = Capacity::new(&capacity_id, &target.id, CapacityBody::Formula(FormulaSpec::new(tokens)));
            created.name = "Total".into();
            created.is_default = true;
            created
        }
    };
    tx.upsert_capacity(&capacity)?;

    let mut variable = target_variable(tx, spec, &target)?;
    variable.source_type = SourceType::Formula;
    variable.source_ref = Some(Reference::new(TargetKind::Formula, capacity_id.clone()).to_string());
    tx.upsert_variable(&variable)?;

    if !(target.has_formula && target.has_variable) {
        target.has_formula = true;
        target.has_variable = true;
        tx.upsert_node(&target)?;
    }
    linker.recompute(tx, &LinkScope::Node(target.id.clone()))?;

    debug!(
        repeater_id,
        capacity_id,
        sources = sources.len(),
        "refreshed repeater total"
    );
    Ok(Some(TotalReport {
        capacity_id,
        variable_id: variable.id,
        sources,
    }))
}

/// The template source node followed by its clones in occurrence order.
fn source_nodes(tx: &dyn Transaction, repeater_id: &str, source_id: &str) -> Result<Vec<String>> {
    let mut clones: Vec<(u32, String)> = tx
        .find_nodes_by_metadata(META_REPEATER, repeater_id)?
        .into_iter()
        .filter(|n| n.metadata.get(META_DISPLAY_FOR).is_none())
        .filter_map(|n| {
            let mark = n.occurrence_mark()?;
            (mark.source_template_id == source_id).then_some((mark.index, n.id))
        })
        .collect();
    clones.sort();

    let mut sources = vec![source_id.to_string()];
    sources.extend(clones.into_iter().map(|(_, id)| id));
    Ok(sources)
}

fn total_tokens(kind: AggregationKind, sources: &[String]) -> Vec<Token> {
    let sum = |tokens: &mut Vec<Token>| {
        for (i, id) in sources.iter().enumerate() {
            if i > 0 {
                tokens.push(Token::op('+'));
            }
            tokens.push(Token::reference(Reference::new(TargetKind::Field, id.as_str()).to_string()));
        }
    };
    let mut tokens = Vec::new();
    match kind {
        AggregationKind::Sum => sum(&mut tokens),
        AggregationKind::Average => {
            tokens.push(Token::op('('));
            sum(&mut tokens);
            tokens.push(Token::op(')'));
            tokens.push(Token::op('/'));
            tokens.push(Token::Number(sources.len() as f64));
        }
        AggregationKind::Count => tokens.push(Token::Number(sources.len() as f64)),
    }
    tokens
}

/// The declared total variable, the target node's own variable, or a new
/// one.
fn target_variable(tx: &dyn Transaction, spec: &TotalFieldSpec, target: &Node) -> Result<Variable> {
    if let Some(id) = spec.target_variable_id.as_deref() {
        match tx.get_variable(id) {
            Ok(var) => return Ok(var),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    if let Some(var) = tx.get_variable_by_node(&target.id)? {
        return Ok(var);
    }

    let id = spec
        .target_variable_id
        .clone()
        .unwrap_or_else(|| format!("{}-total-var", target.id));
    let base = spec
        .exposed_key
        .clone()
        .unwrap_or_else(|| format!("{}_total", target.id));
    let key = crate::instantiate::unique_exposed_key(tx, &base, &[])?;
    let mut var = Variable::new(id, &target.id, key);
    var.display_name = format!("{} (total)", target.display_label());
    Ok(var)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::store_with;
    use arbor_core::extract::Extractor;
    use arbor_core::node::{NodeBuilder, OccurrenceMark};
    use arbor_storage::Storage;
    use pretty_assertions::assert_eq;

    fn spec(kind: AggregationKind) -> TotalFieldSpec {
        TotalFieldSpec {
            aggregation: kind,
            source_node_id: "price".into(),
            target_node_id: "sum".into(),
            target_variable_id: None,
            exposed_key: Some("price_total".into()),
        }
    }

    fn clone_of(id: &str, source: &str, index: u32) -> Node {
        let mut node = NodeBuilder::new(id).parent("rep").build();
        node.set_occurrence_mark(&OccurrenceMark {
            source_template_id: source.into(),
            repeater_id: "rep".into(),
            index,
        });
        node
    }

    fn refresh(store: &dyn Storage, spec: &TotalFieldSpec) -> Option<TotalReport> {
        let extractor = Extractor::default();
        let mut out = None;
        store
            .run_in_transaction(&mut |tx| {
                out = refresh_total(tx, &LinkMaintainer::new(&extractor), "rep", spec)?;
                Ok(())
            })
            .unwrap();
        out
    }

    #[test]
    fn tokens_per_kind() {
        let sources = vec!["a".to_string(), "a-1".to_string()];
        let render = |kind| {
            serde_json::to_string(&total_tokens(kind, &sources)).unwrap()
        };
        assert_eq!(
            render(AggregationKind::Sum),
            r#"[{"type":"ref","ref":"@value.a"},"+",{"type":"ref","ref":"@value.a-1"}]"#
        );
        assert_eq!(
            render(AggregationKind::Average),
            r#"["(",{"type":"ref","ref":"@value.a"},"+",{"type":"ref","ref":"@value.a-1"},")","/",2.0]"#
        );
        assert_eq!(render(AggregationKind::Count), "[2.0]");
    }

    #[test]
    fn refresh_writes_formula_variable_and_links() {
        let store = store_with(|tx| {
            tx.upsert_node(&NodeBuilder::new("rep").build())?;
            tx.upsert_node(&NodeBuilder::new("price").parent("rep").build())?;
            tx.upsert_node(&NodeBuilder::new("sum").label("Sum").build())?;
            tx.upsert_nodes(&[clone_of("price-2", "price", 2), clone_of("price-1", "price", 1)])
        });

        let report = refresh(&store, &spec(AggregationKind::Sum)).unwrap();
        assert_eq!(report.capacity_id, "sum-total");
        assert_eq!(report.variable_id, "sum-total-var");
        assert_eq!(report.sources, vec!["price", "price-1", "price-2"]);

        let var = store.get_variable("sum-total-var").unwrap();
        assert_eq!(var.exposed_key, "price_total");
        assert_eq!(var.source_ref.as_deref(), Some("node-formula:sum-total"));
        assert!(store.get_node("sum").unwrap().has_formula);
        let linked = store.get_node("price-2").unwrap().linked;
        assert!(linked.contains(arbor_core::enums::LinkField::Formula, "sum-total"));
    }

    #[test]
    fn refresh_reuses_existing_variable() {
        let store = store_with(|tx| {
            tx.upsert_node(&NodeBuilder::new("price").build())?;
            tx.upsert_node(&NodeBuilder::new("sum").build())?;
            tx.upsert_variable(&Variable::new("mine", "sum", "my_total"))
        });
        let report = refresh(&store, &spec(AggregationKind::Count)).unwrap();
        assert_eq!(report.variable_id, "mine");
        assert_eq!(store.counts().unwrap().variables, 1);
    }

    #[test]
    fn missing_target_skips() {
        let store = store_with(|tx| tx.upsert_node(&NodeBuilder::new("price").build()));
        assert_eq!(refresh(&store, &spec(AggregationKind::Sum)), None);
    }
}
