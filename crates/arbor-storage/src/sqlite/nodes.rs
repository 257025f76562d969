//! Node CRUD, cascading delete and linked-id set maintenance.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;

use arbor_core::enums::{LinkField, NodeType};
use arbor_core::node::{LinkedIds, Node};
use arbor_core::validation;

use crate::error::{Result, StorageError};

/// Column list for node SELECTs. The order MUST match [`scan_node`].
pub(crate) const NODE_COLUMNS: &str = "id, parent_id, node_type, label, sort_order, \
     has_formula, has_condition, has_table, has_variable, metadata, repeater_template_ids, \
     linked_formula_ids, linked_condition_ids, linked_table_ids, linked_variable_ids";

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

/// Formats a timestamp for storage.
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Parses an ISO 8601 TEXT string from SQLite into a `DateTime<Utc>`.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    s.parse::<DateTime<Utc>>().unwrap_or_else(|_| {
        chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.fZ")
            .or_else(|_| chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
            .map(|ndt| ndt.and_utc())
            .unwrap_or_else(|_| Utc::now())
    })
}

/// Reads a TEXT column holding JSON.
pub(crate) fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Deserialises a row into a [`Node`].
pub(crate) fn scan_node(row: &Row<'_>) -> rusqlite::Result<Node> {
    let node_type: String = row.get(2)?;

    let mut linked = LinkedIds::default();
    for (offset, field) in LinkField::ALL.iter().enumerate() {
        let ids: Vec<String> = json_column(row, 11 + offset)?;
        linked.merge(*field, ids);
    }

    Ok(Node {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        node_type: NodeType::from(node_type.as_str()),
        label: row.get(3)?,
        order: row.get(4)?,
        has_formula: row.get(5)?,
        has_condition: row.get(6)?,
        has_table: row.get(7)?,
        has_variable: row.get(8)?,
        metadata: json_column(row, 9)?,
        repeater_template_node_ids: json_column(row, 10)?,
        linked,
    })
}

fn query_nodes(conn: &Connection, sql: &str, args: impl rusqlite::Params) -> Result<Vec<Node>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, scan_node)?;
    let mut nodes = Vec::new();
    for row in rows {
        nodes.push(row?);
    }
    Ok(nodes)
}

// ---------------------------------------------------------------------------
// Connection-level helpers (shared with Transaction)
// ---------------------------------------------------------------------------

pub(crate) fn get_node_on_conn(conn: &Connection, id: &str) -> Result<Node> {
    let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1");
    conn.query_row(&sql, params![id], scan_node)
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StorageError::not_found("node", id),
            other => StorageError::Query(other),
        })
}

pub(crate) fn node_exists_on_conn(conn: &Connection, id: &str) -> Result<bool> {
    let found = conn
        .query_row("SELECT 1 FROM nodes WHERE id = ?1", params![id], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

pub(crate) fn get_nodes_by_parent_on_conn(conn: &Connection, parent_id: &str) -> Result<Vec<Node>> {
    let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE parent_id = ?1 ORDER BY sort_order, id");
    query_nodes(conn, &sql, params![parent_id])
}

pub(crate) fn list_nodes_on_conn(conn: &Connection) -> Result<Vec<Node>> {
    let sql = format!("SELECT {NODE_COLUMNS} FROM nodes ORDER BY id");
    query_nodes(conn, &sql, [])
}

pub(crate) fn find_nodes_by_metadata_on_conn(
    conn: &Connection,
    key: &str,
    value: &str,
) -> Result<Vec<Node>> {
    if !key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        return Err(StorageError::validation(format!("invalid metadata key: {key}")));
    }
    let sql = format!(
        "SELECT {NODE_COLUMNS} FROM nodes \
         WHERE CAST(json_extract(metadata, '$.{key}') AS TEXT) = ?1 ORDER BY id"
    );
    query_nodes(conn, &sql, params![value])
}

/// Inserts or updates a node. The linked-id columns keep their stored value
/// (empty for new rows).
pub(crate) fn upsert_node_on_conn(conn: &Connection, node: &Node) -> Result<()> {
    validation::validate_node(node)?;
    let now = format_datetime(&Utc::now());
    conn.execute(
        "INSERT INTO nodes (id, parent_id, node_type, label, sort_order,
             has_formula, has_condition, has_table, has_variable,
             metadata, repeater_template_ids, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
         ON CONFLICT(id) DO UPDATE SET
             parent_id = excluded.parent_id,
             node_type = excluded.node_type,
             label = excluded.label,
             sort_order = excluded.sort_order,
             has_formula = excluded.has_formula,
             has_condition = excluded.has_condition,
             has_table = excluded.has_table,
             has_variable = excluded.has_variable,
             metadata = excluded.metadata,
             repeater_template_ids = excluded.repeater_template_ids,
             updated_at = excluded.updated_at",
        params![
            node.id,
            node.parent_id,
            node.node_type.as_str(),
            node.label,
            node.order,
            node.has_formula,
            node.has_condition,
            node.has_table,
            node.has_variable,
            serde_json::to_string(&node.metadata)?,
            serde_json::to_string(&node.repeater_template_node_ids)?,
            now,
        ],
    )?;
    Ok(())
}

/// Deletes a node and all of its descendants. Capacities and variables
/// owned by the deleted nodes go with them through `ON DELETE CASCADE`.
pub(crate) fn delete_node_on_conn(conn: &Connection, id: &str) -> Result<Vec<String>> {
    if !node_exists_on_conn(conn, id)? {
        return Err(StorageError::not_found("node", id));
    }

    let mut stmt = conn.prepare(
        "WITH RECURSIVE subtree(id) AS (
             SELECT ?1
             UNION
             SELECT n.id FROM nodes n JOIN subtree s ON n.parent_id = s.id
         )
         SELECT id FROM subtree",
    )?;
    let ids: Vec<String> = stmt
        .query_map(params![id], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;

    for node_id in &ids {
        conn.execute("DELETE FROM nodes WHERE id = ?1", params![node_id])?;
    }
    Ok(ids)
}

fn read_linked(conn: &Connection, node_id: &str, field: LinkField) -> Result<BTreeSet<String>> {
    let sql = format!("SELECT {} FROM nodes WHERE id = ?1", field.column());
    let text: String = conn
        .query_row(&sql, params![node_id], |row| row.get(0))
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StorageError::not_found("node", node_id),
            other => StorageError::Query(other),
        })?;
    Ok(serde_json::from_str(&text)?)
}

fn write_linked(conn: &Connection, node_id: &str, field: LinkField, ids: &BTreeSet<String>) -> Result<()> {
    let sql = format!("UPDATE nodes SET {} = ?1 WHERE id = ?2", field.column());
    conn.execute(&sql, params![serde_json::to_string(ids)?, node_id])?;
    Ok(())
}

/// Unions `ids` into a node's linked-id set. Only writes when something
/// was added.
pub(crate) fn merge_linked_ids_on_conn(
    conn: &Connection,
    node_id: &str,
    field: LinkField,
    ids: &[String],
) -> Result<Vec<String>> {
    let current = read_linked(conn, node_id, field)?;
    let mut linked = LinkedIds::default();
    linked.merge(field, current);
    let added = linked.merge(field, ids.iter().cloned());
    if !added.is_empty() {
        write_linked(conn, node_id, field, linked.get(field))?;
    }
    Ok(added)
}

/// Removes `ids` from a node's linked-id set.
pub(crate) fn remove_linked_ids_on_conn(
    conn: &Connection,
    node_id: &str,
    field: LinkField,
    ids: &[String],
) -> Result<Vec<String>> {
    let current = read_linked(conn, node_id, field)?;
    let mut linked = LinkedIds::default();
    linked.merge(field, current);
    let removed = linked.remove(field, ids.iter().map(String::as_str));
    if !removed.is_empty() {
        write_linked(conn, node_id, field, linked.get(field))?;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::store::SqliteStore;
    use arbor_core::node::NodeBuilder;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn seed(conn: &Connection) {
        upsert_node_on_conn(conn, &NodeBuilder::new("root").node_type(NodeType::Branch).build()).unwrap();
        upsert_node_on_conn(conn, &NodeBuilder::new("a").parent("root").label("A").order(1).build()).unwrap();
        upsert_node_on_conn(conn, &NodeBuilder::new("b").parent("root").label("B").order(0).build()).unwrap();
        upsert_node_on_conn(conn, &NodeBuilder::new("b1").parent("b").build()).unwrap();
    }

    // -- CRUD ----------------------------------------------------------------

    #[test]
    fn upsert_and_get() {
        let store = SqliteStore::open_in_memory().unwrap();
        let conn = store.lock_conn().unwrap();
        seed(&conn);
        let a = get_node_on_conn(&conn, "a").unwrap();
        assert_eq!(a.label, "A");
        assert_eq!(a.parent_id.as_deref(), Some("root"));
        assert!(get_node_on_conn(&conn, "zz").unwrap_err().is_not_found());
    }

    #[test]
    fn children_sorted_by_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        let conn = store.lock_conn().unwrap();
        seed(&conn);
        let ids: Vec<String> = get_nodes_by_parent_on_conn(&conn, "root")
            .unwrap()
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn metadata_lookup() {
        let store = SqliteStore::open_in_memory().unwrap();
        let conn = store.lock_conn().unwrap();
        let node = NodeBuilder::new("a-1")
            .metadata(json!({"duplicatedFromRepeater": "rep", "occurrenceIndex": 1}))
            .build();
        upsert_node_on_conn(&conn, &node).unwrap();
        assert_eq!(find_nodes_by_metadata_on_conn(&conn, "duplicatedFromRepeater", "rep").unwrap().len(), 1);
        assert_eq!(find_nodes_by_metadata_on_conn(&conn, "occurrenceIndex", "1").unwrap().len(), 1);
        assert!(find_nodes_by_metadata_on_conn(&conn, "x') OR 1=1 --", "").is_err());
    }

    // -- delete --------------------------------------------------------------

    #[test]
    fn delete_cascades_to_descendants() {
        let store = SqliteStore::open_in_memory().unwrap();
        let conn = store.lock_conn().unwrap();
        seed(&conn);
        let mut deleted = delete_node_on_conn(&conn, "b").unwrap();
        deleted.sort();
        assert_eq!(deleted, vec!["b", "b1"]);
        assert!(node_exists_on_conn(&conn, "a").unwrap());
        assert!(!node_exists_on_conn(&conn, "b1").unwrap());
    }

    // -- linked ids ----------------------------------------------------------

    #[test]
    fn upsert_never_touches_linked_ids() {
        let store = SqliteStore::open_in_memory().unwrap();
        let conn = store.lock_conn().unwrap();
        seed(&conn);
        merge_linked_ids_on_conn(&conn, "a", LinkField::Formula, &["f1".into()]).unwrap();

        let mut a = get_node_on_conn(&conn, "a").unwrap();
        a.label = "Renamed".into();
        a.linked = LinkedIds::default();
        upsert_node_on_conn(&conn, &a).unwrap();

        let a = get_node_on_conn(&conn, "a").unwrap();
        assert_eq!(a.label, "Renamed");
        assert!(a.linked.contains(LinkField::Formula, "f1"));
    }

    #[test]
    fn merge_and_remove_report_deltas() {
        let store = SqliteStore::open_in_memory().unwrap();
        let conn = store.lock_conn().unwrap();
        seed(&conn);
        let added = merge_linked_ids_on_conn(&conn, "a", LinkField::Variable, &["v1".into(), "v2".into()]).unwrap();
        assert_eq!(added.len(), 2);
        let again = merge_linked_ids_on_conn(&conn, "a", LinkField::Variable, &["v2".into()]).unwrap();
        assert!(again.is_empty());
        let removed = remove_linked_ids_on_conn(&conn, "a", LinkField::Variable, &["v1".into()]).unwrap();
        assert_eq!(removed, vec!["v1".to_string()]);
        let a = get_node_on_conn(&conn, "a").unwrap();
        assert_eq!(a.linked.get(LinkField::Variable).iter().collect::<Vec<_>>(), vec!["v2"]);
    }

    #[test]
    fn merge_on_missing_node_is_not_found() {
        let store = SqliteStore::open_in_memory().unwrap();
        let conn = store.lock_conn().unwrap();
        let err = merge_linked_ids_on_conn(&conn, "ghost", LinkField::Table, &["t".into()]).unwrap_err();
        assert!(err.is_not_found());
    }
}
