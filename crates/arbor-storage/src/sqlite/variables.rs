//! Variable CRUD operations.

use rusqlite::{params, Connection, OptionalExtension, Row};

use arbor_core::enums::SourceType;
use arbor_core::validation;
use arbor_core::variable::Variable;

use crate::error::{Result, StorageError};
use crate::sqlite::nodes::json_column;

const VARIABLE_COLUMNS: &str =
    "id, node_id, exposed_key, display_name, source_type, source_ref, unit, metadata";

fn scan_variable(row: &Row<'_>) -> rusqlite::Result<Variable> {
    let source_type: String = row.get(4)?;
    Ok(Variable {
        id: row.get(0)?,
        node_id: row.get(1)?,
        exposed_key: row.get(2)?,
        display_name: row.get(3)?,
        source_type: SourceType::from(source_type.as_str()),
        source_ref: row.get(5)?,
        unit: row.get(6)?,
        metadata: json_column(row, 7)?,
    })
}

fn query_one(conn: &Connection, column: &str, value: &str) -> Result<Option<Variable>> {
    let sql = format!("SELECT {VARIABLE_COLUMNS} FROM variables WHERE {column} = ?1");
    Ok(conn.query_row(&sql, params![value], scan_variable).optional()?)
}

pub(crate) fn get_variable_on_conn(conn: &Connection, id: &str) -> Result<Variable> {
    query_one(conn, "id", id)?.ok_or_else(|| StorageError::not_found("variable", id))
}

pub(crate) fn get_variable_by_node_on_conn(conn: &Connection, node_id: &str) -> Result<Option<Variable>> {
    query_one(conn, "node_id", node_id)
}

pub(crate) fn find_variable_by_exposed_key_on_conn(conn: &Connection, key: &str) -> Result<Option<Variable>> {
    query_one(conn, "exposed_key", key)
}

pub(crate) fn list_variables_on_conn(conn: &Connection) -> Result<Vec<Variable>> {
    let sql = format!("SELECT {VARIABLE_COLUMNS} FROM variables ORDER BY id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], scan_variable)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Inserts or updates a variable. Exposed keys and owning nodes are unique;
/// a clash with a different variable is reported as a collision.
pub(crate) fn upsert_variable_on_conn(conn: &Connection, variable: &Variable) -> Result<()> {
    validation::validate_variable(variable)?;

    if let Some(other) = find_variable_by_exposed_key_on_conn(conn, &variable.exposed_key)? {
        if other.id != variable.id {
            return Err(StorageError::collision("exposed key", &variable.exposed_key));
        }
    }
    if let Some(other) = get_variable_by_node_on_conn(conn, &variable.node_id)? {
        if other.id != variable.id {
            return Err(StorageError::collision("variable for node", &variable.node_id));
        }
    }

    conn.execute(
        "INSERT INTO variables (id, node_id, exposed_key, display_name, source_type, source_ref, unit, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
             node_id = excluded.node_id,
             exposed_key = excluded.exposed_key,
             display_name = excluded.display_name,
             source_type = excluded.source_type,
             source_ref = excluded.source_ref,
             unit = excluded.unit,
             metadata = excluded.metadata",
        params![
            variable.id,
            variable.node_id,
            variable.exposed_key,
            variable.display_name,
            variable.source_type.as_str(),
            variable.source_ref,
            variable.unit,
            serde_json::to_string(&variable.metadata)?,
        ],
    )?;
    Ok(())
}

pub(crate) fn delete_variable_on_conn(conn: &Connection, id: &str) -> Result<()> {
    let rows = conn.execute("DELETE FROM variables WHERE id = ?1", params![id])?;
    if rows == 0 {
        return Err(StorageError::not_found("variable", id));
    }
    Ok(())
}
