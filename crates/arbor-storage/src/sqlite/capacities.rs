//! Capacity CRUD operations.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use arbor_core::capacity::Capacity;
use arbor_core::enums::CapacityKind;
use arbor_core::validation;

use crate::error::{Result, StorageError};
use crate::sqlite::nodes::{format_datetime, json_column, parse_datetime};

const CAPACITY_COLUMNS: &str = "id, owner_node_id, name, is_default, body, created_at, updated_at";

fn scan_capacity(row: &Row<'_>) -> rusqlite::Result<Capacity> {
    let created: String = row.get(5)?;
    let updated: String = row.get(6)?;
    Ok(Capacity {
        id: row.get(0)?,
        owner_node_id: row.get(1)?,
        name: row.get(2)?,
        is_default: row.get(3)?,
        body: json_column(row, 4)?,
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

fn query_capacities(conn: &Connection, sql: &str, args: impl rusqlite::Params) -> Result<Vec<Capacity>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, scan_capacity)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub(crate) fn get_capacity_on_conn(conn: &Connection, kind: CapacityKind, id: &str) -> Result<Capacity> {
    let sql = format!("SELECT {CAPACITY_COLUMNS} FROM capacities WHERE id = ?1 AND kind = ?2");
    conn.query_row(&sql, params![id, kind.as_str()], scan_capacity)
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StorageError::not_found(kind.as_str(), id),
            other => StorageError::Query(other),
        })
}

pub(crate) fn find_capacity_on_conn(conn: &Connection, id: &str) -> Result<Option<Capacity>> {
    let sql = format!("SELECT {CAPACITY_COLUMNS} FROM capacities WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], scan_capacity).optional()?)
}

pub(crate) fn get_capacities_by_owner_on_conn(
    conn: &Connection,
    node_id: &str,
    kind: Option<CapacityKind>,
) -> Result<Vec<Capacity>> {
    match kind {
        Some(kind) => {
            let sql = format!(
                "SELECT {CAPACITY_COLUMNS} FROM capacities \
                 WHERE owner_node_id = ?1 AND kind = ?2 ORDER BY created_at, id"
            );
            query_capacities(conn, &sql, params![node_id, kind.as_str()])
        }
        None => {
            let sql = format!(
                "SELECT {CAPACITY_COLUMNS} FROM capacities \
                 WHERE owner_node_id = ?1 ORDER BY kind, created_at, id"
            );
            query_capacities(conn, &sql, params![node_id])
        }
    }
}

pub(crate) fn list_capacities_on_conn(conn: &Connection) -> Result<Vec<Capacity>> {
    let sql = format!("SELECT {CAPACITY_COLUMNS} FROM capacities ORDER BY id");
    query_capacities(conn, &sql, [])
}

/// Inserts or updates a capacity. A capacity id identifies exactly one
/// capacity, so changing the kind of an existing id is rejected.
pub(crate) fn upsert_capacity_on_conn(conn: &Connection, capacity: &Capacity) -> Result<()> {
    validation::validate_capacity(capacity)?;

    let existing_kind: Option<String> = conn
        .query_row(
            "SELECT kind FROM capacities WHERE id = ?1",
            params![capacity.id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(kind) = existing_kind {
        if kind != capacity.kind().as_str() {
            return Err(StorageError::collision("capacity", &capacity.id));
        }
    }

    conn.execute(
        "INSERT INTO capacities (id, kind, owner_node_id, name, is_default, body, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
             owner_node_id = excluded.owner_node_id,
             name = excluded.name,
             is_default = excluded.is_default,
             body = excluded.body,
             updated_at = excluded.updated_at",
        params![
            capacity.id,
            capacity.kind().as_str(),
            capacity.owner_node_id,
            capacity.name,
            capacity.is_default,
            serde_json::to_string(&capacity.body)?,
            format_datetime(&capacity.created_at),
            format_datetime(&Utc::now()),
        ],
    )?;
    Ok(())
}

pub(crate) fn delete_capacity_on_conn(conn: &Connection, id: &str) -> Result<()> {
    let rows = conn.execute("DELETE FROM capacities WHERE id = ?1", params![id])?;
    if rows == 0 {
        return Err(StorageError::not_found("capacity", id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::nodes::upsert_node_on_conn;
    use crate::sqlite::store::SqliteStore;
    use arbor_core::capacity::{CapacityBody, FormulaSpec, TableSpec, Token};
    use arbor_core::node::NodeBuilder;
    use pretty_assertions::assert_eq;

    fn formula(id: &str, owner: &str) -> Capacity {
        Capacity::new(
            id,
            owner,
            CapacityBody::Formula(FormulaSpec::new(vec![Token::reference("@value.x"), Token::op('+'), Token::Number(1.0)])),
        )
    }

    #[test]
    fn upsert_get_and_find() {
        let store = SqliteStore::open_in_memory().unwrap();
        let conn = store.lock_conn().unwrap();
        upsert_node_on_conn(&conn, &NodeBuilder::new("a").build()).unwrap();
        let cap = formula("f1", "a");
        upsert_capacity_on_conn(&conn, &cap).unwrap();

        let got = get_capacity_on_conn(&conn, CapacityKind::Formula, "f1").unwrap();
        assert_eq!(got.body, cap.body);
        assert!(get_capacity_on_conn(&conn, CapacityKind::Table, "f1").unwrap_err().is_not_found());
        assert_eq!(find_capacity_on_conn(&conn, "f1").unwrap().map(|c| c.kind()), Some(CapacityKind::Formula));
        assert!(find_capacity_on_conn(&conn, "nope").unwrap().is_none());
    }

    #[test]
    fn owner_listing_filters_by_kind() {
        let store = SqliteStore::open_in_memory().unwrap();
        let conn = store.lock_conn().unwrap();
        upsert_node_on_conn(&conn, &NodeBuilder::new("a").build()).unwrap();
        upsert_capacity_on_conn(&conn, &formula("f1", "a")).unwrap();
        upsert_capacity_on_conn(&conn, &Capacity::new("t1", "a", CapacityBody::Table(TableSpec::default()))).unwrap();

        assert_eq!(get_capacities_by_owner_on_conn(&conn, "a", None).unwrap().len(), 2);
        let tables = get_capacities_by_owner_on_conn(&conn, "a", Some(CapacityKind::Table)).unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].id, "t1");
    }

    #[test]
    fn kind_change_is_a_collision() {
        let store = SqliteStore::open_in_memory().unwrap();
        let conn = store.lock_conn().unwrap();
        upsert_node_on_conn(&conn, &NodeBuilder::new("a").build()).unwrap();
        upsert_capacity_on_conn(&conn, &formula("c", "a")).unwrap();
        let err = upsert_capacity_on_conn(&conn, &Capacity::new("c", "a", CapacityBody::Table(TableSpec::default())))
            .unwrap_err();
        assert!(matches!(err, StorageError::IdCollision { .. }));
    }

    #[test]
    fn owner_must_exist() {
        let store = SqliteStore::open_in_memory().unwrap();
        let conn = store.lock_conn().unwrap();
        assert!(upsert_capacity_on_conn(&conn, &formula("f1", "ghost")).is_err());
    }

    #[test]
    fn deleting_owner_cascades() {
        let store = SqliteStore::open_in_memory().unwrap();
        let conn = store.lock_conn().unwrap();
        upsert_node_on_conn(&conn, &NodeBuilder::new("a").build()).unwrap();
        upsert_capacity_on_conn(&conn, &formula("f1", "a")).unwrap();
        conn.execute("DELETE FROM nodes WHERE id = 'a'", []).unwrap();
        assert!(find_capacity_on_conn(&conn, "f1").unwrap().is_none());
        assert!(delete_capacity_on_conn(&conn, "f1").unwrap_err().is_not_found());
    }
}
