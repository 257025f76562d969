//! Repeater bookkeeping: occurrence counters and the blueprint cache.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::{Result, StorageError};
use crate::sqlite::nodes::{format_datetime, parse_datetime};
use crate::traits::CachedBlueprint;

/// Hands out the next occurrence index for `repeater_id`.
///
/// The counter never goes backwards and never reuses an index still carried
/// by an existing clone, even when clones were imported from elsewhere.
pub(crate) fn allocate_occurrence_index_on_conn(conn: &Connection, repeater_id: &str) -> Result<u32> {
    let highest_existing: i64 = conn.query_row(
        "SELECT COALESCE(MAX(CAST(json_extract(metadata, '$.occurrenceIndex') AS INTEGER)), 0)
         FROM nodes WHERE json_extract(metadata, '$.duplicatedFromRepeater') = ?1",
        params![repeater_id],
        |row| row.get(0),
    )?;

    conn.execute(
        "INSERT INTO occurrence_counters (repeater_id, last_index) VALUES (?1, ?2 + 1)
         ON CONFLICT(repeater_id) DO UPDATE SET last_index = MAX(last_index, ?2) + 1",
        params![repeater_id, highest_existing],
    )?;

    let index: i64 = conn.query_row(
        "SELECT last_index FROM occurrence_counters WHERE repeater_id = ?1",
        params![repeater_id],
        |row| row.get(0),
    )?;
    let index = u32::try_from(index).map_err(|_| {
        StorageError::validation(format!("occurrence index {index} for {repeater_id} is out of range"))
    })?;
    debug!(repeater_id, index, "allocated occurrence index");
    Ok(index)
}

pub(crate) fn get_cached_blueprint_on_conn(conn: &Connection, repeater_id: &str) -> Result<Option<CachedBlueprint>> {
    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT blueprint, declared_ids, captured_at FROM blueprint_cache WHERE repeater_id = ?1",
            params![repeater_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    match row {
        None => Ok(None),
        Some((blueprint, declared, captured_at)) => Ok(Some(CachedBlueprint {
            blueprint: serde_json::from_str(&blueprint)?,
            declared_template_ids: serde_json::from_str(&declared)?,
            captured_at: parse_datetime(&captured_at),
        })),
    }
}

pub(crate) fn put_cached_blueprint_on_conn(conn: &Connection, cached: &CachedBlueprint) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO blueprint_cache (repeater_id, blueprint, declared_ids, template_ids, captured_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            cached.blueprint.repeater_node_id,
            serde_json::to_string(&cached.blueprint)?,
            serde_json::to_string(&cached.declared_template_ids)?,
            serde_json::to_string(&cached.blueprint.template_node_ids)?,
            format_datetime(&cached.captured_at),
        ],
    )?;
    Ok(())
}

pub(crate) fn invalidate_blueprints_containing_on_conn(conn: &Connection, node_id: &str) -> Result<usize> {
    let dropped = conn.execute(
        "DELETE FROM blueprint_cache
         WHERE repeater_id = ?1
            OR EXISTS (SELECT 1 FROM json_each(blueprint_cache.template_ids) WHERE value = ?1)",
        params![node_id],
    )?;
    if dropped > 0 {
        debug!(node_id, dropped, "invalidated cached blueprints");
    }
    Ok(dropped)
}

pub(crate) fn invalidate_blueprint_on_conn(conn: &Connection, repeater_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM blueprint_cache WHERE repeater_id = ?1",
        params![repeater_id],
    )?;
    Ok(())
}
