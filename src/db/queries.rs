use rusqlite::{params, params_from_iter, Row};
use serde::Serialize;

use super::{Database, DbError};

// ---------------------------------------------------------------------------
// Row types: flat structs that map directly to table columns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityRow {
    pub id: String,
    pub actor_id: String,
    pub actor_name: String,
    pub actor_role: String,
    pub action: String,
    pub resource: String,
    pub resource_id: Option<String>,
    pub tenant_id: Option<String>,
    pub detail_json: String,
    pub occurred_at: String,
    pub notified: bool,
}

/// Column filters for `list_activities`. Timestamps use the stored
/// fixed-width RFC 3339 form; `from` is inclusive, `to` exclusive.
#[derive(Debug, Clone, Default)]
pub struct ActivityQuery {
    pub actor_id: Option<String>,
    pub action: Option<String>,
    pub resource: Option<String>,
    pub tenant_id: Option<String>,
    pub notified: Option<bool>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub newest_first: bool,
    pub limit: Option<usize>,
}

const ACTIVITY_COLUMNS: &str = "e.id, e.actor_id, e.actor_name, e.actor_role, e.action, e.resource, \
     e.resource_id, e.tenant_id, e.detail_json, e.occurred_at, e.notified";

fn map_activity_row(row: &Row<'_>) -> rusqlite::Result<ActivityRow> {
    Ok(ActivityRow {
        id: row.get(0)?,
        actor_id: row.get(1)?,
        actor_name: row.get(2)?,
        actor_role: row.get(3)?,
        action: row.get(4)?,
        resource: row.get(5)?,
        resource_id: row.get(6)?,
        tenant_id: row.get(7)?,
        detail_json: row.get(8)?,
        occurred_at: row.get(9)?,
        notified: row.get::<_, i64>(10)? != 0,
    })
}

// ---------------------------------------------------------------------------
// Activity queries
// ---------------------------------------------------------------------------

pub fn insert_activity(db: &Database, row: &ActivityRow) -> Result<(), DbError> {
    let conn = db.conn();
    conn.execute(
        "INSERT INTO activity_events (id, actor_id, actor_name, actor_role, action, resource, resource_id, tenant_id, detail_json, occurred_at, notified)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            row.id,
            row.actor_id,
            row.actor_name,
            row.actor_role,
            row.action,
            row.resource,
            row.resource_id,
            row.tenant_id,
            row.detail_json,
            row.occurred_at,
            row.notified as i64
        ],
    )?;
    Ok(())
}

pub fn list_activities(db: &Database, query: &ActivityQuery) -> Result<Vec<ActivityRow>, DbError> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut values: Vec<String> = Vec::new();

    let text_filters = [
        ("e.actor_id = ?", &query.actor_id),
        ("e.action = ?", &query.action),
        ("e.resource = ?", &query.resource),
        ("e.tenant_id = ?", &query.tenant_id),
        ("e.occurred_at >= ?", &query.from),
        ("e.occurred_at < ?", &query.to),
    ];
    for (clause, value) in text_filters {
        if let Some(value) = value {
            clauses.push(clause);
            values.push(value.clone());
        }
    }
    match query.notified {
        Some(true) => clauses.push("e.notified = 1"),
        Some(false) => clauses.push("e.notified = 0"),
        None => {}
    }

    let mut sql = format!("SELECT {ACTIVITY_COLUMNS} FROM activity_events e");
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    if query.newest_first {
        sql.push_str(" ORDER BY e.occurred_at DESC, e.rowid DESC");
    } else {
        sql.push_str(" ORDER BY e.occurred_at ASC, e.rowid ASC");
    }
    if let Some(limit) = query.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }

    let conn = db.conn();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), map_activity_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_activity(db: &Database, id: &str) -> Result<Option<ActivityRow>, DbError> {
    let conn = db.conn();
    let mut stmt =
        conn.prepare(&format!("SELECT {ACTIVITY_COLUMNS} FROM activity_events e WHERE e.id = ?1"))?;
    let mut rows = stmt.query_map(params![id], map_activity_row)?;
    match rows.next() {
        Some(row) => Ok(Some(row?)),
        None => Ok(None),
    }
}

/// Set the notified flag on every listed id. Returns the number of rows touched.
pub fn update_activity_notified(db: &Database, ids: &[String], notified: bool) -> Result<usize, DbError> {
    if ids.is_empty() {
        return Ok(0);
    }
    let mut conn = db.conn();
    let tx = conn.transaction()?;
    let mut touched = 0;
    {
        let mut stmt = tx.prepare("UPDATE activity_events SET notified = ?1 WHERE id = ?2")?;
        for id in ids {
            touched += stmt.execute(params![notified as i64, id])?;
        }
    }
    tx.commit()?;
    Ok(touched)
}

// ---------------------------------------------------------------------------
// Partition (mirror) queries
// ---------------------------------------------------------------------------

pub fn insert_partition_entry(
    db: &Database,
    actor_id: &str,
    action: &str,
    event_id: &str,
    occurred_at: &str,
) -> Result<(), DbError> {
    let conn = db.conn();
    conn.execute(
        "INSERT OR IGNORE INTO activity_partitions (actor_id, action, event_id, occurred_at) VALUES (?1, ?2, ?3, ?4)",
        params![actor_id, action, event_id, occurred_at],
    )?;
    Ok(())
}

/// Events mirrored into the `(actor_id, action)` partition, newest first.
pub fn list_partition(
    db: &Database,
    actor_id: &str,
    action: &str,
    limit: Option<usize>,
) -> Result<Vec<ActivityRow>, DbError> {
    let mut sql = format!(
        "SELECT {ACTIVITY_COLUMNS}
         FROM activity_partitions p
         INNER JOIN activity_events e ON e.id = p.event_id
         WHERE p.actor_id = ?1 AND p.action = ?2
         ORDER BY p.occurred_at DESC, e.rowid DESC"
    );
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    let conn = db.conn();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![actor_id, action], map_activity_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
