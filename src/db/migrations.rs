use rusqlite::Connection;

use super::DbError;

struct Migration {
    version: i64,
    summary: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        summary: "create activity_events",
        sql: r#"
CREATE TABLE activity_events (
    id           TEXT PRIMARY KEY,
    actor_id     TEXT NOT NULL,
    actor_name   TEXT NOT NULL,
    actor_role   TEXT NOT NULL,
    action       TEXT NOT NULL,
    resource     TEXT NOT NULL,
    resource_id  TEXT,
    tenant_id    TEXT,
    detail_json  TEXT NOT NULL,
    occurred_at  TEXT NOT NULL,
    notified     INTEGER NOT NULL DEFAULT 0
);
"#,
    },
    Migration {
        version: 2,
        summary: "index activity_events by actor, action, resource and tenant",
        sql: r#"
CREATE INDEX idx_activity_actor_action ON activity_events(actor_id, action, occurred_at);
CREATE INDEX idx_activity_actor_time ON activity_events(actor_id, occurred_at);
CREATE INDEX idx_activity_resource ON activity_events(resource, occurred_at);
CREATE INDEX idx_activity_tenant ON activity_events(tenant_id, occurred_at);
"#,
    },
    Migration {
        version: 3,
        summary: "create activity_partitions mirror",
        sql: r#"
CREATE TABLE activity_partitions (
    actor_id     TEXT NOT NULL,
    action       TEXT NOT NULL,
    event_id     TEXT NOT NULL REFERENCES activity_events(id),
    occurred_at  TEXT NOT NULL,
    PRIMARY KEY (actor_id, action, event_id)
);

CREATE INDEX idx_activity_partitions_time ON activity_partitions(actor_id, action, occurred_at);
"#,
    },
];

/// Highest schema version this build knows how to create.
pub(super) const LATEST_VERSION: i64 = 3;

pub(super) fn schema_version(conn: &Connection) -> Result<i64, DbError> {
    let version = conn.query_row("SELECT COALESCE(MAX(version), 0) FROM _migrations", [], |row| {
        row.get(0)
    })?;
    Ok(version)
}

/// Bring the activity schema up to [`LATEST_VERSION`]. Each pending step runs
/// in its own transaction and is recorded in `_migrations`.
pub(super) fn run_migrations(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            applied_at  TEXT NOT NULL
        );",
    )?;

    let current = schema_version(conn)?;
    if current > LATEST_VERSION {
        return Err(DbError::Migration(format!(
            "activity schema is at v{current}, newer than this build (v{LATEST_VERSION})"
        )));
    }
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    if pending.is_empty() {
        tracing::debug!("activity schema up to date at v{current}");
        return Ok(());
    }

    for migration in pending {
        tracing::info!("activity schema v{}: {}", migration.version, migration.summary);
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.sql)
            .map_err(|e| DbError::Migration(format!("v{} ({}): {e}", migration.version, migration.summary)))?;
        tx.execute(
            "INSERT INTO _migrations (version, applied_at) VALUES (?1, datetime('now'))",
            rusqlite::params![migration.version],
        )?;
        tx.commit()?;
    }

    Ok(())
}
