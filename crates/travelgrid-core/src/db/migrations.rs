//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }
    if version < 2 {
        migrate_v2(conn).await?;
    }
    if version < 3 {
        migrate_v3(conn).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    // Check if schema_version table exists
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Execute one migration's statements inside a transaction
async fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn
        .execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .await
    {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Migrated database to version {version} (target {CURRENT_VERSION})");
    Ok(())
}

/// Migration to version 1: device registry and synchronized entities
async fn migrate_v1(conn: &Connection) -> Result<()> {
    apply(
        conn,
        1,
        &[
            // Schema version tracking
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            // One row per (user, device, data type)
            "CREATE TABLE IF NOT EXISTS device_sync (
                user_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                data_type TEXT NOT NULL,
                last_sync_at INTEGER NOT NULL,
                user_agent TEXT,
                platform TEXT,
                app_version TEXT,
                sync_status TEXT NOT NULL DEFAULT 'synced',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, device_id, data_type)
            )",
            "CREATE INDEX IF NOT EXISTS idx_device_sync_user ON device_sync(user_id)",
            // Trips, checklists and budgets share one document table
            "CREATE TABLE IF NOT EXISTS sync_entities (
                data_type TEXT NOT NULL,
                id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                data TEXT NOT NULL,
                revision INTEGER NOT NULL,
                last_modified_by TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, data_type, id)
            )",
        ],
    )
    .await
}

/// Migration to version 2: conflict store
async fn migrate_v2(conn: &Connection) -> Result<()> {
    apply(
        conn,
        2,
        &[
            "CREATE TABLE IF NOT EXISTS data_conflicts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                data_type TEXT NOT NULL,
                data_id TEXT NOT NULL,
                local_timestamp INTEGER NOT NULL,
                local_data TEXT NOT NULL,
                local_device_id TEXT,
                remote_timestamp INTEGER NOT NULL,
                remote_data TEXT NOT NULL,
                remote_device_id TEXT,
                conflict_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                resolution_strategy TEXT,
                resolved_by TEXT,
                resolved_at INTEGER,
                resolution_data TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_data_conflicts_user_status ON data_conflicts(user_id, status)",
            "CREATE INDEX IF NOT EXISTS idx_data_conflicts_data_id ON data_conflicts(data_type, data_id)",
        ],
    )
    .await
}

/// Migration to version 3: append-only audit trail
async fn migrate_v3(conn: &Connection) -> Result<()> {
    apply(
        conn,
        3,
        &[
            "CREATE TABLE IF NOT EXISTS sync_audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                device_id TEXT,
                data_type TEXT NOT NULL,
                data_id TEXT NOT NULL,
                action TEXT NOT NULL,
                before_data TEXT,
                after_data TEXT,
                created_at INTEGER NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_sync_audit_user_created ON sync_audit_log(user_id, created_at DESC)",
            "CREATE TRIGGER IF NOT EXISTS sync_audit_log_no_update BEFORE UPDATE ON sync_audit_log
             BEGIN
                 SELECT RAISE(ABORT, 'sync_audit_log is append-only');
             END",
            "CREATE TRIGGER IF NOT EXISTS sync_audit_log_no_delete BEFORE DELETE ON sync_audit_log
             BEGIN
                 SELECT RAISE(ABORT, 'sync_audit_log is append-only');
             END",
        ],
    )
    .await
}
