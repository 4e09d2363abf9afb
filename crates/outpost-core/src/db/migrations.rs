//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Current storage schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }
    if version < 2 {
        migrate_v2(conn).await?;
    }

    Ok(())
}

/// Get the current storage schema version
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

async fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    // libsql doesn't have execute_batch, so we run each statement separately
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn
        .execute("INSERT INTO schema_version (version) VALUES (?)", [i64::from(version)])
        .await
    {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Migrated database to version {version}");
    Ok(())
}

/// Migration to version 1: nodes, entities, change queue, retained packets
async fn migrate_v1(conn: &Connection) -> Result<()> {
    let statements = [
        // Schema version tracking
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        // Sync participants, including this database's own identity
        "CREATE TABLE IF NOT EXISTS sync_nodes (
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE COLLATE NOCASE,
            name TEXT NOT NULL,
            description TEXT,
            is_server INTEGER NOT NULL DEFAULT 0,
            is_local INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            registered_at INTEGER NOT NULL,
            last_sync_in INTEGER,
            last_sync_out INTEGER,
            received_packet_no INTEGER NOT NULL DEFAULT 0,
            sent_packet_no INTEGER NOT NULL DEFAULT 0,
            schema_version INTEGER
        )",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_nodes_local ON sync_nodes(is_local) WHERE is_local = 1",
        // Generic synchronizable entity envelope
        "CREATE TABLE IF NOT EXISTS entities (
            entity_type TEXT NOT NULL,
            uuid TEXT NOT NULL,
            data TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            modified_by TEXT,
            PRIMARY KEY (entity_type, uuid)
        )",
        "CREATE INDEX IF NOT EXISTS idx_entities_updated ON entities(entity_type, updated_at DESC)",
        // Outbound change queue, one row per target node
        "CREATE TABLE IF NOT EXISTS sync_changes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            node_id TEXT NOT NULL REFERENCES sync_nodes(id),
            entity_type TEXT NOT NULL,
            entity_uuid TEXT NOT NULL,
            operation TEXT NOT NULL CHECK (operation IN ('INSERT', 'UPDATE', 'DELETE')),
            packet_no INTEGER,
            created_at INTEGER NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_changes_pending ON sync_changes(node_id, packet_no, id)",
        "CREATE INDEX IF NOT EXISTS idx_sync_changes_entity ON sync_changes(node_id, entity_type, entity_uuid)",
        // Outbound packets retained until acknowledged
        "CREATE TABLE IF NOT EXISTS sync_packets (
            node_id TEXT NOT NULL REFERENCES sync_nodes(id),
            packet_no INTEGER NOT NULL,
            payload BLOB NOT NULL,
            entry_count INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_attempt_at INTEGER,
            PRIMARY KEY (node_id, packet_no)
        )",
        // Version of each entity last exchanged with each peer (conflict base)
        "CREATE TABLE IF NOT EXISTS entity_peer_state (
            entity_type TEXT NOT NULL,
            entity_uuid TEXT NOT NULL,
            node_id TEXT NOT NULL REFERENCES sync_nodes(id),
            synced_updated_at INTEGER NOT NULL,
            PRIMARY KEY (entity_type, entity_uuid, node_id)
        )",
        // Settings table (local only)
        "CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
    ];

    apply(conn, 1, &statements).await
}

/// Migration to version 2: conflict version history
async fn migrate_v2(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS object_version_history (
            id TEXT PRIMARY KEY,
            entity_uuid TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            source_node_id TEXT,
            resolved_by TEXT NOT NULL,
            arrival_time INTEGER NOT NULL,
            serialized_data TEXT NOT NULL,
            conflict_resolution TEXT NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_version_history_entity ON object_version_history(entity_type, entity_uuid)",
        "CREATE INDEX IF NOT EXISTS idx_version_history_arrival ON object_version_history(arrival_time DESC)",
        "CREATE TRIGGER IF NOT EXISTS object_version_history_no_update BEFORE UPDATE ON object_version_history
         BEGIN
             SELECT RAISE(ABORT, 'object_version_history is append-only');
         END",
        "CREATE TRIGGER IF NOT EXISTS object_version_history_no_delete BEFORE DELETE ON object_version_history
         BEGIN
             SELECT RAISE(ABORT, 'object_version_history is append-only');
         END",
        "CREATE TABLE IF NOT EXISTS manual_resolutions (
            version_id TEXT PRIMARY KEY REFERENCES object_version_history(id),
            resolved_at INTEGER NOT NULL,
            resolution_data TEXT NOT NULL
        )",
    ];

    apply(conn, 2, &statements).await
}
