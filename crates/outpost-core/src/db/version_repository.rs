//! Append-only conflict version history

use libsql::{params, Connection, Row};
use uuid::Uuid;

use super::values::{node_id, optional_i64, optional_node_id, text_or_null, uuid};
use crate::error::{Error, Result};
use crate::models::{ConflictResolution, ObjectVersion};

const VERSION_SELECT: &str = "SELECT h.id, h.entity_uuid, h.entity_type, h.source_node_id, h.resolved_by,
            h.arrival_time, h.serialized_data, h.conflict_resolution, m.resolved_at
     FROM object_version_history h
     LEFT JOIN manual_resolutions m ON m.version_id = h.id";

/// Trait for version history operations (async)
#[allow(async_fn_in_trait)]
pub trait VersionRepository {
    /// Archive a version
    async fn insert(&self, version: &ObjectVersion) -> Result<()>;

    /// Get an archived version by id
    async fn get(&self, id: &Uuid) -> Result<Option<ObjectVersion>>;

    /// Archived versions, newest first; `pending_only` keeps unresolved manual conflicts
    async fn list(&self, pending_only: bool) -> Result<Vec<ObjectVersion>>;

    /// Archived versions of one entity, newest first
    async fn list_for_entity(&self, entity_type: &str, entity_uuid: &Uuid) -> Result<Vec<ObjectVersion>>;

    /// Record the operator's decision on a manual conflict
    async fn record_manual_resolution(&self, id: &Uuid, resolved_at: i64, resolution_data: &str) -> Result<()>;
}

/// libSQL implementation of `VersionRepository`
pub struct LibSqlVersionRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlVersionRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl VersionRepository for LibSqlVersionRepository<'_> {
    async fn insert(&self, version: &ObjectVersion) -> Result<()> {
        let source = version.source_node_id.map(|id| id.as_str());
        self.conn
            .execute(
                "INSERT INTO object_version_history
                    (id, entity_uuid, entity_type, source_node_id, resolved_by,
                     arrival_time, serialized_data, conflict_resolution)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    version.id.to_string(),
                    version.entity_uuid.to_string(),
                    version.entity_type.as_str(),
                    text_or_null(source.as_deref()),
                    version.resolved_by.as_str(),
                    version.arrival_time,
                    version.serialized_data.as_str(),
                    version.conflict_resolution.as_str(),
                ],
            )
            .await?;
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<ObjectVersion>> {
        let mut rows = self
            .conn
            .query(&format!("{VERSION_SELECT} WHERE h.id = ?"), [id.to_string()])
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_version(&row)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, pending_only: bool) -> Result<Vec<ObjectVersion>> {
        let sql = if pending_only {
            format!(
                "{VERSION_SELECT}
                 WHERE h.conflict_resolution = 'manual' AND m.version_id IS NULL
                 ORDER BY h.arrival_time DESC"
            )
        } else {
            format!("{VERSION_SELECT} ORDER BY h.arrival_time DESC")
        };

        let mut rows = self.conn.query(&sql, ()).await?;
        let mut versions = Vec::new();
        while let Some(row) = rows.next().await? {
            versions.push(row_to_version(&row)?);
        }
        Ok(versions)
    }

    async fn list_for_entity(&self, entity_type: &str, entity_uuid: &Uuid) -> Result<Vec<ObjectVersion>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "{VERSION_SELECT}
                     WHERE h.entity_type = ? AND h.entity_uuid = ?
                     ORDER BY h.arrival_time DESC"
                ),
                params![entity_type, entity_uuid.to_string()],
            )
            .await?;
        let mut versions = Vec::new();
        while let Some(row) = rows.next().await? {
            versions.push(row_to_version(&row)?);
        }
        Ok(versions)
    }

    async fn record_manual_resolution(&self, id: &Uuid, resolved_at: i64, resolution_data: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO manual_resolutions (version_id, resolved_at, resolution_data)
                 VALUES (?, ?, ?)",
                params![id.to_string(), resolved_at, resolution_data],
            )
            .await?;
        Ok(())
    }
}

fn row_to_version(row: &Row) -> Result<ObjectVersion> {
    let resolution: String = row.get(7)?;
    let conflict_resolution = resolution
        .parse::<ConflictResolution>()
        .map_err(Error::Database)?;

    Ok(ObjectVersion {
        id: uuid(row, 0)?,
        entity_uuid: uuid(row, 1)?,
        entity_type: row.get(2)?,
        source_node_id: optional_node_id(row, 3)?,
        resolved_by: node_id(row, 4)?,
        arrival_time: row.get(5)?,
        serialized_data: row.get(6)?,
        conflict_resolution,
        manually_resolved_at: optional_i64(row, 8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::NodeId;
    use pretty_assertions::assert_eq;

    fn version(resolution: ConflictResolution, arrival_time: i64) -> ObjectVersion {
        ObjectVersion {
            id: Uuid::now_v7(),
            entity_uuid: Uuid::now_v7(),
            entity_type: "estimate".to_string(),
            source_node_id: Some(NodeId::new()),
            resolved_by: NodeId::new(),
            arrival_time,
            serialized_data: r#"{"updated_at":1}"#.to_string(),
            conflict_resolution: resolution,
            manually_resolved_at: None,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_insert_and_get() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlVersionRepository::new(db.connection());

        let archived = version(ConflictResolution::TimestampWins, 5);
        repo.insert(&archived).await.unwrap();

        assert_eq!(repo.get(&archived.id).await.unwrap(), Some(archived.clone()));
        assert_eq!(
            repo.list_for_entity("estimate", &archived.entity_uuid)
                .await
                .unwrap(),
            vec![archived]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pending_filter_tracks_manual_resolution() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlVersionRepository::new(db.connection());

        let manual = version(ConflictResolution::Manual, 2);
        let automatic = version(ConflictResolution::ServerWins, 1);
        repo.insert(&manual).await.unwrap();
        repo.insert(&automatic).await.unwrap();

        assert_eq!(repo.list(false).await.unwrap().len(), 2);
        assert_eq!(repo.list(true).await.unwrap(), vec![manual.clone()]);

        repo.record_manual_resolution(&manual.id, 9, "{}").await.unwrap();
        assert!(repo.list(true).await.unwrap().is_empty());
        let resolved = repo.get(&manual.id).await.unwrap().unwrap();
        assert_eq!(resolved.manually_resolved_at, Some(9));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_second_manual_resolution_fails() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlVersionRepository::new(db.connection());

        let manual = version(ConflictResolution::Manual, 2);
        repo.insert(&manual).await.unwrap();
        repo.record_manual_resolution(&manual.id, 9, "{}").await.unwrap();

        assert!(repo
            .record_manual_resolution(&manual.id, 10, "{}")
            .await
            .is_err());
    }
}
