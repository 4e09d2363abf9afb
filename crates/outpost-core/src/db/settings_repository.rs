//! Local key/value settings

use crate::error::Result;
use libsql::Connection;

/// Well-known keys in the `settings` table
pub mod keys {
    /// Base URL of the sync server this client registered with
    pub const SERVER_URL: &str = "sync.server_url";
    /// Bearer token issued at registration
    pub const AUTH_TOKEN: &str = "sync.auth_token";
    /// Local schema version that the server refused with "upgrade required"
    pub const BLOCKED_SCHEMA_VERSION: &str = "sync.blocked_schema_version";
}

/// Trait for settings storage operations (async)
#[allow(async_fn_in_trait)]
pub trait SettingsRepository {
    /// Read a setting, `None` when unset
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Insert or overwrite a setting
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a setting if present
    async fn delete(&self, key: &str) -> Result<()>;
}

/// libSQL implementation of `SettingsRepository`
pub struct LibSqlSettingsRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlSettingsRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl SettingsRepository for LibSqlSettingsRepository<'_> {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query("SELECT value FROM settings WHERE key = ?", [key])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES (?, ?)",
                [key, value],
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM settings WHERE key = ?", [key])
            .await?;
        Ok(())
    }
}
