//! SQLite implementation of IStateStore
//!
//! ## Type Mapping
//!
//! | Domain Type                    | SQL Type | Strategy                                    |
//! |--------------------------------|----------|---------------------------------------------|
//! | FileUuid                       | TEXT     | `.to_string()` / `FromStr`                  |
//! | RemoteName                     | TEXT     | `.as_str()` / `RemoteName::new()`           |
//! | SyncState                      | TEXT     | `sync_state_to_string` / `_from_string`     |
//! | SyncMode                       | TEXT x2  | name column plus optional detail column     |
//! | DateTime<Utc>                  | TEXT     | `to_rfc3339()` / `parse_from_rfc3339()`     |
//! | OperationQueues                | TEXT     | serde_json                                  |
//! | UploadProgress / DownloadProgress | TEXT  | serde_json                                  |
//!
//! Every save rewrites both tables inside one transaction, so a crash
//! leaves either the previous or the new snapshot, never a mix.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use lockstep_core::domain::{
    file_record::{LocalFileRecord, SyncState},
    mode::SyncMode,
    newtypes::{FileUuid, RemoteName},
    snapshot::{EngineSnapshot, SNAPSHOT_SCHEMA_VERSION},
    store::{OperationQueues, OperationStore},
};
use lockstep_core::ports::IStateStore;

use crate::CacheError;

/// SQLite-backed engine state
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Number of persisted file records
    pub async fn record_count(&self) -> Result<i64, CacheError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM file_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

// ============================================================================
// Helper functions for type conversion
// ============================================================================

fn sync_state_to_string(state: SyncState) -> &'static str {
    match state {
        SyncState::PendingInitialUpload => "pending_initial_upload",
        SyncState::PendingInitialDownload => "pending_initial_download",
        SyncState::Synced => "synced",
    }
}

fn sync_state_from_string(s: &str) -> Result<SyncState, CacheError> {
    match s {
        "pending_initial_upload" => Ok(SyncState::PendingInitialUpload),
        "pending_initial_download" => Ok(SyncState::PendingInitialDownload),
        "synced" => Ok(SyncState::Synced),
        other => Err(CacheError::SerializationError(format!(
            "Unknown sync state: {}",
            other
        ))),
    }
}

fn mode_from_parts(name: &str, detail: Option<String>) -> Result<SyncMode, CacheError> {
    let text = detail.unwrap_or_default();
    match name {
        "idle" => Ok(SyncMode::Idle),
        "synchronizing" => Ok(SyncMode::Synchronizing),
        "network_not_connected" => Ok(SyncMode::NetworkNotConnected),
        "client_api_error" => Ok(SyncMode::ClientApiError(text)),
        "non_recoverable_error" => Ok(SyncMode::NonRecoverableError(text)),
        "internal_error" => Ok(SyncMode::InternalError(text)),
        other => Err(CacheError::SerializationError(format!(
            "Unknown sync mode: {}",
            other
        ))),
    }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, CacheError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            CacheError::SerializationError(format!("Failed to parse datetime '{}': {}", s, e))
        })
}

fn from_json<T: serde::de::DeserializeOwned>(column: &str, json: &str) -> Result<T, CacheError> {
    serde_json::from_str(json)
        .map_err(|e| CacheError::SerializationError(format!("Invalid {}: {}", column, e)))
}

fn to_json<T: serde::Serialize>(column: &str, value: &T) -> Result<String, CacheError> {
    serde_json::to_string(value)
        .map_err(|e| CacheError::SerializationError(format!("Cannot encode {}: {}", column, e)))
}

// ============================================================================
// Row mapping functions
// ============================================================================

fn record_from_row(row: &SqliteRow) -> Result<LocalFileRecord, CacheError> {
    let uuid_str: String = row.try_get("uuid")?;
    let uuid = FileUuid::from_str(&uuid_str)
        .map_err(|e| CacheError::SerializationError(e.to_string()))?;

    let local_version: Option<i64> = row.try_get("local_version")?;
    let local_version = local_version
        .map(|v| {
            u32::try_from(v).map_err(|_| {
                CacheError::SerializationError(format!("Version out of range: {}", v))
            })
        })
        .transpose()?;

    let remote_name: Option<String> = row.try_get("remote_name")?;
    let remote_name = remote_name
        .map(RemoteName::new)
        .transpose()
        .map_err(|e| CacheError::SerializationError(e.to_string()))?;

    let sync_state: String = row.try_get("sync_state")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(LocalFileRecord::from_parts(
        uuid,
        local_version,
        row.try_get("mime_type")?,
        remote_name,
        row.try_get("app_file_type")?,
        row.try_get("deleted_on_server")?,
        sync_state_from_string(&sync_state)?,
        parse_datetime(&updated_at)?,
    ))
}

// ============================================================================
// IStateStore implementation
// ============================================================================

impl SqliteStateStore {
    async fn load_snapshot(&self) -> Result<Option<EngineSnapshot>, CacheError> {
        let Some(row) = sqlx::query("SELECT * FROM engine_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let schema_version: i64 = row.try_get("schema_version")?;
        if schema_version > i64::from(SNAPSHOT_SCHEMA_VERSION) {
            return Err(CacheError::SerializationError(format!(
                "State was written by a newer version (schema {})",
                schema_version
            )));
        }

        let mode_name: String = row.try_get("mode")?;
        let mode = mode_from_parts(&mode_name, row.try_get("mode_detail")?)?;
        let queues: OperationQueues = from_json("queues", &row.try_get::<String, _>("queues")?)?;
        let upload = from_json("upload_progress", &row.try_get::<String, _>("upload_progress")?)?;
        let download =
            from_json("download_progress", &row.try_get::<String, _>("download_progress")?)?;
        let saved_at: String = row.try_get("saved_at")?;

        let records = sqlx::query("SELECT * FROM file_records ORDER BY uuid")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(EngineSnapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            mode,
            server_lock_held: row.try_get("server_lock_held")?,
            store: OperationStore::from_parts(records, queues),
            upload,
            download,
            saved_at: parse_datetime(&saved_at)?,
        }))
    }

    async fn save_snapshot(&self, snapshot: &EngineSnapshot) -> Result<(), CacheError> {
        let queues = to_json("queues", snapshot.store.queues())?;
        let upload = to_json("upload_progress", &snapshot.upload)?;
        let download = to_json("download_progress", &snapshot.download)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM file_records")
            .execute(&mut *tx)
            .await?;

        for record in snapshot.store.records() {
            sqlx::query(
                "INSERT INTO file_records \
                 (uuid, local_version, mime_type, remote_name, app_file_type, \
                  deleted_on_server, sync_state, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(record.uuid().to_string())
            .bind(record.local_version().map(i64::from))
            .bind(record.mime_type())
            .bind(record.remote_name().map(|n| n.as_str()))
            .bind(record.app_file_type())
            .bind(record.deleted_on_server())
            .bind(sync_state_to_string(record.sync_state()))
            .bind(record.updated_at().to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT OR REPLACE INTO engine_state \
             (id, schema_version, mode, mode_detail, server_lock_held, \
              queues, upload_progress, download_progress, saved_at) \
             VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(i64::from(SNAPSHOT_SCHEMA_VERSION))
        .bind(snapshot.mode.name())
        .bind(snapshot.mode.detail())
        .bind(snapshot.server_lock_held)
        .bind(&queues)
        .bind(&upload)
        .bind(&download)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::trace!(
            mode = %snapshot.mode,
            records = snapshot.store.records().count(),
            "Saved engine snapshot"
        );
        Ok(())
    }
}

#[async_trait::async_trait]
impl IStateStore for SqliteStateStore {
    async fn load(&self) -> anyhow::Result<Option<EngineSnapshot>> {
        Ok(self.load_snapshot().await?)
    }

    async fn save(&self, snapshot: &EngineSnapshot) -> anyhow::Result<()> {
        Ok(self.save_snapshot(snapshot).await?)
    }

    async fn clear(&self) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.map_err(CacheError::from)?;
        sqlx::query("DELETE FROM file_records")
            .execute(&mut *tx)
            .await
            .map_err(CacheError::from)?;
        sqlx::query("DELETE FROM engine_state")
            .execute(&mut *tx)
            .await
            .map_err(CacheError::from)?;
        tx.commit().await.map_err(CacheError::from)?;

        tracing::info!("Cleared engine state");
        Ok(())
    }
}
