use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::{
    ApiCallRecord, AuditLogPage, CheckpointStatus, CheckpointStore, CheckpointSummary,
    ProjectCheckpoint, SessionCheckpoint,
};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// SQLite-backed checkpoint store
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a file-backed store and run migrations.
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// In-memory store for tests and dry runs.
    ///
    /// Pinned to one connection that never expires: every SQLite
    /// in-memory connection is its own database.
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| {
            StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            }
        })?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }
}

fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[async_trait]
impl CheckpointStore for SqliteStorage {
    async fn append_api_call_log(
        &self,
        session_id: &str,
        record: &ApiCallRecord,
    ) -> StorageResult<()> {
        let body = serde_json::to_string(record)?;

        sqlx::query(
            r#"
            INSERT INTO api_call_log (session_id, call_id, record, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(&record.call_id)
        .bind(&body)
        .bind(timestamp_now())
        .execute(&self.pool)
        .await?;

        debug!(session_id = %session_id, call_id = %record.call_id, "Appended audit record");
        Ok(())
    }

    async fn get_api_call_log(&self, session_id: &str) -> StorageResult<Vec<ApiCallRecord>> {
        let rows: Vec<ApiCallRow> = sqlx::query_as(
            r#"
            SELECT record
            FROM api_call_log
            WHERE session_id = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ApiCallRecord::try_from).collect()
    }

    async fn get_api_call_log_page(
        &self,
        session_id: &str,
        offset: u64,
        limit: u64,
    ) -> StorageResult<AuditLogPage> {
        let (total,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM api_call_log WHERE session_id = ?")
                .bind(session_id)
                .fetch_one(&self.pool)
                .await?;

        let rows: Vec<ApiCallRow> = sqlx::query_as(
            r#"
            SELECT record
            FROM api_call_log
            WHERE session_id = ?
            ORDER BY seq ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(session_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let records = rows
            .into_iter()
            .map(ApiCallRecord::try_from)
            .collect::<StorageResult<Vec<_>>>()?;

        Ok(AuditLogPage {
            session_id: session_id.to_string(),
            records,
            total: total.max(0) as u64,
            offset,
            limit,
        })
    }

    async fn store_checkpoint(
        &self,
        session_id: &str,
        snapshot: &SessionCheckpoint,
    ) -> StorageResult<()> {
        let body = serde_json::to_string(snapshot)?;

        // Single-statement upsert: readers see the old row or the new one.
        sqlx::query(
            r#"
            INSERT INTO session_checkpoints
                (session_id, scenario_id, status, proposition, api_call_count,
                 total_cost_usd, snapshot, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                scenario_id = excluded.scenario_id,
                status = excluded.status,
                proposition = excluded.proposition,
                api_call_count = excluded.api_call_count,
                total_cost_usd = excluded.total_cost_usd,
                snapshot = excluded.snapshot,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(session_id)
        .bind(&snapshot.scenario_id)
        .bind(snapshot.status.as_str())
        .bind(&snapshot.proposition)
        .bind(snapshot.api_call_count as i64)
        .bind(snapshot.cost_summary.total_cost_usd)
        .bind(&body)
        .bind(
            snapshot
                .updated_at
                .to_rfc3339_opts(SecondsFormat::Micros, true),
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn retrieve_checkpoint(
        &self,
        session_id: &str,
    ) -> StorageResult<Option<SessionCheckpoint>> {
        self.retrieve_checkpoint_raw(session_id)
            .await?
            .map(|raw| serde_json::from_str(&raw).map_err(StorageError::from))
            .transpose()
    }

    async fn retrieve_checkpoint_raw(&self, session_id: &str) -> StorageResult<Option<String>> {
        let row: Option<SnapshotRow> =
            sqlx::query_as("SELECT snapshot FROM session_checkpoints WHERE session_id = ?")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|r| r.snapshot))
    }

    async fn list_checkpoints(
        &self,
        status: Option<CheckpointStatus>,
    ) -> StorageResult<Vec<CheckpointSummary>> {
        let rows: Vec<SnapshotRow> = sqlx::query_as(
            r#"
            SELECT snapshot
            FROM session_checkpoints
            WHERE (?1 IS NULL OR status = ?1)
            ORDER BY updated_at DESC, session_id ASC
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> StorageResult<CheckpointSummary> {
                let snapshot: SessionCheckpoint = serde_json::from_str(&row.snapshot)?;
                Ok(snapshot.summary())
            })
            .collect()
    }

    async fn store_project_checkpoint(&self, project: &ProjectCheckpoint) -> StorageResult<()> {
        let body = serde_json::to_string(project)?;

        sqlx::query(
            r#"
            INSERT INTO project_checkpoints (project_path, snapshot, last_updated)
            VALUES (?, ?, ?)
            ON CONFLICT(project_path) DO UPDATE SET
                snapshot = excluded.snapshot,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(&project.project_path)
        .bind(&body)
        .bind(
            project
                .last_updated
                .to_rfc3339_opts(SecondsFormat::Micros, true),
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn retrieve_project_checkpoint(
        &self,
        project_path: &str,
    ) -> StorageResult<Option<ProjectCheckpoint>> {
        let row: Option<SnapshotRow> =
            sqlx::query_as("SELECT snapshot FROM project_checkpoints WHERE project_path = ?")
                .bind(project_path)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|r| serde_json::from_str(&r.snapshot).map_err(StorageError::from))
            .transpose()
    }
}

// Internal row types for SQLx mapping

#[derive(sqlx::FromRow)]
struct ApiCallRow {
    record: String,
}

impl TryFrom<ApiCallRow> for ApiCallRecord {
    type Error = StorageError;

    fn try_from(row: ApiCallRow) -> Result<Self, Self::Error> {
        Ok(serde_json::from_str(&row.record)?)
    }
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    snapshot: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_store_persists_across_queries() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        let snapshot = SessionCheckpoint::new("s1", "P", serde_json::json!({}));

        storage
            .store_checkpoint(&snapshot.analysis_id, &snapshot)
            .await
            .unwrap();

        let loaded = storage
            .retrieve_checkpoint(&snapshot.analysis_id)
            .await
            .unwrap();
        assert_eq!(loaded, Some(snapshot));
    }

    #[tokio::test]
    async fn test_missing_checkpoint_is_none() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        assert!(storage.retrieve_checkpoint("nope").await.unwrap().is_none());
        assert!(storage.get_api_call_log("nope").await.unwrap().is_empty());
    }
}
