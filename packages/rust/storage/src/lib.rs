//! Turso Embedded / libSQL job store.
//!
//! The [`Storage`] struct wraps a libSQL database holding imported jobs, the
//! per-group result lists accumulated by the runner, and optional
//! per-group attempted markers.
//!
//! Results are stored one row per `(job_id, group_key)`, so writing one
//! group's list never touches another group's row.

mod migrations;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use crawlbatch_shared::{CrawlBatchError, JobDocument, JobSummary, ResultRecord, Result};
use libsql::{Connection, Database, params};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

fn storage_err(e: impl std::fmt::Display) -> CrawlBatchError {
    CrawlBatchError::Storage(e.to_string())
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CrawlBatchError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode (status and export views).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        CrawlBatchError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(CrawlBatchError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Job documents
    // -----------------------------------------------------------------------

    /// Store an imported job with its raw rows.
    pub async fn insert_job(&self, job: &JobDocument) -> Result<()> {
        self.check_writable()?;
        let rows_json = serde_json::to_string(&job.rows)?;
        self.conn
            .execute(
                "INSERT INTO jobs (id, file_name, created_at, rows_json) VALUES (?1, ?2, ?3, ?4)",
                params![
                    job.id.as_str(),
                    job.file_name.as_str(),
                    job.created_at.to_rfc3339(),
                    rows_json
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Get a job document by ID.
    pub async fn get_job(&self, id: &str) -> Result<Option<JobDocument>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, file_name, created_at, rows_json FROM jobs WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => {
                let rows_json: String = row.get(3).map_err(storage_err)?;
                Ok(Some(JobDocument {
                    id: row.get::<String>(0).map_err(storage_err)?,
                    file_name: row.get::<String>(1).map_err(storage_err)?,
                    created_at: parse_timestamp(&row.get::<String>(2).map_err(storage_err)?)?,
                    rows: serde_json::from_str(&rows_json)?,
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// List job summaries, most recent first.
    pub async fn list_jobs(&self) -> Result<Vec<JobSummary>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, file_name, created_at FROM jobs ORDER BY created_at DESC, id DESC",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(JobSummary {
                id: row.get::<String>(0).map_err(storage_err)?,
                file_name: row.get::<String>(1).map_err(storage_err)?,
                timestamp: parse_timestamp(&row.get::<String>(2).map_err(storage_err)?)?,
            });
        }
        Ok(results)
    }

    /// Delete a job together with its results and markers.
    /// Returns `false` if no such job existed.
    pub async fn delete_job(&self, id: &str) -> Result<bool> {
        self.clear_progress(id).await?;
        let deleted = self
            .conn
            .execute("DELETE FROM jobs WHERE id = ?1", params![id])
            .await
            .map_err(storage_err)?;
        Ok(deleted > 0)
    }

    /// Drop a job's stored results and attempted markers, keeping the job.
    ///
    /// Called before a from-scratch run so a later restore cannot count
    /// groups from the discarded run.
    pub async fn clear_progress(&self, job_id: &str) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute("DELETE FROM job_results WHERE job_id = ?1", params![job_id])
            .await
            .map_err(storage_err)?;
        self.conn
            .execute("DELETE FROM job_attempts WHERE job_id = ?1", params![job_id])
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Per-group results
    // -----------------------------------------------------------------------

    /// Set the full result list for one group (last write wins).
    pub async fn set_group_results(
        &self,
        job_id: &str,
        group_key: &str,
        records: &[ResultRecord],
    ) -> Result<()> {
        self.check_writable()?;
        let records_json = serde_json::to_string(records)?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO job_results (job_id, group_key, records_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(job_id, group_key) DO UPDATE SET
                   records_json = excluded.records_json,
                   updated_at = excluded.updated_at",
                params![job_id, group_key, records_json, now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Read all stored result lists for a job, keyed by group.
    pub async fn get_results(&self, job_id: &str) -> Result<BTreeMap<String, Vec<ResultRecord>>> {
        let mut rows = self
            .conn
            .query(
                "SELECT group_key, records_json FROM job_results WHERE job_id = ?1",
                params![job_id],
            )
            .await
            .map_err(storage_err)?;

        let mut results = BTreeMap::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let group_key: String = row.get(0).map_err(storage_err)?;
            let json: String = row.get(1).map_err(storage_err)?;
            results.insert(group_key, serde_json::from_str(&json)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Attempted markers
    // -----------------------------------------------------------------------

    /// Record that a group has been dispatched (idempotent).
    pub async fn mark_attempted(&self, job_id: &str, group_key: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO job_attempts (job_id, group_key, attempted_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(job_id, group_key) DO UPDATE SET attempted_at = excluded.attempted_at",
                params![job_id, group_key, now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Group keys carrying an attempted marker.
    pub async fn get_attempted(&self, job_id: &str) -> Result<BTreeSet<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT group_key FROM job_attempts WHERE job_id = ?1",
                params![job_id],
            )
            .await
            .map_err(storage_err)?;

        let mut keys = BTreeSet::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            keys.insert(row.get::<String>(0).map_err(storage_err)?);
        }
        Ok(keys)
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CrawlBatchError::Storage(format!("invalid date: {e}")))
}
