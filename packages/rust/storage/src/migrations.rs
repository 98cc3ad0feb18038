//! SQL migration definitions for the crawlbatch job store.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: jobs, job_results",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Imported jobs (raw rows kept as uploaded)
CREATE TABLE IF NOT EXISTS jobs (
    id         TEXT PRIMARY KEY,
    file_name  TEXT NOT NULL,
    created_at TEXT NOT NULL,
    rows_json  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);

-- Accumulated results, one field per group key
CREATE TABLE IF NOT EXISTS job_results (
    job_id       TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    group_key    TEXT NOT NULL,
    records_json TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    PRIMARY KEY (job_id, group_key)
);

INSERT OR IGNORE INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Attempted markers per group",
            sql: r#"
CREATE TABLE IF NOT EXISTS job_attempts (
    job_id       TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    group_key    TEXT NOT NULL,
    attempted_at TEXT NOT NULL,
    PRIMARY KEY (job_id, group_key)
);

INSERT OR IGNORE INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
