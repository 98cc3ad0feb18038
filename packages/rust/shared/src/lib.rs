//! Shared types, error model, and configuration for crawlbatch.
//!
//! This crate is the foundation depended on by all other crawlbatch crates.
//! It provides:
//! - [`CrawlBatchError`]: the unified error type
//! - Domain types ([`WorkUnit`], [`ResultRecord`], [`JobState`], [`JobId`])
//! - Configuration ([`AppConfig`], [`RunnerConfig`], [`ExecutorConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CheckpointMode, ExecutorConfig, ExecutorSection, RunnerConfig, RunnerSection,
    StorageSection, config_dir, config_file_path, init_config, load_config, load_config_from,
    resolve_db_path,
};
pub use error::{CrawlBatchError, Result};
pub use types::{
    JobDocument, JobId, JobState, JobStatus, JobSummary, ResultRecord, WorkUnit,
};
