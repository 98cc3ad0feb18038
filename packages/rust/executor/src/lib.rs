//! Remote executor seam and its HTTP implementation.
//!
//! This crate provides:
//! - [`RemoteExecutor`]: dispatches one [`WorkUnit`] and returns its records
//! - [`HttpExecutor`]: JSON-over-HTTP client for the remote crawl service

pub mod http;

use async_trait::async_trait;
use crawlbatch_shared::{ResultRecord, Result, WorkUnit};

pub use http::{CRAWL_PATH, CrawlRequest, HttpExecutor};

/// Performs the per-group computation for one work unit.
///
/// Implementations return the records in the order the service produced
/// them, or an error for timeouts and non-success responses. They must not
/// retry on their own; retry policy belongs to the caller.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(&self, unit: &WorkUnit) -> Result<Vec<ResultRecord>>;
}
