//! Merge and checkpoint persistence.
//!
//! The runner writes each group's full, authoritative result list as one
//! field of the job document. [`load`] rebuilds the accumulated map and
//! derives a checkpoint according to the configured [`CheckpointMode`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, info};

use crawlbatch_shared::{CheckpointMode, CrawlBatchError, JobId, ResultRecord, Result, WorkUnit};
use crawlbatch_storage::Storage;

/// Keyed job store with per-group partial writes.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Replace the stored list for one group. Other groups are untouched.
    async fn set_group_results(
        &self,
        job_id: &JobId,
        group_key: &str,
        records: &[ResultRecord],
    ) -> Result<()>;

    /// Record that a group has been dispatched, whatever its outcome.
    async fn mark_attempted(&self, job_id: &JobId, group_key: &str) -> Result<()>;

    /// All stored result lists for a job.
    async fn load_results(&self, job_id: &JobId) -> Result<BTreeMap<String, Vec<ResultRecord>>>;

    /// Groups carrying an attempted marker.
    async fn load_attempted(&self, job_id: &JobId) -> Result<BTreeSet<String>>;

    /// Drop every stored result list and marker for a job.
    async fn clear_progress(&self, job_id: &JobId) -> Result<()>;
}

#[async_trait]
impl PersistentStore for Storage {
    async fn set_group_results(
        &self,
        job_id: &JobId,
        group_key: &str,
        records: &[ResultRecord],
    ) -> Result<()> {
        Storage::set_group_results(self, &job_id.to_string(), group_key, records).await
    }

    async fn mark_attempted(&self, job_id: &JobId, group_key: &str) -> Result<()> {
        Storage::mark_attempted(self, &job_id.to_string(), group_key).await
    }

    async fn load_results(&self, job_id: &JobId) -> Result<BTreeMap<String, Vec<ResultRecord>>> {
        self.get_results(&job_id.to_string()).await
    }

    async fn load_attempted(&self, job_id: &JobId) -> Result<BTreeSet<String>> {
        self.get_attempted(&job_id.to_string()).await
    }

    async fn clear_progress(&self, job_id: &JobId) -> Result<()> {
        Storage::clear_progress(self, &job_id.to_string()).await
    }
}

// ---------------------------------------------------------------------------
// In-process store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryJob {
    results: BTreeMap<String, Vec<ResultRecord>>,
    attempted: BTreeSet<String>,
}

/// Non-durable [`PersistentStore`] kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: Mutex<BTreeMap<String, MemoryJob>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_job<T>(&self, job_id: &JobId, f: impl FnOnce(&mut MemoryJob) -> T) -> Result<T> {
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|_| CrawlBatchError::Storage("memory store lock poisoned".into()))?;
        Ok(f(jobs.entry(job_id.to_string()).or_default()))
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn set_group_results(
        &self,
        job_id: &JobId,
        group_key: &str,
        records: &[ResultRecord],
    ) -> Result<()> {
        self.with_job(job_id, |job| {
            job.results.insert(group_key.to_string(), records.to_vec());
        })
    }

    async fn mark_attempted(&self, job_id: &JobId, group_key: &str) -> Result<()> {
        self.with_job(job_id, |job| {
            job.attempted.insert(group_key.to_string());
        })
    }

    async fn load_results(&self, job_id: &JobId) -> Result<BTreeMap<String, Vec<ResultRecord>>> {
        self.with_job(job_id, |job| job.results.clone())
    }

    async fn load_attempted(&self, job_id: &JobId) -> Result<BTreeSet<String>> {
        self.with_job(job_id, |job| job.attempted.clone())
    }

    async fn clear_progress(&self, job_id: &JobId) -> Result<()> {
        self.with_job(job_id, |job| *job = MemoryJob::default())
    }
}

// ---------------------------------------------------------------------------
// Merge / load
// ---------------------------------------------------------------------------

/// Write the current authoritative list for `group_key`.
///
/// This is a set, not an append: calling it twice with the same list leaves
/// the same stored value.
pub async fn merge(
    store: &dyn PersistentStore,
    job_id: &JobId,
    group_key: &str,
    records: &[ResultRecord],
) -> Result<()> {
    store.set_group_results(job_id, group_key, records).await?;
    debug!(group = group_key, records = records.len(), "group results persisted");
    Ok(())
}

/// Discard a job's stored progress ahead of a from-scratch run.
///
/// The runner itself never deletes; callers that restart a job from zero
/// clear the store first so a later [`load`] sees only the new run.
pub async fn reset(store: &dyn PersistentStore, job_id: &JobId) -> Result<()> {
    store.clear_progress(job_id).await?;
    info!(%job_id, "cleared stored progress");
    Ok(())
}

/// State recovered from the store for a resumed job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedState {
    pub accumulated: BTreeMap<String, Vec<ResultRecord>>,
    pub checkpoint: usize,
}

/// Reload a job's accumulated results and derive its checkpoint.
pub async fn load(
    store: &dyn PersistentStore,
    job_id: &JobId,
    units: &[WorkUnit],
    mode: CheckpointMode,
) -> Result<LoadedState> {
    let accumulated = store.load_results(job_id).await?;

    let checkpoint = match mode {
        CheckpointMode::KeyCount => accumulated.len().min(units.len()),
        CheckpointMode::AttemptedMarker => {
            let attempted = store.load_attempted(job_id).await?;
            units
                .iter()
                .take_while(|u| attempted.contains(&u.group_key))
                .count()
        }
    };

    info!(
        %job_id,
        groups = accumulated.len(),
        checkpoint,
        total = units.len(),
        mode = %mode,
        "restored job state"
    );

    Ok(LoadedState {
        accumulated,
        checkpoint,
    })
}
