//! CLI command definitions, routing, and tracing setup.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use crawlbatch_core::{
    EXPORT_HEADER, JobContext, JobRunner, PersistentStore, ProgressObserver, export_rows,
    normalize_rows, reset,
};
use crawlbatch_executor::HttpExecutor;
use crawlbatch_shared::{
    AppConfig, CheckpointMode, ExecutorConfig, JobDocument, JobId, JobStatus, RunnerConfig,
    init_config, load_config, resolve_db_path,
};
use crawlbatch_storage::Storage;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// crawlbatch: run keyword crawls in resumable batches.
#[derive(Parser)]
#[command(
    name = "crawlbatch",
    version,
    about = "Run keyword/blog crawl jobs against a remote service with pause and resume.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Database path (overrides `storage.db_path`).
    #[arg(long, global = true, env = "CRAWLBATCH_DB")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Import a two-column CSV (keyword, blog id) as a new job.
    Import {
        /// CSV file. The first row is treated as a header.
        path: PathBuf,

        /// Display name for the job (defaults to the file name).
        #[arg(short, long)]
        name: Option<String>,
    },

    /// List imported jobs, newest first.
    Jobs,

    /// Delete a job and everything stored for it.
    Delete {
        /// Job ID.
        job: String,
    },

    /// Run a job, resuming from its stored progress.
    Run {
        /// Job ID.
        job: String,

        /// Discard stored progress and start from the first keyword.
        #[arg(long)]
        from_scratch: bool,

        /// Crawl service base URL (overrides config and environment).
        #[arg(long)]
        base_url: Option<String>,

        /// Delay between keywords in ms.
        #[arg(long)]
        pacing_ms: Option<u64>,

        /// Extra attempts per failed keyword.
        #[arg(long)]
        max_retries: Option<u32>,

        /// How stored progress maps to a checkpoint: key-count or attempted-marker.
        #[arg(long)]
        checkpoint_mode: Option<CheckpointMode>,
    },

    /// Show a job's progress.
    Status {
        /// Job ID.
        job: String,
    },

    /// Export a job's results as CSV.
    Export {
        /// Job ID.
        job: String,

        /// Output file (defaults to stdout).
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

/// Flag overrides for `run`.
struct RunOverrides {
    base_url: Option<String>,
    pacing_ms: Option<u64>,
    max_retries: Option<u32>,
    checkpoint_mode: Option<CheckpointMode>,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "crawlbatch=info",
        1 => "crawlbatch=debug",
        _ => "crawlbatch=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let db = cli.db.as_deref();
    match cli.command {
        Command::Import { path, name } => cmd_import(db, &path, name.as_deref()).await,
        Command::Jobs => cmd_jobs(db).await,
        Command::Delete { job } => cmd_delete(db, &job).await,
        Command::Run {
            job,
            from_scratch,
            base_url,
            pacing_ms,
            max_retries,
            checkpoint_mode,
        } => {
            let overrides = RunOverrides {
                base_url,
                pacing_ms,
                max_retries,
                checkpoint_mode,
            };
            cmd_run(db, &job, from_scratch, overrides).await
        }
        Command::Status { job } => cmd_status(db, &job).await,
        Command::Export { job, out } => cmd_export(db, &job, out.as_deref()).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn db_path(flag: Option<&Path>, config: &AppConfig) -> Result<PathBuf> {
    match flag {
        Some(p) => Ok(p.to_path_buf()),
        None => Ok(resolve_db_path(config)?),
    }
}

async fn open_storage(flag: Option<&Path>, config: &AppConfig) -> Result<Storage> {
    let path = db_path(flag, config)?;
    Storage::open(&path)
        .await
        .wrap_err_with(|| format!("failed to open database at {}", path.display()))
}

/// Read-only handle for views; refuses to create a database that is not there.
async fn open_storage_readonly(flag: Option<&Path>, config: &AppConfig) -> Result<Storage> {
    let path = db_path(flag, config)?;
    if !path.exists() {
        return Err(eyre!(
            "no database at {}: import a job first",
            path.display()
        ));
    }
    Ok(Storage::open_readonly(&path).await?)
}

async fn fetch_job(storage: &Storage, id: &str) -> Result<JobDocument> {
    storage
        .get_job(id)
        .await?
        .ok_or_else(|| eyre!("job '{id}' not found (see `crawlbatch jobs`)"))
}

/// Read every CSV record as a row of cells.
///
/// Widths may vary between rows. Trailing empty cells are dropped so a
/// spreadsheet export with padding columns still yields two-cell rows.
fn read_rows(path: &Path) -> Result<Vec<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .wrap_err_with(|| format!("failed to open {}", path.display()))?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.wrap_err_with(|| format!("failed to read {}", path.display()))?;
        let mut row: Vec<String> = record.iter().map(|c| c.trim().to_string()).collect();
        while row.last().is_some_and(|c| c.is_empty()) {
            row.pop();
        }
        rows.push(row);
    }
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_import(db: Option<&Path>, path: &Path, name: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let rows = read_rows(path)?;
    let units = normalize_rows(&rows);
    if units.is_empty() {
        warn!(path = %path.display(), "no valid keyword/blog rows found");
    }

    let file_name = name.map(String::from).unwrap_or_else(|| {
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string())
    });

    let doc = JobDocument {
        id: JobId::new().to_string(),
        file_name: file_name.clone(),
        created_at: Utc::now(),
        rows,
    };

    let storage = open_storage(db, &config).await?;
    storage.insert_job(&doc).await?;

    info!(job_id = %doc.id, file_name = %file_name, keywords = units.len(), "job imported");

    println!();
    println!("  Job imported.");
    println!("  ID:       {}", doc.id);
    println!("  Name:     {file_name}");
    println!("  Rows:     {}", doc.rows.len().saturating_sub(1));
    println!("  Keywords: {}", units.len());
    println!();

    Ok(())
}

async fn cmd_jobs(db: Option<&Path>) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(db, &config).await?;
    let jobs = storage.list_jobs().await?;

    if jobs.is_empty() {
        println!("No jobs. Import one with `crawlbatch import <file.csv>`.");
        return Ok(());
    }

    println!("{:<36}  {:<20}  NAME", "ID", "IMPORTED");
    for job in jobs {
        println!(
            "{:<36}  {:<20}  {}",
            job.id,
            job.timestamp.format("%Y-%m-%d %H:%M:%S"),
            job.file_name
        );
    }
    Ok(())
}

async fn cmd_delete(db: Option<&Path>, job: &str) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(db, &config).await?;
    if !storage.delete_job(job).await? {
        return Err(eyre!("job '{job}' not found"));
    }
    info!(job_id = job, "job deleted");
    println!("Deleted job {job}.");
    Ok(())
}

async fn cmd_run(
    db: Option<&Path>,
    job: &str,
    from_scratch: bool,
    overrides: RunOverrides,
) -> Result<()> {
    let config = load_config()?;

    let mut executor_config = ExecutorConfig::from(&config);
    if let Some(url) = overrides.base_url {
        executor_config.base_url = url;
    }
    let mut runner_config = RunnerConfig::from(&config);
    if let Some(ms) = overrides.pacing_ms {
        runner_config.pacing = std::time::Duration::from_millis(ms);
    }
    if let Some(n) = overrides.max_retries {
        runner_config.max_retries = n;
    }
    if let Some(mode) = overrides.checkpoint_mode {
        runner_config.checkpoint_mode = mode;
    }

    let storage = Arc::new(open_storage(db, &config).await?);
    let doc = fetch_job(&storage, job).await?;

    let mut ctx = JobContext::from_document(&doc)?;
    if from_scratch {
        reset(&*storage, &ctx.job_id).await?;
    } else {
        ctx = ctx
            .restore(&*storage, runner_config.checkpoint_mode)
            .await?;
        if ctx.state.status == JobStatus::Completed {
            println!(
                "Job {job} already completed ({} keywords). Use --from-scratch to run it again.",
                ctx.total()
            );
            return Ok(());
        }
    }

    let executor = HttpExecutor::new(&executor_config)?;
    info!(
        job_id = job,
        endpoint = %executor.endpoint(),
        checkpoint = ctx.state.checkpoint,
        total = ctx.total(),
        "running job"
    );

    let progress = Arc::new(CliProgress::new(ctx.percent()));
    let store: Arc<dyn PersistentStore> = storage;
    let runner = JobRunner::new(
        Arc::new(executor),
        store,
        progress.clone(),
        runner_config,
    );

    let stop = runner.stop_signal();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, pausing after the current keyword");
            stop.request_stop();
        }
    });

    let result = runner.start(ctx, from_scratch).await;
    ctrl_c.abort();
    progress.finish();
    let (ctx, report) = result?;

    println!();
    match ctx.state.status {
        JobStatus::Completed => println!("  Job completed."),
        JobStatus::Paused => println!("  Job paused. Run the same command to resume."),
        other => println!("  Job stopped in state {other}."),
    }
    println!("  ID:          {}", ctx.job_id);
    println!("  Progress:    {}/{}", ctx.state.checkpoint, ctx.total());
    println!("  Dispatched:  {}", report.dispatched);
    println!("  Succeeded:   {}", report.succeeded);
    println!("  Failed:      {}", report.failed.len());
    println!("  Records:     {}", report.records_added);
    if report.persist_failures > 0 {
        println!("  Unsaved:     {} (see log)", report.persist_failures);
    }
    println!("  Time:        {:.1}s", report.elapsed.as_secs_f64());
    for (group, error) in &report.failed {
        println!("    ✗ {group}: {error}");
    }
    println!();

    Ok(())
}

async fn cmd_status(db: Option<&Path>, job: &str) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage_readonly(db, &config).await?;
    let doc = fetch_job(&storage, job).await?;

    let ctx = JobContext::from_document(&doc)?
        .restore(&storage, config.runner.checkpoint_mode)
        .await?;

    println!();
    println!("  ID:          {}", ctx.job_id);
    println!("  Name:        {}", ctx.file_name);
    println!("  Imported:    {}", doc.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Status:      {}", ctx.state.status);
    println!(
        "  Progress:    {}/{} ({:.2}%)",
        ctx.state.checkpoint,
        ctx.total(),
        ctx.percent()
    );
    println!("  With results: {}", ctx.state.accumulated.len());
    println!("  Records:     {}", ctx.state.record_count());
    println!();

    Ok(())
}

async fn cmd_export(db: Option<&Path>, job: &str, out: Option<&Path>) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage_readonly(db, &config).await?;
    let doc = fetch_job(&storage, job).await?;
    let accumulated = storage.get_results(&doc.id).await?;

    let rows = export_rows(&doc.rows, &accumulated);

    let sink: Box<dyn Write> = match out {
        Some(path) => Box::new(
            std::fs::File::create(path)
                .wrap_err_with(|| format!("failed to create {}", path.display()))?,
        ),
        None => Box::new(std::io::stdout().lock()),
    };
    let mut writer = csv::Writer::from_writer(sink);
    if rows.is_empty() {
        // serialize() only emits the header alongside the first row
        writer.write_record(EXPORT_HEADER)?;
    }
    for row in &rows {
        writer.serialize(row)?;
    }
    writer.flush()?;

    info!(job_id = job, rows = rows.len(), "results exported");
    if let Some(path) = out {
        println!("Exported {} rows to {}", rows.len(), path.display());
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Percent bar with the current keyword as its message.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new(start_percent: f64) -> Self {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.set_position(start_percent.floor() as u64);
        bar.enable_steady_tick(std::time::Duration::from_millis(100));
        Self { bar }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressObserver for CliProgress {
    fn on_progress(&self, current_group: &str, percent: f64) {
        self.bar.set_position(percent.floor() as u64);
        self.bar.set_message(current_group.to_string());
    }
}
