use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use batchq::backend::{create_backend, BackendKind};
use batchq::config::ManagerConfig;
use batchq::jobs::{rebundle, JobDir};
use batchq::store::records::{JobSpec, CORES_RESOURCE, WALLTIME_RESOURCE};
use batchq::store::{JobStore, SubmitOrder};
use batchq::Scheduler;

#[derive(Parser, Debug)]
#[command(name = "batchq")]
#[command(version)]
#[command(about = "A persisted job queue and submission manager for HPC batch systems")]
struct Args {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Parser, Debug)]
struct GlobalArgs {
    /// Jobs database (default: <jobs-dir>/jdb.sql)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Directory for per-job scripts, markers and logs
    #[arg(long)]
    jobs_dir: Option<PathBuf>,

    /// Batch system to submit through
    #[arg(long, default_value = "local")]
    backend: BackendArg,

    /// Default submission queue/partition
    #[arg(long)]
    queue: Option<String>,

    /// Default billing account
    #[arg(long)]
    account: Option<String>,

    /// Seconds between consecutive submissions, to avoid submission storms
    #[arg(long)]
    trickle: Option<f64>,

    /// Resize the 'cores' resource limit before doing anything else
    #[arg(long)]
    cores_limit: Option<f64>,

    /// Order in which waiting jobs are considered
    #[arg(long, default_value = "lifo")]
    order: OrderArg,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum BackendArg {
    Slurm,
    Lsf,
    Local,
}

impl BackendArg {
    fn kind(&self) -> BackendKind {
        match self {
            BackendArg::Slurm => BackendKind::Slurm,
            BackendArg::Lsf => BackendKind::Lsf,
            BackendArg::Local => BackendKind::Local,
        }
    }
}

#[derive(Debug, Clone, ValueEnum)]
enum OrderArg {
    Fifo,
    Lifo,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Enqueue one shell job per non-comment line of a script file
    Submit {
        /// File with one job command per line; '#' lines are skipped
        jobfile: PathBuf,

        /// Wall-time request per job in seconds
        #[arg(long)]
        walltime: u64,

        /// Core request per job
        #[arg(long, default_value = "1")]
        cores: u32,
    },

    /// Update status and submit everything admission control allows
    Launch,

    /// Repeatedly update and launch until no job remains in flight
    Cycle {
        /// Seconds between scheduler passes
        #[arg(long, default_value = "15")]
        interval: f64,
    },

    /// Display resource use and job status counts
    Status,

    /// Park all waiting jobs in hold
    Hold,

    /// Return held and unbundled jobs to waiting
    Release,

    /// Delete completed job records and their job directories
    Clear,

    /// Pack eligible short jobs into bundles
    Bundle {
        /// Bundle wall-time ceiling in seconds
        #[arg(long)]
        tmax: f64,

        /// Parallel execution slots per bundle
        #[arg(long, default_value = "1")]
        slots: u32,
    },

    /// Kill backend jobs and mark waiting jobs removed
    Cancel,

    /// Seed a batch of demo jobs
    #[command(hide = true)]
    TestJobs {
        #[arg(default_value = "10")]
        count: usize,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct ResourceUseOutput {
    name: String,
    descrip: String,
    used: f64,
    available: f64,
}

#[derive(Serialize)]
struct StatusCountOutput {
    status: String,
    count: i64,
}

#[derive(Serialize)]
struct StatusOutput {
    resources: Vec<ResourceUseOutput>,
    jobs: Vec<StatusCountOutput>,
}

// =============================================================================
// Helpers
// =============================================================================

fn build_config(global: &GlobalArgs) -> ManagerConfig {
    let mut config = ManagerConfig::default();
    if let Some(dir) = &global.jobs_dir {
        config.jobs_dir = dir.clone();
        config.db_path = dir.join("jdb.sql");
    }
    if let Some(db) = &global.db {
        config.db_path = db.clone();
    }
    config.queue = global.queue.clone();
    config.account = global.account.clone();
    config.trickle = global.trickle;
    config.submit_order = match global.order {
        OrderArg::Fifo => SubmitOrder::Fifo,
        OrderArg::Lifo => SubmitOrder::Lifo,
    };
    config
}

fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let handle = token.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::info!("Shutdown signal received");
        handle.cancel();
    });
    token
}

fn display_status(
    store: &JobStore,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut resources = Vec::new();
    for r in store.resources()? {
        let (available, used) = store.check_use(r.resource_id)?;
        resources.push(ResourceUseOutput {
            name: r.name,
            descrip: r.descrip,
            used,
            available,
        });
    }
    let jobs: Vec<StatusCountOutput> = store
        .status_counts()?
        .into_iter()
        .map(|(status, count)| StatusCountOutput {
            status: status.to_string(),
            count,
        })
        .collect();

    match format {
        OutputFormat::Json => {
            let output = StatusOutput { resources, jobs };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Resources in use:");
            for r in &resources {
                println!("  {} [{}]: {} / {} used", r.name, r.descrip, r.used, r.available);
            }
            println!();
            if jobs.is_empty() {
                println!("No jobs in database.");
            } else {
                println!("Job submission database summary:");
                for j in &jobs {
                    println!("  {:<10} {} jobs", j.status, j.count);
                }
            }
        }
    }
    Ok(())
}

fn enqueue_jobfile(
    store: &mut JobStore,
    config: &ManagerConfig,
    jobfile: &PathBuf,
    walltime: u64,
    cores: u32,
) -> batchq::Result<Vec<i64>> {
    let name = jobfile
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "job".to_string());
    let contents = std::fs::read_to_string(jobfile)?;

    let mut ids = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut spec = JobSpec::shell(name.clone(), line)
            .resource(WALLTIME_RESOURCE, walltime as f64)
            .resource(CORES_RESOURCE, cores as f64);
        if let Some(q) = &config.queue {
            spec = spec.queue(q.clone());
        }
        if let Some(a) = &config.account {
            spec = spec.account(a.clone());
        }
        ids.push(store.create_job(&spec)?);
    }
    Ok(ids)
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = build_config(&args.global);
    let mut store = JobStore::open(&config.db_path)?;

    if let Some(limit) = args.global.cores_limit {
        let rid = store.get_or_create_resource(CORES_RESOURCE, "number of cores", limit)?;
        store.set_resource_limit(rid, limit)?;
        tracing::info!(limit, "Resized cores resource");
    }

    match args.command {
        Commands::Submit {
            jobfile,
            walltime,
            cores,
        } => {
            let ids = enqueue_jobfile(&mut store, &config, &jobfile, walltime, cores)?;
            println!("Enqueued {} jobs from {}", ids.len(), jobfile.display());
        }

        Commands::Launch => {
            let backend = create_backend(args.global.backend.kind());
            let trickle = config.trickle;
            let mut scheduler = Scheduler::new(store, backend, config);
            let submitted = scheduler.update_and_launch(trickle).await?;
            println!("Submitted {} jobs", submitted);
        }

        Commands::Cycle { interval } => {
            let backend = create_backend(args.global.backend.kind());
            let trickle = config.trickle;
            let mut scheduler = Scheduler::new(store, backend, config);
            let shutdown = install_shutdown_handler();
            scheduler
                .cycle_launch(trickle, Duration::from_secs_f64(interval), shutdown)
                .await?;
        }

        Commands::Status => {
            let backend = create_backend(args.global.backend.kind());
            let mut scheduler = Scheduler::new(store, backend, config);
            scheduler.refresh_status().await?;
            display_status(scheduler.store(), &args.global.output)?;
        }

        Commands::Hold => {
            let held = store.hold_waiting()?;
            println!("Held {} waiting jobs", held);
        }

        Commands::Release => {
            let released = store.release_held()? + store.release_unbundled()?;
            println!("Released {} jobs to waiting", released);
        }

        Commands::Clear => {
            let cleared = store.clear_completed()?;
            for job_id in &cleared {
                JobDir::new(&config.jobs_dir, *job_id).remove()?;
            }
            println!("Cleared {} completed jobs", cleared.len());
        }

        Commands::Bundle { tmax, slots } => {
            let bundles = rebundle(
                &mut store,
                tmax,
                slots,
                config.queue.as_deref(),
                config.account.as_deref(),
            )?;
            println!("Created {} bundles", bundles.len());
        }

        Commands::Cancel => {
            let backend = create_backend(args.global.backend.kind());
            let mut scheduler = Scheduler::new(store, backend, config);
            scheduler.cancel_queued().await?;
            println!("Cancellation requested");
        }

        Commands::TestJobs { count } => {
            for i in 0..count {
                // Every fifth job fails, to exercise return-code capture.
                let mut script = format!("echo \"Hello world {}!\"\nsleep 5\necho \"Goodbye!\"", i);
                if (i + 1) % 5 == 0 {
                    script.push_str("\nexit 99");
                }
                let spec = JobSpec::shell("test", script)
                    .resource(WALLTIME_RESOURCE, 300.0)
                    .resource(CORES_RESOURCE, 1.0);
                store.create_job(&spec)?;
            }
            println!("Seeded {} test jobs", count);
        }
    }

    Ok(())
}
