use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use predqd::collect::ResultCollector;
use predqd::config::QdConfig;
use predqd::dispatch::Dispatcher;
use predqd::error::QdError;
use predqd::joblog::QueueScheduler;
use predqd::lock::JobLock;
use predqd::nodes::NodePool;
use predqd::rpc::GrpcConnector;
use predqd::store::{CacheStore, Tag, TaskStore};

#[derive(Parser, Debug)]
#[command(name = "predqd")]
#[command(version)]
#[command(about = "Queue daemon for a sequence-prediction web service")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, short = 'c')]
    config: PathBuf,

    /// Run a single pass and exit (for cron-style drivers)
    #[arg(long)]
    once: bool,

    /// Seconds between passes when looping
    #[arg(long, default_value = "30")]
    interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let cfg = QdConfig::load(&args.config)?;
    let cache = CacheStore::new(cfg.cache_root.clone());
    let connector = GrpcConnector::new(Duration::from_secs(cfg.rpc_timeout_secs));

    tracing::info!(server = %cfg.server, nodes = cfg.nodes.len(), "predqd starting");

    let mut pass_index: u64 = 0;
    loop {
        if let Err(e) = run_pass(&cfg, &cache, &connector, pass_index).await {
            tracing::error!(pass = pass_index, error = %e, "Scheduling pass failed");
        }
        if args.once {
            break;
        }
        tokio::time::sleep(Duration::from_secs(args.interval_secs)).await;
        pass_index += 1;
    }
    Ok(())
}

/// One full pass: refresh the global priority view, then dispatch and
/// collect every open job in priority order. Each job runs under its
/// advisory lock; a busy lock skips the job rather than waiting.
async fn run_pass(
    cfg: &QdConfig,
    cache: &CacheStore,
    connector: &GrpcConnector,
    pass_index: u64,
) -> predqd::error::Result<()> {
    let scheduler = QueueScheduler::new(cfg);
    let records = scheduler.create_run_joblog(pass_index)?;
    if records.is_empty() {
        return Ok(());
    }

    // One pool per pass: capacity and offline flags are shared across all
    // jobs in the pass and reset at the next one.
    let mut pool = NodePool::from_config(&cfg.nodes);
    pool.begin_pass();
    let dispatcher = Dispatcher::new(cfg, cache, connector);
    let collector = ResultCollector::new(cfg, cache, connector);

    for record in &records {
        let job_dir = cfg.job_dir(&record.job_id);
        let _lock = match JobLock::acquire(&job_dir, "runjob.lock") {
            Ok(lock) => lock,
            Err(QdError::LockBusy(_)) => {
                tracing::debug!(job_id = %record.job_id, "Job locked by another worker, skipping");
                continue;
            }
            Err(e) => {
                tracing::warn!(job_id = %record.job_id, error = %e, "Could not lock job");
                continue;
            }
        };

        if let Err(e) = dispatcher
            .submit_job(&record.job_id, &mut pool, record.user_total)
            .await
        {
            tracing::warn!(job_id = %record.job_id, error = %e, "Dispatch failed");
            continue;
        }

        let store = TaskStore::open(&job_dir);
        if store.has_tag(Tag::Initialized) {
            if let Err(e) = collector.collect(&record.job_id).await {
                tracing::warn!(job_id = %record.job_id, error = %e, "Collection failed");
                continue;
            }
            if let Err(e) = collector.finalize_job(&record.job_id) {
                tracing::warn!(job_id = %record.job_id, error = %e, "Finalize failed");
            }
        }
    }
    Ok(())
}
