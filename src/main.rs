//! Bench Relay CLI
//!
//! Entry point for the `bench-relay` operator tool.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use bench_relay::broker::SpoolBroker;
use bench_relay::config::RelayConfig;
use bench_relay::dispatch::{DispatchOutcome, EvaluationDispatcher};
use bench_relay::reconcile::{self, Anomaly};
use bench_relay::remote::{RemoteSync, SystemRunner};
use bench_relay::service::{ConsumerPool, DeliveryHandler, PoolConfig};
use bench_relay::signal::{self, SignalState, EXIT_CODE_INTERRUPTED};
use bench_relay::state::{JsonStore, SubmissionStore};
use bench_relay::update::{NoopLeaderboard, UpdateProcessor};
use bench_relay::worker::EvaluationWorker;
use bench_relay::{logging, SubmissionDirectory};
use clap::{Parser, Subcommand};
use relay_protocol::Queue;

#[derive(Parser)]
#[command(name = "bench-relay")]
#[command(about = "Benchmark submission transfer and evaluation dispatch", version)]
struct Cli {
    /// Path to relay config file
    #[arg(long, short = 'c', global = true, default_value = "/etc/bench-relay/relay.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the evaluation worker pool for this host
    Worker {
        /// Execution host to serve (default: `local_host` from config)
        #[arg(long)]
        host: Option<String>,
    },

    /// Run the update processor pool
    Updates,

    /// Show a submission's status and held locks
    Status {
        id: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Remove every lock file of a submission
    Reset { id: String },

    /// Report interrupted evaluations and orphaned locks
    Reconcile {
        /// Mark interrupted evaluations failed
        #[arg(long, conflicts_with = "requeue")]
        fail: bool,

        /// Publish interrupted evaluations again
        #[arg(long)]
        requeue: bool,
    },

    /// Dispatch an uploaded submission to its evaluator
    Dispatch {
        id: String,

        /// Extra evaluator arguments (after --)
        #[arg(last = true)]
        extra: Vec<String>,
    },

    /// Stop a running evaluation
    Cancel { id: String },
}

fn main() {
    let cli = Cli::parse();

    let config = match RelayConfig::load(&cli.config) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("Error loading config {}: {}", cli.config.display(), e);
            process::exit(1);
        }
    };
    logging::init(&config.log);

    let code = match cli.command {
        Commands::Worker { host } => run_worker(config, host),
        Commands::Updates => run_updates(config),
        Commands::Status { id, json } => run_status(&config, &id, json),
        Commands::Reset { id } => run_reset(&config, &id),
        Commands::Reconcile { fail, requeue } => run_reconcile(config, fail, requeue),
        Commands::Dispatch { id, extra } => run_dispatch(config, &id, &extra),
        Commands::Cancel { id } => run_cancel(config, &id),
    };
    process::exit(code);
}

fn open_store(config: &RelayConfig) -> Arc<JsonStore> {
    let evaluators = match config.evaluator_records() {
        Ok(evaluators) => evaluators,
        Err(e) => {
            eprintln!("Error in evaluator config: {}", e);
            process::exit(1);
        }
    };
    match JsonStore::open(config.store_root(), evaluators) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("Error opening store: {}", e);
            process::exit(1);
        }
    }
}

fn open_broker(config: &RelayConfig) -> Arc<SpoolBroker> {
    match SpoolBroker::open(config.spool_root(), config.poll_interval()) {
        Ok(broker) => Arc::new(broker),
        Err(e) => {
            eprintln!("Error opening broker spool: {}", e);
            process::exit(1);
        }
    }
}

fn build_dispatcher(config: &Arc<RelayConfig>) -> EvaluationDispatcher {
    let sync = Arc::new(RemoteSync::new(config.clone(), Arc::new(SystemRunner)));
    EvaluationDispatcher::new(config.clone(), open_store(config), open_broker(config), sync)
}

/// Run a consumer pool until the first interrupt.
fn serve(
    config: &RelayConfig,
    broker: Arc<SpoolBroker>,
    queues: Vec<Queue>,
    handler: impl FnOnce(&SignalState) -> Arc<dyn DeliveryHandler>,
) -> i32 {
    if let Err(e) = broker.recover(&queues) {
        eprintln!("Error recovering in-flight messages: {}", e);
        return 1;
    }

    let signals = Arc::new(SignalState::new());
    if let Err(e) = signal::install(signals.clone()) {
        eprintln!("Failed to install signal handler: {}", e);
        return 1;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start runtime: {}", e);
            return 1;
        }
    };

    let pool = ConsumerPool::new(broker, queues, handler(&signals), PoolConfig::from_config(config));
    let stats = runtime.block_on(pool.run(signals.token()));
    tracing::info!(handled = stats.handled, abandoned = stats.abandoned, "Shut down");

    if signals.is_shutdown_requested() {
        EXIT_CODE_INTERRUPTED
    } else {
        0
    }
}

fn run_worker(config: Arc<RelayConfig>, host: Option<String>) -> i32 {
    let host = host.unwrap_or_else(|| config.local_host.clone());
    if config.host(&host).is_none() {
        eprintln!("Host '{}' is not in the inventory", host);
        return 1;
    }
    let broker = open_broker(&config);
    let queues = vec![Queue::eval(&host), Queue::Echo];
    let kill_grace = config.kill_grace();
    let worker_broker = broker.clone();
    serve(&config, broker, queues, move |signals| {
        let worker: Arc<dyn DeliveryHandler> =
            Arc::new(EvaluationWorker::new(host, worker_broker, signals.token(), kill_grace));
        worker
    })
}

fn run_updates(config: Arc<RelayConfig>) -> i32 {
    let broker = open_broker(&config);
    let store = open_store(&config);
    let sync = Arc::new(RemoteSync::new(config.clone(), Arc::new(SystemRunner)));
    let processor: Arc<dyn DeliveryHandler> = Arc::new(UpdateProcessor::new(
        config.clone(),
        store,
        sync,
        Arc::new(NoopLeaderboard),
    ));
    serve(&config, broker, vec![Queue::Update], move |_| processor)
}

fn run_status(config: &RelayConfig, id: &str, json: bool) -> i32 {
    let store = open_store(config);
    let submission = match store.get_submission(id) {
        Ok(submission) => submission,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let locks: Vec<String> = SubmissionDirectory::open(&config.submission_root, id)
        .map(|dir| dir.held_locks().iter().map(|k| k.to_string()).collect())
        .unwrap_or_default();

    if json {
        let value = serde_json::json!({ "submission": submission, "locks": locks });
        match serde_json::to_string_pretty(&value) {
            Ok(out) => println!("{}", out),
            Err(e) => {
                eprintln!("Error serializing status: {}", e);
                return 1;
            }
        }
    } else {
        println!("{}  {}", submission.id, submission.status);
        println!("  benchmark: {}", submission.benchmark_id);
        println!("  model:     {}", submission.model_id);
        if let Some(evaluator) = &submission.evaluator_id {
            println!("  evaluator: {}", evaluator);
        }
        println!("  updated:   {}", submission.updated_at.to_rfc3339());
        if locks.is_empty() {
            println!("  locks:     (none)");
        } else {
            println!("  locks:     {}", locks.join(", "));
        }
    }
    0
}

fn run_reset(config: &RelayConfig, id: &str) -> i32 {
    match reconcile::reset(&config.submission_root, id) {
        Ok(cleared) if cleared.is_empty() => {
            println!("{}: no locks held", id);
            0
        }
        Ok(cleared) => {
            let names: Vec<String> = cleared.iter().map(|k| k.to_string()).collect();
            println!("{}: cleared {}", id, names.join(", "));
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn run_reconcile(config: Arc<RelayConfig>, fail: bool, requeue: bool) -> i32 {
    let store = open_store(&config);
    let findings = match reconcile::scan(&config.submission_root, store.as_ref()) {
        Ok(findings) => findings,
        Err(e) => {
            eprintln!("Error scanning {}: {}", config.submission_root.display(), e);
            return 1;
        }
    };
    if findings.is_empty() {
        println!("Nothing to reconcile");
        return 0;
    }

    let dispatcher = requeue.then(|| build_dispatcher(&config));
    let mut errors = 0;
    for finding in &findings {
        println!("{}  {}  {}", finding.submission_id, finding.status, finding.anomaly);
        let result = match finding.anomaly {
            Anomaly::Interrupted if fail => {
                reconcile::fail_interrupted(&config.submission_root, store.as_ref(), &finding.submission_id)
                    .map(|()| "marked failed")
            }
            Anomaly::Interrupted => match &dispatcher {
                Some(dispatcher) => reconcile::requeue(dispatcher, &finding.submission_id)
                    .map(|()| "requeued")
                    .map_err(Into::into),
                None => continue,
            },
            Anomaly::OrphanedEvalLock if fail || requeue => {
                reconcile::release_orphan(&config.submission_root, store.as_ref(), &finding.submission_id)
                    .map(|_| "eval lock released")
            }
            Anomaly::OrphanedEvalLock => continue,
        };
        match result {
            Ok(action) => println!("  -> {}", action),
            Err(e) => {
                eprintln!("  -> error: {}", e);
                errors += 1;
            }
        }
    }
    if errors > 0 {
        1
    } else {
        0
    }
}

fn run_dispatch(config: Arc<RelayConfig>, id: &str, extra: &[String]) -> i32 {
    match build_dispatcher(&config).dispatch(id, extra) {
        Ok(DispatchOutcome::Queued(job)) => {
            println!("{}: queued {} on eval.{}", id, job.label, job.host);
            0
        }
        Ok(DispatchOutcome::Skipped(status)) => {
            println!("{}: not dispatched ({})", id, status);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn run_cancel(config: Arc<RelayConfig>, id: &str) -> i32 {
    match build_dispatcher(&config).cancel(id) {
        Ok(queue) => {
            println!("{}: cancel sent on {}", id, queue);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}
