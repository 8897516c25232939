//! WolfFailover - Heartbeat Leader Election with a Synchronized Work Queue
//!
//! Runs a managed failover peer with a demo worker, and inspects the
//! heartbeat store and configuration.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use failover::config::{FailoverConfig, LoggingConfig};
use failover::error::{Error, Result};
use failover::queue::{ManagedFailover, TaskKey, Worker};
use failover::state::{origin_name, Event};
use failover::store::{Backend, HeartbeatStore};

/// WolfFailover - heartbeat leader election with a synchronized work queue
#[derive(Parser)]
#[command(name = "failover")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "failover.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error), overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a managed peer with the demo worker
    Run {
        /// Override a state interval, e.g. `master=1000` (repeatable)
        #[arg(short, long = "interval", value_name = "STATE=MS")]
        intervals: Vec<String>,

        /// Replace the store tests with deterministic counters
        #[arg(long)]
        test_mode: bool,
    },

    /// Print the current heartbeat record of the election group
    Status,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "failover.toml")]
        output: PathBuf,

        /// Election group name
        #[arg(long, default_value = "failover")]
        name: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The config file may not exist yet (init), fall back to defaults
    let logging = FailoverConfig::from_file(&cli.config)
        .map(|config| config.logging)
        .unwrap_or_default();
    let level = cli.log_level.clone().unwrap_or_else(|| logging.level.clone());
    init_logging(&level, &logging);

    match cli.command {
        Commands::Run { intervals, test_mode } => run_peer(cli.config, intervals, test_mode).await,
        Commands::Status => run_status(cli.config).await,
        Commands::Init { output, name } => run_init(output, name),
        Commands::Validate => run_validate(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().pretty()).init();
    }
}

/// Demo task, keyed by the second it was submitted in
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DemoTask {
    id: i64,
    submitted_at: DateTime<Utc>,
}

/// Demo worker rejecting every n-th task after a delay
struct DemoWorker {
    reject_every: u64,
    reject_delay: Duration,
    calls: AtomicU64,
}

#[async_trait]
impl Worker<DemoTask> for DemoWorker {
    async fn work(&self, task: DemoTask) -> Result<bool> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.reject_every > 0 && call % self.reject_every == 0 {
            tracing::info!("Rejecting task {} in {:?}", task.id, self.reject_delay);
            tokio::time::sleep(self.reject_delay).await;
            return Ok(false);
        }

        tracing::info!("Processed task {} submitted at {}", task.id, task.submitted_at);
        Ok(true)
    }
}

/// Run a managed peer until interrupted
async fn run_peer(config_path: PathBuf, overrides: Vec<String>, test_mode: bool) -> Result<()> {
    let mut config = match FailoverConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Create one with: failover init --output {}", config_path.display());
            return Err(e);
        }
    };

    for entry in &overrides {
        config.intervals.apply_override(entry)?;
    }
    config.election.test_mode |= test_mode;
    config.validate()?;

    tracing::info!(
        "Starting peer {} in election group {}",
        config.election.member,
        config.election.name
    );

    let worker = DemoWorker {
        reject_every: config.demo.reject_every,
        reject_delay: config.demo.reject_delay(),
        calls: AtomicU64::new(0),
    };
    let managed = Arc::new(ManagedFailover::from_config(&config, TaskKey::field("id"), worker)?);

    // Log every event the peer emits
    let mut events = managed.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event log skipped {} events", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Submit a demo task periodically on every peer
    let submitter = Arc::clone(&managed);
    let submit_every = config.demo.submit_every();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(submit_every);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            submitter.submit_work(DemoTask {
                id: now.timestamp(),
                submitted_at: now,
            });
        }
    });

    tokio::select! {
        result = managed.run() => {
            if let Err(e) = &result {
                tracing::error!("Failover stopped, restart the process: {}", e);
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, {} tasks still queued", managed.pending().len());
            Ok(())
        }
    }
}

fn log_event(event: &Event) {
    match event {
        Event::StateChange { from, to } => {
            tracing::info!("State change {} -> {}", origin_name(*from), to);
        }
        Event::Entered { .. } => {}
        Event::Synchronize(id) => tracing::debug!("Synchronize {:?}", id),
        Event::Error(e) => tracing::warn!("Failover error: {}", e),
        Event::Info(message) => tracing::info!("Heartbeat store {}", message),
        Event::Panic(e) => tracing::error!("Failover panic: {}", e),
    }
}

/// Print the fresh heartbeat record
async fn run_status(config_path: PathBuf) -> Result<()> {
    let config = FailoverConfig::from_file(&config_path)?;

    let store = match Backend::open(&config.store, false)? {
        Backend::Store(store) => store,
        Backend::Counter => return Err(Error::Internal("no heartbeat store opened".into())),
    };

    let window = chrono::Duration::from_std(config.intervals.freshness_window())
        .map_err(|e| Error::Config(e.to_string()))?;
    match store.find_fresh(&config.election.name, Utc::now() - window).await? {
        Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
        None => {
            println!("No fresh heartbeat for {}, no master elected", config.election.name);
        }
    }
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, name: String) -> Result<()> {
    let config = FailoverConfig::new(name);
    let content = format!(
        "# WolfFailover Configuration\n# Generated configuration file\n\n{}",
        config.to_toml()?
    );

    std::fs::write(&output, content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure the election group and heartbeat store.");
    println!("Then start with: failover --config {} run", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match FailoverConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Election: {}", config.election.name);
            println!("  Member: {}", config.election.member);
            println!("  Store: {:?} ({})", config.store.backend, config.store.path.display());
            println!(
                "  Intervals: master {}ms, slave {}ms, ticking {}ms, error {}ms",
                config.intervals.master_ms,
                config.intervals.slave_ms,
                config.intervals.ticking_ms,
                config.intervals.error_ms
            );
            println!("  Test mode: {}", config.election.test_mode);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}
