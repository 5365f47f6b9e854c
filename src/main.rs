//! codexec daemon
//!
//! `codexec worker` runs the sandbox workers, `codexec hub` serves clients.
//! Both are configured through environment variables.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use codexec::bus::{Broker, ConsumeOptions};
use codexec::config::Config;
use codexec::driver::{new_driver, Driver};
use codexec::executor::ExecutorService;
use codexec::hub::{self, Hub, SubjectCatalog};
use codexec::worker::Worker;

/// Concurrent result deliveries per hub replica.
const HUB_LISTENER_CONCURRENCY: usize = 16;

#[derive(Parser, Debug)]
#[command(name = "codexec")]
#[command(about = "Sandboxed code execution workers and result hub")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Broker URL, overrides RABBITMQ_URL
    #[arg(long, global = true)]
    rabbitmq_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Consume job queues and run jobs in the sandbox
    Worker {
        /// Command prefix for sandbox-side commands, overrides CMD_PREFIX
        #[arg(long)]
        cmd_prefix: Option<String>,
    },
    /// Accept websocket clients and route results back to them
    Hub {
        /// Listen address, overrides HUB_BIND
        #[arg(long)]
        bind: Option<String>,
    },
}

impl Args {
    fn overrides(&self) -> HashMap<&'static str, String> {
        let mut overrides = HashMap::new();
        if let Some(url) = &self.rabbitmq_url {
            overrides.insert("RABBITMQ_URL", url.clone());
        }
        match &self.command {
            Command::Worker {
                cmd_prefix: Some(prefix),
            } => {
                overrides.insert("CMD_PREFIX", prefix.clone());
            }
            Command::Hub { bind: Some(bind) } => {
                overrides.insert("HUB_BIND", bind.clone());
            }
            _ => {}
        }
        overrides
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let overrides = args.overrides();
    let config = Config::from_lookup(|key| {
        overrides
            .get(key)
            .cloned()
            .or_else(|| std::env::var(key).ok())
    })
    .context("Failed to load configuration")?;

    let cancel = CancellationToken::new();
    match args.command {
        Command::Worker { .. } => run_workers(config, cancel).await,
        Command::Hub { .. } => run_hub(config, cancel).await,
    }
}

async fn run_workers(config: Config, cancel: CancellationToken) -> Result<()> {
    let workers = config.workers()?;
    info!(
        workers = workers.len(),
        cmd_prefix = %config.sandbox.cmd_prefix,
        jobs_dir = %config.sandbox.jobs_dir.display(),
        "Loaded configuration"
    );

    let broker = Broker::connect(&config.rabbitmq_url)
        .await
        .context("Failed to connect to broker")?;

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    for worker_config in workers {
        let driver: Arc<dyn Driver> = Arc::from(new_driver(worker_config.driver, &config.sandbox));
        let executor = ExecutorService::new(driver, config.execution_timeout);
        let worker = Worker::new(broker.clone(), worker_config.clone(), executor);
        let cancel = cancel.clone();
        let queue = worker_config.queue.clone();

        tasks.spawn(async move {
            worker
                .run(cancel)
                .await
                .with_context(|| format!("Worker for {queue} failed"))
        });
    }

    let result = supervise(tasks, &cancel, config.shutdown_timeout).await;
    broker.close().await;
    result
}

async fn run_hub(config: Config, cancel: CancellationToken) -> Result<()> {
    let broker = Broker::connect(&config.rabbitmq_url)
        .await
        .context("Failed to connect to broker")?;

    let catalog = SubjectCatalog::new(
        &config.queue_prefix,
        &config.hub.subjects,
        &config.hub.exercises,
    );
    let (hub, control) = Hub::new(broker.producer(), catalog);
    let hub = Arc::new(hub);

    let results_queue = broker
        .bind_fanout_queue(&config.results_exchange)
        .await
        .context("Failed to bind results queue")?;
    let listener = TcpListener::bind(config.hub.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.hub.bind))?;

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    {
        let cancel = cancel.clone();
        tasks.spawn(async move {
            control.run(cancel).await;
            Ok(())
        });
    }
    {
        let sweeper = hub.start_sweeper(config.hub.correlation_ttl, cancel.clone());
        tasks.spawn(async move { sweeper.await.context("Correlation sweeper panicked") });
    }
    {
        let consumer = broker.consumer();
        let hub = Arc::clone(&hub);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            consumer
                .start(
                    cancel,
                    &results_queue,
                    hub,
                    HUB_LISTENER_CONCURRENCY,
                    ConsumeOptions {
                        exclusive: true,
                        ..ConsumeOptions::default()
                    },
                )
                .await
                .context("Result listener failed")
        });
    }
    {
        let cancel = cancel.clone();
        tasks.spawn(async move {
            hub::serve(listener, hub, cancel)
                .await
                .context("HTTP server failed")
        });
    }

    let result = supervise(tasks, &cancel, config.shutdown_timeout).await;
    broker.close().await;
    result
}

/// Run until a shutdown signal or the first task exit, then cancel
/// everything and wait up to `shutdown_timeout` for the rest.
async fn supervise(
    mut tasks: JoinSet<Result<()>>,
    cancel: &CancellationToken,
    shutdown_timeout: Duration,
) -> Result<()> {
    let mut failure = None;
    tokio::select! {
        () = shutdown_signal() => info!("Shutdown signal received"),
        Some(joined) = tasks.join_next() => {
            warn!("Task exited before shutdown");
            failure = flatten(joined).err();
        }
    }

    cancel.cancel();
    let drained = tokio::time::timeout(shutdown_timeout, async {
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = flatten(joined) {
                error!(error = %format!("{e:#}"), "Task failed during shutdown");
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!(timeout = ?shutdown_timeout, "Shutdown timed out, aborting remaining tasks");
        tasks.abort_all();
    }

    failure.map_or(Ok(()), Err)
}

fn flatten(joined: Result<Result<()>, JoinError>) -> Result<()> {
    joined.context("Task panicked")?
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
