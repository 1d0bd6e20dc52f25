//! event-dispatcher CLI: runs the dispatch pipeline, standalone or behind
//! leader election.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use event_dispatcher::config::Config;
use event_dispatcher::config::secrets::redact;
use event_dispatcher::engine::{Controller, run_elected};
use event_dispatcher::feed::{ChangeFeed, JsonLinesFeed};
use event_dispatcher::leader::{FileLeaseElector, LeaderElection, LeaseConfig, default_identity};
use event_dispatcher::telemetry::{TelemetryConfig, init_telemetry};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "event-dispatcher", about = "Fan cluster events out to sinks")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatcher
    Run {
        /// Configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Override the configured worker count
        #[arg(long)]
        workers: Option<usize>,
        /// Campaign for the lease before dispatching
        #[arg(long)]
        leader_elect: bool,
        /// Notification source: a JSON-lines file, or "-" for stdin
        #[arg(long, default_value = "-")]
        feed: String,
    },
    /// Validate configuration and print the resolved settings
    CheckConfig {
        /// Configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            workers,
            leader_elect,
            feed,
        } => cmd_run(config.as_deref(), workers, leader_elect, feed).await,
        Command::CheckConfig { config } => cmd_check_config(config.as_deref()),
    }
}

async fn cmd_run(
    path: Option<&Path>,
    workers: Option<usize>,
    leader_elect: bool,
    feed: String,
) -> anyhow::Result<()> {
    let mut config = Config::load(path)?;
    if let Some(workers) = workers {
        config.workers = workers;
    }
    if leader_elect {
        config.leader_election.enabled = true;
    }
    config.validate()?;

    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "event-dispatcher"))?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("received shutdown signal");
            shutdown.cancel();
        });
    }

    let result = if config.leader_election.enabled {
        run_with_election(&config, &feed, shutdown).await
    } else {
        run_standalone(&config, &feed, shutdown).await
    };

    if let Err(e) = &result {
        error!("event dispatcher exited: {e}");
    }
    result
}

async fn run_standalone(
    config: &Config,
    feed: &str,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let feed = open_feed(feed).await?;
    let controller = Arc::new(Controller::from_config(feed, config).await);

    let ctrl = Arc::clone(&controller);
    tokio::spawn(async move {
        shutdown.cancelled().await;
        ctrl.stop();
    });

    controller.run(config.workers).await?;
    Ok(())
}

async fn run_with_election(
    config: &Config,
    feed: &str,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let le = &config.leader_election;
    let lease = LeaseConfig::from_config(le, default_identity());
    let elector = Arc::new(
        FileLeaseElector::new(&le.lease_dir, lease.lease_duration)
            .context("open lease directory")?,
    );
    info!(lease = %lease.lock_key(), identity = %lease.identity, "leader election enabled");

    let election_token = CancellationToken::new();
    let (status, election) = LeaderElection::new(elector, lease).spawn(election_token.clone());

    let result = run_elected(status, shutdown, config.workers, || async {
        let feed = open_feed(feed).await?;
        Ok(Controller::from_config(feed, config).await)
    })
    .await;

    // Release the lease only after dispatching has stopped.
    election_token.cancel();
    match election.await {
        Ok(Err(e)) => error!("leader election error: {e}"),
        Err(e) => error!("leader election task failed: {e}"),
        Ok(Ok(())) => {}
    }

    result?;
    Ok(())
}

async fn open_feed(source: &str) -> event_dispatcher::error::Result<Arc<dyn ChangeFeed>> {
    if source == "-" {
        return Ok(Arc::new(JsonLinesFeed::stdin()));
    }
    Ok(Arc::new(JsonLinesFeed::open(Path::new(source)).await?))
}

fn cmd_check_config(path: Option<&Path>) -> anyhow::Result<()> {
    let config = Config::load(path)?;

    println!("workers:          {}", config.workers);
    println!("log_level:        {}", config.log_level);
    println!(
        "otel_endpoint:    {}",
        config.otel_endpoint.as_deref().unwrap_or("-")
    );
    println!(
        "max_event_age:    {}s",
        config.controller.max_event_age_secs
    );
    println!("sync_timeout:     {}s", config.controller.sync_timeout_secs);

    match &config.sinks.search_index {
        Some(es) => {
            println!("search_index:     {} -> {}", es.addresses.join(","), es.index);
            println!(
                "  username:       {}",
                es.username.as_deref().unwrap_or("-")
            );
            println!("  password:       {}", redact(es.password.as_ref()));
            println!("  timeout:        {}s", es.timeout_secs);
        }
        None => println!("search_index:     -"),
    }
    println!("console:          {}", config.sinks.console);
    println!("discard:          {}", config.sinks.discard);

    let le = &config.leader_election;
    if le.enabled {
        println!(
            "leader_election:  {}/{} (lease {}s, renew {}s, retry {}s, dir {})",
            le.resolve_namespace(),
            le.name,
            le.lease_duration_secs,
            le.renew_deadline_secs,
            le.retry_period_secs,
            le.lease_dir.display()
        );
    } else {
        println!("leader_election:  disabled");
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            error!("install SIGTERM handler: {e}");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}
