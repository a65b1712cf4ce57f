//! ---
//! herald_section: "05-daemon"
//! herald_subsection: "binary"
//! herald_type: "source"
//! herald_scope: "code"
//! herald_description: "Binary entrypoint for the Herald daemon."
//! herald_version: "v0.0.0-prealpha"
//! herald_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use herald_ambassador::{Ambassador, MetricsSnapshot, OperationEvent, OperationKind};
use herald_broker::{BrokerConnector, InMemoryBroker, RedisConnector};
use herald_common::config::{BrokerKind, HeraldConfig};
use herald_common::logging::init_tracing;
use herald_metrics::{new_registry, spawn_http_server, AmbassadorMetrics, DaemonMetrics};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "Herald publishing ambassador daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "KIND", help = "Override the broker kind (redis or memory)")]
    broker: Option<BrokerKind>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Publish every stdin line on the default channel")]
    Run,
    #[command(about = "Publish a single message")]
    Publish {
        #[arg(long, help = "Target channel; defaults to the configured one")]
        channel: Option<String>,
        message: String,
    },
    #[command(about = "Publish a create/delete operation event")]
    Event {
        #[arg(long, value_enum)]
        operation: CliOperation,
        #[arg(long)]
        user: String,
        #[arg(long)]
        resource: String,
        #[arg(long, help = "Trace id to attach; random when omitted")]
        trace_id: Option<String>,
    },
    #[command(about = "Validate configuration and print the effective settings")]
    CheckConfig,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliOperation {
    Create,
    Delete,
}

impl From<CliOperation> for OperationKind {
    fn from(value: CliOperation) -> Self {
        match value {
            CliOperation::Create => OperationKind::Create,
            CliOperation::Delete => OperationKind::Delete,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/herald.toml"));
    candidates.push(PathBuf::from("configs/herald.example.toml"));

    let load_started = Instant::now();
    let loaded = HeraldConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    let config_path = loaded.source;
    let load_duration = load_started.elapsed();
    if let Some(kind) = cli.broker {
        config.ambassador.broker.kind = kind;
    }

    if let Some(Commands::CheckConfig) = &cli.command {
        let rendered =
            toml::to_string_pretty(&config).context("failed to render configuration")?;
        println!("# loaded from {}\n{}", config_path.display(), rendered);
        return Ok(());
    }

    init_tracing("heraldd", &config.logging)?;
    info!(source = %config_path.display(), "configuration loaded");

    let registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(registry.clone())?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());
    daemon_metrics.inc_start();
    let exporter = AmbassadorMetrics::new(registry.clone())?;

    let connector = connector_for(config.ambassador.broker.kind);
    let ambassador = Ambassador::with_exporter(config.ambassador.clone(), connector, exporter)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            run_daemon(config, config_path, cli.broker, &ambassador, daemon_metrics).await?
        }
        Commands::Publish { channel, message } => {
            let channel = channel.unwrap_or_else(|| ambassador.default_channel());
            let outcome = ambassador.publish_on(&channel, message).await;
            print_metrics(&ambassador.metrics())?;
            ambassador.shutdown();
            let receivers = outcome.with_context(|| format!("publish on {} failed", channel))?;
            println!("published on {}: {} receiver(s)", channel, receivers);
        }
        Commands::Event {
            operation,
            user,
            resource,
            trace_id,
        } => {
            let mut event = OperationEvent::new(operation.into(), user, resource);
            if let Some(trace_id) = trace_id {
                event = event.with_trace_id(trace_id);
            }
            ambassador.publish_event(&event).await;
            println!("{}", serde_json::to_string(&event)?);
            print_metrics(&ambassador.metrics())?;
            ambassador.shutdown();
        }
        // rendered before tracing was initialised
        Commands::CheckConfig => {}
    }

    Ok(())
}

fn connector_for(kind: BrokerKind) -> Arc<dyn BrokerConnector> {
    match kind {
        BrokerKind::Redis => Arc::new(RedisConnector::new()),
        BrokerKind::Memory => Arc::new(InMemoryBroker::new().connector()),
    }
}

async fn run_daemon(
    config: HeraldConfig,
    config_path: PathBuf,
    broker_override: Option<BrokerKind>,
    ambassador: &Ambassador,
    daemon_metrics: DaemonMetrics,
) -> Result<()> {
    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(daemon_metrics.registry(), config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let reporter = {
        let ambassador = ambassador.clone();
        let period = config.metrics.log_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                log_metrics(&ambassador.metrics(), "ambassador metrics");
            }
        })
    };

    let mut reload = ReloadSignal::new()?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(channel = %ambassador.default_channel(), "daemon running; publishing stdin lines");
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if let Err(err) = ambassador.publish(line.to_owned()).await {
                        warn!(kind = err.kind(), error = %err, "line not delivered");
                    }
                }
                Ok(None) => {
                    info!("stdin closed; shutting down");
                    break;
                }
                Err(err) => {
                    error!(error = %err, "failed to read stdin; shutting down");
                    break;
                }
            },
            result = &mut shutdown => {
                result.context("failed to listen for ctrl-c")?;
                info!("ctrl-c received; shutting down");
                break;
            }
            Some(()) = reload.recv() => {
                reload_configuration(&config_path, broker_override, ambassador, &daemon_metrics).await;
            }
        }
    }

    ambassador.flush().await;
    log_metrics(&ambassador.metrics(), "final ambassador metrics");
    reporter.abort();
    ambassador.shutdown();

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}

async fn reload_configuration(
    config_path: &std::path::Path,
    broker_override: Option<BrokerKind>,
    ambassador: &Ambassador,
    daemon_metrics: &DaemonMetrics,
) {
    info!(source = %config_path.display(), "reloading configuration");
    let started = Instant::now();
    let outcome = match HeraldConfig::from_path(config_path) {
        Ok(mut config) => {
            if let Some(kind) = broker_override {
                config.ambassador.broker.kind = kind;
            }
            ambassador.update_configuration(config.ambassador).await
        }
        Err(err) => Err(err),
    };
    daemon_metrics.observe_config_load(started.elapsed().as_secs_f64());
    match outcome {
        Ok(()) => {
            daemon_metrics.record_reload(true);
            info!("configuration reloaded");
        }
        Err(err) => {
            daemon_metrics.record_reload(false);
            warn!(error = %err, "configuration reload failed; keeping previous settings");
        }
    }
}

fn log_metrics(snapshot: &MetricsSnapshot, message: &str) {
    info!(
        published = snapshot.published_count,
        failed = snapshot.failed_count,
        short_circuited = snapshot.short_circuited_count,
        avg_latency_ms = snapshot.avg_latency_ms,
        queue_len = snapshot.failed_queue_length,
        redelivered = snapshot.redelivered_count,
        dropped = snapshot.dropped_count,
        circuit_open = snapshot.circuit_open,
        "{}",
        message
    );
}

fn print_metrics(snapshot: &MetricsSnapshot) -> Result<()> {
    let rendered = serde_json::to_string_pretty(snapshot).context("failed to render metrics")?;
    println!("{}", rendered);
    Ok(())
}

/// SIGHUP on unix; never fires elsewhere.
#[cfg(unix)]
struct ReloadSignal(signal::unix::Signal);

#[cfg(unix)]
impl ReloadSignal {
    fn new() -> Result<Self> {
        let hangup = signal::unix::signal(signal::unix::SignalKind::hangup())
            .context("failed to install SIGHUP handler")?;
        Ok(Self(hangup))
    }

    async fn recv(&mut self) -> Option<()> {
        self.0.recv().await
    }
}

#[cfg(not(unix))]
struct ReloadSignal;

#[cfg(not(unix))]
impl ReloadSignal {
    fn new() -> Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> Option<()> {
        std::future::pending().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_event_subcommand() {
        let cli = Cli::try_parse_from([
            "heraldd",
            "--broker",
            "memory",
            "event",
            "--operation",
            "delete",
            "--user",
            "johnd",
            "--resource",
            "42",
        ])
        .unwrap();
        assert_eq!(cli.broker, Some(BrokerKind::Memory));
        match cli.command {
            Some(Commands::Event {
                operation,
                user,
                resource,
                trace_id,
            }) => {
                assert_eq!(OperationKind::from(operation), OperationKind::Delete);
                assert_eq!(user, "johnd");
                assert_eq!(resource, "42");
                assert!(trace_id.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn run_is_the_default_command() {
        let cli = Cli::try_parse_from(["heraldd", "--config", "herald.toml"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config, Some(PathBuf::from("herald.toml")));
    }

    #[test]
    fn rejects_unknown_broker_kind() {
        assert!(Cli::try_parse_from(["heraldd", "--broker", "kafka", "run"]).is_err());
    }
}
