//! ---
//! herald_section: "01-core-functionality"
//! herald_subsection: "module"
//! herald_type: "source"
//! herald_scope: "code"
//! herald_description: "Shared primitives and utilities for the ambassador runtime."
//! herald_version: "v0.0.0-prealpha"
//! herald_owner: "tbd"
//! ---
//! Tracing setup shared by the daemon and anything embedding the ambassador.
use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::Registry;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "HERALD_LOG";
const DEFAULT_DIRECTIVE: &str = "info";

// Dropping a guard stops its writer thread, so both live for the process.
static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static STDOUT_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// How stdout log lines are rendered. The file sink is always JSON.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Install the global subscriber for `service_name`.
///
/// Publish outcomes, circuit transitions and drain passes are all emitted
/// through it. Lines go to stdout in `config.format` and to
/// `<directory>/<prefix>.log.<date>` as JSON. A subscriber that is already
/// installed is left alone, so calling this twice is harmless.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory)?;
    let prefix = config.file_prefix.as_deref().unwrap_or(service_name);

    let (file_writer, file_guard) =
        tracing_appender::non_blocking(daily(&config.directory, log_file_name(prefix)));
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let _ = FILE_GUARD.set(file_guard);
    let _ = STDOUT_GUARD.set(stdout_guard);

    let filter = resolve_filter(std::env::var(LOG_ENV).ok(), std::env::var("RUST_LOG").ok());
    let installed = tracing_subscriber::registry()
        .with(stdout_layer(config.format, stdout_writer).and_then(file_layer(file_writer)))
        .with(filter)
        .try_init()
        .is_ok();

    if installed {
        info!(
            service = %service_name,
            log_dir = %config.directory.display(),
            format = ?config.format,
            "tracing initialised"
        );
    }
    Ok(())
}

fn log_file_name(prefix: &str) -> String {
    format!("{}.log", prefix)
}

/// `HERALD_LOG` wins over `RUST_LOG`; a bad or missing directive means `info`.
fn resolve_filter(herald: Option<String>, rust_log: Option<String>) -> EnvFilter {
    for (source, directive) in [(LOG_ENV, herald), ("RUST_LOG", rust_log)] {
        let Some(directive) = directive else {
            continue;
        };
        match EnvFilter::try_new(&directive) {
            Ok(filter) => return filter,
            Err(err) => eprintln!(
                "ignoring invalid {} directive {:?}: {}",
                source, directive, err
            ),
        }
    }
    EnvFilter::new(DEFAULT_DIRECTIVE)
}

fn stdout_layer(format: LogFormat, writer: NonBlocking) -> BoxedLayer {
    let layer = fmt::layer()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_writer(writer);
    match format {
        LogFormat::StructuredJson => layer.with_target(false).json().boxed(),
        LogFormat::Pretty => layer.with_target(true).boxed(),
    }
}

fn file_layer(writer: NonBlocking) -> BoxedLayer {
    fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_writer(writer)
        .boxed()
}
