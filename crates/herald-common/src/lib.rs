//! ---
//! herald_section: "01-core-functionality"
//! herald_subsection: "module"
//! herald_type: "source"
//! herald_scope: "code"
//! herald_description: "Shared primitives and utilities for the ambassador runtime."
//! herald_version: "v0.0.0-prealpha"
//! herald_owner: "tbd"
//! ---
//! Core shared primitives for the Herald workspace.
//! This crate exposes configuration loading and logging initialisation
//! consumed by the broker, ambassador and daemon crates.

pub mod config;
pub mod logging;

pub use config::{
    AmbassadorConfig, BrokerConfig, BrokerKind, HeraldConfig, LoadedHeraldConfig, LoggingConfig,
    MetricsConfig, OverflowPolicy,
};
pub use logging::{init_tracing, LogFormat};
