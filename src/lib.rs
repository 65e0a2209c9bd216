//! Fleet configurator: converges controller, compute and accounting agents on a single cluster
//! configuration and agrees on which controller replica is primary.

pub mod admission;
pub mod agent;
pub mod aggregator;
mod app;
pub mod config;
pub mod coordination;
pub mod daemon;
pub mod database;
pub mod error;
pub mod exchange;
pub mod lifecycle;
pub mod models;
pub mod propagator;
pub mod registry;
mod server;
pub mod topology;

#[cfg(test)]
mod admission_test;
#[cfg(test)]
mod aggregator_test;
#[cfg(test)]
mod coordination_test;
#[cfg(test)]
mod daemon_test;
#[cfg(test)]
mod database_test;
#[cfg(test)]
mod fixtures;
#[cfg(test)]
mod propagator_test;
#[cfg(test)]
mod topology_test;

use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusRecorder};

// Public exports for binaries.
pub use crate::{app::App, config::Config};

/// Get a handle to the metrics recorder, initializing it as needed.
pub fn get_metrics_recorder(config: &Config) -> &'static PrometheusRecorder {
    static RECORDER: OnceLock<PrometheusRecorder> = OnceLock::new();
    RECORDER.get_or_init(|| {
        PrometheusBuilder::new()
            .add_global_label("role", config.role_name.clone())
            .add_global_label("instance", config.instance_name.clone())
            .build()
    })
}
