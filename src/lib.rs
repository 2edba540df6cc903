//! A harness for performance isolation experiments on a small testbed.
//!
//! An [`Experiment`] connects to every host in its options, drives a [`Scenario`] through
//! initialise, start, wait and stop, and always unwinds what it set up: background processes,
//! monitors, tenants and any cleanup commands the scenario registered. Commands go through a
//! [`RemoteSession`] per host, which knows how to batch them (delayed mode) and how to pretend
//! (dry-run mode).

// Must be imported first because the other submodules use the macros defined therein.
#[macro_use]
mod macros;

pub mod config;
pub mod error;
pub mod exp_fairness;
pub mod exp_memcached;
pub mod exp_rx_overhead;
pub mod exp_tx_overhead;
pub mod experiment;
pub mod isolation;
pub mod monitor;
pub mod process;
pub mod registry;
pub mod session;
pub mod ssh;
pub mod tenant;
pub mod traffic;
pub mod transport;

#[cfg(test)]
mod testing;

pub use crate::config::{ExperimentConfig, HostConfig};
pub use crate::error::RunnerError;
pub use crate::experiment::{Experiment, ExperimentState, Phases, RunReport, Scenario};
pub use crate::monitor::MonitorSupervisor;
pub use crate::process::ProcessHandle;
pub use crate::registry::HostRegistry;
pub use crate::session::RemoteSession;
pub use crate::traffic::TrafficDriver;

/// Names accepted by [`scenario`].
pub const SCENARIOS: &[&str] = &[
    "rx-overhead",
    "tx-overhead",
    "memcached-cluster",
    "tcp-vs-udp",
    "tcp2-vs-32",
];

/// Build the scenario called `name` from the experiment options.
pub fn scenario(
    name: &str,
    options: &serde_json::Value,
) -> Result<Box<dyn Scenario>, RunnerError> {
    Ok(match name {
        "rx-overhead" => Box::new(exp_rx_overhead::RxOverhead::new(options)?),
        "tx-overhead" => Box::new(exp_tx_overhead::TxOverhead::new(options)?),
        "memcached-cluster" => Box::new(exp_memcached::MemcachedCluster::new(options)?),
        "tcp-vs-udp" => Box::new(exp_fairness::TcpVsUdp::new(options)?),
        "tcp2-vs-32" => Box::new(exp_fairness::Tcp2Vs32::new(options)?),
        other => {
            return Err(RunnerError::configuration(format!(
                "unknown scenario `{}`",
                other
            )))
        }
    })
}
