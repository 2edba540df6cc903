//! The options mapping every experiment accepts.
//!
//! Options arrive as a JSON object. Keys the runner does not recognize are ignored, so a single
//! mapping can carry both the common options below and whatever a particular scenario needs
//! (see `parse_options`). Aliases cover the short keys used by older experiment scripts
//! (`t`, `n`, `enable`, `dryrun`).

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::RunnerError;

/// Highest tenant id. Tenant ids end up in one octet of the tenant address.
pub const MAX_TENANTS: usize = 255;

/// The isolation device used when a host does not name one.
pub const DEFAULT_DEV: &str = "eth2";

/// One host of the testbed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "HostEntry")]
pub struct HostConfig {
    /// The address used to reach the host (e.g. `10.0.1.1` or `localhost`).
    pub addr: String,
    /// The user to log in as. Defaults to `root`; the isolation module needs it anyway.
    pub username: Option<String>,
    /// The data-plane address of the host. Defaults to `addr` if that is an IPv4 address.
    pub data_ip: Option<Ipv4Addr>,
    /// The interface carrying experiment traffic.
    pub dev: Option<String>,
}

/// Hosts may be given either as a bare address or as a full object.
#[derive(Deserialize)]
#[serde(untagged)]
enum HostEntry {
    Addr(String),
    Full {
        addr: String,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        data_ip: Option<Ipv4Addr>,
        #[serde(default)]
        dev: Option<String>,
    },
}

impl From<HostEntry> for HostConfig {
    fn from(entry: HostEntry) -> Self {
        match entry {
            HostEntry::Addr(addr) => HostConfig::new(addr),
            HostEntry::Full {
                addr,
                username,
                data_ip,
                dev,
            } => HostConfig {
                addr,
                username,
                data_ip,
                dev,
            },
        }
    }
}

impl HostConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        HostConfig {
            addr: addr.into(),
            username: None,
            data_ip: None,
            dev: None,
        }
    }

    pub fn username(&self) -> &str {
        self.username.as_ref().map(String::as_str).unwrap_or("root")
    }

    pub fn dev(&self) -> &str {
        self.dev.as_ref().map(String::as_str).unwrap_or(DEFAULT_DEV)
    }

    /// The data-plane address, falling back to `addr` when it parses as IPv4.
    pub fn data_ip(&self) -> Option<Ipv4Addr> {
        self.data_ip.or_else(|| self.addr.parse().ok())
    }

    /// True if commands for this host should run on this machine rather than over SSH.
    pub fn is_local(&self) -> bool {
        self.addr == "localhost" || self.addr == "127.0.0.1"
    }
}

/// Where the isolation kernel module lives and what it is called.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    /// Module name as reported by `lsmod`; also the `/proc/sys/<name>` parameter directory.
    pub name: String,
    /// Path of the `.ko` on the remote.
    pub path: String,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        ModuleConfig {
            name: "perfiso".into(),
            path: "/root/perfiso/perfiso.ko".into(),
        }
    }
}

/// Polling intervals and switches for the background monitors.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub cpu_interval_ms: u64,
    pub bw_interval_ms: u64,
    /// Also run the profiler for the duration of the experiment.
    pub profile: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            cpu_interval_ms: 1000,
            bw_interval_ms: 1000,
            profile: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// The testbed hosts, in experiment-significant order.
    pub hosts: Vec<HostConfig>,

    /// Local directory that receives the results.
    pub dir: String,

    /// How long traffic runs, in seconds.
    #[serde(default = "default_duration", alias = "t")]
    pub duration: u64,

    /// Load the isolation module and create tenants.
    #[serde(default = "default_true", alias = "enable", alias = "enabled")]
    pub isolation: bool,

    /// Rate limit in Mbit/s, if the experiment uses one.
    #[serde(default)]
    pub rate: Option<u64>,

    /// Number of tenants per host.
    #[serde(default = "default_tenants", alias = "n")]
    pub tenants: usize,

    /// Log commands instead of running them.
    #[serde(default, alias = "dryrun")]
    pub dry_run: bool,

    #[serde(default)]
    pub exptid: Option<String>,

    /// Where hosts stage their output files before collection.
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,

    #[serde(default)]
    pub mtu: Option<u32>,

    #[serde(default)]
    pub module: ModuleConfig,

    /// Module parameters applied right after the module is loaded.
    #[serde(default)]
    pub params: BTreeMap<String, String>,

    #[serde(default)]
    pub monitors: MonitorConfig,
}

fn default_duration() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

fn default_tenants() -> usize {
    1
}

fn default_remote_dir() -> String {
    "/tmp/perfiso".into()
}

impl ExperimentConfig {
    /// Parse and validate the options mapping.
    pub fn from_options(options: &serde_json::Value) -> Result<Self, RunnerError> {
        let cfg: ExperimentConfig = parse_options(options)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), RunnerError> {
        if self.hosts.is_empty() {
            return Err(RunnerError::configuration("`hosts` must not be empty"));
        }
        for host in self.hosts.iter() {
            if host.addr.trim().is_empty() {
                return Err(RunnerError::configuration("empty host address"));
            }
        }
        if self.dir.trim().is_empty() {
            return Err(RunnerError::configuration("`dir` must not be empty"));
        }
        if self.duration == 0 {
            return Err(RunnerError::configuration("`duration` must be positive"));
        }
        if self.tenants == 0 || self.tenants > MAX_TENANTS {
            return Err(RunnerError::configuration(format!(
                "`tenants` must be between 1 and {}, got {}",
                MAX_TENANTS, self.tenants
            )));
        }
        if self.rate == Some(0) {
            return Err(RunnerError::configuration("`rate` must be positive"));
        }
        if !self.remote_dir.starts_with('/') {
            return Err(RunnerError::configuration(
                "`remote_dir` must be an absolute path",
            ));
        }
        Ok(())
    }

    /// Fail unless at least `n` hosts are configured.
    pub fn require_hosts(&self, n: usize) -> Result<(), RunnerError> {
        if self.hosts.len() < n {
            return Err(RunnerError::configuration(format!(
                "this experiment needs {} hosts, {} configured",
                n,
                self.hosts.len()
            )));
        }
        Ok(())
    }

    /// The rate limit, which `what` cannot do without.
    pub fn require_rate(&self, what: &str) -> Result<u64, RunnerError> {
        self.rate
            .ok_or_else(|| RunnerError::configuration(format!("{} needs `rate`", what)))
    }

    /// The experiment id, or a timestamp if none was given.
    pub fn exptid(&self) -> String {
        self.exptid
            .clone()
            .unwrap_or_else(|| chrono::Local::now().format("%Y-%m-%d-%H-%M-%S").to_string())
    }
}

/// Deserialize any options structure out of the mapping, mapping failures (e.g. a missing
/// required key) to a configuration error.
pub fn parse_options<T: DeserializeOwned>(options: &serde_json::Value) -> Result<T, RunnerError> {
    if !options.is_object() {
        return Err(RunnerError::configuration("options must be a JSON object"));
    }
    serde_json::from_value(options.clone()).map_err(RunnerError::configuration)
}
