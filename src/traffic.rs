//! Traffic generators.
//!
//! A driver only knows how to spell its command line and where the output should go; it never
//! looks at the results. Launching goes through the session, so drivers are batched, pinned and
//! dry-run like any other background command.

use std::net::Ipv4Addr;

use crate::error::RunnerError;
use crate::process::{ProcessHandle, RunOptions};
use crate::session::RemoteSession;

pub const IPERF_PORT: u16 = 5001;
pub const MEMCACHED_PORT: u16 = 11211;
pub const LOADGEN_PORT: u16 = 12345;

pub trait TrafficDriver {
    /// The process name, as `killall` sees it.
    fn name(&self) -> &'static str;

    fn command(&self) -> String;

    /// Where stdout and stderr should go on the host, if anywhere.
    fn output(&self) -> Option<&str> {
        None
    }

    /// Start the driver on `session`, optionally pinned to `cpu`.
    fn launch(
        &self,
        session: &mut RemoteSession,
        cpu: Option<usize>,
    ) -> Result<ProcessHandle, RunnerError> {
        let opts = RunOptions {
            cpu,
            output: self.output().map(str::to_owned),
        };
        session.run_async(&self.command(), &opts)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Role {
    Server,
    /// Send to the given address.
    Client(Ipv4Addr),
}

#[derive(Clone, Debug)]
pub struct Iperf {
    pub role: Role,
    pub port: u16,
    /// Parallel connections (clients only).
    pub parallel: usize,
    /// Seconds to send for (clients only).
    pub duration: u64,
    pub udp: bool,
    /// Datagram rate cap, e.g. `3G`. Implies UDP.
    pub rate: Option<String>,
    /// Source address to bind to.
    pub bind: Option<Ipv4Addr>,
    pub output: Option<String>,
}

impl Iperf {
    pub fn server(port: u16) -> Self {
        Iperf {
            role: Role::Server,
            port,
            parallel: 1,
            duration: 30,
            udp: false,
            rate: None,
            bind: None,
            output: None,
        }
    }

    pub fn client(target: Ipv4Addr, port: u16) -> Self {
        Iperf {
            role: Role::Client(target),
            ..Iperf::server(port)
        }
    }

    pub fn parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn duration(mut self, secs: u64) -> Self {
        self.duration = secs;
        self
    }

    pub fn udp(mut self) -> Self {
        self.udp = true;
        self
    }

    pub fn rate(mut self, rate: impl Into<String>) -> Self {
        self.rate = Some(rate.into());
        self.udp = true;
        self
    }

    pub fn bind(mut self, addr: Ipv4Addr) -> Self {
        self.bind = Some(addr);
        self
    }

    pub fn output(mut self, path: impl Into<String>) -> Self {
        self.output = Some(path.into());
        self
    }
}

impl TrafficDriver for Iperf {
    fn name(&self) -> &'static str {
        "iperf"
    }

    fn command(&self) -> String {
        let mut cmd = match &self.role {
            Role::Server => format!("iperf -s -p {}", self.port),
            Role::Client(target) => format!(
                "iperf -c {} -p {} -P {} -t {}",
                target, self.port, self.parallel, self.duration
            ),
        };
        if self.udp {
            cmd.push_str(" -u");
        }
        if let (Role::Client(_), Some(rate)) = (&self.role, &self.rate) {
            cmd.push_str(&format!(" -b {}", rate));
        }
        if let Some(bind) = self.bind {
            cmd.push_str(&format!(" -B {}", bind));
        }
        cmd
    }

    fn output(&self) -> Option<&str> {
        self.output.as_ref().map(String::as_str)
    }
}

#[derive(Clone, Debug)]
pub struct Memcached {
    pub port: u16,
    pub threads: usize,
    pub memory_mb: usize,
}

impl Default for Memcached {
    fn default() -> Self {
        Memcached {
            port: MEMCACHED_PORT,
            threads: 4,
            memory_mb: 1024,
        }
    }
}

impl TrafficDriver for Memcached {
    fn name(&self) -> &'static str {
        "memcached"
    }

    fn command(&self) -> String {
        format!(
            "memcached -u nobody -p {} -t {} -m {}",
            self.port, self.threads, self.memory_mb
        )
    }
}

/// A memcached load generator hitting every server in `servers`.
#[derive(Clone, Debug)]
pub struct Memaslap {
    /// `host:port` of each server.
    pub servers: Vec<String>,
    pub duration: u64,
    /// Workload configuration file on the host.
    pub config: String,
    pub concurrency: usize,
    pub threads: usize,
    pub output: Option<String>,
}

impl Memaslap {
    pub fn new(servers: &[Ipv4Addr], duration: u64, config: impl Into<String>) -> Self {
        Memaslap {
            servers: servers
                .iter()
                .map(|ip| format!("{}:{}", ip, MEMCACHED_PORT))
                .collect(),
            duration,
            config: config.into(),
            concurrency: 512,
            threads: 4,
            output: None,
        }
    }
}

impl TrafficDriver for Memaslap {
    fn name(&self) -> &'static str {
        "memaslap"
    }

    fn command(&self) -> String {
        format!(
            "memaslap -s {} -S 1s -t {}s -c {} -T {} -B -F {}",
            self.servers.join(","),
            self.duration,
            self.concurrency,
            self.threads,
            self.config
        )
    }

    fn output(&self) -> Option<&str> {
        self.output.as_ref().map(String::as_str)
    }
}

/// The UDP load generator. It sits idle until something connects to its control port (see
/// `trigger_command`), then replays its traffic matrix.
#[derive(Clone, Debug)]
pub struct Loadgen {
    pub binary: String,
    pub bind: Ipv4Addr,
    pub port: u16,
    pub packets: u64,
    /// Traffic matrix file on the host.
    pub traffic: String,
    pub output: Option<String>,
}

impl Loadgen {
    pub fn new(bind: Ipv4Addr, traffic: impl Into<String>) -> Self {
        Loadgen {
            binary: "loadgen".into(),
            bind,
            port: LOADGEN_PORT,
            packets: 500_000,
            traffic: traffic.into(),
            output: None,
        }
    }

    /// The command that starts a waiting load generator.
    pub fn trigger_command(&self) -> String {
        format!("nc -nzv {} {}", self.bind, self.port)
    }
}

impl TrafficDriver for Loadgen {
    fn name(&self) -> &'static str {
        "loadgen"
    }

    fn command(&self) -> String {
        format!(
            "{} -i {} -l {} -p {} -f {}",
            self.binary, self.bind, self.port, self.packets, self.traffic
        )
    }

    fn output(&self) -> Option<&str> {
        self.output.as_ref().map(String::as_str)
    }
}
