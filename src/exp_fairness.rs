//! Fairness between tenants sharing one receiver.
//!
//! `TcpVsUdp`: a single TCP connection in tenant 1 against UDP blasters in tenant 2, all aimed
//! at host 0. `Tcp2Vs32`: one TCP connection in tenant 1 against 32 TCP connections in tenant
//! 2. Without isolation the same traffic runs against the receiver's own address.

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::Deserialize;

use crate::config::{parse_options, ExperimentConfig};
use crate::error::RunnerError;
use crate::experiment::{Experiment, Scenario};
use crate::traffic::{Iperf, IPERF_PORT};

const RECEIVER: usize = 0;
const TCP_TID: usize = 1;
const BULK_TID: usize = 2;
const BULK_PORT: u16 = IPERF_PORT + 1;

/// Where traffic for tenant `tid` on host `host` should be sent.
fn target(exp: &mut Experiment, host: usize, tid: usize) -> Result<Ipv4Addr, RunnerError> {
    if exp.config().isolation {
        exp.tenant_ip(host, tid)
    } else {
        exp.data_ip(host)
    }
}

/// Unload the module, reset the interfaces and flush the firewall on every host.
fn reset(exp: &mut Experiment) -> Result<(), RunnerError> {
    let module = exp.config().module.clone();
    let mtu = exp.config().mtu;

    let registry = exp.registry_mut();
    registry.unload_module(&module)?;
    registry.reset_ifaces(mtu)?;
    registry.ipt_ebt_flush().into_result()?;

    Ok(())
}

/// Load the module and give host 0 both tenants. `senders` lists the tenant each other host
/// sends from.
fn isolate(exp: &mut Experiment, senders: &[(usize, usize)]) -> Result<(), RunnerError> {
    let module = exp.config().module.clone();
    let params = exp.config().params.clone();
    exp.registry_mut().load_module(&module, &params)?;

    exp.log("creating two tenants");
    exp.create_tenant_on(RECEIVER, TCP_TID, None)?;
    exp.create_tenant_on(RECEIVER, BULK_TID, None)?;
    for &(host, tid) in senders.iter() {
        exp.create_tenant_on(host, tid, None)?;
    }

    Ok(())
}

fn start_tcp_client(exp: &mut Experiment, host: usize) -> Result<(), RunnerError> {
    let client = Iperf::client(target(exp, RECEIVER, TCP_TID)?, IPERF_PORT)
        .parallel(1)
        .duration(exp.config().duration)
        .output(exp.output_path("iperf-tcp.txt"));
    exp.launch(host, &client, None);
    Ok(())
}

#[derive(Clone, Debug, Deserialize)]
pub struct TcpVsUdpOptions {
    /// Hosts sending UDP, from host 2 on.
    #[serde(default = "default_udp_clients")]
    pub udp_clients: usize,

    /// UDP streams per sending host.
    #[serde(default = "default_udp_parallel", rename = "P", alias = "parallel")]
    pub parallel: usize,

    #[serde(default = "default_udp_rate")]
    pub udp_rate: String,
}

fn default_udp_clients() -> usize {
    1
}

fn default_udp_parallel() -> usize {
    32
}

fn default_udp_rate() -> String {
    "3G".into()
}

pub struct TcpVsUdp {
    opts: TcpVsUdpOptions,
}

impl TcpVsUdp {
    pub fn new(options: &serde_json::Value) -> Result<Self, RunnerError> {
        let opts: TcpVsUdpOptions = parse_options(options)?;
        if opts.udp_clients == 0 {
            return Err(RunnerError::configuration("need at least one UDP sender"));
        }
        Ok(TcpVsUdp { opts })
    }

    fn udp_hosts(&self) -> std::ops::Range<usize> {
        2..2 + self.opts.udp_clients
    }
}

impl Scenario for TcpVsUdp {
    fn name(&self) -> &str {
        "tcp-vs-udp"
    }

    fn validate(&self, config: &ExperimentConfig) -> Result<(), RunnerError> {
        config.require_hosts(self.udp_hosts().end)
    }

    fn initialise(&mut self, exp: &mut Experiment) -> Result<(), failure::Error> {
        reset(exp)?;

        if exp.config().isolation {
            // Every sender only needs the tenant it sends from.
            let senders: Vec<_> = std::iter::once(1)
                .chain(self.udp_hosts())
                .map(|h| (h, TCP_TID))
                .collect();
            isolate(exp, &senders)?;

            exp.set_param_all("IsoAutoGenerateFeedback", 1)?;
            exp.set_param_all("ISO_VQ_DRAIN_RATE_MBPS", 8700)?;
            exp.set_param_all("ISO_VQ_UPDATE_INTERVAL_US", 25)?;
        }

        Ok(())
    }

    fn start(&mut self, exp: &mut Experiment) -> Result<(), failure::Error> {
        exp.start_monitors();

        exp.launch(RECEIVER, &Iperf::server(IPERF_PORT), None);
        exp.launch(RECEIVER, &Iperf::server(BULK_PORT).udp(), None);
        for i in 0..self.udp_hosts().end {
            exp.on_stop(i, "killall -9 iperf");
        }

        exp.sleep(Duration::from_secs(1));

        start_tcp_client(exp, 1)?;

        let udp_target = target(exp, RECEIVER, BULK_TID)?;
        let t = exp.config().duration;
        for i in self.udp_hosts() {
            let client = Iperf::client(udp_target, BULK_PORT)
                .parallel(self.opts.parallel)
                .duration(t)
                .rate(self.opts.udp_rate.clone())
                .output(exp.output_path(&format!("iperf-udp-{}.txt", i)));
            exp.launch(i, &client, None);
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Tcp2Vs32Options {
    /// Connections of the bulk sender.
    #[serde(default = "default_bulk_parallel", rename = "P", alias = "parallel")]
    pub parallel: usize,
}

fn default_bulk_parallel() -> usize {
    32
}

pub struct Tcp2Vs32 {
    opts: Tcp2Vs32Options,
}

impl Tcp2Vs32 {
    pub fn new(options: &serde_json::Value) -> Result<Self, RunnerError> {
        Ok(Tcp2Vs32 {
            opts: parse_options(options)?,
        })
    }
}

impl Scenario for Tcp2Vs32 {
    fn name(&self) -> &str {
        "tcp2-vs-32"
    }

    fn validate(&self, config: &ExperimentConfig) -> Result<(), RunnerError> {
        config.require_hosts(3)
    }

    fn initialise(&mut self, exp: &mut Experiment) -> Result<(), failure::Error> {
        reset(exp)?;

        if exp.config().isolation {
            isolate(exp, &[(1, TCP_TID), (2, BULK_TID)])?;
        }

        Ok(())
    }

    fn start(&mut self, exp: &mut Experiment) -> Result<(), failure::Error> {
        exp.start_monitors();

        exp.launch(RECEIVER, &Iperf::server(IPERF_PORT), None);
        exp.launch(RECEIVER, &Iperf::server(BULK_PORT), None);
        for i in 0..3 {
            exp.on_stop(i, "killall -9 iperf");
        }

        exp.sleep(Duration::from_secs(1));

        start_tcp_client(exp, 1)?;

        let bulk = Iperf::client(target(exp, RECEIVER, BULK_TID)?, BULK_PORT)
            .parallel(self.opts.parallel)
            .duration(exp.config().duration)
            .output(exp.output_path("iperf-bulk.txt"));
        exp.launch(2, &bulk, None);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::experiment::Phases;
    use crate::testing::{scratch_dir, Kind, Recorder};

    fn options(dir: &std::path::Path) -> serde_json::Value {
        json!({
            "hosts": ["10.0.1.1", "10.0.1.2", "10.0.1.3"],
            "dir": dir.to_string_lossy(),
            "t": 1,
            "exptid": "fair",
        })
    }

    fn clients(rec: &Recorder) -> Vec<(String, String)> {
        rec.records()
            .into_iter()
            .filter(|r| r.kind == Kind::Spawn && r.command.starts_with("iperf -c"))
            .map(|r| (r.host, r.command))
            .collect()
    }

    #[test]
    fn tcp_vs_udp() -> Result<(), failure::Error> {
        let rec = Recorder::new();
        let dir = scratch_dir("tcp-vs-udp");
        let opts = options(&dir);
        let mut exp = Experiment::new(&opts, &rec.connector())?;

        let report = exp.run(&mut TcpVsUdp::new(&opts)?);
        assert!(report.is_success(), "{}", report);

        let receiver = rec.commands("10.0.1.1");
        assert!(receiver.iter().any(|c| c.starts_with("ifconfig eth2:1 11.1.1.1")));
        assert!(receiver.iter().any(|c| c.starts_with("ifconfig eth2:2 11.2.1.1")));
        assert!(!rec
            .commands("10.0.1.3")
            .iter()
            .any(|c| c.starts_with("ifconfig eth2:2")));

        for host in ["10.0.1.1", "10.0.1.2", "10.0.1.3"].iter() {
            assert!(rec
                .commands(host)
                .contains(&"echo 8700 > /proc/sys/perfiso/ISO_VQ_DRAIN_RATE_MBPS".to_owned()));
        }

        let clients = clients(&rec);
        assert_eq!(clients.len(), 2);
        assert_eq!(clients[0].0, "10.0.1.2");
        assert!(clients[0].1.starts_with("iperf -c 11.1.1.1 -p 5001 -P 1 -t 1"));
        assert_eq!(clients[1].0, "10.0.1.3");
        assert!(clients[1]
            .1
            .starts_with("iperf -c 11.2.1.1 -p 5002 -P 32 -t 1 -u -b 3G"));

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn tcp_vs_udp_needs_a_host_per_sender() -> Result<(), failure::Error> {
        let rec = Recorder::new();
        let dir = scratch_dir("tcp-vs-udp-few");
        let mut opts = options(&dir);
        opts["udp_clients"] = json!(2);
        let mut exp = Experiment::new(&opts, &rec.connector())?;

        let report = exp.run(&mut TcpVsUdp::new(&opts)?);
        assert!(report.failed.contains(Phases::INITIALISE));
        assert!(rec.records().iter().all(|r| r.kind == Kind::Fetch));

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn tcp2_vs_32_without_isolation() -> Result<(), failure::Error> {
        let rec = Recorder::new();
        let dir = scratch_dir("tcp2-vs-32");
        let mut opts = options(&dir);
        opts["isolation"] = json!(false);
        let mut exp = Experiment::new(&opts, &rec.connector())?;

        let report = exp.run(&mut Tcp2Vs32::new(&opts)?);
        assert!(report.is_success(), "{}", report);

        assert!(rec
            .records()
            .iter()
            .all(|r| !r.command.starts_with("insmod")));

        let clients = clients(&rec);
        assert_eq!(clients.len(), 2);
        assert!(clients[0].1.starts_with("iperf -c 10.0.1.1 -p 5001 -P 1"));
        assert_eq!(clients[1].0, "10.0.1.3");
        assert!(clients[1].1.starts_with("iperf -c 10.0.1.1 -p 5002 -P 32"));

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn tcp2_vs_32_tenants() -> Result<(), failure::Error> {
        let rec = Recorder::new();
        let dir = scratch_dir("tcp2-vs-32-iso");
        let opts = options(&dir);
        let mut exp = Experiment::new(&opts, &rec.connector())?;

        let report = exp.run(&mut Tcp2Vs32::new(&opts)?);
        assert!(report.is_success(), "{}", report);

        assert!(rec
            .commands("10.0.1.3")
            .iter()
            .any(|c| c.starts_with("ifconfig eth2:2 11.2.1.3")));
        let clients = clients(&rec);
        assert!(clients[1].1.starts_with("iperf -c 11.2.1.1 -p 5002 -P 32"));

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }
}
