//! A memcached cluster sharing the network with UDP cross traffic.
//!
//! The first `ns` hosts run memcached, the next `nc` run memaslap against all of the servers,
//! and every host runs the load generator replaying the `traffic` matrix. With isolation
//! enabled, memcached traffic and load generator traffic each get their own tenant.

use std::net::Ipv4Addr;
use std::time::Duration;

use log::warn;
use serde::Deserialize;

use crate::config::{parse_options, ExperimentConfig};
use crate::error::RunnerError;
use crate::experiment::{Experiment, Scenario};
use crate::traffic::{Loadgen, Memaslap, Memcached};

pub const MEMASLAP_TID: usize = 1;
pub const LOADGEN_TID: usize = 2;

#[derive(Clone, Debug, Deserialize)]
pub struct MemcachedOptions {
    /// Number of servers.
    #[serde(default = "default_ns")]
    pub ns: usize,

    /// Number of clients.
    #[serde(default = "default_nc")]
    pub nc: usize,

    /// memaslap configuration file on the clients. No memaslap without one.
    #[serde(default)]
    pub memaslap: Option<String>,

    /// Cross traffic matrix for the load generator. No load generator without one.
    #[serde(default)]
    pub traffic: Option<String>,

    /// Which tenants generate traffic: `udp`, `mem` or both, comma separated.
    #[serde(default = "default_active")]
    pub active: String,

    #[serde(default = "default_loadgen")]
    pub loadgen: String,
}

fn default_ns() -> usize {
    4
}

fn default_nc() -> usize {
    12
}

fn default_active() -> String {
    "udp,mem".into()
}

fn default_loadgen() -> String {
    "loadgen".into()
}

impl MemcachedOptions {
    fn is_active(&self, kind: &str) -> bool {
        self.active.split(',').any(|a| a.trim() == kind)
    }
}

pub struct MemcachedCluster {
    opts: MemcachedOptions,
}

impl MemcachedCluster {
    pub fn new(options: &serde_json::Value) -> Result<Self, RunnerError> {
        let opts: MemcachedOptions = parse_options(options)?;
        if opts.ns == 0 {
            return Err(RunnerError::configuration("need at least one server"));
        }
        Ok(MemcachedCluster { opts })
    }

    /// The address other hosts use to reach tenant `tid` of host `i`.
    fn addr(&self, exp: &mut Experiment, i: usize, tid: usize) -> Result<Ipv4Addr, RunnerError> {
        if exp.config().isolation {
            exp.tenant_ip(i, tid)
        } else {
            exp.data_ip(i)
        }
    }

    fn start_memaslap(&self, exp: &mut Experiment) -> Result<(), RunnerError> {
        let config = match (&self.opts.memaslap, self.opts.is_active("mem")) {
            (Some(config), true) => config.clone(),
            _ => return Ok(()),
        };

        let servers = (0..self.opts.ns)
            .map(|i| self.addr(exp, i, MEMASLAP_TID))
            .collect::<Result<Vec<_>, _>>()?;
        let t = exp.config().duration.saturating_sub(5).max(1);

        for i in self.opts.ns..self.opts.ns + self.opts.nc {
            let mut memaslap = Memaslap::new(&servers, t, config.clone());
            memaslap.output = Some(exp.output_path("memaslap.txt"));
            exp.launch(i, &memaslap, None);
        }

        Ok(())
    }

    fn start_loadgen(&self, exp: &mut Experiment) -> Result<(), RunnerError> {
        let traffic = match (&self.opts.traffic, self.opts.is_active("udp")) {
            (Some(traffic), true) => traffic.clone(),
            _ => return Ok(()),
        };

        let mut triggers = vec![];
        for i in 0..exp.registry().len() {
            let mut loadgen = Loadgen::new(self.addr(exp, i, LOADGEN_TID)?, traffic.clone());
            loadgen.binary = self.opts.loadgen.clone();
            loadgen.output = Some(exp.output_path("loadgen.txt"));
            if exp.launch(i, &loadgen, None).is_some() {
                triggers.push(loadgen.trigger_command());
            }
        }

        // The generators wait for a connection on their control port before sending.
        for trigger in triggers.iter() {
            exp.sleep(Duration::from_secs(2));
            if let Err(e) = exp.local().run_lenient(trigger) {
                warn!("`{}` failed: {}", trigger, e);
            }
        }

        Ok(())
    }
}

impl Scenario for MemcachedCluster {
    fn name(&self) -> &str {
        "memcached-cluster"
    }

    fn validate(&self, config: &ExperimentConfig) -> Result<(), RunnerError> {
        config.require_hosts(self.opts.ns + self.opts.nc)
    }

    fn initialise(&mut self, exp: &mut Experiment) -> Result<(), failure::Error> {
        let module = exp.config().module.clone();
        let params = exp.config().params.clone();
        let mtu = exp.config().mtu;

        let registry = exp.registry_mut();
        registry.unload_module(&module)?;
        registry.reset_ifaces(mtu)?;

        if exp.config().isolation {
            exp.registry_mut().load_module(&module, &params)?;
            // Tenant ids are dense: this creates both.
            exp.create_tenants(LOADGEN_TID, None)?;
        }

        Ok(())
    }

    fn start(&mut self, exp: &mut Experiment) -> Result<(), failure::Error> {
        for i in 0..self.opts.ns {
            let ip = exp.data_ip(i)?;
            exp.log(format!("server {}", ip));
            exp.launch(i, &Memcached::default(), None);
        }
        for i in 0..exp.registry().len() {
            exp.on_stop(i, "killall -9 memaslap memcached loadgen");
        }

        exp.sleep(Duration::from_secs(2));
        self.start_memaslap(exp)?;

        exp.start_monitors();

        self.start_loadgen(exp)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::testing::{scratch_dir, Kind, Recorder};

    fn options(dir: &std::path::Path) -> serde_json::Value {
        json!({
            "hosts": ["10.0.1.1", "10.0.1.2", "10.0.1.3"],
            "dir": dir.to_string_lossy(),
            "ns": 1,
            "nc": 2,
            "memaslap": "/root/memaslap.cnf",
            "traffic": "/root/matrix",
            "t": 1,
            "exptid": "mc",
        })
    }

    #[test]
    fn active_tenants() -> Result<(), failure::Error> {
        let mc = MemcachedCluster::new(&json!({ "hosts": ["h"], "dir": "/tmp", "active": "udp" }))?;
        assert!(mc.opts.is_active("udp"));
        assert!(!mc.opts.is_active("mem"));
        assert!(MemcachedCluster::new(&json!({ "hosts": ["h"], "dir": "/tmp", "ns": 0 })).is_err());
        Ok(())
    }

    #[test]
    fn too_few_hosts() -> Result<(), failure::Error> {
        let rec = Recorder::new();
        let dir = scratch_dir("mc-few");
        let mut opts = options(&dir);
        opts["nc"] = json!(12);
        let mut exp = Experiment::new(&opts, &rec.connector())?;

        let report = exp.run(&mut MemcachedCluster::new(&opts)?);
        assert!(report.failed.contains(crate::experiment::Phases::INITIALISE));
        assert!(rec.records().iter().all(|r| r.kind == Kind::Fetch));

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn cluster_layout() -> Result<(), failure::Error> {
        let rec = Recorder::new();
        let dir = scratch_dir("mc");
        let mut opts = options(&dir);
        // Keep the load generator triggers off the network.
        opts["active"] = json!("mem");
        let mut exp = Experiment::new(&opts, &rec.connector())?;

        let report = exp.run(&mut MemcachedCluster::new(&opts)?);
        assert!(report.is_success(), "{}", report);

        let spawned: Vec<_> = rec
            .records()
            .into_iter()
            .filter(|r| r.kind == Kind::Spawn && !r.command.starts_with("while"))
            .map(|r| (r.host, r.command))
            .collect();

        assert!(spawned[0].0 == "10.0.1.1" && spawned[0].1.starts_with("memcached"));
        let clients: Vec<_> = spawned.iter().filter(|(_, c)| c.starts_with("memaslap")).collect();
        assert_eq!(clients.len(), 2);
        assert_eq!(clients[0].0, "10.0.1.2");
        assert!(clients[0].1.starts_with("memaslap -s 11.1.1.1:11211 -S 1s -t 1s"));
        assert!(!spawned.iter().any(|(_, c)| c.starts_with("loadgen")));

        for host in ["10.0.1.1", "10.0.1.2", "10.0.1.3"].iter() {
            assert!(rec
                .commands(host)
                .contains(&"killall -9 memaslap memcached loadgen".to_owned()));
        }

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }
}
