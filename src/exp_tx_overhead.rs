//! Transmit-side overhead of rate limiting: the module's tx classes against an HTB qdisc.
//!
//! Host 0 sends through `tenants` rate limiters of `rate` Mbit/s each, with `m` iperf clients per
//! tenant pinned to successive CPUs. Host 1 runs the iperf server. With isolation off there is
//! no limiter and the same clients send from the sender's own address.

use std::time::Duration;

use serde::Deserialize;

use crate::config::{parse_options, ExperimentConfig, MonitorConfig};
use crate::error::RunnerError;
use crate::experiment::{Experiment, Scenario};
use crate::isolation;
use crate::monitor;
use crate::tenant::{Tenant, TenantId};
use crate::traffic::{Iperf, IPERF_PORT};

const SENDER: usize = 0;
const RECEIVER: usize = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimiter {
    Perfiso,
    Htb,
}

impl Default for RateLimiter {
    fn default() -> Self {
        RateLimiter::Perfiso
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct TxOverheadOptions {
    #[serde(default)]
    pub rl: RateLimiter,

    /// iperf clients per tenant.
    #[serde(default = "default_m")]
    pub m: usize,

    #[serde(default = "default_parallel", rename = "P", alias = "parallel")]
    pub parallel: usize,

    /// Token bucket timeout of the module, in ns.
    #[serde(default = "default_timeout_ns", alias = "timeout")]
    pub timeout_ns: u64,

    #[serde(default)]
    pub profile: bool,
}

fn default_m() -> usize {
    1
}

fn default_parallel() -> usize {
    4
}

fn default_timeout_ns() -> u64 {
    50_000
}

pub struct TxOverhead {
    opts: TxOverheadOptions,
}

impl TxOverhead {
    pub fn new(options: &serde_json::Value) -> Result<Self, RunnerError> {
        let opts: TxOverheadOptions = parse_options(options)?;
        if opts.timeout_ns <= 1000 {
            return Err(RunnerError::configuration(format!(
                "token bucket timeout of {}ns is too low",
                opts.timeout_ns
            )));
        }
        if opts.m == 0 {
            return Err(RunnerError::configuration("`m` must be positive"));
        }
        Ok(TxOverhead { opts })
    }

    fn setup_perfiso(&self, exp: &mut Experiment, n: usize, rate: u64) -> Result<(), RunnerError> {
        let module = exp.config().module.clone();
        let params = exp.config().params.clone();
        let total = n as u64 * rate;

        exp.registry_mut().load_module(&module, &params)?;
        exp.set_param_all("ISO_VQ_DRAIN_RATE_MBPS", 11000)?;
        exp.set_param_all("ISO_MAX_TX_RATE", total)?;
        exp.set_param_all("ISO_RFAIR_INITIAL", total)?;
        exp.set_param_all("ISO_TOKENBUCKET_TIMEOUT_NS", self.opts.timeout_ns)?;

        // All the tx classes of a host go out in one batch.
        exp.track_tenants();
        let registry = exp.registry_mut();
        registry.set_delayed(true).into_result()?;
        for tid in 1..=n {
            let tid = TenantId::new(tid)?;
            registry
                .for_each(|s| isolation::create_tx_tenant(s, &module, tid))
                .into_result()?;
        }
        registry.set_delayed(false).into_result()?;

        Ok(())
    }

    fn setup_htb(&self, exp: &mut Experiment, n: usize, rate: u64) -> Result<(), RunnerError> {
        let sender_ip = exp.data_ip(SENDER)?;
        let tenants = (1..=n)
            .map(|tid| -> Result<_, RunnerError> {
                Ok(Tenant::new(sender_ip, TenantId::new(tid)?))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let sender = exp.host(SENDER, "the sender")?;
        isolation::configure_htb(sender, rate, &tenants)?;
        let cleanup = format!("tc qdisc del dev {} root", sender.dev());
        exp.on_stop(SENDER, cleanup);

        // No module: tenants are only addresses.
        exp.track_tenants();
        for tid in 1..=n {
            let tid = TenantId::new(tid)?;
            exp.registry_mut()
                .for_each(|s| isolation::create_alias_tenant(s, tid))
                .into_result()?;
        }

        Ok(())
    }
}

impl Scenario for TxOverhead {
    fn name(&self) -> &str {
        match self.opts.rl {
            RateLimiter::Perfiso => "tx-overhead-perfiso",
            RateLimiter::Htb => "tx-overhead-htb",
        }
    }

    fn validate(&self, config: &ExperimentConfig) -> Result<(), RunnerError> {
        config.require_hosts(2)?;
        if config.isolation {
            config.require_rate(self.name())?;
        }
        Ok(())
    }

    fn initialise(&mut self, exp: &mut Experiment) -> Result<(), failure::Error> {
        let module = exp.config().module.clone();
        let mtu = exp.config().mtu;
        let n = exp.config().tenants;

        let registry = exp.registry_mut();
        registry.unload_module(&module)?;
        registry.reset_ifaces(mtu)?;
        registry.configure_rps().into_result()?;

        if exp.config().isolation {
            let rate = exp.config().require_rate(self.name())?;
            match self.opts.rl {
                RateLimiter::Perfiso => self.setup_perfiso(exp, n, rate)?,
                RateLimiter::Htb => self.setup_htb(exp, n, rate)?,
            }
        }

        let registry = exp.registry_mut();
        registry.killall("iperf").into_result()?;
        registry.broadcast("iptables -F").into_result()?;

        Ok(())
    }

    fn start(&mut self, exp: &mut Experiment) -> Result<(), failure::Error> {
        exp.log("starting CPU/bandwidth monitors");
        let monitors = monitor::standard(
            &MonitorConfig {
                profile: self.opts.profile,
                ..exp.config().monitors.clone()
            },
            exp.duration(),
        );
        exp.start_monitors_with(&monitors);

        let n = exp.config().tenants;
        exp.log(format!("starting {} iperfs", n * self.opts.m));

        let server = Iperf::server(IPERF_PORT);
        exp.launch(RECEIVER, &server, None);
        exp.on_stop(RECEIVER, "killall -9 iperf");

        exp.sleep(Duration::from_secs(1));

        let t = exp.config().duration;
        let isolated = exp.config().isolation;
        let mut cpu = 0;
        for i in 1..=n {
            let target = if isolated {
                exp.tenant_ip(RECEIVER, i)?
            } else {
                exp.data_ip(RECEIVER)?
            };
            let bind = if isolated {
                Some(exp.tenant_ip(SENDER, i)?)
            } else {
                None
            };
            for j in 0..self.opts.m {
                let mut client = Iperf::client(target, IPERF_PORT)
                    .parallel(self.opts.parallel)
                    .duration(t)
                    .output(exp.output_path(&format!("iperf-{}-{}.txt", i, j)));
                client.bind = bind;
                exp.launch(SENDER, &client, Some(cpu));
                cpu += 1;
            }
        }
        exp.on_stop(SENDER, "killall -9 iperf");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::testing::{scratch_dir, Kind, Recorder};

    fn options(dir: &std::path::Path, rl: &str) -> serde_json::Value {
        json!({
            "hosts": ["10.0.1.1", "10.0.1.2"],
            "dir": dir.to_string_lossy(),
            "rate": 1000,
            "rl": rl,
            "n": 2,
            "m": 2,
            "t": 1,
            "exptid": "tx",
        })
    }

    #[test]
    fn option_checks() {
        let base = json!({ "hosts": ["h"], "dir": "/tmp", "rate": 100 });
        assert!(TxOverhead::new(&base).is_ok());

        let mut bad = base.clone();
        bad["rl"] = json!("hfsc");
        assert!(TxOverhead::new(&bad).is_err());

        let mut bad = base.clone();
        bad["timeout"] = json!(500);
        assert!(TxOverhead::new(&bad).is_err());
    }

    #[test]
    fn perfiso_classes_are_batched() -> Result<(), failure::Error> {
        let rec = Recorder::new();
        let dir = scratch_dir("tx-perfiso");
        let opts = options(&dir, "perfiso");
        let mut exp = Experiment::new(&opts, &rec.connector())?;

        let report = exp.run(&mut TxOverhead::new(&opts)?);
        assert!(report.is_success(), "{}", report);

        for host in ["10.0.1.1", "10.0.1.2"].iter() {
            let cmds = rec.commands(host);
            assert!(cmds.contains(&"echo 2000 > /proc/sys/perfiso/ISO_MAX_TX_RATE".to_owned()));
            let batches: Vec<_> = cmds.iter().filter(|c| c.contains("create_txc")).collect();
            assert_eq!(batches.len(), 1);
            assert_eq!(batches[0].matches("create_txc").count(), 2);
        }

        // Four clients on the sender, pinned to CPUs 0 to 3.
        let clients: Vec<_> = rec
            .records()
            .into_iter()
            .filter(|r| r.kind == Kind::Spawn && r.command.contains("iperf -c"))
            .collect();
        assert_eq!(clients.len(), 4);
        assert!(clients[3]
            .command
            .starts_with("taskset -c 3 iperf -c 11.2.1.2 -p 5001 -P 4 -t 1 -B 11.2.1.1"));

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn without_isolation_there_is_no_limiter() -> Result<(), failure::Error> {
        let rec = Recorder::new();
        let dir = scratch_dir("tx-noiso");
        let mut opts = options(&dir, "htb");
        opts["isolation"] = json!(false);
        opts.as_object_mut()
            .ok_or_else(|| failure::format_err!("not a map"))?
            .remove("rate");
        let mut exp = Experiment::new(&opts, &rec.connector())?;

        let report = exp.run(&mut TxOverhead::new(&opts)?);
        assert!(report.is_success(), "{}", report);

        let sender = rec.commands("10.0.1.1");
        assert!(!sender.iter().any(|c| c.contains("htb") || c.starts_with("insmod")));
        assert!(!sender.iter().any(|c| c.starts_with("ifconfig eth2:")));

        let clients: Vec<_> = rec
            .records()
            .into_iter()
            .filter(|r| r.kind == Kind::Spawn && r.command.contains("iperf -c"))
            .collect();
        assert_eq!(clients.len(), 4);
        for client in clients.iter() {
            assert!(client.command.contains("iperf -c 10.0.1.2 -p 5001"));
            assert!(!client.command.contains(" -B "));
        }

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn limiter_needs_a_rate() -> Result<(), failure::Error> {
        let rec = Recorder::new();
        let dir = scratch_dir("tx-norate");
        let mut opts = options(&dir, "perfiso");
        opts.as_object_mut()
            .ok_or_else(|| failure::format_err!("not a map"))?
            .remove("rate");
        let mut exp = Experiment::new(&opts, &rec.connector())?;

        let report = exp.run(&mut TxOverhead::new(&opts)?);
        assert!(report.failed.contains(crate::experiment::Phases::INITIALISE));
        assert!(rec.records().iter().all(|r| r.kind == Kind::Fetch));

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn htb_needs_no_module() -> Result<(), failure::Error> {
        let rec = Recorder::new();
        let dir = scratch_dir("tx-htb");
        let opts = options(&dir, "htb");
        let mut exp = Experiment::new(&opts, &rec.connector())?;

        let report = exp.run(&mut TxOverhead::new(&opts)?);
        assert!(report.is_success(), "{}", report);

        let sender = rec.commands("10.0.1.1");
        assert!(!sender.iter().any(|c| c.starts_with("insmod")));
        assert!(sender
            .iter()
            .any(|c| c.contains("htb default 1000") && c.contains("classid 1:2 htb rate 1000Mbit")));
        assert!(sender.contains(&"tc qdisc del dev eth2 root".to_owned()));
        assert!(sender.iter().any(|c| c.starts_with("ifconfig eth2:2 11.2.1.1")));

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }
}
