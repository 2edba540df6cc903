//! Receive-side overhead of virtual queues.
//!
//! Host 0 receives, host 1 sends. With VQs, host 0 drains its VQs at `rate` Mbit/s and there
//! are `tenants` iperf pairs, one per VQ. With `without_vq`, only the sender loads the module
//! and caps itself at `rate` through `ISO_MAX_TX_RATE`, so the receiver runs a stock stack.
//! With isolation off, no host loads the module and the `tenants` pairs all target the
//! receiver's own address.
//!
//! Options, besides the common ones (`rate` is required unless isolation is off):
//! `without_vq`, `P` (connections per pair, default 4).

use std::time::Duration;

use serde::Deserialize;

use crate::config::{parse_options, ExperimentConfig, MonitorConfig};
use crate::error::RunnerError;
use crate::experiment::{Experiment, Scenario};
use crate::isolation;
use crate::monitor;
use crate::traffic::{Iperf, IPERF_PORT};

const RECEIVER: usize = 0;
const SENDER: usize = 1;

#[derive(Clone, Debug, Deserialize)]
pub struct RxOverheadOptions {
    #[serde(default)]
    pub without_vq: bool,

    #[serde(default = "default_parallel", rename = "P", alias = "parallel")]
    pub parallel: usize,
}

fn default_parallel() -> usize {
    4
}

pub struct RxOverhead {
    opts: RxOverheadOptions,
}

impl RxOverhead {
    pub fn new(options: &serde_json::Value) -> Result<Self, RunnerError> {
        Ok(RxOverhead {
            opts: parse_options(options)?,
        })
    }
}

impl Scenario for RxOverhead {
    fn name(&self) -> &str {
        if self.opts.without_vq {
            "rx-overhead-without-vq"
        } else {
            "rx-overhead"
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
        let registry = exp.registry_mut();
        registry.unload_module(&module)?;
        registry.reset_ifaces(mtu)?;

        if !exp.config().isolation {
            return Ok(());
        }

        let rate = exp.config().require_rate(self.name())?;
        if self.opts.without_vq {
            let sender = exp.host(SENDER, "the sender")?;
            isolation::insmod(sender, &module)?;
            exp.set_param_on(SENDER, "ISO_MAX_TX_RATE", rate)?;
            exp.create_tenant_on(SENDER, 1, None)?;
        } else {
            let params = exp.config().params.clone();
            exp.registry_mut().load_module(&module, &params)?;
            exp.set_param_on(RECEIVER, "ISO_VQ_DRAIN_RATE_MBPS", rate)?;

            exp.log("creating vq classes");
            let n = exp.config().tenants;
            exp.create_tenants(n, None)?;
        }

        Ok(())
    }

    fn start(&mut self, exp: &mut Experiment) -> Result<(), failure::Error> {
        exp.log("starting CPU/bandwidth monitors");
        let monitors = monitor::standard(
            &MonitorConfig {
                profile: true,
                ..exp.config().monitors.clone()
            },
            exp.duration(),
        );
        exp.start_monitors_with(&monitors);

        // Without VQs there is a single tenant, on the sender; all traffic goes to the
        // receiver's own address. Without isolation every pair targets that address.
        let isolated = exp.config().isolation;
        let n = if self.opts.without_vq && isolated {
            1
        } else {
            exp.config().tenants
        };

        exp.log(format!("starting {} iperfs", n));
        for i in 0..n {
            let port = IPERF_PORT + i as u16;
            exp.launch(RECEIVER, &Iperf::server(port), None);
        }
        exp.on_stop(RECEIVER, "killall -9 iperf");

        exp.sleep(Duration::from_secs(1));

        let t = exp.config().duration;
        for i in 0..n {
            let target = if self.opts.without_vq || !isolated {
                exp.data_ip(RECEIVER)?
            } else {
                exp.tenant_ip(RECEIVER, i + 1)?
            };
            let client = Iperf::client(target, IPERF_PORT + i as u16)
                .parallel(self.opts.parallel)
                .duration(t)
                .output(exp.output_path(&format!("iperf-{}.txt", i)));
            if exp.launch(SENDER, &client, None).is_none() {
                exp.log(format!("client {} did not start", i));
            }
        }
        exp.on_stop(SENDER, "killall -9 iperf");

        Ok(())
    }
}
