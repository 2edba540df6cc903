//! The set of hosts an experiment drives.
//!
//! Operations fan out over the sessions in registry order. `for_each` keeps going past per-host
//! failures and hands back everything it saw; `try_for_each` is for the steps where one broken
//! host makes the rest pointless (module load, interface reset) and stops at the first error.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{error, warn};

use crate::config::{HostConfig, ModuleConfig};
use crate::error::RunnerError;
use crate::isolation;
use crate::process::{ProcessHandle, RunOptions};
use crate::session::RemoteSession;
use crate::tenant::{self, Tenant, TenantId};
use crate::transport::{CommandOutput, Connector, Transport, UnreachableTransport};

/// Per-host results of a fanned-out operation, in registry order.
#[derive(Debug)]
pub struct FanOut<T> {
    results: Vec<(String, Result<T, RunnerError>)>,
}

impl<T> FanOut<T> {
    pub fn is_ok(&self) -> bool {
        self.results.iter().all(|(_, r)| r.is_ok())
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn results(&self) -> &[(String, Result<T, RunnerError>)] {
        &self.results
    }

    /// The failures, with the host they happened on.
    pub fn errors(&self) -> impl Iterator<Item = (&str, &RunnerError)> {
        self.results.iter().filter_map(|(host, r)| match r {
            Err(e) => Some((host.as_str(), e)),
            Ok(_) => None,
        })
    }

    /// Log every failure as a warning, naming the operation.
    pub fn warn(&self, what: &str) -> &Self {
        for (host, e) in self.errors() {
            warn!("{}: {} failed: {}", host, what, e);
        }
        self
    }

    /// Split into the successful values and the errors.
    pub fn partition(self) -> (Vec<T>, Vec<RunnerError>) {
        let mut values = vec![];
        let mut errors = vec![];
        for (_, r) in self.results.into_iter() {
            match r {
                Ok(v) => values.push(v),
                Err(e) => errors.push(e),
            }
        }
        (values, errors)
    }

    /// All values, or the first error.
    pub fn into_result(self) -> Result<Vec<T>, RunnerError> {
        self.results.into_iter().map(|(_, r)| r).collect()
    }
}

pub struct HostRegistry {
    sessions: Vec<RemoteSession>,
}

impl HostRegistry {
    pub fn new(sessions: Vec<RemoteSession>) -> Self {
        HostRegistry { sessions }
    }

    /// Open a session to every host, in order. Hosts whose tenant addresses would collide are
    /// rejected before anything is connected. A host that cannot be connected still gets a
    /// session, one whose every command fails with the connection error.
    pub fn connect(hosts: &[HostConfig], connector: &dyn Connector) -> Result<Self, RunnerError> {
        let data_ips: Vec<_> = hosts.iter().filter_map(HostConfig::data_ip).collect();
        tenant::check_distinct(&data_ips)?;

        let sessions = hosts
            .iter()
            .map(|host| {
                let transport: Arc<dyn Transport> = match connector.connect(host) {
                    Ok(transport) => transport,
                    Err(e) => {
                        warn!("{}: continuing without it: {}", host.addr, e);
                        let reason = match e {
                            RunnerError::Connection { reason, .. } => reason,
                            other => other.to_string(),
                        };
                        Arc::new(UnreachableTransport::new(&host.addr, reason))
                    }
                };
                RemoteSession::new(host.clone(), transport)
            })
            .collect();

        Ok(HostRegistry { sessions })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&RemoteSession> {
        self.sessions.get(i)
    }

    pub fn get_mut(&mut self, i: usize) -> Option<&mut RemoteSession> {
        self.sessions.get_mut(i)
    }

    /// The session at `i`, or an `InvalidState` error naming what it was needed for.
    pub fn host(&mut self, i: usize, role: &str) -> Result<&mut RemoteSession, RunnerError> {
        let len = self.sessions.len();
        self.sessions.get_mut(i).ok_or_else(|| {
            RunnerError::invalid_state(format!(
                "{} needs host #{} but only {} are configured",
                role, i, len
            ))
        })
    }

    pub fn sessions(&self) -> &[RemoteSession] {
        &self.sessions
    }

    pub fn sessions_mut(&mut self) -> &mut [RemoteSession] {
        &mut self.sessions
    }

    pub fn set_dry_run(&mut self, dry_run: bool) {
        for s in self.sessions.iter_mut() {
            s.set_dry_run(dry_run);
        }
    }

    /// Apply `f` to every session in order, collecting every result.
    pub fn for_each<T, F>(&mut self, mut f: F) -> FanOut<T>
    where
        F: FnMut(&mut RemoteSession) -> Result<T, RunnerError>,
    {
        let results = self
            .sessions
            .iter_mut()
            .map(|s| {
                let r = f(s);
                (s.addr().to_owned(), r)
            })
            .collect();
        FanOut { results }
    }

    /// Apply `f` to every session in order, stopping at the first failure.
    pub fn try_for_each<T, F>(&mut self, mut f: F) -> Result<Vec<T>, RunnerError>
    where
        F: FnMut(&mut RemoteSession) -> Result<T, RunnerError>,
    {
        let mut values = Vec::with_capacity(self.sessions.len());
        for s in self.sessions.iter_mut() {
            match f(s) {
                Ok(v) => values.push(v),
                Err(e) => {
                    error!("{}: {}", s.addr(), e);
                    return Err(e);
                }
            }
        }
        Ok(values)
    }

    pub fn broadcast(&mut self, command: &str) -> FanOut<CommandOutput> {
        self.for_each(|s| s.run(command))
    }

    pub fn broadcast_async(&mut self, command: &str, opts: &RunOptions) -> FanOut<ProcessHandle> {
        self.for_each(|s| s.run_async(command, opts))
    }

    pub fn set_delayed(&mut self, delayed: bool) -> FanOut<()> {
        self.for_each(|s| s.set_delayed(delayed))
    }

    pub fn flush_all(&mut self) -> FanOut<()> {
        self.for_each(RemoteSession::flush)
    }

    /// Create tenant `id` on every host. Each host derives the tenant address from its own data
    /// address.
    pub fn create_tenant(
        &mut self,
        module: &ModuleConfig,
        id: TenantId,
        weight: Option<u32>,
    ) -> FanOut<Tenant> {
        self.for_each(|s| isolation::create_ip_tenant(s, module, id, weight))
    }

    pub fn remove_all_tenants(&mut self, module: &ModuleConfig) -> FanOut<()> {
        self.for_each(|s| isolation::remove_tenants(s, module))
    }

    /// Reload the module everywhere and apply `params`. Fail-fast.
    pub fn load_module(
        &mut self,
        module: &ModuleConfig,
        params: &BTreeMap<String, String>,
    ) -> Result<(), RunnerError> {
        self.try_for_each(|s| {
            isolation::rmmod(s, module)?;
            isolation::insmod(s, module)?;
            for (name, value) in params.iter() {
                isolation::set_param(s, module, name, value)?;
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Unload the module everywhere. Fail-fast.
    pub fn unload_module(&mut self, module: &ModuleConfig) -> Result<(), RunnerError> {
        self.try_for_each(|s| isolation::rmmod(s, module))?;
        Ok(())
    }

    /// Bring the isolation devices into a known state: offloads off, no qdiscs, and the given
    /// MTU. Fail-fast.
    pub fn reset_ifaces(&mut self, mtu: Option<u32>) -> Result<(), RunnerError> {
        self.try_for_each(|s| {
            isolation::prepare_iface(s)?;
            isolation::remove_qdiscs(s)?;
            if let Some(mtu) = mtu {
                isolation::set_mtu(s, mtu)?;
            }
            Ok(())
        })?;
        Ok(())
    }

    pub fn killall(&mut self, names: &str) -> FanOut<()> {
        self.for_each(|s| isolation::killall(s, names))
    }

    pub fn ipt_ebt_flush(&mut self) -> FanOut<()> {
        self.for_each(isolation::ipt_ebt_flush)
    }

    pub fn configure_rps(&mut self) -> FanOut<()> {
        self.for_each(isolation::configure_rps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::{Kind, Recorder};

    fn registry(rec: &Recorder, n: u8) -> Result<HostRegistry, RunnerError> {
        let hosts: Vec<_> = (1..=n)
            .map(|i| HostConfig::new(format!("10.0.1.{}", i)))
            .collect();
        HostRegistry::connect(&hosts, &rec.connector())
    }

    #[test]
    fn broadcast_runs_once_per_host_in_order() -> Result<(), failure::Error> {
        let rec = Recorder::new();
        let mut reg = registry(&rec, 4)?;

        let out = reg.broadcast("uptime");
        assert!(out.is_ok());
        assert_eq!(out.len(), 4);

        let hosts: Vec<_> = rec
            .records()
            .into_iter()
            .filter(|r| r.kind == Kind::Run && r.command == "uptime")
            .map(|r| r.host)
            .collect();
        assert_eq!(hosts, vec!["10.0.1.1", "10.0.1.2", "10.0.1.3", "10.0.1.4"]);

        Ok(())
    }

    #[test]
    fn for_each_collects_past_failures() -> Result<(), failure::Error> {
        let rec = Recorder::new();
        let mut reg = registry(&rec, 3)?;
        rec.unreachable("10.0.1.2");

        let out = reg.broadcast("uptime");
        assert!(!out.is_ok());
        let errors: Vec<_> = out.errors().map(|(h, _)| h.to_owned()).collect();
        assert_eq!(errors, vec!["10.0.1.2"]);
        assert_eq!(rec.commands("10.0.1.3"), vec!["uptime".to_owned()]);

        let (ok, failed) = out.partition();
        assert_eq!(ok.len(), 2);
        assert_eq!(failed.len(), 1);

        Ok(())
    }

    #[test]
    fn fail_fast_stops_at_first_failure() -> Result<(), failure::Error> {
        let rec = Recorder::new();
        let mut reg = registry(&rec, 3)?;
        rec.fail_on("10.0.1.2", "insmod");

        let module = ModuleConfig::default();
        match reg.load_module(&module, &BTreeMap::new()) {
            Err(RunnerError::Execution { host, .. }) => assert_eq!(host, "10.0.1.2"),
            other => panic!("expected execution error, got {:?}", other),
        }
        assert!(rec.commands("10.0.1.3").is_empty());

        Ok(())
    }

    #[test]
    fn tenants_use_each_hosts_address() -> Result<(), failure::Error> {
        let rec = Recorder::new();
        let mut reg = registry(&rec, 2)?;
        let module = ModuleConfig::default();

        let tenants = reg
            .create_tenant(&module, TenantId::new(7)?, None)
            .into_result()?;
        let ips: Vec<_> = tenants.iter().map(|t| t.ip.to_string()).collect();
        assert_eq!(ips, vec!["11.7.1.1", "11.7.1.2"]);

        assert!(reg.remove_all_tenants(&module).is_ok());
        assert!(reg.sessions().iter().all(|s| s.tenants().is_empty()));

        Ok(())
    }

    #[test]
    fn colliding_hosts_are_rejected_before_connecting() {
        let rec = Recorder::new();
        let hosts = vec![HostConfig::new("10.0.1.1"), HostConfig::new("10.9.1.1")];

        match HostRegistry::connect(&hosts, &rec.connector()) {
            Err(RunnerError::Configuration { .. }) => {}
            Err(e) => panic!("expected configuration error, got {:?}", e),
            Ok(_) => panic!("expected configuration error"),
        }
        assert!(rec.records().is_empty());
    }

    #[test]
    fn unreachable_host_does_not_stop_the_others() -> Result<(), failure::Error> {
        let rec = Recorder::new();
        let inner = rec.clone();
        let connector = move |host: &HostConfig| -> Result<Arc<dyn Transport>, RunnerError> {
            if host.addr == "10.0.1.2" {
                Err(RunnerError::connection(&host.addr, "connection refused"))
            } else {
                Ok(Arc::new(inner.transport(&host.addr)))
            }
        };
        let hosts: Vec<_> = (1..=3)
            .map(|i| HostConfig::new(format!("10.0.1.{}", i)))
            .collect();
        let mut reg = HostRegistry::connect(&hosts, &connector)?;
        assert_eq!(reg.len(), 3);

        let out = reg.broadcast("uptime");
        let errors: Vec<_> = out.errors().collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, "10.0.1.2");
        assert_eq!(
            errors[0].1.to_string(),
            "unable to reach 10.0.1.2: connection refused"
        );
        assert_eq!(rec.commands("10.0.1.1"), vec!["uptime".to_owned()]);
        assert_eq!(rec.commands("10.0.1.3"), vec!["uptime".to_owned()]);

        match reg.unload_module(&ModuleConfig::default()) {
            Err(RunnerError::Connection { host, .. }) => assert_eq!(host, "10.0.1.2"),
            other => panic!("expected connection error, got {:?}", other),
        }

        Ok(())
    }

    #[test]
    fn flush_all_sends_one_batch_per_host() -> Result<(), failure::Error> {
        let rec = Recorder::new();
        let mut reg = registry(&rec, 2)?;

        reg.set_delayed(true).into_result()?;
        reg.broadcast("a");
        reg.broadcast("b");
        assert!(rec.records().is_empty());

        reg.flush_all().into_result()?;
        assert_eq!(rec.commands("10.0.1.1"), vec!["{ a; } && { b; }".to_owned()]);
        assert_eq!(rec.commands("10.0.1.2"), vec!["{ a; } && { b; }".to_owned()]);

        Ok(())
    }
}
