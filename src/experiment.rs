//! The experiment lifecycle: `Created -> Initialized -> Running -> Stopped`.
//!
//! An `Experiment` owns everything a run acquires. Whenever a tenant, process or monitor comes
//! into existence, a matching `Release` is pushed onto the release list, and `stop` unwinds that
//! list in reverse. `stop` attempts every release even if some fail, so an error anywhere in a
//! run still leaves no processes behind and no tenants configured.
//!
//! What a particular experiment does is described by a `Scenario`.

use std::fmt;
use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use log::{error, info, warn};

use crate::config::{ExperimentConfig, HostConfig};
use crate::error::RunnerError;
use crate::isolation;
use crate::monitor::{self, Monitor, MonitorSupervisor};
use crate::process::{ExitStatus, ProcessHandle, RunOptions};
use crate::registry::HostRegistry;
use crate::session::RemoteSession;
use crate::tenant::{self, Tenant, TenantId};
use crate::traffic::TrafficDriver;
use crate::transport::{Connector, DefaultConnector, LocalTransport};

/// How long `sleep` naps between checks of the cancel flag.
const CANCEL_POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExperimentState {
    Created,
    Initialized,
    Running,
    Stopped,
}

bitflags! {
    /// Lifecycle phases, used to report where a run had errors.
    pub struct Phases: u8 {
        const INITIALISE = 0b0001;
        const START = 0b0010;
        const STOP = 0b0100;
        const COLLECT = 0b1000;
    }
}

impl Default for Phases {
    fn default() -> Self {
        Phases::empty()
    }
}

/// The outcome of a run.
#[derive(Clone, Debug, Default)]
pub struct RunReport {
    /// Every phase that had at least one error.
    pub failed: Phases,
    /// The errors, in the order they happened.
    pub errors: Vec<(Phases, String)>,
    /// The run was cut short by the cancel flag.
    pub cancelled: bool,
}

impl RunReport {
    pub fn record(&mut self, phase: Phases, err: impl fmt::Display) {
        self.failed |= phase;
        self.errors.push((phase, err.to_string()));
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }

    /// Process exit code: 0 for a clean run, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_success() {
            return write!(f, "completed without errors");
        }
        if self.cancelled {
            writeln!(f, "cancelled")?;
        }
        if !self.failed.is_empty() {
            writeln!(f, "errors in {:?}:", self.failed)?;
        }
        for (phase, e) in self.errors.iter() {
            writeln!(f, "  [{:?}] {}", phase, e)?;
        }
        Ok(())
    }
}

/// Refers to a process owned by an experiment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessId(usize);

/// Something to undo at `stop`.
#[derive(Clone, Debug, PartialEq)]
pub enum Release {
    /// Kill the process.
    Process(ProcessId),
    /// Stop every monitor.
    Monitors,
    /// Remove every tenant created on every host.
    Tenants,
    /// Run a cleanup command on a host. Its exit status is ignored.
    Command { host: usize, command: String },
}

/// The experiment-specific part of a run.
pub trait Scenario {
    fn name(&self) -> &str;

    /// Check that the experiment options suit the scenario. Runs before anything is written
    /// or any host is touched.
    fn validate(&self, _config: &ExperimentConfig) -> Result<(), RunnerError> {
        Ok(())
    }

    /// Bring the hosts into the state the experiment needs. Fail-fast: an error here means
    /// `start` never runs.
    fn initialise(&mut self, exp: &mut Experiment) -> Result<(), failure::Error> {
        exp.standard_setup()?;
        Ok(())
    }

    /// Start monitors and traffic.
    fn start(&mut self, exp: &mut Experiment) -> Result<(), failure::Error>;

    /// Let the experiment run. By default, sleep for the configured duration.
    fn wait(&mut self, exp: &mut Experiment) -> Result<(), failure::Error> {
        exp.sleep(exp.duration());
        Ok(())
    }

    /// Called first thing in `stop`, before any release.
    fn stop(&mut self, _exp: &mut Experiment) -> Result<(), failure::Error> {
        Ok(())
    }
}

pub struct Experiment {
    config: ExperimentConfig,
    exptid: String,
    state: ExperimentState,

    registry: HostRegistry,
    /// The machine the runner itself is on.
    local: RemoteSession,

    processes: Vec<ProcessHandle>,
    monitors: MonitorSupervisor,
    releases: Vec<Release>,

    report: RunReport,
    cancel: Arc<AtomicBool>,
}

impl Experiment {
    /// Parse the options and connect to every host over SSH (or not at all for dry runs).
    pub fn connect(options: &serde_json::Value) -> Result<Self, RunnerError> {
        let config = ExperimentConfig::from_options(options)?;
        let connector = DefaultConnector {
            dry_run: config.dry_run,
        };
        Experiment::with_config(config, &connector)
    }

    /// Parse the options and connect to every host through `connector`.
    pub fn new(options: &serde_json::Value, connector: &dyn Connector) -> Result<Self, RunnerError> {
        Experiment::with_config(ExperimentConfig::from_options(options)?, connector)
    }

    pub fn with_config(
        config: ExperimentConfig,
        connector: &dyn Connector,
    ) -> Result<Self, RunnerError> {
        config.validate()?;

        let mut registry = HostRegistry::connect(&config.hosts, connector)?;
        registry.set_dry_run(config.dry_run);

        let mut local = RemoteSession::new(
            HostConfig::new("localhost"),
            Arc::new(LocalTransport::new("localhost")),
        );
        local.set_dry_run(config.dry_run);

        Ok(Experiment {
            exptid: config.exptid(),
            config,
            state: ExperimentState::Created,
            registry,
            local,
            processes: vec![],
            monitors: MonitorSupervisor::new(),
            releases: vec![],
            report: RunReport::default(),
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn exptid(&self) -> &str {
        &self.exptid
    }

    pub fn state(&self) -> ExperimentState {
        self.state
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.config.duration)
    }

    pub fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut HostRegistry {
        &mut self.registry
    }

    /// The session for host `i`. `role` names what the host is needed for, for the error.
    pub fn host(&mut self, i: usize, role: &str) -> Result<&mut RemoteSession, RunnerError> {
        self.registry.host(i, role)
    }

    pub fn local(&mut self) -> &mut RemoteSession {
        &mut self.local
    }

    pub fn processes(&self) -> &[ProcessHandle] {
        &self.processes
    }

    pub fn process(&mut self, id: ProcessId) -> Option<&mut ProcessHandle> {
        self.processes.get_mut(id.0)
    }

    pub fn monitors(&self) -> &MonitorSupervisor {
        &self.monitors
    }

    pub fn releases(&self) -> &[Release] {
        &self.releases
    }

    pub fn report(&self) -> &RunReport {
        &self.report
    }

    /// Set this flag to cut the run short. `stop` still runs.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn log(&self, msg: impl fmt::Display) {
        info!("[{}] {}", self.exptid, msg);
    }

    /// Where hosts put their output for this run.
    pub fn staging_dir(&self) -> String {
        dir!(&self.config.remote_dir, &self.exptid)
    }

    /// A file in the staging directory.
    pub fn output_path(&self, file: &str) -> String {
        dir!(self.staging_dir(), file)
    }

    /// Where results for `host` are collected to.
    pub fn results_dir(&self, host: &str) -> PathBuf {
        PathBuf::from(&self.config.dir).join(host)
    }

    /// The data-plane address of host `i`.
    pub fn data_ip(&mut self, i: usize) -> Result<Ipv4Addr, RunnerError> {
        self.host(i, "an address lookup")?.data_ip()
    }

    /// The address of tenant `tid` on host `i`.
    pub fn tenant_ip(&mut self, i: usize, tid: usize) -> Result<Ipv4Addr, RunnerError> {
        let ip = self.data_ip(i)?;
        Ok(tenant::tenant_ip(ip, TenantId::new(tid)?))
    }

    fn expect_state(&self, expected: ExperimentState, op: &str) -> Result<(), RunnerError> {
        if self.state != expected {
            return Err(RunnerError::invalid_state(format!(
                "cannot {} an experiment that is {:?}",
                op, self.state
            )));
        }
        Ok(())
    }

    fn register(&mut self, release: Release) {
        if release == Release::Monitors || release == Release::Tenants {
            if self.releases.contains(&release) {
                return;
            }
        }
        self.releases.push(release);
    }

    /// Run `command` on host `host` at stop time.
    pub fn on_stop(&mut self, host: usize, command: impl Into<String>) {
        self.register(Release::Command {
            host,
            command: command.into(),
        });
    }

    ///////////////////////////////////////////////////////////////////////////////
    // Acquisition

    /// The setup most experiments share: unload the module, reset the interfaces, and with
    /// isolation enabled load the module and create the configured number of tenants.
    pub fn standard_setup(&mut self) -> Result<(), RunnerError> {
        self.registry.unload_module(&self.config.module)?;
        self.registry.reset_ifaces(self.config.mtu)?;

        if self.config.isolation {
            self.registry
                .load_module(&self.config.module, &self.config.params)?;
            self.create_tenants(self.config.tenants, None)?;
        }

        Ok(())
    }

    /// Create tenants `1..=count` on every host. Every host is attempted; the first error is
    /// returned.
    pub fn create_tenants(&mut self, count: usize, weight: Option<u32>) -> Result<(), RunnerError> {
        self.register(Release::Tenants);

        for tid in 1..=count {
            let tid = TenantId::new(tid)?;
            let created = self
                .registry
                .create_tenant(&self.config.module, tid, weight);
            created.warn("tenant creation");
            created.into_result()?;
        }

        Ok(())
    }

    /// Register tenants created by hand (through `isolation`) for removal at stop.
    pub fn track_tenants(&mut self) {
        self.register(Release::Tenants);
    }

    /// Create tenant `tid` on host `host` only.
    pub fn create_tenant_on(
        &mut self,
        host: usize,
        tid: usize,
        weight: Option<u32>,
    ) -> Result<Tenant, RunnerError> {
        self.register(Release::Tenants);
        let tid = TenantId::new(tid)?;
        let session = self.registry.host(host, "a tenant")?;
        isolation::create_ip_tenant(session, &self.config.module, tid, weight)
    }

    /// Set a module parameter on host `host`.
    pub fn set_param_on(
        &mut self,
        host: usize,
        name: &str,
        value: impl ToString,
    ) -> Result<(), RunnerError> {
        let session = self.registry.host(host, "a module parameter")?;
        isolation::set_param(session, &self.config.module, name, &value.to_string())
    }

    /// Set a module parameter on every host. Fail-fast.
    pub fn set_param_all(&mut self, name: &str, value: impl ToString) -> Result<(), RunnerError> {
        let value = value.to_string();
        let module = &self.config.module;
        self.registry
            .try_for_each(|s| isolation::set_param(s, module, name, &value))?;
        Ok(())
    }

    /// Start `command` in the background on host `host`. A failed launch is logged and
    /// recorded; the experiment carries on without it.
    pub fn run_async(&mut self, host: usize, command: &str, opts: &RunOptions) -> Option<ProcessId> {
        let launched = self
            .registry
            .host(host, "a background command")
            .and_then(|s| s.run_async(command, opts));
        self.adopt(launched)
    }

    /// Launch a traffic driver on host `host`. Failures are handled as for `run_async`.
    pub fn launch(
        &mut self,
        host: usize,
        driver: &dyn TrafficDriver,
        cpu: Option<usize>,
    ) -> Option<ProcessId> {
        let launched = self
            .registry
            .host(host, driver.name())
            .and_then(|s| driver.launch(s, cpu));
        self.adopt(launched)
    }

    fn adopt(&mut self, launched: Result<ProcessHandle, RunnerError>) -> Option<ProcessId> {
        match launched {
            Ok(handle) => {
                let id = ProcessId(self.processes.len());
                self.processes.push(handle);
                self.register(Release::Process(id));
                Some(id)
            }
            Err(e) => {
                warn!("launch failed: {}", e);
                self.report.record(Phases::START, e);
                None
            }
        }
    }

    /// Start the configured monitors on every host, writing into the staging directory.
    pub fn start_monitors(&mut self) {
        let monitors = monitor::standard(&self.config.monitors, self.duration());
        self.start_monitors_with(&monitors);
    }

    /// Start the given monitors on every host. A monitor that fails to start is logged and
    /// recorded.
    pub fn start_monitors_with(&mut self, monitors: &[Box<dyn Monitor>]) {
        self.register(Release::Monitors);

        let staging = self.staging_dir();
        for s in self.registry.sessions_mut().iter_mut() {
            for m in monitors.iter() {
                if let Err(e) = self.monitors.start(s, m.as_ref(), &staging) {
                    warn!("{}: {} monitor did not start: {}", s.addr(), m.metric(), e);
                    self.report.record(Phases::START, e);
                }
            }
        }
    }

    /// Sleep for `duration`, waking up early if the run is cancelled.
    pub fn sleep(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                self.log("cancelled");
                self.report.cancelled = true;
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep(std::cmp::min(CANCEL_POLL, deadline - now));
        }
    }

    /// Wait for every process in `ids` to exit, up to `timeout` for all of them together.
    /// Returns early (successfully) if the run is cancelled.
    pub fn wait_for(&mut self, ids: &[ProcessId], timeout: Option<Duration>) -> Result<(), RunnerError> {
        let deadline = timeout.map(|t| Instant::now() + t);

        for id in ids.iter() {
            loop {
                if self.is_cancelled() {
                    self.report.cancelled = true;
                    return Ok(());
                }

                let slice = match deadline {
                    Some(deadline) => std::cmp::min(
                        Duration::from_secs(1),
                        deadline.saturating_duration_since(Instant::now()),
                    ),
                    None => Duration::from_secs(1),
                };

                let handle = self.processes.get_mut(id.0).ok_or_else(|| {
                    RunnerError::invalid_state(format!("no process {:?}", id))
                })?;

                match handle.wait(Some(slice))? {
                    ExitStatus::Timeout => {
                        if deadline.map_or(false, |d| Instant::now() >= d) {
                            return Err(RunnerError::Timeout {
                                host: handle.host().to_owned(),
                                command: handle.command().to_owned(),
                                after: timeout.unwrap_or_default(),
                            });
                        }
                    }
                    _ => break,
                }
            }
        }

        Ok(())
    }

    ///////////////////////////////////////////////////////////////////////////////
    // Lifecycle

    /// `Created -> Initialized`. Writes the effective configuration to `params.json` in the
    /// output directory, creates the staging directories and runs the scenario's setup.
    pub fn initialise(&mut self, scenario: &mut dyn Scenario) -> Result<(), failure::Error> {
        self.expect_state(ExperimentState::Created, "initialise")?;
        self.log(format!(
            "initialising {} on {} hosts",
            scenario.name(),
            self.registry.len()
        ));

        scenario.validate(&self.config)?;

        fs::create_dir_all(&self.config.dir)?;
        let params = serde_json::to_string_pretty(&self.config)?;
        fs::write(PathBuf::from(&self.config.dir).join("params.json"), params)?;

        let staging = self.staging_dir();
        self.registry
            .try_for_each(|s| s.run(&format!("mkdir -p {}", staging)))?;

        scenario.initialise(self)?;
        self.registry.flush_all().into_result()?;

        self.state = ExperimentState::Initialized;
        Ok(())
    }

    /// `Initialized -> Running`.
    pub fn start(&mut self, scenario: &mut dyn Scenario) -> Result<(), failure::Error> {
        self.expect_state(ExperimentState::Initialized, "start")?;
        self.state = ExperimentState::Running;
        self.log(format!("starting {}", scenario.name()));

        scenario.start(self)?;
        self.registry.flush_all().into_result()?;

        Ok(())
    }

    /// Any state -> `Stopped`. Unwinds every release in reverse order, then collects results.
    /// Failures are logged and recorded in the report, never returned. Stopping a stopped
    /// experiment does nothing.
    pub fn stop(&mut self, scenario: &mut dyn Scenario) {
        if self.state == ExperimentState::Stopped {
            return;
        }
        self.log(format!("stopping {}", scenario.name()));

        if let Err(e) = scenario.stop(self) {
            warn!("{}: stop hook failed: {}", scenario.name(), e);
            self.report.record(Phases::STOP, e);
        }

        // Leave delayed mode so teardown commands run immediately. Whatever was still queued
        // goes out first.
        for (host, e) in self.registry.set_delayed(false).errors() {
            warn!("{}: flushing at stop failed: {}", host, e);
            self.report.record(Phases::STOP, e);
        }

        while let Some(release) = self.releases.pop() {
            self.release(release);
        }

        self.collect();

        self.state = ExperimentState::Stopped;
    }

    fn release(&mut self, release: Release) {
        match release {
            Release::Process(id) => {
                if let Some(handle) = self.processes.get_mut(id.0) {
                    if let Err(e) = handle.kill() {
                        warn!("{}: failed to kill `{}`: {}", handle.host(), handle.command(), e);
                        self.report.record(Phases::STOP, e);
                    }
                }
            }
            Release::Monitors => {
                for e in self.monitors.stop_all() {
                    self.report.record(Phases::STOP, e);
                }
            }
            Release::Tenants => {
                let removed = self.registry.remove_all_tenants(&self.config.module);
                removed.warn("tenant removal");
                for (_, e) in removed.errors() {
                    self.report.record(Phases::STOP, e);
                }
            }
            Release::Command { host, command } => {
                let ran = self
                    .registry
                    .host(host, "a cleanup command")
                    .and_then(|s| s.run_lenient(&command));
                if let Err(e) = ran {
                    warn!("cleanup `{}` failed: {}", command, e);
                    self.report.record(Phases::STOP, e);
                }
            }
        }
    }

    /// Copy every host's staging directory into `<dir>/<host>/`.
    fn collect(&mut self) {
        let staging = self.staging_dir();
        for i in 0..self.registry.len() {
            let (addr, fetched) = match self.registry.get(i) {
                Some(s) => {
                    let local = self.results_dir(s.addr());
                    (s.addr().to_owned(), s.fetch(&staging, &local))
                }
                None => continue,
            };
            if let Err(e) = fetched {
                warn!("{}: collecting results failed: {}", addr, e);
                self.report.record(Phases::COLLECT, e);
            }
        }
        self.log(format!("results in {}", self.config.dir));
    }

    /// `initialise -> start -> wait -> stop`. `stop` runs whatever happened before it.
    pub fn run(&mut self, scenario: &mut dyn Scenario) -> RunReport {
        if let Err(e) = self.initialise(scenario) {
            error!("{}: initialisation failed: {}", scenario.name(), e);
            self.report.record(Phases::INITIALISE, e);
        } else if let Err(e) = self.start(scenario) {
            error!("{}: start failed: {}", scenario.name(), e);
            self.report.record(Phases::START, e);
        } else if let Err(e) = scenario.wait(self) {
            error!("{}: {}", scenario.name(), e);
            self.report.record(Phases::START, e);
        }

        self.stop(scenario);

        self.report.clone()
    }
}
