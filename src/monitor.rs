//! Background samplers that run for the length of an experiment.
//!
//! Each sampler is a shell loop (or a profiler) on the host writing one line per sample to a
//! file in the host's staging directory. The supervisor only sees `MonitorTask`s, so a sampler
//! could just as well be an in-process thread.

use std::time::Duration;

use log::{debug, warn};

use crate::config::MonitorConfig;
use crate::error::RunnerError;
use crate::process::{ProcessHandle, RunOptions};
use crate::session::RemoteSession;

/// A running sampler.
pub trait MonitorTask: Send {
    /// Stop sampling. Stopping a task that already ended is a no-op.
    fn stop(&mut self) -> Result<(), RunnerError>;

    fn is_running(&mut self) -> Result<bool, RunnerError>;
}

impl MonitorTask for ProcessHandle {
    fn stop(&mut self) -> Result<(), RunnerError> {
        self.kill()
    }

    fn is_running(&mut self) -> Result<bool, RunnerError> {
        self.is_alive()
    }
}

/// A kind of sampler.
pub trait Monitor {
    /// Name of the metric; the samples go to `<metric>.txt`.
    fn metric(&self) -> &str;

    /// The sampling command for `session`.
    fn command(&self, session: &RemoteSession) -> String;

    /// Start sampling into `output` on the host.
    fn start(
        &self,
        session: &mut RemoteSession,
        output: &str,
    ) -> Result<Box<dyn MonitorTask>, RunnerError> {
        let cmd = self.command(session);
        let handle = session.run_async(&cmd, &RunOptions::default().output(output))?;
        Ok(Box::new(handle))
    }
}

/// `sleep` argument for an interval, with millisecond precision.
fn sleep_arg(interval: Duration) -> String {
    format!("{}.{:03}", interval.as_secs(), interval.subsec_millis())
}

/// Timestamped copies of the aggregate line of `/proc/stat`.
pub struct CpuMonitor {
    pub interval: Duration,
}

impl Monitor for CpuMonitor {
    fn metric(&self) -> &str {
        "cpu"
    }

    fn command(&self, _session: &RemoteSession) -> String {
        format!(
            "while true; do echo $(date +%s.%N) $(head -n 1 /proc/stat); sleep {}; done",
            sleep_arg(self.interval)
        )
    }
}

/// Timestamped byte and packet counters of the isolation device.
pub struct BandwidthMonitor {
    pub interval: Duration,
}

impl Monitor for BandwidthMonitor {
    fn metric(&self) -> &str {
        "net"
    }

    fn command(&self, session: &RemoteSession) -> String {
        format!(
            "while true; do echo $(date +%s.%N) $(grep '{}:' /proc/net/dev); sleep {}; done",
            session.dev(),
            sleep_arg(self.interval)
        )
    }
}

/// System-wide hardware counters for a fixed duration.
pub struct ProfilerMonitor {
    pub duration: Duration,
}

impl Monitor for ProfilerMonitor {
    fn metric(&self) -> &str {
        "perf"
    }

    fn command(&self, _session: &RemoteSession) -> String {
        format!(
            "perf stat -a -e cycles,instructions,cache-misses,context-switches sleep {}",
            self.duration.as_secs()
        )
    }
}

/// The monitors every experiment runs: CPU and bandwidth, plus the profiler if asked for.
pub fn standard(cfg: &MonitorConfig, duration: Duration) -> Vec<Box<dyn Monitor>> {
    let mut monitors: Vec<Box<dyn Monitor>> = vec![
        Box::new(CpuMonitor {
            interval: Duration::from_millis(cfg.cpu_interval_ms),
        }),
        Box::new(BandwidthMonitor {
            interval: Duration::from_millis(cfg.bw_interval_ms),
        }),
    ];
    if cfg.profile {
        monitors.push(Box::new(ProfilerMonitor { duration }));
    }
    monitors
}

struct Running {
    host: String,
    metric: String,
    task: Box<dyn MonitorTask>,
}

/// Owns every monitor task of an experiment.
#[derive(Default)]
pub struct MonitorSupervisor {
    running: Vec<Running>,
    stopped: bool,
}

impl MonitorSupervisor {
    pub fn new() -> Self {
        MonitorSupervisor::default()
    }

    /// Start `monitor` on `session`, writing to `<dir>/<metric>.txt`.
    pub fn start(
        &mut self,
        session: &mut RemoteSession,
        monitor: &dyn Monitor,
        dir: &str,
    ) -> Result<(), RunnerError> {
        if self.stopped {
            return Err(RunnerError::invalid_state(
                "monitors cannot be started after they were stopped",
            ));
        }

        let output = dir!(dir, format!("{}.txt", monitor.metric()));
        debug!("{}: starting {} monitor -> {}", session.addr(), monitor.metric(), output);
        let task = monitor.start(session, &output)?;

        self.running.push(Running {
            host: session.addr().to_owned(),
            metric: monitor.metric().to_owned(),
            task,
        });

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Stop every task, attempting all of them and returning the failures. Only the first call
    /// does anything.
    pub fn stop_all(&mut self) -> Vec<RunnerError> {
        if self.stopped {
            return vec![];
        }
        self.stopped = true;

        let mut errors = vec![];
        for r in self.running.iter_mut() {
            if let Err(e) = r.task.stop() {
                warn!("{}: failed to stop {} monitor: {}", r.host, r.metric, e);
                errors.push(e);
            }
        }
        errors
    }

    /// How many tasks are still sampling.
    pub fn count_running(&mut self) -> Result<usize, RunnerError> {
        let mut n = 0;
        for r in self.running.iter_mut() {
            if r.task.is_running()? {
                n += 1;
            }
        }
        Ok(n)
    }
}
