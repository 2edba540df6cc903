//! Handles to processes started in the background.

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use crate::error::RunnerError;
use crate::transport::{Child, Liveness};

/// How often `wait` checks on the process.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How a background command should be launched.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Pin the process to this CPU with `taskset`.
    pub cpu: Option<usize>,
    /// Redirect stdout and stderr to this file on the host.
    pub output: Option<String>,
}

impl RunOptions {
    pub fn pinned(cpu: usize) -> Self {
        RunOptions {
            cpu: Some(cpu),
            output: None,
        }
    }

    pub fn output(mut self, path: impl Into<String>) -> Self {
        self.output = Some(path.into());
        self
    }

    /// Wrap `command` according to the options.
    pub fn apply(&self, command: &str) -> String {
        let mut full = match self.cpu {
            Some(cpu) => format!("taskset -c {} {}", cpu, command),
            None => command.to_owned(),
        };
        if let Some(output) = &self.output {
            full = format!("{} > {} 2>&1", full, output);
        }
        full
    }
}

/// What became of a background process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    /// The process exited on its own with the given code (if known).
    Exited(Option<i32>),
    /// The process was terminated through its handle.
    Killed,
    /// `wait` gave up; the process is still running.
    Timeout,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        *self == ExitStatus::Exited(Some(0))
    }
}

/// A process started by a session. The handle is the only way to stop it, so whoever issued the
/// command owns it.
pub struct ProcessHandle {
    host: String,
    command: String,
    cpu: Option<usize>,
    /// `None` for dry runs, where nothing was started.
    child: Option<Box<dyn Child>>,
    status: Option<ExitStatus>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("host", &self.host)
            .field("command", &self.command)
            .field("cpu", &self.cpu)
            .field("pid", &self.child.as_ref().and_then(|c| c.pid()))
            .field("status", &self.status)
            .finish()
    }
}

impl ProcessHandle {
    pub(crate) fn new(host: &str, command: &str, cpu: Option<usize>, child: Box<dyn Child>) -> Self {
        ProcessHandle {
            host: host.to_owned(),
            command: command.to_owned(),
            cpu,
            child: Some(child),
            status: None,
        }
    }

    /// A handle for a command that was only logged.
    pub(crate) fn dry_run(host: &str, command: &str, cpu: Option<usize>) -> Self {
        ProcessHandle {
            host: host.to_owned(),
            command: command.to_owned(),
            cpu,
            child: None,
            status: Some(ExitStatus::Exited(Some(0))),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn cpu(&self) -> Option<usize> {
        self.cpu
    }

    /// The final status, if the process is known to be gone.
    pub fn status(&self) -> Option<ExitStatus> {
        self.status
    }

    pub fn is_alive(&mut self) -> Result<bool, RunnerError> {
        self.refresh()?;
        Ok(self.status.is_none())
    }

    fn refresh(&mut self) -> Result<(), RunnerError> {
        if self.status.is_some() {
            return Ok(());
        }
        if let Some(child) = self.child.as_mut() {
            if let Liveness::Exited(code) = child.poll()? {
                self.status = Some(ExitStatus::Exited(code));
            }
        }
        Ok(())
    }

    /// Block until the process exits or `timeout` elapses. On timeout, `ExitStatus::Timeout` is
    /// returned and the process is left running.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<ExitStatus, RunnerError> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            self.refresh()?;
            if let Some(status) = self.status {
                return Ok(status);
            }

            let now = Instant::now();
            let nap = match deadline {
                Some(deadline) if now >= deadline => return Ok(ExitStatus::Timeout),
                Some(deadline) => std::cmp::min(POLL_INTERVAL, deadline - now),
                None => POLL_INTERVAL,
            };
            thread::sleep(nap);
        }
    }

    /// Like `wait`, but a timeout or an unsuccessful exit is an error.
    pub fn join(&mut self, timeout: Option<Duration>) -> Result<(), RunnerError> {
        match self.wait(timeout)? {
            ExitStatus::Exited(Some(0)) => Ok(()),
            ExitStatus::Timeout => Err(RunnerError::Timeout {
                host: self.host.clone(),
                command: self.command.clone(),
                after: timeout.unwrap_or_default(),
            }),
            ExitStatus::Exited(code) => Err(RunnerError::Execution {
                host: self.host.clone(),
                command: self.command.clone(),
                exit: code.unwrap_or(-1),
            }),
            ExitStatus::Killed => Err(RunnerError::invalid_state(format!(
                "`{}` on {} was killed",
                self.command, self.host
            ))),
        }
    }

    /// Terminate the process. Killing a process that already exited (or was already killed) is
    /// a no-op.
    pub fn kill(&mut self) -> Result<(), RunnerError> {
        self.refresh()?;
        if self.status.is_some() {
            return Ok(());
        }

        if let Some(child) = self.child.as_mut() {
            debug!("{}: killing `{}`", self.host, self.command);
            child.terminate()?;
        }
        self.status = Some(ExitStatus::Killed);

        Ok(())
    }
}
