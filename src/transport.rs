//! The boundary between the runner and the machines it drives.
//!
//! A `Transport` takes a command string and either runs it to completion or starts it in the
//! background. It does not interpret exit codes; that is the session's job. `Err` from a
//! transport always means the host could not be reached (or the local machine could not spawn
//! anything at all).

use std::fs;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child as StdChild, Command, Stdio};
use std::sync::Arc;

use log::debug;

use crate::config::HostConfig;
use crate::error::RunnerError;
use crate::ssh::SshTransport;

/// The result of running a command to completion.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommandOutput {
    pub exit: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// A synthetic successful result (used for dry runs and queued commands).
    pub fn synthetic() -> Self {
        CommandOutput::default()
    }

    pub fn success(&self) -> bool {
        self.exit == 0
    }
}

/// Whether a background process is still around.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Liveness {
    Running,
    /// Exited with the given code, if it could be determined.
    Exited(Option<i32>),
}

/// A process started in the background by a transport.
pub trait Child: Send {
    /// Check whether the process has exited, without blocking.
    fn poll(&mut self) -> Result<Liveness, RunnerError>;

    /// Send a termination signal to the process (and whatever it started). Must tolerate the
    /// process having already exited.
    fn terminate(&mut self) -> Result<(), RunnerError>;

    fn pid(&self) -> Option<u32>;
}

/// Something that can execute commands on one host.
pub trait Transport: Send + Sync {
    /// Run the command to completion and capture its output. A non-zero exit is not an error.
    fn execute(&self, command: &str) -> Result<CommandOutput, RunnerError>;

    /// Start the command without waiting for it.
    fn spawn(&self, command: &str) -> Result<Box<dyn Child>, RunnerError>;

    /// Copy the contents of the directory `remote` into the local directory `local`.
    fn fetch(&self, remote: &str, local: &Path) -> Result<(), RunnerError>;
}

/// Produces a transport for each host of an experiment. Experiments are generic over this so
/// that tests (and dry runs) never open a real connection.
pub trait Connector {
    fn connect(&self, host: &HostConfig) -> Result<Arc<dyn Transport>, RunnerError>;
}

impl<F> Connector for F
where
    F: Fn(&HostConfig) -> Result<Arc<dyn Transport>, RunnerError>,
{
    fn connect(&self, host: &HostConfig) -> Result<Arc<dyn Transport>, RunnerError> {
        self(host)
    }
}

/// Connects over SSH, or runs locally for `localhost`. In dry-run mode nothing is connected:
/// sessions never hand commands to their transport then, so a local one stands in.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultConnector {
    pub dry_run: bool,
}

impl Connector for DefaultConnector {
    fn connect(&self, host: &HostConfig) -> Result<Arc<dyn Transport>, RunnerError> {
        if self.dry_run || host.is_local() {
            Ok(Arc::new(LocalTransport::new(&host.addr)))
        } else {
            Ok(Arc::new(SshTransport::connect(host.username(), &host.addr)?))
        }
    }
}

/// Stands in for a host that could not be connected. Every operation fails with the
/// connection error, so the host shows up as failed in each fan-out instead of aborting them.
#[derive(Clone, Debug)]
pub struct UnreachableTransport {
    host: String,
    reason: String,
}

impl UnreachableTransport {
    pub fn new(host: &str, reason: impl ToString) -> Self {
        UnreachableTransport {
            host: host.to_owned(),
            reason: reason.to_string(),
        }
    }

    fn error(&self) -> RunnerError {
        RunnerError::connection(&self.host, &self.reason)
    }
}

impl Transport for UnreachableTransport {
    fn execute(&self, _command: &str) -> Result<CommandOutput, RunnerError> {
        Err(self.error())
    }

    fn spawn(&self, _command: &str) -> Result<Box<dyn Child>, RunnerError> {
        Err(self.error())
    }

    fn fetch(&self, _remote: &str, _local: &Path) -> Result<(), RunnerError> {
        Err(self.error())
    }
}

/// Runs commands on this machine with `sh -c`.
#[derive(Clone, Debug)]
pub struct LocalTransport {
    label: String,
}

impl LocalTransport {
    pub fn new(label: &str) -> Self {
        LocalTransport {
            label: label.to_owned(),
        }
    }

    fn shell(command: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

impl Transport for LocalTransport {
    fn execute(&self, command: &str) -> Result<CommandOutput, RunnerError> {
        debug!("{}$ {}", self.label, command);

        let output = Self::shell(command)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| RunnerError::connection(&self.label, e))?;

        Ok(CommandOutput {
            // Killed by a signal.
            exit: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn spawn(&self, command: &str) -> Result<Box<dyn Child>, RunnerError> {
        debug!("{}$ {} &", self.label, command);

        // Own process group, so that terminating the handle also takes down whatever the shell
        // started.
        let child = Self::shell(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|e| RunnerError::connection(&self.label, e))?;

        Ok(Box::new(LocalChild {
            label: self.label.clone(),
            child,
            exited: None,
        }))
    }

    fn fetch(&self, remote: &str, local: &Path) -> Result<(), RunnerError> {
        fs::create_dir_all(local).map_err(|e| RunnerError::connection(&self.label, e))?;

        let status = Command::new("cp")
            .arg("-a")
            .arg(format!("{}/.", remote.trim_end_matches('/')))
            .arg(local.as_os_str())
            .status()
            .map_err(|e| RunnerError::connection(&self.label, e))?;

        if !status.success() {
            return Err(RunnerError::Execution {
                host: self.label.clone(),
                command: format!("cp -a {}/. {}", remote, local.display()),
                exit: status.code().unwrap_or(-1),
            });
        }

        Ok(())
    }
}

struct LocalChild {
    label: String,
    child: StdChild,
    exited: Option<Option<i32>>,
}

impl Child for LocalChild {
    fn poll(&mut self) -> Result<Liveness, RunnerError> {
        if let Some(code) = self.exited {
            return Ok(Liveness::Exited(code));
        }

        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exited = Some(status.code());
                Ok(Liveness::Exited(status.code()))
            }
            Ok(None) => Ok(Liveness::Running),
            Err(e) => Err(RunnerError::connection(&self.label, e)),
        }
    }

    fn terminate(&mut self) -> Result<(), RunnerError> {
        if let Liveness::Exited(_) = self.poll()? {
            return Ok(());
        }

        // Signal the whole group; fall back to the child itself if `kill` is unavailable.
        let group = format!("-{}", self.child.id());
        let signalled = Command::new("kill")
            .args(&["-TERM", "--", &group])
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false);
        if !signalled {
            // Races with a natural exit are fine.
            let _ = self.child.kill();
        }

        let status = self
            .child
            .wait()
            .map_err(|e| RunnerError::connection(&self.label, e))?;
        self.exited = Some(status.code());

        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }
}
