//! Driving remote hosts over SSH with `spurs`.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, warn};

use rand::Rng;

use spurs::{cmd, Execute, SshError, SshShell};
use spurs_util::escape_for_bash;

use crate::error::RunnerError;
use crate::transport::{Child, CommandOutput, Liveness, Transport};

/// A persistent SSH connection to one host.
pub struct SshTransport {
    host: String,
    username: String,
    shell: Arc<Mutex<SshShell>>,
}

impl SshTransport {
    /// Connect with the default key. `host` may carry a port (`host:port`); port 22 otherwise.
    pub fn connect(username: &str, host: &str) -> Result<Self, RunnerError> {
        let addr = if host.contains(':') {
            host.to_owned()
        } else {
            format!("{}:22", host)
        };

        let shell = SshShell::with_default_key(username, addr.as_str())
            .map_err(|e| RunnerError::connection(host, e))?;

        Ok(SshTransport {
            host: host.split(':').next().unwrap_or(host).to_owned(),
            username: username.to_owned(),
            shell: Arc::new(Mutex::new(shell)),
        })
    }
}

fn lock<'a>(shell: &'a Mutex<SshShell>) -> MutexGuard<'a, SshShell> {
    // A panic while holding the lock leaves the connection usable.
    shell.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Run a command, turning a non-zero exit into data rather than an error. `spurs` drops the
/// output of a failed command, so only the exit code survives a non-zero exit.
fn run(shell: &Mutex<SshShell>, host: &str, command: &str) -> Result<CommandOutput, RunnerError> {
    match lock(shell).run(cmd!("{}", command)) {
        Ok(out) => Ok(CommandOutput {
            exit: 0,
            stdout: out.stdout,
            stderr: out.stderr,
        }),
        Err(SshError::NonZeroExit { exit, .. }) => Ok(CommandOutput {
            exit,
            ..CommandOutput::default()
        }),
        Err(e) => Err(RunnerError::connection(host, e)),
    }
}

impl Transport for SshTransport {
    fn execute(&self, command: &str) -> Result<CommandOutput, RunnerError> {
        run(&self.shell, &self.host, command)
    }

    fn spawn(&self, command: &str) -> Result<Box<dyn Child>, RunnerError> {
        // The process is detached on the remote and gets its own process group (setsid), so the
        // connection stays free for other commands and termination can signal the whole group.
        // Its exit code is left in a status file that `poll` reads back.
        let status_file = format!(
            "/tmp/.perfiso-runner-{:016x}.status",
            rand::thread_rng().gen::<u64>()
        );
        let wrapped = format!("{} ; echo $? > {}", command, status_file);
        let launcher = format!(
            "setsid nohup bash -c '{}' > /dev/null 2>&1 < /dev/null & echo $!",
            escape_for_bash(&wrapped)
        );

        let out = run(&self.shell, &self.host, &launcher)?;
        if !out.success() {
            return Err(RunnerError::Execution {
                host: self.host.clone(),
                command: command.to_owned(),
                exit: out.exit,
            });
        }

        let pid = out.stdout.trim().parse::<u32>().map_err(|e| {
            RunnerError::connection(&self.host, format!("unable to parse remote pid: {}", e))
        })?;

        debug!("{}: spawned pid {}: {}", self.host, pid, command);

        Ok(Box::new(SshChild {
            host: self.host.clone(),
            shell: Arc::clone(&self.shell),
            pid,
            status_file,
            exited: None,
        }))
    }

    fn fetch(&self, remote: &str, local: &Path) -> Result<(), RunnerError> {
        fs::create_dir_all(local).map_err(|e| RunnerError::connection(&self.host, e))?;

        let mut cmd = Command::new("rsync");
        cmd.arg("-az")
            .args(&["-e", "ssh -o StrictHostKeyChecking=no"])
            .arg(format!(
                "{}@{}:{}/",
                self.username,
                self.host,
                remote.trim_end_matches('/')
            ))
            .arg(local.as_os_str());

        debug!("{:?}", cmd);

        let status = cmd
            .status()
            .map_err(|e| RunnerError::connection(&self.host, e))?;

        if !status.success() {
            return Err(RunnerError::Execution {
                host: self.host.clone(),
                command: format!("{:?}", cmd),
                exit: status.code().unwrap_or(-1),
            });
        }

        Ok(())
    }
}

struct SshChild {
    host: String,
    shell: Arc<Mutex<SshShell>>,
    pid: u32,
    status_file: String,
    exited: Option<Option<i32>>,
}

impl SshChild {
    fn reap(&mut self) -> Result<Option<i32>, RunnerError> {
        let out = run(
            &self.shell,
            &self.host,
            &format!("cat {0} 2>/dev/null; rm -f {0}", self.status_file),
        )?;
        let code = out.stdout.trim().parse::<i32>().ok();
        self.exited = Some(code);
        Ok(code)
    }
}

impl Child for SshChild {
    fn poll(&mut self) -> Result<Liveness, RunnerError> {
        if let Some(code) = self.exited {
            return Ok(Liveness::Exited(code));
        }

        let alive = run(
            &self.shell,
            &self.host,
            &format!("kill -0 {} 2>/dev/null", self.pid),
        )?;
        if alive.success() {
            Ok(Liveness::Running)
        } else {
            Ok(Liveness::Exited(self.reap()?))
        }
    }

    fn terminate(&mut self) -> Result<(), RunnerError> {
        if let Liveness::Exited(_) = self.poll()? {
            return Ok(());
        }

        let out = run(
            &self.shell,
            &self.host,
            &format!("kill -TERM -- -{} 2>/dev/null", self.pid),
        )?;
        if !out.success() {
            // Most likely exited in the meantime.
            warn!("{}: unable to signal process group {}", self.host, self.pid);
        }

        self.reap()?;
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }
}
