//! A handle to one host.
//!
//! Commands run synchronously (`run`), in the background (`run_async`), or, while the session
//! is delayed, are queued and later sent as a single joined command by `flush`. Batching
//! matters for kernel configuration: a dozen `tc`/module writes land in one round trip and in
//! order. The price is that a failing batch cannot say which of its commands failed.

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info};

use crate::config::HostConfig;
use crate::error::RunnerError;
use crate::process::{ProcessHandle, RunOptions};
use crate::tenant::Tenant;
use crate::transport::{CommandOutput, Transport};

/// Separator used to join a delayed batch. Each command is grouped first, so the batch stops at
/// the first command that exits non-zero and exits with its status.
pub const BATCH_SEPARATOR: &str = " && ";

/// Join queued commands into one shell command. A command that is allowed to fail must say so
/// itself (`|| true`).
pub fn join_batch(commands: &[String]) -> String {
    match commands {
        [single] => single.clone(),
        _ => commands
            .iter()
            .map(|c| format!("{{ {}; }}", c))
            .collect::<Vec<_>>()
            .join(BATCH_SEPARATOR),
    }
}

pub struct RemoteSession {
    host: HostConfig,
    transport: Arc<dyn Transport>,

    delayed: bool,
    pending: Vec<String>,
    dry_run: bool,

    /// Tenants created on this host that have not been removed yet.
    tenants: Vec<Tenant>,
}

impl RemoteSession {
    pub fn new(host: HostConfig, transport: Arc<dyn Transport>) -> Self {
        RemoteSession {
            host,
            transport,
            delayed: false,
            pending: vec![],
            dry_run: false,
            tenants: vec![],
        }
    }

    /// The address used to reach the host.
    pub fn addr(&self) -> &str {
        &self.host.addr
    }

    pub fn host(&self) -> &HostConfig {
        &self.host
    }

    /// The isolation device.
    pub fn dev(&self) -> &str {
        self.host.dev()
    }

    pub fn data_ip(&self) -> Result<Ipv4Addr, RunnerError> {
        self.host.data_ip().ok_or_else(|| {
            RunnerError::configuration(format!(
                "host {} has no IPv4 data address; set `data_ip`",
                self.host.addr
            ))
        })
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    pub fn is_delayed(&self) -> bool {
        self.delayed
    }

    /// Commands queued while delayed, in insertion order.
    pub fn pending(&self) -> &[String] {
        &self.pending
    }

    /// Turn delayed mode on or off. Turning it off flushes whatever is queued.
    pub fn set_delayed(&mut self, delayed: bool) -> Result<(), RunnerError> {
        if self.delayed && !delayed {
            self.delayed = false;
            self.flush()?;
        }
        self.delayed = delayed;
        Ok(())
    }

    /// Queue a command for the next `flush`. Only valid while delayed.
    pub fn enqueue(&mut self, command: impl Into<String>) -> Result<(), RunnerError> {
        if !self.delayed {
            return Err(RunnerError::invalid_state(format!(
                "{}: enqueue outside of delayed mode",
                self.host.addr
            )));
        }
        self.pending.push(command.into());
        Ok(())
    }

    /// Execute every queued command as one joined command and clear the queue. The batch stops
    /// at the first failing command and fails as a whole: the error names the joined command,
    /// and which part failed is not known.
    pub fn flush(&mut self) -> Result<(), RunnerError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let batch = std::mem::replace(&mut self.pending, vec![]);
        debug!(
            "{}: flushing {} delayed commands",
            self.host.addr,
            batch.len()
        );
        self.execute(&join_batch(&batch), false)?;

        Ok(())
    }

    /// Run the command to completion. A non-zero exit is an `Execution` error. While delayed,
    /// the command is queued instead and a synthetic result is returned.
    pub fn run(&mut self, command: &str) -> Result<CommandOutput, RunnerError> {
        if self.delayed {
            self.enqueue(command)?;
            return Ok(CommandOutput::synthetic());
        }
        self.execute(command, false)
    }

    /// Run the command to completion, returning non-zero exits as data. Never delayed: callers
    /// use this to inspect state, and a queued inspection would be meaningless.
    ///
    /// Over SSH, a non-zero exit comes back with empty `stdout` and `stderr`: `spurs` does not
    /// return the output of failed commands. Only the exit code can be relied on.
    pub fn run_lenient(&mut self, command: &str) -> Result<CommandOutput, RunnerError> {
        self.execute(command, true)
    }

    fn execute(&self, command: &str, lenient: bool) -> Result<CommandOutput, RunnerError> {
        if self.dry_run {
            info!("[dry-run] {}$ {}", self.host.addr, command);
            return Ok(CommandOutput::synthetic());
        }

        let out = self.transport.execute(command)?;
        if !lenient && !out.success() {
            return Err(RunnerError::Execution {
                host: self.host.addr.clone(),
                command: command.to_owned(),
                exit: out.exit,
            });
        }

        Ok(out)
    }

    /// Start the command in the background and return immediately.
    pub fn run_async(
        &mut self,
        command: &str,
        opts: &RunOptions,
    ) -> Result<ProcessHandle, RunnerError> {
        let full = opts.apply(command);

        if self.dry_run {
            info!("[dry-run] {}$ {} &", self.host.addr, full);
            return Ok(ProcessHandle::dry_run(&self.host.addr, &full, opts.cpu));
        }

        let child = self.transport.spawn(&full)?;
        Ok(ProcessHandle::new(&self.host.addr, &full, opts.cpu, child))
    }

    /// Copy the remote directory `remote` into the local directory `local`.
    pub fn fetch(&self, remote: &str, local: &Path) -> Result<(), RunnerError> {
        if self.dry_run {
            info!(
                "[dry-run] {}: fetch {} -> {}",
                self.host.addr,
                remote,
                local.display()
            );
            return Ok(());
        }
        self.transport.fetch(remote, local)
    }

    pub fn tenants(&self) -> &[Tenant] {
        &self.tenants
    }

    pub(crate) fn add_tenant(&mut self, tenant: Tenant) {
        if !self.tenants.contains(&tenant) {
            self.tenants.push(tenant);
        }
    }

    pub(crate) fn take_tenants(&mut self) -> Vec<Tenant> {
        std::mem::replace(&mut self.tenants, vec![])
    }
}
