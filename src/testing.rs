//! Test doubles for the transport boundary.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::HostConfig;
use crate::error::RunnerError;
use crate::transport::{Child, CommandOutput, Connector, Liveness, Transport};

/// A fresh directory under the system temp dir.
pub fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "perfiso-runner-{}-{:08x}",
        tag,
        rand::thread_rng().gen::<u32>()
    ));
    let _ = fs::create_dir_all(&dir);
    dir
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Run,
    Spawn,
    Fetch,
}

#[derive(Clone, Debug)]
pub struct Record {
    pub host: String,
    pub command: String,
    pub kind: Kind,
}

#[derive(Default)]
struct WatchState {
    terminations: usize,
    terminated: bool,
    exited: bool,
}

/// Observes a `FakeChild` after it has been handed off.
#[derive(Clone, Default)]
pub struct ChildWatch(Arc<Mutex<WatchState>>);

impl ChildWatch {
    fn state(&self) -> MutexGuard<'_, WatchState> {
        self.0.lock().unwrap()
    }

    pub fn terminations(&self) -> usize {
        self.state().terminations
    }

    pub fn is_running(&self) -> bool {
        let state = self.state();
        !state.terminated && !state.exited
    }
}

/// A child that runs for `lifetime` (forever if `None`) unless terminated.
pub struct FakeChild {
    started: Instant,
    lifetime: Option<Duration>,
    watch: ChildWatch,
}

impl FakeChild {
    pub fn new(lifetime: Option<Duration>) -> (Self, ChildWatch) {
        let watch = ChildWatch::default();
        (
            FakeChild {
                started: Instant::now(),
                lifetime,
                watch: watch.clone(),
            },
            watch,
        )
    }
}

impl Child for FakeChild {
    fn poll(&mut self) -> Result<Liveness, RunnerError> {
        let mut state = self.watch.state();
        if state.terminated {
            return Ok(Liveness::Exited(None));
        }
        match self.lifetime {
            Some(lifetime) if self.started.elapsed() >= lifetime => {
                state.exited = true;
                Ok(Liveness::Exited(Some(0)))
            }
            _ => Ok(Liveness::Running),
        }
    }

    fn terminate(&mut self) -> Result<(), RunnerError> {
        let mut state = self.watch.state();
        state.terminations += 1;
        state.terminated = true;
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        None
    }
}

#[derive(Default)]
struct RecorderState {
    records: Vec<Record>,
    /// (host, pattern): commands on `host` (any host if `None`) containing `pattern` exit 1.
    failures: Vec<(Option<String>, String)>,
    unreachable: Vec<String>,
    children: Vec<ChildWatch>,
    child_lifetime: Option<Duration>,
}

/// Shared state behind every `RecordingTransport` it connects.
#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<RecorderState>>);

impl Recorder {
    pub fn new() -> Self {
        Recorder::default()
    }

    fn state(&self) -> MutexGuard<'_, RecorderState> {
        self.0.lock().unwrap()
    }

    /// Make commands containing `pattern` fail on `host`.
    pub fn fail_on(&self, host: &str, pattern: &str) {
        self.state()
            .failures
            .push((Some(host.to_owned()), pattern.to_owned()));
    }

    /// Make commands containing `pattern` fail everywhere.
    pub fn fail_everywhere(&self, pattern: &str) {
        self.state().failures.push((None, pattern.to_owned()));
    }

    /// Every command sent to `host` fails to reach it.
    pub fn unreachable(&self, host: &str) {
        self.state().unreachable.push(host.to_owned());
    }

    pub fn child_lifetime(&self, lifetime: Option<Duration>) {
        self.state().child_lifetime = lifetime;
    }

    pub fn records(&self) -> Vec<Record> {
        self.state().records.clone()
    }

    /// Commands run (not spawned) on `host`, in order.
    pub fn commands(&self, host: &str) -> Vec<String> {
        self.state()
            .records
            .iter()
            .filter(|r| r.host == host && r.kind == Kind::Run)
            .map(|r| r.command.clone())
            .collect()
    }

    pub fn children(&self) -> Vec<ChildWatch> {
        self.state().children.clone()
    }

    pub fn transport(&self, host: &str) -> RecordingTransport {
        RecordingTransport {
            host: host.to_owned(),
            recorder: self.clone(),
        }
    }

    pub fn connector(&self) -> impl Connector {
        let recorder = self.clone();
        move |host: &HostConfig| -> Result<Arc<dyn Transport>, RunnerError> {
            Ok(Arc::new(recorder.transport(&host.addr)))
        }
    }
}

pub struct RecordingTransport {
    host: String,
    recorder: Recorder,
}

impl RecordingTransport {
    fn record(&self, command: &str, kind: Kind) -> Result<i32, RunnerError> {
        let mut state = self.recorder.state();
        if state.unreachable.contains(&self.host) {
            return Err(RunnerError::connection(&self.host, "no route to host"));
        }
        state.records.push(Record {
            host: self.host.clone(),
            command: command.to_owned(),
            kind,
        });
        let fails = state.failures.iter().any(|(host, pattern)| {
            host.as_ref().map_or(true, |h| *h == self.host) && command.contains(pattern.as_str())
        });
        Ok(if fails { 1 } else { 0 })
    }
}

impl Transport for RecordingTransport {
    fn execute(&self, command: &str) -> Result<CommandOutput, RunnerError> {
        let exit = self.record(command, Kind::Run)?;
        Ok(CommandOutput {
            exit,
            ..CommandOutput::default()
        })
    }

    fn spawn(&self, command: &str) -> Result<Box<dyn Child>, RunnerError> {
        let exit = self.record(command, Kind::Spawn)?;
        if exit != 0 {
            return Err(RunnerError::Execution {
                host: self.host.clone(),
                command: command.to_owned(),
                exit,
            });
        }

        let lifetime = self.recorder.state().child_lifetime;
        let (child, watch) = FakeChild::new(lifetime);
        self.recorder.state().children.push(watch);
        Ok(Box::new(child))
    }

    fn fetch(&self, remote: &str, local: &Path) -> Result<(), RunnerError> {
        self.record(&format!("fetch {} {}", remote, local.display()), Kind::Fetch)?;
        fs::create_dir_all(local).map_err(|e| RunnerError::connection(&self.host, e))
    }
}
