use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::scroll_buffer::SharedScrollBuffer;
use crate::terminal_text::MAX_LINE_BYTES;

mod failures;
mod pty;
mod script;

pub use failures::{FailureTracker, FAILURE_THRESHOLD};
pub use pty::PtyScreen;

const POLL_INTERVAL: Duration = Duration::from_millis(40);
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(300);
pub const DEFAULT_PTY_SIZE: (u16, u16) = (24, 80);

/// Identifies one stream of one box; a stream hosts at most one process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    pub box_id: String,
    pub stream_id: String,
}

impl StreamKey {
    pub fn new(box_id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            box_id: box_id.into(),
            stream_id: stream_id.into(),
        }
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.box_id, self.stream_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Output of a finished run replaces the buffer.
    Replace,
    /// Output is appended line by line as it arrives.
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchKind {
    Script(CaptureMode),
    Pty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchTrigger {
    Automatic,
    Explicit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub key: StreamKey,
    pub script: Vec<String>,
    pub shell: String,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub pty_size: (u16, u16),
    /// Output runs longer than this without a newline are split into lines.
    pub max_line_bytes: usize,
}

impl LaunchSpec {
    pub fn new(key: StreamKey, script: Vec<String>) -> Self {
        Self {
            key,
            script,
            shell: "sh".to_owned(),
            cwd: None,
            env: Vec::new(),
            pty_size: DEFAULT_PTY_SIZE,
            max_line_bytes: MAX_LINE_BYTES,
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub(crate) fn script_text(&self) -> String {
        self.script.join("\n")
    }
}

/// Everything a worker needs to deliver output for one launch.
#[derive(Debug, Clone)]
pub struct LaunchTarget {
    pub buffer: SharedScrollBuffer,
    pub screen: Option<PtyScreen>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessKind {
    Script,
    Pty,
    /// PTY could not be started; the command runs as a plain script instead.
    PtyFallback { reason: String, failures: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub key: StreamKey,
    pub pid: Option<u32>,
    pub kind: ProcessKind,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStatus {
    pub pid: Option<u32>,
    pub running: bool,
    pub uptime: Option<Duration>,
    pub kind: Option<ProcessKind>,
    pub exit: Option<String>,
    pub failure_count: u32,
}

/// Posted by a worker once its process has exited and all output is buffered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub key: StreamKey,
    pub generation: u64,
    pub diagnostic: String,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.diagnostic == "exit=0"
    }
}

pub type ExitSink = Arc<dyn Fn(ProcessExit) + Send + Sync>;

#[derive(Debug)]
pub enum SpawnError {
    Spawn {
        key: StreamKey,
        command: String,
        error: std::io::Error,
    },
    Pty {
        key: StreamKey,
        message: String,
        failures: u32,
    },
    MissingStdio {
        key: StreamKey,
    },
    Suspended {
        key: StreamKey,
        failures: u32,
        reason: String,
    },
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnError::Spawn {
                key,
                command,
                error,
            } => write!(f, "failed to spawn `{command}` for {key}: {error}"),
            SpawnError::Pty { key, message, .. } => {
                write!(f, "PTY start failed for {key}: {message}")
            }
            SpawnError::MissingStdio { key } => {
                write!(f, "process for {key} missing stdout/stderr pipe")
            }
            SpawnError::Suspended {
                key,
                failures,
                reason,
            } => write!(
                f,
                "automatic PTY start for {key} suspended after {failures} failures: {reason}"
            ),
        }
    }
}

impl std::error::Error for SpawnError {}

#[derive(Debug)]
pub enum ProcessManagerError {
    NotRunning { key: StreamKey },
    NoInput { key: StreamKey },
    InputWrite {
        key: StreamKey,
        error: std::io::Error,
    },
}

impl std::fmt::Display for ProcessManagerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessManagerError::NotRunning { key } => write!(f, "no process running for {key}"),
            ProcessManagerError::NoInput { key } => {
                write!(f, "process for {key} does not accept input")
            }
            ProcessManagerError::InputWrite { key, error } => {
                write!(f, "failed writing input to {key}: {error}")
            }
        }
    }
}

impl std::error::Error for ProcessManagerError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownProgress {
    SendingTerm,
    Waiting,
    ForceKilling,
    Complete { total: usize, forced: usize },
}

pub(crate) enum ChildControl {
    Script(Arc<Mutex<std::process::Child>>),
    Pty(pty::PtyChild),
}

impl ChildControl {
    fn try_wait(&self) -> Result<Option<String>, std::io::Error> {
        match self {
            ChildControl::Script(child) => Ok(child
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .try_wait()?
                .map(script::format_exit_diagnostic)),
            ChildControl::Pty(child) => child.try_wait(),
        }
    }

    fn force_kill(&self) {
        match self {
            ChildControl::Script(child) => {
                let _ = child.lock().unwrap_or_else(PoisonError::into_inner).kill();
            }
            ChildControl::Pty(child) => child.kill(),
        }
    }
}

type InputHandle = Arc<Mutex<Box<dyn Write + Send>>>;

struct ManagedProcess {
    generation: u64,
    pid: Option<u32>,
    kind: ProcessKind,
    started_at: Instant,
    control: ChildControl,
    buffer: SharedScrollBuffer,
    input: Option<InputHandle>,
    monitor: Option<JoinHandle<()>>,
    exit: Arc<Mutex<Option<String>>>,
}

impl ManagedProcess {
    fn exit_diagnostic(&self) -> Option<String> {
        self.exit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn has_exited(&self) -> bool {
        if self.exit_diagnostic().is_some() {
            return true;
        }
        self.control.try_wait().ok().flatten().is_some()
    }
}

/// Owns every child process spawned for a runtime and mediates its lifecycle.
///
/// Workers only ever touch the scroll buffer of their own stream and the exit
/// sink; all table mutation happens on the thread that owns the supervisor.
pub struct ProcessSupervisor {
    processes: HashMap<StreamKey, ManagedProcess>,
    failures: FailureTracker,
    exit_sink: ExitSink,
    kill_grace: Duration,
    next_generation: u64,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("processes", &self.processes.keys().collect::<Vec<_>>())
            .field("failures", &self.failures)
            .field("kill_grace", &self.kill_grace)
            .finish()
    }
}

impl ProcessSupervisor {
    pub fn new(exit_sink: ExitSink) -> Self {
        Self {
            processes: HashMap::new(),
            failures: FailureTracker::new(),
            exit_sink,
            kill_grace: DEFAULT_KILL_GRACE,
            next_generation: 0,
        }
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn set_kill_grace(&mut self, grace: Duration) {
        self.kill_grace = grace;
    }

    pub fn failures(&self) -> &FailureTracker {
        &self.failures
    }

    pub fn failure_count(&self, key: &StreamKey) -> u32 {
        self.failures.count(key)
    }

    pub fn reset_failures(&mut self) {
        self.failures.clear();
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn is_running(&self, key: &StreamKey) -> bool {
        self.processes
            .get(key)
            .is_some_and(|process| !process.has_exited())
    }

    pub fn tracked_pids(&self) -> Vec<u32> {
        let mut pids = self
            .processes
            .values()
            .filter_map(|process| process.pid)
            .collect::<Vec<u32>>();
        pids.sort_unstable();
        pids
    }

    /// Starts the process for `spec.key`, replacing any process already
    /// attached to that stream.
    pub fn start(
        &mut self,
        spec: LaunchSpec,
        kind: LaunchKind,
        trigger: LaunchTrigger,
        target: LaunchTarget,
    ) -> Result<ProcessHandle, SpawnError> {
        if self.processes.contains_key(&spec.key) {
            self.kill(&spec.key);
        }
        match kind {
            LaunchKind::Script(capture) => self.start_script(spec, capture, target.buffer),
            LaunchKind::Pty => self.start_pty(spec, trigger, target),
        }
    }

    /// Kill followed by an explicit start; a successful PTY start resets the
    /// failure count.
    pub fn restart(
        &mut self,
        spec: LaunchSpec,
        kind: LaunchKind,
        target: LaunchTarget,
    ) -> Result<ProcessHandle, SpawnError> {
        self.kill(&spec.key);
        self.start(spec, kind, LaunchTrigger::Explicit, target)
    }

    fn start_script(
        &mut self,
        spec: LaunchSpec,
        capture: CaptureMode,
        buffer: SharedScrollBuffer,
    ) -> Result<ProcessHandle, SpawnError> {
        let generation = self.bump_generation();
        let writer = buffer.attach_writer();
        let exit = Arc::new(Mutex::new(None));
        let spawned = script::spawn_script(
            &spec,
            capture,
            writer,
            generation,
            Arc::clone(&self.exit_sink),
            Arc::clone(&exit),
        )?;
        log::info!(
            "started script for {} (pid {:?}, generation {generation})",
            spec.key,
            spawned.pid
        );
        Ok(self.register(spec.key, generation, ProcessKind::Script, spawned, buffer, exit))
    }

    fn start_pty(
        &mut self,
        spec: LaunchSpec,
        trigger: LaunchTrigger,
        target: LaunchTarget,
    ) -> Result<ProcessHandle, SpawnError> {
        let key = spec.key.clone();
        if trigger == LaunchTrigger::Automatic && self.failures.is_suspended(&key) {
            let reason = self
                .failures
                .last_reason(&key)
                .unwrap_or("PTY start failed")
                .to_owned();
            log::warn!("skipping automatic PTY start for {key}: suspended");
            return Err(SpawnError::Suspended {
                failures: self.failures.count(&key),
                key,
                reason,
            });
        }

        let generation = self.bump_generation();
        let writer = target.buffer.attach_writer();
        let exit = Arc::new(Mutex::new(None));
        match pty::spawn_pty(
            &spec,
            writer,
            target.screen.clone(),
            generation,
            Arc::clone(&self.exit_sink),
            Arc::clone(&exit),
        ) {
            Ok(spawned) => {
                self.failures.record_success(&key);
                log::info!(
                    "started PTY for {key} (pid {:?}, generation {generation})",
                    spawned.pid
                );
                Ok(self.register(key, generation, ProcessKind::Pty, spawned, target.buffer, exit))
            }
            Err(message) => {
                let failures = self.failures.record_failure(&key, &message);
                log::error!("PTY start failed for {key} ({failures} consecutive): {message}");
                if self.failures.ever_succeeded(&key) {
                    return Err(SpawnError::Pty {
                        key,
                        message,
                        failures,
                    });
                }
                log::warn!("falling back to non-interactive execution for {key}");
                let mut handle = self.start_script(spec, CaptureMode::Append, target.buffer)?;
                handle.kind = ProcessKind::PtyFallback {
                    reason: message,
                    failures,
                };
                if let Some(process) = self.processes.get_mut(&key) {
                    process.kind = handle.kind.clone();
                }
                Ok(handle)
            }
        }
    }

    fn register(
        &mut self,
        key: StreamKey,
        generation: u64,
        kind: ProcessKind,
        spawned: Spawned,
        buffer: SharedScrollBuffer,
        exit: Arc<Mutex<Option<String>>>,
    ) -> ProcessHandle {
        let handle = ProcessHandle {
            key: key.clone(),
            pid: spawned.pid,
            kind: kind.clone(),
            generation,
        };
        self.processes.insert(
            key,
            ManagedProcess {
                generation,
                pid: spawned.pid,
                kind,
                started_at: Instant::now(),
                control: spawned.control,
                buffer,
                input: spawned.input,
                monitor: Some(spawned.monitor),
                exit,
            },
        );
        handle
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Terminates the stream's process: SIGTERM to its process group, a bounded
    /// grace period, then SIGKILL. Killing a stream with no process is a no-op.
    pub fn kill(&mut self, key: &StreamKey) -> bool {
        let Some(mut process) = self.processes.remove(key) else {
            return false;
        };
        process.buffer.detach_writers();
        if !process.has_exited() {
            signal_group(process.pid, Signal::SIGTERM);
            let deadline = Instant::now() + self.kill_grace;
            while Instant::now() < deadline && !process.has_exited() {
                thread::sleep(POLL_INTERVAL.min(self.kill_grace));
            }
            if !process.has_exited() {
                log::warn!("process for {key} ignored SIGTERM; force killing");
                signal_group(process.pid, Signal::SIGKILL);
                process.control.force_kill();
            }
        }
        join_bounded(key, process.monitor.take());
        log::info!("stopped process for {key}");
        true
    }

    /// Drops the table entry of a process that exited on its own. Returns
    /// `false` when the exit belongs to a process that was already replaced.
    pub fn reap(&mut self, exit: &ProcessExit) -> bool {
        let current = self
            .processes
            .get(&exit.key)
            .is_some_and(|process| process.generation == exit.generation);
        if !current {
            return false;
        }
        if let Some(mut process) = self.processes.remove(&exit.key) {
            join_bounded(&exit.key, process.monitor.take());
        }
        true
    }

    pub fn status(&self, key: &StreamKey) -> ProcessStatus {
        let failure_count = self.failures.count(key);
        match self.processes.get(key) {
            Some(process) => {
                let exit = process.exit_diagnostic();
                ProcessStatus {
                    pid: process.pid,
                    running: exit.is_none() && !process.has_exited(),
                    uptime: Some(process.started_at.elapsed()),
                    kind: Some(process.kind.clone()),
                    exit,
                    failure_count,
                }
            }
            None => ProcessStatus {
                pid: None,
                running: false,
                uptime: None,
                kind: None,
                exit: None,
                failure_count,
            },
        }
    }

    pub fn send_input(&self, key: &StreamKey, bytes: &[u8]) -> Result<(), ProcessManagerError> {
        let Some(process) = self.processes.get(key) else {
            return Err(ProcessManagerError::NotRunning { key: key.clone() });
        };
        let Some(input) = process.input.as_ref() else {
            return Err(ProcessManagerError::NoInput { key: key.clone() });
        };
        let mut input = input.lock().unwrap_or_else(PoisonError::into_inner);
        input
            .write_all(bytes)
            .and_then(|_| input.flush())
            .map_err(|error| ProcessManagerError::InputWrite {
                key: key.clone(),
                error,
            })
    }

    pub fn resize(&self, key: &StreamKey, rows: u16, cols: u16) {
        if let Some(ManagedProcess {
            control: ChildControl::Pty(child),
            ..
        }) = self.processes.get(key)
        {
            child.resize(rows, cols);
        }
    }

    pub fn terminate_all_graceful(&mut self, timeout: Duration) -> ShutdownProgress {
        self.terminate_all_graceful_with_progress(timeout, |_| {})
    }

    pub fn terminate_all_graceful_with_progress<F>(
        &mut self,
        timeout: Duration,
        mut on_progress: F,
    ) -> ShutdownProgress
    where
        F: FnMut(ShutdownProgress),
    {
        let total = self.processes.len();
        on_progress(ShutdownProgress::SendingTerm);
        for process in self.processes.values() {
            process.buffer.detach_writers();
            if !process.has_exited() {
                signal_group(process.pid, Signal::SIGTERM);
            }
        }

        on_progress(ShutdownProgress::Waiting);
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.processes.values().all(ManagedProcess::has_exited) {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }

        let mut forced = 0usize;
        if !self.processes.values().all(ManagedProcess::has_exited) {
            on_progress(ShutdownProgress::ForceKilling);
            for process in self.processes.values() {
                if process.has_exited() {
                    continue;
                }
                signal_group(process.pid, Signal::SIGKILL);
                process.control.force_kill();
                forced += 1;
            }
        }

        for (key, mut process) in self.processes.drain() {
            join_bounded(&key, process.monitor.take());
        }
        let complete = ShutdownProgress::Complete { total, forced };
        on_progress(complete.clone());
        log::info!("terminated {total} managed processes ({forced} forced)");
        complete
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if !self.processes.is_empty() {
            self.terminate_all_graceful(DEFAULT_KILL_GRACE);
        }
    }
}

pub(crate) struct Spawned {
    pub(crate) pid: Option<u32>,
    pub(crate) control: ChildControl,
    pub(crate) input: Option<InputHandle>,
    pub(crate) monitor: JoinHandle<()>,
}

fn join_bounded(key: &StreamKey, monitor: Option<JoinHandle<()>>) {
    if let Some(monitor) = monitor {
        if join_within(monitor, WORKER_JOIN_TIMEOUT).is_none() {
            log::warn!("output worker for {key} still draining; detaching");
        }
    }
}

/// Joins `worker` if it finishes within `timeout`; otherwise leaves it detached.
pub(crate) fn join_within<T>(worker: JoinHandle<T>, timeout: Duration) -> Option<T> {
    let deadline = Instant::now() + timeout;
    while !worker.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    if worker.is_finished() {
        worker.join().ok()
    } else {
        None
    }
}

fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if pid > 0 && kill(Pid::from_raw(-pid), signal).is_err() {
        let _ = kill(Pid::from_raw(pid), signal);
    }
}

pub(crate) fn monitor_exit(
    key: StreamKey,
    generation: u64,
    control: impl Fn() -> Result<Option<String>, std::io::Error>,
    exit: &Arc<Mutex<Option<String>>>,
) -> String {
    loop {
        match control() {
            Ok(Some(diagnostic)) => {
                *exit.lock().unwrap_or_else(PoisonError::into_inner) = Some(diagnostic.clone());
                return diagnostic;
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(err) => {
                let diagnostic = format!("wait-error={err}");
                log::warn!("wait failed for {key} (generation {generation}): {err}");
                *exit.lock().unwrap_or_else(PoisonError::into_inner) = Some(diagnostic.clone());
                return diagnostic;
            }
        }
    }
}
