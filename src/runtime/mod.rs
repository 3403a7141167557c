//! The single-writer dispatch loop.
//!
//! Terminal keys, timer ticks, control commands and process exits all arrive
//! on one ordered queue; only [`Runtime::run`] mutates [`RuntimeState`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::{AppConfig, ConfigError};
use crate::control::{CommandHandler, ControlCommand, ControlError, ControlResponse};
use crate::keys::KeyChord;
use crate::process_manager::{ProcessExit, ShutdownProgress};

mod commands;
mod input;
mod signals;
mod state;

pub use signals::{SignalWatcher, SHUTDOWN_SIGNALS};
pub use state::RuntimeState;

const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum RuntimeEvent {
    Key(KeyChord),
    Tick,
    Control {
        command: ControlCommand,
        reply: Sender<ControlResponse>,
    },
    ProcessExited(ProcessExit),
    Resize {
        cols: u16,
        rows: u16,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Quit,
}

#[derive(Debug)]
pub enum RuntimeError {
    Config(ConfigError),
    Io(std::io::Error),
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeError::Config(error) => write!(f, "{error}"),
            RuntimeError::Io(error) => write!(f, "runtime I/O failed: {error}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<ConfigError> for RuntimeError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<std::io::Error> for RuntimeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

pub struct Runtime {
    state: RuntimeState,
    events: Receiver<RuntimeEvent>,
    sender: Sender<RuntimeEvent>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new(config: AppConfig, config_path: Option<PathBuf>) -> Result<Self, RuntimeError> {
        let (sender, events) = mpsc::channel();
        let state = RuntimeState::new(config, config_path, sender.clone())?;
        Ok(Self {
            state,
            events,
            sender,
        })
    }

    /// Queue handle for producers outside the loop (terminal input, signals).
    pub fn sender(&self) -> Sender<RuntimeEvent> {
        self.sender.clone()
    }

    pub fn state(&self) -> &RuntimeState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut RuntimeState {
        &mut self.state
    }

    /// Handler for the control server: each command is queued behind every
    /// event already waiting and the connection blocks until it is applied.
    pub fn control_handler(&self) -> CommandHandler {
        let sender = self.sender.clone();
        Arc::new(move |command| {
            let (reply, response) = mpsc::channel();
            let name = command.name();
            if sender
                .send(RuntimeEvent::Control { command, reply })
                .is_err()
            {
                return ControlResponse::failure(&ControlError::invalid_command(
                    "runtime is not running",
                ));
            }
            match response.recv_timeout(REPLY_TIMEOUT) {
                Ok(response) => response,
                Err(error) => {
                    log::warn!("no reply for control command {name}: {error}");
                    ControlResponse::failure(&ControlError::invalid_command(format!(
                        "command {name} was not applied: runtime stopped"
                    )))
                }
            }
        })
    }

    /// Applies one event. Returns [`LoopControl::Quit`] once the runtime
    /// should shut down.
    pub fn dispatch(&mut self, event: RuntimeEvent) -> LoopControl {
        match event {
            RuntimeEvent::Key(chord) => self.state.handle_key(chord),
            RuntimeEvent::Tick => {
                self.state.tick(Instant::now());
                LoopControl::Continue
            }
            RuntimeEvent::Control { command, reply } => {
                let response = self.state.handle_command(command);
                if reply.send(response).is_err() {
                    log::debug!("control client went away before its reply");
                }
                if self.state.is_shutdown_requested() {
                    LoopControl::Quit
                } else {
                    LoopControl::Continue
                }
            }
            RuntimeEvent::ProcessExited(exit) => {
                self.state.on_process_exit(exit);
                LoopControl::Continue
            }
            RuntimeEvent::Resize { cols, rows } => {
                self.state.resize(cols, rows);
                LoopControl::Continue
            }
            RuntimeEvent::Shutdown => LoopControl::Quit,
        }
    }

    /// Starts the layout's processes, drains the queue until a quit, then
    /// terminates every supervised process.
    pub fn run(mut self) -> Result<ShutdownProgress, RuntimeError> {
        self.state.start_layout_processes();
        let ticker = Ticker::spawn(self.sender.clone(), self.state.config().tick())?;
        log::info!("dispatch loop running");
        while let Ok(event) = self.events.recv() {
            if self.dispatch(event) == LoopControl::Quit {
                break;
            }
        }
        ticker.stop();
        Ok(self.state.shutdown())
    }
}

struct Ticker {
    stop: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

impl Ticker {
    fn spawn(sender: Sender<RuntimeEvent>, interval: Duration) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        let worker = thread::Builder::new()
            .name("runtime-tick".to_owned())
            .spawn(move || {
                while !worker_stop.load(Ordering::SeqCst) {
                    thread::sleep(interval);
                    if sender.send(RuntimeEvent::Tick).is_err() {
                        break;
                    }
                }
            })?;
        Ok(Self { stop, worker })
    }

    fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.worker.join();
    }
}

#[cfg(test)]
#[path = "../tests/runtime_tests.rs"]
mod tests;
