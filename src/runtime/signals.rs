//! Termination signals routed into the dispatch queue.

use std::io;
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};

use super::RuntimeEvent;

/// Signals that end the session through the normal teardown path.
pub const SHUTDOWN_SIGNALS: [i32; 3] = [SIGINT, SIGTERM, SIGHUP];

/// Posts [`RuntimeEvent::Shutdown`] whenever a termination signal arrives, so
/// supervised children are terminated and the control socket is unbound
/// exactly as for a `Shutdown` command.
#[derive(Debug)]
pub struct SignalWatcher {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl SignalWatcher {
    pub fn spawn(sender: Sender<RuntimeEvent>) -> io::Result<Self> {
        let mut signals = Signals::new(SHUTDOWN_SIGNALS).map_err(io::Error::other)?;
        let handle = signals.handle();
        let thread = thread::Builder::new()
            .name("runtime-signals".to_owned())
            .spawn(move || {
                for signal in signals.forever() {
                    log::warn!("signal {signal} received, shutting down");
                    if sender.send(RuntimeEvent::Shutdown).is_err() {
                        break;
                    }
                }
            })?;
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }
}

impl Drop for SignalWatcher {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
