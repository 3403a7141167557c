use std::fs;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{parse_command, ControlCommand, ControlError, ControlResponse};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Longest request line accepted on the control socket, newline excluded.
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024;

/// Applies one parsed command and returns its response. Called from
/// connection threads; implementations forward to the dispatch loop.
pub type CommandHandler = Arc<dyn Fn(ControlCommand) -> ControlResponse + Send + Sync>;

#[derive(Debug)]
pub enum ServerError {
    Inspect {
        path: PathBuf,
        error: std::io::Error,
    },
    NotASocket(PathBuf),
    InUse(PathBuf),
    RemoveStale {
        path: PathBuf,
        error: std::io::Error,
    },
    Bind {
        path: PathBuf,
        error: std::io::Error,
    },
    Configure(std::io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Inspect { path, error } => {
                write!(f, "failed inspecting socket path {}: {error}", path.display())
            }
            ServerError::NotASocket(path) => write!(
                f,
                "{} exists and is not a socket; refusing to replace it",
                path.display()
            ),
            ServerError::InUse(path) => write!(
                f,
                "control socket {} is in use by a running instance",
                path.display()
            ),
            ServerError::RemoveStale { path, error } => {
                write!(f, "failed removing stale socket {}: {error}", path.display())
            }
            ServerError::Bind { path, error } => {
                write!(f, "failed binding control socket {}: {error}", path.display())
            }
            ServerError::Configure(error) => write!(f, "failed configuring control socket: {error}"),
        }
    }
}

impl std::error::Error for ServerError {}

/// Accept loop for the control socket. Owns the socket file: a stale socket
/// left by a dead instance is replaced on bind and the file is removed again
/// on shutdown. Anything else at the path makes bind fail.
pub struct ControlServer {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ControlServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlServer")
            .field("path", &self.path)
            .field("running", &!self.stop.load(Ordering::SeqCst))
            .finish()
    }
}

impl ControlServer {
    pub fn bind(
        path: &Path,
        idle_timeout: Duration,
        handler: CommandHandler,
    ) -> Result<Self, ServerError> {
        Self::bind_with_limit(path, idle_timeout, MAX_REQUEST_BYTES, handler)
    }

    pub fn bind_with_limit(
        path: &Path,
        idle_timeout: Duration,
        max_request_bytes: usize,
        handler: CommandHandler,
    ) -> Result<Self, ServerError> {
        clear_stale_socket(path)?;
        let listener = UnixListener::bind(path).map_err(|error| ServerError::Bind {
            path: path.to_path_buf(),
            error,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(ServerError::Configure)?;
        log::info!("control socket listening on {}", path.display());

        let stop = Arc::new(AtomicBool::new(false));
        let accept_stop = Arc::clone(&stop);
        let accept_thread = thread::Builder::new()
            .name("control-accept".to_owned())
            .spawn(move || {
                accept_loop(listener, accept_stop, idle_timeout, max_request_bytes, handler)
            })
            .map_err(ServerError::Configure)?;

        Ok(Self {
            path: path.to_path_buf(),
            stop,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stops accepting and removes the socket file. Connections already open
    /// finish their current request and then hit a closed dispatch queue.
    pub fn shutdown(&mut self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(accept_thread) = self.accept_thread.take() {
            let _ = accept_thread.join();
        }
        match fs::remove_file(&self.path) {
            Ok(()) => log::info!("removed control socket {}", self.path.display()),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => log::warn!(
                "failed removing control socket {}: {error}",
                self.path.display()
            ),
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Removes a socket file only when no instance answers on it.
fn clear_stale_socket(path: &Path) -> Result<(), ServerError> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(()),
        Err(error) => {
            return Err(ServerError::Inspect {
                path: path.to_path_buf(),
                error,
            })
        }
    };
    if !metadata.file_type().is_socket() {
        return Err(ServerError::NotASocket(path.to_path_buf()));
    }
    if UnixStream::connect(path).is_ok() {
        return Err(ServerError::InUse(path.to_path_buf()));
    }
    fs::remove_file(path).map_err(|error| ServerError::RemoveStale {
        path: path.to_path_buf(),
        error,
    })?;
    log::info!("removed stale control socket {}", path.display());
    Ok(())
}

fn accept_loop(
    listener: UnixListener,
    stop: Arc<AtomicBool>,
    idle_timeout: Duration,
    max_request_bytes: usize,
    handler: CommandHandler,
) {
    let connection_ids = AtomicU64::new(0);
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                let id = connection_ids.fetch_add(1, Ordering::Relaxed) + 1;
                let handler = Arc::clone(&handler);
                let spawned = thread::Builder::new()
                    .name(format!("control-conn-{id}"))
                    .spawn(move || {
                        if let Err(error) = serve_connection(stream, idle_timeout, max_request_bytes, handler) {
                            log::warn!("control connection {id} dropped: {error}");
                        } else {
                            log::debug!("control connection {id} closed");
                        }
                    });
                if let Err(error) = spawned {
                    log::error!("failed spawning control connection thread: {error}");
                }
            }
            Err(error) if error.kind() == ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(error) if error.kind() == ErrorKind::Interrupted => {}
            Err(error) => {
                log::warn!("control socket accept failed: {error}");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}

/// Reads one command per line and answers each before reading the next.
/// The connection is dropped after `idle_timeout` without a complete line.
/// Lines over `max_request_bytes` are discarded and answered with an error.
fn serve_connection(
    stream: UnixStream,
    idle_timeout: Duration,
    max_request_bytes: usize,
    handler: CommandHandler,
) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(idle_timeout))?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    let read_limit = u64::try_from(max_request_bytes)
        .unwrap_or(u64::MAX)
        .saturating_add(1);
    loop {
        line.clear();
        let mut read = reader
            .by_ref()
            .take(read_limit)
            .read_until(b'\n', &mut line);
        if read.is_ok() && line.last() != Some(&b'\n') && line.len() > max_request_bytes {
            read = discard_line(&mut reader).map(|()| line.len());
        }
        match read {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(error) if matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                log::debug!("control connection idle for {idle_timeout:?}; closing");
                return Ok(());
            }
            Err(error) => return Err(error),
        }
        let response = match request_text(&line, max_request_bytes) {
            Ok(text) if text.trim().is_empty() => continue,
            Ok(text) => match parse_command(text) {
                Ok(command) => handler(command),
                Err(error) => {
                    log::warn!("rejected control request: {error}");
                    ControlResponse::failure(&error)
                }
            },
            Err(error) => {
                log::warn!("rejected control request: {error}");
                ControlResponse::failure(&error)
            }
        };
        writer.write_all(response.to_line().as_bytes())?;
        writer.flush()?;
    }
}

fn request_text(line: &[u8], max_request_bytes: usize) -> Result<&str, ControlError> {
    let body = line.strip_suffix(b"\n").unwrap_or(line);
    if body.len() > max_request_bytes {
        return Err(ControlError::invalid_command(format!(
            "request exceeds {max_request_bytes} bytes"
        )));
    }
    std::str::from_utf8(body)
        .map_err(|_| ControlError::invalid_command("request is not valid UTF-8"))
}

/// Consumes input up to and including the next newline without keeping it.
fn discard_line(reader: &mut impl BufRead) -> std::io::Result<()> {
    loop {
        let (found, used) = {
            let available = reader.fill_buf()?;
            if available.is_empty() {
                return Ok(());
            }
            match available.iter().position(|byte| *byte == b'\n') {
                Some(newline) => (true, newline + 1),
                None => (false, available.len()),
            }
        };
        reader.consume(used);
        if found {
            return Ok(());
        }
    }
}
