use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{ControlCommand, ControlResponse};

const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum ClientError {
    Connect {
        path: PathBuf,
        error: std::io::Error,
    },
    Io(std::io::Error),
    Closed,
    Decode(serde_json::Error),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Connect { path, error } => {
                write!(f, "failed connecting to {}: {error}", path.display())
            }
            ClientError::Io(error) => write!(f, "control socket I/O failed: {error}"),
            ClientError::Closed => write!(f, "control socket closed before responding"),
            ClientError::Decode(error) => write!(f, "invalid response: {error}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<std::io::Error> for ClientError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(value: serde_json::Error) -> Self {
        Self::Decode(value)
    }
}

/// Sends one raw request line and returns the raw response line.
pub fn send_raw(path: &Path, request: &str) -> Result<String, ClientError> {
    let mut stream = UnixStream::connect(path).map_err(|error| ClientError::Connect {
        path: path.to_path_buf(),
        error,
    })?;
    stream.set_read_timeout(Some(CLIENT_TIMEOUT))?;
    stream.write_all(request.trim_end().as_bytes())?;
    stream.write_all(b"\n")?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(ClientError::Closed);
    }
    Ok(line.trim_end().to_owned())
}

pub fn send_command(path: &Path, command: &ControlCommand) -> Result<ControlResponse, ClientError> {
    let request = serde_json::to_string(command)?;
    let line = send_raw(path, &request)?;
    Ok(serde_json::from_str(&line)?)
}
