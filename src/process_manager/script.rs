use std::io::{ErrorKind, Read};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::unistd::{setpgid, Pid};

use super::{
    join_within, monitor_exit, CaptureMode, ChildControl, ExitSink, LaunchSpec, ProcessExit,
    SpawnError, Spawned,
};
use crate::scroll_buffer::BufferWriter;
use crate::terminal_text::LineDecoder;

const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const READ_CHUNK: usize = 8192;

pub(super) fn spawn_script(
    spec: &LaunchSpec,
    capture: CaptureMode,
    writer: BufferWriter,
    generation: u64,
    exit_sink: ExitSink,
    exit: Arc<Mutex<Option<String>>>,
) -> Result<Spawned, SpawnError> {
    let mut command = shell_command(spec);
    let mut child = command.spawn().map_err(|error| SpawnError::Spawn {
        key: spec.key.clone(),
        command: spec.shell.clone(),
        error,
    })?;
    let pid = Some(child.id());

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(SpawnError::MissingStdio {
            key: spec.key.clone(),
        });
    };

    let child = Arc::new(Mutex::new(child));
    let stdout_reader = spawn_reader(stdout, capture, writer.clone(), spec.max_line_bytes);
    let stderr_reader = spawn_reader(stderr, capture, writer.clone(), spec.max_line_bytes);

    let key = spec.key.clone();
    let waited = Arc::clone(&child);
    let monitor = thread::spawn(move || {
        let diagnostic = monitor_exit(
            key.clone(),
            generation,
            || {
                Ok(waited
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .try_wait()?
                    .map(format_exit_diagnostic))
            },
            &exit,
        );
        let mut lines = join_within(stdout_reader, READER_DRAIN_TIMEOUT).unwrap_or_default();
        lines.extend(join_within(stderr_reader, READER_DRAIN_TIMEOUT).unwrap_or_default());
        if capture == CaptureMode::Replace {
            writer.replace_lines(lines);
        }
        log::debug!("script for {key} exited: {diagnostic}");
        exit_sink(ProcessExit {
            key,
            generation,
            diagnostic,
        });
    });

    Ok(Spawned {
        pid,
        control: ChildControl::Script(child),
        input: None,
        monitor,
    })
}

/// Reads one pipe to EOF. In append mode lines go straight to the buffer; in
/// replace mode they are collected and returned to the monitor.
fn spawn_reader<R>(
    mut pipe: R,
    capture: CaptureMode,
    writer: BufferWriter,
    max_line_bytes: usize,
) -> JoinHandle<Vec<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut decoder = LineDecoder::with_limit(max_line_bytes);
        let mut collected = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        let deliver = |lines: Vec<String>, collected: &mut Vec<String>| match capture {
            CaptureMode::Append => lines.is_empty() || writer.push_lines(lines),
            CaptureMode::Replace => {
                collected.extend(lines);
                true
            }
        };
        loop {
            match pipe.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if !deliver(decoder.feed(&chunk[..n]), &mut collected) {
                        return collected;
                    }
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        if let Some(tail) = decoder.finish() {
            deliver(vec![tail], &mut collected);
        }
        collected
    })
}

fn shell_command(spec: &LaunchSpec) -> Command {
    let mut command = Command::new(&spec.shell);
    command
        .arg("-c")
        .arg(spec.script_text())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = spec.cwd.as_ref() {
        command.current_dir(cwd);
    }
    for (name, value) in &spec.env {
        command.env(name, value);
    }
    unsafe {
        command.pre_exec(|| {
            setpgid(Pid::from_raw(0), Pid::from_raw(0))
                .map_err(|error| std::io::Error::new(ErrorKind::Other, error.to_string()))
        });
    }
    command
}

pub(super) fn format_exit_diagnostic(status: std::process::ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit={code}");
    }
    if let Some(signal) = status.signal() {
        return format!("signal={signal}");
    }
    "exit=unknown".to_owned()
}
