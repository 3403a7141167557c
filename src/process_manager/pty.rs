use std::io::{ErrorKind, Read};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use portable_pty::{CommandBuilder, MasterPty, PtySize};
use vt100::Parser as VtParser;

use super::{join_within, monitor_exit, ChildControl, ExitSink, LaunchSpec, ProcessExit, Spawned};
use crate::scroll_buffer::BufferWriter;
use crate::terminal_text::LineDecoder;

const SCREEN_SCROLLBACK: usize = 0;
const READ_CHUNK: usize = 8192;
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Terminal emulation of a PTY stream's current screen, kept alongside the
/// line buffer so full-screen programs can be inspected.
#[derive(Clone)]
pub struct PtyScreen {
    parser: Arc<Mutex<VtParser>>,
}

impl std::fmt::Debug for PtyScreen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (rows, cols) = self.size();
        f.debug_struct("PtyScreen")
            .field("rows", &rows)
            .field("cols", &cols)
            .finish()
    }
}

impl PtyScreen {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            parser: Arc::new(Mutex::new(VtParser::new(
                rows.max(1),
                cols.max(1),
                SCREEN_SCROLLBACK,
            ))),
        }
    }

    pub fn process(&self, bytes: &[u8]) {
        self.parser
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .process(bytes);
    }

    pub fn size(&self) -> (u16, u16) {
        self.parser
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .screen()
            .size()
    }

    pub fn set_size(&self, rows: u16, cols: u16) {
        self.parser
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set_size(rows.max(1), cols.max(1));
    }

    /// Plain-text rows of the visible screen, trailing blank rows removed.
    pub fn rows(&self) -> Vec<String> {
        let parser = self.parser.lock().unwrap_or_else(PoisonError::into_inner);
        let (_, cols) = parser.screen().size();
        let mut rows = parser
            .screen()
            .rows(0, cols)
            .map(|row| row.trim_end().to_owned())
            .collect::<Vec<String>>();
        while rows.last().is_some_and(String::is_empty) {
            rows.pop();
        }
        rows
    }
}

#[derive(Clone)]
pub(crate) struct PtyChild {
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
}

impl PtyChild {
    pub(crate) fn try_wait(&self) -> Result<Option<String>, std::io::Error> {
        let status = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_wait()?;
        Ok(status.map(|status| format!("exit={}", status.exit_code())))
    }

    pub(crate) fn kill(&self) {
        let _ = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .kill();
    }

    pub(crate) fn resize(&self, rows: u16, cols: u16) {
        let result = self
            .master
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resize(pty_size(rows, cols));
        if let Err(err) = result {
            log::warn!("PTY resize to {rows}x{cols} failed: {err}");
        }
    }
}

fn pty_size(rows: u16, cols: u16) -> PtySize {
    PtySize {
        rows: rows.max(1),
        cols: cols.max(1),
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Delivers one chunk of PTY output to the screen and the scroll buffer.
/// Returns `false` once the writer has been revoked; a superseded reader must
/// not touch the screen shared with its replacement.
fn feed_output(
    chunk: &[u8],
    decoder: &mut LineDecoder,
    screen: Option<&PtyScreen>,
    writer: &BufferWriter,
) -> bool {
    if !writer.is_current() {
        return false;
    }
    if let Some(screen) = screen {
        screen.process(chunk);
    }
    let lines = decoder.feed(chunk);
    lines.is_empty() || writer.push_lines(lines)
}

/// Opens a PTY and runs the script inside it. Errors come back as a message
/// so the caller can count the failure and decide on a fallback.
pub(super) fn spawn_pty(
    spec: &LaunchSpec,
    writer: BufferWriter,
    screen: Option<PtyScreen>,
    generation: u64,
    exit_sink: ExitSink,
    exit: Arc<Mutex<Option<String>>>,
) -> Result<Spawned, String> {
    let (rows, cols) = spec.pty_size;
    let pair = portable_pty::native_pty_system()
        .openpty(pty_size(rows, cols))
        .map_err(|err| format!("openpty failed: {err}"))?;

    let mut command = CommandBuilder::new(&spec.shell);
    command.arg("-c");
    command.arg(spec.script_text());
    if let Some(cwd) = spec.cwd.as_ref() {
        command.cwd(cwd);
    }
    for (name, value) in &spec.env {
        command.env(name, value);
    }

    let child = pair
        .slave
        .spawn_command(command)
        .map_err(|err| format!("failed to spawn `{}` in PTY: {err}", spec.shell))?;
    drop(pair.slave);

    let pid = child.process_id();
    let child = Arc::new(Mutex::new(child));
    let abort = |message: String| {
        let _ = child.lock().unwrap_or_else(PoisonError::into_inner).kill();
        message
    };
    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|err| abort(format!("PTY reader unavailable: {err}")))?;
    let input = pair
        .master
        .take_writer()
        .map_err(|err| abort(format!("PTY writer unavailable: {err}")))?;
    let control = PtyChild {
        child,
        master: Arc::new(Mutex::new(pair.master)),
    };

    if let Some(screen) = screen.as_ref() {
        screen.set_size(rows, cols);
    }
    let reader_writer = writer;
    let max_line_bytes = spec.max_line_bytes;
    let reader_thread = thread::spawn(move || {
        let mut decoder = LineDecoder::with_limit(max_line_bytes);
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if !feed_output(&chunk[..n], &mut decoder, screen.as_ref(), &reader_writer) {
                        return;
                    }
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                // EIO once the slave side closes.
                Err(_) => break,
            }
        }
        if let Some(tail) = decoder.finish() {
            reader_writer.push_lines(vec![tail]);
        }
    });

    let key = spec.key.clone();
    let waited = control.clone();
    let monitor = thread::spawn(move || {
        let diagnostic = monitor_exit(key.clone(), generation, || waited.try_wait(), &exit);
        if join_within(reader_thread, READER_DRAIN_TIMEOUT).is_none() {
            log::warn!("PTY reader for {key} did not drain in time");
        }
        log::debug!("PTY for {key} exited: {diagnostic}");
        exit_sink(ProcessExit {
            key,
            generation,
            diagnostic,
        });
    });

    Ok(Spawned {
        pid,
        control: ChildControl::Pty(control),
        input: Some(Arc::new(Mutex::new(input))),
        monitor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scroll_buffer::SharedScrollBuffer;

    #[test]
    fn superseded_reader_leaves_the_shared_screen_alone() {
        let buffer = SharedScrollBuffer::new(100);
        let screen = PtyScreen::new(4, 20);
        let old_writer = buffer.attach_writer();
        let mut old_decoder = LineDecoder::new();
        assert!(feed_output(b"old\r\n", &mut old_decoder, Some(&screen), &old_writer));

        let new_writer = buffer.attach_writer();
        let mut new_decoder = LineDecoder::new();
        screen.process(b"\x1b[2J\x1b[H");
        assert!(feed_output(b"fresh\r\n", &mut new_decoder, Some(&screen), &new_writer));

        assert!(!feed_output(b"stale\r\n", &mut old_decoder, Some(&screen), &old_writer));
        assert_eq!(screen.rows(), vec!["fresh".to_owned()]);
        assert!(!buffer.content().contains("stale"));
    }

    #[test]
    fn screen_and_buffer_both_see_current_output() {
        let buffer = SharedScrollBuffer::new(100);
        let screen = PtyScreen::new(4, 20);
        let writer = buffer.attach_writer();
        let mut decoder = LineDecoder::new();
        assert!(feed_output(b"one\r\ntwo", &mut decoder, Some(&screen), &writer));
        assert_eq!(screen.rows(), vec!["one".to_owned(), "two".to_owned()]);
        assert_eq!(buffer.content(), "one");
        assert_eq!(decoder.pending_len(), 3);
    }
}
