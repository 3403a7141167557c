use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Color};

use crate::process_manager::{ProcessHandle, PtyScreen, StreamKey, DEFAULT_PTY_SIZE};
use crate::scroll_buffer::{split_lines, SharedScrollBuffer};

/// Stream id of a box's default, never closeable tab.
pub const CONTENT_STREAM_ID: &str = "content";
pub const CONTENT_STREAM_LABEL: &str = "Content";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Running,
    Stopped,
    Error(String),
    Dead(String),
}

impl ProcessState {
    pub fn label(&self) -> &'static str {
        match self {
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopped => "stopped",
            ProcessState::Error(_) => "error",
            ProcessState::Dead(_) => "dead",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ProcessState::Error(reason) | ProcessState::Dead(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, ProcessState::Starting | ProcessState::Running)
    }
}

#[derive(Debug, Clone)]
pub struct ScriptSource {
    pub command: Vec<String>,
    pub refresh_interval: Option<Duration>,
    pub streaming: bool,
    pub refresh_enabled: bool,
    pub last_run: Option<Instant>,
    pub last_exit: Option<String>,
    pub state: ProcessState,
    pub pid: Option<u32>,
}

impl ScriptSource {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            refresh_interval: None,
            streaming: false,
            refresh_enabled: true,
            last_run: None,
            last_exit: None,
            state: ProcessState::Stopped,
            pid: None,
        }
    }

    /// A periodic script is due once its interval has elapsed and the previous
    /// run has finished. A script that never ran is always due.
    pub fn is_due(&self, now: Instant) -> bool {
        if self.state.is_live() {
            return false;
        }
        match (self.last_run, self.refresh_interval) {
            (None, _) => true,
            (Some(last), Some(interval)) => {
                self.refresh_enabled && now.saturating_duration_since(last) >= interval
            }
            (Some(_), None) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PtySource {
    pub command: Vec<String>,
    pub process_handle: Option<ProcessHandle>,
    pub state: ProcessState,
    pub failure_count: u32,
    /// Set while the last attempt ran through the non-interactive path.
    pub fallback: bool,
    /// A start attempt failed and may be retried automatically.
    pub retry_pending: bool,
    pub last_attempt: Option<Instant>,
    pub last_exit: Option<String>,
}

impl PtySource {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            process_handle: None,
            state: ProcessState::Stopped,
            failure_count: 0,
            fallback: false,
            retry_pending: false,
            last_attempt: None,
            last_exit: None,
        }
    }

    pub fn is_retry_due(&self, now: Instant, delay: Duration) -> bool {
        self.retry_pending
            && !self.fallback
            && self.process_handle.is_none()
            && matches!(self.state, ProcessState::Error(_))
            && self
                .last_attempt
                .map_or(true, |last| now.saturating_duration_since(last) >= delay)
    }
}

#[derive(Debug, Clone)]
pub enum StreamSource {
    Static { content: String },
    Script(ScriptSource),
    Pty(PtySource),
}

impl StreamSource {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamSource::Static { .. } => "static",
            StreamSource::Script(_) => "script",
            StreamSource::Pty(_) => "pty",
        }
    }

    pub fn is_pty(&self) -> bool {
        matches!(self, StreamSource::Pty(_))
    }

    pub fn state(&self) -> Option<&ProcessState> {
        match self {
            StreamSource::Static { .. } => None,
            StreamSource::Script(script) => Some(&script.state),
            StreamSource::Pty(pty) => Some(&pty.state),
        }
    }

    pub fn command(&self) -> Option<&[String]> {
        match self {
            StreamSource::Static { .. } => None,
            StreamSource::Script(script) => Some(&script.command),
            StreamSource::Pty(pty) => Some(&pty.command),
        }
    }
}

/// Where a tab came from; redirected choice output re-uses the tab whose
/// origin matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOrigin {
    Content,
    Choice { box_id: String, choice_id: String },
}

impl StreamOrigin {
    pub fn stream_id(&self) -> String {
        match self {
            StreamOrigin::Content => CONTENT_STREAM_ID.to_owned(),
            StreamOrigin::Choice { box_id, choice_id } => format!("choice:{box_id}:{choice_id}"),
        }
    }
}

/// One tab of a box: a content source plus the buffer it writes into.
#[derive(Debug, Clone)]
pub struct Stream {
    pub id: String,
    pub label: String,
    pub closeable: bool,
    pub origin: StreamOrigin,
    pub source: StreamSource,
    buffer: SharedScrollBuffer,
    screen: Option<PtyScreen>,
}

impl Stream {
    pub fn new(
        origin: StreamOrigin,
        label: impl Into<String>,
        source: StreamSource,
        capacity: usize,
    ) -> Self {
        let closeable = origin != StreamOrigin::Content;
        let buffer = SharedScrollBuffer::new(capacity);
        if let StreamSource::Static { content } = &source {
            buffer.update(|buffer| buffer.replace(content));
        }
        let screen = source
            .is_pty()
            .then(|| PtyScreen::new(DEFAULT_PTY_SIZE.0, DEFAULT_PTY_SIZE.1));
        Self {
            id: origin.stream_id(),
            label: label.into(),
            closeable,
            origin,
            source,
            buffer,
            screen,
        }
    }

    pub fn content(label: impl Into<String>, source: StreamSource, capacity: usize) -> Self {
        Self::new(StreamOrigin::Content, label, source, capacity)
    }

    pub fn key(&self, box_id: &str) -> StreamKey {
        StreamKey::new(box_id, self.id.clone())
    }

    pub fn buffer(&self) -> &SharedScrollBuffer {
        &self.buffer
    }

    pub fn screen(&self) -> Option<&PtyScreen> {
        self.screen.as_ref()
    }

    pub fn is_interactive(&self) -> bool {
        matches!(
            &self.source,
            StreamSource::Pty(pty) if pty.state == ProcessState::Running && !pty.fallback
        )
    }

    /// Replaces the stream's source. The buffer is kept; a PTY screen is
    /// attached or dropped to match the new kind.
    pub fn set_source(&mut self, source: StreamSource) {
        if source.is_pty() && self.screen.is_none() {
            self.screen = Some(PtyScreen::new(DEFAULT_PTY_SIZE.0, DEFAULT_PTY_SIZE.1));
        } else if !source.is_pty() {
            self.screen = None;
        }
        self.source = source;
    }

    /// Writes text straight into the buffer, replacing what is there. Static
    /// sources keep the text as their content.
    pub fn replace_content(&mut self, text: &str) {
        if let StreamSource::Static { content } = &mut self.source {
            *content = text.to_owned();
        }
        let lines = split_lines(text);
        self.buffer.update(|buffer| buffer.replace_lines(lines));
    }

    pub fn append_content(&mut self, text: &str) {
        if let StreamSource::Static { content } = &mut self.source {
            if !content.is_empty() && !content.ends_with('\n') {
                content.push('\n');
            }
            content.push_str(text);
        }
        let lines = split_lines(text);
        self.buffer.update(|buffer| buffer.push_lines(lines));
    }

    pub fn visual_state(&self) -> VisualState {
        visual_state(&self.source)
    }
}

/// Title decoration and border colour derived from a stream's process state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VisualState {
    pub marker: Option<&'static str>,
    pub border: Option<Color>,
    pub fallback: bool,
}

pub fn visual_state(source: &StreamSource) -> VisualState {
    match source {
        StreamSource::Static { .. } => VisualState::default(),
        StreamSource::Pty(pty) => {
            let (marker, border) = match &pty.state {
                // Degraded: running without a PTY.
                ProcessState::Starting | ProcessState::Running if pty.fallback => {
                    (Some("⚠️"), Some(AnsiColor::Yellow))
                }
                ProcessState::Starting | ProcessState::Running => {
                    (Some("⚡"), Some(AnsiColor::BrightCyan))
                }
                ProcessState::Error(_) => (Some("⚠️"), Some(AnsiColor::Yellow)),
                ProcessState::Dead(_) => (Some("💀"), Some(AnsiColor::Red)),
                ProcessState::Stopped => (None, Some(AnsiColor::BrightBlack)),
            };
            VisualState {
                marker,
                border: border.map(Color::Ansi),
                fallback: pty.fallback,
            }
        }
        StreamSource::Script(script) => {
            let (marker, border) = match &script.state {
                ProcessState::Starting | ProcessState::Running => (Some("▶️"), None),
                ProcessState::Error(_) | ProcessState::Dead(_) => {
                    (Some("❌"), Some(Color::Ansi(AnsiColor::Red)))
                }
                ProcessState::Stopped if script.last_exit.is_some() => (Some("✅"), None),
                ProcessState::Stopped => (None, None),
            };
            VisualState {
                marker,
                border,
                fallback: false,
            }
        }
    }
}

pub fn decorate_title(title: &str, visual: &VisualState) -> String {
    let mut decorated = match visual.marker {
        Some(marker) if title.is_empty() => marker.to_owned(),
        Some(marker) => format!("{marker} {title}"),
        None => title.to_owned(),
    };
    if visual.fallback {
        if !decorated.is_empty() {
            decorated.push(' ');
        }
        decorated.push_str("[fallback]");
    }
    decorated
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pty_with(state: ProcessState, fallback: bool) -> StreamSource {
        let mut pty = PtySource::new(vec!["bash".to_owned()]);
        pty.state = state;
        pty.fallback = fallback;
        StreamSource::Pty(pty)
    }

    #[test]
    fn pty_states_map_to_markers_and_borders() {
        let running = visual_state(&pty_with(ProcessState::Running, false));
        assert_eq!(running.marker, Some("⚡"));
        assert_eq!(running.border, Some(Color::Ansi(AnsiColor::BrightCyan)));

        let error = visual_state(&pty_with(ProcessState::Error("boom".to_owned()), false));
        assert_eq!(error.marker, Some("⚠️"));
        assert_eq!(error.border, Some(Color::Ansi(AnsiColor::Yellow)));

        let dead = visual_state(&pty_with(ProcessState::Dead("gone".to_owned()), false));
        assert_eq!(dead.marker, Some("💀"));
        assert_eq!(dead.border, Some(Color::Ansi(AnsiColor::Red)));

        let stopped = visual_state(&pty_with(ProcessState::Stopped, false));
        assert_eq!(stopped.marker, None);
        assert_eq!(stopped.border, Some(Color::Ansi(AnsiColor::BrightBlack)));
    }

    #[test]
    fn script_only_colours_failures() {
        let mut script = ScriptSource::new(vec!["date".to_owned()]);
        assert_eq!(
            visual_state(&StreamSource::Script(script.clone())),
            VisualState::default()
        );

        script.state = ProcessState::Running;
        let running = visual_state(&StreamSource::Script(script.clone()));
        assert_eq!(running.marker, Some("▶️"));
        assert_eq!(running.border, None);

        script.state = ProcessState::Stopped;
        script.last_exit = Some("exit=0".to_owned());
        assert_eq!(
            visual_state(&StreamSource::Script(script.clone())).marker,
            Some("✅")
        );

        script.state = ProcessState::Error("exit=2".to_owned());
        let failed = visual_state(&StreamSource::Script(script));
        assert_eq!(failed.marker, Some("❌"));
        assert_eq!(failed.border, Some(Color::Ansi(AnsiColor::Red)));
    }

    #[test]
    fn decorated_title_marks_fallback() {
        let visual = visual_state(&pty_with(ProcessState::Error("no pty".to_owned()), true));
        assert_eq!(decorate_title("Shell", &visual), "⚠️ Shell [fallback]");

        let running = visual_state(&pty_with(ProcessState::Running, true));
        assert_eq!(decorate_title("Shell", &running), "⚠️ Shell [fallback]");
        assert_eq!(running.border, Some(Color::Ansi(AnsiColor::Yellow)));
        assert!(running.fallback);
        assert_eq!(
            decorate_title("Logs", &VisualState::default()),
            "Logs".to_owned()
        );
    }

    #[test]
    fn static_stream_seeds_its_buffer() {
        let stream = Stream::content(
            CONTENT_STREAM_LABEL,
            StreamSource::Static {
                content: "one\ntwo\n".to_owned(),
            },
            10,
        );
        assert!(!stream.closeable);
        assert_eq!(stream.id, CONTENT_STREAM_ID);
        assert_eq!(stream.buffer().content(), "one\ntwo");
    }

    #[test]
    fn append_keeps_static_content_in_sync() {
        let mut stream = Stream::content(
            CONTENT_STREAM_LABEL,
            StreamSource::Static {
                content: "a".to_owned(),
            },
            10,
        );
        stream.append_content("b\nc");
        assert_eq!(stream.buffer().content(), "a\nb\nc");
        match &stream.source {
            StreamSource::Static { content } => assert_eq!(content, "a\nb\nc"),
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[test]
    fn script_due_respects_interval_and_toggle() {
        let now = Instant::now();
        let mut script = ScriptSource::new(vec!["date".to_owned()]);
        assert!(script.is_due(now));

        script.last_run = Some(now);
        script.refresh_interval = Some(Duration::from_millis(500));
        assert!(!script.is_due(now));
        assert!(script.is_due(now + Duration::from_millis(500)));

        script.refresh_enabled = false;
        assert!(!script.is_due(now + Duration::from_secs(5)));
    }

    #[test]
    fn choice_origin_builds_closeable_stream_id() {
        let origin = StreamOrigin::Choice {
            box_id: "menu".to_owned(),
            choice_id: "deploy".to_owned(),
        };
        let stream = Stream::new(
            origin,
            "Deploy",
            StreamSource::Script(ScriptSource::new(Vec::new())),
            10,
        );
        assert!(stream.closeable);
        assert_eq!(stream.id, "choice:menu:deploy");
    }
}
