use anstyle::Color;
use crossterm::event::{KeyCode, KeyModifiers};

use crate::keys::KeyChord;
use crate::process_manager::StreamKey;
use crate::stream::{Stream, StreamOrigin, StreamSource, CONTENT_STREAM_LABEL};
use crate::variables::VariableMap;

/// Edge percentages relative to the parent's rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl Default for Position {
    fn default() -> Self {
        Self::FULL
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PositionError {
    pub position: Position,
}

impl std::fmt::Display for PositionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Position { x1, y1, x2, y2 } = self.position;
        write!(
            f,
            "position ({x1}, {y1}, {x2}, {y2}) must satisfy 0 <= x1 < x2 <= 100 and 0 <= y1 < y2 <= 100"
        )
    }
}

impl std::error::Error for PositionError {}

impl Position {
    pub const FULL: Position = Position {
        x1: 0.0,
        y1: 0.0,
        x2: 100.0,
        y2: 100.0,
    };

    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Result<Self, PositionError> {
        let position = Self { x1, y1, x2, y2 };
        position.validate()?;
        Ok(position)
    }

    pub fn validate(&self) -> Result<(), PositionError> {
        let in_range = |value: f64| (0.0..=100.0).contains(&value);
        let valid = in_range(self.x1)
            && in_range(self.x2)
            && in_range(self.y1)
            && in_range(self.y2)
            && self.x1 < self.x2
            && self.y1 < self.y2;
        if valid {
            Ok(())
        } else {
            Err(PositionError { position: *self })
        }
    }

    /// Resolves the percentages against the parent rectangle.
    pub fn resolve(&self, parent: Rect) -> Rect {
        let scale = |origin: u16, extent: u16, percent: f64| {
            origin as f64 + (extent as f64 * percent / 100.0)
        };
        let left = scale(parent.x, parent.width, self.x1).round() as u16;
        let top = scale(parent.y, parent.height, self.y1).round() as u16;
        let right = scale(parent.x, parent.width, self.x2).round() as u16;
        let bottom = scale(parent.y, parent.height, self.y2).round() as u16;
        Rect {
            x: left,
            y: top,
            width: right.saturating_sub(left),
            height: bottom.saturating_sub(top),
        }
    }
}

/// A resolved cell rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

impl Rect {
    pub fn new(x: u16, y: u16, width: u16, height: u16) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Area left for content once the one-cell border is drawn.
    pub fn inner(&self) -> Rect {
        Rect {
            x: self.x.saturating_add(1),
            y: self.y.saturating_add(1),
            width: self.width.saturating_sub(2),
            height: self.height.saturating_sub(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BoxStyle {
    pub bg_color: Option<Color>,
    pub fg_color: Option<Color>,
    pub title_bg_color: Option<Color>,
    pub title_fg_color: Option<Color>,
    pub border_color: Option<Color>,
    pub selected_border_color: Option<Color>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choice {
    pub id: String,
    pub label: String,
    pub script: Vec<String>,
    pub pty: bool,
    /// Target box whose tab receives the output; `None` runs in place.
    pub redirect_output: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    InvalidIndex { index: usize, len: usize },
    NotCloseable { index: usize },
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::InvalidIndex { index, len } => {
                write!(f, "stream index {index} out of range (box has {len} streams)")
            }
            StreamError::NotCloseable { index } => write!(f, "stream {index} cannot be closed"),
        }
    }
}

impl std::error::Error for StreamError {}

/// What the dispatch loop should do with a key delivered to a focused box.
#[derive(Debug, Clone, PartialEq)]
pub enum InputRoute {
    /// Forward raw bytes to the PTY of the active stream.
    Pty { key: StreamKey, bytes: Vec<u8> },
    Navigate(Navigation),
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Navigation {
    ScrollBy(isize),
    PageUp,
    PageDown,
    ScrollTo(f64),
    NextStream,
    PreviousStream,
}

#[derive(Debug, Clone)]
pub struct MuxBox {
    pub id: String,
    pub title: Option<String>,
    pub position: Position,
    pub parent: Option<String>,
    pub children: Vec<String>,
    pub variables: VariableMap,
    pub focusable: bool,
    pub tab_order: Option<i32>,
    pub style: BoxStyle,
    pub choices: Vec<Choice>,
    streams: Vec<Stream>,
    active_stream: usize,
}

impl MuxBox {
    /// Creates a box whose default tab is built from `content`.
    pub fn new(id: impl Into<String>, content: StreamSource, capacity: usize) -> Self {
        Self {
            id: id.into(),
            title: None,
            position: Position::FULL,
            parent: None,
            children: Vec::new(),
            variables: VariableMap::new(),
            focusable: true,
            tab_order: None,
            style: BoxStyle::default(),
            choices: Vec::new(),
            streams: vec![Stream::content(CONTENT_STREAM_LABEL, content, capacity)],
            active_stream: 0,
        }
    }

    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }

    pub fn streams_mut(&mut self) -> &mut [Stream] {
        &mut self.streams
    }

    pub fn active_stream_index(&self) -> usize {
        self.active_stream
    }

    pub fn active_stream(&self) -> &Stream {
        &self.streams[self.active_stream]
    }

    pub fn active_stream_mut(&mut self) -> &mut Stream {
        &mut self.streams[self.active_stream]
    }

    /// The default tab; always present and never closeable.
    pub fn content_stream(&self) -> &Stream {
        &self.streams[0]
    }

    pub fn content_stream_mut(&mut self) -> &mut Stream {
        &mut self.streams[0]
    }

    pub fn stream(&self, index: usize) -> Option<&Stream> {
        self.streams.get(index)
    }

    pub fn stream_by_id(&self, stream_id: &str) -> Option<&Stream> {
        self.streams.iter().find(|stream| stream.id == stream_id)
    }

    pub fn stream_by_id_mut(&mut self, stream_id: &str) -> Option<&mut Stream> {
        self.streams.iter_mut().find(|stream| stream.id == stream_id)
    }

    pub fn find_stream_by_origin(&self, origin: &StreamOrigin) -> Option<usize> {
        self.streams
            .iter()
            .position(|stream| &stream.origin == origin)
    }

    pub fn choice(&self, choice_id: &str) -> Option<&Choice> {
        self.choices.iter().find(|choice| choice.id == choice_id)
    }

    pub fn add_stream(&mut self, stream: Stream) -> usize {
        self.streams.push(stream);
        self.streams.len() - 1
    }

    pub fn activate_stream(&mut self, index: usize) -> Result<(), StreamError> {
        if index >= self.streams.len() {
            return Err(StreamError::InvalidIndex {
                index,
                len: self.streams.len(),
            });
        }
        self.active_stream = index;
        Ok(())
    }

    pub fn cycle_stream(&mut self, forward: bool) {
        let len = self.streams.len();
        self.active_stream = if forward {
            (self.active_stream + 1) % len
        } else {
            (self.active_stream + len - 1) % len
        };
    }

    /// Removes a closeable tab and returns it so the caller can stop its
    /// process. Closing the active tab activates the one that slid into its
    /// place, or the previous one when it was last.
    pub fn close_stream(&mut self, index: usize) -> Result<Stream, StreamError> {
        let Some(stream) = self.streams.get(index) else {
            return Err(StreamError::InvalidIndex {
                index,
                len: self.streams.len(),
            });
        };
        if !stream.closeable {
            return Err(StreamError::NotCloseable { index });
        }
        let removed = self.streams.remove(index);
        if index < self.active_stream || self.active_stream >= self.streams.len() {
            self.active_stream = self.active_stream.saturating_sub(1);
        }
        Ok(removed)
    }

    pub fn route_input(&self, chord: KeyChord) -> InputRoute {
        let stream = self.active_stream();
        if stream.is_interactive() {
            return match chord.to_terminal_bytes() {
                Some(bytes) => InputRoute::Pty {
                    key: stream.key(&self.id),
                    bytes,
                },
                None => InputRoute::Ignored,
            };
        }
        match navigation_for(chord) {
            Some(navigation) => InputRoute::Navigate(navigation),
            None => InputRoute::Ignored,
        }
    }
}

fn navigation_for(chord: KeyChord) -> Option<Navigation> {
    if chord.modifiers.contains(KeyModifiers::ALT) {
        return None;
    }
    // Home/End jump regardless of ctrl.
    let navigation = match chord.code {
        KeyCode::Up => Navigation::ScrollBy(-1),
        KeyCode::Down => Navigation::ScrollBy(1),
        KeyCode::PageUp => Navigation::PageUp,
        KeyCode::PageDown => Navigation::PageDown,
        KeyCode::Home => Navigation::ScrollTo(0.0),
        KeyCode::End => Navigation::ScrollTo(1.0),
        KeyCode::Left => Navigation::PreviousStream,
        KeyCode::Right => Navigation::NextStream,
        _ => return None,
    };
    Some(navigation)
}

#[cfg(test)]
#[path = "tests/muxbox_tests.rs"]
mod tests;
