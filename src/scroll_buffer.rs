use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub const DEFAULT_SCROLL_CAPACITY: usize = 10_000;

/// Bounded line store with a viewport cursor.
///
/// Lines are evicted oldest-first once `capacity` is exceeded. The cursor is
/// the index of the first visible line and always satisfies
/// `cursor <= max(0, len - viewport_height)`.
#[derive(Debug, Clone)]
pub struct ScrollBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    cursor: usize,
    viewport_height: usize,
    follow: bool,
    total_appended: u64,
}

impl Default for ScrollBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_SCROLL_CAPACITY)
    }
}

impl ScrollBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            cursor: 0,
            viewport_height: 1,
            follow: true,
            total_appended: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn viewport_height(&self) -> usize {
        self.viewport_height
    }

    pub fn is_following(&self) -> bool {
        self.follow
    }

    pub fn total_appended(&self) -> u64 {
        self.total_appended
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn content(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<&str>>().join("\n")
    }

    /// Splits `text` on newlines and appends every line.
    pub fn append(&mut self, text: &str) {
        self.push_lines(split_lines(text));
    }

    pub fn push_lines<I>(&mut self, lines: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut evicted = 0usize;
        for line in lines {
            self.lines.push_back(line);
            self.total_appended += 1;
            if self.lines.len() > self.capacity {
                self.lines.pop_front();
                evicted += 1;
            }
        }
        if self.follow {
            self.cursor = self.max_cursor();
        } else {
            self.cursor = self.cursor.saturating_sub(evicted);
            self.clamp_cursor();
        }
    }

    /// Drops all lines and seeds the buffer with `text`.
    pub fn replace(&mut self, text: &str) {
        self.replace_lines(split_lines(text));
    }

    pub fn replace_lines<I>(&mut self, lines: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.lines.clear();
        self.cursor = 0;
        self.follow = true;
        self.push_lines(lines);
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.cursor = 0;
        self.follow = true;
    }

    pub fn set_viewport_height(&mut self, height: usize) {
        self.viewport_height = height.max(1);
        if self.follow {
            self.cursor = self.max_cursor();
        } else {
            self.clamp_cursor();
        }
    }

    /// Returns up to `height` lines starting at the cursor.
    pub fn viewport(&mut self, height: usize) -> Vec<String> {
        if height == 0 {
            return Vec::new();
        }
        self.set_viewport_height(height);
        self.lines
            .iter()
            .skip(self.cursor)
            .take(height)
            .cloned()
            .collect()
    }

    pub fn max_cursor(&self) -> usize {
        self.lines.len().saturating_sub(self.viewport_height)
    }

    /// Moves the cursor proportionally; `0.0` is the top and `1.0` the end.
    pub fn scroll_to(&mut self, fraction: f64) {
        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        let max = self.max_cursor();
        self.cursor = ((max as f64) * fraction).round() as usize;
        self.clamp_cursor();
        self.follow = self.cursor == max;
    }

    pub fn scroll_by(&mut self, delta: isize) {
        let max = self.max_cursor();
        let next = if delta.is_negative() {
            self.cursor.saturating_sub(delta.unsigned_abs())
        } else {
            self.cursor.saturating_add(delta.unsigned_abs()).min(max)
        };
        self.cursor = next;
        self.follow = self.cursor == max;
    }

    fn clamp_cursor(&mut self) {
        let max = self.max_cursor();
        if self.cursor > max {
            self.cursor = max;
        }
    }
}

pub fn split_lines(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let trimmed = text.strip_suffix('\n').unwrap_or(text);
    trimmed
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line).to_owned())
        .collect()
}

#[derive(Debug)]
struct Slot {
    buffer: ScrollBuffer,
    writer: u64,
}

/// A [`ScrollBuffer`] shared between one producer worker and the dispatch loop.
///
/// Producers write through a [`BufferWriter`]; attaching a new writer revokes
/// the previous one, so a worker that outlives its process can never append
/// after its replacement has started.
#[derive(Debug, Clone)]
pub struct SharedScrollBuffer {
    slot: Arc<Mutex<Slot>>,
}

impl SharedScrollBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot {
                buffer: ScrollBuffer::new(capacity),
                writer: 0,
            })),
        }
    }

    pub fn read<R>(&self, f: impl FnOnce(&ScrollBuffer) -> R) -> R {
        f(&self.lock().buffer)
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut ScrollBuffer) -> R) -> R {
        f(&mut self.lock().buffer)
    }

    pub fn content(&self) -> String {
        self.read(ScrollBuffer::content)
    }

    pub fn attach_writer(&self) -> BufferWriter {
        let mut slot = self.lock();
        slot.writer += 1;
        BufferWriter {
            slot: Arc::clone(&self.slot),
            generation: slot.writer,
        }
    }

    pub fn detach_writers(&self) {
        self.lock().writer += 1;
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone)]
pub struct BufferWriter {
    slot: Arc<Mutex<Slot>>,
    generation: u64,
}

impl BufferWriter {
    pub fn is_current(&self) -> bool {
        self.lock().writer == self.generation
    }

    /// Appends already-split lines; returns `false` once the writer is revoked.
    pub fn push_lines(&self, lines: Vec<String>) -> bool {
        let mut slot = self.lock();
        if slot.writer != self.generation {
            return false;
        }
        slot.buffer.push_lines(lines);
        true
    }

    pub fn replace_lines(&self, lines: Vec<String>) -> bool {
        let mut slot = self.lock();
        if slot.writer != self.generation {
            return false;
        }
        slot.buffer.replace_lines(lines);
        true
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "tests/scroll_buffer_tests.rs"]
mod tests;
