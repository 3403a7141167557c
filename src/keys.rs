use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

/// A normalized logical key press, as used by the hot-key table and the
/// input router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyChord {
    pub code: KeyCode,
    pub modifiers: KeyModifiers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyParseError {
    Empty,
    UnknownKey(String),
    UnknownModifier(String),
}

impl std::fmt::Display for KeyParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyParseError::Empty => write!(f, "empty key chord"),
            KeyParseError::UnknownKey(key) => write!(f, "unknown key `{key}`"),
            KeyParseError::UnknownModifier(modifier) => {
                write!(f, "unknown key modifier `{modifier}`")
            }
        }
    }
}

impl std::error::Error for KeyParseError {}

impl KeyChord {
    pub fn new(code: KeyCode, modifiers: KeyModifiers) -> Self {
        normalize(code, modifiers)
    }

    pub fn plain(code: KeyCode) -> Self {
        Self::new(code, KeyModifiers::NONE)
    }

    pub fn ctrl(c: char) -> Self {
        Self::new(KeyCode::Char(c), KeyModifiers::CONTROL)
    }

    /// Parses chords such as `ctrl+c`, `Tab`, `shift+tab`, `PageDown`, `f5`.
    pub fn parse(raw: &str) -> Result<Self, KeyParseError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(KeyParseError::Empty);
        }
        // "+" on its own (or "ctrl++") names the plus key.
        let (modifier_part, key_part) = if raw == "+" {
            ("", "+")
        } else if let Some(prefix) = raw.strip_suffix("++") {
            (prefix, "+")
        } else {
            match raw.rsplit_once('+') {
                Some((modifiers, key)) => (modifiers, key),
                None => ("", raw),
            }
        };

        let mut modifiers = KeyModifiers::NONE;
        for part in modifier_part.split('+').filter(|part| !part.is_empty()) {
            modifiers |= match part.to_ascii_lowercase().as_str() {
                "ctrl" | "control" => KeyModifiers::CONTROL,
                "alt" | "meta" | "option" => KeyModifiers::ALT,
                "shift" => KeyModifiers::SHIFT,
                other => return Err(KeyParseError::UnknownModifier(other.to_owned())),
            };
        }

        let code = parse_key_code(key_part)?;
        Ok(Self::new(code, modifiers))
    }

    pub fn is_plain(&self, code: KeyCode) -> bool {
        self.code == code && self.modifiers.is_empty()
    }

    pub fn has_ctrl(&self) -> bool {
        self.modifiers.contains(KeyModifiers::CONTROL)
    }

    /// Terminal byte sequence for this key when forwarded to a PTY.
    pub fn to_terminal_bytes(&self) -> Option<Vec<u8>> {
        if self.has_ctrl() {
            if let KeyCode::Char(c) = self.code {
                // Control codes exist only for ASCII.
                if !c.is_ascii() {
                    return None;
                }
                let lower = c.to_ascii_lowercase() as u8;
                if lower.is_ascii_lowercase() {
                    return Some(vec![lower - b'a' + 1]);
                }
                return match c {
                    ' ' | '@' => Some(vec![0]),
                    '[' => Some(vec![0x1b]),
                    '\\' => Some(vec![0x1c]),
                    ']' => Some(vec![0x1d]),
                    _ => None,
                };
            }
        }

        let mapped: &[u8] = match self.code {
            KeyCode::Enter => b"\r",
            KeyCode::Tab => b"\t",
            KeyCode::BackTab => b"\x1b[Z",
            KeyCode::Backspace => b"\x7f",
            KeyCode::Esc => b"\x1b",
            KeyCode::Left => b"\x1b[D",
            KeyCode::Right => b"\x1b[C",
            KeyCode::Up => b"\x1b[A",
            KeyCode::Down => b"\x1b[B",
            KeyCode::Home => b"\x1b[H",
            KeyCode::End => b"\x1b[F",
            KeyCode::PageUp => b"\x1b[5~",
            KeyCode::PageDown => b"\x1b[6~",
            KeyCode::Insert => b"\x1b[2~",
            KeyCode::Delete => b"\x1b[3~",
            KeyCode::F(n) => return function_key_bytes(n),
            KeyCode::Char(c) => {
                let mut out = Vec::with_capacity(5);
                if self.modifiers.contains(KeyModifiers::ALT) {
                    out.push(0x1b);
                }
                let mut utf8 = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes());
                return Some(out);
            }
            _ => return None,
        };
        Some(mapped.to_vec())
    }
}

impl From<KeyEvent> for KeyChord {
    fn from(event: KeyEvent) -> Self {
        Self::new(event.code, event.modifiers)
    }
}

impl std::fmt::Display for KeyChord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.modifiers.contains(KeyModifiers::CONTROL) {
            write!(f, "ctrl+")?;
        }
        if self.modifiers.contains(KeyModifiers::ALT) {
            write!(f, "alt+")?;
        }
        if self.modifiers.contains(KeyModifiers::SHIFT) {
            write!(f, "shift+")?;
        }
        match self.code {
            KeyCode::Char(' ') => write!(f, "space"),
            KeyCode::Char(c) => write!(f, "{c}"),
            KeyCode::F(n) => write!(f, "f{n}"),
            KeyCode::BackTab => write!(f, "backtab"),
            KeyCode::PageUp => write!(f, "pageup"),
            KeyCode::PageDown => write!(f, "pagedown"),
            other => write!(f, "{}", format!("{other:?}").to_ascii_lowercase()),
        }
    }
}

fn normalize(code: KeyCode, modifiers: KeyModifiers) -> KeyChord {
    let modifiers = modifiers & (KeyModifiers::CONTROL | KeyModifiers::ALT | KeyModifiers::SHIFT);
    match code {
        KeyCode::Tab if modifiers.contains(KeyModifiers::SHIFT) => KeyChord {
            code: KeyCode::BackTab,
            modifiers: modifiers - KeyModifiers::SHIFT,
        },
        KeyCode::BackTab => KeyChord {
            code,
            modifiers: modifiers - KeyModifiers::SHIFT,
        },
        KeyCode::Char(c) if modifiers.contains(KeyModifiers::CONTROL) => KeyChord {
            code: KeyCode::Char(c.to_ascii_lowercase()),
            modifiers: modifiers - KeyModifiers::SHIFT,
        },
        KeyCode::Char(_) => KeyChord {
            code,
            modifiers: modifiers - KeyModifiers::SHIFT,
        },
        _ => KeyChord { code, modifiers },
    }
}

fn parse_key_code(raw: &str) -> Result<KeyCode, KeyParseError> {
    let mut chars = raw.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        return Ok(KeyCode::Char(c));
    }
    let lower = raw.to_ascii_lowercase();
    let code = match lower.as_str() {
        "tab" => KeyCode::Tab,
        "backtab" => KeyCode::BackTab,
        "enter" | "return" => KeyCode::Enter,
        "esc" | "escape" => KeyCode::Esc,
        "backspace" => KeyCode::Backspace,
        "delete" | "del" => KeyCode::Delete,
        "insert" | "ins" => KeyCode::Insert,
        "up" => KeyCode::Up,
        "down" => KeyCode::Down,
        "left" => KeyCode::Left,
        "right" => KeyCode::Right,
        "home" => KeyCode::Home,
        "end" => KeyCode::End,
        "pageup" | "pgup" => KeyCode::PageUp,
        "pagedown" | "pgdn" => KeyCode::PageDown,
        "space" => KeyCode::Char(' '),
        other => {
            let number = other
                .strip_prefix('f')
                .and_then(|n| n.parse::<u8>().ok())
                .filter(|n| (1..=24).contains(n));
            match number {
                Some(n) => KeyCode::F(n),
                None => return Err(KeyParseError::UnknownKey(raw.to_owned())),
            }
        }
    };
    Ok(code)
}

fn function_key_bytes(n: u8) -> Option<Vec<u8>> {
    let sequence = match n {
        1 => "\x1bOP",
        2 => "\x1bOQ",
        3 => "\x1bOR",
        4 => "\x1bOS",
        5 => "\x1b[15~",
        6 => "\x1b[17~",
        7 => "\x1b[18~",
        8 => "\x1b[19~",
        9 => "\x1b[20~",
        10 => "\x1b[21~",
        11 => "\x1b[23~",
        12 => "\x1b[24~",
        _ => return None,
    };
    Some(sequence.as_bytes().to_vec())
}

/// What a bound hot key does. Hot keys are checked before a key reaches the
/// focused box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotKeyAction {
    Quit,
    FocusNext,
    FocusPrevious,
    NextStream,
    PreviousStream,
    CloseStream,
    Refresh(String),
    SwitchLayout(String),
    RunChoice { box_id: String, choice_id: String },
}

impl HotKeyAction {
    /// Parses `quit`, `focus_next`, `refresh:<box>`, `layout:<id>`,
    /// `choice:<box>:<choice>` and friends.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let action = match raw {
            "quit" => HotKeyAction::Quit,
            "focus_next" => HotKeyAction::FocusNext,
            "focus_previous" => HotKeyAction::FocusPrevious,
            "next_stream" => HotKeyAction::NextStream,
            "previous_stream" => HotKeyAction::PreviousStream,
            "close_stream" => HotKeyAction::CloseStream,
            _ => {
                let (kind, argument) = raw.split_once(':')?;
                if argument.is_empty() {
                    return None;
                }
                match kind {
                    "refresh" => HotKeyAction::Refresh(argument.to_owned()),
                    "layout" => HotKeyAction::SwitchLayout(argument.to_owned()),
                    "choice" => {
                        let (box_id, choice_id) = argument.split_once(':')?;
                        if box_id.is_empty() || choice_id.is_empty() {
                            return None;
                        }
                        HotKeyAction::RunChoice {
                            box_id: box_id.to_owned(),
                            choice_id: choice_id.to_owned(),
                        }
                    }
                    _ => return None,
                }
            }
        };
        Some(action)
    }
}

/// Bindings that apply unless the configuration rebinds the same chord.
pub fn default_hot_keys() -> Vec<(KeyChord, HotKeyAction)> {
    vec![(KeyChord::ctrl('q'), HotKeyAction::Quit)]
}

#[cfg(test)]
#[path = "tests/keys_tests.rs"]
mod tests;
