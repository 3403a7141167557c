//! Turns raw process output into display-ready lines.
//!
//! SGR colour sequences are kept so a renderer can style them later; every
//! other escape sequence is dropped and carriage returns overwrite the line.

/// Longest line kept before a newline-free run is flushed as its own line.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Incremental byte-to-line decoder. Holds an incomplete trailing line (and
/// any split UTF-8 sequence) until the next chunk arrives. The held tail
/// never exceeds the line limit: longer runs are cut into limit-sized lines.
#[derive(Debug)]
pub struct LineDecoder {
    pending: Vec<u8>,
    max_line_bytes: usize,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_LINE_BYTES)
    }
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_line_bytes: usize) -> Self {
        Self {
            pending: Vec::new(),
            // Room for one full UTF-8 sequence.
            max_line_bytes: max_line_bytes.max(4),
        }
    }

    pub fn max_line_bytes(&self) -> usize {
        self.max_line_bytes
    }

    /// Bytes held back waiting for a newline.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let limit = self.max_line_bytes;
        let mut lines = Vec::new();
        let mut start = 0usize;
        loop {
            let rest = &self.pending[start..];
            let window = &rest[..rest.len().min(limit + 1)];
            if let Some(newline) = window.iter().position(|byte| *byte == b'\n') {
                lines.push(decode_bytes(&rest[..newline]));
                start += newline + 1;
            } else if rest.len() > limit {
                let cut = utf8_cut(rest, limit);
                lines.push(decode_bytes(&rest[..cut]));
                start += cut;
            } else {
                break;
            }
        }
        self.pending.drain(..start);
        lines
    }

    /// Flushes the incomplete trailing line, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        let line = decode_bytes(&rest);
        if line.is_empty() {
            None
        } else {
            Some(line)
        }
    }
}

fn decode_bytes(raw: &[u8]) -> String {
    decode_line(&String::from_utf8_lossy(raw))
}

/// Largest cut at or below `limit` that does not split a UTF-8 sequence.
fn utf8_cut(bytes: &[u8], limit: usize) -> usize {
    let mut cut = limit;
    while cut > limit.saturating_sub(3) && cut > 0 && is_continuation(bytes[cut]) {
        cut -= 1;
    }
    if cut == 0 || is_continuation(bytes[cut]) {
        limit
    } else {
        cut
    }
}

fn is_continuation(byte: u8) -> bool {
    byte & 0b1100_0000 == 0b1000_0000
}

pub fn decode_line(raw: &str) -> String {
    let normalized = strip_non_sgr_sequences(raw);
    let visible = normalized
        .split('\r')
        .filter(|fragment| !fragment.is_empty())
        .next_back()
        .unwrap_or("");
    sanitize_text(visible)
}

fn strip_non_sgr_sequences(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len());
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '\u{1b}' && i + 1 < chars.len() {
            match chars[i + 1] {
                '[' => {
                    let start = i;
                    i += 2;
                    while i < chars.len() {
                        let final_byte = chars[i];
                        if ('@'..='~').contains(&final_byte) {
                            if final_byte == 'm' {
                                out.extend(chars[start..=i].iter());
                            }
                            break;
                        }
                        i += 1;
                    }
                }
                ']' => {
                    i += 2;
                    while i < chars.len() {
                        if chars[i] == '\u{0007}' {
                            break;
                        }
                        if chars[i] == '\u{1b}' && i + 1 < chars.len() && chars[i + 1] == '\\' {
                            i += 1;
                            break;
                        }
                        i += 1;
                    }
                }
                '(' | ')' | '*' | '+' => {
                    i += 2;
                }
                _ => {
                    i += 1;
                }
            }
        } else if ch != '\u{1b}' {
            out.push(ch);
        }
        i += 1;
    }
    out
}

pub fn sanitize_text(raw: &str) -> String {
    raw.chars()
        .filter(|ch| {
            !matches!(
                ch,
                '\r'
                    | '\u{0000}'..='\u{0008}'
                    | '\u{000B}'
                    | '\u{000C}'
                    | '\u{000E}'..='\u{001A}'
                    | '\u{001C}'..='\u{001F}'
                    | '\u{007F}'
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_holds_partial_lines_between_chunks() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.feed(b"hel").is_empty());
        assert_eq!(decoder.feed(b"lo\nwor"), vec!["hello".to_owned()]);
        assert_eq!(decoder.feed(b"ld\n\n"), vec!["world".to_owned(), String::new()]);
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn decoder_reassembles_split_utf8() {
        let mut decoder = LineDecoder::new();
        let bytes = "héllo\n".as_bytes();
        assert!(decoder.feed(&bytes[..2]).is_empty());
        assert_eq!(decoder.feed(&bytes[2..]), vec!["héllo".to_owned()]);
    }

    #[test]
    fn finish_flushes_trailing_fragment() {
        let mut decoder = LineDecoder::new();
        decoder.feed(b"prompt$ ");
        assert_eq!(decoder.finish(), Some("prompt$ ".to_owned()));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn output_without_newlines_is_flushed_at_the_line_limit() {
        let mut decoder = LineDecoder::new();
        let chunk = vec![b'x'; 1024 * 1024];
        let mut emitted = 0usize;
        for _ in 0..16 {
            let lines = decoder.feed(&chunk);
            assert!(decoder.pending_len() <= MAX_LINE_BYTES);
            for line in &lines {
                assert!(line.len() <= MAX_LINE_BYTES);
                emitted += line.len();
            }
        }
        emitted += decoder.finish().map_or(0, |tail| tail.len());
        assert_eq!(emitted, 16 * 1024 * 1024);
    }

    #[test]
    fn long_line_is_cut_on_a_char_boundary() {
        let mut decoder = LineDecoder::with_limit(8);
        let lines = decoder.feed("aaaaaaaé tail\n".as_bytes());
        assert_eq!(
            lines,
            vec!["aaaaaaa".to_owned(), "é tail".to_owned()]
        );
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn line_exactly_at_the_limit_stays_whole() {
        let mut decoder = LineDecoder::with_limit(4);
        assert_eq!(decoder.feed(b"abcd\nef"), vec!["abcd".to_owned()]);
        assert_eq!(decoder.pending_len(), 2);
    }

    #[test]
    fn carriage_return_overwrites_line() {
        assert_eq!(decode_line("building\rfinished\rdone"), "done");
        assert_eq!(decode_line("progress 100%\r"), "progress 100%");
        assert_eq!(decode_line("crlf\r"), "crlf");
    }

    #[test]
    fn keeps_sgr_and_drops_other_sequences() {
        assert_eq!(
            decode_line("\u{1b}[2K\u{1b}[1Ahello \u{1b}[31mred\u{1b}[0m"),
            "hello \u{1b}[31mred\u{1b}[0m"
        );
        assert_eq!(decode_line("\u{1b}]0;title\u{7}shell"), "shell");
        assert_eq!(decode_line("\u{1b}(Bplain"), "plain");
    }

    #[test]
    fn sanitize_removes_control_bytes_but_keeps_tabs() {
        assert_eq!(sanitize_text("a\u{0008}b\tc\u{007f}"), "ab\tc");
    }
}
