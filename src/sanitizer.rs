//! ANSI escape sequence stripping for streaming PTY data.
//!
//! [`AnsiStripper`] consumes raw bytes (possibly split mid-codepoint and
//! mid-escape-sequence), strips ANSI control sequences per the ECMA-48 /
//! xterm conventions, normalizes line endings, and decodes UTF-8
//! incrementally with replacement on invalid bytes. It never fails.
//!
//! [`strip_terminal_noise`] is the second, whole-text pass that removes
//! terminal-UI glyph ranges and phrases once a complete string is available.

use std::sync::LazyLock;

use regex::Regex;

// Box Drawing (U+2500-U+257F), Block Elements (U+2580-U+259F),
// Braille (U+2800-U+28FF), common spinner/prompt dingbats.
static NOISE_CHARS_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(concat!(
        "[\u{2500}-\u{257F}",  // box drawing
        "\u{2580}-\u{259F}",   // block elements
        "\u{2800}-\u{28FF}",   // braille patterns
        "\u{2700}-\u{27BF}",   // dingbats
        "\u{00B7}",            // middle dot
        "\u{276F}",            // heavy right angle
        "\u{27E8}\u{27E9}",    // angle brackets
        "\u{29C9}",            // squared symbol
        "\u{23B0}-\u{23FF}",   // misc technical brackets and controls
        "\u{2190}-\u{21FF}",   // arrows
        "\u{2B50}-\u{2B5F}",   // stars
        "]+",
    ))
    .unwrap()
});

static BLANK_LINES_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"\n{3,}").unwrap()
});

// Common Claude Code / terminal UI text patterns that are never useful
// context. Empirically curated; expect drift as the external CLI evolves.
static TERMINAL_UI_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(
        r"(?i)(?:accept\s*edits?\s*on|shift\+tab\s*to\s*cycle|Esc\s*to\s*cancel|Tab\s*to\s*amend|ctrl\+[a-z]\s*to\s*\w+|Do\s*you\s*want\s*to\s*proceed\??|Yes,?\s*and\s*always\s*allow|for\s*bash\s*mode|to\s*go\s*back|Esc/Enter/Space\s*to\s*close|k\s*to\s*kill|\w+ing…\s*\([^)]*tokens?\)|\w+ing…|Running…|Reading\s*\d+\s*files?…|Loading\s*output…|thought\s*for\s*\d+s|\d+[ms]\s+[\d.]+[km]?\s*tokens?|\d+\s*files?\s*\+\d+\s*-\d+|\w+\s*git:\([^)]*\)|\d+\s*bash\b|Shell\s*details|Status:\s*running|Runtime:\s*\d+[ms]\s*\d*[ms]?)",
    )
    .unwrap()
});

// Collapse runs of horizontal whitespace (not newlines) into one space.
static HORIZ_WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"[^\S\n]{3,}").unwrap()
});

/// Removes terminal UI noise characters and phrases, collapses whitespace
/// runs to one space and blank-line runs to exactly two newlines.
#[must_use]
pub fn strip_terminal_noise(text: &str) -> String {
    let text = NOISE_CHARS_RE.replace_all(text, "");
    let text = TERMINAL_UI_RE.replace_all(&text, "");
    let text = HORIZ_WHITESPACE_RE.replace_all(&text, " ");
    BLANK_LINES_RE.replace_all(&text, "\n\n").into_owned()
}

/// Parser states for ANSI escape sequence stripping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Ground,
    /// Received ESC (0x1B).
    Esc,
    /// ESC followed by intermediate byte (0x20-0x2F).
    EscInter,
    /// CSI sequence (`ESC [` ...).
    CsiParam,
    /// OSC sequence (`ESC ]` ...); also SOS/PM/APC, collapsed.
    OscString,
    /// DCS sequence (`ESC P` ...).
    DcsString,
    /// ESC within a string sequence (possible ST).
    StringEsc,
}

/// Streaming ANSI escape sequence stripper.
///
/// ```
/// use mb_rs::sanitizer::AnsiStripper;
///
/// let mut stripper = AnsiStripper::new();
/// let text = stripper.process(b"\x1b[31mred\x1b[0m\r\n");
/// assert_eq!(text, "red\n");
/// let remaining = stripper.flush();
/// assert!(remaining.is_empty());
/// ```
#[derive(Debug)]
pub struct AnsiStripper {
    state: State,
    /// Deferred `\r` for cross-chunk `\r\n` handling.
    pending_cr: bool,
    /// Incomplete UTF-8 sequence tail carried across chunks.
    utf8_tail: Vec<u8>,
}

impl Default for AnsiStripper {
    fn default() -> Self {
        Self::new()
    }
}

impl AnsiStripper {
    /// Creates a stripper in the ground state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::Ground,
            pending_cr: false,
            utf8_tail: Vec::new(),
        }
    }

    /// Processes a chunk of raw bytes and returns sanitized text.
    pub fn process(&mut self, data: &[u8]) -> String {
        let decoded = self.decode(data, false);
        self.strip(&decoded)
    }

    /// Flushes remaining state at end of stream. A deferred `\r` is emitted
    /// as `\n`; an incomplete UTF-8 tail becomes a replacement character.
    pub fn flush(&mut self) -> String {
        let decoded = self.decode(&[], true);
        let mut text = self.strip(&decoded);
        if self.pending_cr {
            self.pending_cr = false;
            text.insert(0, '\n');
        }
        text
    }

    /// Incremental UTF-8 decoding with replacement on invalid bytes.
    fn decode(&mut self, data: &[u8], finalize: bool) -> String {
        let mut bytes = std::mem::take(&mut self.utf8_tail);
        bytes.extend_from_slice(data);

        let mut out = String::new();
        let mut rest: &[u8] = &bytes;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    // Safety of the range: from_utf8 guarantees validity.
                    if let Ok(valid) = std::str::from_utf8(&rest[..valid_up_to]) {
                        out.push_str(valid);
                    }
                    match err.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid_up_to + bad..];
                        }
                        None => {
                            // Incomplete trailing sequence.
                            rest = &rest[valid_up_to..];
                            break;
                        }
                    }
                }
            }
        }

        if rest.is_empty() {
            return out;
        }
        if finalize {
            out.push(char::REPLACEMENT_CHARACTER);
        } else {
            self.utf8_tail = rest.to_vec();
        }
        out
    }

    /// Strips ANSI sequences and normalizes line endings from decoded text.
    fn strip(&mut self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for ch in text.chars() {
            let cp = ch as u32;
            match self.state {
                State::Ground => self.ground(ch, cp, &mut out),
                State::Esc => self.esc(ch, cp, &mut out),
                State::EscInter => {
                    // Intermediate bytes 0x20-0x2F continue; final 0x30-0x7E ends.
                    if (0x30..=0x7E).contains(&cp) {
                        self.state = State::Ground;
                    } else if !(0x20..=0x2F).contains(&cp) {
                        self.state = State::Ground;
                        self.ground(ch, cp, &mut out);
                    }
                }
                State::CsiParam => {
                    // Parameter (0x30-0x3F) and intermediate (0x20-0x2F)
                    // bytes continue; final byte 0x40-0x7E ends.
                    if (0x40..=0x7E).contains(&cp) {
                        self.state = State::Ground;
                    }
                }
                State::OscString | State::DcsString => self.string_seq(ch, cp),
                State::StringEsc => {
                    if ch == '\\' {
                        // ESC \ is ST.
                        self.state = State::Ground;
                    } else {
                        // Most terminals treat a stray ESC inside a string
                        // as ST; reprocess from ground.
                        self.state = State::Ground;
                        self.ground(ch, cp, &mut out);
                    }
                }
            }
        }
        out
    }

    fn ground(&mut self, ch: char, cp: u32, out: &mut String) {
        if self.pending_cr {
            self.pending_cr = false;
            out.push('\n');
            if ch == '\n' {
                // \r\n collapses to the \n just emitted.
                return;
            }
        }

        match ch {
            '\x1b' => self.state = State::Esc,
            '\r' => self.pending_cr = true,
            '\n' | '\t' => out.push(ch),
            _ => match cp {
                0x9B => self.state = State::CsiParam,
                0x9D => self.state = State::OscString,
                0x90 => self.state = State::DcsString,
                // SOS / PM / APC collapse onto the OSC handling.
                0x98 | 0x9E | 0x9F => self.state = State::OscString,
                // Remaining C0 and C1 controls are stripped.
                0x00..=0x1F | 0x80..=0x9F => {}
                _ => out.push(ch),
            },
        }
    }

    fn esc(&mut self, ch: char, cp: u32, out: &mut String) {
        match ch {
            '[' => self.state = State::CsiParam,
            ']' => self.state = State::OscString,
            'P' => self.state = State::DcsString,
            'X' | '^' | '_' => self.state = State::OscString,
            // SS2 / SS3 affect only the next character; process it normally.
            'N' | 'O' => self.state = State::Ground,
            _ if (0x20..=0x2F).contains(&cp) => self.state = State::EscInter,
            _ if (0x30..=0x7E).contains(&cp) => self.state = State::Ground,
            _ => {
                self.state = State::Ground;
                self.ground(ch, cp, out);
            }
        }
    }

    fn string_seq(&mut self, ch: char, cp: u32) {
        if ch == '\x1b' {
            self.state = State::StringEsc;
        } else if ch == '\x07' || cp == 0x9C {
            // BEL or C1 ST terminates the string sequence.
            self.state = State::Ground;
        }
        // Everything else is consumed.
    }
}
