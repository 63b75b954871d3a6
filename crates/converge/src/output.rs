//! Subprocess output handling: terminal-safe log lines and a bounded tail
//! kept for failure diagnostics and error classification.

use std::collections::VecDeque;

const MAX_LINE_CHARS: usize = 4096;

#[derive(Clone, Copy)]
enum Escape {
    Start,
    Csi,
    Osc,
    OscEsc,
    String,
    StringEsc,
}

impl Escape {
    /// Consume one char inside an escape sequence; `None` when it ends.
    fn step(self, c: char) -> Option<Escape> {
        match (self, c) {
            (Escape::Start, '[') => Some(Escape::Csi),
            (Escape::Start, ']') => Some(Escape::Osc),
            (Escape::Start, 'P' | 'X' | '^' | '_') => Some(Escape::String),
            (Escape::Start, _) => None,
            (Escape::Csi, '@'..='~') => None,
            (Escape::Csi, _) => Some(Escape::Csi),
            (Escape::Osc, '\x07') => None,
            (Escape::Osc, '\x1b') => Some(Escape::OscEsc),
            (Escape::Osc, _) => Some(Escape::Osc),
            (Escape::OscEsc, '\\') => None,
            (Escape::OscEsc, '\x1b') => Some(Escape::OscEsc),
            (Escape::OscEsc, _) => Some(Escape::Osc),
            (Escape::String, '\x1b') => Some(Escape::StringEsc),
            (Escape::String, _) => Some(Escape::String),
            (Escape::StringEsc, '\\') => None,
            (Escape::StringEsc, '\x1b') => Some(Escape::StringEsc),
            (Escape::StringEsc, _) => Some(Escape::String),
        }
    }
}

/// Strip ANSI escapes, control and bidi-override characters, and cap length.
pub fn sanitize_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LINE_CHARS));
    let mut esc: Option<Escape> = None;
    let mut kept = 0usize;

    for c in input.chars() {
        if let Some(state) = esc {
            esc = state.step(c);
            continue;
        }
        match c {
            '\x1b' => {
                esc = Some(Escape::Start);
                continue;
            }
            '\r' | '\n' => continue,
            '\t' => out.push(' '),
            c if c.is_control() || is_bidi_control(c) => continue,
            c => out.push(c),
        }
        kept += 1;
        if kept >= MAX_LINE_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }
    out
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

/// Last `cap` lines of a command's combined output.
#[derive(Debug, Clone)]
pub struct OutputTail {
    cap: usize,
    lines: VecDeque<String>,
}

impl OutputTail {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            lines: VecDeque::new(),
        }
    }

    pub fn push(&mut self, line: String) {
        while self.lines.len() >= self.cap {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn joined(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Last line, for one-line failure summaries.
    pub fn last(&self) -> Option<&str> {
        self.lines.back().map(String::as_str)
    }
}
