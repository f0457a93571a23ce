//! Tracebacks printed by the device on stderr.

use serde::{Deserialize, Serialize};

/// One `File "...", line N, in scope` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Frame {
    /// Source file, `<stdin>` for code sent over the REPL.
    pub file: String,
    /// 1-based line number.
    pub line: u32,
    /// Enclosing function, `<module>` at top level.
    pub scope: String,
}

/// A parsed device exception.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Traceback {
    /// Exception class, e.g. `ValueError`.
    pub kind: String,
    /// Exception message, possibly empty.
    pub message: String,
    /// Call stack, outermost first.
    pub frames: Vec<Frame>,
}

impl Traceback {
    /// Parses stderr text. Returns `None` unless at least one frame is found.
    pub fn parse(text: &str) -> Option<Self> {
        let mut frames = Vec::new();
        let mut last = "";
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(frame) = parse_frame(line) {
                frames.push(frame);
            } else if !line.starts_with("Traceback ") {
                last = line;
            }
        }
        if frames.is_empty() {
            return None;
        }
        let (kind, message) = match last.split_once(':') {
            Some((kind, message)) => (kind.trim(), message.trim()),
            None => (last, ""),
        };
        Some(Self {
            kind: kind.to_owned(),
            message: message.to_owned(),
            frames,
        })
    }

    /// `"<message> at <file>:<line>"` for the innermost frame.
    pub fn summary(&self) -> String {
        let what = if self.message.is_empty() { &self.kind } else { &self.message };
        match self.frames.last() {
            Some(f) => format!("{what} at {}:{}", f.file, f.line),
            None => what.clone(),
        }
    }
}

/// Parses `File "name", line N[, in scope]`.
fn parse_frame(line: &str) -> Option<Frame> {
    let rest = line.strip_prefix("File \"")?;
    let (file, rest) = rest.split_once('"')?;
    let rest = rest.trim_start_matches(',').trim_start().strip_prefix("line ")?;
    let (num, scope) = match rest.split_once(',') {
        Some((num, tail)) => (num, tail.trim().strip_prefix("in ").unwrap_or("<module>")),
        None => (rest, "<module>"),
    };
    Some(Frame {
        file: file.to_owned(),
        line: num.trim().parse().ok()?,
        scope: scope.trim().to_owned(),
    })
}
