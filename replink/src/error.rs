//! Error types for replink operations.

use std::time::Duration;

use replink_proto::control::KEYBOARD_INTERRUPT;
use replink_proto::{ParseError, Traceback};

/// Alias for `Result<T, replink::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by links, transactions and the raw REPL engine.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The device could not be found or the user may not open it.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Opening the link failed.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// No data arrived for the whole window.
    #[error("timed out after {0:?} without new data")]
    Timeout(Duration),

    /// The device answered outside the raw REPL framing.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Code executed on the device raised an exception.
    #[error("{0}")]
    Execution(#[from] ExecError),

    /// The API was used in a state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The link went away while waiting for data.
    #[error("link closed")]
    Closed,

    /// Local I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this is a device exception caused by an interrupt.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Execution(e) if e.is_interrupt())
    }

    /// Wraps any displayable error as [`Error::ConnectFailed`].
    pub(crate) fn connect(e: impl std::fmt::Display) -> Self {
        Self::ConnectFailed(e.to_string())
    }
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Self::ProtocolViolation(e.to_string())
    }
}

/// Exception text printed by the device on stderr.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", .text.trim_end())]
pub struct ExecError {
    /// Raw stderr output.
    text: String,
}

impl ExecError {
    /// Wraps stderr output.
    pub const fn new(text: String) -> Self {
        Self { text }
    }

    /// Stderr exactly as printed.
    pub fn message(&self) -> &str {
        &self.text
    }

    /// Whether the exception is a `KeyboardInterrupt`.
    pub fn is_interrupt(&self) -> bool {
        self.text.contains(KEYBOARD_INTERRUPT)
    }

    /// Parsed traceback, if the output carries one.
    pub fn traceback(&self) -> Option<Traceback> {
        Traceback::parse(&self.text)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_is_detected() {
        let e = Error::from(ExecError::new(
            "Traceback (most recent call last):\r\n  File \"<stdin>\", line 2, in <module>\r\n\
             KeyboardInterrupt: \r\n"
                .into(),
        ));
        assert!(e.is_interrupt());
        assert!(!Error::Closed.is_interrupt());
    }

    #[test]
    fn exec_error_exposes_traceback() {
        let e = ExecError::new(
            "Traceback (most recent call last):\r\n  File \"<stdin>\", line 1, in <module>\r\n\
             ZeroDivisionError: divide by zero\r\n"
                .into(),
        );
        assert!(!e.is_interrupt());
        assert_eq!(e.traceback().unwrap().summary(), "divide by zero at <stdin>:1");
        assert!(e.to_string().ends_with("divide by zero"));
    }

    #[test]
    fn parse_errors_become_protocol_violations() {
        let e = Error::from(ParseError::OddHexLength(3));
        assert!(matches!(e, Error::ProtocolViolation(_)));
    }
}
