//! Errors raised while parsing device output.

/// Alias for `Result<T, replink_proto::ParseError>`.
pub type Result<T> = std::result::Result<T, ParseError>;

/// Device output did not have the expected shape.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ParseError {
    /// Hex dump with an odd number of digits.
    #[error("hex dump has odd length {0}")]
    OddHexLength(usize),

    /// Non-hex character in a hex dump.
    #[error("invalid hex digit at offset {0}")]
    InvalidHex(usize),

    /// A `|`-separated record had the wrong number of fields.
    #[error("expected {expected} fields, got {actual}: {line:?}")]
    FieldCount {
        /// Number of fields the script prints.
        expected: usize,
        /// Number of fields received.
        actual: usize,
        /// The offending line.
        line: String,
    },

    /// A numeric field did not parse.
    #[error("invalid number {0:?}")]
    Number(String),

    /// A connection id did not match the `XXXX-XXXX-XXXX` format.
    #[error("malformed connection id {0:?}")]
    ConnectionId(String),
}
