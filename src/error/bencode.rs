pub type Result<T> = std::result::Result<T, BencodeError>;

/// Error type returned on malformed bencoded input.
///
/// Every variant carries the byte offset at which decoding failed so a
/// rejected metainfo file can be inspected by hand.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum BencodeError {
    #[error("unexpected end of input at byte {0}")]
    /// The input ended in the middle of a value.
    UnexpectedEof(usize),

    #[error("unexpected byte {byte:#04x} at offset {offset}")]
    /// A byte that cannot start or continue a value at this position.
    UnexpectedByte { byte: u8, offset: usize },

    #[error("invalid integer at offset {0}")]
    /// An empty integer body, a leading zero, or `-0`.
    InvalidInteger(usize),

    #[error("invalid string length at offset {0}")]
    /// An empty or zero-padded string length prefix.
    InvalidLength(usize),

    #[error("integer out of range at offset {0}")]
    /// The integer does not fit the 64-bit signed range.
    IntegerOverflow(usize),

    #[error("trailing data after value at offset {0}")]
    /// The top-level value ended before the input did.
    TrailingData(usize),
}
