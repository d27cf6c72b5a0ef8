//! Error types.
//!
//! [`ParseError`] is the low-level error produced by the zero-copy binary
//! cursor in [`crate::binary::read`] (kept from the original MacBinary
//! parser this crate grew out of). [`MunboxError`] is the crate-wide error
//! taxonomy threaded through every [`crate::Layer`] operation; it is a sum
//! type so that "this factory doesn't recognize the input" can stay
//! structurally distinct from a hard error (callers see
//! `Ok(ProbeOutcome::Unrecognized(_))` from a factory, never an
//! `unsupported` variant, for that case).

use core::fmt;

use crate::binary::read::ReadEof;

/// Errors that originate when parsing binary data with [`crate::binary::read`].
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum ParseError {
    /// EOF was reached unexpectedly
    BadEof,
    /// A value was outside the expected range
    BadValue,
    /// A version field contained an unsupported version
    BadVersion,
    /// An offset was outside allowed bounds
    BadOffset,
    /// An index was outside the valid range
    BadIndex,
    /// A value overflowed its storage type
    Overflow,
    /// CRC did not match expected value
    CrcMismatch,
}

impl From<ReadEof> for ParseError {
    fn from(_error: ReadEof) -> Self {
        ParseError::BadEof
    }
}

impl From<core::num::TryFromIntError> for ParseError {
    fn from(_error: core::num::TryFromIntError) -> Self {
        ParseError::BadValue
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::BadEof => write!(f, "end of data reached unexpectedly"),
            ParseError::BadValue => write!(f, "invalid value"),
            ParseError::BadVersion => write!(f, "unexpected data version"),
            ParseError::BadOffset => write!(f, "invalid data offset"),
            ParseError::BadIndex => write!(f, "invalid data index"),
            ParseError::Overflow => write!(f, "a value overflowed its range"),
            ParseError::CrcMismatch => write!(f, "CRC mismatch"),
        }
    }
}

impl std::error::Error for ParseError {}

/// The crate-wide error taxonomy (spec §7).
///
/// `format_unrecognized` deliberately has no variant here: factories signal
/// "I don't recognize this stream" with `ProbeOutcome::Unrecognized`, not an
/// `Err`.
#[derive(Debug, thiserror::Error)]
pub enum MunboxError {
    /// A read ran past the end of an expected fork or header.
    #[error("truncated input: {0}")]
    TruncatedInput(String),

    /// A CRC did not verify at the end of a fork.
    #[error("checksum mismatch in {context}: expected {expected:#06x}, computed {computed:#06x}")]
    ChecksumMismatch {
        context: String,
        expected: u32,
        computed: u32,
    },

    /// Encrypted entries, unknown compression methods, multi-volume archives.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// API misuse: `read` before `open`, invalid constructor arguments.
    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// Allocation would exceed a sanity bound (e.g. a hostile Arsenic `block_bits`).
    #[error("refusing to allocate: {0}")]
    OutOfMemory(String),

    /// Propagated from the underlying source layer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A low-level binary-cursor parse error, generalized into the crate's
    /// error taxonomy (almost always surfaces as [`MunboxError::TruncatedInput`]
    /// or [`MunboxError::BadParameter`] territory, kept distinct here so call
    /// sites can match on it if they care about the precise cause).
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
}

pub type Result<T> = std::result::Result<T, MunboxError>;
