//! Error and Result types for history-store operations.

use std::io;
use thiserror::Error;

/// A convenience `Result` type for history-store operations.
pub type Result<T> = std::result::Result<T, HistoryError>;

/// The error type for history-store operations.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// Invalid magic number in a history file header.
    #[error("Invalid magic number: expected 0x05FFB100, got {0:#010X}")]
    InvalidMagic(u32),

    /// Unsupported history file format version.
    #[error("Unsupported file version: {0}")]
    UnsupportedVersion(u32),

    /// The file was produced by a different state-provider version.
    #[error("Provider version mismatch: expected {expected}, found {found}")]
    ProviderVersionMismatch {
        /// Version the caller was built with.
        expected: u32,
        /// Version recorded in the file.
        found: u32,
    },

    /// Unknown state-value type byte in a serialised interval.
    #[error("Unknown state value type: {0:#04X}")]
    UnknownValueType(u8),

    /// A string or custom payload exceeds the 32 767 byte wire limit.
    #[error("State value payload too large: {0} bytes")]
    ValueTooLarge(usize),

    /// Structurally invalid on-disk data (truncation, bad terminator, ...).
    #[error("Corrupt history data: {0}")]
    Corrupt(String),

    /// Queried timestamp outside the back-end's time range.
    #[error("Time {t} outside of range [{start}, {end}]")]
    TimeRange {
        /// The requested timestamp.
        t: i64,
        /// Start of the valid range.
        start: i64,
        /// End of the valid range.
        end: i64,
    },

    /// Attempt to create attributes through a shadow state-system.
    #[error("Shadow state-system must not modify the attribute tree")]
    AttributeTreeImmutable,

    /// Operation on a disposed back-end or state-system.
    #[error("Operation on a disposed history back-end")]
    Disposed,

    /// A replay or blocking wait was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl HistoryError {
    /// Returns true for the corruption family of errors (bad magic, bad
    /// version, unknown value type, truncated or malformed data).
    pub fn is_corrupt(&self) -> bool {
        matches!(
            self,
            HistoryError::InvalidMagic(_)
                | HistoryError::UnsupportedVersion(_)
                | HistoryError::ProviderVersionMismatch { .. }
                | HistoryError::UnknownValueType(_)
                | HistoryError::ValueTooLarge(_)
                | HistoryError::Corrupt(_)
        )
    }
}
