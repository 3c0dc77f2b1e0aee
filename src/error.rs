//! Error taxonomy shared by the record codec and the trace loader.
//!
//! Two severities exist on the consumer side. [`TraceError`] is fatal: the
//! load aborts and the process exits non-zero. [`ContentError`] is
//! recoverable: the offending record is logged and discarded, and parsing
//! resumes at the next record boundary.

use thiserror::Error;

/// Fatal loader errors: bad file, bad header, or an I/O failure.
#[derive(Debug, Error)]
pub enum TraceError {
    /// Underlying read/open/close failure on the trace file.
    #[error("I/O error reading trace")]
    Io(#[from] std::io::Error),

    /// The first record was not a header record.
    #[error("trace does not start with a header record")]
    MissingHeader,

    /// The header magic did not match `"DATAGRIND1"`.
    #[error("header magic does not match")]
    BadMagic,

    /// The header record was present but malformed.
    #[error("malformed header: {0}")]
    Header(ContentError),

    /// The trace was produced for a different pointer width.
    #[error("pointer size mismatch (expected {expected}, got {got})")]
    WordSizeMismatch {
        /// Width this build decodes.
        expected: u8,
        /// Width declared in the trace header.
        got: u8,
    },

    /// The trace was produced on a machine of the other endianness.
    #[error("cross-endian traces are not supported (endian byte {0})")]
    EndianMismatch(u8),
}

/// Recoverable per-record errors: the record is skipped and parsing
/// continues.
#[derive(Debug, Error)]
pub enum ContentError {
    /// A field extractor ran past the record's declared length.
    #[error("record too short: wanted {wanted} more bytes, {remaining} left")]
    TooShort {
        /// Bytes the extractor needed.
        wanted: usize,
        /// Bytes left in the payload.
        remaining: usize,
    },

    /// The payload ended before a NUL string terminator.
    #[error("string not terminated within record")]
    UnterminatedString,

    /// The handler consumed less than the declared payload.
    #[error("record larger than its contents (consumed {consumed} of {declared})")]
    TrailingBytes {
        /// Bytes actually consumed.
        consumed: u64,
        /// Length declared by the record frame.
        declared: u64,
    },

    /// Record type byte outside the known set.
    #[error("unknown record type {0:#x}")]
    UnknownKind(u8),

    /// A second header record appeared mid-stream.
    #[error("header record after first record")]
    DuplicateHeader,

    /// A block definition declared zero instructions.
    #[error("block definition with no instructions")]
    EmptyDefinition,

    /// An access slot carried an unknown direction byte.
    #[error("unknown access direction {0:#x}")]
    BadDirection(u8),

    /// An access referenced an instruction index outside its definition.
    #[error("access references instruction {index} of {count}")]
    AccessIndexOutOfRange {
        /// Offending in-block instruction index.
        index: u8,
        /// Instructions in the definition.
        count: u8,
    },

    /// A context record carried an empty call stack.
    #[error("context with an empty call stack")]
    EmptyStack,

    /// A context referenced a definition that has not been defined.
    #[error("context references unknown definition {0}")]
    UnknownDefinition(u64),

    /// A run referenced a context that has not been defined.
    #[error("run references unknown context {0}")]
    UnknownContext(u64),

    /// A run carried more addresses than its definition has access slots.
    #[error("run carries {got} addresses but definition has {slots} access slots")]
    TooManyAddresses {
        /// Addresses in the run payload.
        got: usize,
        /// Access slots in the definition.
        slots: usize,
    },

    /// A run's address payload was not a whole number of words.
    #[error("run address payload of {0} bytes is not word-aligned")]
    RaggedAddresses(u64),
}
