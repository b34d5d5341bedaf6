//! The GLF (generic log format) binary session-file layout.
//!
//! A session file is `GLF\0` + a version byte + 3 reserved bytes, followed
//! by a sequence of self-delimiting frames:
//!
//! ```text
//! [u32 length][u8 type][length bytes of payload][u32 length]
//! ```
//!
//! The trailing length duplicates the leading one so a reader (or a repair
//! tool) can walk the file from either end; all integers are little-endian.
//! The writer only ever appends — existing bytes are never rewritten, which
//! is what makes a truncated tail (process killed mid-write) recoverable:
//! a reader just stops at the last complete frame.

mod frame;
mod session_file;
mod types;
mod wire;

pub use frame::{FRAME_TRAILER_LEN, FrameType, read_frame, write_frame};
pub use session_file::{GLF_MAGIC, GLF_VERSION, SessionFileReader, SessionFileWriter};
pub use types::{
    EventSchemaField, ExceptionInfo, LogRecord, MetricDefinitionWire, MetricSampleKind,
    MetricSampleRecord, Record, Scalar, SessionControl, SessionStatus, SessionSummary, Severity,
    SourceLocation, SummarizationRole, ThreadInfo, from_ticks, to_ticks,
};

/// Errors produced while reading or writing GLF frames.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad magic bytes: expected GLF\\0, found {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u8),
    #[error(
        "frame at offset {offset} has mismatched leading/trailing length ({leading} != {trailing})"
    )]
    FrameSymmetry {
        offset: u64,
        leading: u32,
        trailing: u32,
    },
    #[error("unknown frame type {0:#04x}")]
    UnknownFrameType(u8),
    #[error("record rejected: timestamp predates session start")]
    TimestampBeforeSessionStart,
    #[error("malformed payload for frame type {0:?}: {1}")]
    MalformedPayload(FrameType, String),
}

pub type Result<T> = std::result::Result<T, FramingError>;
