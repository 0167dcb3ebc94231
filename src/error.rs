//! Error types shared across the crate.
//!
//! Each subsystem gets its own `thiserror` enum; [`ZsError`] unions them at
//! the public API boundary and exposes [`ZsError::kind`] so callers can map
//! onto the four error kinds a ZS implementation promises: corrupt data,
//! transport failure, misuse, and plain I/O.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Coarse error classification, independent of the specific variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Corrupt,
    Transport,
    Usage,
    Io,
}

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("bad magic: not a ZS file")]
    BadMagic,
    #[error("incomplete ZS file (writer never finished)")]
    IncompleteMagic,
    #[error("header checksum mismatch")]
    ChecksumMismatch,
    #[error("unknown codec {0:?}")]
    UnknownCodec(String),
    #[error("metadata is not a JSON object")]
    MetadataNotObject,
    #[error("total_file_length in header ({header}) does not match actual length ({actual})")]
    LengthMismatch { header: u64, actual: u64 },
    #[error("header data length changed between placeholder and final write")]
    LengthChanged,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("unexpected EOF reading block")]
    UnexpectedEof,
    #[error("checksum mismatch at offset {0}")]
    ChecksumMismatch(u64),
    #[error("record extends past end of block")]
    RecordTruncated,
    #[error("uleb128 extends past end of block")]
    VarintTruncated,
    #[error("records are not in non-decreasing order")]
    UnsortedRecords,
    #[error("index offsets do not strictly increase")]
    UnsortedOffsets,
    #[error("invalid block level {0}")]
    InvalidLevel(u16),
    #[error("expecting index block but found data block")]
    ExpectedIndexBlock,
    #[error("expecting data block but found index block")]
    ExpectedDataBlock,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown codec {0:?}")]
    Unknown(String),
    #[error("trailing garbage after compressed stream")]
    TrailingGarbage,
    #[error("truncated compressed stream")]
    Truncated,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(String),
    #[error("HTTP server did not respect Range: request")]
    RangeNotRespected,
    #[error("server response missing Content-Length")]
    MissingLength,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ZsError {
    #[error("corrupt: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("usage error: {0}")]
    Usage(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    /// An error raised on a background worker thread and forwarded to the
    /// thread driving iteration. Boxed in an `Arc` because the originating
    /// error is not itself `Clone` and may need to be observed by more than
    /// one waiting consumer.
    #[error("worker error: {0}")]
    Worker(Arc<ZsError>),
}

impl ZsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ZsError::Corrupt(_) => ErrorKind::Corrupt,
            ZsError::Transport(_) => ErrorKind::Transport,
            ZsError::Usage(_) => ErrorKind::Usage,
            ZsError::Io(_) => ErrorKind::Io,
            ZsError::Worker(inner) => inner.kind(),
        }
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        ZsError::Corrupt(msg.into())
    }

    pub fn usage(msg: impl Into<String>) -> Self {
        ZsError::Usage(msg.into())
    }
}

impl From<HeaderError> for ZsError {
    fn from(e: HeaderError) -> Self {
        match e {
            HeaderError::Io(io) => ZsError::Io(io),
            HeaderError::Json(_) => ZsError::Corrupt(e.to_string()),
            other => ZsError::Corrupt(other.to_string()),
        }
    }
}

impl From<BlockError> for ZsError {
    fn from(e: BlockError) -> Self {
        ZsError::Corrupt(e.to_string())
    }
}

impl From<CodecError> for ZsError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Io(io) => ZsError::Io(io),
            other => ZsError::Corrupt(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ZsError>;
