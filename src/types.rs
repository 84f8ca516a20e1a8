use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::Record;
use crate::topic::WriteHandle;

pub type Sequence = u32;

pub type WalResult<T> = Result<T, WalError>;

#[derive(Error, Debug)]
pub enum WalError {
    #[error("Truncated input: {0}")]
    TruncatedInput(&'static str),
    #[error("Checksum mismatch: stored {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("Frame length {length} exceeds limit {limit}")]
    RecordTooLarge { length: u64, limit: u64 },
    /// The active segment is past its size bound. The partition actor
    /// answers this with a rollover; callers only see it when a fresh
    /// segment refuses the same write.
    #[error("Segment limit reached: offset {offset} > max segment size {limit}")]
    SegmentLimitReached { offset: u64, limit: u64 },
    #[error("WAL I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WAL writer is closed")]
    WriterClosed,
    #[error("Failed to encode WAL record: {0}")]
    Encoding(String),
    #[error("Invalid WAL configuration: {0}")]
    InvalidConfig(String),
    #[error("Failed to parse WAL configuration: {0}")]
    Config(#[from] serde_json::Error),
    #[error("Sequence number overflow")]
    SequenceOverflow,
    /// The partition actor shut down before answering this request.
    #[error("Write abandoned during shutdown")]
    Abandoned,
}

impl WalError {
    pub fn is_segment_limit(&self) -> bool {
        matches!(self, WalError::SegmentLimitReached { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WalPartitionId(pub u32);

impl WalPartitionId {
    pub fn value(self) -> u32 {
        self.0
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for WalPartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for WalPartitionId {
    fn from(value: u32) -> Self {
        WalPartitionId(value)
    }
}

/// Where a frame ends inside a partition: the segment it lives in plus the
/// byte offset just past it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalPosition {
    pub segment: u64,
    pub local_offset: u64,
}

impl WalPosition {
    pub fn new(segment: u64, local_offset: u64) -> Self {
        Self {
            segment,
            local_offset,
        }
    }
}

/// The surface a higher-level service writes through.
///
/// `write` hands back a [`WriteHandle`] as soon as the record is queued;
/// awaiting the handle yields the durable outcome.
#[async_trait::async_trait]
pub trait RecordWriter: Send + Sync {
    async fn write(&self, record: Record) -> WalResult<WriteHandle>;

    async fn close(&self) -> WalResult<()>;
}
