use std::path::{Path, PathBuf};

use log::{debug, error, warn};
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};

use crate::config::SyncPolicy;
use crate::recovery::scan_valid_offset;
use crate::types::{WalError, WalResult};

const LEN_PREFIX: u64 = 4;

/// Appends length-prefixed frames to a single segment file.
///
/// A writer is owned by exactly one partition actor, so every method takes
/// `&mut self` and no lock is involved.
#[derive(Debug)]
pub struct PartitionWriter {
    path: PathBuf,
    buffer: Option<BufWriter<File>>,
    /// Offset of the next frame. Starts at the recovered append point.
    current_offset: u64,
    /// Bytes past the recovered append point when the file was opened.
    torn_tail: u64,
    max_segment_size: u64,
    sync_policy: SyncPolicy,
}

impl PartitionWriter {
    /// Open (or create) `path`, find the end of the last complete frame and
    /// position the writer there. Bytes past that point are left alone and
    /// get overwritten by the next write.
    pub async fn open(
        path: impl AsRef<Path>,
        max_segment_size: u64,
        sync_policy: SyncPolicy,
    ) -> WalResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;
        Self::from_file(path, file, max_segment_size, sync_policy).await
    }

    /// Recover and position an already opened segment file.
    pub(crate) async fn from_file(
        path: PathBuf,
        mut file: File,
        max_segment_size: u64,
        sync_policy: SyncPolicy,
    ) -> WalResult<Self> {
        let file_len = file.metadata().await?.len();
        let current_offset = {
            let mut reader = tokio::io::BufReader::new(&mut file);
            scan_valid_offset(&mut reader, max_segment_size).await?
        };
        let torn_tail = file_len.saturating_sub(current_offset);
        if torn_tail > 0 {
            warn!(
                "Recovered WAL segment {path:?}: valid up to offset {current_offset}, {torn_tail} trailing bytes belong to no complete frame"
            );
        }

        file.seek(std::io::SeekFrom::Start(current_offset)).await?;
        debug!("Opened WAL segment {path:?} at offset {current_offset}");

        Ok(Self {
            path,
            buffer: Some(BufWriter::new(file)),
            current_offset,
            torn_tail,
            max_segment_size,
            sync_policy,
        })
    }

    /// Append one frame. Returns the number of bytes written, prefix included.
    ///
    /// Fails with [`WalError::SegmentLimitReached`] once the segment has gone
    /// past its size bound; nothing is written in that case. After an I/O
    /// error the frame boundary is unknown and the writer closes itself.
    pub async fn write(&mut self, payload: &[u8]) -> WalResult<u64> {
        let buffer = self.buffer.as_mut().ok_or(WalError::WriterClosed)?;

        if self.current_offset > self.max_segment_size {
            return Err(WalError::SegmentLimitReached {
                offset: self.current_offset,
                limit: self.max_segment_size,
            });
        }

        let len = payload.len() as u64;
        // Recovery refuses frames above the segment size, so never write one.
        if len > self.max_segment_size || len > u32::MAX as u64 {
            return Err(WalError::RecordTooLarge {
                length: len,
                limit: self.max_segment_size.min(u32::MAX as u64),
            });
        }

        let result = async {
            buffer.write_all(&(len as u32).to_le_bytes()).await?;
            buffer.write_all(payload).await
        }
        .await;
        if let Err(e) = result {
            return Err(self.fail("write to", e));
        }

        let written = LEN_PREFIX + len;
        self.current_offset += written;
        Ok(written)
    }

    /// Push buffered frames to the OS, and to stable storage when the sync
    /// policy is [`SyncPolicy::FlushOnCommit`]. Closes the writer on failure.
    pub async fn flush(&mut self) -> WalResult<()> {
        let sync = self.sync_policy == SyncPolicy::FlushOnCommit;
        let buffer = self.buffer.as_mut().ok_or(WalError::WriterClosed)?;

        let result = async {
            buffer.flush().await?;
            if sync {
                buffer.get_ref().sync_data().await?;
            }
            Ok::<(), std::io::Error>(())
        }
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail("flush", e)),
        }
    }

    /// Drop the file without flushing. Whatever sits in the buffer may be a
    /// partial frame, so nothing more may be appended behind it.
    fn fail(&mut self, action: &str, e: std::io::Error) -> WalError {
        error!(
            "Failed to {action} WAL segment {:?} at offset {}: {e}",
            self.path, self.current_offset
        );
        self.buffer = None;
        WalError::Io(e)
    }

    /// Flush and release the file. Calling it again is a no-op.
    pub async fn close(&mut self) -> WalResult<()> {
        let Some(mut buffer) = self.buffer.take() else {
            return Ok(());
        };

        let result = async {
            buffer.flush().await?;
            if self.sync_policy == SyncPolicy::FlushOnCommit {
                buffer.get_ref().sync_data().await?;
            }
            buffer.shutdown().await
        }
        .await;

        if let Err(e) = &result {
            error!("Failed to close WAL segment {:?}: {e}", self.path);
        }
        result.map_err(WalError::from)
    }

    pub fn current_offset(&self) -> u64 {
        self.current_offset
    }

    /// Trailing bytes found past the last complete frame at open time.
    /// Appending here leaves any of them the next frame does not cover.
    pub fn torn_tail(&self) -> u64 {
        self.torn_tail
    }

    pub fn max_segment_size(&self) -> u64 {
        self.max_segment_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.buffer.is_none()
    }
}
