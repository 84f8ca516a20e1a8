use std::path::Path;

use log::warn;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::types::{WalError, WalResult};

/// Outcome of scanning a whole segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    /// Offset just past the last complete frame; the safe append point.
    pub valid_offset: u64,
    /// Number of complete frames in front of `valid_offset`.
    pub frames: u64,
    /// Length of the file on disk when it was scanned.
    pub file_len: u64,
}

impl ScanReport {
    /// Bytes after the append point that belong to no complete frame.
    pub fn discarded(&self) -> u64 {
        self.file_len.saturating_sub(self.valid_offset)
    }
}

/// Walk `[u32 len][payload]` frames from the current position of `reader`
/// and return the offset right after the last frame that is fully present.
///
/// A partial length prefix or a partial payload at the tail ends the walk
/// without error. A declared length above `size_limit` fails with
/// [`WalError::RecordTooLarge`]. Checksums are not looked at here.
pub async fn scan_valid_offset<R>(reader: &mut R, size_limit: u64) -> WalResult<u64>
where
    R: AsyncRead + Unpin,
{
    scan_frames(reader, size_limit).await.map(|(offset, _)| offset)
}

async fn scan_frames<R>(reader: &mut R, size_limit: u64) -> WalResult<(u64, u64)>
where
    R: AsyncRead + Unpin,
{
    let mut valid_offset: u64 = 0;
    let mut frames: u64 = 0;

    loop {
        let mut len_buf = [0u8; 4];
        let mut bytes_read = 0;
        while bytes_read < len_buf.len() {
            let n = reader.read(&mut len_buf[bytes_read..]).await?;
            if n == 0 {
                break;
            }
            bytes_read += n;
        }

        if bytes_read == 0 {
            return Ok((valid_offset, frames));
        }
        if bytes_read < len_buf.len() {
            warn!(
                "Partial frame length ({bytes_read} bytes) after offset {valid_offset}, resuming there"
            );
            return Ok((valid_offset, frames));
        }

        let len = u32::from_le_bytes(len_buf) as u64;
        if len > size_limit {
            return Err(WalError::RecordTooLarge {
                length: len,
                limit: size_limit,
            });
        }

        // Skip the payload without holding it in memory.
        let skipped = tokio::io::copy(&mut (&mut *reader).take(len), &mut tokio::io::sink()).await?;
        if skipped < len {
            warn!(
                "Truncated frame after offset {valid_offset}: declared {len} bytes, found {skipped}, resuming there"
            );
            return Ok((valid_offset, frames));
        }

        valid_offset += 4 + len;
        frames += 1;
    }
}

/// Scan a segment file from offset 0.
pub async fn scan_segment(path: &Path, size_limit: u64) -> WalResult<ScanReport> {
    let file = tokio::fs::File::open(path).await?;
    let file_len = file.metadata().await?.len();
    let mut reader = tokio::io::BufReader::new(file);
    let (valid_offset, frames) = scan_frames(&mut reader, size_limit).await?;
    Ok(ScanReport {
        valid_offset,
        frames,
        file_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u32).to_le_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn test_empty_input() {
        let mut input: &[u8] = &[];
        assert_eq!(scan_valid_offset(&mut input, 1024).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_single_valid_frame() {
        let bytes = frame(&[0u8; 40]);
        let mut input = bytes.as_slice();
        assert_eq!(scan_valid_offset(&mut input, 10_000).await.unwrap(), 44);
    }

    #[tokio::test]
    async fn test_truncated_payload_is_discarded() {
        let mut bytes = frame(&[0u8; 40]);
        // A second frame that claims 261 bytes but only carries 40.
        bytes.extend_from_slice(&[5, 1, 0, 0]);
        bytes.extend_from_slice(&[0u8; 40]);
        let mut input = bytes.as_slice();
        assert_eq!(scan_valid_offset(&mut input, 10_000).await.unwrap(), 44);
    }

    #[tokio::test]
    async fn test_partial_length_prefix_is_discarded() {
        for tail in 1..4 {
            let mut bytes = frame(b"abc");
            bytes.extend_from_slice(&frame(b"defgh"));
            bytes.extend(std::iter::repeat_n(0xAB, tail));
            let mut input = bytes.as_slice();
            assert_eq!(scan_valid_offset(&mut input, 1024).await.unwrap(), 7 + 9);
        }
    }

    #[tokio::test]
    async fn test_zero_length_frames_count() {
        let mut bytes = frame(&[]);
        bytes.extend_from_slice(&frame(&[]));
        let mut input = bytes.as_slice();
        assert_eq!(scan_valid_offset(&mut input, 1024).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_oversized_length_is_rejected() {
        let bytes = 5000u32.to_le_bytes();
        let mut input = bytes.as_slice();
        let err = scan_valid_offset(&mut input, 4096).await.unwrap_err();
        assert!(matches!(
            err,
            WalError::RecordTooLarge {
                length: 5000,
                limit: 4096
            }
        ));
    }

    #[tokio::test]
    async fn test_scan_segment_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1.wal");
        let mut bytes = frame(b"one");
        bytes.extend_from_slice(&frame(b"two"));
        bytes.extend_from_slice(&[9, 9]);
        std::fs::write(&path, &bytes).unwrap();

        let report = scan_segment(&path, 1024).await.unwrap();
        assert_eq!(
            report,
            ScanReport {
                valid_offset: 14,
                frames: 2,
                file_len: 16
            }
        );
        assert_eq!(report.discarded(), 2);
    }
}
