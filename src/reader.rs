use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::codec::ExtendedRecord;
use crate::segment::{SegmentInfo, list_segments};
use crate::types::{WalError, WalPartitionId, WalPosition, WalResult};

/// Reads frames from one segment file, front to back.
///
/// Every payload is checked against its CRC. A frame that fails to decode is
/// reported and skipped; a partial frame at the tail ends the stream.
pub struct SegmentReader {
    path: PathBuf,
    reader: BufReader<File>,
    size_limit: u64,
    offset: u64,
    done: bool,
}

impl SegmentReader {
    pub fn open(path: impl AsRef<Path>, size_limit: u64) -> WalResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(Self {
            path,
            reader: BufReader::new(file),
            size_limit,
            offset: 0,
            done: false,
        })
    }

    /// Offset just past the last frame handed out.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn read_frame(&mut self) -> Option<WalResult<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        let mut bytes_read = 0;
        while bytes_read < len_buf.len() {
            match self.reader.read(&mut len_buf[bytes_read..]) {
                Ok(0) if bytes_read == 0 => return None,
                Ok(0) => {
                    debug!(
                        "Partial length at offset {} in {:?}, end of segment",
                        self.offset, self.path
                    );
                    return None;
                }
                Ok(n) => bytes_read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Some(Err(e.into())),
            }
        }

        let len = u32::from_le_bytes(len_buf) as u64;
        if len > self.size_limit {
            return Some(Err(WalError::RecordTooLarge {
                length: len,
                limit: self.size_limit,
            }));
        }

        let mut payload = vec![0u8; len as usize];
        if let Err(e) = self.reader.read_exact(&mut payload) {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                debug!(
                    "Partial frame at offset {} in {:?}, end of segment",
                    self.offset, self.path
                );
                return None;
            }
            return Some(Err(e.into()));
        }

        self.offset += 4 + len;
        Some(Ok(payload))
    }
}

impl Iterator for SegmentReader {
    type Item = WalResult<(ExtendedRecord, u64)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let payload = match self.read_frame() {
            Some(Ok(payload)) => payload,
            Some(Err(e)) => {
                // Framing is lost; nothing after this point can be trusted.
                self.done = true;
                return Some(Err(e));
            }
            None => {
                self.done = true;
                return None;
            }
        };

        match ExtendedRecord::decode(&payload) {
            Ok((record, _)) => Some(Ok((record, self.offset))),
            Err(e) => {
                warn!(
                    "Corrupt WAL record ending at offset {} in {:?}: {e}",
                    self.offset, self.path
                );
                Some(Err(e))
            }
        }
    }
}

/// Replays every segment of one partition in creation order.
pub struct PartitionReader {
    partition: WalPartitionId,
    segments: std::vec::IntoIter<SegmentInfo>,
    current: Option<(u64, SegmentReader)>,
    size_limit: u64,
}

impl PartitionReader {
    pub fn open(dir: impl AsRef<Path>, partition: WalPartitionId, size_limit: u64) -> WalResult<Self> {
        let segments = list_segments(dir.as_ref())?;
        Ok(Self {
            partition,
            segments: segments.into_iter(),
            current: None,
            size_limit,
        })
    }
}

impl Iterator for PartitionReader {
    type Item = WalResult<(ExtendedRecord, WalPosition)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((segment, reader)) = self.current.as_mut() {
                match reader.next() {
                    Some(Ok((record, offset))) => {
                        let position = WalPosition::new(*segment, offset);
                        return Some(Ok((record.with_partition(self.partition), position)));
                    }
                    Some(Err(e)) => return Some(Err(e)),
                    None => self.current = None,
                }
            }

            let next = self.segments.next()?;
            match SegmentReader::open(&next.path, self.size_limit) {
                Ok(reader) => self.current = Some((next.created_nanos, reader)),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Highest sequence number persisted in a partition, looking at the newest
/// segment that holds at least one readable record.
pub fn last_persisted_sequence(dir: &Path, size_limit: u64) -> WalResult<Option<u32>> {
    let segments = list_segments(dir)?;
    for segment in segments.iter().rev() {
        let last = SegmentReader::open(&segment.path, size_limit)?
            .filter_map(Result::ok)
            .map(|(record, _)| record.id.sequence)
            .max();
        if last.is_some() {
            return Ok(last);
        }
    }
    Ok(None)
}
