//! Binary layout of WAL records.
//!
//! ```text
//! Record:          [u32 key_len][key][u32 value_len][value]
//! ExtendedRecord:  [u64 timestamp][u32 sequence][Record][u32 crc]
//! ```
//!
//! All integers are little-endian. The CRC is CRC-32 with the Koopman
//! polynomial and covers every serialized byte in front of it.

use crc::{Algorithm, Crc};

use crate::types::{Sequence, WalError, WalPartitionId, WalResult};

/// CRC-32 over the Koopman polynomial, reflected, with the usual
/// `0xFFFFFFFF` init and xor-out.
pub const CRC_32_KOOPMAN: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x741b_8cd7,
    init: 0xffff_ffff,
    refin: true,
    refout: true,
    xorout: 0xffff_ffff,
    check: 0x2d3d_d0ae,
    residue: 0x0843_323b,
};

static KOOPMAN: Crc<u32> = Crc::<u32>::new(&CRC_32_KOOPMAN);

const LEN_SIZE: usize = 4;
const TIMESTAMP_SIZE: usize = 8;
const SEQUENCE_SIZE: usize = 4;
const CRC_SIZE: usize = 4;

pub fn crc32_koopman(bytes: &[u8]) -> u32 {
    KOOPMAN.checksum(bytes)
}

/// Pick the partition a key routes to: `crc32(key) mod partition_count`.
pub fn partition_for_key(key: &str, partition_count: u32) -> WalPartitionId {
    debug_assert!(partition_count > 0);
    WalPartitionId(crc32_koopman(key.as_bytes()) % partition_count)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: String,
    pub value: Vec<u8>,
}

impl Record {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        LEN_SIZE + self.key.len() + LEN_SIZE + self.value.len()
    }

    pub fn encode(&self) -> WalResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) -> WalResult<()> {
        put_len_prefixed(buf, self.key.as_bytes(), "key")?;
        put_len_prefixed(buf, &self.value, "value")
    }

    /// Decode a record from the front of `bytes`, returning it together
    /// with the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> WalResult<(Record, usize)> {
        let (raw, consumed) = RawRecord::parse(bytes)?;
        Ok((raw.into_record()?, consumed))
    }
}

/// Key and value slices of an encoded record, before the key is checked
/// for UTF-8.
struct RawRecord<'a> {
    key: &'a [u8],
    value: &'a [u8],
}

impl<'a> RawRecord<'a> {
    fn parse(bytes: &'a [u8]) -> WalResult<(Self, usize)> {
        let mut cursor = Cursor::new(bytes);

        let key_len = cursor.u32("key length")? as usize;
        let key = cursor.take(key_len, "key")?;

        let value_len = cursor.u32("value length")? as usize;
        let value = cursor.take(value_len, "value")?;

        Ok((RawRecord { key, value }, cursor.pos))
    }

    fn into_record(self) -> WalResult<Record> {
        let key = String::from_utf8(self.key.to_vec())
            .map_err(|e| WalError::Encoding(format!("record key is not valid UTF-8: {e}")))?;
        Ok(Record {
            key,
            value: self.value.to_vec(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordId {
    /// Wall-clock nanoseconds since the Unix epoch.
    pub timestamp: i64,
    pub sequence: Sequence,
    /// Routing only; never written to disk.
    pub partition: WalPartitionId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRecord {
    pub record: Record,
    pub id: RecordId,
    pub crc: u32,
}

impl ExtendedRecord {
    /// Wrap `record` with its identity and compute the checksum.
    pub fn new(
        record: Record,
        sequence: Sequence,
        timestamp: i64,
        partition: WalPartitionId,
    ) -> WalResult<Self> {
        let mut ext = ExtendedRecord {
            record,
            id: RecordId {
                timestamp,
                sequence,
                partition,
            },
            crc: 0,
        };
        let mut body = Vec::with_capacity(ext.encoded_len());
        ext.encode_body(&mut body)?;
        ext.crc = crc32_koopman(&body);
        Ok(ext)
    }

    pub fn encoded_len(&self) -> usize {
        TIMESTAMP_SIZE + SEQUENCE_SIZE + self.record.encoded_len() + CRC_SIZE
    }

    pub fn encode(&self) -> WalResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_body(&mut buf)?;
        buf.extend_from_slice(&self.crc.to_le_bytes());
        Ok(buf)
    }

    fn encode_body(&self, buf: &mut Vec<u8>) -> WalResult<()> {
        buf.extend_from_slice(&(self.id.timestamp as u64).to_le_bytes());
        buf.extend_from_slice(&self.id.sequence.to_le_bytes());
        self.record.encode_into(buf)
    }

    /// Decode and verify. The checksum is checked before the key is
    /// interpreted, so any corrupted body byte reports `ChecksumMismatch`.
    /// The partition is not part of the payload, so the decoded id carries
    /// partition 0; readers that know better overwrite it.
    pub fn decode(bytes: &[u8]) -> WalResult<(ExtendedRecord, usize)> {
        let mut cursor = Cursor::new(bytes);

        let timestamp = cursor.u64("timestamp")? as i64;
        let sequence = cursor.u32("sequence")?;

        let (raw, consumed) = RawRecord::parse(cursor.rest())?;
        cursor.pos += consumed;

        let body_end = cursor.pos;
        let stored = cursor.u32("crc")?;
        let computed = crc32_koopman(&bytes[..body_end]);
        if stored != computed {
            return Err(WalError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }

        let ext = ExtendedRecord {
            record: raw.into_record()?,
            id: RecordId {
                timestamp,
                sequence,
                partition: WalPartitionId(0),
            },
            crc: stored,
        };
        Ok((ext, cursor.pos))
    }

    pub fn with_partition(mut self, partition: WalPartitionId) -> Self {
        self.id.partition = partition;
        self
    }
}

fn put_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8], field: &str) -> WalResult<()> {
    let len = u32::try_from(bytes.len()).map_err(|_| {
        WalError::Encoding(format!(
            "{field} length {} does not fit a u32 prefix",
            bytes.len()
        ))
    })?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Bounds-checked reads over a byte slice. Every read checks the remaining
/// length first so a corrupt length prefix never reads past the input.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn rest(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }

    fn take(&mut self, len: usize, field: &'static str) -> WalResult<&'a [u8]> {
        if self.rest().len() < len {
            return Err(WalError::TruncatedInput(field));
        }
        let out = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn u32(&mut self, field: &'static str) -> WalResult<u32> {
        let raw = self.take(4, field)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn u64(&mut self, field: &'static str) -> WalResult<u64> {
        let raw = self.take(8, field)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        Ok(u64::from_le_bytes(buf))
    }
}
