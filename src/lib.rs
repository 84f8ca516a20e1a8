//! A partitioned, segmented Write-Ahead Log (WAL).
//!
//! A [`TopicWriter`] owns one topic split into `N` partitions. Every record
//! is stamped with a topic-wide sequence number and a wall-clock timestamp,
//! then routed to a partition by the CRC-32 (Koopman) of its key. Each
//! partition is served by its own writer task that appends frames to the
//! newest segment file under `<base_dir>/<topic>/<partition>/`.
//!
//! # Features
//!
//! - **Partitioned** – one independent log stream and writer task per partition.
//! - **Segmented** – when a segment grows past `max_segment_size` bytes the
//!   partition rolls over to a new `<nanos>.wal` file.
//! - **Recoverable** – on open, the newest segment is scanned and a torn tail
//!   left by a crash is overwritten by the next append.
//! - **Checksummed** – every frame carries a CRC-32 over its serialized bytes.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use topicwal::{Record, SyncPolicy, TopicWriter, WalConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 1. Open (or reopen) the topic.
//!     let config = WalConfig::new("./wal_data", "orders", 4)
//!         .with_max_segment_size(1024 * 1024)
//!         .with_sync_policy(SyncPolicy::FlushOnCommit);
//!     let topic = TopicWriter::open(config).await?;
//!
//!     // 2. Queue a record. The handle carries the assigned sequence number.
//!     let handle = topic.write(Record::new("customer-42", b"created".to_vec())).await?;
//!     let partition = handle.partition();
//!
//!     // 3. Wait until the partition has written and flushed it.
//!     handle.await?;
//!
//!     // 4. Replay the partition from its oldest segment.
//!     for entry in topic.read_partition(partition)? {
//!         let (record, position) = entry?;
//!         println!("{} @ {position:?}: {}", record.id.sequence, record.record.key);
//!     }
//!
//!     // 5. Drain every partition and close its segment.
//!     topic.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Recovery
//!
//! Reopening a topic on the same directory resumes each partition at the end
//! of the last intact frame of its newest segment. Sequence numbering resumes
//! after the highest sequence found on disk unless
//! [`WalConfig::resume_sequence`] is turned off.


pub mod codec;
pub mod config;
mod partition;
pub mod reader;
pub mod recovery;
pub mod segment;
pub mod topic;
mod types;
pub mod writer;

pub use codec::{ExtendedRecord, Record, RecordId, crc32_koopman, partition_for_key};
pub use config::{SyncPolicy, TopicConfig, TopicsConfig, WalConfig};
pub use reader::{PartitionReader, SegmentReader};
pub use recovery::{ScanReport, scan_segment, scan_valid_offset};
pub use topic::{TopicWriter, WriteHandle};
pub use types::*;
pub use writer::PartitionWriter;
