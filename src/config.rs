use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{WalError, WalResult};

pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// How hard a partition pushes each committed write towards the disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncPolicy {
    /// `sync_data` after every committed write.
    #[serde(alias = "SyncOnTxEnd")]
    FlushOnCommit,
    /// Flush the buffer to the OS only; durability is left to the page cache.
    #[default]
    WaitForBatchOrTimeout,
}

impl SyncPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncPolicy::FlushOnCommit => "FlushOnCommit",
            SyncPolicy::WaitForBatchOrTimeout => "WaitForBatchOrTimeout",
        }
    }
}

impl std::fmt::Display for SyncPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncPolicy {
    type Err = WalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FlushOnCommit" | "SyncOnTxEnd" => Ok(SyncPolicy::FlushOnCommit),
            "WaitForBatchOrTimeout" => Ok(SyncPolicy::WaitForBatchOrTimeout),
            other => Err(WalError::InvalidConfig(format!(
                "unknown sync policy '{other}'"
            ))),
        }
    }
}

fn default_max_segment_size() -> u64 {
    DEFAULT_MAX_SEGMENT_SIZE
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_resume_sequence() -> bool {
    true
}

/// Everything a [`TopicWriter`](crate::topic::TopicWriter) needs to open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalConfig {
    pub base_dir: PathBuf,
    pub topic_name: String,
    pub partition_count: u32,
    #[serde(default = "default_max_segment_size")]
    pub max_segment_size: u64,
    #[serde(default)]
    pub sync_policy: SyncPolicy,
    /// Bound of each partition's request queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Seed the sequence counter from the highest sequence already on disk.
    #[serde(default = "default_resume_sequence")]
    pub resume_sequence: bool,
}

impl WalConfig {
    pub fn new(base_dir: impl Into<PathBuf>, topic_name: impl Into<String>, partition_count: u32) -> Self {
        Self {
            base_dir: base_dir.into(),
            topic_name: topic_name.into(),
            partition_count,
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            sync_policy: SyncPolicy::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            resume_sequence: true,
        }
    }

    pub fn with_max_segment_size(mut self, max_segment_size: u64) -> Self {
        self.max_segment_size = max_segment_size;
        self
    }

    pub fn with_sync_policy(mut self, sync_policy: SyncPolicy) -> Self {
        self.sync_policy = sync_policy;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_resume_sequence(mut self, resume_sequence: bool) -> Self {
        self.resume_sequence = resume_sequence;
        self
    }

    pub fn validate(&self) -> WalResult<()> {
        let name = &self.topic_name;
        if name.is_empty() {
            return Err(WalError::InvalidConfig("topic name is empty".to_string()));
        }
        if name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(WalError::InvalidConfig(format!(
                "topic name '{name}' is not a valid directory name"
            )));
        }
        if self.partition_count == 0 {
            return Err(WalError::InvalidConfig(
                "partition count must be at least 1".to_string(),
            ));
        }
        if self.max_segment_size == 0 {
            return Err(WalError::InvalidConfig(
                "max segment size must be at least 1 byte".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(WalError::InvalidConfig(
                "queue capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// One entry of the topics file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicConfig {
    pub name: String,
    pub partition_count: u32,
    #[serde(default, rename = "walSyncType")]
    pub sync_policy: SyncPolicy,
}

impl TopicConfig {
    pub fn into_wal_config(self, base_dir: &Path, max_segment_size: u64) -> WalConfig {
        WalConfig::new(base_dir, self.name, self.partition_count)
            .with_max_segment_size(max_segment_size)
            .with_sync_policy(self.sync_policy)
    }
}

/// The topics file: a JSON array of [`TopicConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicsConfig(pub Vec<TopicConfig>);

impl TopicsConfig {
    pub fn read_json<R: Read>(reader: R) -> WalResult<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn write_json<W: Write>(&self, writer: W) -> WalResult<()> {
        Ok(serde_json::to_writer_pretty(writer, self)?)
    }

    pub fn topics(&self) -> &[TopicConfig] {
        &self.0
    }
}
