use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::{WalPartitionId, WalResult};

pub const SEGMENT_EXTENSION: &str = "wal";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Creation time in nanoseconds, taken from the file name.
    pub created_nanos: u64,
    pub path: PathBuf,
    pub size: u64,
}

/// Generate a segment filename, e.g. `1700000000000000000.wal`
pub fn segment_filename(created_nanos: u64) -> String {
    format!("{created_nanos}.{SEGMENT_EXTENSION}")
}

pub fn parse_segment_filename(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(SEGMENT_EXTENSION)?.strip_suffix('.')?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// `<base_dir>/<topic>/`
pub fn topic_dir(base_dir: &Path, topic: &str) -> PathBuf {
    base_dir.join(topic)
}

/// `<base_dir>/<topic>/<partition>/`
pub fn partition_dir(base_dir: &Path, topic: &str, partition: WalPartitionId) -> PathBuf {
    topic_dir(base_dir, topic).join(partition.to_string())
}

pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Return every segment in `dir` ordered by creation time, oldest first.
///
/// Files that do not look like `<digits>.wal` are ignored. A missing
/// directory yields an empty list.
pub fn list_segments(dir: &Path) -> WalResult<Vec<SegmentInfo>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut segments = Vec::new();
    for entry in entries {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        let Some(created_nanos) = parse_segment_filename(&name) else {
            continue;
        };
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        segments.push(SegmentInfo {
            created_nanos,
            path: entry.path(),
            size: metadata.len(),
        });
    }

    segments.sort_by_key(|s| s.created_nanos);
    Ok(segments)
}

pub fn latest_segment(dir: &Path) -> WalResult<Option<SegmentInfo>> {
    Ok(list_segments(dir)?.pop())
}

/// Path for a brand-new segment in `dir`, named after the current time.
///
/// The name is bumped past the newest existing segment so that creation
/// order and name order always agree, even if the clock stalls or steps back.
pub fn new_segment_path(dir: &Path) -> WalResult<PathBuf> {
    let mut created = now_nanos().max(0) as u64;
    if let Some(latest) = latest_segment(dir)?
        && created <= latest.created_nanos
    {
        created = latest.created_nanos + 1;
    }
    Ok(dir.join(segment_filename(created)))
}
