//! One sequential writer task per partition.
//!
//! ```text
//! producers ─→ [bounded mpsc] ─→ PartitionActor ─→ PartitionWriter ─→ segment file
//!                                      │
//!                                      └─ oneshot reply per request
//! ```
//!
//! The actor owns its [`PartitionWriter`] outright, so frames from one
//! partition are appended strictly in dequeue order.

use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::SyncPolicy;
use crate::segment::{latest_segment, new_segment_path};
use crate::types::{WalError, WalPartitionId, WalResult};
use crate::writer::PartitionWriter;

pub(crate) type Responder = oneshot::Sender<WalResult<()>>;

pub(crate) struct WriteRequest {
    pub(crate) payload: Vec<u8>,
    pub(crate) respond_to: Responder,
}

/// The producer side of a running partition actor.
pub(crate) struct PartitionHandle {
    pub(crate) partition: WalPartitionId,
    pub(crate) dir: PathBuf,
    pub(crate) sender: mpsc::Sender<WriteRequest>,
}

pub(crate) struct PartitionActor {
    partition: WalPartitionId,
    dir: PathBuf,
    max_segment_size: u64,
    sync_policy: SyncPolicy,
    /// `None` after a rollover failed to open the next segment.
    writer: Option<PartitionWriter>,
}

impl PartitionActor {
    /// Create the partition directory and open its newest segment, recovering
    /// the append point. A fresh segment is started when none exists, when
    /// the newest one is already past the size bound, or when it ends in a
    /// torn frame. A torn segment is left as it is, so its stale tail can
    /// never end up between two valid frames.
    pub(crate) async fn open(
        dir: PathBuf,
        partition: WalPartitionId,
        max_segment_size: u64,
        sync_policy: SyncPolicy,
    ) -> WalResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;

        let path = match latest_segment(&dir)? {
            Some(segment) => segment.path,
            None => {
                let path = new_segment_path(&dir)?;
                info!("Creating WAL segment {path:?} for partition {partition}");
                path
            }
        };

        let mut writer = PartitionWriter::open(&path, max_segment_size, sync_policy).await?;
        if writer.current_offset() > max_segment_size {
            warn!(
                "WAL segment {path:?} is already past {max_segment_size} bytes, starting a new one"
            );
            writer.close().await?;
            writer = open_fresh_segment(&dir, max_segment_size, sync_policy).await?;
        } else if writer.torn_tail() > 0 {
            warn!(
                "WAL segment {path:?} ends in {} bytes of a torn frame, starting a new one",
                writer.torn_tail()
            );
            writer.close().await?;
            writer = open_fresh_segment(&dir, max_segment_size, sync_policy).await?;
        }

        Ok(Self {
            partition,
            dir,
            max_segment_size,
            sync_policy,
            writer: Some(writer),
        })
    }

    /// Start the actor on the runtime. It exits once `shutdown` flips to
    /// `true` or every sender is gone, and reports how closing went.
    pub(crate) fn spawn(
        self,
        queue_capacity: usize,
        shutdown: watch::Receiver<bool>,
    ) -> (PartitionHandle, JoinHandle<WalResult<()>>) {
        let (sender, receiver) = mpsc::channel(queue_capacity);
        let handle = PartitionHandle {
            partition: self.partition,
            dir: self.dir.clone(),
            sender,
        };
        let task = tokio::spawn(self.run(receiver, shutdown));
        (handle, task)
    }

    async fn run(
        mut self,
        mut receiver: mpsc::Receiver<WriteRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) -> WalResult<()> {
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    // A dropped sender counts as a shutdown request too.
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                request = receiver.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
            }
        }

        // Refuse new work, then finish whatever is already queued.
        receiver.close();
        let mut drained = 0usize;
        while let Some(request) = receiver.recv().await {
            self.handle(request).await;
            drained += 1;
        }
        if drained > 0 {
            debug!("Partition {} drained {drained} queued writes", self.partition);
        }

        self.close().await
    }

    async fn handle(&mut self, request: WriteRequest) {
        let result = self.append(&request.payload).await;
        if let Err(e) = &result {
            debug!("Write to partition {} failed: {e}", self.partition);
        }
        // The caller may have stopped waiting; that is fine.
        let _ = request.respond_to.send(result);
    }

    /// Write one payload, rolling over to a new segment at most once, then
    /// flush according to the sync policy. A writer that closed itself after
    /// an I/O error is replaced by a fresh segment.
    async fn append(&mut self, payload: &[u8]) -> WalResult<()> {
        let mut rolled = false;
        loop {
            if self.writer.as_ref().is_none_or(PartitionWriter::is_closed) {
                if let Some(broken) = self.writer.take() {
                    warn!(
                        "Partition {}: abandoning WAL segment {:?} after a failed write",
                        self.partition,
                        broken.path()
                    );
                }
                rolled = true;
                self.install_fresh_segment().await?;
            }
            let writer = self.writer.as_mut().ok_or(WalError::WriterClosed)?;

            match writer.write(payload).await {
                Ok(_) => return writer.flush().await,
                Err(e) if e.is_segment_limit() && !rolled => {
                    rolled = true;
                    self.rollover().await?;
                }
                Err(e) => {
                    if e.is_segment_limit() {
                        error!(
                            "Partition {}: fresh segment refused a {} byte record",
                            self.partition,
                            payload.len()
                        );
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn rollover(&mut self) -> WalResult<()> {
        if let Some(mut old) = self.writer.take() {
            info!(
                "WAL rollover: partition {} segment {:?} closed at {} bytes",
                self.partition,
                old.path(),
                old.current_offset()
            );
            if let Err(e) = old.close().await {
                warn!("Failed to close full WAL segment {:?}: {e}", old.path());
            }
        }
        self.install_fresh_segment().await
    }

    async fn install_fresh_segment(&mut self) -> WalResult<()> {
        let writer = open_fresh_segment(&self.dir, self.max_segment_size, self.sync_policy).await?;
        self.writer = Some(writer);
        Ok(())
    }

    async fn close(&mut self) -> WalResult<()> {
        match self.writer.take() {
            Some(mut writer) => {
                let result = writer.close().await;
                info!("Partition {} closed", self.partition);
                result
            }
            None => Ok(()),
        }
    }

    #[cfg(test)]
    pub(crate) fn current_segment(&self) -> Option<&Path> {
        self.writer.as_ref().map(PartitionWriter::path)
    }
}

async fn open_fresh_segment(
    dir: &Path,
    max_segment_size: u64,
    sync_policy: SyncPolicy,
) -> WalResult<PartitionWriter> {
    let path = new_segment_path(dir)?;
    info!("Creating WAL segment {path:?}");
    PartitionWriter::open(&path, max_segment_size, sync_policy).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ExtendedRecord, Record};
    use crate::reader::PartitionReader;
    use crate::segment::list_segments;

    fn payload(seq: u32, value_len: usize) -> Vec<u8> {
        ExtendedRecord::new(
            Record::new(format!("key-{seq}"), vec![b'x'; value_len]),
            seq,
            seq as i64,
            WalPartitionId(0),
        )
        .unwrap()
        .encode()
        .unwrap()
    }

    async fn send(handle: &PartitionHandle, payload: Vec<u8>) -> oneshot::Receiver<WalResult<()>> {
        let (tx, rx) = oneshot::channel();
        handle
            .sender
            .send(WriteRequest {
                payload,
                respond_to: tx,
            })
            .await
            .unwrap();
        rx
    }

    #[tokio::test]
    async fn test_open_creates_dir_and_segment() {
        let dir = tempfile::tempdir().unwrap();
        let part_dir = dir.path().join("topic").join("0");
        let actor = PartitionActor::open(
            part_dir.clone(),
            WalPartitionId(0),
            1024,
            SyncPolicy::WaitForBatchOrTimeout,
        )
        .await
        .unwrap();
        assert!(part_dir.is_dir());
        assert_eq!(list_segments(&part_dir).unwrap().len(), 1);
        assert!(actor.current_segment().unwrap().starts_with(&part_dir));
    }

    #[tokio::test]
    async fn test_reopen_uses_latest_segment() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("100.wal"), b"").unwrap();
        std::fs::write(dir.path().join("200.wal"), b"").unwrap();

        let actor = PartitionActor::open(
            dir.path().to_path_buf(),
            WalPartitionId(0),
            1024,
            SyncPolicy::WaitForBatchOrTimeout,
        )
        .await
        .unwrap();
        assert_eq!(
            actor.current_segment().unwrap(),
            dir.path().join("200.wal").as_path()
        );
    }

    #[tokio::test]
    async fn test_open_rolls_when_latest_segment_is_full() {
        let dir = tempfile::tempdir().unwrap();
        let mut frame = 8u32.to_le_bytes().to_vec();
        frame.extend_from_slice(&[0u8; 8]);
        std::fs::write(dir.path().join("100.wal"), &frame).unwrap();

        let actor = PartitionActor::open(
            dir.path().to_path_buf(),
            WalPartitionId(0),
            10,
            SyncPolicy::WaitForBatchOrTimeout,
        )
        .await
        .unwrap();
        assert_eq!(list_segments(dir.path()).unwrap().len(), 2);
        assert_ne!(
            actor.current_segment().unwrap(),
            dir.path().join("100.wal").as_path()
        );
    }

    #[tokio::test]
    async fn test_rollover_keeps_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let actor = PartitionActor::open(
            dir.path().to_path_buf(),
            WalPartitionId(0),
            256,
            SyncPolicy::FlushOnCommit,
        )
        .await
        .unwrap();
        let (_tx, shutdown) = watch::channel(false);
        let (handle, task) = actor.spawn(16, shutdown);

        for seq in 1..=20 {
            send(&handle, payload(seq, 64)).await.await.unwrap().unwrap();
        }
        drop(handle);
        task.await.unwrap().unwrap();

        let segments = list_segments(dir.path()).unwrap();
        assert!(segments.len() >= 2, "expected rollover, got {segments:?}");

        let sequences: Vec<u32> = PartitionReader::open(dir.path(), WalPartitionId(0), 256)
            .unwrap()
            .map(|r| r.unwrap().0.id.sequence)
            .collect();
        assert_eq!(sequences, (1..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_record_larger_than_segment_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let actor = PartitionActor::open(
            dir.path().to_path_buf(),
            WalPartitionId(0),
            64,
            SyncPolicy::WaitForBatchOrTimeout,
        )
        .await
        .unwrap();
        let (_tx, shutdown) = watch::channel(false);
        let (handle, task) = actor.spawn(4, shutdown);

        let err = send(&handle, payload(1, 128)).await.await.unwrap().unwrap_err();
        assert!(matches!(err, WalError::RecordTooLarge { .. }));

        // The actor is still healthy afterwards.
        send(&handle, payload(2, 4)).await.await.unwrap().unwrap();
        drop(handle);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_requests() {
        let dir = tempfile::tempdir().unwrap();
        let actor = PartitionActor::open(
            dir.path().to_path_buf(),
            WalPartitionId(0),
            1 << 20,
            SyncPolicy::WaitForBatchOrTimeout,
        )
        .await
        .unwrap();
        let (shutdown_tx, shutdown) = watch::channel(false);
        let (handle, task) = actor.spawn(64, shutdown);

        let mut replies = Vec::new();
        for seq in 1..=10 {
            replies.push(send(&handle, payload(seq, 8)).await);
        }
        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        for reply in replies {
            reply.await.unwrap().unwrap();
        }
        // Closed for new work.
        let (tx, _rx) = oneshot::channel();
        assert!(
            handle
                .sender
                .send(WriteRequest {
                    payload: payload(11, 8),
                    respond_to: tx,
                })
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_open_rolls_past_torn_segment() {
        let dir = tempfile::tempdir().unwrap();
        let full = payload(1, 8);
        let mut bytes = (full.len() as u32).to_le_bytes().to_vec();
        bytes.extend_from_slice(&full);
        bytes.extend_from_slice(&(full.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&full[..5]);
        std::fs::write(dir.path().join("100.wal"), &bytes).unwrap();

        let actor = PartitionActor::open(
            dir.path().to_path_buf(),
            WalPartitionId(0),
            1024,
            SyncPolicy::WaitForBatchOrTimeout,
        )
        .await
        .unwrap();
        assert_ne!(
            actor.current_segment().unwrap(),
            dir.path().join("100.wal").as_path()
        );
        // The torn segment is kept untouched.
        assert_eq!(std::fs::read(dir.path().join("100.wal")).unwrap(), bytes);
    }

    #[tokio::test]
    async fn test_failed_write_moves_to_fresh_segment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("100.wal");
        std::fs::write(&path, b"").unwrap();

        // Writes through a read-only handle fail once they reach the OS.
        let file = tokio::fs::File::open(&path).await.unwrap();
        let writer =
            PartitionWriter::from_file(path.clone(), file, 1024, SyncPolicy::WaitForBatchOrTimeout)
                .await
                .unwrap();
        let actor = PartitionActor {
            partition: WalPartitionId(0),
            dir: dir.path().to_path_buf(),
            max_segment_size: 1024,
            sync_policy: SyncPolicy::WaitForBatchOrTimeout,
            writer: Some(writer),
        };
        let (_tx, shutdown) = watch::channel(false);
        let (handle, task) = actor.spawn(4, shutdown);

        let err = send(&handle, payload(1, 8)).await.await.unwrap().unwrap_err();
        assert!(matches!(err, WalError::Io(_)));
        send(&handle, payload(2, 8)).await.await.unwrap().unwrap();
        drop(handle);
        task.await.unwrap().unwrap();

        let segments = list_segments(dir.path()).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);

        let sequences: Vec<u32> = PartitionReader::open(dir.path(), WalPartitionId(0), 1024)
            .unwrap()
            .map(|r| r.unwrap().0.id.sequence)
            .collect();
        assert_eq!(sequences, vec![2]);
    }
}
