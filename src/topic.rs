use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::task::{Context, Poll};

use log::{error, info, warn};
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;

use crate::codec::{ExtendedRecord, Record, partition_for_key};
use crate::config::{SyncPolicy, WalConfig};
use crate::partition::{PartitionActor, PartitionHandle, WriteRequest};
use crate::reader::{PartitionReader, last_persisted_sequence};
use crate::segment::{now_nanos, partition_dir, topic_dir};
use crate::types::{RecordWriter, Sequence, WalError, WalPartitionId, WalResult};

/// Resolves once the partition actor has written and flushed the record.
///
/// If the topic shuts down before the request was processed the handle
/// resolves to [`WalError::Abandoned`].
#[must_use = "await the handle to learn whether the write was committed"]
#[derive(Debug)]
pub struct WriteHandle {
    sequence: Sequence,
    partition: WalPartitionId,
    receiver: oneshot::Receiver<WalResult<()>>,
}

impl WriteHandle {
    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    pub fn partition(&self) -> WalPartitionId {
        self.partition
    }
}

impl Future for WriteHandle {
    type Output = WalResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|reply| reply.unwrap_or(Err(WalError::Abandoned)))
    }
}

/// Routes records of one topic to its partition actors.
pub struct TopicWriter {
    name: String,
    base_dir: PathBuf,
    partition_count: u32,
    max_segment_size: u64,
    sync_policy: SyncPolicy,
    partitions: Vec<PartitionHandle>,
    sequence: AtomicU32,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<WalResult<()>>>>,
}

impl TopicWriter {
    /// Open every partition of the topic and start its actor. If any
    /// partition fails to open, the ones already running are shut down
    /// before the error is returned.
    pub async fn open(config: WalConfig) -> WalResult<Self> {
        config.validate()?;

        let topic_path = topic_dir(&config.base_dir, &config.topic_name);
        tokio::fs::create_dir_all(&topic_path).await.map_err(|e| {
            error!("Failed to create topic dir '{topic_path:?}': {e}");
            WalError::Io(e)
        })?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut partitions = Vec::with_capacity(config.partition_count as usize);
        let mut tasks = Vec::with_capacity(config.partition_count as usize);
        let mut last_sequence: Sequence = 0;

        for index in 0..config.partition_count {
            let partition = WalPartitionId(index);
            let dir = partition_dir(&config.base_dir, &config.topic_name, partition);

            let opened = async {
                let actor = PartitionActor::open(
                    dir.clone(),
                    partition,
                    config.max_segment_size,
                    config.sync_policy,
                )
                .await?;
                let persisted = if config.resume_sequence {
                    last_persisted_sequence(&dir, config.max_segment_size)?
                } else {
                    None
                };
                Ok::<_, WalError>((actor, persisted))
            }
            .await;

            match opened {
                Ok((actor, persisted)) => {
                    last_sequence = last_sequence.max(persisted.unwrap_or(0));
                    let (handle, task) = actor.spawn(config.queue_capacity, shutdown_rx.clone());
                    partitions.push(handle);
                    tasks.push(task);
                }
                Err(e) => {
                    error!(
                        "Failed to open partition {partition} of topic '{}': {e}",
                        config.topic_name
                    );
                    let _ = shutdown.send(true);
                    for task in tasks {
                        let _ = task.await;
                    }
                    return Err(e);
                }
            }
        }

        info!(
            "Opened WAL topic '{}' with {} partitions at {topic_path:?} (sync policy {}, last sequence {last_sequence})",
            config.topic_name, config.partition_count, config.sync_policy
        );

        Ok(Self {
            name: config.topic_name,
            base_dir: config.base_dir,
            partition_count: config.partition_count,
            max_segment_size: config.max_segment_size,
            sync_policy: config.sync_policy,
            partitions,
            sequence: AtomicU32::new(last_sequence),
            closed: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    /// Queue `record` on its partition and return a handle to the outcome.
    ///
    /// Only a closed topic, an exhausted sequence counter or an unencodable
    /// record fail here; everything else is reported through the handle.
    pub async fn write(&self, record: Record) -> WalResult<WriteHandle> {
        if self.is_closed() {
            return Err(WalError::WriterClosed);
        }

        let sequence = self.next_sequence()?;
        let partition = partition_for_key(&record.key, self.partition_count);
        let ext = ExtendedRecord::new(record, sequence, now_nanos(), partition)?;
        let payload = ext.encode()?;

        let (respond_to, receiver) = oneshot::channel();
        self.partitions[partition.index()]
            .sender
            .send(WriteRequest {
                payload,
                respond_to,
            })
            .await
            .map_err(|_| WalError::WriterClosed)?;

        Ok(WriteHandle {
            sequence,
            partition,
            receiver,
        })
    }

    fn next_sequence(&self) -> WalResult<Sequence> {
        self.sequence
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(1)
            })
            .map(|previous| previous + 1)
            .map_err(|_| WalError::SequenceOverflow)
    }

    /// Stop accepting writes, let every partition drain and close its
    /// segment, and wait for all of them. Later calls return `Ok(())`.
    pub async fn close(&self) -> WalResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.shutdown.send(true);

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        let mut first_error = None;
        for (index, task) in tasks.into_iter().enumerate() {
            let result = match task.await {
                Ok(result) => result,
                Err(join_error) => Err(WalError::Io(std::io::Error::other(format!(
                    "partition task failed: {join_error}"
                )))),
            };
            if let Err(e) = result {
                warn!("Failed to close partition {index} of topic '{}': {e}", self.name);
                first_error.get_or_insert(e);
            }
        }

        info!("Closed WAL topic '{}'", self.name);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    pub fn sync_policy(&self) -> SyncPolicy {
        self.sync_policy
    }

    /// Most recently assigned sequence number; 0 before the first write.
    pub fn last_sequence(&self) -> Sequence {
        self.sequence.load(Ordering::Acquire)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn partition_for(&self, key: &str) -> WalPartitionId {
        partition_for_key(key, self.partition_count)
    }

    pub fn partition_dir(&self, partition: WalPartitionId) -> Option<&Path> {
        self.partitions
            .get(partition.index())
            .map(|handle| handle.dir.as_path())
    }

    /// Replay a partition from its oldest segment. Records still sitting in
    /// a partition's queue are not visible until their handles resolve.
    pub fn read_partition(&self, partition: WalPartitionId) -> WalResult<PartitionReader> {
        let handle = self.partitions.get(partition.index()).ok_or_else(|| {
            WalError::InvalidConfig(format!(
                "partition {partition} out of range for topic '{}' with {} partitions",
                self.name, self.partition_count
            ))
        })?;
        PartitionReader::open(&handle.dir, handle.partition, self.max_segment_size)
    }
}

#[async_trait::async_trait]
impl RecordWriter for TopicWriter {
    async fn write(&self, record: Record) -> WalResult<WriteHandle> {
        TopicWriter::write(self, record).await
    }

    async fn close(&self) -> WalResult<()> {
        TopicWriter::close(self).await
    }
}

impl Drop for TopicWriter {
    fn drop(&mut self) {
        // Actors notice the signal, drain and close their segments on their own.
        let _ = self.shutdown.send(true);
    }
}
