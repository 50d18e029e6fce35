use std::io;

use bytes::Bytes;
use sentry::{Hub, SentryFutureExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use super::cleanup::GroupSelector;
use super::fs::DiskTier;
use super::{CacheKey, PartitionPath};

/// A mutation of the disk tier.
#[derive(Debug)]
enum DiskJob {
    Write {
        key: CacheKey,
        partition: PartitionPath,
        bytes: Bytes,
    },
    Remove {
        key: CacheKey,
        partition: PartitionPath,
    },
    ClearAll,
    ClearTenant(String),
    ClearGroup(String, GroupSelector),
    /// Does nothing, but completes only after all previously queued jobs.
    Flush,
}

impl DiskJob {
    fn name(&self) -> &'static str {
        match self {
            DiskJob::Write { .. } => "write",
            DiskJob::Remove { .. } => "remove",
            DiskJob::ClearAll => "clear_all",
            DiskJob::ClearTenant(_) => "clear_tenant",
            DiskJob::ClearGroup(..) => "clear_group",
            DiskJob::Flush => "flush",
        }
    }

    fn run(self, disk: &DiskTier) -> io::Result<()> {
        match self {
            DiskJob::Write {
                key,
                partition,
                bytes,
            } => disk.write(&key, &partition, &bytes).map(|_| ()),
            DiskJob::Remove { key, partition } => disk.remove(&key, &partition),
            DiskJob::ClearAll => disk.clear_all(),
            DiskJob::ClearTenant(tenant_hash) => disk.clear_tenant(&tenant_hash),
            DiskJob::ClearGroup(tenant_hash, selector) => disk.clear_group(&tenant_hash, &selector),
            DiskJob::Flush => Ok(()),
        }
    }
}

/// Message to the disk writer.
#[derive(Debug)]
struct WriterMessage {
    job: DiskJob,
    /// A channel to notify completion of the job.
    done_tx: oneshot::Sender<io::Result<()>>,
}

/// Serializes all mutations of one disk tier.
///
/// A single long running task drains a bounded queue and executes one job at a time on the
/// blocking thread pool, in the order they were submitted. Reads do not go through the writer.
#[derive(Debug, Clone)]
pub struct DiskWriter {
    queue_tx: mpsc::Sender<WriterMessage>,
}

impl DiskWriter {
    /// Spawns the writer task for `disk` on `runtime`.
    ///
    /// At most `queue_size` jobs can be pending. The task terminates once every [`DiskWriter`]
    /// handle is dropped and the queue is drained.
    pub fn new(disk: DiskTier, queue_size: usize, runtime: &tokio::runtime::Handle) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(queue_size.max(1));
        runtime.spawn(Self::worker(queue_rx, disk).bind_hub(Hub::new_from_top(Hub::current())));
        Self { queue_tx }
    }

    /// Long running task executing queued jobs.
    async fn worker(mut queue_rx: mpsc::Receiver<WriterMessage>, disk: DiskTier) {
        while let Some(WriterMessage { job, done_tx }) = queue_rx.recv().await {
            let name = job.name();
            let task_disk = disk.clone();
            let result = match tokio::task::spawn_blocking(move || job.run(&task_disk)).await {
                Ok(result) => result,
                Err(join_err) => {
                    tracing::error!(
                        error = &join_err as &dyn std::error::Error,
                        job = name,
                        "Disk cache job panicked"
                    );
                    Err(io::Error::other(join_err))
                }
            };

            if let Err(err) = &result {
                sentry::with_scope(
                    |scope| scope.set_extra("path", disk.root().display().to_string().into()),
                    || {
                        tracing::error!(
                            error = err as &dyn std::error::Error,
                            job = name,
                            "Disk cache job failed"
                        )
                    },
                );
            }

            // the submitter may have stopped waiting
            let _ = done_tx.send(result);
        }
        tracing::info!("Disk cache writer terminated");
    }

    /// Queues a thumbnail to be written to disk, if it does not yet exist there.
    ///
    /// Writes never wait for queue space. When the queue is full the write is dropped, and the
    /// thumbnail will simply be fetched again the next time it is needed.
    ///
    /// # Return
    ///
    /// A [`oneshot::Receiver`] is returned which receives the outcome of the write. If the write
    /// was dropped, awaiting the receiver resolves into an [`Err`]. It can be safely ignored, and
    /// mostly exists to enable testing.
    pub fn write(
        &self,
        key: CacheKey,
        partition: PartitionPath,
        bytes: Bytes,
    ) -> oneshot::Receiver<io::Result<()>> {
        self.try_submit(DiskJob::Write {
            key,
            partition,
            bytes,
        })
    }

    /// Queues removal of a thumbnail file, dropping the job if the queue is full.
    pub fn remove(&self, key: CacheKey, partition: PartitionPath) -> oneshot::Receiver<io::Result<()>> {
        self.try_submit(DiskJob::Remove { key, partition })
    }

    pub async fn clear_all(&self) -> io::Result<()> {
        self.submit(DiskJob::ClearAll).await
    }

    pub async fn clear_tenant(&self, tenant_hash: &str) -> io::Result<()> {
        self.submit(DiskJob::ClearTenant(tenant_hash.to_owned()))
            .await
    }

    pub async fn clear_group(&self, tenant_hash: &str, selector: GroupSelector) -> io::Result<()> {
        self.submit(DiskJob::ClearGroup(tenant_hash.to_owned(), selector))
            .await
    }

    /// Waits until every job queued before this call has completed.
    pub async fn flush(&self) -> io::Result<()> {
        self.submit(DiskJob::Flush).await
    }

    fn try_submit(&self, job: DiskJob) -> oneshot::Receiver<io::Result<()>> {
        let (done_tx, done_rx) = oneshot::channel();
        metric!(gauge("caches.writer.queue_capacity") = self.queue_tx.capacity() as u64);

        let name = job.name();
        match self.queue_tx.try_send(WriterMessage { job, done_tx }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                metric!(counter("caches.writer.dropped") += 1, "job" => name, "reason" => "full");
                tracing::warn!(job = name, "Disk cache write queue full");
            }
            Err(TrySendError::Closed(_)) => {
                metric!(counter("caches.writer.dropped") += 1, "job" => name, "reason" => "terminated");
                tracing::error!(job = name, "Disk cache writer terminated, dropping job");
            }
        }
        done_rx
    }

    /// Queues a job, waiting for queue space, and waits for its completion.
    async fn submit(&self, job: DiskJob) -> io::Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.queue_tx
            .send(WriterMessage { job, done_tx })
            .await
            .map_err(|_| writer_terminated())?;
        done_rx.await.map_err(|_| writer_terminated())?
    }
}

fn writer_terminated() -> io::Error {
    io::Error::other("disk cache writer terminated")
}

#[cfg(test)]
mod tests {
    use crate::caching::cache_key;
    use crate::types::{ContentRef, ThumbnailRequest};

    use super::*;

    fn entry(id: &str) -> (CacheKey, PartitionPath) {
        cache_key::derive(
            &ThumbnailRequest::new(ContentRef::Id(id.into()), 300)
                .with_tenant("srv-1")
                .with_group("/gallery/cats"),
        )
    }

    #[tokio::test]
    async fn test_jobs_run_in_order() {
        let dir = thumbcache_test::tempdir();
        let disk = DiskTier::new(dir.path()).unwrap();
        let writer = DiskWriter::new(disk.clone(), 16, &tokio::runtime::Handle::current());

        let (key, partition) = entry("abcd1234");
        let written = writer.write(key.clone(), partition.clone(), Bytes::from_static(b"first"));
        writer.clear_all().await.unwrap();
        let _ = writer.write(key.clone(), partition.clone(), Bytes::from_static(b"second"));
        writer.flush().await.unwrap();

        assert!(written.await.unwrap().is_ok());
        assert_eq!(disk.read(&key, &partition).as_deref(), Some(&b"second"[..]));
    }

    #[tokio::test]
    async fn test_full_queue_drops_writes() {
        let dir = thumbcache_test::tempdir();
        let disk = DiskTier::new(dir.path()).unwrap();
        // a writer without a worker never drains its queue
        let (queue_tx, _queue_rx) = mpsc::channel(1);
        let writer = DiskWriter { queue_tx };

        let (key, partition) = entry("abcd1234");
        let _first = writer.write(key.clone(), partition.clone(), Bytes::from_static(b"a"));
        let dropped = writer.write(key.clone(), partition.clone(), Bytes::from_static(b"b"));

        assert!(dropped.await.is_err());
        assert_eq!(disk.read(&key, &partition), None);
    }

    #[tokio::test]
    async fn test_terminated_writer() {
        let (queue_tx, queue_rx) = mpsc::channel(1);
        drop(queue_rx);
        let writer = DiskWriter { queue_tx };

        let err = writer.flush().await.unwrap_err();
        assert_eq!(err.to_string(), "disk cache writer terminated");
    }

    #[tokio::test]
    async fn test_terminated_writer_drops_writes() {
        let dir = thumbcache_test::tempdir();
        let disk = DiskTier::new(dir.path()).unwrap();
        let (queue_tx, queue_rx) = mpsc::channel(16);
        drop(queue_rx);
        let writer = DiskWriter { queue_tx };

        // the queue has room, but nobody drains it anymore
        let (key, partition) = entry("abcd1234");
        let dropped = writer.write(key.clone(), partition.clone(), Bytes::from_static(b"a"));
        let removed = writer.remove(key.clone(), partition.clone());

        assert!(dropped.await.is_err());
        assert!(removed.await.is_err());
        assert_eq!(disk.read(&key, &partition), None);
    }

    #[tokio::test]
    async fn test_remove() {
        let dir = thumbcache_test::tempdir();
        let disk = DiskTier::new(dir.path()).unwrap();
        let writer = DiskWriter::new(disk.clone(), 16, &tokio::runtime::Handle::current());

        let (key, partition) = entry("abcd1234");
        writer
            .write(key.clone(), partition.clone(), Bytes::from_static(b"bytes"))
            .await
            .unwrap()
            .unwrap();
        writer
            .remove(key.clone(), partition.clone())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(disk.read(&key, &partition), None);
    }
}
