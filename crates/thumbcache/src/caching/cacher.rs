use std::fmt;
use std::io;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::config::Config;
use crate::types::ThumbnailRequest;

use super::cleanup::GroupSelector;
use super::fs::DiskTier;
use super::memory::{MemoryTier, Thumbnail};
use super::stats::{StatsAggregator, TenantSummary};
use super::writer::DiskWriter;
use super::{CacheError, CacheKey, FetchError, PartitionPath, cache_key};

/// Fetches encoded thumbnail bytes from the media server.
///
/// This is the only way the cache reaches the network. Implementations are free to apply
/// their own timeouts and authentication.
pub trait ThumbnailFetcher: Send + Sync {
    fn fetch<'a>(&'a self, request: &'a ThumbnailRequest) -> BoxFuture<'a, Result<Bytes, FetchError>>;
}

/// The disk tier along with the writer that owns all of its mutations.
#[derive(Debug)]
struct DiskLayer {
    tier: DiskTier,
    writer: DiskWriter,
}

/// A two-tier thumbnail cache.
///
/// Lookups go through the in-memory tier, then the disk tier, and finally the
/// [`ThumbnailFetcher`]. Freshly fetched thumbnails are put into memory right away and are
/// written to disk in the background.
///
/// Without a configured [`cache_dir`](Config::cache_dir) the cache only keeps thumbnails in
/// memory.
pub struct ThumbnailCache {
    memory: MemoryTier,
    disk: Option<DiskLayer>,
    evict_malformed: bool,
    runtime: tokio::runtime::Handle,
}

impl fmt::Debug for ThumbnailCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThumbnailCache")
            .field("memory", &self.memory)
            .field("cache_dir", &self.cache_dir())
            .field("evict_malformed", &self.evict_malformed)
            .finish()
    }
}

impl ThumbnailCache {
    /// Creates the cache, creating its root directory and spawning the disk writer on `runtime`.
    pub fn new(config: &Config, runtime: tokio::runtime::Handle) -> io::Result<Self> {
        let disk = match &config.cache_dir {
            Some(cache_dir) => {
                let tier = DiskTier::new(cache_dir)?;
                if let Err(err) = tier.clear_tmp() {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        "Failed to remove stale temporary files"
                    );
                }
                let writer = DiskWriter::new(
                    tier.clone(),
                    config.caches.disk.write_queue_size,
                    &runtime,
                );
                Some(DiskLayer { tier, writer })
            }
            None => {
                tracing::info!("No cache_dir configured, caching thumbnails in memory only");
                None
            }
        };

        Ok(Self {
            memory: MemoryTier::new(&config.caches.in_memory),
            disk,
            evict_malformed: config.caches.disk.evict_malformed,
            runtime,
        })
    }

    /// The root of the disk tier, if enabled.
    pub fn cache_dir(&self) -> Option<&std::path::Path> {
        self.disk.as_ref().map(|disk| disk.tier.root())
    }

    pub fn memory(&self) -> &MemoryTier {
        &self.memory
    }

    /// Returns the thumbnail for `request`, fetching it if neither tier has it.
    ///
    /// Fetch failures are returned as [`CacheError::Unavailable`] and never cached. Dropping the
    /// returned future before it completes leaves both tiers untouched.
    #[tracing::instrument(skip_all, fields(content_ref = %request.content_ref(), size = request.size()))]
    pub async fn fetch_or_load(
        &self,
        request: &ThumbnailRequest,
        fetcher: &dyn ThumbnailFetcher,
    ) -> Result<Thumbnail, CacheError> {
        let (key, partition) = cache_key::derive(request);

        if let Some(thumbnail) = self.lookup(&key, &partition)? {
            return Ok(thumbnail);
        }

        metric!(counter("caches.fetch") += 1);
        let bytes = fetcher.fetch(request).await.map_err(|err| {
            tracing::debug!(error = %err, "Failed to fetch thumbnail");
            CacheError::from(err)
        })?;

        let thumbnail = Thumbnail::decode(&bytes).inspect_err(|err| {
            tracing::warn!(error = %err, "Fetched thumbnail is not a valid image");
        })?;

        self.memory.insert(key.clone(), thumbnail.clone());
        if let Some(disk) = &self.disk {
            // the receiver is only interesting for tests
            let _ = disk.writer.write(key, partition, bytes);
        }

        Ok(thumbnail)
    }

    /// Returns the thumbnail if either tier already has it, without ever fetching.
    pub fn get_cached(&self, request: &ThumbnailRequest) -> Result<Option<Thumbnail>, CacheError> {
        let (key, partition) = cache_key::derive(request);
        self.lookup(&key, &partition)
    }

    /// Looks up memory first, then disk. Disk hits are promoted to memory.
    fn lookup(
        &self,
        key: &CacheKey,
        partition: &PartitionPath,
    ) -> Result<Option<Thumbnail>, CacheError> {
        metric!(counter("caches.access") += 1);

        if let Some(thumbnail) = self.memory.get(key) {
            metric!(counter("caches.memory.hit") += 1);
            return Ok(Some(thumbnail));
        }

        let Some(disk) = &self.disk else {
            return Ok(None);
        };
        let Some(bytes) = disk.tier.read(key, partition) else {
            metric!(counter("caches.file.miss") += 1);
            return Ok(None);
        };

        match Thumbnail::decode(&bytes) {
            Ok(thumbnail) => {
                metric!(counter("caches.file.hit") += 1);
                self.memory.insert(key.clone(), thumbnail.clone());
                Ok(Some(thumbnail))
            }
            Err(err) => {
                metric!(counter("caches.file.malformed") += 1);
                let path = disk.tier.entry_path(key, partition);
                tracing::warn!(error = %err, path = %path.display(), "Malformed thumbnail in disk cache");

                if self.evict_malformed {
                    let _ = disk.writer.remove(key.clone(), partition.clone());
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Drops all thumbnails from the in-memory tier.
    pub fn clear_memory(&self) {
        self.memory.clear();
    }

    /// Removes all thumbnails from the disk tier.
    pub async fn clear_disk_all(&self) -> io::Result<()> {
        match &self.disk {
            Some(disk) => disk.writer.clear_all().await,
            None => Ok(()),
        }
    }

    /// Removes all thumbnails of one tenant from the disk tier.
    pub async fn clear_disk_tenant(&self, tenant_hash: &str) -> io::Result<()> {
        match &self.disk {
            Some(disk) => disk.writer.clear_tenant(tenant_hash).await,
            None => Ok(()),
        }
    }

    /// Removes one group of a tenant from the disk tier.
    ///
    /// The group is given by its hash as reported in [`statistics`](Self::statistics), with
    /// `_ungrouped` selecting everything outside of any group.
    pub async fn clear_disk_group(
        &self,
        tenant_hash: &str,
        group: impl Into<GroupSelector>,
    ) -> io::Result<()> {
        match &self.disk {
            Some(disk) => disk.writer.clear_group(tenant_hash, group.into()).await,
            None => Ok(()),
        }
    }

    /// Clears both tiers.
    pub async fn clear_all(&self) -> io::Result<()> {
        self.clear_memory();
        self.clear_disk_all().await
    }

    /// Per-tenant and per-group usage of the disk tier.
    ///
    /// The scan runs on the blocking thread pool. Unreadable entries are left out, so this only
    /// fails if the scan itself could not run.
    pub async fn statistics(&self) -> io::Result<Vec<TenantSummary>> {
        let Some(root) = self.cache_dir().map(ToOwned::to_owned) else {
            return Ok(vec![]);
        };
        self.runtime
            .spawn_blocking(move || StatsAggregator::new(root).aggregate())
            .await
            .map_err(io::Error::other)
    }

    /// Total size in bytes and number of files of the disk tier.
    pub async fn disk_usage(&self) -> io::Result<(u64, u64)> {
        let Some(disk) = &self.disk else {
            return Ok((0, 0));
        };
        let tier = disk.tier.clone();
        self.runtime
            .spawn_blocking(move || tier.size_and_count())
            .await
            .map_err(io::Error::other)
    }

    /// Waits until all queued disk writes and clears have completed.
    pub async fn flush(&self) -> io::Result<()> {
        match &self.disk {
            Some(disk) => disk.writer.flush().await,
            None => Ok(()),
        }
    }
}
