//! # Thumbnail caching
//!
//! Thumbnails are small, but a gallery view requests hundreds of them at once, mostly the same
//! ones over and over. This module keeps them close so the media server is only asked once.
//!
//! ## Cache Layers
//!
//! - An in-memory layer holding decoded images, bounded by entry count and total cost, evicting
//!   least recently used entries.
//! - A file-system layer holding the encoded bytes, partitioned by tenant (the media server) and
//!   group (the source folder a thumbnail was browsed from).
//!
//! A request goes through the following steps:
//! - First, it goes through the in-memory layer.
//! - On miss, the file-system layer is read, if enabled. Hits are decoded and put into memory.
//! - On miss, the [`ThumbnailFetcher`] is asked for the bytes. A successful fetch is decoded,
//!   put into memory and queued to be written to disk.
//!
//! Failed fetches are never cached.
//!
//! ## On-disk Layout
//!
//! ```text
//! cache_dir/
//!   .tmp/                           files being written, emptied on startup
//!   <tenant_hash>/                  sha256 of the tenant identity
//!     .tenant.json
//!     <group_hash>/                 first 8 hex chars of sha256 of the group hint
//!       .group.json
//!       <shard>/<cache_key>.img
//!     <shard>/<cache_key>.img       ungrouped entries and the legacy flat layout
//! ```
//!
//! The [`CacheKey`] only depends on the content reference and the size. The same thumbnail
//! browsed from two folders is stored twice, once per group, which keeps clearing a group
//! a plain directory removal.
//!
//! Hidden files are never counted as cache entries. Thumbnails and sidecars are written to
//! `.tmp` first and then moved into place. A sidecar is written once and only ever replaced if
//! it can not be read.
//!
//! ## Concurrency
//!
//! All file-system mutations go through a single [`DiskWriter`] task, which
//! serializes writes and clears. Writes are dropped if its queue is full. Clears wait for
//! queue space and report their outcome. Reads do not go through the writer.
//!
//! ### Metrics
//!
//! - `caches.access`: All lookups.
//! - `caches.memory.hit`: Lookups served by the in-memory layer.
//! - `caches.file.hit`: Lookups served by the file-system layer.
//! - `caches.file.miss`: Lookups missing the file-system layer.
//! - `caches.file.malformed`: Files on disk that could not be decoded.
//! - `caches.fetch`: Actual fetches, not served by any of the caching layers.
//! - `caches.file.write`: The number of thumbnails written to disk.
//! - `caches.file.size`: A histogram of the size (in bytes) of loaded and written files.
//! - `caches.writer.dropped`: Jobs dropped because the writer queue was full or the writer
//!   terminated, tagged with the `reason`.
//! - `caches.writer.queue_capacity`: Free slots of the writer queue.
//! - `caches.size.files` and `caches.size.bytes`: Disk usage, whenever it is computed.
//!
//! ### Configuration
//!
//! The in-memory layer is configured with [`Config::caches`](crate::config::Config::caches).
//! The file-system layer is gated by the [`Config::cache_dir`](crate::config::Config::cache_dir)
//! option.

mod cache_error;
mod cache_key;
mod cacher;
mod cleanup;
mod fs;
mod memory;
mod metadata;
mod stats;
mod writer;


pub use cache_error::{CacheError, FetchError};
pub use cache_key::{CacheKey, CacheKeyBuilder, Group, PartitionPath, Tenant, derive};
pub use cacher::{ThumbnailCache, ThumbnailFetcher};
pub use cleanup::{GroupSelector, UNGROUPED};
pub use fs::DiskTier;
pub use memory::{MemoryTier, Thumbnail};
pub use metadata::{GroupMetadata, TenantMetadata};
pub use stats::{GroupSummary, StatsAggregator, TenantSummary, UNGROUPED_LABEL};
pub use writer::DiskWriter;
