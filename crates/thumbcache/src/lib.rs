//! A two-tier thumbnail cache.
//!
//! Thumbnails fetched from a media server are kept in a bounded in-memory tier and a
//! partitioned on-disk tier. See the [`caching`] module for how the layers work together.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
pub mod types;

pub use caching::{CacheError, FetchError, Thumbnail, ThumbnailCache, ThumbnailFetcher};
pub use types::{ByteSize, ContentRef, ThumbnailRequest};
