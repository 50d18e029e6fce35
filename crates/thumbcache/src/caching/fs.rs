use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tempfile::NamedTempFile;
use walkdir::{DirEntry, WalkDir};

use super::metadata::{self, GroupMetadata, TenantMetadata};
use super::{CacheKey, PartitionPath};

/// Directory below the root holding files that are still being written.
///
/// Being hidden, it is skipped by every scan of the cache.
pub const TMP_DIR: &str = ".tmp";

/// The on-disk tier.
///
/// Thumbnails live at `root/tenant_hash/[group_hash/]shard_prefix/cache_key.img`. Files are
/// written to a temporary file in `root/.tmp` and renamed into place, so readers never observe
/// partial files. An existing file is never written again.
///
/// Reads may happen from any thread. Mutations are expected to be funneled through a single
/// [`DiskWriter`](super::writer::DiskWriter).
#[derive(Debug, Clone)]
pub struct DiskTier {
    root: PathBuf,
}

impl DiskTier {
    /// Opens the disk tier at `root`, creating it and its temporary directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(TMP_DIR))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    /// The absolute path of the thumbnail file.
    pub fn entry_path(&self, key: &CacheKey, partition: &PartitionPath) -> PathBuf {
        self.root.join(partition.file_path(key))
    }

    /// Reads the bytes of a thumbnail.
    ///
    /// Every failure is treated as a miss. Errors other than a missing file are logged.
    pub fn read(&self, key: &CacheKey, partition: &PartitionPath) -> Option<Bytes> {
        let path = self.entry_path(key, partition);
        match catch_not_found(|| fs::read(&path)) {
            Ok(Some(bytes)) => {
                metric!(histogram("caches.file.size") = bytes.len() as u64);
                Some(bytes.into())
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to read cache file"
                );
                None
            }
        }
    }

    /// Writes the bytes of a thumbnail and its sidecar files.
    ///
    /// Returns `false` without touching anything if the file already exists.
    pub fn write(
        &self,
        key: &CacheKey,
        partition: &PartitionPath,
        bytes: &[u8],
    ) -> io::Result<bool> {
        let path = self.entry_path(key, partition);
        if path.exists() {
            tracing::trace!(path = %path.display(), "Cache file already exists");
            return Ok(false);
        }

        let tmp_dir = self.tmp_dir();
        for dir in [self.root.join(partition.shard_dir()), tmp_dir.clone()] {
            if let Err(e) = fs::create_dir_all(&dir) {
                sentry::with_scope(
                    |scope| scope.set_extra("path", dir.display().to_string().into()),
                    || tracing::error!("Failed to create cache directory: {:?}", e),
                );
                return Err(e);
            }
        }

        let mut temp_file = NamedTempFile::new_in(&tmp_dir)?;
        temp_file.write_all(bytes)?;
        temp_file.flush()?;

        if let Err(e) = temp_file.persist(&path) {
            let err = e.error;
            sentry::with_scope(
                |scope| scope.set_extra("path", path.display().to_string().into()),
                || tracing::error!("Failed to create cache file: {:?}", err),
            );
            return Err(err);
        }

        metric!(counter("caches.file.write") += 1);
        metric!(histogram("caches.file.size") = bytes.len() as u64);

        self.ensure_metadata(partition);
        Ok(true)
    }

    /// Removes the thumbnail file, if it exists.
    pub fn remove(&self, key: &CacheKey, partition: &PartitionPath) -> io::Result<()> {
        let path = self.entry_path(key, partition);
        catch_not_found(|| fs::remove_file(&path))?;
        Ok(())
    }

    /// Writes the tenant and group sidecars of `partition`, unless they already exist.
    ///
    /// Failures are logged and otherwise ignored, since sidecars only provide labels.
    pub fn ensure_metadata(&self, partition: &PartitionPath) {
        let tmp_dir = self.tmp_dir();
        let tenant_dir = self.root.join(partition.tenant_dir());
        let tenant = TenantMetadata::new(&partition.tenant.identity);
        if let Err(err) =
            write_sidecar(&tenant_dir, metadata::TENANT_METADATA_FILE, &tenant, &tmp_dir)
        {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                path = %tenant_dir.display(),
                "Failed to write tenant metadata"
            );
        }

        if let Some(group) = &partition.group {
            let group_dir = self.root.join(partition.group_dir());
            let metadata = GroupMetadata::new(&group.hint);
            if let Err(err) =
                write_sidecar(&group_dir, metadata::GROUP_METADATA_FILE, &metadata, &tmp_dir)
            {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    path = %group_dir.display(),
                    "Failed to write group metadata"
                );
            }
        }
    }

    /// Total size in bytes and number of all cached files, ignoring hidden files.
    pub fn size_and_count(&self) -> (u64, u64) {
        let mut bytes = 0;
        let mut count = 0;
        for (_, size) in visible_files(&self.root) {
            bytes += size;
            count += 1;
        }

        metric!(gauge("caches.size.files") = count);
        metric!(gauge("caches.size.bytes") = bytes);

        (bytes, count)
    }
}

fn write_sidecar<T>(dir: &Path, name: &str, metadata: &T, tmp_dir: &Path) -> io::Result<()>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    fs::create_dir_all(dir)?;
    metadata::write_once(&dir.join(name), metadata, tmp_dir)?;
    Ok(())
}

/// Whether the entry is hidden, meaning its name starts with a `.`.
pub(super) fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}

/// Recursively lists all non-hidden files below `dir` along with their sizes.
///
/// Hidden directories are not descended into. Entries that can not be read are skipped.
pub(super) fn visible_files(dir: &Path) -> impl Iterator<Item = (PathBuf, u64)> {
    WalkDir::new(dir)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry))
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                tracing::debug!(error = &err as &dyn std::error::Error, "Skipping cache entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let size = entry.metadata().ok()?.len();
            Some((entry.into_path(), size))
        })
}

pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
