use std::fs::read_dir;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::types::ByteSize;

use super::cleanup::UNGROUPED;
use super::fs::{catch_not_found, visible_files};
use super::metadata::{self, GROUP_METADATA_FILE, GroupMetadata, TENANT_METADATA_FILE, TenantMetadata};

/// Label of the bucket collecting entries outside of any group.
pub const UNGROUPED_LABEL: &str = "Ungrouped";

/// Disk usage of one group of a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSummary {
    /// The group directory name, or `_ungrouped`.
    pub group_hash: String,
    pub label: String,
    pub bytes: ByteSize,
    pub count: u64,
}

impl GroupSummary {
    pub fn is_ungrouped(&self) -> bool {
        self.group_hash == UNGROUPED
    }
}

/// Disk usage of one tenant, broken down by group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantSummary {
    pub tenant_hash: String,
    pub label: String,
    pub bytes: ByteSize,
    pub count: u64,
    pub groups: Vec<GroupSummary>,
}

/// Builds per-tenant and per-group summaries by scanning the disk tier.
///
/// Labels come from the sidecar files and fall back to the directory hash. Files directly in
/// the cache root belong to no tenant and are not reported.
#[derive(Debug, Clone)]
pub struct StatsAggregator {
    root: PathBuf,
}

impl StatsAggregator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Scans the cache. This does blocking I/O proportional to the number of cached files.
    ///
    /// Entries that can not be read, for example because a clear removed them during the scan,
    /// are logged and left out of the summaries.
    pub fn aggregate(&self) -> Vec<TenantSummary> {
        let mut tenants: Vec<_> = readable_entries(&self.root)
            .filter(|(name, _, is_dir)| *is_dir && !name.starts_with('.'))
            .filter_map(|(name, path, _)| summarize_tenant(&path, name))
            .collect();

        tenants.sort_by(|a, b| (&a.label, &a.tenant_hash).cmp(&(&b.label, &b.tenant_hash)));
        tenants
    }
}

/// Lists `dir` as `(file name, path, is directory)`, skipping entries that fail.
fn readable_entries(dir: &Path) -> impl Iterator<Item = (String, PathBuf, bool)> {
    let entries = match catch_not_found(|| read_dir(dir)) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                path = %dir.display(),
                "Failed to list cache directory"
            );
            None
        }
    };

    entries.into_iter().flatten().filter_map(|entry| {
        let entry = entry.and_then(|entry| {
            let file_type = entry.file_type()?;
            Ok((entry, file_type))
        });
        match entry {
            Ok((entry, file_type)) => {
                let name = entry.file_name().to_string_lossy().into_owned();
                Some((name, entry.path(), file_type.is_dir()))
            }
            Err(err) => {
                tracing::debug!(error = &err as &dyn std::error::Error, "Skipping cache entry");
                None
            }
        }
    })
}

fn summarize_tenant(dir: &Path, tenant_hash: String) -> Option<TenantSummary> {
    let label = metadata::read::<TenantMetadata>(&dir.join(TENANT_METADATA_FILE))
        .map(|metadata| metadata.display_label)
        .unwrap_or_else(|| tenant_hash.clone());

    let mut ungrouped = GroupSummary {
        group_hash: UNGROUPED.into(),
        label: UNGROUPED_LABEL.into(),
        bytes: ByteSize(0),
        count: 0,
    };
    let mut groups = Vec::new();

    // the tenant might have been cleared since we listed it
    for (name, path, is_dir) in readable_entries(dir) {
        if name.starts_with('.') {
            continue;
        }

        if !is_dir {
            match path.metadata() {
                Ok(metadata) => {
                    ungrouped.bytes.0 += metadata.len();
                    ungrouped.count += 1;
                }
                Err(err) => tracing::debug!(
                    error = &err as &dyn std::error::Error,
                    path = %path.display(),
                    "Skipping cache entry"
                ),
            }
            continue;
        }

        let (bytes, count) = sum_files(&path);
        if count == 0 {
            continue;
        }

        let group_metadata_path = path.join(GROUP_METADATA_FILE);
        if group_metadata_path.exists() {
            let label = metadata::read::<GroupMetadata>(&group_metadata_path)
                .map(|metadata| metadata.display_name)
                .unwrap_or_else(|| name.clone());
            groups.push(GroupSummary {
                group_hash: name,
                label,
                bytes: ByteSize(bytes),
                count,
            });
        } else {
            ungrouped.bytes.0 += bytes;
            ungrouped.count += count;
        }
    }

    groups.sort_by(|a, b| (&a.label, &a.group_hash).cmp(&(&b.label, &b.group_hash)));
    if ungrouped.count > 0 {
        groups.insert(0, ungrouped);
    }
    if groups.is_empty() {
        return None;
    }

    let bytes = groups.iter().map(|group| group.bytes.0).sum();
    let count = groups.iter().map(|group| group.count).sum();

    Some(TenantSummary {
        tenant_hash,
        label,
        bytes: ByteSize(bytes),
        count,
        groups,
    })
}

fn sum_files(dir: &Path) -> (u64, u64) {
    visible_files(dir).fold((0, 0), |(bytes, count), (_, size)| (bytes + size, count + 1))
}

#[cfg(test)]
mod tests {
    use thumbcache_test::LegacyLayout;

    use crate::caching::cache_key;
    use crate::caching::fs::DiskTier;
    use crate::types::{ContentRef, ThumbnailRequest};

    use super::*;

    const SRV_1: &str = "ce956e9f24f8d4b390d804c986cafbfa5adcf6c52f8cb36d5db371a4405c70cb";

    fn write(disk: &DiskTier, tenant: &str, group: Option<&str>, id: &str) {
        let mut request = ThumbnailRequest::new(ContentRef::Id(id.into()), 300).with_tenant(tenant);
        if let Some(group) = group {
            request = request.with_group(group);
        }
        let (key, partition) = cache_key::derive(&request);
        disk.write(&key, &partition, id.as_bytes()).unwrap();
    }

    #[test]
    fn test_empty() {
        let dir = thumbcache_test::tempdir();
        let stats = StatsAggregator::new(dir.path().join("missing"));
        assert_eq!(stats.aggregate(), vec![]);

        // sidecars alone do not make a tenant
        let disk = DiskTier::new(dir.path()).unwrap();
        write(&disk, "srv-1", Some("/gallery/cats"), "abcd1234");
        disk.clear_group(SRV_1, &"0e7aab30".into()).unwrap();
        assert_eq!(StatsAggregator::new(dir.path()).aggregate(), vec![]);
    }

    #[test]
    fn test_aggregate() {
        let dir = thumbcache_test::tempdir();
        let disk = DiskTier::new(dir.path()).unwrap();

        write(&disk, "srv-1", Some("/gallery/dogs"), "abcd1234");
        write(&disk, "srv-1", Some("/gallery/cats"), "abcd1234");
        write(&disk, "srv-1", Some("/gallery/cats"), "ab99");
        write(&disk, "alpha", None, "zz99");
        LegacyLayout::new(dir.path()).entry(SRV_1, "ab", "0000.img", b"legacy");
        // loose files in the root belong to nobody
        std::fs::write(dir.path().join("stray.img"), b"stray").unwrap();

        let stats = StatsAggregator::new(dir.path()).aggregate();
        insta::assert_debug_snapshot!(stats, @r###"
        [
            TenantSummary {
                tenant_hash: "8ed3f6ad685b959ead7022518e1af76cd816f8e8ec7ccdda1ed4018e8f2223f8",
                label: "alpha",
                bytes: ByteSize(
                    4,
                ),
                count: 1,
                groups: [
                    GroupSummary {
                        group_hash: "_ungrouped",
                        label: "Ungrouped",
                        bytes: ByteSize(
                            4,
                        ),
                        count: 1,
                    },
                ],
            },
            TenantSummary {
                tenant_hash: "ce956e9f24f8d4b390d804c986cafbfa5adcf6c52f8cb36d5db371a4405c70cb",
                label: "srv-1",
                bytes: ByteSize(
                    26,
                ),
                count: 4,
                groups: [
                    GroupSummary {
                        group_hash: "_ungrouped",
                        label: "Ungrouped",
                        bytes: ByteSize(
                            6,
                        ),
                        count: 1,
                    },
                    GroupSummary {
                        group_hash: "0e7aab30",
                        label: "cats",
                        bytes: ByteSize(
                            12,
                        ),
                        count: 2,
                    },
                    GroupSummary {
                        group_hash: "4e4afedb",
                        label: "dogs",
                        bytes: ByteSize(
                            8,
                        ),
                        count: 1,
                    },
                ],
            },
        ]
        "###);

        assert!(stats[1].groups[0].is_ungrouped());
        assert_eq!(stats[1].bytes.to_string(), "26 bytes");
    }

    #[test]
    fn test_labels_fall_back_to_hash() {
        let dir = thumbcache_test::tempdir();
        LegacyLayout::new(dir.path()).entry("feedface", "00", "0000.img", b"x");

        let stats = StatsAggregator::new(dir.path()).aggregate();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].label, "feedface");
        assert_eq!(stats[0].groups[0].group_hash, "_ungrouped");
    }

    #[test]
    fn test_unreadable_entries_are_skipped() {
        let dir = thumbcache_test::tempdir();
        let disk = DiskTier::new(dir.path()).unwrap();
        write(&disk, "srv-1", Some("/gallery/cats"), "abcd1234");
        write(&disk, "srv-2", None, "abcd1234");

        // a sidecar that can not be read as a file
        let sidecar = dir.path().join(SRV_1).join(TENANT_METADATA_FILE);
        std::fs::remove_file(&sidecar).unwrap();
        std::fs::create_dir(&sidecar).unwrap();
        let group_sidecar = dir.path().join(SRV_1).join("0e7aab30").join(GROUP_METADATA_FILE);
        std::fs::write(&group_sidecar, b"").unwrap();

        let stats = StatsAggregator::new(dir.path()).aggregate();
        let labels: Vec<_> = stats
            .iter()
            .map(|tenant| (tenant.label.as_str(), tenant.groups[0].label.as_str(), tenant.count))
            .collect();
        insta::assert_debug_snapshot!(labels, @r###"
        [
            (
                "ce956e9f24f8d4b390d804c986cafbfa5adcf6c52f8cb36d5db371a4405c70cb",
                "0e7aab30",
                1,
            ),
            (
                "srv-2",
                "Ungrouped",
                1,
            ),
        ]
        "###);
    }
}
