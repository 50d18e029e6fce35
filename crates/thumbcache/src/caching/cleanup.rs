use std::fmt;
use std::fs::{self, read_dir, remove_dir_all, remove_file};
use std::io;
use std::path::Path;

use super::cache_key::safe_path_segment;
use super::fs::{DiskTier, catch_not_found};
use super::metadata::GROUP_METADATA_FILE;

/// Marker selecting the ungrouped bucket of a tenant.
pub const UNGROUPED: &str = "_ungrouped";

/// Selects which group of a tenant to clear.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupSelector {
    /// The group directory with this hash.
    Group(String),
    /// Everything in the tenant directory that does not belong to a group, which includes
    /// the legacy flat layout.
    Ungrouped,
}

impl GroupSelector {
    /// Parses a selector as shown in the statistics, mapping [`UNGROUPED`] to
    /// [`Ungrouped`](Self::Ungrouped).
    pub fn parse(s: &str) -> Self {
        match s {
            UNGROUPED => Self::Ungrouped,
            hash => Self::Group(hash.to_owned()),
        }
    }
}

impl fmt::Display for GroupSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Group(hash) => f.write_str(hash),
            Self::Ungrouped => f.write_str(UNGROUPED),
        }
    }
}

impl From<&str> for GroupSelector {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

/// Whether `s` can be joined to a path without escaping its parent.
fn is_safe_segment(s: &str) -> bool {
    !s.is_empty() && safe_path_segment(s) == s
}

impl DiskTier {
    /// Removes every cached file and sidecar. The root directory exists afterwards.
    pub fn clear_all(&self) -> io::Result<()> {
        tracing::info!(root = %self.root().display(), "Clearing disk cache");
        catch_not_found(|| remove_dir_all(self.root()))?;
        fs::create_dir_all(self.tmp_dir())
    }

    /// Removes the directory of one tenant, including all of its groups.
    ///
    /// Unknown tenants and hashes that are not a safe path segment are ignored.
    pub fn clear_tenant(&self, tenant_hash: &str) -> io::Result<()> {
        if !is_safe_segment(tenant_hash) {
            tracing::warn!(tenant_hash, "Refusing to clear tenant with unsafe hash");
            return Ok(());
        }

        tracing::info!(tenant_hash, "Clearing tenant from disk cache");
        catch_not_found(|| remove_dir_all(self.root().join(tenant_hash)))?;
        fs::create_dir_all(self.root())
    }

    /// Removes one group of a tenant.
    ///
    /// Clearing [`GroupSelector::Ungrouped`] removes all directories of the tenant that are not
    /// a group, along with loose files directly inside the tenant directory. Hidden files, like
    /// the tenant sidecar, and group directories are left alone.
    pub fn clear_group(&self, tenant_hash: &str, selector: &GroupSelector) -> io::Result<()> {
        if !is_safe_segment(tenant_hash) {
            tracing::warn!(tenant_hash, "Refusing to clear group of tenant with unsafe hash");
            return Ok(());
        }
        let tenant_dir = self.root().join(tenant_hash);

        match selector {
            GroupSelector::Group(group_hash) => {
                if !is_safe_segment(group_hash) || group_hash == UNGROUPED {
                    tracing::warn!(group_hash = %group_hash, "Refusing to clear group with unsafe hash");
                    return Ok(());
                }
                tracing::info!(tenant_hash, group_hash = %group_hash, "Clearing group from disk cache");
                catch_not_found(|| remove_dir_all(tenant_dir.join(group_hash)))?;
            }
            GroupSelector::Ungrouped => {
                tracing::info!(tenant_hash, "Clearing ungrouped entries from disk cache");
                clear_ungrouped(&tenant_dir)?;
            }
        }

        fs::create_dir_all(self.root())
    }

    /// Removes temporary files left behind by writes that were interrupted by a crash.
    ///
    /// Only the temporary directory is touched, the rest of the cache is never scanned.
    pub fn clear_tmp(&self) -> io::Result<()> {
        let tmp_dir = self.tmp_dir();
        catch_not_found(|| remove_dir_all(&tmp_dir))?;
        fs::create_dir_all(&tmp_dir)
    }
}

fn clear_ungrouped(tenant_dir: &Path) -> io::Result<()> {
    let Some(entries) = catch_not_found(|| read_dir(tenant_dir))? else {
        return Ok(());
    };

    for entry in entries {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }

        let path = entry.path();
        if entry.file_type()?.is_dir() {
            if path.join(GROUP_METADATA_FILE).exists() {
                continue;
            }
            catch_not_found(|| remove_dir_all(&path))?;
        } else {
            catch_not_found(|| remove_file(&path))?;
        }
    }

    Ok(())
}
