use std::fs;
use std::io::{self, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::fs::catch_not_found;

/// Name of the sidecar file in a tenant directory.
pub const TENANT_METADATA_FILE: &str = ".tenant.json";

/// Name of the sidecar file in a group directory.
///
/// Its presence is what distinguishes a group directory from a legacy shard directory.
pub const GROUP_METADATA_FILE: &str = ".group.json";

/// Describes the server a tenant directory belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantMetadata {
    pub resolved_tenant_identity: String,
    pub display_label: String,
}

impl TenantMetadata {
    pub fn new(identity: &str) -> Self {
        Self {
            resolved_tenant_identity: identity.to_owned(),
            display_label: identity.to_owned(),
        }
    }
}

/// Describes the source folder a group directory belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub group_hint: String,
    pub display_name: String,
}

impl GroupMetadata {
    pub fn new(hint: &str) -> Self {
        Self {
            group_hint: hint.to_owned(),
            display_name: display_name(hint),
        }
    }
}

/// The last non-empty component of a folder path, or the whole hint if it has none.
fn display_name(hint: &str) -> String {
    hint.rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or(hint)
        .to_owned()
}

/// Writes `metadata` as JSON to `path`, unless a readable sidecar already exists there.
///
/// The JSON is written to a temporary file in `tmp_dir` first and then moved into place without
/// replacing an existing file, so readers either see the complete sidecar or none. The first
/// writer wins. Only a sidecar that can not be read, like the empty leftover of a crash, is
/// replaced.
///
/// Returns `true` if this call wrote the sidecar.
pub fn write_once<T>(path: &Path, metadata: &T, tmp_dir: &Path) -> io::Result<bool>
where
    T: Serialize + DeserializeOwned,
{
    if read::<T>(path).is_some() {
        return Ok(false);
    }

    let mut temp_file = NamedTempFile::new_in(tmp_dir)?;
    serde_json::to_writer(&mut temp_file, metadata)?;
    temp_file.flush()?;

    match temp_file.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
            if read::<T>(path).is_some() {
                return Ok(false);
            }
            tracing::info!(path = %path.display(), "Replacing broken cache metadata");
            e.file.persist(path).map_err(|e| e.error)?;
            Ok(true)
        }
        Err(e) => Err(e.error),
    }
}

/// Reads a JSON sidecar.
///
/// Any failure, including a missing or unparseable file, is `None`. Failures other than a
/// missing file are logged.
pub fn read<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = match catch_not_found(|| fs::read(path)) {
        Ok(bytes) => bytes?,
        Err(err) => {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                path = %path.display(),
                "Failed to read cache metadata"
            );
            return None;
        }
    };

    serde_json::from_slice(&bytes)
        .inspect_err(|err| {
            tracing::warn!(
                error = err as &dyn std::error::Error,
                path = %path.display(),
                "Failed to parse cache metadata"
            );
        })
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name() {
        assert_eq!(display_name("/gallery/cats"), "cats");
        assert_eq!(display_name("/gallery/cats/"), "cats");
        assert_eq!(display_name("holidays"), "holidays");
        assert_eq!(display_name("/"), "/");
    }

    #[test]
    fn test_first_write_wins() {
        let dir = thumbcache_test::tempdir();
        let path = dir.path().join(GROUP_METADATA_FILE);

        assert!(write_once(&path, &GroupMetadata::new("/gallery/cats"), dir.path()).unwrap());
        assert!(!write_once(&path, &GroupMetadata::new("/gallery/dogs"), dir.path()).unwrap());

        let metadata: GroupMetadata = read(&path).unwrap();
        assert_eq!(metadata.group_hint, "/gallery/cats");
        assert_eq!(metadata.display_name, "cats");

        // only the sidecar itself is left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_broken_sidecar_is_replaced() {
        let dir = thumbcache_test::tempdir();
        let path = dir.path().join(GROUP_METADATA_FILE);

        // an interrupted write leaves an empty file behind
        fs::write(&path, b"").unwrap();
        assert!(write_once(&path, &GroupMetadata::new("/gallery/cats"), dir.path()).unwrap());
        assert_eq!(read::<GroupMetadata>(&path).unwrap().display_name, "cats");

        fs::write(&path, br#"{"group_hint":"/gal"#).unwrap();
        assert!(write_once(&path, &GroupMetadata::new("/gallery/dogs"), dir.path()).unwrap());
        assert_eq!(read::<GroupMetadata>(&path).unwrap().display_name, "dogs");
    }

    #[test]
    fn test_json_format() {
        let json = serde_json::to_string(&TenantMetadata::new("srv-1")).unwrap();
        insta::assert_snapshot!(json, @r###"{"resolved_tenant_identity":"srv-1","display_label":"srv-1"}"###);
    }

    #[test]
    fn test_read_missing_or_broken() {
        let dir = thumbcache_test::tempdir();
        let path = dir.path().join(TENANT_METADATA_FILE);
        assert_eq!(read::<TenantMetadata>(&path), None);

        fs::write(&path, b"{ not json").unwrap();
        assert_eq!(read::<TenantMetadata>(&path), None);

        // not even a file
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();
        assert_eq!(read::<TenantMetadata>(&path), None);
    }
}
