use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use url::Url;

use crate::types::{ContentRef, ThumbnailRequest};

/// File extension of cached thumbnails.
pub const THUMBNAIL_EXTENSION: &str = "img";

/// Shard used when no prefix can be derived from the content reference.
const FALLBACK_SHARD: &str = "00";

/// Number of hex characters of the group digest used as directory name.
const GROUP_HASH_LEN: usize = 8;

/// Identifies the contents of one thumbnail, independent of where it came from.
///
/// The key is the SHA-256 of the content parameters. Tenant and group information never
/// contribute to it, so the same image fetched through different sessions or folders shares
/// one key.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    metadata: Arc<str>,
    hex: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Creates the [`CacheKey`] for a content reference rendered at `size`.
    pub fn for_content(content_ref: &ContentRef, size: u32) -> Self {
        let mut builder = CacheKeyBuilder::default();
        builder.param("content_ref", content_ref.as_str());
        builder.param("size", size.to_string());
        builder.build()
    }

    /// Returns the human-readable parameters that were hashed into this key.
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Returns the lowercase hex digest.
    pub fn as_hex(&self) -> &str {
        &self.hex
    }

    /// Returns the file name of this thumbnail within its shard directory.
    pub fn file_name(&self) -> String {
        format!("{}.{THUMBNAIL_EXTENSION}", self.hex)
    }
}

/// A builder for [`CacheKey`]s.
///
/// Parameters are sorted by name and joined as `name=value` pairs with `&` before hashing, so
/// the order in which they are added does not matter.
#[derive(Debug, Default)]
pub struct CacheKeyBuilder {
    params: BTreeMap<&'static str, String>,
}

impl CacheKeyBuilder {
    pub fn param(&mut self, name: &'static str, value: impl Into<String>) -> &mut Self {
        self.params.insert(name, value.into());
        self
    }

    /// Finalize the [`CacheKey`].
    pub fn build(&self) -> CacheKey {
        let metadata = self
            .params
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("&");

        let hash: [u8; 32] = Sha256::digest(&metadata).into();

        CacheKey {
            hex: hex::encode(hash).into(),
            metadata: metadata.into(),
            hash,
        }
    }
}

/// The server a thumbnail belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tenant {
    /// SHA-256 hex digest of [`identity`](Self::identity), used as directory name.
    pub hash: String,
    /// The resolved tenant identity.
    pub identity: String,
}

/// The logical source folder a thumbnail was browsed from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Group {
    /// Truncated SHA-256 hex digest of [`hint`](Self::hint), used as directory name.
    pub hash: String,
    /// The group hint as given by the caller.
    pub hint: String,
}

/// Where a thumbnail lives on disk, relative to the cache root.
///
/// The layout is `tenant_hash/[group_hash/]shard_prefix/`. A missing group is the ungrouped
/// state that also covers the legacy flat layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionPath {
    pub tenant: Tenant,
    pub group: Option<Group>,
    pub shard_prefix: String,
}

impl PartitionPath {
    pub fn tenant_hash(&self) -> &str {
        &self.tenant.hash
    }

    pub fn group_hash(&self) -> Option<&str> {
        self.group.as_ref().map(|group| group.hash.as_str())
    }

    /// The directory of the tenant, relative to the cache root.
    pub fn tenant_dir(&self) -> PathBuf {
        PathBuf::from(&self.tenant.hash)
    }

    /// The directory of the group, or the tenant directory for ungrouped partitions.
    pub fn group_dir(&self) -> PathBuf {
        let mut dir = self.tenant_dir();
        if let Some(group) = &self.group {
            dir.push(&group.hash);
        }
        dir
    }

    /// The shard directory holding the thumbnail files, relative to the cache root.
    pub fn shard_dir(&self) -> PathBuf {
        self.group_dir().join(&self.shard_prefix)
    }

    /// The full relative path of the thumbnail identified by `key`.
    pub fn file_path(&self, key: &CacheKey) -> PathBuf {
        self.shard_dir().join(key.file_name())
    }
}

/// Derives the [`CacheKey`] and [`PartitionPath`] of a request.
///
/// This never fails: references that can not be interpreted fall back to the `"00"` shard and
/// a tenant derived from the raw reference.
pub fn derive(request: &ThumbnailRequest) -> (CacheKey, PartitionPath) {
    let key = CacheKey::for_content(request.content_ref(), request.size());

    let identity = resolve_tenant(request);
    let tenant = Tenant {
        hash: sha256_hex(&identity),
        identity,
    };

    let group = request.group_hint().map(|hint| Group {
        hash: sha256_hex(hint)[..GROUP_HASH_LEN].to_owned(),
        hint: hint.to_owned(),
    });

    let partition = PartitionPath {
        tenant,
        group,
        shard_prefix: shard_prefix(request.content_ref()),
    };

    (key, partition)
}

fn sha256_hex(s: &str) -> String {
    hex::encode(Sha256::digest(s))
}

fn resolve_tenant(request: &ThumbnailRequest) -> String {
    if let Some(hint) = request.tenant_hint() {
        return hint.to_owned();
    }

    let raw = request.content_ref().as_str();
    if let ContentRef::Path(path) = request.content_ref() {
        if let Ok(url) = Url::parse(path) {
            let origin = url.origin();
            if origin.is_tuple() {
                return origin.ascii_serialization();
            }
        }
    }

    raw.to_owned()
}

fn shard_prefix(content_ref: &ContentRef) -> String {
    match content_ref {
        ContentRef::Id(id) => {
            let prefix: String = id.chars().take(2).collect();
            if prefix.chars().count() == 2 {
                safe_path_segment(&prefix)
            } else {
                FALLBACK_SHARD.to_owned()
            }
        }
        ContentRef::Path(path) => {
            let path = match Url::parse(path) {
                Ok(url) if !url.cannot_be_a_base() => url.path().to_owned(),
                _ => path.clone(),
            };
            match parent(&path) {
                Some(parent) => sha256_hex(parent)[..2].to_owned(),
                None => FALLBACK_SHARD.to_owned(),
            }
        }
    }
}

fn parent(path: &str) -> Option<&str> {
    match path.rfind('/')? {
        0 => Some("/"),
        idx => Some(&path[..idx]),
    }
}

/// Protect against:
/// * ".."
/// * absolute paths
/// * ":" (not a threat on POSIX filesystems, but confuses OS X Finder)
pub(super) fn safe_path_segment(s: &str) -> String {
    s.replace(['.', '/', '\\', ':'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_request(id: &str) -> ThumbnailRequest {
        ThumbnailRequest::new(ContentRef::Id(id.into()), 300)
    }

    #[test]
    fn test_key_metadata() {
        let (key, _) = derive(&id_request("abcd1234").with_tenant("srv-1"));
        assert_eq!(key.metadata(), "content_ref=abcd1234&size=300");
        assert_eq!(
            key.as_hex(),
            "f54d4c13978bf8017e7f7a804932429aac23cdf6e4e6aeab45753b959491c95b"
        );
        assert_eq!(
            key.file_name(),
            "f54d4c13978bf8017e7f7a804932429aac23cdf6e4e6aeab45753b959491c95b.img"
        );
    }

    #[test]
    fn test_builder_sorts_params() {
        let mut a = CacheKeyBuilder::default();
        a.param("size", "300").param("content_ref", "abcd1234");
        let mut b = CacheKeyBuilder::default();
        b.param("content_ref", "abcd1234").param("size", "300");

        assert_eq!(a.build(), b.build());
        assert_eq!(a.build().metadata(), "content_ref=abcd1234&size=300");
    }

    #[test]
    fn test_key_ignores_hints() {
        let (plain, _) = derive(&id_request("abcd1234"));
        let (hinted, _) = derive(
            &id_request("abcd1234")
                .with_tenant("srv-2")
                .with_group("/gallery/dogs"),
        );
        assert_eq!(plain, hinted);

        let (other_size, _) = derive(&ThumbnailRequest::new(ContentRef::Id("abcd1234".into()), 600));
        assert_ne!(plain, other_size);
    }

    #[test]
    fn test_example_partition() {
        let request = id_request("abcd1234")
            .with_tenant("srv-1")
            .with_group("/gallery/cats");
        let (key, partition) = derive(&request);

        assert_eq!(
            partition.tenant_hash(),
            "ce956e9f24f8d4b390d804c986cafbfa5adcf6c52f8cb36d5db371a4405c70cb"
        );
        assert_eq!(partition.group_hash(), Some("0e7aab30"));
        assert_eq!(partition.shard_prefix, "ab");
        assert_eq!(
            partition.file_path(&key),
            PathBuf::from(
                "ce956e9f24f8d4b390d804c986cafbfa5adcf6c52f8cb36d5db371a4405c70cb/0e7aab30/ab/f54d4c13978bf8017e7f7a804932429aac23cdf6e4e6aeab45753b959491c95b.img"
            )
        );

        let (dog_key, dog_partition) = derive(&request.clone().with_group("/gallery/dogs"));
        assert_eq!(dog_key, key);
        assert_eq!(dog_partition.group_hash(), Some("4e4afedb"));
        assert_ne!(dog_partition.shard_dir(), partition.shard_dir());
    }

    #[test]
    fn test_ungrouped_partition() {
        let (key, partition) = derive(&id_request("abcd1234").with_tenant("srv-1"));
        assert_eq!(partition.group, None);
        assert_eq!(
            partition.file_path(&key),
            PathBuf::from(
                "ce956e9f24f8d4b390d804c986cafbfa5adcf6c52f8cb36d5db371a4405c70cb/ab/f54d4c13978bf8017e7f7a804932429aac23cdf6e4e6aeab45753b959491c95b.img"
            )
        );
    }

    #[test]
    fn test_tenant_from_url_reference() {
        let request = ThumbnailRequest::new(
            ContentRef::Path("http://192.168.1.5:1234/gallery/cats/1.jpg".into()),
            300,
        );
        let (_, partition) = derive(&request);
        assert_eq!(partition.tenant.identity, "http://192.168.1.5:1234");

        // the parent of the URL path decides the shard
        let (_, plain) = derive(&ThumbnailRequest::new(
            ContentRef::Path("/gallery/cats/2.jpg".into()),
            300,
        ));
        assert_eq!(partition.shard_prefix, plain.shard_prefix);
        assert_eq!(plain.shard_prefix, &sha256_hex("/gallery/cats")[..2]);
    }

    #[test]
    fn test_fallbacks() {
        // too short for a prefix, and no tenant to resolve
        let (_, partition) = derive(&id_request("a"));
        assert_eq!(partition.shard_prefix, "00");
        assert_eq!(partition.tenant.identity, "a");
        assert_eq!(partition.tenant_hash(), sha256_hex("a"));

        // a bare file name has no parent
        let (_, partition) = derive(&ThumbnailRequest::new(
            ContentRef::Path("cat.jpg".into()),
            10,
        ));
        assert_eq!(partition.shard_prefix, "00");

        // files at the root hash the root
        let (_, partition) = derive(&ThumbnailRequest::new(
            ContentRef::Path("/cat.jpg".into()),
            10,
        ));
        assert_eq!(partition.shard_prefix, &sha256_hex("/")[..2]);
    }

    #[test]
    fn test_unsafe_prefix() {
        let (_, partition) = derive(&id_request("../etc/passwd"));
        assert_eq!(partition.shard_prefix, "__");

        let (_, partition) = derive(&id_request("é中文"));
        assert_eq!(partition.shard_prefix, "é中");
    }

    #[test]
    fn test_deterministic() {
        let request = ThumbnailRequest::new(ContentRef::Path("/a/b/c.png".into()), 64)
            .with_group("/a");
        assert_eq!(derive(&request), derive(&request.clone()));
    }
}
