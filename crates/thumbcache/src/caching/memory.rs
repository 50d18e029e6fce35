use std::fmt;
use std::sync::Arc;

use image::DynamicImage;
use moka::policy::EvictionPolicy;

use crate::config::InMemoryCacheConfig;

use super::{CacheError, CacheKey};

/// A decoded thumbnail, cheap to clone.
#[derive(Clone)]
pub struct Thumbnail {
    image: Arc<DynamicImage>,
    /// Size of the encoded bytes this thumbnail was decoded from.
    cost: usize,
}

impl fmt::Debug for Thumbnail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thumbnail")
            .field("width", &self.image.width())
            .field("height", &self.image.height())
            .field("cost", &self.cost)
            .finish()
    }
}

impl Thumbnail {
    /// Decodes encoded image bytes, guessing the format from their contents.
    pub fn decode(bytes: &[u8]) -> Result<Self, CacheError> {
        let image = image::load_from_memory(bytes)?;
        Ok(Self {
            image: Arc::new(image),
            cost: bytes.len(),
        })
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// The cost this thumbnail is accounted with in the in-memory tier.
    pub fn cost(&self) -> usize {
        self.cost
    }

    /// Whether both thumbnails share the same decoded image.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.image, &other.image)
    }
}

/// The in-memory tier, holding decoded thumbnails.
///
/// Both the number of entries and their total cost are bounded. Every entry weighs at least
/// `max_bytes / max_entries`, so staying below `max_bytes` also keeps the count below
/// `max_entries`. The least recently used entries are evicted first.
///
/// A limit of `0` for either bound disables the tier.
pub struct MemoryTier {
    cache: Option<moka::sync::Cache<CacheKey, Thumbnail>>,
}

impl fmt::Debug for MemoryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTier")
            .field("entries", &self.entry_count())
            .field("weighted_size", &self.weighted_size())
            .finish()
    }
}

impl MemoryTier {
    pub fn new(config: &InMemoryCacheConfig) -> Self {
        if config.max_entries == 0 || config.max_bytes == 0 {
            return Self { cache: None };
        }
        let min_weight = config.max_bytes.div_ceil(config.max_entries);

        let mut builder = moka::sync::Cache::builder()
            .name("thumbnails")
            .max_capacity(config.max_bytes)
            .eviction_policy(EvictionPolicy::lru())
            .weigher(move |_k: &CacheKey, v: &Thumbnail| {
                let weight = (v.cost as u64).max(min_weight);
                weight.try_into().unwrap_or(u32::MAX)
            });
        if let Some(time_to_idle) = config.time_to_idle {
            builder = builder.time_to_idle(time_to_idle);
        }

        Self {
            cache: Some(builder.build()),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Thumbnail> {
        self.cache.as_ref()?.get(key)
    }

    pub fn insert(&self, key: CacheKey, thumbnail: Thumbnail) {
        if let Some(cache) = &self.cache {
            cache.insert(key, thumbnail);
        }
    }

    /// Drops all entries.
    pub fn clear(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
            cache.run_pending_tasks();
        }
    }

    /// Applies pending evictions, so that the counters below are exact.
    pub fn run_pending_tasks(&self) {
        if let Some(cache) = &self.cache {
            cache.run_pending_tasks();
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.as_ref().map_or(0, |cache| cache.entry_count())
    }

    /// The total weight of all entries, at least their total cost.
    pub fn weighted_size(&self) -> u64 {
        self.cache.as_ref().map_or(0, |cache| cache.weighted_size())
    }
}

#[cfg(test)]
mod tests {
    use crate::types::ContentRef;

    use super::*;

    fn key(n: usize) -> CacheKey {
        CacheKey::for_content(&ContentRef::Id(format!("id-{n}")), 100)
    }

    fn thumbnail(cost: usize) -> Thumbnail {
        Thumbnail {
            image: Arc::new(DynamicImage::new_rgb8(1, 1)),
            cost,
        }
    }

    #[test]
    fn test_decode() {
        let bytes = thumbcache_test::png_bytes(4, 3);
        let thumbnail = Thumbnail::decode(&bytes).unwrap();
        assert_eq!((thumbnail.width(), thumbnail.height()), (4, 3));
        assert_eq!(thumbnail.cost(), bytes.len());

        let err = Thumbnail::decode(b"definitely not an image").unwrap_err();
        assert!(matches!(err, CacheError::Malformed(_)));
    }

    #[test]
    fn test_entry_limit() {
        let tier = MemoryTier::new(&InMemoryCacheConfig {
            max_entries: 3,
            max_bytes: 3_000,
            time_to_idle: None,
        });

        for n in 0..10 {
            tier.insert(key(n), thumbnail(10));
            tier.run_pending_tasks();
        }

        assert!(tier.entry_count() <= 3);
        assert!(tier.weighted_size() <= 3_000);
    }

    #[test]
    fn test_cost_limit() {
        let tier = MemoryTier::new(&InMemoryCacheConfig {
            max_entries: 100,
            max_bytes: 1_000,
            time_to_idle: None,
        });

        for n in 0..10 {
            tier.insert(key(n), thumbnail(400));
            tier.run_pending_tasks();
        }

        assert!(tier.entry_count() <= 2);
        assert!(tier.weighted_size() <= 1_000);
    }

    #[test]
    fn test_disabled() {
        let tier = MemoryTier::new(&InMemoryCacheConfig {
            max_entries: 0,
            ..Default::default()
        });
        tier.insert(key(0), thumbnail(1));
        tier.run_pending_tasks();

        assert_eq!(tier.get(&key(0)).map(|t| t.cost()), None);
    }

    #[test]
    fn test_clear() {
        let tier = MemoryTier::new(&InMemoryCacheConfig::default());
        tier.insert(key(0), thumbnail(1));
        tier.insert(key(1), thumbnail(1));
        assert!(tier.get(&key(0)).is_some());

        tier.clear();
        assert!(tier.get(&key(0)).is_none());
        assert!(tier.get(&key(1)).is_none());
        assert_eq!(tier.entry_count(), 0);
    }
}
