use thiserror::Error;

/// An error reported by a [`ThumbnailFetcher`](super::ThumbnailFetcher).
///
/// The cache never persists fetch errors. A failed fetch is retried on the next request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The media server does not know the requested content.
    #[error("not found")]
    NotFound,
    /// The media server could not be reached or answered with an error.
    ///
    /// The attached string contains the response or the transport error.
    #[error("fetch failed: {0}")]
    Transport(String),
}

/// An error returned from [`ThumbnailCache::fetch_or_load`](super::ThumbnailCache::fetch_or_load).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// Neither tier had the thumbnail and fetching it failed.
    #[error("thumbnail unavailable: {0}")]
    Unavailable(#[from] FetchError),
    /// The thumbnail bytes could not be decoded as an image.
    ///
    /// The attached string contains the decoder error.
    #[error("malformed: {0}")]
    Malformed(String),
}

impl From<image::ImageError> for CacheError {
    fn from(err: image::ImageError) -> Self {
        Self::Malformed(err.to_string())
    }
}
