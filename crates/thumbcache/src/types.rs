//! Request types handed to the cache by the surrounding application.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

/// Reference to the content a thumbnail is rendered from.
#[derive(Debug, Clone, Deserialize, Serialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContentRef {
    /// An opaque, stable identifier such as a file UUID.
    Id(String),
    /// A hierarchical path on the media server, or an absolute URL to the file.
    Path(String),
}

impl ContentRef {
    pub fn as_str(&self) -> &str {
        match self {
            ContentRef::Id(id) => id,
            ContentRef::Path(path) => path,
        }
    }
}

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request for one thumbnail of a given size.
///
/// Only [`content_ref`](Self::content_ref) and [`size`](Self::size) identify the image itself.
/// The tenant and group hints decide where the thumbnail is stored, never what it is.
#[derive(Debug, Clone, Deserialize, Serialize, Eq, PartialEq, Hash)]
pub struct ThumbnailRequest {
    content_ref: ContentRef,
    size: u32,
    tenant_hint: Option<String>,
    group_hint: Option<String>,
}

impl ThumbnailRequest {
    pub fn new(content_ref: ContentRef, size: u32) -> Self {
        Self {
            content_ref,
            size,
            tenant_hint: None,
            group_hint: None,
        }
    }

    /// Sets the server or session identity this thumbnail belongs to.
    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant_hint = Some(tenant.into());
        self
    }

    /// Sets the logical source folder this thumbnail was browsed from.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group_hint = Some(group.into());
        self
    }

    pub fn content_ref(&self) -> &ContentRef {
        &self.content_ref
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// The tenant hint, if one was given and it is not empty.
    pub fn tenant_hint(&self) -> Option<&str> {
        self.tenant_hint.as_deref().filter(|s| !s.is_empty())
    }

    /// The group hint, if one was given and it is not empty.
    pub fn group_hint(&self) -> Option<&str> {
        self.group_hint.as_deref().filter(|s| !s.is_empty())
    }

    /// Builds a request from a thumbnail preview URL.
    ///
    /// Understands `uuid`, `path`, `size`, `server_id` and `source_folder` query parameters. A
    /// `uuid` wins over a `path`. Without a `server_id`, the origin of the URL is used as the
    /// tenant hint.
    ///
    /// Returns `None` if the URL names no content or has no positive `size`.
    pub fn from_url(url: &Url) -> Option<Self> {
        let mut uuid = None;
        let mut path = None;
        let mut size = None;
        let mut server_id = None;
        let mut source_folder = None;

        for (name, value) in url.query_pairs() {
            match name.as_ref() {
                "uuid" => uuid = Some(value.into_owned()),
                "path" => path = Some(value.into_owned()),
                "size" => size = value.parse::<u32>().ok(),
                "server_id" => server_id = Some(value.into_owned()),
                "source_folder" => source_folder = Some(value.into_owned()),
                _ => {}
            }
        }

        let content_ref = match (uuid, path) {
            (Some(uuid), _) if !uuid.is_empty() => ContentRef::Id(uuid),
            (_, Some(path)) if !path.is_empty() => ContentRef::Path(path),
            _ => return None,
        };
        let size = size.filter(|size| *size > 0)?;

        let mut request = Self::new(content_ref, size);
        match server_id.filter(|id| !id.is_empty()) {
            Some(server_id) => request = request.with_tenant(server_id),
            None => {
                let origin = url.origin();
                if origin.is_tuple() {
                    request = request.with_tenant(origin.ascii_serialization());
                }
            }
        }
        if let Some(folder) = source_folder {
            request = request.with_group(folder);
        }

        Some(request)
    }
}

/// A number of bytes, displayed in human readable decimal units.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, Eq, PartialEq, Ord, PartialOrd)]
#[serde(transparent)]
pub struct ByteSize(pub u64);

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];

        if self.0 < 1000 {
            return write!(f, "{} bytes", self.0);
        }

        let mut value = self.0 as f64 / 1000.0;
        let mut unit = 0;
        while value >= 1000.0 && unit < UNITS.len() - 1 {
            value /= 1000.0;
            unit += 1;
        }
        write!(f, "{value:.1} {}", UNITS[unit])
    }
}
