//! Helpers for testing the thumbnail cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test that logs, call [`setup`]. This will set up the logger so that all console
//!    output is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. The cache recreates its root lazily, so a directory dropped too
//!    early is silently leaked. Assign it to a variable in the test function
//!    (e.g. `let cache_dir = test::tempdir()`).

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::{ImageFormat, Rgb, RgbImage};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `thumbcache` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("thumbcache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`keep`](TempDir::keep) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Encodes a `width` x `height` PNG with a simple gradient.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });

    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

/// Builds cache directories in the flat layout written by older releases.
///
/// Those put shard directories directly into the tenant directory, without any group level and
/// without sidecar files.
#[derive(Debug)]
pub struct LegacyLayout {
    root: PathBuf,
}

impl LegacyLayout {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_owned(),
        }
    }

    /// Writes `root/tenant_hash/shard/file_name`.
    pub fn entry(&self, tenant_hash: &str, shard: &str, file_name: &str, bytes: &[u8]) -> PathBuf {
        let dir = self.root.join(tenant_hash).join(shard);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(file_name);
        fs::write(&path, bytes).unwrap();
        path
    }

    /// Writes a file directly into the tenant directory.
    pub fn loose_file(&self, tenant_hash: &str, file_name: &str, bytes: &[u8]) -> PathBuf {
        let dir = self.root.join(tenant_hash);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(file_name);
        fs::write(&path, bytes).unwrap();
        path
    }
}
