//! Content-addressed shadow copies of tool binaries and their native libraries.
//!
//! Every file is copied to `<root>/native/<key>/<fileName>` where `key` is a
//! 32-bit FNV-1a hash over the file name and its last-write tick count. A new
//! timestamp produces a new key, so a rebuilt library never overwrites a copy
//! that a running context still has mapped.
//!
//! Materialization copies into a private temporary directory first and then
//! renames that directory onto the key directory. The rename is the commit
//! point: readers never observe a partial copy, and a materializer that loses
//! the race simply discards its temporary directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, warn};

/// Name of the cache folder created next to the target tool.
pub const CACHE_FOLDER: &str = ".shadow";

/// Sub-folder holding the copied binaries.
pub const NATIVE_FOLDER: &str = "native";

/// Ticks (100 ns units) between 0001-01-01 and the Unix epoch.
const EPOCH_OFFSET_TICKS: i64 = 621_355_968_000_000_000;

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

#[derive(Debug, Error)]
pub enum ShadowError {
    #[error("path {0} has no usable file name")]
    InvalidFileName(PathBuf),

    #[error("cannot read metadata of {path}: {source}")]
    Metadata { path: PathBuf, source: io::Error },

    #[error("failed to materialize shadow copy of {path}: {source}")]
    Materialize { path: PathBuf, source: io::Error },
}

/// Order-sensitive 32-bit FNV-1a hash.
pub fn fnv1a32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Convert a timestamp to 100 ns ticks since 0001-01-01 UTC.
pub fn timestamp_ticks(time: SystemTime) -> i64 {
    let since_epoch = match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64 / 100,
        Err(e) => -(e.duration().as_nanos() as i64 / 100),
    };
    EPOCH_OFFSET_TICKS + since_epoch
}

/// Cache key for a file name and last-write tick count, as lowercase hex.
pub fn cache_key(file_name: &str, ticks: i64) -> String {
    let mut buffer = Vec::with_capacity(file_name.len() + 8);
    buffer.extend_from_slice(file_name.as_bytes());
    buffer.extend_from_slice(&ticks.to_le_bytes());
    format!("{:x}", fnv1a32(&buffer))
}

/// Result of [`ShadowCache::ensure_copied`].
#[derive(Debug, Clone)]
pub struct ShadowCopy {
    /// Original file.
    pub source: PathBuf,
    /// Fully written copy inside the cache.
    pub path: PathBuf,
    /// Last-write time of the source when the key was computed.
    pub modified: SystemTime,
    /// Whether this call performed the copy (false on a cache hit or lost race).
    pub copied: bool,
}

impl ShadowCopy {
    /// Directory that holds the copy; used to resolve the file by name.
    pub fn directory(&self) -> &Path {
        self.path.parent().unwrap_or(&self.path)
    }
}

/// Shadow cache rooted at `<targetDir>/.shadow`.
#[derive(Debug, Clone)]
pub struct ShadowCache {
    root: PathBuf,
}

impl ShadowCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Cache used for a target tool: a `.shadow` folder in the tool's directory.
    pub fn for_target(target: &Path) -> Self {
        let dir = target.parent().unwrap_or_else(|| Path::new("."));
        Self::new(dir.join(CACHE_FOLDER))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn native_root(&self) -> PathBuf {
        self.root.join(NATIVE_FOLDER)
    }

    /// Return a cached copy of `source`, materializing it if needed.
    pub fn ensure_copied(&self, source: &Path) -> Result<ShadowCopy, ShadowError> {
        let file_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ShadowError::InvalidFileName(source.to_path_buf()))?;

        let stat_err = |e| ShadowError::Metadata {
            path: source.to_path_buf(),
            source: e,
        };
        let meta = fs::metadata(source).map_err(stat_err)?;
        let modified = meta.modified().map_err(stat_err)?;
        let size = meta.len();

        let native_root = self.native_root();
        let key = cache_key(file_name, timestamp_ticks(modified));
        let mut dir = native_root.join(&key);

        match fs::metadata(dir.join(file_name)) {
            Ok(existing) if existing.len() == size => {
                return Ok(self.hit(source, dir.join(file_name), modified));
            }
            Ok(existing) => {
                // Same name and timestamp but different content length.
                warn!(
                    file = %source.display(),
                    key = %key,
                    cached_len = existing.len(),
                    source_len = size,
                    "Shadow cache key collision"
                );
                dir = native_root.join(format!("{key}-{size:x}"));
                if fs::metadata(dir.join(file_name)).is_ok_and(|m| m.len() == size) {
                    return Ok(self.hit(source, dir.join(file_name), modified));
                }
            }
            Err(_) => {}
        }

        let copied = materialize(source, file_name, &native_root, &dir).map_err(|e| {
            ShadowError::Materialize {
                path: source.to_path_buf(),
                source: e,
            }
        })?;

        Ok(ShadowCopy {
            source: source.to_path_buf(),
            path: dir.join(file_name),
            modified,
            copied,
        })
    }

    fn hit(&self, source: &Path, path: PathBuf, modified: SystemTime) -> ShadowCopy {
        debug!(file = %source.display(), copy = %path.display(), "Shadow cache hit");
        ShadowCopy {
            source: source.to_path_buf(),
            path,
            modified,
            copied: false,
        }
    }
}

/// Copy `source` into a temporary directory and rename it onto `dest_dir`.
///
/// Returns `Ok(false)` when another materializer committed first.
fn materialize(source: &Path, file_name: &str, native_root: &Path, dest_dir: &Path) -> io::Result<bool> {
    fs::create_dir_all(native_root)?;
    let staging = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempdir_in(native_root)?;
    fs::copy(source, staging.path().join(file_name))?;

    match fs::rename(staging.path(), dest_dir) {
        Ok(()) => {
            // The directory now lives at `dest_dir`; nothing left to clean up.
            let _ = staging.keep();
            debug!(file = %source.display(), dir = %dest_dir.display(), "Shadow copy created");
            Ok(true)
        }
        Err(e) if dest_dir.join(file_name).exists() => {
            debug!(
                file = %source.display(),
                error = %e,
                "Shadow copy lost race, using existing copy"
            );
            Ok(false)
        }
        Err(e) => Err(e),
    }
}
