//! Image builders.
//!
//! A builder turns a root filesystem (or the difference between two) plus a
//! manifest into an image archive.

pub mod compose;
pub mod diff;
pub mod differ;
pub mod full;

use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use acipack_core::error::{PackError, Result};
use acipack_core::manifest::ImageManifest;

pub use compose::{compose_manifest, AppSource};
pub use diff::DiffImageBuilder;
pub use differ::{Change, ChangeSet, ChangeType, Differ, SnapshotDiffer};
pub use full::FullImageBuilder;

/// Something that writes a complete image for a manifest.
pub trait ImageBuilder {
    /// Write the image to `out`. The builder owns the manifest for the
    /// duration of the build and may fill in its path whitelist.
    fn build(&self, manifest: ImageManifest, out: &mut dyn Write) -> Result<()>;
}

/// Information about a written image.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    /// Path to the image file
    pub path: PathBuf,
    /// SHA256 digest (hex string, without "sha256:" prefix)
    pub digest: String,
    /// Size in bytes
    pub size: u64,
}

impl ImageInfo {
    /// Digest with its algorithm prefix.
    pub fn prefixed_digest(&self) -> String {
        format!("sha256:{}", self.digest)
    }
}

/// Build an image into the file at `dest`, replacing any previous content.
pub fn build_to_path(
    builder: &dyn ImageBuilder,
    manifest: ImageManifest,
    dest: &Path,
) -> Result<ImageInfo> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(dest)
        .map_err(|e| {
            PackError::ArchiveError(format!(
                "Failed to create image file {}: {}",
                dest.display(),
                e
            ))
        })?;

    let mut out = BufWriter::new(file);
    builder.build(manifest, &mut out)?;
    out.flush().map_err(|e| {
        PackError::ArchiveError(format!(
            "Failed to flush image file {}: {}",
            dest.display(),
            e
        ))
    })?;
    drop(out);

    let (digest, size) = sha256_file(dest)?;
    tracing::info!(
        path = %dest.display(),
        digest = %digest,
        size,
        "Image written"
    );

    Ok(ImageInfo {
        path: dest.to_path_buf(),
        digest,
        size,
    })
}

/// Streamed SHA256 of a file, with the number of bytes hashed.
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        PackError::ArchiveError(format!(
            "Failed to open file for hashing {}: {}",
            path.display(),
            e
        ))
    })?;

    let mut hasher = Sha256::new();
    let size = io::copy(&mut file, &mut hasher).map_err(|e| {
        PackError::ArchiveError(format!(
            "Failed to read file for hashing {}: {}",
            path.display(),
            e
        ))
    })?;
    Ok((hex::encode(hasher.finalize()), size))
}

/// Fail unless `path` is an existing directory.
pub(crate) fn check_tree(path: &Path) -> Result<()> {
    let md = std::fs::metadata(path).map_err(|e| PackError::walk(path, e))?;
    if !md.is_dir() {
        return Err(PackError::walk(path, "not a directory"));
    }
    Ok(())
}
