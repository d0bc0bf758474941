//! Image archive writer.
//!
//! An image is a gzip-compressed tar stream whose first entry is the JSON
//! manifest (named `manifest`), followed by the root filesystem under
//! `rootfs/`.

use std::io::{self, Read, Write};

use flate2::write::GzEncoder;
use flate2::Compression;

use acipack_core::config::DEFAULT_COMPRESSION_LEVEL;
use acipack_core::error::{PackError, Result};
use acipack_core::manifest::ImageManifest;

use super::entry::{ArchiveEntry, EntryKind, MANIFEST_FILE};

/// Something archive entries can be appended to.
///
/// Not safe for concurrent appends; entries land in call order.
pub trait ArchiveSink {
    /// Append an entry. When `reader` is given, exactly `entry.size` bytes
    /// are read from it as the entry's content.
    fn append(&mut self, entry: &ArchiveEntry, reader: Option<&mut dyn Read>) -> Result<()>;

    /// Finalize the archive. Appending afterwards is an error.
    fn close(&mut self) -> Result<()>;
}

/// Writes an image: manifest first, then whatever is appended, gzip-compressed.
pub struct ImageWriter<W: Write> {
    builder: Option<tar::Builder<GzEncoder<W>>>,
    finished: Option<GzEncoder<W>>,
}

impl<W: Write> ImageWriter<W> {
    /// Start an image on `out`, writing `manifest` as its first entry.
    pub fn new(manifest: &ImageManifest, out: W) -> Result<Self> {
        Self::with_level(manifest, out, DEFAULT_COMPRESSION_LEVEL)
    }

    pub fn with_level(manifest: &ImageManifest, out: W, level: u32) -> Result<Self> {
        let encoder = GzEncoder::new(out, Compression::new(level));
        let mut writer = Self {
            builder: Some(tar::Builder::new(encoder)),
            finished: None,
        };
        writer.write_manifest(manifest)?;
        Ok(writer)
    }

    fn write_manifest(&mut self, manifest: &ImageManifest) -> Result<()> {
        let data = manifest.to_json()?;

        let mut entry = ArchiveEntry::file(MANIFEST_FILE, 0o644, data.len() as u64);
        entry.mtime = chrono::Utc::now().timestamp().max(0) as u64;
        entry.user_name = Some("root".to_string());
        entry.group_name = Some("root".to_string());

        self.append(&entry, Some(&mut data.as_slice()))
    }

    /// Finalize and return the underlying writer.
    pub fn into_inner(mut self) -> Result<W> {
        self.close()?;
        let encoder = self
            .finished
            .take()
            .ok_or_else(|| PackError::ArchiveError("archive already consumed".to_string()))?;
        encoder
            .finish()
            .map_err(|e| PackError::ArchiveError(format!("failed to finish compression: {}", e)))
    }
}

impl<W: Write> ArchiveSink for ImageWriter<W> {
    fn append(&mut self, entry: &ArchiveEntry, reader: Option<&mut dyn Read>) -> Result<()> {
        let builder = self
            .builder
            .as_mut()
            .ok_or_else(|| PackError::ArchiveError("append on a closed archive".to_string()))?;

        let mut header = entry.to_header()?;
        let append_err = |e: io::Error| {
            PackError::ArchiveError(format!("failed to add {} to archive: {}", entry.name.display(), e))
        };

        match (entry.kind, reader) {
            (EntryKind::Symlink | EntryKind::Hardlink, _) => {
                let link = entry.link.as_deref().ok_or_else(|| {
                    PackError::ArchiveError(format!("{} has no link target", entry.name.display()))
                })?;
                builder
                    .append_link(&mut header, &entry.name, link)
                    .map_err(append_err)?;
            }
            (_, Some(reader)) => {
                let content = ExactReader::new(reader, entry.size);
                builder
                    .append_data(&mut header, &entry.name, content)
                    .map_err(append_err)?;
            }
            (_, None) if entry.size > 0 => {
                return Err(PackError::ArchiveError(format!(
                    "{} declares {} bytes but has no content",
                    entry.name.display(),
                    entry.size
                )));
            }
            (_, None) => {
                builder
                    .append_data(&mut header, &entry.name, io::empty())
                    .map_err(append_err)?;
            }
        }

        Ok(())
    }

    /// Write the tar trailer, then the gzip trailer. Both steps are attempted
    /// even when the first fails; the first error is returned.
    fn close(&mut self) -> Result<()> {
        let Some(mut builder) = self.builder.take() else {
            return Ok(());
        };

        let tar_result = builder
            .finish()
            .map_err(|e| PackError::ArchiveError(format!("failed to finalize archive: {}", e)));

        let gz_result = match builder.into_inner() {
            Ok(mut encoder) => {
                let result = encoder.try_finish().map_err(|e| {
                    PackError::ArchiveError(format!("failed to finish compression: {}", e))
                });
                self.finished = Some(encoder);
                result
            }
            Err(e) => Err(PackError::ArchiveError(format!("failed to finalize archive: {}", e))),
        };

        tar_result.and(gz_result)
    }
}

/// Yields exactly `remaining` bytes from the inner reader, failing if it
/// runs dry early. Content that grew since `lstat` is cut off.
struct ExactReader<'a> {
    inner: &'a mut dyn Read,
    remaining: u64,
}

impl<'a> ExactReader<'a> {
    fn new(inner: &'a mut dyn Read, remaining: u64) -> Self {
        Self { inner, remaining }
    }
}

impl Read for ExactReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let max = buf.len().min(self.remaining as usize);
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("content ended {} bytes short", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}
