//! Image extraction: format detection, decompression and tar replay.

pub mod decompress;
pub mod format;
pub mod ldpath;
pub mod unpack;
pub mod whitelist;

use std::fs::File;
use std::io::Read;
use std::path::Path;

use acipack_core::error::{PackError, Result};

pub use decompress::{DecodedStream, Decompressor, ExternalDecoder, ProcessReader, XzProcess};
pub use format::{sniff, DetectedFormat, SNIFF_LEN};
pub use ldpath::{current_interpreter, interpreter_of};
pub use unpack::{extract_rootfs, extract_tar, UmaskGuard};
pub use whitelist::apply_path_whitelist;

/// Detect the format of an image stream and return the decoded tar stream.
pub fn open_image<R>(reader: R, decompressor: &Decompressor) -> Result<DecodedStream>
where
    R: Read + Send + 'static,
{
    let (format, head, rest) = sniff(reader)
        .map_err(|e| PackError::ArchiveError(format!("error reading image header: {}", e)))?;

    tracing::debug!(format = %format, "Detected image format");
    decompressor.decompress(Box::new(head.chain(rest)), format)
}

/// Extract a whole image file (manifest included) into `dest`,
/// overwriting what is already there.
pub fn extract_image(source: &Path, dest: &Path, decompressor: &Decompressor) -> Result<()> {
    let file = File::open(source).map_err(|e| {
        PackError::ArchiveError(format!("cannot open source file {}: {}", source.display(), e))
    })?;

    let stream = open_image(file, decompressor)?;
    extract_tar(stream, dest, true, None)?;

    tracing::info!(source = %source.display(), dest = %dest.display(), "Image extracted");
    Ok(())
}
