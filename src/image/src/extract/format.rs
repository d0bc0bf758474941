//! Image format detection from leading bytes.

use std::fmt;
use std::io::{self, Cursor, Read};

/// Bytes inspected to decide the format.
pub const SNIFF_LEN: usize = 512;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const BZIP2_MAGIC: &[u8] = b"BZh";
const XZ_MAGIC: &[u8] = &[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00];

const TAR_BLOCK: usize = 512;
const CHKSUM_OFFSET: usize = 148;
const CHKSUM_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectedFormat {
    Gzip,
    Bzip2,
    Xz,
    Tar,
    Unknown,
}

impl fmt::Display for DetectedFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DetectedFormat::Gzip => "gzip",
            DetectedFormat::Bzip2 => "bzip2",
            DetectedFormat::Xz => "xz",
            DetectedFormat::Tar => "tar",
            DetectedFormat::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

impl DetectedFormat {
    /// Decide the format from up to [`SNIFF_LEN`] leading bytes.
    ///
    /// Compression magic wins; without one, a complete tar header block
    /// with a valid checksum means plain tar.
    pub fn detect(head: &[u8]) -> Self {
        let head = &head[..head.len().min(SNIFF_LEN)];

        if head.starts_with(GZIP_MAGIC) {
            DetectedFormat::Gzip
        } else if head.starts_with(BZIP2_MAGIC) {
            DetectedFormat::Bzip2
        } else if head.starts_with(XZ_MAGIC) {
            DetectedFormat::Xz
        } else if is_tar_header(head) {
            DetectedFormat::Tar
        } else {
            DetectedFormat::Unknown
        }
    }
}

/// Read the leading bytes of `reader` and detect its format.
///
/// The returned reader yields the full stream again, sniffed bytes
/// included. Short streams are fine; read errors are not.
pub fn sniff<R: Read>(mut reader: R) -> io::Result<(DetectedFormat, Cursor<Vec<u8>>, R)> {
    let mut head = Vec::with_capacity(SNIFF_LEN);
    (&mut reader)
        .take(SNIFF_LEN as u64)
        .read_to_end(&mut head)?;

    let format = DetectedFormat::detect(&head);
    Ok((format, Cursor::new(head), reader))
}

fn is_tar_header(block: &[u8]) -> bool {
    if block.len() < TAR_BLOCK {
        return false;
    }
    let block = &block[..TAR_BLOCK];

    let Some(recorded) = parse_octal(&block[CHKSUM_OFFSET..CHKSUM_OFFSET + CHKSUM_LEN]) else {
        return false;
    };

    // The checksum field itself counts as spaces. Old writers summed signed bytes.
    let (mut unsigned, mut signed) = (0u64, 0i64);
    for (i, &b) in block.iter().enumerate() {
        let b = if (CHKSUM_OFFSET..CHKSUM_OFFSET + CHKSUM_LEN).contains(&i) {
            b' '
        } else {
            b
        };
        unsigned += u64::from(b);
        signed += i64::from(b as i8);
    }

    recorded == unsigned || i64::try_from(recorded).is_ok_and(|r| r == signed)
}

fn parse_octal(field: &[u8]) -> Option<u64> {
    let digits: &[u8] = {
        let start = field.iter().position(|&b| b != b' ')?;
        let rest = &field[start..];
        let end = rest
            .iter()
            .position(|&b| b == 0 || b == b' ')
            .unwrap_or(rest.len());
        &rest[..end]
    };
    if digits.is_empty() {
        return None;
    }

    digits.iter().try_fold(0u64, |acc, &b| match b {
        b'0'..=b'7' => Some(acc * 8 + u64::from(b - b'0')),
        _ => None,
    })
}
