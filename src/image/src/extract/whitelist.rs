//! Path whitelist application.
//!
//! After a diff image is overlaid onto its base, every path not listed in
//! the diff's whitelist is stale and gets removed.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use walkdir::WalkDir;

use acipack_core::error::{PackError, Result};

use crate::build::differ::absolute;

/// Remove every path under `rootfs` missing from `whitelist`.
///
/// An empty whitelist means nothing was deleted and leaves the tree alone.
/// Children are handled before their directory; a directory that still
/// holds whitelisted children is kept. Returns the number of paths removed.
pub fn apply_path_whitelist(rootfs: &Path, whitelist: &[String]) -> Result<usize> {
    if whitelist.is_empty() {
        return Ok(0);
    }

    let keep: HashSet<&str> = whitelist.iter().map(String::as_str).collect();
    let mut removed = 0;

    for item in WalkDir::new(rootfs).follow_links(false).contents_first(true).min_depth(1) {
        let dent = item.map_err(|e| {
            let path = e.path().unwrap_or(rootfs).to_path_buf();
            PackError::extract(path, e)
        })?;
        let rel = dent
            .path()
            .strip_prefix(rootfs)
            .map_err(|e| PackError::extract(dent.path(), e))?;
        if keep.contains(absolute(rel).as_str()) {
            continue;
        }

        let result = if dent.file_type().is_dir() {
            fs::remove_dir(dent.path())
        } else {
            fs::remove_file(dent.path())
        };

        match result {
            Ok(()) => removed += 1,
            Err(e) if matches!(e.raw_os_error(), Some(libc::ENOTEMPTY) | Some(libc::EEXIST)) => {
                tracing::warn!(
                    path = %dent.path().display(),
                    "Directory missing from whitelist still has whitelisted content, keeping it"
                );
            }
            Err(e) => return Err(PackError::extract(dent.path(), e)),
        }
    }

    tracing::debug!(rootfs = %rootfs.display(), removed, "Applied path whitelist");
    Ok(removed)
}
