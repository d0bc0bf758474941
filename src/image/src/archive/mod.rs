//! Image archive construction: entry model, exclude rules, the filesystem
//! walker and the gzip tar writer.

pub mod entry;
pub mod exclude;
pub mod walker;
pub mod writer;

pub use entry::{ArchiveEntry, EntryKind, NodeInfo, NodeKind, MANIFEST_FILE, ROOTFS_DIR};
pub use exclude::{either, ExcludeFn, ExcludeRules};
pub use walker::{InodeIndex, WalkStats, Walker};
pub use writer::{ArchiveSink, ImageWriter};
