//! Container image archives.
//!
//! An image is a gzip-compressed tar stream: a JSON `manifest` entry first,
//! then the root filesystem under `rootfs/`. This crate builds such images
//! from a directory tree, either in full or as the difference against a
//! base tree, and unpacks images (gzip, bzip2, xz or plain tar) back onto
//! disk.
//!
//! ```rust,ignore
//! use acipack_image::build::{build_to_path, FullImageBuilder};
//! use acipack_image::archive::ExcludeRules;
//!
//! let exclude = ExcludeRules::for_layout(&Default::default())?.into_fn();
//! let builder = FullImageBuilder::new("/").with_exclude(exclude);
//! let info = build_to_path(&builder, manifest, Path::new("/baci/dest/image.aci"))?;
//! ```

pub mod archive;
pub mod build;
pub mod extract;

pub use archive::{ArchiveEntry, ArchiveSink, ExcludeFn, ExcludeRules, ImageWriter, Walker};
pub use build::{
    build_to_path, compose_manifest, AppSource, ChangeSet, ChangeType, DiffImageBuilder, Differ,
    FullImageBuilder, ImageBuilder, ImageInfo, SnapshotDiffer,
};
pub use extract::{
    apply_path_whitelist, extract_image, extract_rootfs, extract_tar, open_image, Decompressor,
    DetectedFormat, ExternalDecoder, XzProcess,
};
