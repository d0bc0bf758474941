//! Full image builder: packs every node of a root filesystem.

use std::io::Write;
use std::path::PathBuf;

use acipack_core::config::{BuildOptions, DEFAULT_COMPRESSION_LEVEL};
use acipack_core::error::Result;
use acipack_core::manifest::ImageManifest;

use crate::archive::{either, ArchiveSink, ExcludeFn, ExcludeRules, ImageWriter, Walker};

use super::{check_tree, ImageBuilder};

/// Builds an image holding the whole tree at `root`.
///
/// The resulting image is self-contained, so its manifest never carries a
/// path whitelist.
pub struct FullImageBuilder {
    root: PathBuf,
    exclude: Option<Box<ExcludeFn>>,
    compression_level: u32,
}

impl FullImageBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            exclude: None,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }

    /// Add an exclude predicate. A node is left out as soon as any of the
    /// predicates given so far excludes it.
    pub fn with_exclude(mut self, exclude: Box<ExcludeFn>) -> Self {
        self.exclude = Some(either(self.exclude.take(), exclude));
        self
    }

    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = level;
        self
    }

    /// Apply validated [`BuildOptions`]: compression level, extra exclude
    /// patterns.
    pub fn with_options(mut self, options: &BuildOptions) -> Result<Self> {
        options.validate()?;
        self.compression_level = options.compression_level;
        if !options.exclude_patterns.is_empty() {
            let rules = ExcludeRules::new(&options.exclude_patterns)?;
            self = self.with_exclude(rules.into_fn());
        }
        Ok(self)
    }
}

impl ImageBuilder for FullImageBuilder {
    fn build(&self, mut manifest: ImageManifest, out: &mut dyn Write) -> Result<()> {
        check_tree(&self.root)?;
        manifest.path_whitelist.clear();

        tracing::info!(
            root = %self.root.display(),
            name = %manifest.name,
            "Building full image"
        );

        let mut writer = ImageWriter::with_level(&manifest, out, self.compression_level)?;

        let mut walker = Walker::new(&self.root);
        if let Some(exclude) = self.exclude.as_deref() {
            walker = walker.with_exclude(exclude);
        }

        let walked = walker.walk(&mut writer);
        let closed = writer.close();
        let stats = walked?;
        closed?;

        tracing::info!(
            entries = stats.entries,
            hardlinks = stats.hardlinks,
            excluded = stats.excluded,
            "Full image built"
        );
        Ok(())
    }
}
