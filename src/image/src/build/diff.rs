//! Diff image builder.
//!
//! Packs only what was added or modified in `new` relative to `base`. The
//! archive format has no way to record a deletion, so when anything was
//! deleted the manifest gets a path whitelist listing every path still
//! present in `new`; consumers prune base paths missing from it. An empty
//! whitelist always means "nothing deleted".

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use acipack_core::config::{BuildOptions, WhitelistSource, DEFAULT_COMPRESSION_LEVEL};
use acipack_core::error::{PackError, Result};
use acipack_core::manifest::ImageManifest;

use crate::archive::{either, ArchiveSink, ExcludeFn, ExcludeRules, ImageWriter, Walker};

use super::differ::{absolute, ChangeSet, Differ, SnapshotDiffer};
use super::{check_tree, ImageBuilder};

pub struct DiffImageBuilder {
    base: PathBuf,
    new: PathBuf,
    exclude: Option<Box<ExcludeFn>>,
    differ: Box<dyn Differ>,
    whitelist_source: WhitelistSource,
    compression_level: u32,
}

impl DiffImageBuilder {
    pub fn new(base: impl Into<PathBuf>, new: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            new: new.into(),
            exclude: None,
            differ: Box::new(SnapshotDiffer::new()),
            whitelist_source: WhitelistSource::default(),
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }

    /// Add an exclude predicate. A node is left out as soon as any of the
    /// predicates given so far excludes it.
    pub fn with_exclude(mut self, exclude: Box<ExcludeFn>) -> Self {
        self.exclude = Some(either(self.exclude.take(), exclude));
        self
    }

    pub fn with_differ(mut self, differ: Box<dyn Differ>) -> Self {
        self.differ = differ;
        self
    }

    pub fn with_whitelist_source(mut self, source: WhitelistSource) -> Self {
        self.whitelist_source = source;
        self
    }

    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = level;
        self
    }

    /// Apply validated [`BuildOptions`]: compression level, extra exclude
    /// patterns and whitelist source.
    pub fn with_options(mut self, options: &BuildOptions) -> Result<Self> {
        options.validate()?;
        self.compression_level = options.compression_level;
        self.whitelist_source = options.whitelist_source;
        if !options.exclude_patterns.is_empty() {
            let rules = ExcludeRules::new(&options.exclude_patterns)?;
            self = self.with_exclude(rules.into_fn());
        }
        Ok(self)
    }

    /// Whitelist for `changes`; empty when nothing was deleted.
    ///
    /// Any failure here must abort the build: a partial whitelist would
    /// make consumers delete live files.
    fn whitelist(&self, changes: &ChangeSet) -> Result<Vec<String>> {
        if !changes.has_deletions() {
            return Ok(Vec::new());
        }

        match self.whitelist_source {
            WhitelistSource::Rewalk => list_tree(&self.new),
            WhitelistSource::ChangeSet => Ok(changes.whitelist()),
        }
    }
}

impl ImageBuilder for DiffImageBuilder {
    fn build(&self, mut manifest: ImageManifest, out: &mut dyn Write) -> Result<()> {
        check_tree(&self.base)?;
        check_tree(&self.new)?;

        let changes = self.differ.diff(&self.base, &self.new)?;
        let members: HashSet<PathBuf> = changes.members().map(|p| self.new.join(p)).collect();

        manifest.path_whitelist = self.whitelist(&changes)?;

        tracing::info!(
            base = %self.base.display(),
            new = %self.new.display(),
            name = %manifest.name,
            changed = members.len(),
            whitelist = manifest.path_whitelist.len(),
            "Building diff image"
        );

        let mut writer = ImageWriter::with_level(&manifest, out, self.compression_level)?;

        let mut walker = Walker::new(&self.new).with_members(&members);
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
            "Diff image built"
        );
        Ok(())
    }
}

/// Every path of the tree at `root`, `/`-rooted, the root itself included.
fn list_tree(root: &Path) -> Result<Vec<String>> {
    let mut paths = Vec::new();

    for item in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let dent = item.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            PackError::walk(path, format!("cannot list tree for whitelist: {}", e))
        })?;
        let rel = dent
            .path()
            .strip_prefix(root)
            .map_err(|e| PackError::walk(dent.path(), e))?;
        paths.push(absolute(rel));
    }

    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::differ::{Change, ChangeType};
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::TempDir;

    /// Differ returning a fixed change set.
    struct FixedDiffer(Vec<Change>);

    impl Differ for FixedDiffer {
        fn diff(&self, _base: &Path, _new: &Path) -> Result<ChangeSet> {
            Ok(self.0.iter().cloned().collect())
        }
    }

    struct FailingDiffer;

    impl Differ for FailingDiffer {
        fn diff(&self, base: &Path, _new: &Path) -> Result<ChangeSet> {
            Err(PackError::diff(base, "boom"))
        }
    }

    fn read_image(data: &[u8]) -> (ImageManifest, Vec<String>) {
        let mut archive = tar::Archive::new(GzDecoder::new(data));
        let mut manifest = None;
        let mut names = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            if name == "manifest" {
                let mut json = Vec::new();
                entry.read_to_end(&mut json).unwrap();
                manifest = Some(ImageManifest::from_json(&json).unwrap());
            } else {
                names.push(name);
            }
        }
        (manifest.unwrap(), names)
    }

    fn trees() -> (TempDir, TempDir) {
        let base = TempDir::new().unwrap();
        let new = TempDir::new().unwrap();
        std::fs::create_dir(new.path().join("etc")).unwrap();
        std::fs::write(new.path().join("etc/hosts"), "10.0.0.1").unwrap();
        std::fs::write(new.path().join("added"), "new").unwrap();
        (base, new)
    }

    #[test]
    fn test_members_only() {
        let (base, new) = trees();
        let differ = FixedDiffer(vec![
            Change::new("etc", ChangeType::Unchanged),
            Change::new("etc/hosts", ChangeType::Modified),
            Change::new("added", ChangeType::Added),
        ]);

        let mut out = Vec::new();
        DiffImageBuilder::new(base.path(), new.path())
            .with_differ(Box::new(differ))
            .build(ImageManifest::new("example.com/diff"), &mut out)
            .unwrap();

        let (manifest, names) = read_image(&out);
        assert_eq!(names, vec!["rootfs/added", "rootfs/etc/hosts"]);
        assert!(manifest.path_whitelist.is_empty());
    }

    #[test]
    fn test_deletion_rewalks_new_tree() {
        let (base, new) = trees();
        let differ = FixedDiffer(vec![
            Change::new("added", ChangeType::Added),
            Change::new("gone", ChangeType::Deleted),
        ]);

        let mut out = Vec::new();
        DiffImageBuilder::new(base.path(), new.path())
            .with_differ(Box::new(differ))
            .build(ImageManifest::new("example.com/diff"), &mut out)
            .unwrap();

        let (manifest, names) = read_image(&out);
        assert_eq!(names, vec!["rootfs/added"]);
        assert_eq!(
            manifest.path_whitelist,
            vec!["/", "/added", "/etc", "/etc/hosts"]
        );
    }

    #[test]
    fn test_deletion_whitelist_from_change_set() {
        let (base, new) = trees();
        let differ = FixedDiffer(vec![
            Change::new("etc", ChangeType::Unchanged),
            Change::new("added", ChangeType::Added),
            Change::new("gone", ChangeType::Deleted),
        ]);

        let mut out = Vec::new();
        DiffImageBuilder::new(base.path(), new.path())
            .with_differ(Box::new(differ))
            .with_whitelist_source(WhitelistSource::ChangeSet)
            .build(ImageManifest::new("example.com/diff"), &mut out)
            .unwrap();

        let (manifest, _) = read_image(&out);
        assert_eq!(manifest.path_whitelist, vec!["/", "/added", "/etc"]);
    }

    #[test]
    fn test_with_options() {
        let (base, new) = trees();
        let differ = FixedDiffer(vec![
            Change::new("etc/hosts", ChangeType::Modified),
            Change::new("added", ChangeType::Added),
            Change::new("gone", ChangeType::Deleted),
        ]);
        let options = BuildOptions {
            compression_level: 1,
            whitelist_source: WhitelistSource::ChangeSet,
            exclude_patterns: vec!["^etc/".to_string()],
        };

        let mut out = Vec::new();
        DiffImageBuilder::new(base.path(), new.path())
            .with_differ(Box::new(differ))
            .with_options(&options)
            .unwrap()
            .build(ImageManifest::new("example.com/diff"), &mut out)
            .unwrap();

        let (manifest, names) = read_image(&out);
        assert_eq!(names, vec!["rootfs/added"]);
        // taken from the change set, which never listed `etc`; exclude
        // rules do not touch the whitelist
        assert_eq!(manifest.path_whitelist, vec!["/", "/added", "/etc/hosts"]);
    }

    #[test]
    fn test_with_options_rejects_invalid() {
        let (base, new) = trees();
        let options = BuildOptions {
            compression_level: 10,
            ..Default::default()
        };
        let result = DiffImageBuilder::new(base.path(), new.path()).with_options(&options);
        assert!(matches!(result, Err(PackError::ConfigError(_))));

        let options = BuildOptions {
            exclude_patterns: vec!["(".to_string()],
            ..Default::default()
        };
        let result = DiffImageBuilder::new(base.path(), new.path()).with_options(&options);
        assert!(matches!(result, Err(PackError::ConfigError(_))));
    }

    #[test]
    fn test_differ_failure_writes_nothing() {
        let (base, new) = trees();
        let mut out = Vec::new();
        let result = DiffImageBuilder::new(base.path(), new.path())
            .with_differ(Box::new(FailingDiffer))
            .build(ImageManifest::new("example.com/diff"), &mut out);

        assert!(matches!(result, Err(PackError::DiffError { .. })));
        assert!(out.is_empty());
    }

    #[test]
    fn test_list_tree_missing_root() {
        let err = list_tree(Path::new("/nonexistent_root_12345")).unwrap_err();
        assert!(matches!(err, PackError::WalkError { .. }));
    }
}
