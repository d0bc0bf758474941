//! Filesystem tree comparison.
//!
//! A [`Differ`] classifies every path of two trees as Added, Modified,
//! Deleted or Unchanged. [`SnapshotDiffer`] does it by capturing both trees
//! and comparing node metadata.

use std::collections::BTreeMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use acipack_core::error::{PackError, Result};

use crate::archive::entry::{NodeInfo, NodeKind};

/// How a path differs between the base and the new tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
    Unchanged,
}

/// One classified path, relative to the tree roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub path: PathBuf,
    pub change_type: ChangeType,
}

impl Change {
    pub fn new(path: impl Into<PathBuf>, change_type: ChangeType) -> Self {
        Self {
            path: path.into(),
            change_type,
        }
    }
}

/// Result of comparing two trees, ordered by path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    pub fn new(changes: Vec<Change>) -> Self {
        Self { changes }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Paths whose content belongs in a diff image (Added or Modified).
    pub fn members(&self) -> impl Iterator<Item = &Path> {
        self.changes
            .iter()
            .filter(|c| matches!(c.change_type, ChangeType::Added | ChangeType::Modified))
            .map(|c| c.path.as_path())
    }

    pub fn has_deletions(&self) -> bool {
        self.changes
            .iter()
            .any(|c| c.change_type == ChangeType::Deleted)
    }

    /// Absolute listing of every path still present in the new tree, the
    /// root included. Only as complete as the comparison itself.
    pub fn whitelist(&self) -> Vec<String> {
        let mut paths = vec!["/".to_string()];
        paths.extend(
            self.changes
                .iter()
                .filter(|c| c.change_type != ChangeType::Deleted)
                .map(|c| absolute(&c.path)),
        );
        paths
    }

    pub fn count(&self, change_type: ChangeType) -> usize {
        self.changes
            .iter()
            .filter(|c| c.change_type == change_type)
            .count()
    }
}

impl FromIterator<Change> for ChangeSet {
    fn from_iter<I: IntoIterator<Item = Change>>(iter: I) -> Self {
        let mut changes: Vec<Change> = iter.into_iter().collect();
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        Self { changes }
    }
}

/// `/`-rooted form of a tree-relative path.
pub(crate) fn absolute(rel: &Path) -> String {
    Path::new("/").join(rel).to_string_lossy().into_owned()
}

/// Compares two filesystem trees.
pub trait Differ: Send + Sync {
    fn diff(&self, base: &Path, new: &Path) -> Result<ChangeSet>;
}

/// Attributes compared between the two trees for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
struct NodeState {
    kind: NodeKind,
    mode: u32,
    uid: u32,
    gid: u32,
    size: u64,
    mtime: i64,
    mtime_nsec: i64,
    link: Option<PathBuf>,
    rdev: u64,
}

/// Metadata snapshot of one tree.
#[derive(Debug, Clone, Default)]
struct TreeSnapshot {
    entries: BTreeMap<PathBuf, NodeState>,
}

impl TreeSnapshot {
    fn capture(root: &Path) -> Result<Self> {
        let mut entries = BTreeMap::new();

        for item in WalkDir::new(root).follow_links(false).min_depth(1) {
            let dent = item.map_err(|e| {
                let path = e.path().unwrap_or(root).to_path_buf();
                PackError::diff(path, e)
            })?;
            let path = dent.path();
            let md = dent.metadata().map_err(|e| PackError::diff(path, e))?;
            let info = NodeInfo::from_metadata(&md);

            let link = if info.kind == NodeKind::Symlink {
                Some(std::fs::read_link(path).map_err(|e| PackError::diff(path, e))?)
            } else {
                None
            };

            let relative = path
                .strip_prefix(root)
                .map_err(|e| PackError::diff(path, e))?
                .to_path_buf();

            entries.insert(
                relative,
                NodeState {
                    kind: info.kind,
                    mode: info.mode,
                    uid: info.uid,
                    gid: info.gid,
                    // Directory sizes depend on the filesystem, not the content
                    size: if info.is_dir() { 0 } else { info.size },
                    mtime: info.mtime,
                    mtime_nsec: md.mtime_nsec(),
                    link,
                    rdev: info.rdev,
                },
            );
        }

        Ok(Self { entries })
    }

    fn diff(&self, after: &TreeSnapshot) -> ChangeSet {
        let mut changes = Vec::with_capacity(after.entries.len());

        for (path, after_state) in &after.entries {
            let change_type = match self.entries.get(path) {
                None => ChangeType::Added,
                Some(before_state) if before_state != after_state => ChangeType::Modified,
                Some(_) => ChangeType::Unchanged,
            };
            changes.push(Change::new(path, change_type));
        }

        for path in self.entries.keys() {
            if !after.entries.contains_key(path) {
                changes.push(Change::new(path, ChangeType::Deleted));
            }
        }

        changes.into_iter().collect()
    }
}

/// [`Differ`] comparing `lstat` metadata of both trees: node type,
/// permissions, ownership, size, modification time, symlink target and
/// device number.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotDiffer;

impl SnapshotDiffer {
    pub fn new() -> Self {
        Self
    }
}

impl Differ for SnapshotDiffer {
    fn diff(&self, base: &Path, new: &Path) -> Result<ChangeSet> {
        let before = TreeSnapshot::capture(base)?;
        let after = TreeSnapshot::capture(new)?;
        let changes = before.diff(&after);

        tracing::debug!(
            base = %base.display(),
            new = %new.display(),
            added = changes.count(ChangeType::Added),
            modified = changes.count(ChangeType::Modified),
            deleted = changes.count(ChangeType::Deleted),
            "Compared trees"
        );

        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn kinds(changes: &ChangeSet) -> Vec<(String, ChangeType)> {
        changes
            .iter()
            .map(|c| (c.path.to_string_lossy().into_owned(), c.change_type))
            .collect()
    }

    /// Two trees with identical content and identical timestamps.
    fn twin_trees() -> (TempDir, TempDir) {
        let base = TempDir::new().unwrap();
        fs::create_dir(base.path().join("etc")).unwrap();
        fs::write(base.path().join("etc/hosts"), "127.0.0.1 localhost").unwrap();

        let new = TempDir::new().unwrap();
        fs::create_dir(new.path().join("etc")).unwrap();
        fs::write(new.path().join("etc/hosts"), "127.0.0.1 localhost").unwrap();

        sync_times(base.path(), new.path());
        (base, new)
    }

    /// Copy modification times from `from` to the same paths under `to`.
    fn sync_times(from: &Path, to: &Path) {
        let mut paths: Vec<PathBuf> = WalkDir::new(from)
            .min_depth(1)
            .into_iter()
            .map(|e| e.unwrap().path().strip_prefix(from).unwrap().to_path_buf())
            .collect();
        // Children first so setting a file's time doesn't disturb its directory
        paths.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
        for rel in paths {
            if let Ok(md) = fs::symlink_metadata(from.join(&rel)) {
                let file = fs::File::open(to.join(&rel)).unwrap();
                file.set_modified(md.modified().unwrap()).unwrap();
            }
        }
    }

    #[test]
    fn test_identical_trees_are_unchanged() {
        let (base, new) = twin_trees();
        let changes = SnapshotDiffer::new().diff(base.path(), new.path()).unwrap();
        assert_eq!(
            kinds(&changes),
            vec![
                ("etc".to_string(), ChangeType::Unchanged),
                ("etc/hosts".to_string(), ChangeType::Unchanged),
            ]
        );
        assert_eq!(changes.members().count(), 0);
        assert!(!changes.has_deletions());
    }

    #[test]
    fn test_added_modified_deleted() {
        let (base, new) = twin_trees();
        fs::write(base.path().join("gone"), "x").unwrap();
        fs::write(new.path().join("etc/hosts"), "10.0.0.1 other").unwrap();
        fs::write(new.path().join("fresh"), "y").unwrap();

        let changes = SnapshotDiffer::new().diff(base.path(), new.path()).unwrap();
        let got = kinds(&changes);

        assert!(got.contains(&("fresh".to_string(), ChangeType::Added)));
        assert!(got.contains(&("etc/hosts".to_string(), ChangeType::Modified)));
        assert!(got.contains(&("gone".to_string(), ChangeType::Deleted)));
        assert!(changes.has_deletions());

        let members: Vec<&Path> = changes.members().collect();
        assert!(members.contains(&Path::new("fresh")));
        assert!(members.contains(&Path::new("etc/hosts")));
        assert!(!members.contains(&Path::new("gone")));
    }

    #[test]
    fn test_changes_are_sorted() {
        let (base, new) = twin_trees();
        fs::write(new.path().join("b"), "").unwrap();
        fs::write(new.path().join("a"), "").unwrap();
        fs::write(base.path().join("c"), "").unwrap();

        let changes = SnapshotDiffer::new().diff(base.path(), new.path()).unwrap();
        let paths: Vec<PathBuf> = changes.iter().map(|c| c.path.clone()).collect();
        let mut sorted = paths.clone();
        sorted.sort();
        assert_eq!(paths, sorted);
    }

    #[test]
    fn test_symlink_target_change_is_modified() {
        let (base, new) = twin_trees();
        std::os::unix::fs::symlink("/a", base.path().join("link")).unwrap();
        std::os::unix::fs::symlink("/b", new.path().join("link")).unwrap();

        let changes = SnapshotDiffer::new().diff(base.path(), new.path()).unwrap();
        assert!(kinds(&changes).contains(&("link".to_string(), ChangeType::Modified)));
    }

    #[test]
    fn test_mode_change_is_modified() {
        use std::os::unix::fs::PermissionsExt;

        let (base, new) = twin_trees();
        fs::set_permissions(new.path().join("etc/hosts"), fs::Permissions::from_mode(0o600))
            .unwrap();
        fs::set_permissions(base.path().join("etc/hosts"), fs::Permissions::from_mode(0o644))
            .unwrap();

        let changes = SnapshotDiffer::new().diff(base.path(), new.path()).unwrap();
        assert!(kinds(&changes).contains(&("etc/hosts".to_string(), ChangeType::Modified)));
    }

    #[test]
    fn test_whitelist_from_changes() {
        let changes: ChangeSet = vec![
            Change::new("usr", ChangeType::Unchanged),
            Change::new("etc", ChangeType::Modified),
            Change::new("old", ChangeType::Deleted),
            Change::new("etc/new", ChangeType::Added),
        ]
        .into_iter()
        .collect();

        assert_eq!(changes.whitelist(), vec!["/", "/etc", "/etc/new", "/usr"]);
    }

    #[test]
    fn test_missing_base_is_diff_error() {
        let new = TempDir::new().unwrap();
        let err = SnapshotDiffer::new()
            .diff(Path::new("/nonexistent_base_12345"), new.path())
            .unwrap_err();
        assert!(matches!(err, PackError::DiffError { .. }));
        assert!(err.to_string().contains("nonexistent_base_12345"));
    }
}
