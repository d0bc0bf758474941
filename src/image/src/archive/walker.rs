//! Filesystem walker feeding an [`ArchiveSink`].
//!
//! Walks a root filesystem depth-first in file-name order and appends one
//! entry per node under `rootfs/`. Regular files sharing an inode are
//! stored once; later paths become zero-length hardlink entries pointing
//! at the first one.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use acipack_core::error::{PackError, Result};

use super::entry::{rootfs_name, ArchiveEntry, EntryKind, NodeInfo, NodeKind};
use super::exclude::ExcludeFn;
use super::writer::ArchiveSink;

/// First-seen archive path per (device, inode).
///
/// Lives for a single walk so inode numbers from different trees or runs
/// never alias.
#[derive(Debug, Default)]
pub struct InodeIndex {
    seen: HashMap<(u64, u64), PathBuf>,
}

impl InodeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Archive path already holding this node's content, if any. Otherwise
    /// remember `name` for later paths to the same inode.
    pub fn resolve(&mut self, info: &NodeInfo, name: &Path) -> Option<PathBuf> {
        if info.is_dir() || info.nlink < 2 {
            return None;
        }

        let key = (info.dev, info.ino);
        match self.seen.get(&key) {
            Some(first) if info.kind == NodeKind::Regular => Some(first.clone()),
            Some(_) => None,
            None => {
                self.seen.insert(key, name.to_path_buf());
                None
            }
        }
    }

    /// Drop the record for this node if `name` holds it, so the next path
    /// to the inode carries the content instead.
    pub fn forget(&mut self, info: &NodeInfo, name: &Path) {
        let key = (info.dev, info.ino);
        if self.seen.get(&key).is_some_and(|first| first == name) {
            self.seen.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Counters for a finished walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalkStats {
    /// Entries appended, hardlinks included
    pub entries: usize,
    /// Entries written as hardlinks
    pub hardlinks: usize,
    /// Nodes rejected by the exclude predicate
    pub excluded: usize,
    /// Nodes that disappeared while walking
    pub vanished: usize,
    /// Nodes the archive cannot represent (sockets)
    pub unsupported: usize,
}

/// One traversal of a root filesystem.
pub struct Walker<'a> {
    root: PathBuf,
    members: Option<&'a HashSet<PathBuf>>,
    exclude: Option<&'a ExcludeFn>,
    inodes: InodeIndex,
    stats: WalkStats,
}

impl<'a> Walker<'a> {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            members: None,
            exclude: None,
            inodes: InodeIndex::new(),
            stats: WalkStats::default(),
        }
    }

    /// Only visit nodes whose full path (root joined) is in `members`.
    pub fn with_members(mut self, members: &'a HashSet<PathBuf>) -> Self {
        self.members = Some(members);
        self
    }

    pub fn with_exclude(mut self, exclude: &'a ExcludeFn) -> Self {
        self.exclude = Some(exclude);
        self
    }

    /// Walk the tree and append every qualifying node to `sink`.
    ///
    /// Metadata errors abort the walk. Nodes that vanish between listing
    /// and probing are skipped.
    pub fn walk(mut self, sink: &mut dyn ArchiveSink) -> Result<WalkStats> {
        let walk = WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name();

        for item in walk {
            let dent = match item {
                Ok(dent) => dent,
                Err(err) => {
                    let path = err.path().unwrap_or(&self.root).to_path_buf();
                    if err.depth() > 0 && err.io_error().is_some_and(is_vanished) {
                        self.skip_vanished(&path);
                        continue;
                    }
                    return Err(PackError::walk(path, err));
                }
            };

            if dent.depth() == 0 {
                continue;
            }
            let path = dent.path();

            if let Some(members) = self.members {
                if !members.contains(path) {
                    continue;
                }
            }

            let md = match dent.metadata() {
                Ok(md) => md,
                Err(err) if err.io_error().is_some_and(is_vanished) => {
                    self.skip_vanished(path);
                    continue;
                }
                Err(err) => return Err(PackError::walk(path, err)),
            };
            let info = NodeInfo::from_metadata(&md);

            let rel = path
                .strip_prefix(&self.root)
                .map_err(|e| PackError::walk(path, e))?;

            if let Some(exclude) = self.exclude {
                if exclude(rel, &info)? {
                    self.stats.excluded += 1;
                    tracing::debug!(path = %rel.display(), "Excluded from image");
                    continue;
                }
            }

            if let Err(err) = self.visit(path, rel, &info, sink) {
                match err {
                    PackError::IoError(ref e) if is_vanished(e) => self.skip_vanished(path),
                    err => return Err(err),
                }
            }
        }

        Ok(self.stats)
    }

    fn visit(
        &mut self,
        path: &Path,
        rel: &Path,
        info: &NodeInfo,
        sink: &mut dyn ArchiveSink,
    ) -> Result<()> {
        let link = match info.kind {
            NodeKind::Symlink => Some(std::fs::read_link(path)?),
            _ => None,
        };

        let Some(entry) = self.entry_for(rel, info, link) else {
            self.stats.unsupported += 1;
            tracing::debug!(path = %rel.display(), "Skipping node the archive cannot represent");
            return Ok(());
        };

        let appended = match entry.kind {
            EntryKind::Regular => File::open(path)
                .map_err(PackError::from)
                .and_then(|mut file| sink.append(&entry, Some(&mut file as &mut dyn io::Read))),
            _ => sink.append(&entry, None),
        };
        if let Err(err) = appended {
            self.inodes.forget(info, &entry.name);
            return Err(err);
        }

        self.stats.entries += 1;
        if entry.kind == EntryKind::Hardlink {
            self.stats.hardlinks += 1;
        }
        Ok(())
    }

    /// Classify a node and apply hardlink dedup. `rel` is the path below
    /// the walked root; `link` the literal symlink target.
    pub fn entry_for(
        &mut self,
        rel: &Path,
        info: &NodeInfo,
        link: Option<PathBuf>,
    ) -> Option<ArchiveEntry> {
        let name = rootfs_name(rel);
        let entry = ArchiveEntry::from_node(&name, info, link)?;

        match self.inodes.resolve(info, &name) {
            Some(first) => Some(entry.into_hardlink(first)),
            None => Some(entry),
        }
    }

    fn skip_vanished(&mut self, path: &Path) {
        self.stats.vanished += 1;
        tracing::warn!(path = %path.display(), "Node vanished during walk, skipping");
    }
}

fn is_vanished(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Read;
    use tempfile::TempDir;

    /// Records appended entries and their content.
    #[derive(Default)]
    struct RecordingSink {
        entries: Vec<(ArchiveEntry, Vec<u8>)>,
    }

    impl ArchiveSink for RecordingSink {
        fn append(&mut self, entry: &ArchiveEntry, reader: Option<&mut dyn Read>) -> Result<()> {
            let mut body = Vec::new();
            if let Some(reader) = reader {
                reader.read_to_end(&mut body)?;
            }
            self.entries.push((entry.clone(), body));
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    impl RecordingSink {
        fn names(&self) -> Vec<String> {
            self.entries
                .iter()
                .map(|(e, _)| e.name.to_string_lossy().into_owned())
                .collect()
        }
    }

    fn info(kind: NodeKind, ino: u64, nlink: u64) -> NodeInfo {
        NodeInfo {
            kind,
            mode: 0o644,
            uid: 0,
            gid: 0,
            size: 11,
            mtime: 0,
            dev: 1,
            ino,
            rdev: 0,
            nlink,
        }
    }

    #[test]
    fn test_entry_for_dedups_shared_inode() {
        let mut walker = Walker::new("/unused");
        let shared = info(NodeKind::Regular, 10, 3);

        let first = walker.entry_for(Path::new("a"), &shared, None).unwrap();
        let second = walker.entry_for(Path::new("b"), &shared, None).unwrap();
        let third = walker.entry_for(Path::new("c/d"), &shared, None).unwrap();

        assert_eq!(first.kind, EntryKind::Regular);
        assert_eq!(first.size, 11);
        for link in [second, third] {
            assert_eq!(link.kind, EntryKind::Hardlink);
            assert_eq!(link.size, 0);
            assert_eq!(link.link, Some(PathBuf::from("rootfs/a")));
        }
    }

    #[test]
    fn test_entry_for_keys_on_device_and_inode() {
        let mut walker = Walker::new("/unused");
        let a = info(NodeKind::Regular, 10, 2);
        let mut b = info(NodeKind::Regular, 10, 2);
        b.dev = 2;

        walker.entry_for(Path::new("a"), &a, None).unwrap();
        let other_dev = walker.entry_for(Path::new("b"), &b, None).unwrap();
        assert_eq!(other_dev.kind, EntryKind::Regular);
    }

    #[test]
    fn test_entry_for_only_rewrites_regular_files() {
        let mut walker = Walker::new("/unused");
        let fifo = info(NodeKind::Fifo, 20, 2);
        walker.entry_for(Path::new("p1"), &fifo, None).unwrap();
        let second = walker.entry_for(Path::new("p2"), &fifo, None).unwrap();
        assert_eq!(second.kind, EntryKind::Fifo);

        let dir = info(NodeKind::Directory, 30, 5);
        walker.entry_for(Path::new("d"), &dir, None).unwrap();
        assert_eq!(walker.inodes.len(), 1);
    }

    #[test]
    fn test_walk_order_and_names() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("b/c")).unwrap();
        fs::write(root.join("b/c/file"), "x").unwrap();
        fs::write(root.join("a.txt"), "hello").unwrap();
        std::os::unix::fs::symlink("/etc/target", root.join("z")).unwrap();

        let mut sink = RecordingSink::default();
        let stats = Walker::new(root).walk(&mut sink).unwrap();

        assert_eq!(
            sink.names(),
            vec!["rootfs/a.txt", "rootfs/b", "rootfs/b/c", "rootfs/b/c/file", "rootfs/z"]
        );
        assert_eq!(stats.entries, 5);
        assert_eq!(sink.entries[0].1, b"hello");

        let (symlink, body) = &sink.entries[4];
        assert_eq!(symlink.kind, EntryKind::Symlink);
        assert_eq!(symlink.link, Some(PathBuf::from("/etc/target")));
        assert!(body.is_empty());
    }

    #[test]
    fn test_walk_hardlinks() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::write(root.join("a"), "shared").unwrap();
        fs::hard_link(root.join("a"), root.join("b")).unwrap();
        fs::hard_link(root.join("a"), root.join("c")).unwrap();

        let mut sink = RecordingSink::default();
        let stats = Walker::new(root).walk(&mut sink).unwrap();

        assert_eq!(stats.hardlinks, 2);
        let (first, body) = &sink.entries[0];
        assert_eq!(first.kind, EntryKind::Regular);
        assert_eq!(body, b"shared");
        for (entry, body) in &sink.entries[1..] {
            assert_eq!(entry.kind, EntryKind::Hardlink);
            assert_eq!(entry.link, Some(PathBuf::from("rootfs/a")));
            assert!(body.is_empty());
        }
    }

    #[test]
    fn test_walk_with_members() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir(root.join("etc")).unwrap();
        fs::write(root.join("etc/keep"), "1").unwrap();
        fs::write(root.join("etc/drop"), "2").unwrap();

        let members: HashSet<PathBuf> = [root.join("etc/keep")].into_iter().collect();
        let mut sink = RecordingSink::default();
        Walker::new(root)
            .with_members(&members)
            .walk(&mut sink)
            .unwrap();

        assert_eq!(sink.names(), vec!["rootfs/etc/keep"]);
    }

    #[test]
    fn test_walk_with_exclude_does_not_prune() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("dev/pts")).unwrap();
        fs::create_dir(root.join("etc")).unwrap();

        let exclude = |rel: &Path, _: &NodeInfo| -> Result<bool> { Ok(rel == Path::new("dev")) };
        let mut sink = RecordingSink::default();
        let stats = Walker::new(root)
            .with_exclude(&exclude)
            .walk(&mut sink)
            .unwrap();

        assert_eq!(sink.names(), vec!["rootfs/dev/pts", "rootfs/etc"]);
        assert_eq!(stats.excluded, 1);
    }

    #[test]
    fn test_walk_exclude_error_aborts() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a"), "1").unwrap();

        let exclude =
            |_: &Path, _: &NodeInfo| -> Result<bool> { Err(PackError::Other("nope".to_string())) };
        let mut sink = RecordingSink::default();
        let result = Walker::new(tmp.path()).with_exclude(&exclude).walk(&mut sink);
        assert!(result.is_err());
    }

    #[test]
    fn test_forget_releases_first_path() {
        let mut walker = Walker::new("/unused");
        let shared = info(NodeKind::Regular, 10, 3);

        let first = walker.entry_for(Path::new("a"), &shared, None).unwrap();
        walker.inodes.forget(&shared, Path::new("rootfs/other"));
        assert_eq!(walker.inodes.len(), 1);

        walker.inodes.forget(&shared, &first.name);
        let next = walker.entry_for(Path::new("b"), &shared, None).unwrap();
        assert_eq!(next.kind, EntryKind::Regular);
        let last = walker.entry_for(Path::new("c"), &shared, None).unwrap();
        assert_eq!(last.link, Some(PathBuf::from("rootfs/b")));
    }

    #[test]
    fn test_walk_vanished_first_link_moves_content() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        fs::write(root.join("a"), "shared").unwrap();
        fs::hard_link(root.join("a"), root.join("b")).unwrap();
        fs::hard_link(root.join("a"), root.join("c")).unwrap();

        // Removes `a` after it was stat'ed but before it is opened.
        let doomed = root.join("a");
        let exclude = move |rel: &Path, _: &NodeInfo| -> Result<bool> {
            if rel == Path::new("a") {
                fs::remove_file(&doomed)?;
            }
            Ok(false)
        };

        let mut sink = RecordingSink::default();
        let stats = Walker::new(&root)
            .with_exclude(&exclude)
            .walk(&mut sink)
            .unwrap();

        assert_eq!(sink.names(), vec!["rootfs/b", "rootfs/c"]);
        let (b, body) = &sink.entries[0];
        assert_eq!(b.kind, EntryKind::Regular);
        assert_eq!(body, b"shared");
        let (c, _) = &sink.entries[1];
        assert_eq!(c.kind, EntryKind::Hardlink);
        assert_eq!(c.link, Some(PathBuf::from("rootfs/b")));
        assert_eq!(
            stats,
            WalkStats {
                entries: 2,
                hardlinks: 1,
                vanished: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_walk_missing_root_fails() {
        let mut sink = RecordingSink::default();
        let err = Walker::new("/nonexistent_root_12345")
            .walk(&mut sink)
            .unwrap_err();
        assert!(matches!(err, PackError::WalkError { .. }));
    }
}
