//! Archive entry model.
//!
//! [`NodeInfo`] is what the walker learns about a filesystem node from
//! `lstat`; [`ArchiveEntry`] is what ends up in the image archive.

use std::fs::Metadata;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use acipack_core::error::{PackError, Result};

/// Name of the manifest entry at the head of every image.
pub const MANIFEST_FILE: &str = "manifest";

/// Directory that holds the root filesystem inside an image.
pub const ROOTFS_DIR: &str = "rootfs";

/// Filesystem node type as reported by `lstat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

/// Portable snapshot of a node's `lstat` metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub kind: NodeKind,
    /// Permission bits plus setuid/setgid/sticky
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// Modification time, seconds since the epoch
    pub mtime: i64,
    pub dev: u64,
    pub ino: u64,
    pub rdev: u64,
    pub nlink: u64,
}

impl NodeInfo {
    pub fn from_metadata(md: &Metadata) -> Self {
        let ft = md.file_type();
        let kind = if ft.is_dir() {
            NodeKind::Directory
        } else if ft.is_symlink() {
            NodeKind::Symlink
        } else if ft.is_block_device() {
            NodeKind::BlockDevice
        } else if ft.is_char_device() {
            NodeKind::CharDevice
        } else if ft.is_fifo() {
            NodeKind::Fifo
        } else if ft.is_socket() {
            NodeKind::Socket
        } else {
            NodeKind::Regular
        };

        Self {
            kind,
            mode: md.mode() & 0o7777,
            uid: md.uid(),
            gid: md.gid(),
            size: md.len(),
            mtime: md.mtime(),
            dev: md.dev(),
            ino: md.ino(),
            rdev: md.rdev(),
            nlink: md.nlink(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }
}

/// Type of an archive entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    Hardlink,
    BlockDevice,
    CharDevice,
    Fifo,
}

impl EntryKind {
    /// Archive type for a node, `None` for nodes that cannot be archived (sockets).
    pub fn from_node(kind: NodeKind) -> Option<Self> {
        match kind {
            NodeKind::Regular => Some(EntryKind::Regular),
            NodeKind::Directory => Some(EntryKind::Directory),
            NodeKind::Symlink => Some(EntryKind::Symlink),
            NodeKind::BlockDevice => Some(EntryKind::BlockDevice),
            NodeKind::CharDevice => Some(EntryKind::CharDevice),
            NodeKind::Fifo => Some(EntryKind::Fifo),
            NodeKind::Socket => None,
        }
    }

    pub fn entry_type(self) -> tar::EntryType {
        match self {
            EntryKind::Regular => tar::EntryType::Regular,
            EntryKind::Directory => tar::EntryType::Directory,
            EntryKind::Symlink => tar::EntryType::Symlink,
            EntryKind::Hardlink => tar::EntryType::Link,
            EntryKind::BlockDevice => tar::EntryType::Block,
            EntryKind::CharDevice => tar::EntryType::Char,
            EntryKind::Fifo => tar::EntryType::Fifo,
        }
    }

    pub fn is_link(self) -> bool {
        matches!(self, EntryKind::Symlink | EntryKind::Hardlink)
    }

    pub fn is_device(self) -> bool {
        matches!(self, EntryKind::BlockDevice | EntryKind::CharDevice)
    }
}

/// One entry of an image archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Path inside the archive (e.g. `rootfs/usr/bin/ls`)
    pub name: PathBuf,
    pub kind: EntryKind,
    pub mode: u32,
    /// Content length; zero for everything but regular files
    pub size: u64,
    pub uid: u64,
    pub gid: u64,
    pub mtime: u64,
    /// Symlink target (literal) or hardlink target (archive path)
    pub link: Option<PathBuf>,
    pub dev_major: u32,
    pub dev_minor: u32,
    pub user_name: Option<String>,
    pub group_name: Option<String>,
}

impl ArchiveEntry {
    /// Entry describing `info`, stored under `name`.
    ///
    /// Returns `None` for node types the archive cannot carry.
    pub fn from_node(name: impl Into<PathBuf>, info: &NodeInfo, link: Option<PathBuf>) -> Option<Self> {
        let kind = EntryKind::from_node(info.kind)?;
        let (dev_major, dev_minor) = if kind.is_device() {
            (major(info.rdev), minor(info.rdev))
        } else {
            (0, 0)
        };

        Some(Self {
            name: name.into(),
            kind,
            mode: info.mode,
            size: if kind == EntryKind::Regular { info.size } else { 0 },
            uid: u64::from(info.uid),
            gid: u64::from(info.gid),
            mtime: info.mtime.max(0) as u64,
            link: if kind == EntryKind::Symlink { link } else { None },
            dev_major,
            dev_minor,
            user_name: None,
            group_name: None,
        })
    }

    /// Regular file entry with the given content length.
    pub fn file(name: impl Into<PathBuf>, mode: u32, size: u64) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Regular,
            mode,
            size,
            uid: 0,
            gid: 0,
            mtime: 0,
            link: None,
            dev_major: 0,
            dev_minor: 0,
            user_name: None,
            group_name: None,
        }
    }

    /// Turn this entry into a content-less hardlink to `target`.
    pub fn into_hardlink(mut self, target: impl Into<PathBuf>) -> Self {
        self.kind = EntryKind::Hardlink;
        self.link = Some(target.into());
        self.size = 0;
        self
    }

    /// Build the tar header for this entry. Path and link name are set by
    /// the writer so long names get their extension records.
    pub fn to_header(&self) -> Result<tar::Header> {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(self.kind.entry_type());
        header.set_mode(self.mode & 0o7777);
        header.set_uid(self.uid);
        header.set_gid(self.gid);
        header.set_mtime(self.mtime);
        header.set_size(self.size);

        if let Some(user) = &self.user_name {
            header.set_username(user).map_err(|e| header_error(&self.name, e))?;
        }
        if let Some(group) = &self.group_name {
            header.set_groupname(group).map_err(|e| header_error(&self.name, e))?;
        }
        if self.kind.is_device() {
            header
                .set_device_major(self.dev_major)
                .map_err(|e| header_error(&self.name, e))?;
            header
                .set_device_minor(self.dev_minor)
                .map_err(|e| header_error(&self.name, e))?;
        }

        Ok(header)
    }
}

fn header_error(name: &Path, err: std::io::Error) -> PackError {
    PackError::ArchiveError(format!("invalid header for {}: {}", name.display(), err))
}

/// Archive path of a node given its path relative to the tree root.
pub fn rootfs_name(rel: &Path) -> PathBuf {
    Path::new(ROOTFS_DIR).join(rel)
}

// Device numbers use the glibc encoding (12-bit major / 20-bit minor split
// across the low and high halves).

pub fn major(dev: u64) -> u32 {
    (((dev >> 8) & 0xfff) | ((dev >> 32) & !0xfff)) as u32
}

pub fn minor(dev: u64) -> u32 {
    ((dev & 0xff) | ((dev >> 12) & !0xff)) as u32
}

pub fn makedev(major: u32, minor: u32) -> u64 {
    let (major, minor) = (u64::from(major), u64::from(minor));
    (minor & 0xff) | ((major & 0xfff) << 8) | ((minor & !0xff) << 12) | ((major & !0xfff) << 32)
}
