//! Tar replay onto disk.
//!
//! Entries are recreated one by one with their recorded mode, ownership and
//! modification time. The process umask is forced to zero for the whole
//! call so recorded permission bits apply verbatim.

use std::collections::HashSet;
use std::ffi::CString;
use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{self, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tar::EntryType;

use acipack_core::error::{PackError, Result};

use crate::archive::entry::{makedev, ROOTFS_DIR};

static UMASK_LOCK: Mutex<()> = Mutex::new(());

/// Sets the process umask and restores the previous one on drop.
///
/// The umask is process-wide; guards serialize on a global lock so two
/// extractions never interleave their masks.
pub struct UmaskGuard {
    previous: libc::mode_t,
    _lock: MutexGuard<'static, ()>,
}

impl UmaskGuard {
    pub fn new(mask: libc::mode_t) -> Self {
        let lock = UMASK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        // SAFETY: umask cannot fail and only swaps the process file mode mask
        let previous = unsafe { libc::umask(mask) };
        Self {
            previous,
            _lock: lock,
        }
    }
}

impl Drop for UmaskGuard {
    fn drop(&mut self) {
        // SAFETY: see UmaskGuard::new
        unsafe {
            libc::umask(self.previous);
        }
    }
}

/// Which entries to replay and under which name.
enum Selection<'a> {
    /// Every entry, optionally only those whose archive path is listed
    All(Option<&'a HashSet<PathBuf>>),
    /// Only entries under `rootfs/`, with that prefix stripped
    RootFs,
}

impl Selection<'_> {
    /// Destination-relative name and hardlink target for an entry, `None`
    /// when the entry is skipped.
    fn rename(
        &self,
        path: &Path,
        link: Option<&Path>,
        kind: EntryType,
    ) -> Result<Option<(PathBuf, Option<PathBuf>)>> {
        match self {
            Selection::All(filter) => {
                if let Some(filter) = filter {
                    if !filter.contains(path) {
                        return Ok(None);
                    }
                }
                Ok(Some((path.to_path_buf(), link.map(Path::to_path_buf))))
            }
            Selection::RootFs => {
                let Ok(name) = path.strip_prefix(ROOTFS_DIR) else {
                    return Ok(None);
                };
                if name.as_os_str().is_empty() {
                    return Ok(None);
                }

                let link = match (kind, link) {
                    (EntryType::Link, Some(target)) => Some(
                        target
                            .strip_prefix(ROOTFS_DIR)
                            .map_err(|_| {
                                PackError::extract(
                                    path,
                                    format!("hardlink target {} is outside rootfs", target.display()),
                                )
                            })?
                            .to_path_buf(),
                    ),
                    (_, link) => link.map(Path::to_path_buf),
                };
                Ok(Some((name.to_path_buf(), link)))
            }
        }
    }
}

/// Replay every entry of a tar stream into `dest`.
///
/// With a `filter`, only entries whose archive path is in it are
/// extracted. With `overwrite`, existing nodes are replaced (directories
/// are kept when the entry is a directory too); without it an existing
/// node is an error.
pub fn extract_tar<R: Read>(
    reader: R,
    dest: &Path,
    overwrite: bool,
    filter: Option<&HashSet<PathBuf>>,
) -> Result<()> {
    replay(reader, dest, overwrite, Selection::All(filter))
}

/// Replay only the `rootfs/` subtree of an image into `dest`, stripping
/// the prefix from names and hardlink targets. The manifest and anything
/// else outside `rootfs/` is skipped.
pub fn extract_rootfs<R: Read>(reader: R, dest: &Path, overwrite: bool) -> Result<()> {
    replay(reader, dest, overwrite, Selection::RootFs)
}

fn replay<R: Read>(reader: R, dest: &Path, overwrite: bool, selection: Selection<'_>) -> Result<()> {
    let _umask = UmaskGuard::new(0);
    let is_root = unsafe { libc::geteuid() } == 0;

    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| PackError::extract(dest, format!("cannot read archive: {}", e)))?;

    let mut dir_times = Vec::new();
    let mut count = 0usize;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| PackError::extract(dest, format!("cannot read archive: {}", e)))?;

        let raw_path = entry
            .path()
            .map_err(|e| PackError::extract(dest, format!("invalid entry path: {}", e)))?
            .into_owned();
        let kind = entry.header().entry_type();
        if matches!(
            kind,
            EntryType::XGlobalHeader | EntryType::XHeader | EntryType::GNULongName | EntryType::GNULongLink
        ) {
            continue;
        }

        let raw_link = entry
            .link_name()
            .map_err(|e| PackError::extract(&raw_path, format!("invalid link name: {}", e)))?
            .map(|l| l.into_owned());

        let Some((name, link)) = selection.rename(&raw_path, raw_link.as_deref(), kind)? else {
            continue;
        };
        let name = confine(&name).ok_or_else(|| PackError::extract(&raw_path, "insecure path"))?;
        if name.as_os_str().is_empty() {
            continue;
        }

        let meta = EntryMeta::from_header(entry.header(), &raw_path)?;
        let target = dest.join(&name);

        prepare(dest, &name, &target, kind, overwrite)?;

        match kind {
            EntryType::Regular | EntryType::Continuous => {
                let mut file = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(meta.mode)
                    .open(&target)
                    .map_err(|e| PackError::extract(&target, e))?;
                let written = io::copy(&mut entry, &mut file).map_err(|e| PackError::extract(&target, e))?;
                if written != meta.size {
                    return Err(PackError::extract(
                        &target,
                        format!("short content: wrote {} of {} bytes", written, meta.size),
                    ));
                }
            }
            EntryType::Directory => {
                if !target.is_dir() {
                    DirBuilder::new()
                        .mode(meta.mode)
                        .create(&target)
                        .map_err(|e| PackError::extract(&target, e))?;
                }
            }
            EntryType::Link => {
                let link = link.ok_or_else(|| PackError::extract(&target, "hardlink without target"))?;
                let source = confine(&link)
                    .filter(|l| !l.as_os_str().is_empty())
                    .ok_or_else(|| {
                        PackError::extract(&target, format!("insecure link to {}", link.display()))
                    })?;
                check_no_symlink_parents(dest, &source)?;
                fs::hard_link(dest.join(&source), &target)
                    .map_err(|e| PackError::extract(&target, format!("hardlink to {}: {}", source.display(), e)))?;
            }
            EntryType::Symlink => {
                let link = link.ok_or_else(|| PackError::extract(&target, "symlink without target"))?;
                if escapes(&name, &link) {
                    return Err(PackError::extract(
                        &target,
                        format!("insecure link to {}", link.display()),
                    ));
                }
                std::os::unix::fs::symlink(&link, &target).map_err(|e| PackError::extract(&target, e))?;
            }
            EntryType::Char | EntryType::Block | EntryType::Fifo => {
                make_special(&target, kind, &meta)?;
            }
            other => {
                return Err(PackError::extract(
                    &raw_path,
                    format!("unsupported entry type {:?}", other),
                ));
            }
        }

        if kind != EntryType::Link {
            if is_root {
                lchown(&target, meta.uid, meta.gid)?;
            }
            if kind != EntryType::Symlink {
                fs::set_permissions(&target, fs::Permissions::from_mode(meta.mode))
                    .map_err(|e| PackError::extract(&target, e))?;
            }
            if kind == EntryType::Directory {
                dir_times.push((target, meta.mtime));
            } else {
                set_mtime(&target, meta.mtime)?;
            }
        }
        count += 1;
    }

    // Children are written after their directory, so directory times go last
    for (dir, mtime) in dir_times.iter().rev() {
        set_mtime(dir, *mtime)?;
    }

    tracing::debug!(dest = %dest.display(), entries = count, "Archive extracted");
    Ok(())
}

struct EntryMeta {
    mode: u32,
    uid: u64,
    gid: u64,
    mtime: u64,
    size: u64,
    dev_major: u32,
    dev_minor: u32,
}

impl EntryMeta {
    fn from_header(header: &tar::Header, path: &Path) -> Result<Self> {
        let field = |e: io::Error| PackError::extract(path, format!("invalid header: {}", e));
        let raw = header.as_old();

        let (dev_major, dev_minor) = match header.entry_type() {
            EntryType::Char | EntryType::Block => {
                let (raw_major, raw_minor) = device_fields(header);
                let major = header.device_major().map(|d| u64::from(d.unwrap_or(0)));
                let minor = header.device_minor().map(|d| u64::from(d.unwrap_or(0)));
                (
                    numeric(major, raw_major).map_err(field)? as u32,
                    numeric(minor, raw_minor).map_err(field)? as u32,
                )
            }
            _ => (0, 0),
        };

        Ok(Self {
            mode: numeric(header.mode().map(u64::from), &raw.mode).map_err(field)? as u32 & 0o7777,
            uid: numeric(header.uid(), &raw.uid).map_err(field)?,
            gid: numeric(header.gid(), &raw.gid).map_err(field)?,
            mtime: numeric(header.mtime(), &raw.mtime).map_err(field)?,
            size: numeric(header.size(), &raw.size).map_err(field)?,
            dev_major,
            dev_minor,
        })
    }
}

/// A numeric header field, where a field left blank (NUL or space filled)
/// reads as zero.
fn numeric(parsed: io::Result<u64>, raw: &[u8]) -> io::Result<u64> {
    match parsed {
        Ok(value) => Ok(value),
        Err(_) if is_blank(raw) => Ok(0),
        Err(e) => Err(e),
    }
}

fn is_blank(raw: &[u8]) -> bool {
    raw.iter().all(|b| *b == 0 || *b == b' ')
}

fn device_fields(header: &tar::Header) -> (&[u8], &[u8]) {
    if let Some(gnu) = header.as_gnu() {
        (&gnu.dev_major[..], &gnu.dev_minor[..])
    } else if let Some(ustar) = header.as_ustar() {
        (&ustar.dev_major[..], &ustar.dev_minor[..])
    } else {
        let blank: &[u8] = &[];
        (blank, blank)
    }
}

/// Relative form of an archive path, `None` if it climbs with `..`.
fn confine(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

/// Whether a relative symlink at `name` pointing to `link` resolves above
/// the extraction root. Absolute targets are interpreted inside the root
/// at run time and are allowed.
fn escapes(name: &Path, link: &Path) -> bool {
    if link.is_absolute() {
        return false;
    }

    let mut depth = name.components().count().saturating_sub(1) as isize;
    for component in link.components() {
        match component {
            Component::ParentDir => depth -= 1,
            Component::Normal(_) => depth += 1,
            _ => {}
        }
        if depth < 0 {
            return true;
        }
    }
    false
}

/// Reject writes through symlinks planted by earlier entries.
fn check_no_symlink_parents(dest: &Path, name: &Path) -> Result<()> {
    let mut current = dest.to_path_buf();
    let mut components = name.components().peekable();
    while let Some(component) = components.next() {
        if components.peek().is_none() {
            break;
        }
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(md) if md.file_type().is_symlink() => {
                return Err(PackError::extract(
                    dest.join(name),
                    format!("insecure path through symlink {}", current.display()),
                ));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Make room for an entry: parents exist, nothing in the way.
fn prepare(dest: &Path, name: &Path, target: &Path, kind: EntryType, overwrite: bool) -> Result<()> {
    check_no_symlink_parents(dest, name)?;

    if let Some(parent) = target.parent() {
        DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(parent)
            .map_err(|e| PackError::extract(parent, e))?;
    }

    let existing = match fs::symlink_metadata(target) {
        Ok(md) => md,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(PackError::extract(target, e)),
    };

    if existing.is_dir() && kind == EntryType::Directory {
        return Ok(());
    }
    if !overwrite {
        return Err(PackError::extract(target, "already exists"));
    }

    let removed = if existing.is_dir() {
        fs::remove_dir_all(target)
    } else {
        fs::remove_file(target)
    };
    removed.map_err(|e| PackError::extract(target, e))
}

fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| PackError::extract(path, "path contains a NUL byte"))
}

fn make_special(target: &Path, kind: EntryType, meta: &EntryMeta) -> Result<()> {
    let c = c_path(target)?;
    let mode = meta.mode as libc::mode_t;

    // SAFETY: `c` is a valid NUL-terminated path for the duration of the call
    let rc = unsafe {
        match kind {
            EntryType::Fifo => libc::mkfifo(c.as_ptr(), mode),
            EntryType::Char => libc::mknod(
                c.as_ptr(),
                mode | libc::S_IFCHR,
                makedev(meta.dev_major, meta.dev_minor) as libc::dev_t,
            ),
            _ => libc::mknod(
                c.as_ptr(),
                mode | libc::S_IFBLK,
                makedev(meta.dev_major, meta.dev_minor) as libc::dev_t,
            ),
        }
    };
    if rc != 0 {
        return Err(PackError::extract(target, io::Error::last_os_error()));
    }
    Ok(())
}

fn lchown(target: &Path, uid: u64, gid: u64) -> Result<()> {
    let c = c_path(target)?;
    // SAFETY: `c` is a valid NUL-terminated path for the duration of the call
    let rc = unsafe { libc::lchown(c.as_ptr(), uid as libc::uid_t, gid as libc::gid_t) };
    if rc != 0 {
        return Err(PackError::extract(target, io::Error::last_os_error()));
    }
    Ok(())
}

fn set_mtime(target: &Path, mtime: u64) -> Result<()> {
    let c = c_path(target)?;
    let time = libc::timespec {
        tv_sec: mtime as libc::time_t,
        tv_nsec: 0,
    };
    let times = [time, time];
    // SAFETY: `c` and `times` outlive the call
    let rc = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc != 0 {
        return Err(PackError::extract(target, io::Error::last_os_error()));
    }
    Ok(())
}
