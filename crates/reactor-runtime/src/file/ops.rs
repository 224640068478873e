//! Opening files and filesystem operations
//!
//! Everything here blocks in the kernel, so it all runs on the shard's
//! syscall thread.

use super::append::AppendChallengedFile;
use super::posix::PosixFile;
use super::{DmaAlignment, File, FileKind, FileOpenOptions, OpenFlags};
use crate::io::align_up;
use crate::platform_linux::{check, cstring, fs_type, kernel_version, last_os_error, FsType};
use crate::shard;
use reactor_core::{do_for_each, Deferred, ReactorError, Result};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Component, Path, PathBuf};
use std::rc::Rc;

// BLKSSZGET
nix::ioctl_read_bad!(block_logical_sector_size, 0x1268, libc::c_int);

fn blocking<T, F>(f: F) -> Deferred<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    shard::local().syscall().submit(f)
}

/// How an opened file should be driven: `None` for a plain file,
/// `Some(n)` for append serialization tolerating `n` queued appending
/// writes before truncating ahead.
pub(crate) fn choose_impl(
    fs: FsType,
    kernel: (u32, u32),
    is_dir: bool,
    read_only: bool,
    forced: Option<bool>,
) -> Option<usize> {
    if is_dir || read_only {
        return None;
    }
    // Newer XFS tolerates one extending write in flight.
    let xfs_ops = if kernel >= (3, 15) { 1 } else { 0 };
    match forced {
        Some(false) => None,
        Some(true) => Some(if fs == FsType::Xfs { xfs_ops } else { 0 }),
        None => match fs {
            FsType::Xfs => Some(xfs_ops),
            FsType::Nfs => None,
            FsType::Tmpfs | FsType::Other(_) => Some(0),
        },
    }
}

struct Opened {
    fd: OwnedFd,
    align: DmaAlignment,
    size: u64,
    committed: u64,
    append_ops: Option<usize>,
    fs: FsType,
    direct: bool,
}

fn stat_fd(fd: RawFd) -> Result<libc::stat> {
    // SAFETY: stat is plain data filled by the kernel.
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    check(unsafe { libc::fstat(fd, &mut st) })?;
    Ok(st)
}

fn detect_alignment(fd: RawFd, st: &libc::stat) -> DmaAlignment {
    if st.st_mode & libc::S_IFMT == libc::S_IFBLK {
        let mut sector: libc::c_int = 0;
        // SAFETY: BLKSSZGET writes one int.
        if unsafe { block_logical_sector_size(fd, &mut sector) }.is_ok() && sector > 0 {
            return DmaAlignment::uniform(sector as u64);
        }
    }
    DmaAlignment::default()
}

fn enable_direct_io(fd: RawFd) -> Result<()> {
    // SAFETY: fcntl on a descriptor we own.
    unsafe {
        let flags = check(libc::fcntl(fd, libc::F_GETFL))?;
        check(libc::fcntl(fd, libc::F_SETFL, flags | libc::O_DIRECT))?;
    }
    Ok(())
}

fn open_blocking(path: &Path, flags: OpenFlags, strict: bool, options: &FileOpenOptions) -> Result<Opened> {
    let cpath = cstring(path)?;
    // SAFETY: cpath is a valid C string for the duration of the call.
    let raw = check(unsafe { libc::open(cpath.as_ptr(), flags.bits() | libc::O_CLOEXEC, 0o644 as libc::c_uint) })?;
    // SAFETY: `raw` was just opened and is owned by nothing else.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    let fs = fs_type(raw)?;
    let direct = match enable_direct_io(raw) {
        Ok(()) => true,
        // tmpfs has no O_DIRECT; buffered I/O there is what the user wants.
        Err(e) if strict && fs != FsType::Tmpfs => return Err(e),
        Err(_) => false,
    };
    let st = stat_fd(raw)?;
    let is_dir = st.st_mode & libc::S_IFMT == libc::S_IFDIR;
    let align = detect_alignment(raw, &st);
    let size = st.st_size.max(0) as u64;
    let append_ops = choose_impl(fs, kernel_version(), is_dir, flags.read_only(), options.append_challenged);

    let mut committed = size;
    if append_ops.is_some() && options.sloppy_size {
        let hint = align_up(options.sloppy_size_hint, align.disk_write);
        // SAFETY: plain syscall on a descriptor we own.
        if committed < hint && unsafe { libc::ftruncate(raw, hint as libc::off_t) } == 0 {
            committed = hint;
        }
    }
    Ok(Opened { fd, align, size, committed, append_ops, fs, direct })
}

/// Open `name` for DMA.
///
/// O_DIRECT is required unless `relaxed_dma` is configured or the file
/// lives on tmpfs. The filesystem decides whether extending writes are
/// serialized; [`FileOpenOptions::append_challenged`] overrides that.
pub fn open_file_dma(name: impl AsRef<Path>, flags: OpenFlags, options: FileOpenOptions) -> Deferred<File> {
    let reactor = shard::local();
    let strict = !reactor.config().relaxed_dma;
    let growth = reactor.config().sloppy_growth_factor;
    let path = name.as_ref().to_path_buf();
    let opts = options.clone();
    blocking(move || open_blocking(&path, flags, strict, &opts)).map(move |o| {
        reactor_core::kdebug!(
            "opened fd {} on {:?} (direct: {}, append serialized: {:?})",
            o.fd.as_raw_fd(),
            o.fs,
            o.direct,
            o.append_ops
        );
        let posix = PosixFile::new(o.fd, o.align);
        match o.append_ops {
            Some(ops) => File::from_impl(Rc::new(AppendChallengedFile::new(
                posix,
                o.size,
                o.committed,
                ops,
                &options,
                growth,
            ))),
            None => File::from_impl(Rc::new(posix)),
        }
    })
}

pub fn open_directory(name: impl AsRef<Path>) -> Deferred<File> {
    let path = name.as_ref().to_path_buf();
    blocking(move || {
        let cpath = cstring(&path)?;
        // SAFETY: cpath is a valid C string for the duration of the call.
        let raw = check(unsafe {
            libc::open(cpath.as_ptr(), libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_RDONLY)
        })?;
        // SAFETY: `raw` was just opened and is owned by nothing else.
        Ok(unsafe { OwnedFd::from_raw_fd(raw) })
    })
    .map(|fd| File::from_impl(Rc::new(PosixFile::new(fd, DmaAlignment::default()))))
}

pub fn remove_file(name: impl AsRef<Path>) -> Deferred<()> {
    let path = name.as_ref().to_path_buf();
    blocking(move || {
        let cpath = cstring(&path)?;
        // SAFETY: cpath is a valid C string for the duration of the call.
        check(unsafe { libc::remove(cpath.as_ptr()) }).map(drop)
    })
}

pub fn rename_file(old: impl AsRef<Path>, new: impl AsRef<Path>) -> Deferred<()> {
    let (old, new) = (old.as_ref().to_path_buf(), new.as_ref().to_path_buf());
    blocking(move || {
        let (o, n) = (cstring(&old)?, cstring(&new)?);
        // SAFETY: both are valid C strings for the duration of the call.
        check(unsafe { libc::rename(o.as_ptr(), n.as_ptr()) }).map(drop)
    })
}

/// Hard-link `new` to `old`.
pub fn link_file(old: impl AsRef<Path>, new: impl AsRef<Path>) -> Deferred<()> {
    let (old, new) = (old.as_ref().to_path_buf(), new.as_ref().to_path_buf());
    blocking(move || {
        let (o, n) = (cstring(&old)?, cstring(&new)?);
        // SAFETY: both are valid C strings for the duration of the call.
        check(unsafe { libc::link(o.as_ptr(), n.as_ptr()) }).map(drop)
    })
}

fn stat_path(path: &Path) -> Result<libc::stat> {
    let cpath = cstring(path)?;
    // SAFETY: stat is plain data filled by the kernel.
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    check(unsafe { libc::stat(cpath.as_ptr(), &mut st) })?;
    Ok(st)
}

pub fn file_exists(name: impl AsRef<Path>) -> Deferred<bool> {
    let path = name.as_ref().to_path_buf();
    blocking(move || match stat_path(&path) {
        Ok(_) => Ok(true),
        Err(ReactorError::Os(libc::ENOENT)) => Ok(false),
        Err(e) => Err(e),
    })
}

pub fn file_size(name: impl AsRef<Path>) -> Deferred<u64> {
    let path = name.as_ref().to_path_buf();
    blocking(move || Ok(stat_path(&path)?.st_size.max(0) as u64))
}

/// Kind of the file at `name`, or `None` if nothing is there.
pub fn file_type(name: impl AsRef<Path>) -> Deferred<Option<FileKind>> {
    let path = name.as_ref().to_path_buf();
    blocking(move || match stat_path(&path) {
        Ok(st) => Ok(Some(FileKind::from_mode(st.st_mode))),
        Err(ReactorError::Os(libc::ENOENT)) | Err(ReactorError::Os(libc::ENOTDIR)) => Ok(None),
        Err(e) => Err(e),
    })
}

fn mkdir(path: &Path) -> Result<()> {
    let cpath = cstring(path)?;
    // SAFETY: cpath is a valid C string for the duration of the call.
    check(unsafe { libc::mkdir(cpath.as_ptr(), libc::S_IRWXU) }).map(drop)
}

pub fn make_directory(name: impl AsRef<Path>) -> Deferred<()> {
    let path = name.as_ref().to_path_buf();
    blocking(move || mkdir(&path))
}

/// Like [`make_directory`], but an existing directory is fine.
pub fn touch_directory(name: impl AsRef<Path>) -> Deferred<()> {
    let path = name.as_ref().to_path_buf();
    blocking(move || match mkdir(&path) {
        Err(ReactorError::Os(libc::EEXIST)) => Ok(()),
        other => other,
    })
}

/// Make sure a directory's entries are on disk.
pub fn sync_directory(name: impl AsRef<Path>) -> Deferred<()> {
    let path = name.as_ref().to_path_buf();
    blocking(move || {
        let cpath = cstring(&path)?;
        // SAFETY: cpath is a valid C string for the duration of the call.
        let raw = check(unsafe { libc::open(cpath.as_ptr(), libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_RDONLY) })?;
        // SAFETY: `raw` was just opened and is owned by nothing else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        // SAFETY: plain syscall on a descriptor we own.
        if unsafe { libc::fsync(fd.as_raw_fd()) } < 0 {
            return Err(last_os_error());
        }
        Ok(())
    })
}

/// Every directory from the top of `name` down, each one's parent synced
/// after it is created.
fn touch_steps(name: &Path) -> Vec<(PathBuf, PathBuf)> {
    let mut base = if name.is_absolute() { PathBuf::from("/") } else { PathBuf::from(".") };
    let mut steps = Vec::new();
    for part in name.components() {
        match part {
            Component::Normal(p) => {
                let dir = base.join(p);
                steps.push((dir.clone(), base));
                base = dir;
            }
            Component::ParentDir => base = base.join(".."),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    steps
}

/// Create `name` and any missing parents.
pub fn recursive_touch_directory(name: impl AsRef<Path>) -> Deferred<()> {
    do_for_each(touch_steps(name.as_ref()), |(dir, parent)| {
        touch_directory(dir).then(move |()| sync_directory(parent))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_choose_impl_by_filesystem() {
        assert_eq!(choose_impl(FsType::Xfs, (5, 10), false, false, None), Some(1));
        assert_eq!(choose_impl(FsType::Xfs, (3, 10), false, false, None), Some(0));
        assert_eq!(choose_impl(FsType::Nfs, (5, 10), false, false, None), None);
        assert_eq!(choose_impl(FsType::Tmpfs, (5, 10), false, false, None), Some(0));
        assert_eq!(choose_impl(FsType::Other(0xEF53), (5, 10), false, false, None), Some(0));
    }

    #[test]
    fn test_choose_impl_overrides() {
        assert_eq!(choose_impl(FsType::Xfs, (5, 10), false, false, Some(false)), None);
        assert_eq!(choose_impl(FsType::Nfs, (5, 10), false, false, Some(true)), Some(0));
        assert_eq!(choose_impl(FsType::Xfs, (5, 10), true, false, Some(true)), None);
        assert_eq!(choose_impl(FsType::Xfs, (5, 10), false, true, None), None);
    }

    #[test]
    fn test_touch_steps() {
        let steps = touch_steps(Path::new("a/b/c"));
        let dirs: Vec<_> = steps.iter().map(|(d, p)| (d.to_str().unwrap(), p.to_str().unwrap())).collect();
        assert_eq!(dirs, vec![("./a", "."), ("./a/b", "./a"), ("./a/b/c", "./a/b")]);
        let abs = touch_steps(Path::new("/tmp/x"));
        assert_eq!(abs[0].0, PathBuf::from("/tmp"));
        assert_eq!(abs[1].1, PathBuf::from("/tmp"));
    }
}
