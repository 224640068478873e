//! Directory listing
//!
//! Entries are read on the syscall thread through a private duplicate of
//! the directory descriptor, then pushed one at a time into the caller's
//! consumer, waiting for each step.

use crate::platform_linux::{check, nix_error};
use crate::syscall::SyscallPool;
use nix::dir::{Dir, Type};
use reactor_core::{do_for_each, Deferred, Result};
use std::os::unix::io::RawFd;
use std::rc::Rc;

use super::EntryConsumer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
    Unknown,
}

impl FileKind {
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT {
            libc::S_IFREG => FileKind::File,
            libc::S_IFDIR => FileKind::Directory,
            libc::S_IFLNK => FileKind::Symlink,
            libc::S_IFBLK => FileKind::BlockDevice,
            libc::S_IFCHR => FileKind::CharDevice,
            libc::S_IFIFO => FileKind::Fifo,
            libc::S_IFSOCK => FileKind::Socket,
            _ => FileKind::Unknown,
        }
    }

    fn from_dirent(t: Option<Type>) -> Option<Self> {
        Some(match t? {
            Type::File => FileKind::File,
            Type::Directory => FileKind::Directory,
            Type::Symlink => FileKind::Symlink,
            Type::BlockDevice => FileKind::BlockDevice,
            Type::CharacterDevice => FileKind::CharDevice,
            Type::Fifo => FileKind::Fifo,
            Type::Socket => FileKind::Socket,
        })
    }
}

/// One directory entry; `kind` is `None` when the filesystem does not
/// report types in its entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: Option<FileKind>,
}

pub(crate) fn list(pool: &Rc<SyscallPool>, fd: RawFd, mut next: EntryConsumer) -> Deferred<()> {
    pool.submit(move || read_entries(fd))
        .then(move |entries| do_for_each(entries, move |e| next(e)))
}

fn read_entries(fd: RawFd) -> Result<Vec<DirEntry>> {
    // SAFETY: duplicating a descriptor we were handed; the copy is owned
    // by `Dir` below.
    let copy = check(unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) })?;
    // The duplicate shares the file offset; start from the top.
    // SAFETY: plain syscall on the descriptor we just created.
    if unsafe { libc::lseek(copy, 0, libc::SEEK_SET) } < 0 {
        let err = crate::platform_linux::last_os_error();
        // SAFETY: `copy` is ours and not yet owned by anything.
        unsafe { libc::close(copy) };
        return Err(err);
    }
    let mut dir = Dir::from_fd(copy).map_err(nix_error)?;
    let mut entries = Vec::new();
    for entry in dir.iter() {
        let entry = entry.map_err(nix_error)?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "." || name == ".." {
            continue;
        }
        entries.push(DirEntry { name, kind: FileKind::from_dirent(entry.file_type()) });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_read_entries_skips_dots() {
        let root = std::env::temp_dir().join(format!("rct-dir-{}", std::process::id()));
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("a.txt"), b"a").unwrap();
        let d = std::fs::File::open(&root).unwrap();
        let mut entries = read_entries(d.as_raw_fd()).unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "sub"]);
        if let Some(kind) = entries[1].kind {
            assert_eq!(kind, FileKind::Directory);
        }
        // A second listing starts from the top again.
        assert_eq!(read_entries(d.as_raw_fd()).unwrap().len(), 2);
        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_kind_from_mode() {
        assert_eq!(FileKind::from_mode(libc::S_IFREG | 0o644), FileKind::File);
        assert_eq!(FileKind::from_mode(libc::S_IFDIR | 0o755), FileKind::Directory);
        assert_eq!(FileKind::from_mode(0), FileKind::Unknown);
    }
}
