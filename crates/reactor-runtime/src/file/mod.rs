//! DMA files
//!
//! ```text
//!   File (shared handle, dup = clone)
//!     └─ Rc<dyn FileImpl>
//!          ├─ PosixFile              reads/writes straight to the io queue
//!          └─ AppendChallengedFile   serializes size-changing ops first
//! ```
//!
//! Every offset and length on the DMA path must be a multiple of the
//! file's disk alignment and every buffer must sit on its memory
//! alignment. [`File::dma_read_bulk`] is the one exception: it over-reads
//! to the alignment boundary and trims.

pub mod append;
pub mod bulk;
pub mod dir;
pub mod ops;
pub mod posix;

pub use append::AppendChallengedFile;
pub use dir::{DirEntry, FileKind};
pub use ops::{
    file_exists, file_size, file_type, link_file, make_directory, open_directory, open_file_dma,
    recursive_touch_directory, remove_file, rename_file, sync_directory, touch_directory,
};
pub use posix::PosixFile;

use crate::io::{DmaBuffer, PriorityClass};
use reactor_core::{Deferred, ReactorError, Result};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, SystemTime};

/// Alignment used when the device reports nothing better.
pub const DEFAULT_DMA_ALIGNMENT: u64 = 4096;

/// Flags for [`open_file_dma`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(libc::c_int);

impl OpenFlags {
    pub const RO: OpenFlags = OpenFlags(libc::O_RDONLY);
    pub const WO: OpenFlags = OpenFlags(libc::O_WRONLY);
    pub const RW: OpenFlags = OpenFlags(libc::O_RDWR);
    pub const CREATE: OpenFlags = OpenFlags(libc::O_CREAT);
    pub const TRUNCATE: OpenFlags = OpenFlags(libc::O_TRUNC);
    pub const EXCLUSIVE: OpenFlags = OpenFlags(libc::O_EXCL);
    pub const DSYNC: OpenFlags = OpenFlags(libc::O_DSYNC);

    #[inline]
    pub fn bits(self) -> libc::c_int {
        self.0
    }

    pub fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Opened for reading only.
    pub fn read_only(self) -> bool {
        self.0 & libc::O_ACCMODE == libc::O_RDONLY
    }
}

impl std::ops::BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

/// Per-open tuning.
#[derive(Debug, Clone, Default)]
pub struct FileOpenOptions {
    /// Let the on-disk size run ahead of the logical size; it is fixed up
    /// on flush and close
    pub sloppy_size: bool,
    /// Initial on-disk size for sloppy files
    pub sloppy_size_hint: u64,
    /// Force (`Some(true)`) or forbid (`Some(false)`) append
    /// serialization instead of deciding from the filesystem
    pub append_challenged: Option<bool>,
}

impl FileOpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sloppy_size(mut self, enable: bool) -> Self {
        self.sloppy_size = enable;
        self
    }

    pub fn sloppy_size_hint(mut self, bytes: u64) -> Self {
        self.sloppy_size_hint = bytes;
        self
    }

    pub fn append_challenged(mut self, enable: bool) -> Self {
        self.append_challenged = Some(enable);
        self
    }
}

/// Alignment requirements of one open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaAlignment {
    pub memory: u64,
    pub disk_read: u64,
    pub disk_write: u64,
}

impl Default for DmaAlignment {
    fn default() -> Self {
        Self::uniform(DEFAULT_DMA_ALIGNMENT)
    }
}

impl DmaAlignment {
    pub fn uniform(align: u64) -> Self {
        Self { memory: align, disk_read: align, disk_write: align }
    }

    pub fn check_read(&self, pos: u64, buf: &DmaBuffer) -> Result<()> {
        check_aligned("read position", pos, self.disk_read)?;
        check_aligned("read length", buf.len() as u64, self.disk_read)?;
        check_aligned("read buffer address", buf.as_ptr() as u64, self.memory)
    }

    pub fn check_write(&self, pos: u64, buf: &DmaBuffer) -> Result<()> {
        check_aligned("write position", pos, self.disk_write)?;
        check_aligned("write length", buf.len() as u64, self.disk_write)?;
        check_aligned("write buffer address", buf.as_ptr() as u64, self.memory)
    }
}

fn check_aligned(what: &'static str, value: u64, align: u64) -> Result<()> {
    if align > 1 && value % align != 0 {
        return Err(ReactorError::Alignment { what, value, align });
    }
    Ok(())
}

/// `fstat` result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    /// Bytes actually allocated on disk
    pub allocated: u64,
    pub block_size: u64,
    pub mode: u32,
    pub nlink: u64,
    pub inode: u64,
    pub device: u64,
    pub modified: SystemTime,
}

impl FileStat {
    pub(crate) fn from_raw(st: &libc::stat) -> Self {
        let modified = SystemTime::UNIX_EPOCH
            + Duration::new(st.st_mtime.max(0) as u64, st.st_mtime_nsec.clamp(0, 999_999_999) as u32);
        Self {
            size: st.st_size.max(0) as u64,
            allocated: st.st_blocks.max(0) as u64 * 512,
            block_size: st.st_blksize.max(0) as u64,
            mode: st.st_mode,
            nlink: st.st_nlink as u64,
            inode: st.st_ino,
            device: st.st_dev,
            modified,
        }
    }

    pub fn kind(&self) -> FileKind {
        FileKind::from_mode(self.mode)
    }
}

/// Push-style consumer of directory entries.
pub type EntryConsumer = Box<dyn FnMut(DirEntry) -> Deferred<()>>;

/// Operations every file implementation provides.
pub trait FileImpl {
    fn fd(&self) -> RawFd;

    fn alignment(&self) -> DmaAlignment;

    /// Read into `buf` at `pos`; resolves with the byte count and the
    /// buffer.
    fn read_dma(&self, pos: u64, buf: DmaBuffer, pc: PriorityClass) -> Deferred<(usize, DmaBuffer)>;

    fn write_dma(&self, pos: u64, buf: DmaBuffer, pc: PriorityClass) -> Deferred<usize>;

    fn flush(&self) -> Deferred<()>;

    fn stat(&self) -> Deferred<FileStat>;

    fn truncate(&self, len: u64) -> Deferred<()>;

    /// Punch a hole; the file keeps its size.
    fn discard(&self, pos: u64, len: u64) -> Deferred<()>;

    /// Reserve blocks; the file keeps its size.
    fn allocate(&self, pos: u64, len: u64) -> Deferred<()>;

    fn size(&self) -> Deferred<u64>;

    /// Close the descriptor. Nothing else may be called afterwards.
    fn close(&self) -> Deferred<()>;

    /// Feed every entry of a directory to `next`, one at a time.
    fn list_directory(&self, next: EntryConsumer) -> Deferred<()>;
}

/// Shared handle to an open file.
///
/// [`dup`](Self::dup) hands out another handle to the same descriptor.
/// [`close`](Self::close) on the last handle closes it; dropping the last
/// handle unclosed closes it in the background.
pub struct File {
    inner: Rc<dyn FileImpl>,
}

impl File {
    pub fn from_impl(inner: Rc<dyn FileImpl>) -> Self {
        Self { inner }
    }

    pub fn fd(&self) -> RawFd {
        self.inner.fd()
    }

    pub fn memory_dma_alignment(&self) -> u64 {
        self.inner.alignment().memory
    }

    pub fn disk_read_dma_alignment(&self) -> u64 {
        self.inner.alignment().disk_read
    }

    pub fn disk_write_dma_alignment(&self) -> u64 {
        self.inner.alignment().disk_write
    }

    /// Another handle to the same open file.
    pub fn dup(&self) -> File {
        File { inner: self.inner.clone() }
    }

    /// Handles sharing this descriptor.
    pub fn handles(&self) -> usize {
        Rc::strong_count(&self.inner)
    }

    pub fn read_dma(&self, pos: u64, buf: DmaBuffer, pc: PriorityClass) -> Deferred<(usize, DmaBuffer)> {
        if let Err(e) = self.inner.alignment().check_read(pos, &buf) {
            return Deferred::failed(e);
        }
        self.inner.read_dma(pos, buf, pc)
    }

    /// Read `len` bytes at `pos` into a fresh aligned buffer, trimmed to
    /// what was read.
    pub fn read_dma_new(&self, pos: u64, len: usize, pc: PriorityClass) -> Deferred<DmaBuffer> {
        let buf = DmaBuffer::new(len, self.memory_dma_alignment() as usize);
        self.read_dma(pos, buf, pc).map(|(n, mut buf)| {
            buf.trim_to(n);
            buf
        })
    }

    pub fn write_dma(&self, pos: u64, buf: DmaBuffer, pc: PriorityClass) -> Deferred<usize> {
        if let Err(e) = self.inner.alignment().check_write(pos, &buf) {
            return Deferred::failed(e);
        }
        self.inner.write_dma(pos, buf, pc)
    }

    pub fn flush(&self) -> Deferred<()> {
        self.inner.flush()
    }

    pub fn stat(&self) -> Deferred<FileStat> {
        self.inner.stat()
    }

    pub fn truncate(&self, len: u64) -> Deferred<()> {
        self.inner.truncate(len)
    }

    pub fn discard(&self, pos: u64, len: u64) -> Deferred<()> {
        self.inner.discard(pos, len)
    }

    pub fn allocate(&self, pos: u64, len: u64) -> Deferred<()> {
        self.inner.allocate(pos, len)
    }

    pub fn size(&self) -> Deferred<u64> {
        self.inner.size()
    }

    /// Release this handle; the descriptor closes with the last one.
    pub fn close(self) -> Deferred<()> {
        if Rc::strong_count(&self.inner) > 1 {
            return Deferred::ready(());
        }
        self.inner.close()
    }

    pub fn list_directory(&self, next: impl FnMut(DirEntry) -> Deferred<()> + 'static) -> Deferred<()> {
        self.inner.list_directory(Box::new(next))
    }
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("fd", &self.fd())
            .field("handles", &self.handles())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::default_priority_class;
    use crate::smp::run_test;
    use reactor_core::when_all;
    use std::cell::RefCell;
    use std::path::PathBuf;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("rct-file-{}-{}", std::process::id(), tag))
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn test_open_flags() {
        let f = OpenFlags::RW | OpenFlags::CREATE | OpenFlags::TRUNCATE;
        assert!(f.contains(OpenFlags::CREATE));
        assert!(!f.contains(OpenFlags::EXCLUSIVE));
        assert!(!f.read_only());
        assert!(OpenFlags::RO.read_only());
    }

    #[test]
    fn test_alignment_errors() {
        let a = DmaAlignment::uniform(512);
        let buf = DmaBuffer::new(1024, 512);
        assert!(a.check_read(512, &buf).is_ok());
        assert_eq!(
            a.check_read(100, &buf),
            Err(ReactorError::Alignment { what: "read position", value: 100, align: 512 })
        );
        let short = DmaBuffer::new(100, 512);
        assert!(matches!(
            a.check_write(0, &short),
            Err(ReactorError::Alignment { what: "write length", value: 100, .. })
        ));
    }

    #[test]
    fn test_open_options_builder() {
        let o = FileOpenOptions::new().sloppy_size(true).sloppy_size_hint(1 << 20).append_challenged(false);
        assert!(o.sloppy_size);
        assert_eq!(o.sloppy_size_hint, 1 << 20);
        assert_eq!(o.append_challenged, Some(false));
    }

    #[test]
    fn test_write_then_read_back() {
        let path = temp_path("rw");
        let p = path.clone();
        let code = run_test(1, move || {
            let pc = default_priority_class();
            open_file_dma(&p, OpenFlags::RW | OpenFlags::CREATE | OpenFlags::TRUNCATE, FileOpenOptions::new())
                .then(move |f| {
                    let align = f.disk_write_dma_alignment() as usize;
                    let data = pattern(align, 3);
                    let buf = DmaBuffer::copy_from(&data, f.memory_dma_alignment() as usize);
                    f.write_dma(0, buf, pc)
                        .then(move |n| f.read_dma_new(0, n, pc).map(move |b| (f, b, data)))
                })
                .then(|(f, back, data)| {
                    let same = back.as_slice() == &data[..];
                    f.size().then(move |size| {
                        let ok = same && size == data.len() as u64;
                        f.close().map(move |()| if ok { 0 } else { 1 })
                    })
                })
        });
        assert_eq!(code, 0);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_unaligned_write_rejected() {
        let path = temp_path("unaligned");
        let p = path.clone();
        let code = run_test(1, move || {
            open_file_dma(&p, OpenFlags::RW | OpenFlags::CREATE, FileOpenOptions::new()).then(|f| {
                let buf = DmaBuffer::new(4096, 4096);
                f.write_dma(100, buf, default_priority_class()).then_result(move |r| {
                    let code = match r {
                        Err(ReactorError::Alignment { what: "write position", value: 100, .. }) => 0,
                        _ => 1,
                    };
                    f.close().map(move |()| code)
                })
            })
        });
        assert_eq!(code, 0);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_appends_and_truncate_settle_on_logical_size() {
        let path = temp_path("append");
        let p = path.clone();
        let code = run_test(1, move || {
            let pc = default_priority_class();
            let opts = FileOpenOptions::new().append_challenged(true);
            let check_path = p.clone();
            open_file_dma(&p, OpenFlags::RW | OpenFlags::CREATE | OpenFlags::TRUNCATE, opts)
                .then(move |f| {
                    let mut ops: Vec<Deferred<()>> = (0..8u64)
                        .map(|i| {
                            let buf = DmaBuffer::copy_from(&pattern(4096, i as u8), 4096);
                            f.write_dma(i * 4096, buf, pc).ignore_value()
                        })
                        .collect();
                    ops.push(f.truncate(16384));
                    when_all(ops).then(move |_| f.close())
                })
                .then(move |()| file_size(check_path))
                .map(|size| if size == 16384 { 0 } else { 1 })
        });
        assert_eq!(code, 0);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_sloppy_file_trimmed_on_close() {
        let path = temp_path("sloppy");
        let p = path.clone();
        let code = run_test(1, move || {
            let opts = FileOpenOptions::new().append_challenged(true).sloppy_size(true).sloppy_size_hint(1 << 20);
            let check_path = p.clone();
            open_file_dma(&p, OpenFlags::RW | OpenFlags::CREATE | OpenFlags::TRUNCATE, opts)
                .then(|f| {
                    let buf = DmaBuffer::copy_from(&pattern(4096, 1), 4096);
                    f.write_dma(0, buf, default_priority_class()).then(move |_| {
                        f.stat().then(move |st| f.close().map(move |()| st.size))
                    })
                })
                .then(move |logical| file_size(check_path).map(move |on_disk| (logical, on_disk)))
                .map(|(logical, on_disk)| if logical == 4096 && on_disk == 4096 { 0 } else { 1 })
        });
        assert_eq!(code, 0);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_bulk_read_unaligned_range() {
        let path = temp_path("bulk");
        let data = pattern(10_000, 7);
        std::fs::write(&path, &data).unwrap();
        let p = path.clone();
        let expected = data[100..5100].to_vec();
        let code = run_test(1, move || {
            let pc = default_priority_class();
            open_file_dma(&p, OpenFlags::RO, FileOpenOptions::new()).then(move |f| {
                f.dma_read_bulk(100, 5000, pc).then(move |got| {
                    let ok = got.as_slice() == &expected[..];
                    f.dma_read_exactly(9000, 4000, pc).then_result(move |r| {
                        let short = matches!(r, Err(ReactorError::UnexpectedEof { wanted: 4000, got: 1000 }));
                        f.close().map(move |()| if ok && short { 0 } else { 1 })
                    })
                })
            })
        });
        assert_eq!(code, 0);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_list_directory_pushes_entries() {
        let root = temp_path("list");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("one"), b"1").unwrap();
        std::fs::write(root.join("two"), b"2").unwrap();
        let r = root.clone();
        let code = run_test(1, move || {
            open_directory(&r).then(|dir| {
                let seen = Rc::new(RefCell::new(Vec::new()));
                let s = seen.clone();
                dir.list_directory(move |e| {
                    s.borrow_mut().push(e.name);
                    Deferred::ready(())
                })
                .then(move |()| {
                    let mut names = seen.borrow().clone();
                    names.sort();
                    dir.close().map(move |()| if names == ["one", "two"] { 0 } else { 1 })
                })
            })
        });
        assert_eq!(code, 0);
        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_dup_closes_with_last_handle() {
        let path = temp_path("dup");
        let p = path.clone();
        let code = run_test(1, move || {
            open_file_dma(&p, OpenFlags::RW | OpenFlags::CREATE, FileOpenOptions::new()).then(|f| {
                let copy = f.dup();
                let fd = f.fd();
                if copy.handles() != 2 {
                    return Deferred::ready(1);
                }
                f.close().then(move |()| {
                    // SAFETY: F_GETFD only queries the descriptor.
                    let open = unsafe { libc::fcntl(fd, libc::F_GETFD) } >= 0;
                    copy.close().map(move |()| if open { 0 } else { 2 })
                })
            })
        });
        assert_eq!(code, 0);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_filesystem_ops() {
        let root = temp_path("fsops");
        let r = root.clone();
        let code = run_test(1, move || {
            let nested = r.join("a/b");
            let (file, moved, linked) = (r.join("a/f"), r.join("a/g"), r.join("a/h"));
            let (f2, m2, m3, l2, l3, n2) =
                (file.clone(), moved.clone(), moved.clone(), linked.clone(), linked.clone(), nested.clone());
            recursive_touch_directory(&nested)
                .then(move |()| touch_directory(n2))
                .then(move |()| open_file_dma(&file, OpenFlags::RW | OpenFlags::CREATE, FileOpenOptions::new()))
                .then(|f| f.close())
                .then(move |()| rename_file(f2, m2))
                .then(move |()| link_file(m3, l2))
                .then(move |()| file_type(l3))
                .then(move |kind| {
                    file_exists(moved.with_file_name("f")).map(move |gone| kind == Some(FileKind::File) && !gone)
                })
                .then(move |ok| file_type(linked.with_file_name("missing")).map(move |none| ok && none.is_none()))
                .map(|ok| if ok { 0 } else { 1 })
        });
        assert_eq!(code, 0);
        std::fs::remove_dir_all(&root).unwrap();
    }
}
