//! Linux platform helpers
//!
//! Thread pinning, CPU discovery, filesystem and kernel detection.

use reactor_core::{ReactorError, Result};
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::path::Path;

/// Last OS error as a reactor error.
#[inline]
pub fn last_os_error() -> ReactorError {
    ReactorError::Os(errno())
}

/// nix errno as a reactor error.
#[inline]
pub fn nix_error(e: nix::errno::Errno) -> ReactorError {
    ReactorError::Os(e as i32)
}

#[inline]
pub fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

/// Map a `-1`-style libc return to a result.
#[inline]
pub fn check(ret: libc::c_int) -> Result<libc::c_int> {
    if ret < 0 {
        Err(last_os_error())
    } else {
        Ok(ret)
    }
}

/// Map a `ssize_t` libc return to a byte count.
#[inline]
pub fn check_size(ret: libc::ssize_t) -> Result<usize> {
    if ret < 0 {
        Err(last_os_error())
    } else {
        Ok(ret as usize)
    }
}

pub fn cstring(path: &Path) -> Result<CString> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes()).map_err(|_| ReactorError::InvalidArgument("path contains NUL"))
}

/// Pin the calling thread to one CPU.
pub fn pin_current_thread(cpu: usize) -> Result<()> {
    // SAFETY: cpu_set_t is plain data; zeroed is the empty set.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        check(libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set))?;
    }
    Ok(())
}

/// CPUs this process may run on, in ascending order.
pub fn online_cpus() -> Vec<usize> {
    // SAFETY: sched_getaffinity fills the set we own.
    let cpus: Vec<usize> = unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        if libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) == 0 {
            (0..libc::CPU_SETSIZE as usize).filter(|&c| libc::CPU_ISSET(c, &set)).collect()
        } else {
            Vec::new()
        }
    };
    if !cpus.is_empty() {
        return cpus;
    }
    let n = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    (0..n).collect()
}

/// Whether we run under a hypervisor; idle polling is longer there.
pub fn is_virtualized() -> bool {
    std::fs::read_to_string("/sys/hypervisor/type")
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false)
}

/// Filesystem families with distinct DMA behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    Xfs,
    Nfs,
    Tmpfs,
    Other(i64),
}

const XFS_SUPER_MAGIC: i64 = 0x5846_5342;
const NFS_SUPER_MAGIC: i64 = 0x6969;
const TMPFS_MAGIC: i64 = 0x0102_1994;

impl FsType {
    pub fn from_magic(magic: i64) -> Self {
        match magic {
            XFS_SUPER_MAGIC => FsType::Xfs,
            NFS_SUPER_MAGIC => FsType::Nfs,
            TMPFS_MAGIC => FsType::Tmpfs,
            other => FsType::Other(other),
        }
    }
}

/// Filesystem type of an open descriptor.
pub fn fs_type(fd: RawFd) -> Result<FsType> {
    // SAFETY: statfs is plain data filled by the kernel.
    unsafe {
        let mut st: libc::statfs = std::mem::zeroed();
        check(libc::fstatfs(fd, &mut st))?;
        Ok(FsType::from_magic(st.f_type as i64))
    }
}

/// Running kernel as (major, minor).
pub fn kernel_version() -> (u32, u32) {
    // SAFETY: utsname is plain data filled by the kernel.
    unsafe {
        let mut u: libc::utsname = std::mem::zeroed();
        if libc::uname(&mut u) != 0 {
            return (0, 0);
        }
        let release = std::ffi::CStr::from_ptr(u.release.as_ptr());
        parse_kernel_release(&release.to_string_lossy())
    }
}

fn parse_kernel_release(release: &str) -> (u32, u32) {
    let mut parts = release.split(|c: char| !c.is_ascii_digit()).filter(|s| !s.is_empty());
    let major = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let minor = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    (major, minor)
}

/// Put a descriptor in non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> Result<()> {
    // SAFETY: fcntl on a descriptor we were handed.
    unsafe {
        let flags = check(libc::fcntl(fd, libc::F_GETFL))?;
        check(libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_online_cpus_not_empty() {
        let cpus = online_cpus();
        assert!(!cpus.is_empty());
        assert!(cpus.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_fs_magic() {
        assert_eq!(FsType::from_magic(0x58465342), FsType::Xfs);
        assert_eq!(FsType::from_magic(0x6969), FsType::Nfs);
        assert_eq!(FsType::from_magic(0x01021994), FsType::Tmpfs);
        assert_eq!(FsType::from_magic(0xEF53), FsType::Other(0xEF53));
    }

    #[test]
    fn test_parse_kernel_release() {
        assert_eq!(parse_kernel_release("5.15.0-91-generic"), (5, 15));
        assert_eq!(parse_kernel_release("3.10"), (3, 10));
        assert_eq!(parse_kernel_release("garbage"), (0, 0));
        assert!(kernel_version().0 >= 2);
    }

    #[test]
    fn test_check_maps_errno() {
        // SAFETY: closing an invalid descriptor only sets errno.
        let r = check(unsafe { libc::close(-1) });
        assert_eq!(r.unwrap_err().errno(), Some(libc::EBADF));
    }
}
