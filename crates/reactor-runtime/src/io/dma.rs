//! Aligned buffers for O_DIRECT transfers

use bytes::Bytes;
use reactor_core::error::invariant_violation;
use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Owned, aligned byte buffer.
///
/// The visible window `[start, start + len)` shrinks with
/// [`trim_front`](Self::trim_front) and [`trim_to`](Self::trim_to); the
/// allocation itself never moves, so the kernel may write into it while a
/// request is in flight.
pub struct DmaBuffer {
    ptr: NonNull<u8>,
    cap: usize,
    align: usize,
    start: usize,
    len: usize,
}

// SAFETY: the buffer owns its allocation exclusively.
unsafe impl Send for DmaBuffer {}

impl DmaBuffer {
    /// Zeroed buffer of `len` bytes aligned to `align` (rounded up to a
    /// power of two).
    pub fn new(len: usize, align: usize) -> Self {
        let align = align.max(1).next_power_of_two();
        let cap = len.max(1);
        let layout = match Layout::from_size_align(cap, align) {
            Ok(l) => l,
            Err(_) => invariant_violation(format!("bad dma layout: {} bytes at {}", len, align)),
        };
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };
        Self { ptr, cap, align, start: 0, len }
    }

    /// Copy `data` into a fresh buffer padded with zeros to `align`.
    pub fn copy_from(data: &[u8], align: usize) -> Self {
        let padded = align_up(data.len() as u64, align.max(1) as u64) as usize;
        let mut buf = Self::new(padded, align);
        buf.as_mut_slice()[..data.len()].copy_from_slice(data);
        buf
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn align(&self) -> usize {
        self.align
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the window lies within the allocation.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(self.start), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the window lies within the allocation and we hold &mut.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(self.start), self.len) }
    }

    /// Start of the visible window, for handing to the kernel.
    pub fn as_ptr(&self) -> *const u8 {
        self.as_slice().as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.as_mut_slice().as_mut_ptr()
    }

    /// Drop `n` bytes from the front of the window.
    pub fn trim_front(&mut self, n: usize) {
        let n = n.min(self.len);
        self.start += n;
        self.len -= n;
    }

    /// Shorten the window to at most `len` bytes.
    pub fn trim_to(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    /// Hand the visible window to `Bytes` without copying.
    pub fn into_bytes(self) -> Bytes {
        Bytes::from_owner(self)
    }
}

impl AsRef<[u8]> for DmaBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in new() with this exact layout.
        unsafe {
            alloc::dealloc(self.ptr.as_ptr(), Layout::from_size_align_unchecked(self.cap, self.align));
        }
    }
}

impl std::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("len", &self.len)
            .field("align", &self.align)
            .field("start", &self.start)
            .finish()
    }
}

#[inline]
pub fn align_up(v: u64, align: u64) -> u64 {
    v.div_ceil(align) * align
}

#[inline]
pub fn align_down(v: u64, align: u64) -> u64 {
    v / align * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_and_zeroed() {
        let b = DmaBuffer::new(8192, 4096);
        assert_eq!(b.as_ptr() as usize % 4096, 0);
        assert_eq!(b.len(), 8192);
        assert!(b.as_slice().iter().all(|&x| x == 0));
        let odd = DmaBuffer::new(10, 300);
        assert_eq!(odd.align(), 512);
    }

    #[test]
    fn test_trim_window() {
        let mut b = DmaBuffer::copy_from(b"hello world", 512);
        assert_eq!(b.len(), 512);
        b.trim_front(6);
        b.trim_to(5);
        assert_eq!(b.as_slice(), b"world");
        let bytes = b.into_bytes();
        assert_eq!(&bytes[..], b"world");
    }

    #[test]
    fn test_align_helpers() {
        assert_eq!(align_up(0, 512), 0);
        assert_eq!(align_up(1, 512), 512);
        assert_eq!(align_up(512, 512), 512);
        assert_eq!(align_down(1023, 512), 512);
    }
}
