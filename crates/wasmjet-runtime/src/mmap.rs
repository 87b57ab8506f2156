//! An owned virtual-memory region.
//!
//! Regions are reserved inaccessible (`PROT_NONE`) and individual ranges are
//! later made readable/writable. Unmapped on drop.

use crate::{last_errno, RuntimeError};
use core::ptr::{self, NonNull};
use std::sync::OnceLock;

/// Page size of the host, queried once.
pub fn host_page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(size).unwrap_or(4096)
    })
}

/// Round `size` up to a multiple of the host page size.
pub fn round_up_to_host_pages(size: usize) -> Option<usize> {
    let page = host_page_size();
    size.checked_add(page - 1).map(|s| s & !(page - 1))
}

#[derive(Debug)]
pub struct Mmap {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the region is plain memory owned by this value; concurrent access
// to its contents is governed by the owners (linear memory semantics).
unsafe impl Send for Mmap {}
// SAFETY: see above.
unsafe impl Sync for Mmap {}

impl Mmap {
    /// Reserve `size` bytes of address space with no access permissions.
    pub fn reserve(size: usize) -> Result<Self, RuntimeError> {
        let len = round_up_to_host_pages(size.max(1)).ok_or(RuntimeError::ReserveFailed {
            size,
            errno: libc::ENOMEM,
        })?;
        // SAFETY: anonymous mapping at a kernel-chosen address.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(RuntimeError::ReserveFailed {
                size: len,
                errno: last_errno(),
            });
        }
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or(RuntimeError::ReserveFailed {
            size: len,
            errno: libc::ENOMEM,
        })?;
        Ok(Mmap { ptr, len })
    }

    /// Make `[start, start + len)` readable and writable.
    ///
    /// `start` must be host-page aligned; `len` is rounded up to whole pages.
    pub fn make_accessible(&self, start: usize, len: usize) -> Result<(), RuntimeError> {
        if len == 0 {
            return Ok(());
        }
        let fail = |errno| RuntimeError::CommitFailed {
            offset: start,
            size: len,
            errno,
        };
        let rounded = round_up_to_host_pages(len).ok_or(fail(libc::ENOMEM))?;
        let end = start.checked_add(rounded).ok_or(fail(libc::ENOMEM))?;
        if end > self.len || start % host_page_size() != 0 {
            return Err(fail(libc::EINVAL));
        }
        // SAFETY: the range lies within our own mapping.
        let rc = unsafe {
            libc::mprotect(
                self.ptr.as_ptr().add(start).cast(),
                rounded,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            return Err(fail(last_errno()));
        }
        Ok(())
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        // SAFETY: we own the mapping and nothing refers to it any more.
        let rc = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
        if rc != 0 {
            tracing::warn!(len = self.len, "munmap failed: errno {}", last_errno());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_rounds_to_pages() {
        let m = Mmap::reserve(1).unwrap();
        assert_eq!(m.len(), host_page_size());
        assert_eq!(m.as_ptr() as usize % host_page_size(), 0);
    }

    #[test]
    fn committed_range_is_writable() {
        let page = host_page_size();
        let m = Mmap::reserve(4 * page).unwrap();
        m.make_accessible(page, page).unwrap();
        // SAFETY: the second page was just made read/write.
        unsafe {
            m.as_ptr().add(page).write(0xab);
            assert_eq!(m.as_ptr().add(page).read(), 0xab);
            assert_eq!(m.as_ptr().add(2 * page - 1).read(), 0);
        }
    }

    #[test]
    fn commit_outside_region_fails() {
        let page = host_page_size();
        let m = Mmap::reserve(page).unwrap();
        assert!(matches!(
            m.make_accessible(0, 2 * page),
            Err(RuntimeError::CommitFailed { .. })
        ));
        assert!(matches!(
            m.make_accessible(1, 1),
            Err(RuntimeError::CommitFailed { .. })
        ));
    }
}
