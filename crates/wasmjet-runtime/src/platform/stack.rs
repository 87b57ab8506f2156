//! Thread stack bounds and the alternate signal stack.
//!
//! Stack exhaustion in guest code faults on the thread's guard region; the
//! handler can only run if it has its own stack, and can only classify the
//! fault if it knows where the thread's stack ends. Both are set up from
//! `catch_traps`, never from inside the handler.

use super::fatal;
use crate::mmap::{host_page_size, Mmap};
use core::cell::{Cell, RefCell};
use core::{mem, ptr};

/// Size of the alternate signal stack installed for threads running guest
/// code.
pub const ALT_STACK_SIZE: usize = 64 * 1024;

/// Usable stack range `[lo, hi)` of a thread plus its guard size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    pub lo: usize,
    pub hi: usize,
    pub guard: usize,
}

impl StackBounds {
    /// Bounds of the calling thread, cached after the first query.
    pub fn current() -> Option<StackBounds> {
        thread_local! {
            static BOUNDS: Cell<Option<StackBounds>> = const { Cell::new(None) };
        }
        BOUNDS.with(|cached| {
            if cached.get().is_none() {
                cached.set(query_bounds());
            }
            cached.get()
        })
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.lo && addr < self.hi
    }

    /// Whether a fault at `addr` is the thread running out of stack, that
    /// is, it hit the guard region next to `lo`. Without a known guard size
    /// the single page on either side of `lo` counts.
    pub fn is_overflow(&self, addr: usize) -> bool {
        // Some libcs count the guard as part of the stack, others place it
        // below `lo`; accept both.
        let page = host_page_size();
        let below = if self.guard == 0 { page } else { self.guard };
        let above = self.guard.max(page);
        addr >= self.lo.saturating_sub(below) && addr < self.lo + above
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn query_bounds() -> Option<StackBounds> {
            // SAFETY: plain pthread queries on the current thread; `attr` is
            // destroyed before returning.
            unsafe {
                let mut attr: libc::pthread_attr_t = mem::zeroed();
                if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
                    return None;
                }
                let mut addr: *mut libc::c_void = ptr::null_mut();
                let mut size = 0usize;
                let mut guard = 0usize;
                let ok = libc::pthread_attr_getstack(&attr, &mut addr, &mut size) == 0
                    && libc::pthread_attr_getguardsize(&attr, &mut guard) == 0;
                libc::pthread_attr_destroy(&mut attr);
                if !ok {
                    return None;
                }
                let lo = addr as usize;
                Some(StackBounds {
                    lo,
                    hi: lo + size,
                    guard,
                })
            }
        }
    } else if #[cfg(target_os = "macos")] {
        fn query_bounds() -> Option<StackBounds> {
            // SAFETY: plain pthread queries on the current thread.
            unsafe {
                let thread = libc::pthread_self();
                let hi = libc::pthread_get_stackaddr_np(thread) as usize;
                let size = libc::pthread_get_stacksize_np(thread);
                Some(StackBounds {
                    lo: hi - size,
                    hi,
                    guard: host_page_size(),
                })
            }
        }
    } else {
        fn query_bounds() -> Option<StackBounds> {
            None
        }
    }
}

struct AltStack {
    mmap: Mmap,
    sp: *mut u8,
}

impl Drop for AltStack {
    fn drop(&mut self) {
        // SAFETY: only disables the alternate stack if it is still ours.
        unsafe {
            let mut current: libc::stack_t = mem::zeroed();
            if libc::sigaltstack(ptr::null(), &mut current) == 0
                && current.ss_sp.cast::<u8>() == self.sp
            {
                let disable = libc::stack_t {
                    ss_sp: ptr::null_mut(),
                    ss_flags: libc::SS_DISABLE,
                    ss_size: ALT_STACK_SIZE,
                };
                libc::sigaltstack(&disable, ptr::null_mut());
            }
        }
        tracing::trace!(len = self.mmap.len(), "released alternate signal stack");
    }
}

thread_local! {
    static ALT_STACK: RefCell<Option<AltStack>> = const { RefCell::new(None) };
}

/// Make sure the calling thread has an alternate signal stack of at least
/// [`ALT_STACK_SIZE`] bytes.
pub fn ensure_alt_stack() {
    ALT_STACK.with(|slot| {
        if slot.borrow().is_some() {
            return;
        }
        // SAFETY: querying the current alternate stack.
        let current = unsafe {
            let mut current: libc::stack_t = mem::zeroed();
            if libc::sigaltstack(ptr::null(), &mut current) != 0 {
                fatal("sigaltstack query failed");
            }
            current
        };
        if current.ss_flags & libc::SS_DISABLE == 0 && current.ss_size >= ALT_STACK_SIZE {
            return;
        }

        // One inaccessible page below the stack catches handler overflow.
        let page = host_page_size();
        let mmap = match Mmap::reserve(ALT_STACK_SIZE + page) {
            Ok(mmap) => mmap,
            Err(_) => fatal("could not reserve alternate signal stack"),
        };
        if mmap.make_accessible(page, ALT_STACK_SIZE).is_err() {
            fatal("could not commit alternate signal stack");
        }
        // SAFETY: the offset is within the mapping.
        let sp = unsafe { mmap.as_ptr().add(page) };
        let stack = libc::stack_t {
            ss_sp: sp.cast(),
            ss_flags: 0,
            ss_size: ALT_STACK_SIZE,
        };
        // SAFETY: `stack` describes committed memory owned by this thread.
        if unsafe { libc::sigaltstack(&stack, ptr::null_mut()) } != 0 {
            fatal("sigaltstack install failed");
        }
        tracing::trace!("installed alternate signal stack");
        *slot.borrow_mut() = Some(AltStack { mmap, sp });
    });
}
