//! Thread-local recovery points and trap delivery.
//!
//! Every protected call pushes a `CallThreadState` onto a per-thread chain
//! and pops it on exit through a drop guard, so nested host → guest → host
//! → guest calls each get their own recovery point. Traps are delivered to
//! the innermost one.

use super::recovery::{call_with_recovery, unwind_to_recovery, RecoveryBuf};
use super::stack::{self, StackBounds};
use super::{fatal, init};
use crate::{registry, CallStack, Trap, TrapReason};
use core::arch::naked_asm;
use core::cell::{Cell, UnsafeCell};
use core::mem;
use core::ptr;

/// Frames captured per trap.
pub(super) const MAX_FRAMES: usize = 64;

/// What the trap site left for the recovery point to reify. Written without
/// allocating, possibly from a signal handler.
pub(super) struct UnwindRecord {
    reason: TrapReason,
    /// Faulting data address of a memory fault, 0 otherwise.
    fault_address: usize,
    pcs: [usize; MAX_FRAMES],
    len: usize,
}

pub(super) struct CallThreadState {
    recovery: UnsafeCell<RecoveryBuf>,
    unwind: UnsafeCell<UnwindRecord>,
    pub(super) bounds: Option<StackBounds>,
    pub(super) handling_fault: Cell<bool>,
    prev: Cell<*const CallThreadState>,
}

thread_local! {
    static CURRENT: Cell<*const CallThreadState> = const { Cell::new(ptr::null()) };
}

/// The innermost active recovery point of this thread, or null.
#[inline]
pub(super) fn current_state() -> *const CallThreadState {
    CURRENT.try_with(|c| c.get()).unwrap_or(ptr::null())
}

impl CallThreadState {
    fn new(bounds: Option<StackBounds>) -> Self {
        Self {
            recovery: UnsafeCell::new(RecoveryBuf::new()),
            unwind: UnsafeCell::new(UnwindRecord {
                reason: TrapReason::Unreachable,
                fault_address: 0,
                pcs: [0; MAX_FRAMES],
                len: 0,
            }),
            bounds,
            handling_fault: Cell::new(false),
            prev: Cell::new(ptr::null()),
        }
    }

    fn with(&self, closure: impl FnOnce(&Self) -> i32) -> i32 {
        struct Reset<'a> {
            state: &'a CallThreadState,
        }

        impl Drop for Reset<'_> {
            #[inline]
            fn drop(&mut self) {
                self.state.pop();
            }
        }

        self.push();
        let reset = Reset { state: self };
        closure(reset.state)
    }

    #[inline]
    fn push(&self) {
        debug_assert!(self.prev.get().is_null());
        self.prev
            .set(CURRENT.with(|c| c.replace(ptr::from_ref(self))));
    }

    #[inline]
    fn pop(&self) {
        let prev = self.prev.replace(ptr::null());
        let head = CURRENT.with(|c| c.replace(prev));
        debug_assert!(ptr::eq(head, self));
    }

    /// Record a trap at `pc` with frame pointer `fp`. `pc == 0` records no
    /// frames. `fault_address` is the data address of a memory fault, or 0.
    ///
    /// # Safety
    ///
    /// Must only be called by the thread owning this state, at most once per
    /// unwind.
    pub(super) unsafe fn record(
        &self,
        reason: TrapReason,
        fault_address: usize,
        pc: usize,
        fp: usize,
    ) {
        let record = &mut *self.unwind.get();
        record.reason = reason;
        record.fault_address = fault_address;
        record.len = if pc == 0 {
            0
        } else {
            walk_frames(self.bounds, pc, fp, &mut record.pcs)
        };
    }

    /// Jump back to the recovery point.
    ///
    /// # Safety
    ///
    /// `record` must have been called, and the recovery point must still be
    /// live on this thread's stack.
    pub(super) unsafe fn unwind(&self) -> ! {
        unwind_to_recovery(self.recovery.get(), 1)
    }

    #[cfg(target_os = "macos")]
    pub(super) fn recovery_sp(&self) -> usize {
        // SAFETY: the buffer was filled when the recovery point was entered.
        unsafe { (*self.recovery.get()).saved_sp() }
    }

    /// # Safety
    ///
    /// Only valid after an unwind delivered a record.
    unsafe fn take_record(&self) -> &UnwindRecord {
        &*self.unwind.get()
    }
}

/// Walk the frame-pointer chain starting at `fp`, staying inside the thread
/// stack. Both supported architectures keep `[fp]` = caller's fp and
/// `[fp + 8]` = return address.
unsafe fn walk_frames(
    bounds: Option<StackBounds>,
    pc: usize,
    mut fp: usize,
    out: &mut [usize; MAX_FRAMES],
) -> usize {
    out[0] = pc;
    let mut len = 1;
    let Some(bounds) = bounds else {
        return len;
    };
    let word = mem::size_of::<usize>();
    while len < MAX_FRAMES {
        if fp % word != 0 || !bounds.contains(fp) || !bounds.contains(fp + 2 * word - 1) {
            break;
        }
        let ret = *((fp + word) as *const usize);
        let next = *(fp as *const usize);
        if ret == 0 {
            break;
        }
        out[len] = ret;
        len += 1;
        if next <= fp {
            break;
        }
        fp = next;
    }
    len
}

unsafe extern "C" fn call_closure<F: FnMut()>(data: *mut u8) {
    (*data.cast::<F>())()
}

/// Run `f` under trap protection.
///
/// A trap raised by generated code or a hardware fault anywhere below `f`
/// on this thread abandons the call and is returned as `Err`. Frames
/// between the fault and this call are discarded without running
/// destructors; `f` must only enter generated code through `extern "C"`
/// trampolines.
pub fn catch_traps<F: FnMut()>(mut f: F) -> Result<(), Trap> {
    init();
    stack::ensure_alt_stack();
    let state = CallThreadState::new(StackBounds::current());
    let data: *mut F = &mut f;
    let status = state.with(|state| {
        // SAFETY: `state` and `f` outlive the protected call.
        unsafe { call_with_recovery(state.recovery.get(), call_closure::<F>, data.cast()) }
    });
    if status == 0 {
        return Ok(());
    }
    // SAFETY: a non-zero status means a record was written before unwinding.
    let record = unsafe { state.take_record() };
    Err(reify(record))
}

/// Build the trap for a delivered record. A fault inside a registered
/// linear-memory reservation is an out-of-bounds access whatever the signal
/// handler guessed from the stack bounds.
fn reify(record: &UnwindRecord) -> Trap {
    let reason = if record.fault_address != 0 && registry::is_memory_address(record.fault_address)
    {
        TrapReason::MemoryOutOfBounds
    } else {
        record.reason
    };
    let call_stack = CallStack::from_pcs(&record.pcs[..record.len]);
    tracing::debug!(%reason, frames = call_stack.len(), "trap delivered");
    Trap { reason, call_stack }
}

/// Abandon the innermost protected call with `reason`.
///
/// # Safety
///
/// Every frame between the caller and the enclosing [`catch_traps`] is
/// discarded without running destructors.
pub unsafe fn raise_trap(reason: TrapReason) -> ! {
    let state = current_state();
    if state.is_null() {
        fatal("trap raised outside of a protected call");
    }
    let state = &*state;
    state.record(reason, 0, 0, 0);
    state.unwind()
}

extern "C" fn raise_trap_from_jit(code: u32, fp: usize, pc: usize) -> ! {
    let Some(reason) = TrapReason::from_code(code) else {
        fatal("generated code raised an unknown trap code");
    };
    let state = current_state();
    if state.is_null() {
        fatal("trap raised outside of a protected call");
    }
    // SAFETY: the state is this thread's innermost live recovery point.
    unsafe {
        let state = &*state;
        state.record(reason, 0, pc, fp);
        state.unwind()
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// Trap entry point for generated code. Captures the caller's frame
        /// pointer and return address, then tail-calls into the runtime.
        ///
        /// # Safety
        ///
        /// Must only be called from generated code inside [`catch_traps`].
        #[unsafe(naked)]
        pub unsafe extern "C" fn wasmjet_raise_trap(code: u32) -> ! {
            naked_asm!(
                "mov rsi, rbp",
                "mov rdx, qword ptr [rsp]",
                "jmp {inner}",
                inner = sym raise_trap_from_jit,
            )
        }
    } else if #[cfg(target_arch = "aarch64")] {
        /// Trap entry point for generated code. Captures the caller's frame
        /// pointer and return address, then tail-calls into the runtime.
        ///
        /// # Safety
        ///
        /// Must only be called from generated code inside [`catch_traps`].
        #[unsafe(naked)]
        pub unsafe extern "C" fn wasmjet_raise_trap(code: u32) -> ! {
            naked_asm!(
                "mov x1, x29",
                "mov x2, x30",
                "b {inner}",
                inner = sym raise_trap_from_jit,
            )
        }
    }
}
