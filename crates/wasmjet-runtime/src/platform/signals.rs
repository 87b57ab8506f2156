//! Process-wide fault handlers.
//!
//! Handlers for SIGSEGV, SIGBUS, SIGFPE and SIGILL run on the alternate
//! signal stack. When the faulting thread has an active recovery point the
//! fault is classified, recorded and the thread jumps back to the recovery
//! point. Otherwise the fault is not ours and is forwarded to whatever
//! handler was installed before.

use super::fatal;
use super::stack::StackBounds;
use super::traphandlers::{current_state, CallThreadState};
use crate::TrapReason;
use core::ffi::c_void;
use core::mem::{self, MaybeUninit};
use core::ptr;

static mut PREV_SIGSEGV: MaybeUninit<libc::sigaction> = MaybeUninit::uninit();
static mut PREV_SIGBUS: MaybeUninit<libc::sigaction> = MaybeUninit::uninit();
static mut PREV_SIGILL: MaybeUninit<libc::sigaction> = MaybeUninit::uninit();
static mut PREV_SIGFPE: MaybeUninit<libc::sigaction> = MaybeUninit::uninit();

/// # Safety
///
/// Must be called at most once per process.
pub(super) unsafe fn install_handlers() {
    foreach_handler(|slot, signal| {
        let mut handler: libc::sigaction = mem::zeroed();
        // SA_SIGINFO gives access to the faulting address and register
        // context, SA_ONSTACK runs the handler on the alternate stack so
        // stack exhaustion can be handled, and SA_NODEFER lets a fault in
        // the handler itself reach the reentrancy check.
        handler.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER | libc::SA_ONSTACK;
        handler.sa_sigaction = trap_handler as *const () as usize;
        libc::sigemptyset(&mut handler.sa_mask);
        if libc::sigaction(signal, &handler, slot) != 0 {
            fatal("unable to install signal handler");
        }
    });
}

unsafe fn foreach_handler(mut f: impl FnMut(*mut libc::sigaction, i32)) {
    f((&raw mut PREV_SIGSEGV).cast(), libc::SIGSEGV);
    // Guard page accesses are reported as SIGBUS on some systems.
    f((&raw mut PREV_SIGBUS).cast(), libc::SIGBUS);
    f((&raw mut PREV_SIGILL).cast(), libc::SIGILL);
    f((&raw mut PREV_SIGFPE).cast(), libc::SIGFPE);
}

unsafe extern "C" fn trap_handler(
    signum: libc::c_int,
    siginfo: *mut libc::siginfo_t,
    context: *mut c_void,
) {
    let previous: *const libc::sigaction = match signum {
        libc::SIGSEGV => (&raw const PREV_SIGSEGV).cast(),
        libc::SIGBUS => (&raw const PREV_SIGBUS).cast(),
        libc::SIGILL => (&raw const PREV_SIGILL).cast(),
        libc::SIGFPE => (&raw const PREV_SIGFPE).cast(),
        _ => return,
    };

    let state = current_state();
    if !state.is_null() {
        let state = &*state;
        if state.handling_fault.replace(true) {
            fatal("fault while handling a fault");
        }
        let (pc, fp) = context_registers(context);
        let address = match signum {
            libc::SIGSEGV | libc::SIGBUS => fault_address(siginfo),
            _ => 0,
        };
        let reason = classify(signum, address, state.bounds);
        state.record(reason, address, pc, fp);

        // On macOS jumping straight out of the handler leaves the kernel
        // believing the alternate stack is still in use. Return from the
        // handler into a shim that performs the jump instead.
        if cfg!(target_os = "macos") {
            redirect_to_unwind_shim(context, state);
            return;
        }
        state.unwind();
    }

    forward(&*previous, signum, siginfo, context);
}

fn classify(signum: libc::c_int, address: usize, bounds: Option<StackBounds>) -> TrapReason {
    match signum {
        libc::SIGFPE => TrapReason::IntegerDivideByZeroOrOverflow,
        libc::SIGILL => TrapReason::Unreachable,
        _ if bounds.is_some_and(|b| b.is_overflow(address)) => TrapReason::StackOverflow,
        _ => TrapReason::AccessViolation { address },
    }
}

unsafe fn forward(
    previous: &libc::sigaction,
    signum: libc::c_int,
    siginfo: *mut libc::siginfo_t,
    context: *mut c_void,
) {
    if previous.sa_flags & libc::SA_SIGINFO != 0 {
        mem::transmute::<usize, extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut c_void)>(
            previous.sa_sigaction,
        )(signum, siginfo, context);
    } else if previous.sa_sigaction == libc::SIG_DFL || previous.sa_sigaction == libc::SIG_IGN {
        const MSG: &[u8] = b"wasmjet: fault outside of any protected call\n";
        libc::write(2, MSG.as_ptr().cast(), MSG.len());
        // Restore the previous disposition; re-executing the faulting
        // instruction then terminates the process.
        libc::sigaction(signum, ptr::from_ref(previous), ptr::null_mut());
    } else {
        mem::transmute::<usize, extern "C" fn(libc::c_int)>(previous.sa_sigaction)(signum);
    }
}

unsafe extern "C" fn unwind_shim(state: *const CallThreadState) -> ! {
    (*state).unwind()
}

/// Red zone left below the recovery point's stack pointer for the shim.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
const SHIM_STACK_GAP: usize = 512;

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {
        unsafe fn context_registers(cx: *mut c_void) -> (usize, usize) {
            let cx = &*cx.cast::<libc::ucontext_t>();
            (
                cx.uc_mcontext.gregs[libc::REG_RIP as usize] as usize,
                cx.uc_mcontext.gregs[libc::REG_RBP as usize] as usize,
            )
        }
    } else if #[cfg(all(target_os = "linux", target_arch = "aarch64"))] {
        unsafe fn context_registers(cx: *mut c_void) -> (usize, usize) {
            let cx = &*cx.cast::<libc::ucontext_t>();
            (cx.uc_mcontext.pc as usize, cx.uc_mcontext.regs[29] as usize)
        }
    } else if #[cfg(all(target_os = "macos", target_arch = "x86_64"))] {
        unsafe fn context_registers(cx: *mut c_void) -> (usize, usize) {
            let cx = &*cx.cast::<libc::ucontext_t>();
            ((*cx.uc_mcontext).__ss.__rip as usize, (*cx.uc_mcontext).__ss.__rbp as usize)
        }
    } else if #[cfg(all(target_os = "macos", target_arch = "aarch64"))] {
        unsafe fn context_registers(cx: *mut c_void) -> (usize, usize) {
            let cx = &*cx.cast::<libc::ucontext_t>();
            ((*cx.uc_mcontext).__ss.__pc as usize, (*cx.uc_mcontext).__ss.__fp as usize)
        }
    } else {
        compile_error!("unsupported platform for the wasmjet fault handler");
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "macos")] {
        unsafe fn fault_address(siginfo: *mut libc::siginfo_t) -> usize {
            (*siginfo).si_addr as usize
        }
    } else {
        unsafe fn fault_address(siginfo: *mut libc::siginfo_t) -> usize {
            (*siginfo).si_addr() as usize
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "macos", target_arch = "x86_64"))] {
        unsafe fn redirect_to_unwind_shim(cx: *mut c_void, state: &CallThreadState) {
            let cx = &mut *cx.cast::<libc::ucontext_t>();
            let ss = &mut (*cx.uc_mcontext).__ss;
            ss.__rip = unwind_shim as *const () as usize as u64;
            ss.__rdi = ptr::from_ref(state) as u64;
            // Entered as if called: sp is 8 mod 16.
            ss.__rsp = (state.recovery_sp() - SHIM_STACK_GAP - 8) as u64;
        }
    } else if #[cfg(all(target_os = "macos", target_arch = "aarch64"))] {
        unsafe fn redirect_to_unwind_shim(cx: *mut c_void, state: &CallThreadState) {
            let cx = &mut *cx.cast::<libc::ucontext_t>();
            let ss = &mut (*cx.uc_mcontext).__ss;
            ss.__pc = unwind_shim as *const () as usize as u64;
            ss.__x[0] = ptr::from_ref(state) as u64;
            ss.__sp = (state.recovery_sp() - SHIM_STACK_GAP) as u64;
        }
    } else {
        unsafe fn redirect_to_unwind_shim(_cx: *mut c_void, _state: &CallThreadState) {
            let _ = unwind_shim;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let bounds = Some(StackBounds {
            lo: 0x10_0000_0000,
            hi: 0x10_0010_0000,
            guard: 4096,
        });
        assert_eq!(
            classify(libc::SIGFPE, 0, bounds),
            TrapReason::IntegerDivideByZeroOrOverflow
        );
        assert_eq!(classify(libc::SIGILL, 0, bounds), TrapReason::Unreachable);
        assert_eq!(
            classify(libc::SIGSEGV, 0x10_0000_0000 - 16, bounds),
            TrapReason::StackOverflow
        );
        // A neighbouring mapping below the guard is an ordinary fault.
        assert_eq!(
            classify(libc::SIGSEGV, 0x10_0000_0000 - 0x10_0000, bounds),
            TrapReason::AccessViolation {
                address: 0x10_0000_0000 - 0x10_0000
            }
        );
        assert_eq!(
            classify(libc::SIGSEGV, 0x42, bounds),
            TrapReason::AccessViolation { address: 0x42 }
        );
        assert_eq!(
            classify(libc::SIGBUS, 0x42, None),
            TrapReason::AccessViolation { address: 0x42 }
        );
    }
}
