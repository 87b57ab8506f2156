//! Saved execution contexts for non-local exits out of guest code.
//!
//! `call_with_recovery` records the callee-saved registers, stack pointer and
//! return address of its caller, then calls `f(arg)`. If anything below it
//! later calls `unwind_to_recovery` with the same buffer, execution resumes
//! as if `call_with_recovery` had returned the given non-zero value. Frames
//! between the two are discarded without running destructors, so only
//! generated code and `extern "C"` shims holding no owned resources may sit
//! in between.

use core::arch::naked_asm;

/// Register save area. Large enough for every supported architecture.
#[repr(C, align(16))]
pub struct RecoveryBuf([usize; 24]);

impl RecoveryBuf {
    pub const fn new() -> Self {
        Self([0; 24])
    }

    /// Stack pointer of the recovery point's caller.
    #[cfg(target_os = "macos")]
    pub fn saved_sp(&self) -> usize {
        self.0[SP_SLOT]
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        #[cfg(target_os = "macos")]
        const SP_SLOT: usize = 6;

        /// # Safety
        ///
        /// `buf` must stay valid and unmoved until this call returns.
        #[unsafe(naked)]
        pub unsafe extern "C" fn call_with_recovery(
            buf: *mut RecoveryBuf,
            f: unsafe extern "C" fn(*mut u8),
            arg: *mut u8,
        ) -> i32 {
            naked_asm!(
                "mov qword ptr [rdi], rbx",
                "mov qword ptr [rdi + 8], rbp",
                "mov qword ptr [rdi + 16], r12",
                "mov qword ptr [rdi + 24], r13",
                "mov qword ptr [rdi + 32], r14",
                "mov qword ptr [rdi + 40], r15",
                // sp as it will be after our `ret`
                "lea rax, [rsp + 8]",
                "mov qword ptr [rdi + 48], rax",
                "mov rax, qword ptr [rsp]",
                "mov qword ptr [rdi + 56], rax",
                // realign to 16 bytes for the call
                "push rbp",
                "mov rdi, rdx",
                "call rsi",
                "pop rbp",
                "xor eax, eax",
                "ret",
            )
        }

        /// # Safety
        ///
        /// `buf` must have been filled by a `call_with_recovery` that is still
        /// on the stack. `val` must be non-zero.
        #[unsafe(naked)]
        pub unsafe extern "C" fn unwind_to_recovery(buf: *const RecoveryBuf, val: i32) -> ! {
            naked_asm!(
                "mov rbx, qword ptr [rdi]",
                "mov rbp, qword ptr [rdi + 8]",
                "mov r12, qword ptr [rdi + 16]",
                "mov r13, qword ptr [rdi + 24]",
                "mov r14, qword ptr [rdi + 32]",
                "mov r15, qword ptr [rdi + 40]",
                "mov rsp, qword ptr [rdi + 48]",
                "mov eax, esi",
                "jmp qword ptr [rdi + 56]",
            )
        }
    } else if #[cfg(target_arch = "aarch64")] {
        #[cfg(target_os = "macos")]
        const SP_SLOT: usize = 12;

        /// # Safety
        ///
        /// `buf` must stay valid and unmoved until this call returns.
        #[unsafe(naked)]
        pub unsafe extern "C" fn call_with_recovery(
            buf: *mut RecoveryBuf,
            f: unsafe extern "C" fn(*mut u8),
            arg: *mut u8,
        ) -> i32 {
            naked_asm!(
                "stp x19, x20, [x0, #0]",
                "stp x21, x22, [x0, #16]",
                "stp x23, x24, [x0, #32]",
                "stp x25, x26, [x0, #48]",
                "stp x27, x28, [x0, #64]",
                "stp x29, x30, [x0, #80]",
                "mov x9, sp",
                "str x9, [x0, #96]",
                "stp d8, d9, [x0, #104]",
                "stp d10, d11, [x0, #120]",
                "stp d12, d13, [x0, #136]",
                "stp d14, d15, [x0, #152]",
                "stp x29, x30, [sp, #-16]!",
                "mov x29, sp",
                "mov x0, x2",
                "blr x1",
                "ldp x29, x30, [sp], #16",
                "mov w0, #0",
                "ret",
            )
        }

        /// # Safety
        ///
        /// `buf` must have been filled by a `call_with_recovery` that is still
        /// on the stack. `val` must be non-zero.
        #[unsafe(naked)]
        pub unsafe extern "C" fn unwind_to_recovery(buf: *const RecoveryBuf, val: i32) -> ! {
            naked_asm!(
                "ldp x19, x20, [x0, #0]",
                "ldp x21, x22, [x0, #16]",
                "ldp x23, x24, [x0, #32]",
                "ldp x25, x26, [x0, #48]",
                "ldp x27, x28, [x0, #64]",
                "ldp x29, x30, [x0, #80]",
                "ldr x9, [x0, #96]",
                "mov sp, x9",
                "ldp d8, d9, [x0, #104]",
                "ldp d10, d11, [x0, #120]",
                "ldp d12, d13, [x0, #136]",
                "ldp d14, d15, [x0, #152]",
                "mov w0, w1",
                "ret",
            )
        }
    } else {
        compile_error!("wasmjet-runtime supports x86_64 and aarch64 hosts only");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    struct Ctx {
        buf: RecoveryBuf,
        reached: Cell<u32>,
    }

    unsafe extern "C" fn returns_normally(arg: *mut u8) {
        let ctx = &*arg.cast::<Ctx>();
        ctx.reached.set(ctx.reached.get() + 1);
    }

    unsafe extern "C" fn unwinds(arg: *mut u8) {
        let ctx = &*arg.cast::<Ctx>();
        ctx.reached.set(ctx.reached.get() + 1);
        nested(ctx);
    }

    #[inline(never)]
    unsafe fn nested(ctx: &Ctx) {
        ctx.reached.set(ctx.reached.get() + 10);
        unwind_to_recovery(&ctx.buf, 42);
    }

    #[test]
    fn normal_return_yields_zero() {
        let mut ctx = Ctx {
            buf: RecoveryBuf::new(),
            reached: Cell::new(0),
        };
        let ptr: *mut Ctx = &mut ctx;
        // SAFETY: ctx outlives the call.
        let r = unsafe { call_with_recovery(&mut (*ptr).buf, returns_normally, ptr.cast()) };
        assert_eq!(r, 0);
        assert_eq!(ctx.reached.get(), 1);
    }

    #[test]
    fn unwind_resumes_at_recovery_point() {
        let mut ctx = Ctx {
            buf: RecoveryBuf::new(),
            reached: Cell::new(0),
        };
        let ptr: *mut Ctx = &mut ctx;
        let before = 0x5a5a_u64;
        // SAFETY: ctx outlives the call; `unwinds` holds no owned resources.
        let r = unsafe { call_with_recovery(&mut (*ptr).buf, unwinds, ptr.cast()) };
        assert_eq!(r, 42);
        assert_eq!(ctx.reached.get(), 11);
        assert_eq!(before, 0x5a5a);
    }

    #[test]
    fn recovery_point_is_reusable() {
        let mut ctx = Ctx {
            buf: RecoveryBuf::new(),
            reached: Cell::new(0),
        };
        let ptr: *mut Ctx = &mut ctx;
        for _ in 0..3 {
            // SAFETY: as above.
            let r = unsafe { call_with_recovery(&mut (*ptr).buf, unwinds, ptr.cast()) };
            assert_eq!(r, 42);
        }
        assert_eq!(ctx.reached.get(), 33);
    }
}
