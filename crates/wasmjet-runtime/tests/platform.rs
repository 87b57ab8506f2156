//! Hardware faults raised under `catch_traps` come back as structured traps.

use std::hint::black_box;
use std::ptr;
use wasmjet_runtime::platform::catch_traps;
use wasmjet_runtime::{Memory, MemoryPlan, Mmap, TrapReason, PAGE_SIZE};

#[test]
fn fault_in_linear_memory_is_out_of_bounds() {
    let mem = Memory::new(MemoryPlan {
        initial: 1,
        maximum: 4,
        guarded: false,
        shared: false,
    })
    .unwrap();
    let base = mem.base();
    let trap = catch_traps(|| {
        // SAFETY: deliberately touches the inaccessible second page.
        unsafe { ptr::read_volatile(base.add(PAGE_SIZE)) };
    })
    .unwrap_err();
    assert_eq!(trap.reason, TrapReason::MemoryOutOfBounds);
    assert!(!trap.call_stack.is_empty());

    // The thread is still usable and the next call succeeds.
    assert!(catch_traps(|| {
        // SAFETY: first page is committed.
        unsafe { ptr::read_volatile(base) };
    })
    .is_ok());
}

#[test]
fn fault_elsewhere_is_access_violation() {
    let region = Mmap::reserve(4096).unwrap();
    let addr = region.as_ptr();
    let trap = catch_traps(|| {
        // SAFETY: deliberately touches an inaccessible page.
        unsafe { ptr::write_volatile(addr, 1u8) };
    })
    .unwrap_err();
    assert_eq!(
        trap.reason,
        TrapReason::AccessViolation {
            address: addr as usize
        }
    );
}

#[inline(never)]
fn recurse(depth: u64) -> u64 {
    let buf = black_box([depth; 32]);
    if black_box(true) {
        recurse(depth + 1) + buf[3]
    } else {
        buf[0]
    }
}

#[test]
fn stack_exhaustion_is_stack_overflow() {
    let handle = std::thread::Builder::new()
        .stack_size(256 * 1024)
        .spawn(|| {
            let trap = catch_traps(|| {
                black_box(recurse(0));
            })
            .unwrap_err();
            assert_eq!(trap.reason, TrapReason::StackOverflow);
            // A second overflow on the same thread is handled too.
            let again = catch_traps(|| {
                black_box(recurse(0));
            })
            .unwrap_err();
            assert_eq!(again.reason, TrapReason::StackOverflow);
        })
        .unwrap();
    handle.join().unwrap();
}

#[cfg(target_arch = "x86_64")]
#[test]
fn hardware_divide_error_is_integer_trap() {
    let trap = catch_traps(|| {
        // SAFETY: raises #DE, which is delivered as SIGFPE.
        unsafe {
            core::arch::asm!(
                "xor edx, edx",
                "xor ecx, ecx",
                "div ecx",
                inout("eax") 1u32 => _,
                out("ecx") _,
                out("edx") _,
            )
        };
    })
    .unwrap_err();
    assert_eq!(trap.reason, TrapReason::IntegerDivideByZeroOrOverflow);
}

#[test]
fn traps_on_many_threads() {
    let threads: Vec<_> = (0..4)
        .map(|_| {
            std::thread::spawn(|| {
                for _ in 0..16 {
                    let region = Mmap::reserve(4096).unwrap();
                    let addr = region.as_ptr();
                    let trap = catch_traps(|| {
                        // SAFETY: deliberately faults.
                        unsafe { ptr::read_volatile(addr) };
                    })
                    .unwrap_err();
                    assert!(matches!(trap.reason, TrapReason::AccessViolation { .. }));
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
}
