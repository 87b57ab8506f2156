//! `wasmjet-runtime`: runtime library for code emitted by the wasmjet JIT.
//!
//! Everything here is addressed directly by generated machine code or by the
//! signal handler, so the types are `#[repr(C)]` where their layout is baked
//! into code and their storage never moves once created. It provides:
//! - `Memory` for Wasm linear memory backed by a virtual-memory reservation
//! - `Table` / `FuncRef` for indirect calls
//! - `Global` slots whose addresses are baked into compiled code
//! - `Trap` / `TrapReason` and the platform fault layer that produces them
//! - `libcalls`, the `extern "C"` entry points JIT code calls back into

/// WebAssembly page size: 64 KiB.
pub const PAGE_SIZE: usize = 65536;

/// Maximum number of pages a 32-bit linear memory can address.
pub const MAX_WASM_PAGES: u32 = 65536;

mod mmap;
pub use mmap::{host_page_size, Mmap};

mod memory;
pub use memory::{Memory, MemoryDefinition, MemoryPlan};

mod table;
pub use table::{FuncRef, Table, TableDefinition, TablePlan};

mod global;
pub use global::Global;

mod value;
pub use value::{ValType, Value};

mod trap;
pub use trap::{CallStack, Frame, Trap, TrapReason};

pub mod libcalls;
pub mod ops;
pub mod platform;
pub mod registry;

/// Errors raised while creating or resizing runtime objects.
///
/// These are resource or construction failures reported to the host, never
/// Wasm traps.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// Initial pages exceeds the maximum for memory.
    #[error("memory initial size of {initial} pages exceeds maximum of {max} pages")]
    MemoryInitialPagesExceedsMax { initial: u32, max: u32 },
    /// Initial size exceeds the maximum for a table.
    #[error("table initial size of {initial} elements exceeds maximum of {max} elements")]
    TableInitialSizeExceedsMax { initial: u32, max: u32 },
    /// The OS refused to reserve address space.
    #[error("failed to reserve {size} bytes of address space (errno {errno})")]
    ReserveFailed { size: usize, errno: i32 },
    /// The OS refused to make reserved pages accessible.
    #[error("failed to commit {size} bytes at offset {offset} (errno {errno})")]
    CommitFailed {
        offset: usize,
        size: usize,
        errno: i32,
    },
    /// A value of the wrong type was written to a global.
    #[error("global of type {expected} cannot hold a value of type {got}")]
    GlobalTypeMismatch { expected: ValType, got: ValType },
    /// `set` was called on an immutable global.
    #[error("global is immutable")]
    ImmutableGlobal,
}

pub(crate) fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_reason_is_copy() {
        let reason = TrapReason::MemoryOutOfBounds;
        let reason2 = reason; // Copy
        assert_eq!(reason, reason2);
    }

    #[test]
    fn runtime_error_messages() {
        let err = RuntimeError::MemoryInitialPagesExceedsMax { initial: 4, max: 2 };
        assert_eq!(
            err.to_string(),
            "memory initial size of 4 pages exceeds maximum of 2 pages"
        );
        assert_eq!(RuntimeError::ImmutableGlobal.to_string(), "global is immutable");
    }

    #[test]
    fn page_size_is_64k() {
        assert_eq!(PAGE_SIZE, 64 * 1024);
        assert_eq!(MAX_WASM_PAGES as usize * PAGE_SIZE, 1usize << 32);
    }
}
