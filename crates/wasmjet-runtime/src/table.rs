//! Wasm indirect call table backing `call_indirect`.
//!
//! A table is a vector of nullable function references. Each entry pairs an
//! engine-wide function type id with a native entry point; `call_indirect`
//! code loads both straight out of the table's storage, compares the type id
//! against the call site's expected id and calls through the pointer.
//!
//! Storage is a virtual-memory reservation sized for the table's maximum so
//! the element array never moves. Only the active prefix is committed.

use crate::mmap::{host_page_size, Mmap};
use crate::platform::sync::Mutex;
use crate::{RuntimeError, TrapReason};
use core::mem::{offset_of, size_of};
use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};

/// A single table entry: a typed function reference.
///
/// `type_id == 0` is the null reference.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuncRef {
    /// Interned function type id; equal ids mean identical signatures.
    pub type_id: u32,
    /// Native entry point of the function.
    pub func_ptr: *const u8,
}

impl FuncRef {
    pub const NULL: FuncRef = FuncRef {
        type_id: 0,
        func_ptr: ptr::null(),
    };
    pub const SIZE: i32 = size_of::<FuncRef>() as i32;
    pub const TYPE_ID_OFFSET: i32 = offset_of!(FuncRef, type_id) as i32;
    pub const FUNC_PTR_OFFSET: i32 = offset_of!(FuncRef, func_ptr) as i32;

    pub fn new(type_id: u32, func_ptr: *const u8) -> Self {
        Self { type_id, func_ptr }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.type_id == 0
    }
}

// SAFETY: `func_ptr` refers to immutable JIT code.
unsafe impl Send for FuncRef {}
// SAFETY: see above.
unsafe impl Sync for FuncRef {}

/// Shape of a table to allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TablePlan {
    pub initial: u32,
    /// Effective maximum (declared or engine default).
    pub maximum: u32,
}

/// The part of a table generated code reads directly.
#[repr(C)]
#[derive(Debug)]
pub struct TableDefinition {
    pub base: *mut FuncRef,
    pub current_elements: AtomicU32,
}

impl TableDefinition {
    pub const BASE_OFFSET: i32 = offset_of!(TableDefinition, base) as i32;
    pub const LENGTH_OFFSET: i32 = offset_of!(TableDefinition, current_elements) as i32;
}

// SAFETY: `base` points into a mapping owned by the enclosing `Table`.
unsafe impl Send for TableDefinition {}
// SAFETY: see above.
unsafe impl Sync for TableDefinition {}

/// Indirect call table.
pub struct Table {
    mmap: Mmap,
    definition: Box<TableDefinition>,
    plan: TablePlan,
    /// Serializes writers; readers (generated code) never lock.
    write_lock: Mutex<()>,
}

impl Table {
    /// Create a table with `plan.initial` null slots.
    pub fn new(plan: TablePlan) -> Result<Self, RuntimeError> {
        if plan.initial > plan.maximum {
            return Err(RuntimeError::TableInitialSizeExceedsMax {
                initial: plan.initial,
                max: plan.maximum,
            });
        }
        let reserve = elements_to_bytes(plan.maximum).max(1);
        let mmap = Mmap::reserve(reserve)?;
        mmap.make_accessible(0, elements_to_bytes(plan.initial))?;
        let definition = Box::new(TableDefinition {
            base: mmap.as_ptr().cast::<FuncRef>(),
            current_elements: AtomicU32::new(plan.initial),
        });
        tracing::debug!(
            initial = plan.initial,
            maximum = plan.maximum,
            "allocated table"
        );
        Ok(Self {
            mmap,
            definition,
            plan,
            write_lock: Mutex::new(()),
        })
    }

    pub fn plan(&self) -> &TablePlan {
        &self.plan
    }

    pub fn maximum(&self) -> u32 {
        self.plan.maximum
    }

    /// Current number of slots.
    #[inline]
    pub fn size(&self) -> u32 {
        self.definition.current_elements.load(Ordering::Acquire)
    }

    pub fn definition_ptr(&self) -> *const TableDefinition {
        &*self.definition
    }

    /// Look up a table entry by index.
    ///
    /// - `TableOutOfBounds` if `index >= size()`
    /// - `UndefinedElement` if the slot is null
    pub fn get(&self, index: u32) -> Result<FuncRef, TrapReason> {
        if index >= self.size() {
            return Err(TrapReason::TableOutOfBounds);
        }
        // SAFETY: index is within the committed prefix.
        let entry = unsafe { self.definition.base.add(index as usize).read() };
        if entry.is_null() {
            return Err(TrapReason::UndefinedElement);
        }
        Ok(entry)
    }

    /// Set a table entry; `FuncRef::NULL` clears it.
    pub fn set(&self, index: u32, entry: FuncRef) -> Result<(), TrapReason> {
        let _guard = self.write_lock.lock();
        if index >= self.size() {
            return Err(TrapReason::TableOutOfBounds);
        }
        // SAFETY: index is within the committed prefix.
        unsafe { self.definition.base.add(index as usize).write(entry) };
        Ok(())
    }

    /// Write `entries` into consecutive slots starting at `base`.
    ///
    /// The whole range is checked before any slot is written.
    pub fn init_elements(&self, base: u32, entries: &[FuncRef]) -> Result<(), TrapReason> {
        let _guard = self.write_lock.lock();
        let end = (base as u64) + entries.len() as u64;
        if end > self.size() as u64 {
            return Err(TrapReason::TableOutOfBounds);
        }
        // SAFETY: `[base, end)` is within the committed prefix.
        unsafe {
            ptr::copy_nonoverlapping(
                entries.as_ptr(),
                self.definition.base.add(base as usize),
                entries.len(),
            )
        };
        Ok(())
    }

    /// Grow the table by `delta` slots, filling new slots with `init`.
    /// Returns the previous size, or -1 on failure.
    pub fn grow(&self, delta: u32, init: FuncRef) -> i32 {
        let _guard = self.write_lock.lock();
        let old = self.size();
        let Some(new) = old.checked_add(delta).filter(|&n| n <= self.plan.maximum) else {
            return -1;
        };
        if new == old {
            return old as i32;
        }
        // Commit whole host pages covering the new slots.
        let page = host_page_size();
        let committed_end = elements_to_bytes(old).next_multiple_of(page);
        let needed_end = elements_to_bytes(new);
        if needed_end > committed_end {
            if let Err(err) = self
                .mmap
                .make_accessible(committed_end, needed_end - committed_end)
            {
                tracing::warn!(%err, old, delta, "table.grow could not commit slots");
                return -1;
            }
        }
        for i in old..new {
            // SAFETY: slot i was just committed.
            unsafe { self.definition.base.add(i as usize).write(init) };
        }
        self.definition
            .current_elements
            .store(new, Ordering::Release);
        old as i32
    }
}

impl core::fmt::Debug for Table {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Table")
            .field("size", &self.size())
            .field("plan", &self.plan)
            .finish()
    }
}

fn elements_to_bytes(count: u32) -> usize {
    count as usize * size_of::<FuncRef>()
}
