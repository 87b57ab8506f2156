//! WebAssembly linear memory backed by a virtual-memory reservation.
//!
//! The whole range a memory may ever occupy is reserved up front and only
//! the active prefix is readable/writable, so the base address never moves
//! and compiled code can bake the address of the [`MemoryDefinition`] into
//! its loads and stores.
//!
//! Two reservation strategies exist:
//! - **guarded**: 8 GiB plus a guard region. Any `u32` index plus any `u32`
//!   static offset lands inside the reservation, so generated code performs
//!   no bounds checks and out-of-bounds accesses fault on inaccessible pages.
//! - **unguarded**: only `maximum` pages are reserved and generated code
//!   compares every effective address against `current_length`.

use crate::mmap::Mmap;
use crate::platform::sync::Mutex;
use crate::{registry, RuntimeError, TrapReason, MAX_WASM_PAGES, PAGE_SIZE};
use core::mem::offset_of;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Bytes reserved for a guarded memory: the 8 GiB reachable by a 32-bit
/// index plus a 32-bit offset, followed by one Wasm page of guard.
pub const GUARDED_RESERVATION: u64 = (8 << 30) + PAGE_SIZE as u64;

/// Shape of a memory to allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryPlan {
    /// Initial size in pages.
    pub initial: u32,
    /// Effective maximum in pages (declared maximum or engine default).
    pub maximum: u32,
    /// Elide bounds checks by reserving the full 8 GiB window.
    pub guarded: bool,
    pub shared: bool,
}

/// The part of a memory generated code reads directly.
///
/// Lives in its own heap allocation so its address stays valid for as long
/// as the owning [`Memory`] does.
#[repr(C)]
#[derive(Debug)]
pub struct MemoryDefinition {
    pub base: *mut u8,
    /// Active size in bytes. Only ever grows.
    pub current_length: AtomicUsize,
}

impl MemoryDefinition {
    pub const BASE_OFFSET: i32 = offset_of!(MemoryDefinition, base) as i32;
    pub const LENGTH_OFFSET: i32 = offset_of!(MemoryDefinition, current_length) as i32;
}

// SAFETY: `base` points into a mapping owned by the enclosing `Memory`; all
// mutation of the size goes through the atomic.
unsafe impl Send for MemoryDefinition {}
// SAFETY: see above.
unsafe impl Sync for MemoryDefinition {}

/// A linear memory instance.
pub struct Memory {
    mmap: Mmap,
    definition: Box<MemoryDefinition>,
    plan: MemoryPlan,
    grow_lock: Mutex<()>,
}

impl Memory {
    /// Reserve and commit a new memory. Fresh pages are zero.
    pub fn new(plan: MemoryPlan) -> Result<Self, RuntimeError> {
        if plan.initial > plan.maximum || plan.maximum > MAX_WASM_PAGES {
            return Err(RuntimeError::MemoryInitialPagesExceedsMax {
                initial: plan.initial,
                max: plan.maximum.min(MAX_WASM_PAGES),
            });
        }
        let reservation = if plan.guarded {
            usize::try_from(GUARDED_RESERVATION).map_err(|_| RuntimeError::ReserveFailed {
                size: usize::MAX,
                errno: libc::ENOMEM,
            })?
        } else {
            pages_to_bytes(plan.maximum).max(1)
        };
        let mmap = Mmap::reserve(reservation)?;
        let initial_bytes = pages_to_bytes(plan.initial);
        mmap.make_accessible(0, initial_bytes)?;

        let definition = Box::new(MemoryDefinition {
            base: mmap.as_ptr(),
            current_length: AtomicUsize::new(initial_bytes),
        });
        registry::register_memory(mmap.as_ptr() as usize, mmap.len());
        tracing::debug!(
            initial = plan.initial,
            maximum = plan.maximum,
            guarded = plan.guarded,
            reserved = mmap.len(),
            "allocated linear memory"
        );
        Ok(Self {
            mmap,
            definition,
            plan,
            grow_lock: Mutex::new(()),
        })
    }

    pub fn plan(&self) -> &MemoryPlan {
        &self.plan
    }

    /// Current number of pages (`memory.size`).
    #[inline]
    pub fn size(&self) -> u32 {
        (self.byte_len() / PAGE_SIZE) as u32
    }

    /// Current active size in bytes.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.definition.current_length.load(Ordering::Acquire)
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.definition.base
    }

    pub fn maximum(&self) -> u32 {
        self.plan.maximum
    }

    pub fn is_guarded(&self) -> bool {
        self.plan.guarded
    }

    pub fn is_shared(&self) -> bool {
        self.plan.shared
    }

    /// Address of the definition, stable for the lifetime of `self`.
    pub fn definition_ptr(&self) -> *const MemoryDefinition {
        &*self.definition
    }

    /// Start and length of the reserved address range.
    pub fn reservation(&self) -> (usize, usize) {
        (self.mmap.as_ptr() as usize, self.mmap.len())
    }

    /// `memory.grow`: returns the previous page count, or -1 if the new size
    /// would exceed the maximum or the pages could not be committed.
    pub fn grow(&self, delta: u32) -> i32 {
        let _guard = self.grow_lock.lock();
        let old = self.size();
        let Some(new) = grow_target(old, delta, self.plan.maximum) else {
            return -1;
        };
        if new > old {
            let start = pages_to_bytes(old);
            let len = pages_to_bytes(new - old);
            if let Err(err) = self.mmap.make_accessible(start, len) {
                tracing::warn!(%err, old, delta, "memory.grow could not commit pages");
                return -1;
            }
            self.definition
                .current_length
                .store(pages_to_bytes(new), Ordering::Release);
        }
        old as i32
    }

    /// Copy bytes out of linear memory.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), TrapReason> {
        checked_range(self.byte_len(), offset, buf.len())?;
        // SAFETY: the range is inside the committed prefix of our mapping.
        unsafe { ptr::copy(self.base().add(offset), buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    /// Copy bytes into linear memory.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), TrapReason> {
        checked_range(self.byte_len(), offset, data.len())?;
        // SAFETY: the range is inside the committed prefix of our mapping.
        unsafe { ptr::copy(data.as_ptr(), self.base().add(offset), data.len()) };
        Ok(())
    }

    /// Write a data segment. Identical to [`Memory::write`]; kept separate
    /// for readability at instantiation sites.
    #[inline]
    pub fn init_data(&self, offset: usize, data: &[u8]) -> Result<(), TrapReason> {
        self.write(offset, data)
    }

    /// `memory.copy`: overlapping ranges behave like `memmove`.
    pub fn copy_within(&self, dst: usize, src: usize, len: usize) -> Result<(), TrapReason> {
        let active = self.byte_len();
        checked_range(active, src, len)?;
        checked_range(active, dst, len)?;
        // SAFETY: both ranges are inside the committed prefix.
        unsafe { ptr::copy(self.base().add(src), self.base().add(dst), len) };
        Ok(())
    }

    /// `memory.fill`.
    pub fn fill(&self, dst: usize, value: u8, len: usize) -> Result<(), TrapReason> {
        checked_range(self.byte_len(), dst, len)?;
        // SAFETY: the range is inside the committed prefix.
        unsafe { ptr::write_bytes(self.base().add(dst), value, len) };
        Ok(())
    }

    fn read_array<const N: usize>(&self, offset: usize) -> Result<[u8; N], TrapReason> {
        let mut bytes = [0u8; N];
        self.read(offset, &mut bytes)?;
        Ok(bytes)
    }

    pub fn load_u8(&self, offset: usize) -> Result<u8, TrapReason> {
        Ok(self.read_array::<1>(offset)?[0])
    }

    pub fn load_u16(&self, offset: usize) -> Result<u16, TrapReason> {
        self.read_array(offset).map(u16::from_le_bytes)
    }

    pub fn load_i32(&self, offset: usize) -> Result<i32, TrapReason> {
        self.read_array(offset).map(i32::from_le_bytes)
    }

    pub fn load_i64(&self, offset: usize) -> Result<i64, TrapReason> {
        self.read_array(offset).map(i64::from_le_bytes)
    }

    pub fn load_f32(&self, offset: usize) -> Result<f32, TrapReason> {
        self.read_array(offset).map(f32::from_le_bytes)
    }

    pub fn load_f64(&self, offset: usize) -> Result<f64, TrapReason> {
        self.read_array(offset).map(f64::from_le_bytes)
    }

    pub fn store_u8(&self, offset: usize, value: u8) -> Result<(), TrapReason> {
        self.write(offset, &[value])
    }

    pub fn store_u16(&self, offset: usize, value: u16) -> Result<(), TrapReason> {
        self.write(offset, &value.to_le_bytes())
    }

    pub fn store_i32(&self, offset: usize, value: i32) -> Result<(), TrapReason> {
        self.write(offset, &value.to_le_bytes())
    }

    pub fn store_i64(&self, offset: usize, value: i64) -> Result<(), TrapReason> {
        self.write(offset, &value.to_le_bytes())
    }

    pub fn store_f32(&self, offset: usize, value: f32) -> Result<(), TrapReason> {
        self.write(offset, &value.to_le_bytes())
    }

    pub fn store_f64(&self, offset: usize, value: f64) -> Result<(), TrapReason> {
        self.write(offset, &value.to_le_bytes())
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        registry::unregister_memory(self.mmap.as_ptr() as usize);
    }
}

impl core::fmt::Debug for Memory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Memory")
            .field("pages", &self.size())
            .field("plan", &self.plan)
            .finish()
    }
}

#[inline]
fn pages_to_bytes(pages: u32) -> usize {
    pages as usize * PAGE_SIZE
}

/// Page count after growing `old` by `delta`, or `None` past `maximum`.
#[inline]
fn grow_target(old: u32, delta: u32, maximum: u32) -> Option<u32> {
    old.checked_add(delta).filter(|&new| new <= maximum)
}

/// Check that `[offset, offset + len)` lies within `active` bytes and return
/// the exclusive end. Never panics.
#[inline]
fn checked_range(active: usize, offset: usize, len: usize) -> Result<usize, TrapReason> {
    let end = offset
        .checked_add(len)
        .ok_or(TrapReason::MemoryOutOfBounds)?;
    if end > active {
        return Err(TrapReason::MemoryOutOfBounds);
    }
    Ok(end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(initial: u32, maximum: u32) -> MemoryPlan {
        MemoryPlan {
            initial,
            maximum,
            guarded: false,
            shared: false,
        }
    }

    #[test]
    fn new_initializes_to_zero() {
        let mem = Memory::new(plan(1, 1)).unwrap();
        assert_eq!(mem.size(), 1);
        assert_eq!(mem.byte_len(), PAGE_SIZE);
        let mut buf = vec![0xffu8; PAGE_SIZE];
        mem.read(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn new_fails_if_initial_exceeds_max() {
        assert!(matches!(
            Memory::new(plan(2, 1)),
            Err(RuntimeError::MemoryInitialPagesExceedsMax { initial: 2, max: 1 })
        ));
    }

    #[test]
    fn zero_page_memory_traps_everything() {
        let mem = Memory::new(plan(0, 0)).unwrap();
        assert_eq!(mem.size(), 0);
        assert_eq!(mem.load_u8(0), Err(TrapReason::MemoryOutOfBounds));
        assert_eq!(mem.grow(1), -1);
        assert_eq!(mem.grow(0), 0);
    }

    // ── grow ──

    #[test]
    fn grow_success() {
        let mem = Memory::new(plan(1, 4)).unwrap();
        assert_eq!(mem.grow(2), 1);
        assert_eq!(mem.size(), 3);
    }

    #[test]
    fn grow_to_max() {
        let mem = Memory::new(plan(1, 4)).unwrap();
        assert_eq!(mem.grow(3), 1);
        assert_eq!(mem.size(), 4);
    }

    #[test]
    fn grow_beyond_max_fails() {
        let mem = Memory::new(plan(1, 4)).unwrap();
        assert_eq!(mem.grow(4), -1);
        assert_eq!(mem.size(), 1);
        assert_eq!(mem.grow(u32::MAX), -1);
    }

    #[test]
    fn grow_zero_is_noop() {
        let mem = Memory::new(plan(1, 1)).unwrap();
        assert_eq!(mem.grow(0), 1);
        assert_eq!(mem.size(), 1);
    }

    #[test]
    fn grow_then_access_new_region() {
        let mem = Memory::new(plan(1, 2)).unwrap();
        assert_eq!(
            mem.store_i32(PAGE_SIZE, 7),
            Err(TrapReason::MemoryOutOfBounds)
        );
        assert_eq!(mem.grow(1), 1);
        assert_eq!(mem.load_i32(PAGE_SIZE), Ok(0));
        mem.store_i32(PAGE_SIZE, 7).unwrap();
        assert_eq!(mem.load_i32(PAGE_SIZE), Ok(7));
    }

    #[test]
    fn base_is_stable_across_grow() {
        let mem = Memory::new(plan(1, 8)).unwrap();
        let base = mem.base();
        let def = mem.definition_ptr();
        mem.grow(7);
        assert_eq!(mem.base(), base);
        assert_eq!(mem.definition_ptr(), def);
    }

    // ── load/store ──

    #[test]
    fn store_load_i32_roundtrip() {
        let mem = Memory::new(plan(1, 1)).unwrap();
        mem.store_i32(100, 0x12345678).unwrap();
        assert_eq!(mem.load_i32(100), Ok(0x12345678));
    }

    #[test]
    fn load_i32_out_of_bounds() {
        let mem = Memory::new(plan(1, 1)).unwrap();
        assert!(mem.load_i32(PAGE_SIZE - 4).is_ok());
        assert_eq!(mem.load_i32(PAGE_SIZE - 3), Err(TrapReason::MemoryOutOfBounds));
        assert_eq!(mem.load_i32(PAGE_SIZE), Err(TrapReason::MemoryOutOfBounds));
    }

    #[test]
    fn load_i32_offset_overflow() {
        let mem = Memory::new(plan(1, 1)).unwrap();
        assert_eq!(mem.load_i32(usize::MAX), Err(TrapReason::MemoryOutOfBounds));
        assert_eq!(
            mem.load_i32(usize::MAX - 2),
            Err(TrapReason::MemoryOutOfBounds)
        );
    }

    #[test]
    fn store_load_other_widths() {
        let mem = Memory::new(plan(1, 1)).unwrap();
        mem.store_i64(8, -2).unwrap();
        assert_eq!(mem.load_i64(8), Ok(-2));
        mem.store_u16(20, 0xbeef).unwrap();
        assert_eq!(mem.load_u16(20), Ok(0xbeef));
        mem.store_f32(24, 1.5).unwrap();
        assert_eq!(mem.load_f32(24), Ok(1.5));
        mem.store_f64(32, -0.25).unwrap();
        assert_eq!(mem.load_f64(32), Ok(-0.25));
    }

    #[test]
    fn i32_is_little_endian() {
        let mem = Memory::new(plan(1, 1)).unwrap();
        mem.store_i32(0, 0x04030201).unwrap();
        assert_eq!(mem.load_u8(0), Ok(0x01));
        assert_eq!(mem.load_u8(1), Ok(0x02));
        assert_eq!(mem.load_u8(2), Ok(0x03));
        assert_eq!(mem.load_u8(3), Ok(0x04));
    }

    // ── bulk ──

    #[test]
    fn init_data_writes_bytes() {
        let mem = Memory::new(plan(1, 1)).unwrap();
        mem.init_data(10, b"hello").unwrap();
        let mut buf = [0u8; 5];
        mem.read(10, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn init_data_at_boundary() {
        let mem = Memory::new(plan(1, 1)).unwrap();
        assert!(mem.init_data(PAGE_SIZE - 2, &[1, 2]).is_ok());
        assert!(mem.init_data(PAGE_SIZE, &[]).is_ok());
        assert_eq!(
            mem.init_data(PAGE_SIZE - 1, &[1, 2]),
            Err(TrapReason::MemoryOutOfBounds)
        );
    }

    #[test]
    fn copy_within_handles_overlap() {
        let mem = Memory::new(plan(1, 1)).unwrap();
        mem.write(0, &[1, 2, 3, 4, 5]).unwrap();
        mem.copy_within(2, 0, 3).unwrap();
        let mut buf = [0u8; 5];
        mem.read(0, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 1, 2, 3]);
        assert_eq!(
            mem.copy_within(PAGE_SIZE - 1, 0, 2),
            Err(TrapReason::MemoryOutOfBounds)
        );
    }

    #[test]
    fn fill_sets_range() {
        let mem = Memory::new(plan(1, 1)).unwrap();
        mem.fill(4, 0xaa, 4).unwrap();
        assert_eq!(mem.load_i32(4), Ok(0xaaaa_aaaau32 as i32));
        assert_eq!(mem.load_u8(8), Ok(0));
        assert_eq!(
            mem.fill(PAGE_SIZE, 0, 1),
            Err(TrapReason::MemoryOutOfBounds)
        );
    }

    #[test]
    fn reservation_is_registered() {
        let mem = Memory::new(plan(1, 2)).unwrap();
        let (start, len) = mem.reservation();
        assert!(registry::is_memory_address(start + len - 1));
        drop(mem);
        assert!(!registry::is_memory_address(start));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn guarded_memory_reserves_full_window() {
        let mem = Memory::new(MemoryPlan {
            initial: 1,
            maximum: 3,
            guarded: true,
            shared: false,
        })
        .unwrap();
        let (_, len) = mem.reservation();
        assert!(len as u64 >= GUARDED_RESERVATION);
        assert_eq!(mem.grow(2), 1);
        assert_eq!(mem.grow(1), -1);
        mem.store_i64(3 * PAGE_SIZE - 8, 9).unwrap();
        assert_eq!(mem.load_i64(3 * PAGE_SIZE - 8), Ok(9));
    }

    #[test]
    fn definition_layout() {
        assert_eq!(MemoryDefinition::BASE_OFFSET, 0);
        assert_eq!(
            MemoryDefinition::LENGTH_OFFSET as usize,
            core::mem::size_of::<*mut u8>()
        );
    }
}

// ── Kani Formal Verification Proofs ──────────────────────────────────────
//
// The mmap-backed `Memory` cannot be modelled directly, so the proofs cover
// the pure arithmetic every access and every grow goes through.

#[cfg(kani)]
mod proofs {
    use super::*;

    /// Proof: checked_range never panics and only succeeds for in-bounds ranges.
    #[kani::proof]
    #[kani::unwind(1)]
    fn checked_range_is_sound() {
        let active: usize = kani::any();
        let offset: usize = kani::any();
        let len: usize = kani::any();
        match checked_range(active, offset, len) {
            Ok(end) => {
                kani::assert(offset.checked_add(len) == Some(end), "end is offset+len");
                kani::assert(end <= active, "range within active bytes");
            }
            Err(reason) => {
                kani::assert(
                    reason == TrapReason::MemoryOutOfBounds,
                    "only out-of-bounds is reported",
                );
                kani::assert(
                    offset.checked_add(len).is_none_or(|end| end > active),
                    "rejected ranges are really out of bounds",
                );
            }
        }
    }

    /// Proof: grow never produces a size beyond the maximum.
    #[kani::proof]
    #[kani::unwind(1)]
    fn grow_respects_maximum() {
        let old: u32 = kani::any();
        let delta: u32 = kani::any();
        let maximum: u32 = kani::any();
        kani::assume(old <= maximum);
        match grow_target(old, delta, maximum) {
            Some(new) => {
                kani::assert(new <= maximum, "new size within maximum");
                kani::assert(new as u64 == old as u64 + delta as u64, "new is old+delta");
            }
            None => kani::assert(
                old as u64 + delta as u64 > maximum as u64,
                "grow only fails past the maximum",
            ),
        }
    }

    /// Proof: grow by zero always succeeds and returns the same size.
    #[kani::proof]
    #[kani::unwind(1)]
    fn grow_zero_is_identity() {
        let old: u32 = kani::any();
        let maximum: u32 = kani::any();
        kani::assume(old <= maximum);
        kani::assert(grow_target(old, 0, maximum) == Some(old), "grow(0) is a no-op");
    }

    /// Proof: page arithmetic cannot overflow for valid page counts.
    #[kani::proof]
    #[kani::unwind(1)]
    fn page_bytes_fit() {
        let pages: u32 = kani::any();
        kani::assume(pages <= MAX_WASM_PAGES);
        let bytes = pages_to_bytes(pages) as u64;
        kani::assert(bytes == pages as u64 * PAGE_SIZE as u64, "no truncation");
    }
}
