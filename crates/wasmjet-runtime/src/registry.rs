//! Process-wide registries of JIT code and linear-memory reservations.
//!
//! The fault layer consults these after a trap has been delivered: code
//! ranges symbolize call stacks, memory ranges turn a raw access violation
//! into `MemoryOutOfBounds`.

use std::collections::BTreeMap;
use std::sync::RwLock;

struct CodeEntry {
    end: usize,
    name: String,
}

/// Keyed by start address.
static CODE: RwLock<BTreeMap<usize, CodeEntry>> = RwLock::new(BTreeMap::new());

/// Keyed by start address, value is the exclusive end.
static MEMORIES: RwLock<BTreeMap<usize, usize>> = RwLock::new(BTreeMap::new());

/// Register `[start, start + len)` as the body of the named function.
pub fn register_function(start: usize, len: usize, name: String) {
    if len == 0 {
        return;
    }
    let mut code = CODE.write().unwrap_or_else(|e| e.into_inner());
    code.insert(
        start,
        CodeEntry {
            end: start + len,
            name,
        },
    );
}

pub fn unregister_function(start: usize) {
    let mut code = CODE.write().unwrap_or_else(|e| e.into_inner());
    code.remove(&start);
}

/// Find the function containing `pc`, returning its name and start address.
pub fn lookup_function(pc: usize) -> Option<(String, usize)> {
    let code = CODE.read().unwrap_or_else(|e| e.into_inner());
    let (start, entry) = code.range(..=pc).next_back()?;
    (pc < entry.end).then(|| (entry.name.clone(), *start))
}

pub fn register_memory(start: usize, len: usize) {
    let mut memories = MEMORIES.write().unwrap_or_else(|e| e.into_inner());
    memories.insert(start, start + len);
}

pub fn unregister_memory(start: usize) {
    let mut memories = MEMORIES.write().unwrap_or_else(|e| e.into_inner());
    memories.remove(&start);
}

/// Whether `addr` lies inside any registered linear-memory reservation.
pub fn is_memory_address(addr: usize) -> bool {
    let memories = MEMORIES.read().unwrap_or_else(|e| e.into_inner());
    memories
        .range(..=addr)
        .next_back()
        .is_some_and(|(_, &end)| addr < end)
}
