//! Global variable instances.
//!
//! Each global owns one 8-byte slot on the heap. Compiled code loads and
//! stores the slot through its baked-in address, so the slot must stay put
//! for as long as any code referencing it is alive.

use crate::{RuntimeError, ValType, Value};
use core::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct Global {
    ty: ValType,
    mutable: bool,
    slot: Box<AtomicU64>,
}

impl Global {
    pub fn new(ty: ValType, mutable: bool, init: Value) -> Result<Self, RuntimeError> {
        if init.ty() != ty {
            return Err(RuntimeError::GlobalTypeMismatch {
                expected: ty,
                got: init.ty(),
            });
        }
        Ok(Self {
            ty,
            mutable,
            slot: Box::new(AtomicU64::new(init.to_bits())),
        })
    }

    pub fn ty(&self) -> ValType {
        self.ty
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    pub fn get(&self) -> Value {
        Value::from_bits(self.ty, self.slot.load(Ordering::Relaxed))
    }

    /// Host-side write. Fails for immutable globals or mismatched types.
    pub fn set(&self, value: Value) -> Result<(), RuntimeError> {
        if !self.mutable {
            return Err(RuntimeError::ImmutableGlobal);
        }
        if value.ty() != self.ty {
            return Err(RuntimeError::GlobalTypeMismatch {
                expected: self.ty,
                got: value.ty(),
            });
        }
        self.slot.store(value.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    /// Address of the value slot. Values are stored little-endian in the low
    /// bytes, so a 32-bit load at this address reads an `i32`/`f32` global.
    pub fn slot_ptr(&self) -> *mut u64 {
        self.slot.as_ptr()
    }
}
