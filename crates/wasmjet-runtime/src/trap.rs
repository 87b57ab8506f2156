//! Structured trap representation.
//!
//! A `Trap` is produced whenever guest execution stops abnormally: either
//! generated code raised one explicitly (division by zero, failed
//! `call_indirect` check, `unreachable`, ...) or the platform layer turned a
//! hardware fault into one. Both paths produce the same type.

use crate::registry;
use core::fmt;

/// Why a guest call was terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrapReason {
    /// Integer division/remainder by zero, `MIN / -1`, or an out-of-range
    /// float-to-int truncation.
    IntegerDivideByZeroOrOverflow,
    /// Float-to-int truncation of NaN.
    InvalidConversionToInteger,
    /// Linear memory access outside the current memory size.
    MemoryOutOfBounds,
    /// `call_indirect` index beyond the current table size.
    TableOutOfBounds,
    /// `call_indirect` through a null table slot.
    UndefinedElement,
    /// `call_indirect` through a slot whose function type differs.
    IndirectCallSignatureMismatch,
    /// `unreachable` instruction executed.
    Unreachable,
    /// The native call stack was exhausted.
    StackOverflow,
    /// Atomic access at an address that is not naturally aligned.
    MisalignedAtomic,
    /// A hardware access fault outside any linear memory.
    AccessViolation { address: usize },
}

impl TrapReason {
    /// Numeric code passed between generated code and the runtime.
    ///
    /// Zero is reserved for "no trap" so libcalls can return a status.
    pub fn code(self) -> u32 {
        match self {
            TrapReason::IntegerDivideByZeroOrOverflow => 1,
            TrapReason::InvalidConversionToInteger => 2,
            TrapReason::MemoryOutOfBounds => 3,
            TrapReason::TableOutOfBounds => 4,
            TrapReason::UndefinedElement => 5,
            TrapReason::IndirectCallSignatureMismatch => 6,
            TrapReason::Unreachable => 7,
            TrapReason::StackOverflow => 8,
            TrapReason::MisalignedAtomic => 9,
            TrapReason::AccessViolation { .. } => 10,
        }
    }

    /// Inverse of [`TrapReason::code`]. The faulting address of an access
    /// violation does not survive the round trip.
    pub fn from_code(code: u32) -> Option<TrapReason> {
        Some(match code {
            1 => TrapReason::IntegerDivideByZeroOrOverflow,
            2 => TrapReason::InvalidConversionToInteger,
            3 => TrapReason::MemoryOutOfBounds,
            4 => TrapReason::TableOutOfBounds,
            5 => TrapReason::UndefinedElement,
            6 => TrapReason::IndirectCallSignatureMismatch,
            7 => TrapReason::Unreachable,
            8 => TrapReason::StackOverflow,
            9 => TrapReason::MisalignedAtomic,
            10 => TrapReason::AccessViolation { address: 0 },
            _ => return None,
        })
    }
}

impl fmt::Display for TrapReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrapReason::IntegerDivideByZeroOrOverflow => {
                f.write_str("integer divide by zero or overflow")
            }
            TrapReason::InvalidConversionToInteger => f.write_str("invalid conversion to integer"),
            TrapReason::MemoryOutOfBounds => f.write_str("out-of-bounds memory access"),
            TrapReason::TableOutOfBounds => f.write_str("out-of-bounds table access"),
            TrapReason::UndefinedElement => f.write_str("uninitialized table element"),
            TrapReason::IndirectCallSignatureMismatch => {
                f.write_str("indirect call signature mismatch")
            }
            TrapReason::Unreachable => f.write_str("unreachable instruction executed"),
            TrapReason::StackOverflow => f.write_str("call stack exhausted"),
            TrapReason::MisalignedAtomic => f.write_str("misaligned atomic memory access"),
            TrapReason::AccessViolation { address } => {
                write!(f, "access violation at {address:#x}")
            }
        }
    }
}

impl std::error::Error for TrapReason {}

/// One captured frame of a trapping call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Instruction pointer (fault address or return address).
    pub pc: usize,
    /// `module!function` when the pc belongs to registered JIT code.
    pub function: Option<String>,
    /// Offset of `pc` from the start of `function`.
    pub offset: usize,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function {
            Some(name) => write!(f, "{name}+{:#x}", self.offset),
            None => write!(f, "{:#x}", self.pc),
        }
    }
}

/// Ordered frames of a trapping call, innermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallStack {
    pub frames: Vec<Frame>,
}

impl CallStack {
    /// Symbolize raw program counters captured by the fault layer.
    ///
    /// The first pc is always kept. Subsequent return addresses are kept
    /// while they land in JIT code; the walk ends at the first host frame.
    pub fn from_pcs(pcs: &[usize]) -> CallStack {
        let mut frames = Vec::with_capacity(pcs.len());
        for (i, &pc) in pcs.iter().enumerate() {
            // Return addresses point after the call; look up the call itself.
            let lookup_pc = if i == 0 { pc } else { pc.wrapping_sub(1) };
            match registry::lookup_function(lookup_pc) {
                Some((name, start)) => frames.push(Frame {
                    pc,
                    function: Some(name),
                    offset: pc - start,
                }),
                None if i == 0 => frames.push(Frame {
                    pc,
                    function: None,
                    offset: 0,
                }),
                None => break,
            }
        }
        CallStack { frames }
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }
}

impl fmt::Display for CallStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, frame) in self.frames.iter().enumerate() {
            writeln!(f, "  #{i}: {frame}")?;
        }
        Ok(())
    }
}

/// A trap with its reason and the guest call stack at the trap point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trap {
    pub reason: TrapReason,
    pub call_stack: CallStack,
}

impl Trap {
    pub fn new(reason: TrapReason) -> Self {
        Self {
            reason,
            call_stack: CallStack::default(),
        }
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl std::error::Error for Trap {}
