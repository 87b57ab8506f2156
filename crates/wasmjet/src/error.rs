//! Structured errors reported to embedders.

use crate::types::{ExternKind, ExternType};
use std::fmt;
use wasmjet_runtime::{RuntimeError, Trap, ValType};

/// Why one import could not be linked.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImportErrorKind {
    #[error("unresolved")]
    Unresolved,
    #[error("expected a {expected}, found a {found}")]
    KindMismatch {
        expected: ExternKind,
        found: ExternKind,
    },
    #[error("expected {expected}, found {found}")]
    TypeMismatch {
        expected: ExternType,
        found: ExternType,
    },
    /// Memories, tables and globals cannot be shared across compartments.
    #[error("object belongs to a different compartment")]
    ForeignCompartment,
}

/// One failed import.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("import {module}.{name}: {kind}")]
pub struct ImportError {
    pub module: String,
    pub name: String,
    pub kind: ImportErrorKind,
}

/// A list of import failures, printed one per line.
#[derive(Debug)]
pub struct ImportErrors<'a>(pub &'a [ImportError]);

impl fmt::Display for ImportErrors<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "  {err}")?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InstantiationError {
    /// Every import that failed to link, in declaration order.
    #[error("failed to link {} import(s):\n{}", .0.len(), ImportErrors(.0))]
    Link(Vec<ImportError>),
    #[error("{kind} segment {segment} at offset {offset} (length {len}) does not fit in {kind} of size {size}")]
    SegmentOutOfBounds {
        kind: ExternKind,
        segment: usize,
        offset: u64,
        len: u64,
        size: u64,
    },
    #[error("failed to allocate runtime object")]
    Resource(#[from] RuntimeError),
    #[error("failed to compile module")]
    Compile(#[source] anyhow::Error),
    #[error("start function trapped: {0}")]
    Start(Trap),
}

/// A host call into a guest function failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvokeError {
    #[error("expected {expected} argument(s), got {got}")]
    ArityMismatch { expected: usize, got: usize },
    #[error("argument {index} should be {expected}, got {got}")]
    TypeMismatch {
        index: usize,
        expected: ValType,
        got: ValType,
    },
    #[error("export '{0}' is not a function")]
    NotAFunction(String),
    #[error(transparent)]
    Trap(#[from] Trap),
}

impl InvokeError {
    /// The trap, if the call trapped.
    pub fn trap(&self) -> Option<&Trap> {
        match self {
            InvokeError::Trap(trap) => Some(trap),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmjet_runtime::TrapReason;

    #[test]
    fn link_error_lists_every_import() {
        let err = InstantiationError::Link(vec![
            ImportError {
                module: "env".into(),
                name: "f".into(),
                kind: ImportErrorKind::Unresolved,
            },
            ImportError {
                module: "env".into(),
                name: "mem".into(),
                kind: ImportErrorKind::KindMismatch {
                    expected: ExternKind::Memory,
                    found: ExternKind::Global,
                },
            },
        ]);
        assert_eq!(
            err.to_string(),
            "failed to link 2 import(s):\n  import env.f: unresolved\n  import env.mem: expected a memory, found a global"
        );
    }

    #[test]
    fn invoke_error_trap_accessor() {
        let err = InvokeError::from(Trap::new(TrapReason::Unreachable));
        assert_eq!(err.to_string(), "unreachable instruction executed");
        assert_eq!(err.trap().unwrap().reason, TrapReason::Unreachable);
        assert!(InvokeError::ArityMismatch { expected: 2, got: 1 }
            .trap()
            .is_none());
    }
}
