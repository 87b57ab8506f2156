//! Platform fault layer.
//!
//! Turns synchronous hardware faults raised by generated code (invalid
//! memory access, integer divide trap, stack exhaustion) into the same
//! [`Trap`](crate::Trap) value explicit trap instructions produce.
//!
//! The moving parts:
//! - `signals` installs process-wide handlers for SIGSEGV, SIGBUS, SIGFPE
//!   and SIGILL and classifies faults.
//! - `traphandlers` keeps the thread-local chain of recovery points
//!   (`CallThreadState`) and implements [`catch_traps`] / [`raise_trap`].
//! - `recovery` is the register save/restore used to jump back to the
//!   recovery point.
//! - `stack` captures the thread's stack bounds and makes sure a large
//!   enough alternate signal stack exists.
//! - `sync` wraps the OS locking primitives the engine exposes.

mod recovery;
mod signals;
mod stack;
pub mod sync;
mod traphandlers;

pub use stack::StackBounds;
pub use sync::{Event, Mutex};
pub use traphandlers::{catch_traps, raise_trap, wasmjet_raise_trap};

use std::sync::Once;

/// Install the process-wide fault handlers. Idempotent.
pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        // SAFETY: handlers are installed exactly once.
        unsafe { signals::install_handlers() };
        tracing::debug!("installed fault handlers");
    });
}

/// Report an unrecoverable engine error and abort the process.
///
/// Only async-signal-safe calls are used so this may run inside a signal
/// handler.
#[cold]
pub fn fatal(msg: &str) -> ! {
    const PREFIX: &[u8] = b"wasmjet: fatal error: ";
    // SAFETY: write(2) and abort(3) are async-signal-safe.
    unsafe {
        libc::write(2, PREFIX.as_ptr().cast(), PREFIX.len());
        libc::write(2, msg.as_ptr().cast(), msg.len());
        libc::write(2, b"\n".as_ptr().cast(), 1);
        libc::abort()
    }
}
