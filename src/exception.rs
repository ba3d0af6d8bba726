//! # Exception Module
//!
//! A caught hardware exception of one thread, as delivered by the listener
//! thread of the [`Controller`](crate::controller::Controller).
//!
//! On Linux these exceptions arrive as synchronous signals. The raw signal
//! number doubles as the stop-reason signal reported over the wire, so no
//! separate translation table is needed on this platform.

use nix::libc;

use crate::addr::Address;
use crate::consts::TRAP_TRACE;
use crate::ThreadId;

/// An exception that occurred on one thread, like a hit breakpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exception {
    /// The thread that caused the exception
    pub thread: ThreadId,
    /// Raw signal number of the exception
    pub signal: i32,
    /// The `si_code` the kernel delivered along with the signal
    pub code: i32,
    /// Faulting address for memory exceptions, instruction address otherwise
    pub fault_address: Address,
}

impl Exception {
    /// Was this exception caused by a breakpoint or a single step trap?
    pub fn is_breakpoint(&self) -> bool {
        self.signal == libc::SIGTRAP
    }

    /// Was this exception caused by a breakpoint patched into the code, as
    /// opposed to a single step trap?
    pub fn is_code_patch_trap(&self) -> bool {
        self.is_breakpoint() && self.code != TRAP_TRACE
    }

    pub fn is_bad_access(&self) -> bool {
        self.signal == libc::SIGSEGV || self.signal == libc::SIGBUS
    }

    pub fn is_bad_instruction(&self) -> bool {
        self.signal == libc::SIGILL
    }

    /// Signal number for the `T` stop reply
    pub fn signal_number(&self) -> u8 {
        self.signal as u8
    }

    /// Exception data words for the stop reply metadata
    pub fn data(&self) -> [u64; 2] {
        [self.code as u64, self.fault_address.u64()]
    }

    /// A short human readable description for logging
    pub fn reason(&self) -> &'static str {
        match self.signal {
            libc::SIGTRAP => "breakpoint",
            libc::SIGSEGV => "bad access",
            libc::SIGBUS => "bad access (bus)",
            libc::SIGILL => "bad instruction",
            libc::SIGFPE => "arithmetic",
            _ => "<unknown>",
        }
    }
}
