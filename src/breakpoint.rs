//! # Breakpoint Patch Module
//!
//! Architecture specific code patching for software breakpoints: replace
//! the instruction byte at an address with a trap instruction, remember the
//! original byte, and restore it on removal.
//!
//! The landing address is the instruction pointer value the processor
//! reports once the trap fired; on x86_64 that is the breakpoint address
//! plus the one patched byte. Keeping "how many bytes change" and "where
//! the processor lands" in this module lets the bookkeeping in the
//! [`Controller`](crate::controller::Controller) stay architecture
//! agnostic.

use tracing::trace;

use crate::addr::Address;
use crate::errors::Result;
use crate::sys;

/// The `INT3` trap opcode
pub const BREAKPOINT_BYTE: u8 = 0xCC;

/// How many bytes at the patched address are modified
pub const NUMBER_OF_BYTES_TO_PATCH: usize = 1;

/// Handle for an installed breakpoint
///
/// Installing at an address where a breakpoint already exists yields the
/// same handle again; the [`Controller`](crate::controller::Controller)
/// reference counts the underlying patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Breakpoint {
    pub address: Address,
}

/// The saved state of one patched code location
#[derive(Debug, Clone)]
pub struct PatchState {
    original_byte: u8,
}

impl PatchState {
    /// Patches the trap instruction over the code at `address`
    ///
    /// # Returns
    ///
    /// The patch state holding the original byte, and the landing address
    /// the processor will report after the trap fires.
    ///
    /// # Errors
    ///
    /// This function can fail if the address cannot be read or written.
    /// The caller must have widened the memory protection beforehand.
    pub fn create(address: Address) -> Result<(Self, Address)> {
        let mut original = [0u8; NUMBER_OF_BYTES_TO_PATCH];
        sys::read_memory(address, &mut original)?;
        trace!("saved byte at {address}: {:02x}", original[0]);
        sys::write_memory(address, &[BREAKPOINT_BYTE])?;
        Ok((
            Self {
                original_byte: original[0],
            },
            address + NUMBER_OF_BYTES_TO_PATCH,
        ))
    }

    /// Writes the saved original byte back over the trap instruction
    ///
    /// # Errors
    ///
    /// This function can fail if the address cannot be written.
    pub fn restore_original_instruction(&self, address: Address) -> Result<()> {
        trace!("restoring byte at {address}: {:02x}", self.original_byte);
        sys::write_memory(address, &[self.original_byte])?;
        Ok(())
    }

    /// The code byte that was overwritten by the trap instruction
    pub fn saved_byte(&self) -> u8 {
        self.original_byte
    }
}
