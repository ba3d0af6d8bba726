//! `si_code` values used to classify caught traps. They are deeply nested
//! into the libc headers and not available from nix or the rust bindings of
//! the libc.
//!
//! Source: <https://elixir.bootlin.com/linux/v6.13.1/source/include/uapi/asm-generic/siginfo.h#L227>

#![allow(unused)]

/// Sent by the kernel from somewhere
pub const SI_KERNEL: i32 = 0x80;
/// Sent by `kill`/`tgkill` from userspace
pub const SI_USER: i32 = 0;

// ---------------- SIGTRAP si_codes ---------------------------------------------------------------

/// Process breakpoint
pub const TRAP_BRKPT: i32 = 0x1;
/// Process trace trap (single step)
pub const TRAP_TRACE: i32 = 0x2;
/// Hardware breakpoint/watchpoint
pub const TRAP_HWBKPT: i32 = 0x4;

// ---------------- SIGSEGV si_codes ---------------------------------------------------------------

/// Address not mapped to object
pub const SEGV_MAPERR: i32 = 0x1;
/// Invalid permissions for mapped object
pub const SEGV_ACCERR: i32 = 0x2;
