//! # Address Module
//!
//! Provides the [`Address`] type used to refer to locations in the address
//! space of the debugged (own) process, and the [`MemoryPermissions`] set
//! used when mapping or protecting memory.
//!
//! An [`Address`] is an opaque handle around a pointer-width integer. It is
//! never dereferenced directly by this crate; all accesses go through the
//! syscall wrappers in [`crate::sys`].

use std::fmt::Display;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use nix::sys::mman::ProtFlags;

/// A raw pointer in the debugged process
pub type RawPointer = *mut std::ffi::c_void;

/// An address in the address space of the debugged process
///
/// Since the debugger lives inside the process it debugs, this is always an
/// address of the own address space, with the native pointer width.
#[derive(Hash, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Address(usize);

impl Address {
    /// Gets the address as [`usize`]
    pub fn usize(&self) -> usize {
        self.0
    }

    /// Gets the address as [`u64`]
    pub fn u64(&self) -> u64 {
        self.0 as u64
    }

    /// Gets the address as a raw pointer, for syscalls that require one
    pub fn raw_pointer(&self) -> RawPointer {
        self.0 as RawPointer
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", { self.0 })
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl Add for Address {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Add<usize> for Address {
    type Output = Self;
    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<usize> for Address {
    fn add_assign(&mut self, rhs: usize) {
        self.0 += rhs
    }
}

impl Sub for Address {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl Sub<usize> for Address {
    type Output = Self;
    fn sub(self, rhs: usize) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl SubAssign<usize> for Address {
    fn sub_assign(&mut self, rhs: usize) {
        self.0 -= rhs
    }
}

impl From<RawPointer> for Address {
    fn from(value: RawPointer) -> Self {
        Address(value as usize)
    }
}

impl From<Address> for RawPointer {
    fn from(value: Address) -> Self {
        value.0 as RawPointer
    }
}

impl From<usize> for Address {
    fn from(value: usize) -> Self {
        Address(value)
    }
}

impl From<u64> for Address {
    fn from(value: u64) -> Self {
        Address(value as usize)
    }
}

impl From<Address> for u64 {
    fn from(value: Address) -> Self {
        value.0 as u64
    }
}

impl From<Address> for usize {
    fn from(value: Address) -> Self {
        value.0
    }
}

/// Read/write/execute permissions for a memory region
///
/// Used by the memory allocation commands of the remote protocol and by the
/// breakpoint patcher, which widens a page to all permissions before
/// patching it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct MemoryPermissions(u8);

impl MemoryPermissions {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1);
    pub const WRITE: Self = Self(2);
    pub const EXECUTE: Self = Self(4);
    /// All of read, write and execute
    pub const ALL: Self = Self(7);

    /// Does this set contain all permissions of `other`?
    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for MemoryPermissions {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for MemoryPermissions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0
    }
}

impl From<MemoryPermissions> for ProtFlags {
    fn from(value: MemoryPermissions) -> Self {
        let mut flags = ProtFlags::PROT_NONE;
        if value.contains(MemoryPermissions::READ) {
            flags |= ProtFlags::PROT_READ;
        }
        if value.contains(MemoryPermissions::WRITE) {
            flags |= ProtFlags::PROT_WRITE;
        }
        if value.contains(MemoryPermissions::EXECUTE) {
            flags |= ProtFlags::PROT_EXEC;
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_arithmetic() {
        let a = Address::from(100usize);
        let b = Address::from(50usize);
        assert_eq!((a + b).usize(), 150);
        assert_eq!((a - b).usize(), 50);
        assert_eq!((a + 8usize).usize(), 108);
    }

    #[test]
    fn test_addr_conversions() {
        let a = Address::from(0x1234usize);
        assert_eq!(a.u64(), 0x1234u64);
        assert_eq!(format!("{}", a), "0x0000000000001234");
    }

    #[test]
    fn test_permission_sets() {
        let p = MemoryPermissions::READ | MemoryPermissions::WRITE;
        assert!(p.contains(MemoryPermissions::READ));
        assert!(p.contains(MemoryPermissions::WRITE));
        assert!(!p.contains(MemoryPermissions::EXECUTE));
        assert!(MemoryPermissions::ALL.contains(p));
        assert!(MemoryPermissions::NONE.is_empty());
    }
}
