//! # OS Capability Module
//!
//! The thin syscall surface this crate needs from Linux: virtual memory
//! mapping and protection, memory access through `/proc/self/mem`, thread
//! enumeration through `/proc/self/task`, and per-thread signaling.
//!
//! Reading and writing debuggee memory goes through `/proc/self/mem` on
//! purpose: a bad address then fails the `pread`/`pwrite` with an error
//! instead of faulting the thread that serves the debugger.

use std::fs::File;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::libc;
use nix::sys::mman::{mmap_anonymous, mprotect, munmap, MapFlags, ProtFlags};
use nix::sys::uio::{pread, pwrite};
use nix::unistd::{gettid, Pid};

use crate::addr::{Address, MemoryPermissions};
use crate::errors::{Result, StubError};
use crate::ThreadId;

pub mod trap;

/// Thread id of the calling thread
pub fn current_thread_id() -> ThreadId {
    gettid().as_raw() as ThreadId
}

/// Size of one page of virtual memory
pub fn page_size() -> usize {
    nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .unwrap_or(4096) as usize
}

/// Process id of the own process
pub fn process_id() -> Pid {
    nix::unistd::getpid()
}

fn kernel_error(errno: Errno) -> StubError {
    StubError::Kernel {
        code: errno as i32,
        message: errno.desc().to_string(),
    }
}

/// Reads exactly `buffer.len()` bytes of own-process memory at `address`
///
/// # Errors
///
/// Fails with [`StubError::InvalidAddress`] if the range is not fully
/// readable.
pub fn read_memory(address: Address, buffer: &mut [u8]) -> Result<usize> {
    let file = File::options().read(true).open("/proc/self/mem")?;
    let mut done = 0;
    while done < buffer.len() {
        let len = pread(
            &file,
            &mut buffer[done..],
            (address.usize() + done) as libc::off_t,
        )
        .map_err(|_| StubError::InvalidAddress)?;
        if len == 0 {
            return Err(StubError::InvalidAddress);
        }
        done += len;
    }
    Ok(done)
}

/// Writes `data` into own-process memory at `address`
///
/// Writing through `/proc/self/mem` side-steps page protections, which is
/// what the breakpoint patcher wants after widening them anyway.
///
/// # Errors
///
/// Fails with [`StubError::InvalidAddress`] if the range is not fully
/// writable.
pub fn write_memory(address: Address, data: &[u8]) -> Result<usize> {
    let file = File::options().write(true).open("/proc/self/mem")?;
    let mut done = 0;
    while done < data.len() {
        let len = pwrite(
            &file,
            &data[done..],
            (address.usize() + done) as libc::off_t,
        )
        .map_err(|_| StubError::InvalidAddress)?;
        if len == 0 {
            return Err(StubError::InvalidAddress);
        }
        done += len;
    }
    Ok(done)
}

/// Maps `size` bytes of fresh private anonymous memory, readable and
/// writable
///
/// # Errors
///
/// Fails for a zero size or when the kernel refuses the mapping.
pub fn allocate(size: usize) -> Result<Address> {
    let length = NonZeroUsize::new(size).ok_or(StubError::InvalidAllocation)?;
    let mapping = unsafe {
        mmap_anonymous(
            None,
            length,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE,
        )?
    };
    Ok(Address::from(mapping.as_ptr()))
}

/// Changes the protection of a mapped range
///
/// # Errors
///
/// This function can fail if the range is not mapped.
pub fn protect(address: Address, size: usize, permissions: MemoryPermissions) -> Result<()> {
    let pointer = NonNull::new(address.raw_pointer()).ok_or(StubError::InvalidAddress)?;
    unsafe { mprotect(pointer, size, permissions.into())? };
    Ok(())
}

/// Unmaps a range previously mapped with [`allocate`]
///
/// # Errors
///
/// This function can fail if the range is not mapped.
pub fn deallocate(address: Address, size: usize) -> Result<()> {
    let pointer = NonNull::new(address.raw_pointer()).ok_or(StubError::InvalidAddress)?;
    unsafe { munmap(pointer, size)? };
    Ok(())
}

/// Lists the live threads of the own process
///
/// # Errors
///
/// This function can fail if procfs cannot be read.
pub fn list_threads() -> Result<Vec<ThreadId>> {
    let mut threads = Vec::new();
    for entry in std::fs::read_dir("/proc/self/task")? {
        let entry = entry?;
        if let Ok(tid) = entry.file_name().to_string_lossy().parse::<ThreadId>() {
            threads.push(tid);
        }
    }
    threads.sort_unstable();
    Ok(threads)
}

/// Is there a live thread with this id in the own process?
pub fn thread_exists(tid: ThreadId) -> bool {
    std::path::Path::new(&format!("/proc/self/task/{tid}")).exists()
}

/// The scheduler state character of a thread, from its procfs stat line
///
/// # Errors
///
/// Fails with [`StubError::UnknownThread`] for a dead or foreign thread
/// and [`StubError::InvalidRunState`] if the stat line cannot be parsed.
pub fn thread_run_state(tid: ThreadId) -> Result<char> {
    let stat = std::fs::read_to_string(format!("/proc/self/task/{tid}/stat"))
        .map_err(|_| StubError::UnknownThread(tid))?;
    // The state char is the first field after the parenthesized comm, which
    // itself may contain spaces and parentheses.
    let after_comm = stat
        .rfind(") ")
        .map(|index| &stat[index + 2..])
        .ok_or(StubError::InvalidRunState)?;
    after_comm.chars().next().ok_or(StubError::InvalidRunState)
}

/// Sends a signal to one thread of the own process
///
/// # Errors
///
/// Surfaces the kernel error, e.g. for a dead thread.
pub fn thread_kill(tid: ThreadId, signal: i32) -> Result<()> {
    let result = unsafe {
        libc::syscall(
            libc::SYS_tgkill,
            libc::c_long::from(process_id().as_raw()),
            tid as libc::c_long,
            signal as libc::c_long,
        )
    };
    if result == -1 {
        return Err(kernel_error(Errno::last()));
    }
    Ok(())
}

extern "C" {
    // The dynamic linker's debugger rendezvous structure. The address of
    // this symbol is what link-map aware debuggers ask for.
    static _r_debug: libc::c_void;
}

/// Address of the dynamic linker's rendezvous structure
pub fn shared_library_info_address() -> Address {
    Address::from(unsafe { std::ptr::addr_of!(_r_debug) } as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_round_trip_through_procfs() {
        let data = vec![0xAAu8; 64];
        let address = Address::from(data.as_ptr() as usize);

        let mut readback = vec![0u8; 64];
        assert_eq!(read_memory(address, &mut readback).unwrap(), 64);
        assert_eq!(readback, data);

        write_memory(address, &[1, 2, 3]).unwrap();
        let mut patched = [0u8; 3];
        read_memory(address, &mut patched).unwrap();
        assert_eq!(patched, [1, 2, 3]);
        drop(data);
    }

    #[test]
    fn test_read_of_unmapped_address_fails() {
        let mut buffer = [0u8; 8];
        assert!(read_memory(Address::from(8usize), &mut buffer).is_err());
    }

    #[test]
    fn test_allocate_protect_deallocate() {
        let address = allocate(4096).unwrap();
        write_memory(address, &[7u8; 16]).unwrap();
        protect(address, 4096, MemoryPermissions::READ).unwrap();
        protect(address, 4096, MemoryPermissions::ALL).unwrap();
        deallocate(address, 4096).unwrap();
        assert!(allocate(0).is_err());
    }

    #[test]
    fn test_own_thread_is_listed() {
        let threads = list_threads().unwrap();
        assert!(threads.contains(&current_thread_id()));
        assert!(thread_exists(current_thread_id()));
    }

    #[test]
    fn test_run_state_of_current_thread() {
        // The calling thread is running while it asks.
        assert_eq!(thread_run_state(current_thread_id()).unwrap(), 'R');
    }

    #[test]
    fn test_shared_library_info_address_is_nonzero() {
        assert_ne!(shared_library_info_address().usize(), 0);
    }
}
