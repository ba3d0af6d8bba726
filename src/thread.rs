//! # Machine Thread Module
//!
//! One coherent per-thread view over the raw thread state the OS layer
//! captures: instruction and stack pointer, hardware single stepping via
//! the trace flag, suspension, and register access by register set and id.
//!
//! Register reads and writes require the thread to be stopped (parked by
//! the trap machinery); the controller guarantees that by suspending
//! threads before the protocol layer touches their registers.

use crate::addr::Address;
use crate::errors::{Result, StubError};
use crate::registers::{REGISTER_CONTEXT_SIZE, RegisterContext, TRACE_FLAG};
use crate::sys::{self, trap};
use crate::ThreadId;

/// Run state of one thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Stopped,
    Waiting,
    Uninterruptible,
    Halted,
}

/// One thread of the debugged process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Thread {
    tid: ThreadId,
}

impl Thread {
    pub fn new(tid: ThreadId) -> Self {
        Self { tid }
    }

    /// The thread this is called on
    pub fn current() -> Self {
        Self::new(sys::current_thread_id())
    }

    pub fn id(&self) -> ThreadId {
        self.tid
    }

    /// Reads the instruction pointer of the stopped thread
    ///
    /// # Errors
    ///
    /// Fails with [`StubError::ThreadNotStopped`] while the thread runs.
    pub fn get_instruction_pointer(&self) -> Result<Address> {
        trap::with_context(self.tid, |context| Address::from(context.gpr.rip))
    }

    /// Redirects the instruction pointer of the stopped thread
    ///
    /// The new value takes effect when the thread resumes.
    ///
    /// # Errors
    ///
    /// Fails with [`StubError::ThreadNotStopped`] while the thread runs.
    pub fn set_instruction_pointer(&self, address: Address) -> Result<()> {
        trap::with_context(self.tid, |context| context.gpr.rip = address.u64())
    }

    /// Reads the stack pointer of the stopped thread
    ///
    /// # Errors
    ///
    /// Fails with [`StubError::ThreadNotStopped`] while the thread runs.
    pub fn get_stack_pointer(&self) -> Result<Address> {
        trap::with_context(self.tid, |context| Address::from(context.gpr.rsp))
    }

    /// Sets the trace flag so the thread traps after its next instruction
    ///
    /// # Errors
    ///
    /// Fails with [`StubError::ThreadNotStopped`] while the thread runs.
    pub fn begin_single_step_mode(&self) -> Result<()> {
        trap::with_context(self.tid, |context| context.gpr.rflags |= TRACE_FLAG)
    }

    /// Clears the trace flag again
    ///
    /// # Errors
    ///
    /// Fails with [`StubError::ThreadNotStopped`] while the thread runs.
    pub fn end_single_step_mode(&self) -> Result<()> {
        trap::with_context(self.tid, |context| context.gpr.rflags &= !TRACE_FLAG)
    }

    /// Suspends the thread, blocking until it stopped
    ///
    /// Suspensions nest: the thread only runs again once `resume` was
    /// called as often as `suspend`.
    ///
    /// # Errors
    ///
    /// Surfaces the kernel error if the thread cannot be stopped.
    pub fn suspend(&self) -> Result<()> {
        trap::suspend_thread(self.tid)
    }

    /// Lowers the suspend count, resuming the thread at zero
    ///
    /// # Errors
    ///
    /// Fails with [`StubError::ThreadNotStopped`] if the thread was not
    /// suspended.
    pub fn resume(&self) -> Result<()> {
        trap::resume_thread(self.tid)
    }

    pub fn get_suspend_count(&self) -> Result<u32> {
        Ok(trap::suspend_count(self.tid))
    }

    /// Maps the OS scheduler state of the thread to a [`RunState`]
    ///
    /// # Errors
    ///
    /// Fails with [`StubError::InvalidRunState`] on a state character this
    /// crate does not know.
    pub fn get_run_state(&self) -> Result<RunState> {
        if trap::is_parked(self.tid) {
            return Ok(RunState::Stopped);
        }
        match sys::thread_run_state(self.tid)? {
            'R' => Ok(RunState::Running),
            'S' => Ok(RunState::Waiting),
            'D' => Ok(RunState::Uninterruptible),
            'T' | 't' => Ok(RunState::Stopped),
            'Z' | 'X' | 'x' => Ok(RunState::Halted),
            _ => Err(StubError::InvalidRunState),
        }
    }

    /// Reads one register of the stopped thread into `dest`
    ///
    /// # Errors
    ///
    /// Fails for unknown set/register ids and while the thread runs.
    pub fn get_register_value(
        &self,
        register_id: u32,
        register_set_id: u32,
        dest: &mut [u8],
    ) -> Result<usize> {
        trap::with_context(self.tid, |context| {
            context.get_register_value(register_set_id, register_id, dest)
        })?
    }

    /// Writes one register of the stopped thread
    ///
    /// # Errors
    ///
    /// Fails for unknown set/register ids, for the read-only exception
    /// state set, and while the thread runs.
    pub fn set_register_value(
        &self,
        register_id: u32,
        register_set_id: u32,
        source: &[u8],
    ) -> Result<()> {
        trap::with_context(self.tid, |context| {
            context.set_register_value(register_set_id, register_id, source)
        })?
    }

    /// Serializes the whole register context of the stopped thread
    ///
    /// # Errors
    ///
    /// Fails with [`StubError::ThreadNotStopped`] while the thread runs.
    ///
    /// # Panics
    ///
    /// If `dest` is smaller than
    /// [`REGISTER_CONTEXT_SIZE`](crate::registers::REGISTER_CONTEXT_SIZE);
    /// that is a caller bug.
    pub fn get_register_context(&self, dest: &mut [u8]) -> Result<usize> {
        trap::with_context(self.tid, |context| context.serialize(dest))
    }

    /// Replaces the whole register context of the stopped thread
    ///
    /// The exception state portion of the blob is accepted but not written
    /// back, that hardware state is get-only.
    ///
    /// # Errors
    ///
    /// Fails with [`StubError::ThreadNotStopped`] while the thread runs.
    ///
    /// # Panics
    ///
    /// If `source` is smaller than
    /// [`REGISTER_CONTEXT_SIZE`](crate::registers::REGISTER_CONTEXT_SIZE).
    pub fn set_register_context(&self, source: &[u8]) -> Result<()> {
        assert!(
            source.len() >= REGISTER_CONTEXT_SIZE,
            "register context buffer is too small"
        );
        trap::with_context(self.tid, |context| {
            let exc = context.exc;
            *context = RegisterContext::deserialize(source);
            // Get-only state keeps its live values.
            context.exc = exc;
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_register_access_requires_stopped_thread() {
        let thread = Thread::current();
        trap::register_thread(thread.id()).unwrap();
        assert!(matches!(
            thread.get_instruction_pointer(),
            Err(StubError::ThreadNotStopped(_))
        ));
    }

    #[test]
    fn test_current_thread_run_state() {
        assert_eq!(Thread::current().get_run_state().unwrap(), RunState::Running);
        assert_eq!(Thread::current().get_suspend_count().unwrap(), 0);
    }

    #[test]
    fn test_suspend_stops_and_resume_restarts_a_thread() {
        trap::initialize().unwrap();

        let tid_cell = Arc::new(AtomicU64::new(0));
        let counter = Arc::new(AtomicU64::new(0));
        let done = Arc::new(AtomicBool::new(false));

        let worker = {
            let tid_cell = Arc::clone(&tid_cell);
            let counter = Arc::clone(&counter);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                tid_cell.store(sys::current_thread_id(), Ordering::SeqCst);
                while !done.load(Ordering::SeqCst) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
        };
        while tid_cell.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }
        let thread = Thread::new(tid_cell.load(Ordering::SeqCst));

        thread.suspend().unwrap();
        assert_eq!(thread.get_suspend_count().unwrap(), 1);
        assert_eq!(thread.get_run_state().unwrap(), RunState::Stopped);

        // A parked thread makes no progress.
        let frozen = counter.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), frozen);

        // Its registers are readable while it is parked.
        let ip = thread.get_instruction_pointer().unwrap();
        assert_ne!(ip.usize(), 0);
        assert_ne!(thread.get_stack_pointer().unwrap().usize(), 0);

        // Suspensions nest.
        thread.suspend().unwrap();
        assert_eq!(thread.get_suspend_count().unwrap(), 2);
        thread.resume().unwrap();
        assert_eq!(thread.get_run_state().unwrap(), RunState::Stopped);
        thread.resume().unwrap();

        let mut progressed = false;
        for _ in 0..1000 {
            if counter.load(Ordering::SeqCst) != frozen {
                progressed = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(progressed, "thread made no progress after resume");

        done.store(true, Ordering::SeqCst);
        worker.join().unwrap();
    }

    #[test]
    fn test_register_context_round_trip_on_parked_thread() {
        trap::initialize().unwrap();

        let tid_cell = Arc::new(AtomicU64::new(0));
        let done = Arc::new(AtomicBool::new(false));
        let worker = {
            let tid_cell = Arc::clone(&tid_cell);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                tid_cell.store(sys::current_thread_id(), Ordering::SeqCst);
                while !done.load(Ordering::SeqCst) {
                    std::hint::spin_loop();
                }
            })
        };
        while tid_cell.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }
        let thread = Thread::new(tid_cell.load(Ordering::SeqCst));
        thread.suspend().unwrap();

        let mut context = vec![0u8; REGISTER_CONTEXT_SIZE];
        assert_eq!(
            thread.get_register_context(&mut context).unwrap(),
            REGISTER_CONTEXT_SIZE
        );
        thread.set_register_context(&context).unwrap();
        let mut roundtrip = vec![0u8; REGISTER_CONTEXT_SIZE];
        thread.get_register_context(&mut roundtrip).unwrap();
        assert_eq!(context, roundtrip);

        thread.resume().unwrap();
        done.store(true, Ordering::SeqCst);
        worker.join().unwrap();
    }
}
