//! # Debugger Module
//!
//! The interface the protocol server drives, and its in-process
//! implementation on top of the [`Controller`].
//!
//! The [`Debugger`] trait is what the command dispatcher calls into; tests
//! substitute a mock for it. [`ProcessDebugger`] is the real thing: it
//! resolves resume requests into concrete per-thread actions, applies them
//! through the machine thread layer, and answers all memory, register and
//! breakpoint requests for the own process.

use nix::libc;
use tracing::{debug, info, warn};

use crate::addr::{Address, MemoryPermissions};
use crate::breakpoint::Breakpoint;
use crate::controller::Controller;
use crate::errors::{Result, StubError};
use crate::exception::Exception;
use crate::registers::REGISTER_CONTEXT_SIZE;
use crate::sys;
use crate::thread::Thread;
use crate::ThreadId;

/// Which thread(s) one resume entry addresses
///
/// Never stored resolved; `Any` and `All` are resolved against the live
/// thread list each time a resume request is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadReference {
    Id(ThreadId),
    /// Resolves to the primary thread
    Any,
    /// Applies to every live thread
    All,
}

/// What a thread should do when execution resumes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadResumeAction {
    Stop,
    Continue,
    Step,
    None,
}

/// One entry of a resume request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadResumeEntry {
    pub thread: ThreadReference,
    pub action: ThreadResumeAction,
    pub address: Option<Address>,
}

/// Exception metadata attached to a stop reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopExceptionDetail {
    pub exception_type: u32,
    pub data: Vec<u64>,
}

/// Everything needed to format one thread's stop reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadStopInfo {
    pub signal_number: u8,
    pub dispatch_queue_address: Option<Address>,
    pub exception: Option<StopExceptionDetail>,
}

/// Resolves a resume request into exactly one action per live thread
///
/// Entries apply strictly in order, writing into a per-thread map: a
/// specific id entry sets (or overwrites) that thread's action, an `Any`
/// entry applies to the primary thread only if nothing set it yet, an
/// `All` entry overwrites every thread. Threads that no entry touched get
/// the default action. The ordering is a hard protocol contract: a later
/// broadcast must clobber an earlier specific entry, and the default must
/// clobber nothing.
pub fn resolve_resume_actions(
    threads: &[ThreadId],
    primary_thread: ThreadId,
    entries: &[ThreadResumeEntry],
    default_action: ThreadResumeAction,
) -> Vec<(ThreadId, ThreadResumeAction, Option<Address>)> {
    let mut resolved: std::collections::HashMap<ThreadId, (ThreadResumeAction, Option<Address>)> =
        std::collections::HashMap::new();
    for entry in entries {
        match entry.thread {
            ThreadReference::Id(tid) => {
                resolved.insert(tid, (entry.action, entry.address));
            }
            ThreadReference::Any => {
                resolved
                    .entry(primary_thread)
                    .or_insert((entry.action, entry.address));
            }
            ThreadReference::All => {
                for tid in threads {
                    resolved.insert(*tid, (entry.action, entry.address));
                }
            }
        }
    }
    threads
        .iter()
        .map(|tid| {
            let (action, address) = resolved
                .get(tid)
                .copied()
                .unwrap_or((default_action, Option::None));
            (*tid, action, address)
        })
        .collect()
}

/// The capability surface the command dispatcher needs
///
/// Mirrors what the wire protocol can express; every method maps to one or
/// a few packet kinds.
pub trait Debugger: Send {
    fn register_context_size(&self) -> usize;

    /// Tells the debugger which exception the next stop replies describe
    fn note_exception(&mut self, _exception: Exception) {}
    fn primary_thread_id(&self) -> ThreadId;
    fn threads(&self) -> Vec<ThreadId>;

    fn attach(&mut self, process_id: u32) -> Result<()>;
    fn detach(&mut self);
    fn kill(&mut self) -> Result<()>;
    fn interrupt_execution(&mut self) -> Result<()>;

    fn is_thread_alive(&self, thread_id: ThreadId) -> Result<bool>;
    fn get_stop_info_for_thread(&self, thread_id: ThreadId) -> Result<ThreadStopInfo>;
    fn get_shared_library_info_address(&self) -> Result<Address>;

    fn set_breakpoint(&mut self, address: Address, byte_size: usize) -> Result<()>;
    fn remove_breakpoint(&mut self, address: Address) -> Result<()>;

    fn allocate(&mut self, size: usize, permissions: MemoryPermissions) -> Result<Address>;
    fn deallocate(&mut self, address: Address) -> Result<()>;
    fn read_memory(&self, address: Address, size: usize) -> Result<Vec<u8>>;
    fn write_memory(&mut self, address: Address, bytes: &[u8]) -> Result<()>;

    fn get_register_value_for_thread(
        &self,
        thread_id: ThreadId,
        register_id: u32,
        register_set_id: u32,
        dest: &mut [u8],
    ) -> Result<usize>;
    fn set_register_value_for_thread(
        &mut self,
        thread_id: ThreadId,
        register_id: u32,
        register_set_id: u32,
        source: &[u8],
    ) -> Result<()>;
    fn get_ip_register_value_for_thread(&self, thread_id: ThreadId) -> Result<Address>;
    fn get_register_context_for_thread(
        &self,
        thread_id: ThreadId,
        dest: &mut [u8],
    ) -> Result<usize>;
    fn set_register_context_for_thread(&mut self, thread_id: ThreadId, source: &[u8])
        -> Result<()>;

    /// Applies a resume request; the stop or exit notification is sent
    /// separately once the next event arrives
    fn resume(
        &mut self,
        entries: &[ThreadResumeEntry],
        default_action: ThreadResumeAction,
    ) -> Result<()>;
}

/// The in-process [`Debugger`] over the [`Controller`]
pub struct ProcessDebugger {
    controller: Controller,
    primary_thread: ThreadId,
    last_exception: Option<Exception>,
    attached: bool,
}

impl ProcessDebugger {
    pub fn new(controller: Controller, primary_thread: ThreadId) -> Self {
        Self {
            controller,
            primary_thread,
            last_exception: Option::None,
            attached: false,
        }
    }

    /// Did a client attach and not yet detach?
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    fn resume_fully(thread: &Thread) -> Result<()> {
        while thread.get_suspend_count()? > 0 {
            thread.resume()?;
        }
        Ok(())
    }
}

impl Debugger for ProcessDebugger {
    fn register_context_size(&self) -> usize {
        REGISTER_CONTEXT_SIZE
    }

    fn note_exception(&mut self, exception: Exception) {
        self.last_exception = Some(exception);
    }

    fn primary_thread_id(&self) -> ThreadId {
        self.primary_thread
    }

    fn threads(&self) -> Vec<ThreadId> {
        self.controller
            .get_threads()
            .map(|threads| threads.iter().map(Thread::id).collect())
            .unwrap_or_default()
    }

    fn attach(&mut self, process_id: u32) -> Result<()> {
        let own = sys::process_id().as_raw() as u32;
        if process_id != own {
            // This stub can only ever debug the process it lives in.
            return Err(StubError::NotOwnProcess(process_id));
        }
        self.controller.suspend_threads()?;
        self.attached = true;
        info!("debugger attached to process {own}");
        Ok(())
    }

    fn detach(&mut self) {
        debug!("detaching, restoring patched code and resuming threads");
        self.controller.clear_breakpoints();
        if let Err(error) = self.controller.resume_threads() {
            warn!("could not resume all threads on detach: {error}");
        }
        self.attached = false;
    }

    fn kill(&mut self) -> Result<()> {
        info!("killing own process at debugger request");
        std::process::exit(9);
    }

    fn interrupt_execution(&mut self) -> Result<()> {
        // Stop the world first so the stop reply can read registers.
        self.controller.suspend_threads()?;
        self.controller.interrupt(|| {});
        Ok(())
    }

    fn is_thread_alive(&self, thread_id: ThreadId) -> Result<bool> {
        Ok(sys::thread_exists(thread_id))
    }

    fn get_stop_info_for_thread(&self, thread_id: ThreadId) -> Result<ThreadStopInfo> {
        if let Some(exception) = self
            .last_exception
            .filter(|exception| exception.thread == thread_id)
        {
            return Ok(ThreadStopInfo {
                signal_number: exception.signal_number(),
                dispatch_queue_address: Option::None,
                exception: Some(StopExceptionDetail {
                    exception_type: exception.signal as u32,
                    data: exception.data().to_vec(),
                }),
            });
        }
        // Not the faulting thread: it is simply held stopped.
        Ok(ThreadStopInfo {
            signal_number: libc::SIGSTOP as u8,
            dispatch_queue_address: Option::None,
            exception: Option::None,
        })
    }

    fn get_shared_library_info_address(&self) -> Result<Address> {
        self.controller.get_shared_library_info_address()
    }

    fn set_breakpoint(&mut self, address: Address, byte_size: usize) -> Result<()> {
        // The client tells us how many bytes it thinks a trap needs; x86
        // software breakpoints are always one byte, larger values are fine.
        let _ = byte_size;
        self.controller.install_breakpoint(address)?;
        Ok(())
    }

    fn remove_breakpoint(&mut self, address: Address) -> Result<()> {
        self.controller.remove_breakpoint(Breakpoint { address })
    }

    fn allocate(&mut self, size: usize, permissions: MemoryPermissions) -> Result<Address> {
        self.controller.allocate(size, permissions)
    }

    fn deallocate(&mut self, address: Address) -> Result<()> {
        self.controller.deallocate(address)
    }

    fn read_memory(&self, address: Address, size: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; size];
        sys::read_memory(address, &mut buffer)?;
        Ok(buffer)
    }

    fn write_memory(&mut self, address: Address, bytes: &[u8]) -> Result<()> {
        sys::write_memory(address, bytes)?;
        Ok(())
    }

    fn get_register_value_for_thread(
        &self,
        thread_id: ThreadId,
        register_id: u32,
        register_set_id: u32,
        dest: &mut [u8],
    ) -> Result<usize> {
        Thread::new(thread_id).get_register_value(register_id, register_set_id, dest)
    }

    fn set_register_value_for_thread(
        &mut self,
        thread_id: ThreadId,
        register_id: u32,
        register_set_id: u32,
        source: &[u8],
    ) -> Result<()> {
        Thread::new(thread_id).set_register_value(register_id, register_set_id, source)
    }

    fn get_ip_register_value_for_thread(&self, thread_id: ThreadId) -> Result<Address> {
        Thread::new(thread_id).get_instruction_pointer()
    }

    fn get_register_context_for_thread(
        &self,
        thread_id: ThreadId,
        dest: &mut [u8],
    ) -> Result<usize> {
        Thread::new(thread_id).get_register_context(dest)
    }

    fn set_register_context_for_thread(
        &mut self,
        thread_id: ThreadId,
        source: &[u8],
    ) -> Result<()> {
        Thread::new(thread_id).set_register_context(source)
    }

    fn resume(
        &mut self,
        entries: &[ThreadResumeEntry],
        default_action: ThreadResumeAction,
    ) -> Result<()> {
        let threads = self.threads();
        let actions =
            resolve_resume_actions(&threads, self.primary_thread, entries, default_action);
        for (tid, action, address) in actions {
            let thread = Thread::new(tid);
            let suspended = thread.get_suspend_count()? > 0;
            match action {
                ThreadResumeAction::Stop => {
                    if !suspended {
                        thread.suspend()?;
                    }
                }
                ThreadResumeAction::Continue | ThreadResumeAction::Step => {
                    if !suspended {
                        if action == ThreadResumeAction::Step {
                            warn!("cannot single step thread {tid}, it is not stopped");
                        }
                        continue;
                    }
                    if let Some(address) = address {
                        thread.set_instruction_pointer(address)?;
                    }
                    if action == ThreadResumeAction::Step {
                        thread.begin_single_step_mode()?;
                    } else {
                        thread.end_single_step_mode()?;
                    }
                    Self::resume_fully(&thread)?;
                }
                ThreadResumeAction::None => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTINUE: ThreadResumeAction = ThreadResumeAction::Continue;
    const STEP: ThreadResumeAction = ThreadResumeAction::Step;
    const STOP: ThreadResumeAction = ThreadResumeAction::Stop;
    const NONE: ThreadResumeAction = ThreadResumeAction::None;

    fn entry(
        thread: ThreadReference,
        action: ThreadResumeAction,
        address: Option<Address>,
    ) -> ThreadResumeEntry {
        ThreadResumeEntry {
            thread,
            action,
            address,
        }
    }

    #[test]
    fn test_specific_entry_with_default_backfill() {
        let threads = [2, 400];
        let entries = [entry(ThreadReference::Id(2), CONTINUE, Option::None)];
        let result = resolve_resume_actions(&threads, 2, &entries, NONE);
        assert_eq!(
            result,
            vec![(2, CONTINUE, Option::None), (400, NONE, Option::None)]
        );
    }

    #[test]
    fn test_all_reference_reaches_every_thread() {
        let threads = [2, 400];
        let entries = [entry(ThreadReference::All, CONTINUE, Option::None)];
        let result = resolve_resume_actions(&threads, 2, &entries, NONE);
        assert_eq!(
            result,
            vec![(2, CONTINUE, Option::None), (400, CONTINUE, Option::None)]
        );
    }

    #[test]
    fn test_two_specific_entries() {
        let threads = [2, 400];
        let entries = [
            entry(ThreadReference::Id(2), CONTINUE, Option::None),
            entry(ThreadReference::Id(400), STEP, Option::None),
        ];
        let result = resolve_resume_actions(&threads, 2, &entries, STOP);
        assert_eq!(
            result,
            vec![(2, CONTINUE, Option::None), (400, STEP, Option::None)]
        );
    }

    #[test]
    fn test_any_resolves_to_primary_without_overriding() {
        let threads = [2, 400];
        let entries = [
            entry(ThreadReference::Any, STOP, Some(Address::from(0x20usize))),
            entry(ThreadReference::Id(400), STEP, Option::None),
        ];
        let result = resolve_resume_actions(&threads, 2, &entries, STOP);
        assert_eq!(
            result,
            vec![
                (2, STOP, Some(Address::from(0x20usize))),
                (400, STEP, Option::None),
            ]
        );

        // An earlier specific entry wins over a later Any.
        let entries = [
            entry(ThreadReference::Id(2), CONTINUE, Option::None),
            entry(ThreadReference::Any, STOP, Option::None),
        ];
        let result = resolve_resume_actions(&threads, 2, &entries, NONE);
        assert_eq!(
            result,
            vec![(2, CONTINUE, Option::None), (400, NONE, Option::None)]
        );
    }

    #[test]
    fn test_later_broadcast_overwrites_earlier_specific() {
        let threads = [2, 400];
        let entries = [
            entry(ThreadReference::Id(400), STEP, Option::None),
            entry(ThreadReference::All, CONTINUE, Option::None),
        ];
        let result = resolve_resume_actions(&threads, 2, &entries, STOP);
        assert_eq!(
            result,
            vec![(2, CONTINUE, Option::None), (400, CONTINUE, Option::None)]
        );
    }

    #[test]
    fn test_later_specific_overrides_earlier_one() {
        let threads = [7];
        let entries = [
            entry(ThreadReference::Id(7), STOP, Option::None),
            entry(ThreadReference::Id(7), STEP, Some(Address::from(0x40usize))),
        ];
        let result = resolve_resume_actions(&threads, 7, &entries, NONE);
        assert_eq!(result, vec![(7, STEP, Some(Address::from(0x40usize)))]);
    }

    #[test]
    fn test_every_thread_gets_exactly_one_action() {
        let threads: Vec<ThreadId> = (1..=32).collect();
        let entries = [
            entry(ThreadReference::All, CONTINUE, Option::None),
            entry(ThreadReference::Id(5), STEP, Option::None),
        ];
        let result = resolve_resume_actions(&threads, 1, &entries, STOP);
        assert_eq!(result.len(), threads.len());
        for (index, (tid, action, _)) in result.iter().enumerate() {
            assert_eq!(*tid, threads[index]);
            let expected = if *tid == 5 { STEP } else { CONTINUE };
            assert_eq!(*action, expected);
        }
    }
}
