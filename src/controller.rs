//! # Controller Module
//!
//! The execution control engine of the stub. The controller owns the
//! breakpoint table, the allocation table and the synchronization between
//! the exception listener thread and whoever drives the debug session.
//!
//! The controller is expected to live on its own thread (see
//! [`run_controller`]); the protocol server typically runs on a utility
//! thread started through [`Controller::run_utility_thread`]. Both of
//! those internal threads are excluded from all "all threads" operations,
//! the debugged application must never notice them.
//!
//! A breakpoint is reference counted: installing at an already patched
//! address only bumps the counter, removing decrements and restores the
//! original code only when the counter drops to zero. For every installed
//! breakpoint the controller also remembers the landing address the
//! processor reports once the trap fires, so that
//! [`Controller::wait_for_event`] can rewind the instruction pointer of a
//! trapped thread back to the breakpoint address before anyone looks at
//! it.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use tracing::{debug, info, trace, warn};

use crate::addr::{Address, MemoryPermissions};
use crate::breakpoint::{Breakpoint, NUMBER_OF_BYTES_TO_PATCH, PatchState};
use crate::errors::{Result, StubError};
use crate::exception::Exception;
use crate::sys::{self, trap};
use crate::thread::Thread;
use crate::ThreadId;

/// What [`Controller::wait_for_event`] woke up for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerEvent {
    CaughtException(Exception),
    Interrupted,
}

/// Everything known about one patched address
struct BreakpointState {
    patch: PatchState,
    landing_address: Address,
    counter: u32,
}

#[derive(Default)]
struct Tables {
    breakpoints: HashMap<Address, BreakpointState>,
    /// Landing address back to the breakpoint address, one entry per
    /// active breakpoint
    landing_addresses: HashMap<Address, Address>,
    allocations: HashMap<Address, usize>,
}

#[derive(Default)]
struct EventState {
    caught_exception: Option<Exception>,
    interrupt_requested: bool,
    controller_thread: ThreadId,
    listener_thread: Option<ThreadId>,
    utility_thread: Option<ThreadId>,
}

struct Shared {
    tables: Mutex<Tables>,
    events: Mutex<EventState>,
    condition: Condvar,
}

/// The execution control engine; cheap to clone, all clones share state
#[derive(Clone)]
pub struct Controller {
    shared: Arc<Shared>,
}

impl Controller {
    /// Creates the controller on the calling thread
    ///
    /// The calling thread becomes the controller thread and is excluded
    /// from thread enumeration from here on.
    pub fn new() -> Self {
        let controller = Controller {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::default()),
                events: Mutex::new(EventState::default()),
                condition: Condvar::new(),
            }),
        };
        controller.shared.events.lock().unwrap().controller_thread = sys::current_thread_id();
        controller
    }

    /// Enumerates the live threads of the process, without the controller
    /// internal ones
    ///
    /// # Errors
    ///
    /// Surfaces the kernel error if enumeration fails.
    pub fn get_threads(&self) -> Result<Vec<Thread>> {
        let (controller, listener, utility) = {
            let events = self.shared.events.lock().unwrap();
            (
                events.controller_thread,
                events.listener_thread,
                events.utility_thread,
            )
        };
        Ok(sys::list_threads()?
            .into_iter()
            .filter(|tid| {
                *tid != controller && Some(*tid) != listener && Some(*tid) != utility
            })
            .map(Thread::new)
            .collect())
    }

    /// Suspends every application thread
    ///
    /// # Errors
    ///
    /// The first failing thread aborts the iteration and its error is
    /// returned; threads suspended so far stay suspended.
    pub fn suspend_threads(&self) -> Result<()> {
        for thread in self.get_threads()? {
            thread.suspend()?;
        }
        Ok(())
    }

    /// Resumes every application thread
    ///
    /// # Errors
    ///
    /// The first failing thread aborts the iteration and its error is
    /// returned, like for [`Self::suspend_threads`].
    pub fn resume_threads(&self) -> Result<()> {
        for thread in self.get_threads()? {
            thread.resume()?;
        }
        Ok(())
    }

    /// Installs a software breakpoint at `address`
    ///
    /// If a breakpoint already exists there, only its reference count goes
    /// up and the same handle is returned; memory is not touched again.
    ///
    /// # Errors
    ///
    /// Fails if the code page cannot be made writable or patched. Failure
    /// is atomic, no patch state is recorded then.
    pub fn install_breakpoint(&self, address: Address) -> Result<Breakpoint> {
        let mut tables = self.shared.tables.lock().unwrap();
        if let Some(state) = tables.breakpoints.get_mut(&address) {
            state.counter += 1;
            trace!("breakpoint at {address} referenced {} times", state.counter);
            return Ok(Breakpoint { address });
        }

        // Make sure we can write to the code; the protection is widened to
        // everything and stays that way.
        let page_size = sys::page_size();
        let page = Address::from(address.usize() & !(page_size - 1));
        let span = address.usize() - page.usize() + NUMBER_OF_BYTES_TO_PATCH;
        sys::protect(page, span, MemoryPermissions::ALL)?;

        let (patch, landing_address) = PatchState::create(address)?;
        tables.landing_addresses.insert(landing_address, address);
        tables.breakpoints.insert(
            address,
            BreakpointState {
                patch,
                landing_address,
                counter: 1,
            },
        );
        info!("installed breakpoint at {address}");
        Ok(Breakpoint { address })
    }

    /// Removes one reference to a breakpoint, unpatching at zero
    ///
    /// # Errors
    ///
    /// Fails with [`StubError::InvalidBreakpoint`] for an address that has
    /// no breakpoint, or if the original code cannot be restored.
    ///
    /// # Panics
    ///
    /// If the landing address map disagrees with the breakpoint table.
    /// That is an internal invariant, breaking it is a bug in this crate.
    pub fn remove_breakpoint(&self, breakpoint: Breakpoint) -> Result<()> {
        let mut tables = self.shared.tables.lock().unwrap();
        let state = tables
            .breakpoints
            .get_mut(&breakpoint.address)
            .ok_or(StubError::InvalidBreakpoint)?;
        if state.counter > 1 {
            state.counter -= 1;
            trace!(
                "breakpoint at {} still referenced {} times",
                breakpoint.address,
                state.counter
            );
            return Ok(());
        }
        state.patch.restore_original_instruction(breakpoint.address)?;
        let state = tables
            .breakpoints
            .remove(&breakpoint.address)
            .expect("breakpoint entry vanished while locked");
        let back_reference = tables.landing_addresses.remove(&state.landing_address);
        assert_eq!(
            back_reference,
            Some(breakpoint.address),
            "landing address map out of sync with the breakpoint table"
        );
        info!("removed breakpoint at {}", breakpoint.address);
        Ok(())
    }

    /// Allocates memory with the given permissions
    ///
    /// # Errors
    ///
    /// Fails if the mapping or its protection fails; a mapping whose
    /// protection step failed is unmapped again before the error is
    /// returned.
    pub fn allocate(&self, size: usize, permissions: MemoryPermissions) -> Result<Address> {
        let address = sys::allocate(size)?;
        if let Err(error) = sys::protect(address, size, permissions) {
            // Do not leak the fresh mapping on the error path.
            if let Err(cleanup_error) = sys::deallocate(address, size) {
                warn!("could not roll back allocation at {address}: {cleanup_error}");
            }
            return Err(error);
        }
        self.shared
            .tables
            .lock()
            .unwrap()
            .allocations
            .insert(address, size);
        debug!("allocated {size} bytes at {address}");
        Ok(address)
    }

    /// Frees memory previously handed out by [`Self::allocate`]
    ///
    /// # Errors
    ///
    /// Fails with [`StubError::InvalidAllocation`] for an unknown address.
    pub fn deallocate(&self, address: Address) -> Result<()> {
        let size = self
            .shared
            .tables
            .lock()
            .unwrap()
            .allocations
            .remove(&address)
            .ok_or(StubError::InvalidAllocation)?;
        sys::deallocate(address, size)?;
        debug!("deallocated {size} bytes at {address}");
        Ok(())
    }

    /// Restores every patched code location and forgets all breakpoints
    ///
    /// Used on detach; reference counts do not matter then, the original
    /// code must come back.
    pub fn clear_breakpoints(&self) {
        let mut tables = self.shared.tables.lock().unwrap();
        let breakpoints = std::mem::take(&mut tables.breakpoints);
        tables.landing_addresses.clear();
        for (address, state) in breakpoints {
            if let Err(error) = state.patch.restore_original_instruction(address) {
                warn!("could not restore original code at {address}: {error}");
            }
        }
    }

    /// Address of the dynamic linker rendezvous structure
    ///
    /// # Errors
    ///
    /// Infallible on this platform, fallible in the signature because the
    /// underlying task query can fail elsewhere.
    pub fn get_shared_library_info_address(&self) -> Result<Address> {
        Ok(sys::shared_library_info_address())
    }

    /// Creates the exception delivery channel, binds the given threads to
    /// it and starts the listener thread
    ///
    /// Returns once the listener thread announced its identity, so it is
    /// already excluded from [`Self::get_threads`] afterwards.
    ///
    /// # Errors
    ///
    /// Fails if the handlers cannot be installed or the thread cannot be
    /// spawned.
    pub fn initialize_exception_handling_for_threads(&self, threads: &[Thread]) -> Result<()> {
        trap::initialize()?;
        for thread in threads {
            trap::register_thread(thread.id())?;
        }

        let shared = Arc::clone(&self.shared);
        std::thread::Builder::new()
            .name("debugstub exception listener".into())
            .spawn(move || {
                {
                    let mut events = shared.events.lock().unwrap();
                    events.listener_thread = Some(sys::current_thread_id());
                    shared.condition.notify_all();
                }
                listener_loop(&shared);
            })?;

        let mut events = self.shared.events.lock().unwrap();
        while events.listener_thread.is_none() {
            events = self.shared.condition.wait(events).unwrap();
        }
        info!("exception listener running");
        Ok(())
    }

    /// Spawns the utility thread, typically used for the protocol server
    /// loop
    ///
    /// Blocks until the new thread announced its identity through the
    /// interrupt mechanism, so it can reliably be excluded from thread
    /// enumeration before any caller sees it.
    ///
    /// # Errors
    ///
    /// Fails if the thread cannot be spawned.
    pub fn run_utility_thread(&self, work: impl FnOnce() + Send + 'static) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        std::thread::Builder::new()
            .name("debugstub utility".into())
            .spawn(move || {
                {
                    let mut events = shared.events.lock().unwrap();
                    events.utility_thread = Some(sys::current_thread_id());
                    events.interrupt_requested = true;
                    shared.condition.notify_all();
                }
                work();
            })?;

        let mut events = self.shared.events.lock().unwrap();
        while events.utility_thread.is_none() {
            events = self.shared.condition.wait(events).unwrap();
        }
        // Consume the announcement so the next wait does not see a stale
        // interrupt.
        events.interrupt_requested = false;
        Ok(())
    }

    /// Requests an interrupt of [`Self::wait_for_event`] from any thread
    ///
    /// `f` runs under the event lock before the waiter wakes.
    pub fn interrupt(&self, f: impl FnOnce()) {
        let mut events = self.shared.events.lock().unwrap();
        f();
        events.interrupt_requested = true;
        self.shared.condition.notify_all();
        drop(events);
    }

    /// Blocks until an exception was caught or an interrupt was requested
    ///
    /// A caught exception wins if both are pending. For breakpoint traps
    /// whose reported instruction pointer is a known landing address, the
    /// trapped thread's instruction pointer is rewound to the breakpoint
    /// address before the event is returned, so the thread looks like it
    /// never left its own code.
    ///
    /// The optional `interrupt_handler` runs under the event lock when an
    /// interrupt is consumed.
    ///
    /// # Errors
    ///
    /// Fails if the trapped thread's registers cannot be adjusted.
    pub fn wait_for_event(&self, interrupt_handler: Option<&dyn Fn()>) -> Result<ControllerEvent> {
        let mut events = self.shared.events.lock().unwrap();
        loop {
            if let Some(exception) = events.caught_exception.take() {
                // Free the buffer slot for the listener thread.
                self.shared.condition.notify_all();
                drop(events);
                debug!(
                    "caught {} exception on thread {}",
                    exception.reason(),
                    exception.thread
                );
                if exception.is_code_patch_trap() {
                    self.rewind_from_landing_address(&exception)?;
                }
                return Ok(ControllerEvent::CaughtException(exception));
            }
            if events.interrupt_requested {
                events.interrupt_requested = false;
                if let Some(handler) = interrupt_handler {
                    handler();
                }
                return Ok(ControllerEvent::Interrupted);
            }
            events = self.shared.condition.wait(events).unwrap();
        }
    }

    /// Puts the instruction pointer of a trapped thread back onto the
    /// breakpoint address it hit
    fn rewind_from_landing_address(&self, exception: &Exception) -> Result<()> {
        let thread = Thread::new(exception.thread);
        let landing = thread.get_instruction_pointer()?;
        let breakpoint_address = {
            let tables = self.shared.tables.lock().unwrap();
            tables.landing_addresses.get(&landing).copied()
        };
        if let Some(address) = breakpoint_address {
            thread.set_instruction_pointer(address)?;
            debug!("rewound thread {} from {landing} to {address}", exception.thread);
        }
        Ok(())
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

/// Forwards caught exceptions into the controller, one at a time
fn listener_loop(shared: &Shared) {
    loop {
        let exception = trap::next_exception();
        let mut events = shared.events.lock().unwrap();
        // Never overwrite an unconsumed exception; the faulting thread
        // stays parked, so waiting here cannot lose anything.
        while events.caught_exception.is_some() {
            events = shared.condition.wait(events).unwrap();
        }
        events.caught_exception = Some(exception);
        shared.condition.notify_all();
    }
}

/// Launches the controller on a dedicated thread and hands it to `client`
///
/// # Errors
///
/// Fails if the controller thread cannot be spawned.
pub fn run_controller(
    client: impl FnOnce(Controller) + Send + 'static,
) -> Result<std::thread::JoinHandle<()>> {
    Ok(std::thread::Builder::new()
        .name("debugstub controller".into())
        .spawn(move || client(Controller::new()))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breakpoint_reference_counting() {
        let controller = Controller::new();
        let memory = controller
            .allocate(4096, MemoryPermissions::READ | MemoryPermissions::WRITE)
            .unwrap();
        sys::write_memory(memory, &[0x90, 0x90, 0x90, 0x90]).unwrap();

        let bp0 = controller.install_breakpoint(memory).unwrap();
        let bp1 = controller.install_breakpoint(memory).unwrap();
        assert_eq!(bp0, bp1);

        let mut byte = [0u8; 1];
        sys::read_memory(memory, &mut byte).unwrap();
        assert_eq!(byte[0], crate::breakpoint::BREAKPOINT_BYTE);

        // One reference down, the patch must stay.
        controller.remove_breakpoint(bp0).unwrap();
        sys::read_memory(memory, &mut byte).unwrap();
        assert_eq!(byte[0], crate::breakpoint::BREAKPOINT_BYTE);

        // Last reference gone, the original byte is back.
        controller.remove_breakpoint(bp1).unwrap();
        sys::read_memory(memory, &mut byte).unwrap();
        assert_eq!(byte[0], 0x90);

        assert!(matches!(
            controller.remove_breakpoint(bp0),
            Err(StubError::InvalidBreakpoint)
        ));
        controller.deallocate(memory).unwrap();
    }

    #[test]
    fn test_allocation_table_checks_deallocate() {
        let controller = Controller::new();
        let memory = controller.allocate(4096, MemoryPermissions::ALL).unwrap();
        controller.deallocate(memory).unwrap();
        assert!(matches!(
            controller.deallocate(memory),
            Err(StubError::InvalidAllocation)
        ));
        assert!(matches!(
            controller.deallocate(Address::from(0x10usize)),
            Err(StubError::InvalidAllocation)
        ));
    }

    #[test]
    fn test_interrupt_wakes_wait_for_event() {
        let controller = Controller::new();
        let waker = controller.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            waker.interrupt(|| {});
        });
        let event = controller.wait_for_event(None).unwrap();
        assert_eq!(event, ControllerEvent::Interrupted);
        handle.join().unwrap();
    }

    #[test]
    fn test_interrupt_handler_runs_on_consumption() {
        use std::sync::atomic::{AtomicBool, Ordering};
        let controller = Controller::new();
        controller.interrupt(|| {});
        let ran = AtomicBool::new(false);
        let handler = || ran.store(true, Ordering::SeqCst);
        let event = controller.wait_for_event(Some(&handler)).unwrap();
        assert_eq!(event, ControllerEvent::Interrupted);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_own_thread_excluded_from_enumeration() {
        let controller = Controller::new();
        let threads = controller.get_threads().unwrap();
        let own = sys::current_thread_id();
        assert!(threads.iter().all(|thread| thread.id() != own));
    }
}
