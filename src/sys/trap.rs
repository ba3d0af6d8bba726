//! # Trap Delivery Module
//!
//! The exception channel between the threads of this process and the
//! controller's listener thread, built from signal handlers.
//!
//! Hardware exceptions (breakpoints, faults) arrive as synchronous signals
//! on the faulting thread itself. The handler copies the interrupted
//! thread's register state from its `ucontext` into a per-thread park
//! slot, raises the thread's suspend count, publishes a one-deep event
//! record and parks the thread in `sigsuspend` until it is resumed. The
//! listener thread blocks on a semaphore and hands each published event to
//! the controller. Register values changed while the thread is parked are
//! written back into the `ucontext` right before the handler returns, so
//! redirecting the instruction pointer of a stopped thread works.
//!
//! Suspension of arbitrary threads uses the same parking mechanism with a
//! pair of realtime signals and a userspace suspend count: one signal asks
//! a thread to park, the other wakes it from `sigsuspend` so that it can
//! re-check the count.
//!
//! Everything the handlers touch is restricted to async-signal-safe
//! operations: atomics, `sem_post` and `sigsuspend`.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Once;

use nix::errno::Errno;
use nix::libc;
use tracing::{debug, warn};

use crate::addr::Address;
use crate::errors::{Result, StubError};
use crate::exception::Exception;
use crate::registers::RegisterContext;
use crate::sys;
use crate::ThreadId;

/// How many threads can be tracked at the same time
pub const MAX_TRACKED_THREADS: usize = 64;

/// The signals the exception channel intercepts
pub const EXCEPTION_SIGNALS: [i32; 5] = [
    libc::SIGTRAP,
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGILL,
    libc::SIGFPE,
];

fn suspend_signal() -> i32 {
    libc::SIGRTMIN() + 4
}

fn restart_signal() -> i32 {
    libc::SIGRTMIN() + 5
}

/// Park state of one tracked thread
///
/// The register context is only valid while `parked` is true, and only the
/// parked thread itself or a thread that observed `parked == true` while
/// holding the thread suspended may touch it.
struct ParkSlot {
    /// Thread id owning this slot, 0 while the slot is free
    tid: AtomicU64,
    /// True while the thread sits in `sigsuspend` with a valid context
    parked: AtomicBool,
    suspend_count: AtomicU32,
    context: UnsafeCell<MaybeUninit<RegisterContext>>,
}

// The context cell is guarded by the parked flag and the suspend count.
unsafe impl Sync for ParkSlot {}

#[allow(clippy::declare_interior_mutable_const)]
const FREE_SLOT: ParkSlot = ParkSlot {
    tid: AtomicU64::new(0),
    parked: AtomicBool::new(false),
    suspend_count: AtomicU32::new(0),
    context: UnsafeCell::new(MaybeUninit::uninit()),
};

static SLOTS: [ParkSlot; MAX_TRACKED_THREADS] = [FREE_SLOT; MAX_TRACKED_THREADS];

/// The one-deep exception event cell between handlers and the listener
struct EventCell {
    claimed: AtomicBool,
    tid: AtomicU64,
    signal: AtomicI32,
    code: AtomicI32,
    fault_address: AtomicUsize,
}

static EVENT: EventCell = EventCell {
    claimed: AtomicBool::new(false),
    tid: AtomicU64::new(0),
    signal: AtomicI32::new(0),
    code: AtomicI32::new(0),
    fault_address: AtomicUsize::new(0),
};

struct EventSemaphore(UnsafeCell<MaybeUninit<libc::sem_t>>);

unsafe impl Sync for EventSemaphore {}

static EVENT_SEM: EventSemaphore = EventSemaphore(UnsafeCell::new(MaybeUninit::uninit()));

fn event_sem() -> *mut libc::sem_t {
    EVENT_SEM.0.get().cast()
}

fn slot_for(tid: ThreadId) -> Option<&'static ParkSlot> {
    SLOTS.iter().find(|slot| slot.tid.load(Ordering::Acquire) == tid)
}

/// Finds the slot of `tid`, claiming a free one if the thread is unknown
///
/// Async-signal-safe; used by the handlers and by slot registration.
fn find_or_claim_slot(tid: ThreadId) -> Option<&'static ParkSlot> {
    if let Some(slot) = slot_for(tid) {
        return Some(slot);
    }
    for slot in &SLOTS {
        if slot
            .tid
            .compare_exchange(0, tid, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return Some(slot);
        }
    }
    None
}

// ---------------- signal handlers ----------------------------------------------------------------

/// Parks the calling thread until its suspend count drops to zero
///
/// The restart signal is the only one left unblocked; it interrupts the
/// `sigsuspend` so the count can be re-checked.
unsafe fn park(slot: &ParkSlot) {
    let mut mask = MaybeUninit::<libc::sigset_t>::uninit();
    libc::sigfillset(mask.as_mut_ptr());
    libc::sigdelset(mask.as_mut_ptr(), restart_signal());
    let mask = mask.assume_init();
    while slot.suspend_count.load(Ordering::SeqCst) > 0 {
        libc::sigsuspend(&mask);
    }
}

unsafe fn park_with_context(slot: &ParkSlot, ucontext: *mut libc::ucontext_t) {
    save_context(ucontext, (*slot.context.get()).as_mut_ptr());
    slot.parked.store(true, Ordering::SeqCst);
    park(slot);
    restore_context((*slot.context.get()).as_ptr(), ucontext);
    slot.parked.store(false, Ordering::SeqCst);
}

unsafe extern "C" fn exception_handler(
    signal: libc::c_int,
    info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    let tid = libc::syscall(libc::SYS_gettid) as ThreadId;
    let Some(slot) = find_or_claim_slot(tid) else {
        // No slot left for this thread; fall back to the default action so
        // the fault is not silently swallowed.
        libc::signal(signal, libc::SIG_DFL);
        return;
    };

    // The faulting thread stays suspended until the debugger resumes it.
    slot.suspend_count.fetch_add(1, Ordering::SeqCst);

    let code = (*info).si_code;
    let fault_address = (*info).si_addr() as usize;

    // Publish the event once the context is saved; one exception is
    // buffered at a time, a second faulting thread spins here until the
    // first event was consumed.
    save_context(ucontext.cast(), (*slot.context.get()).as_mut_ptr());
    slot.parked.store(true, Ordering::SeqCst);
    while EVENT
        .claimed
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
        .is_err()
    {
        std::hint::spin_loop();
    }
    EVENT.tid.store(tid, Ordering::Relaxed);
    EVENT.signal.store(signal, Ordering::Relaxed);
    EVENT.code.store(code, Ordering::Relaxed);
    EVENT.fault_address.store(fault_address, Ordering::Release);
    libc::sem_post(event_sem());

    park(slot);
    restore_context((*slot.context.get()).as_ptr(), ucontext.cast());
    slot.parked.store(false, Ordering::SeqCst);
}

unsafe extern "C" fn suspend_handler(
    _signal: libc::c_int,
    _info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    let tid = libc::syscall(libc::SYS_gettid) as ThreadId;
    let Some(slot) = find_or_claim_slot(tid) else {
        return;
    };
    park_with_context(slot, ucontext.cast());
}

unsafe extern "C" fn restart_handler(
    _signal: libc::c_int,
    _info: *mut libc::siginfo_t,
    _ucontext: *mut libc::c_void,
) {
    // Only exists to interrupt sigsuspend.
}

// ---------------- context conversion -------------------------------------------------------------

unsafe fn save_context(ucontext: *const libc::ucontext_t, context: *mut RegisterContext) {
    let gregs = &(*ucontext).uc_mcontext.gregs;
    let value = |index: libc::c_int| gregs[index as usize] as u64;

    let context = &mut *context;
    context.gpr.rax = value(libc::REG_RAX);
    context.gpr.rbx = value(libc::REG_RBX);
    context.gpr.rcx = value(libc::REG_RCX);
    context.gpr.rdx = value(libc::REG_RDX);
    context.gpr.rdi = value(libc::REG_RDI);
    context.gpr.rsi = value(libc::REG_RSI);
    context.gpr.rbp = value(libc::REG_RBP);
    context.gpr.rsp = value(libc::REG_RSP);
    context.gpr.r8 = value(libc::REG_R8);
    context.gpr.r9 = value(libc::REG_R9);
    context.gpr.r10 = value(libc::REG_R10);
    context.gpr.r11 = value(libc::REG_R11);
    context.gpr.r12 = value(libc::REG_R12);
    context.gpr.r13 = value(libc::REG_R13);
    context.gpr.r14 = value(libc::REG_R14);
    context.gpr.r15 = value(libc::REG_R15);
    context.gpr.rip = value(libc::REG_RIP);
    context.gpr.rflags = value(libc::REG_EFL);
    let csgsfs = value(libc::REG_CSGSFS);
    context.gpr.cs = csgsfs & 0xffff;
    context.gpr.gs = (csgsfs >> 16) & 0xffff;
    context.gpr.fs = (csgsfs >> 32) & 0xffff;

    context.exc.trapno = value(libc::REG_TRAPNO) as u32;
    context.exc.err = value(libc::REG_ERR) as u32;
    context.exc.faultvaddr = value(libc::REG_CR2);

    let fpregs = (*ucontext).uc_mcontext.fpregs;
    if fpregs.is_null() {
        return;
    }
    let fpregs = &*fpregs;
    context.fpu.fcw = fpregs.cwd;
    context.fpu.fsw = fpregs.swd;
    context.fpu.ftw = fpregs.ftw as u8;
    context.fpu.fop = fpregs.fop;
    context.fpu.fioff = fpregs.rip as u32;
    context.fpu.fiseg = (fpregs.rip >> 32) as u16;
    context.fpu.fooff = fpregs.rdp as u32;
    context.fpu.foseg = (fpregs.rdp >> 32) as u16;
    context.fpu.mxcsr = fpregs.mxcsr;
    context.fpu.mxcsrmask = fpregs.mxcr_mask;
    for (index, st) in fpregs._st.iter().enumerate() {
        let mut bytes = [0u8; 10];
        for (half, word) in st.significand.iter().enumerate() {
            bytes[half * 2..half * 2 + 2].copy_from_slice(&word.to_le_bytes());
        }
        bytes[8..10].copy_from_slice(&st.exponent.to_le_bytes());
        context.fpu.stmm[index] = bytes;
    }
    for (index, xmm) in fpregs._xmm.iter().enumerate() {
        let mut bytes = [0u8; 16];
        for (quarter, word) in xmm.element.iter().enumerate() {
            bytes[quarter * 4..quarter * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        context.fpu.xmm[index] = bytes;
    }
}

unsafe fn restore_context(context: *const RegisterContext, ucontext: *mut libc::ucontext_t) {
    let context = &*context;
    let gregs = &mut (*ucontext).uc_mcontext.gregs;
    let mut set = |index: libc::c_int, value: u64| gregs[index as usize] = value as libc::greg_t;

    set(libc::REG_RAX, context.gpr.rax);
    set(libc::REG_RBX, context.gpr.rbx);
    set(libc::REG_RCX, context.gpr.rcx);
    set(libc::REG_RDX, context.gpr.rdx);
    set(libc::REG_RDI, context.gpr.rdi);
    set(libc::REG_RSI, context.gpr.rsi);
    set(libc::REG_RBP, context.gpr.rbp);
    set(libc::REG_RSP, context.gpr.rsp);
    set(libc::REG_R8, context.gpr.r8);
    set(libc::REG_R9, context.gpr.r9);
    set(libc::REG_R10, context.gpr.r10);
    set(libc::REG_R11, context.gpr.r11);
    set(libc::REG_R12, context.gpr.r12);
    set(libc::REG_R13, context.gpr.r13);
    set(libc::REG_R14, context.gpr.r14);
    set(libc::REG_R15, context.gpr.r15);
    set(libc::REG_RIP, context.gpr.rip);
    set(libc::REG_EFL, context.gpr.rflags);
    let csgsfs =
        (context.gpr.cs & 0xffff) | ((context.gpr.gs & 0xffff) << 16) | ((context.gpr.fs & 0xffff) << 32);
    set(libc::REG_CSGSFS, csgsfs);
    // The exception state is get-only.

    let fpregs = (*ucontext).uc_mcontext.fpregs;
    if fpregs.is_null() {
        return;
    }
    let fpregs = &mut *fpregs;
    fpregs.cwd = context.fpu.fcw;
    fpregs.swd = context.fpu.fsw;
    fpregs.ftw = u16::from(context.fpu.ftw);
    fpregs.fop = context.fpu.fop;
    fpregs.rip = u64::from(context.fpu.fioff) | (u64::from(context.fpu.fiseg) << 32);
    fpregs.rdp = u64::from(context.fpu.fooff) | (u64::from(context.fpu.foseg) << 32);
    fpregs.mxcsr = context.fpu.mxcsr;
    fpregs.mxcr_mask = context.fpu.mxcsrmask;
    for (index, st) in fpregs._st.iter_mut().enumerate() {
        let bytes = &context.fpu.stmm[index];
        for (half, word) in st.significand.iter_mut().enumerate() {
            *word = u16::from_le_bytes([bytes[half * 2], bytes[half * 2 + 1]]);
        }
        st.exponent = u16::from_le_bytes([bytes[8], bytes[9]]);
    }
    for (index, xmm) in fpregs._xmm.iter_mut().enumerate() {
        let bytes = &context.fpu.xmm[index];
        for (quarter, word) in xmm.element.iter_mut().enumerate() {
            *word = u32::from_le_bytes([
                bytes[quarter * 4],
                bytes[quarter * 4 + 1],
                bytes[quarter * 4 + 2],
                bytes[quarter * 4 + 3],
            ]);
        }
    }
}

// ---------------- public surface -----------------------------------------------------------------

unsafe fn install_handler(
    signal: i32,
    handler: unsafe extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void),
) -> Result<()> {
    let mut action = MaybeUninit::<libc::sigaction>::zeroed().assume_init();
    action.sa_sigaction = handler as usize;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
    libc::sigfillset(&mut action.sa_mask);
    if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
        return Err(Errno::last().into());
    }
    Ok(())
}

static INIT: Once = Once::new();

/// Installs the trap handlers and the event semaphore, once per process
///
/// # Errors
///
/// Surfaces the kernel error if a handler cannot be installed.
pub fn initialize() -> Result<()> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = (|| {
            unsafe {
                if libc::sem_init(event_sem(), 0, 0) != 0 {
                    return Err(StubError::from(Errno::last()));
                }
                for signal in EXCEPTION_SIGNALS {
                    install_handler(signal, exception_handler)?;
                }
                install_handler(suspend_signal(), suspend_handler)?;
                install_handler(restart_signal(), restart_handler)?;
            }
            debug!("trap handlers installed");
            Ok(())
        })();
    });
    result
}

/// Registers a thread with the trap machinery so that it owns a park slot
///
/// # Errors
///
/// Fails with [`StubError::TooManyThreads`] if all slots are taken.
pub fn register_thread(tid: ThreadId) -> Result<()> {
    find_or_claim_slot(tid).ok_or(StubError::TooManyThreads)?;
    Ok(())
}

/// Raises the suspend count of a thread, parking it if it was running
///
/// Blocks until the thread is actually parked, like the corresponding
/// kernel thread suspension would.
///
/// # Errors
///
/// Fails if the thread cannot be signalled or tracked.
pub fn suspend_thread(tid: ThreadId) -> Result<()> {
    let slot = find_or_claim_slot(tid).ok_or(StubError::TooManyThreads)?;
    let previous = slot.suspend_count.fetch_add(1, Ordering::SeqCst);
    if previous == 0 && !slot.parked.load(Ordering::SeqCst) {
        if let Err(error) = sys::thread_kill(tid, suspend_signal()) {
            slot.suspend_count.fetch_sub(1, Ordering::SeqCst);
            return Err(error);
        }
        while !slot.parked.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }
    }
    Ok(())
}

/// Lowers the suspend count of a thread, waking it when the count hits zero
///
/// # Errors
///
/// Fails with [`StubError::ThreadNotStopped`] if the thread was not
/// suspended.
pub fn resume_thread(tid: ThreadId) -> Result<()> {
    let slot = slot_for(tid).ok_or(StubError::UnknownThread(tid))?;
    let mut count = slot.suspend_count.load(Ordering::SeqCst);
    loop {
        if count == 0 {
            return Err(StubError::ThreadNotStopped(tid));
        }
        match slot.suspend_count.compare_exchange(
            count,
            count - 1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => break,
            Err(current) => count = current,
        }
    }
    if count == 1 {
        sys::thread_kill(tid, restart_signal())?;
    }
    Ok(())
}

/// Current userspace suspend count of a thread
pub fn suspend_count(tid: ThreadId) -> u32 {
    slot_for(tid).map_or(0, |slot| slot.suspend_count.load(Ordering::SeqCst))
}

/// Is this thread parked with a valid register context?
pub fn is_parked(tid: ThreadId) -> bool {
    slot_for(tid).is_some_and(|slot| slot.parked.load(Ordering::SeqCst))
}

/// Runs `f` over the saved register context of a parked thread
///
/// # Errors
///
/// Fails with [`StubError::ThreadNotStopped`] unless the thread is parked;
/// the caller must keep it suspended for the duration of the access.
pub fn with_context<R>(tid: ThreadId, f: impl FnOnce(&mut RegisterContext) -> R) -> Result<R> {
    let slot = slot_for(tid).ok_or(StubError::UnknownThread(tid))?;
    if !slot.parked.load(Ordering::SeqCst) {
        warn!("register access to thread {tid} which is not stopped");
        return Err(StubError::ThreadNotStopped(tid));
    }
    let context = unsafe { (*slot.context.get()).assume_init_mut() };
    Ok(f(context))
}

/// Blocks until the next exception event arrives and returns it
///
/// Only the controller's listener thread calls this.
pub fn next_exception() -> Exception {
    // sem_wait only fails with EINTR on a valid semaphore, so retry.
    while unsafe { libc::sem_wait(event_sem()) } != 0 {}
    let exception = Exception {
        thread: EVENT.tid.load(Ordering::Acquire),
        signal: EVENT.signal.load(Ordering::Relaxed),
        code: EVENT.code.load(Ordering::Relaxed),
        fault_address: Address::from(EVENT.fault_address.load(Ordering::Relaxed)),
    };
    EVENT.claimed.store(false, Ordering::Release);
    exception
}
