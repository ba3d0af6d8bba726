//! # Errors of this crate
//!
//! One error enum for everything that can go wrong while controlling the
//! own process. Kernel failures keep the errno value and the message the OS
//! provides for it, so that they can be reported over the wire and in logs
//! without losing the original cause.

use thiserror::Error;

use crate::ThreadId;

/// Shorthand for results produced by this crate
pub type Result<T> = std::result::Result<T, StubError>;

#[derive(Error, Debug)]
pub enum StubError {
    // ------------------------- OS level failures -----------------------------
    #[error("kernel error {code}: {message}")]
    Kernel { code: i32, message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("could not launch thread: {0}")]
    ThreadLaunchFailure(i32),

    // ------------------------- execution control -----------------------------
    #[error("no breakpoint exists at this address")]
    InvalidBreakpoint,
    #[error("no allocation exists at this address")]
    InvalidAllocation,
    #[error("unknown thread {0}")]
    UnknownThread(ThreadId),
    #[error("thread {0} is not stopped")]
    ThreadNotStopped(ThreadId),
    #[error("the kernel reported a run state this crate does not know")]
    InvalidRunState,
    #[error("cannot track more threads, all park slots are taken")]
    TooManyThreads,
    #[error("a process with pid {0} cannot be debugged by this stub")]
    NotOwnProcess(u32),

    // ------------------------- register access -------------------------------
    #[error("unknown register id for this register set")]
    InvalidRegisterId,
    #[error("unknown register set id")]
    InvalidRegisterSetId,
    #[error("this register set cannot be written back")]
    RegisterSetReadOnly,

    // ------------------------- memory access ---------------------------------
    #[error("address is not mapped or not accessible")]
    InvalidAddress,
}

impl From<nix::Error> for StubError {
    fn from(value: nix::Error) -> Self {
        StubError::Kernel {
            code: value as i32,
            message: value.desc().to_string(),
        }
    }
}
