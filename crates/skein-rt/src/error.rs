// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Status codes for every public operation.
//!
//! Each module owns a `thiserror` enum. `StatusCode::code` maps a variant to
//! the signed integer status callers branch on: the module id lives in the
//! high bits, the local code in the low bits, and zero is never an error.

use thiserror::Error;

pub const MODULE_TIMER: i32 = 0x100B_0000;
pub const MODULE_WAITQUEUE: i32 = 0x100D_0000;
pub const MODULE_SEMAPHORE: i32 = 0x100E_0000;
pub const MODULE_FD: i32 = 0x1010_0000;

/// Integer status for an error value.
pub trait StatusCode {
    fn code(&self) -> i32;
}

/// Collapse a `Result` into the integer status convention (0 = success).
pub fn status<T, E: StatusCode>(result: &Result<T, E>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.code(),
    }
}

/// Timer service errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TimerError {
    #[error("timer heap allocation failed")]
    Alloc,
    #[error("timer node in unexpected state {0}")]
    State(u8),
    /// Already fired, running, or stopped.
    #[error("timer already fired or stopped")]
    StopFailed,
    #[error("timer heap has been shut down")]
    HeapClosed,
    #[error("timer is not waiting")]
    NotWaiting,
    /// Reset from inside the timer's own one-shot callback.
    #[error("timer is running its callback")]
    Busy,
}

impl StatusCode for TimerError {
    fn code(&self) -> i32 {
        MODULE_TIMER
            | match self {
                TimerError::Alloc => 0x1,
                TimerError::State(_) => 0x2,
                TimerError::StopFailed => 0x4,
                TimerError::HeapClosed => 0x9,
                TimerError::NotWaiting => 0xA,
                TimerError::Busy => 0xD,
            }
    }
}

/// Wait queue errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitQueueError {
    #[error("no waiter could be woken")]
    Empty,
    /// The admission check reported the condition already holds.
    #[error("condition already satisfied")]
    ConditionMet,
    #[error("wait queue allocation failed")]
    Alloc,
    #[error("wait timer failed: {0}")]
    Timer(#[from] TimerError),
    #[error("wait duration must be positive")]
    InvalidDuration,
    #[error("too many waiters")]
    Capacity,
    #[error("wait queue still has waiters")]
    Busy,
    #[error("wait timed out")]
    TimedOut,
}

impl StatusCode for WaitQueueError {
    fn code(&self) -> i32 {
        MODULE_WAITQUEUE
            | match self {
                WaitQueueError::Empty => 0x3,
                WaitQueueError::ConditionMet => 0x4,
                WaitQueueError::Alloc => 0x5,
                WaitQueueError::Timer(_) => 0x6,
                WaitQueueError::InvalidDuration => 0x7,
                WaitQueueError::Capacity => 0x8,
                WaitQueueError::Busy => 0x9,
                WaitQueueError::TimedOut => 0x1000,
            }
    }
}

/// Semaphore errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SemaError {
    #[error("semaphore permit count overflow")]
    Overflow,
    #[error("semaphore still has waiters")]
    Busy,
    #[error(transparent)]
    Queue(#[from] WaitQueueError),
}

impl StatusCode for SemaError {
    fn code(&self) -> i32 {
        match self {
            SemaError::Overflow => MODULE_SEMAPHORE | 0x3,
            SemaError::Busy => MODULE_SEMAPHORE | 0x4,
            SemaError::Queue(e) => e.code(),
        }
    }
}

/// Descriptor registry errors.
#[derive(Debug, Error)]
pub enum FdError {
    #[error("failed to allocate descriptor resources")]
    InitResource,
    #[error("descriptor {0} out of range")]
    OverLimit(i32),
    #[error("descriptor {0} already registered")]
    Registered(i32),
    #[error("failed to add descriptor {fd} to the poller: {source}")]
    AddFailed {
        fd: i32,
        #[source]
        source: std::io::Error,
    },
    #[error("descriptor {0} is closing or not registered")]
    Closing(i32),
    #[error("descriptor {0} misused")]
    Misused(i32),
    #[error("descriptor wait timed out")]
    TimedOut,
    #[error("descriptor {0} not added to the poller")]
    NotAdded(i32),
}

impl StatusCode for FdError {
    fn code(&self) -> i32 {
        MODULE_FD
            | match self {
                FdError::InitResource => 0x0,
                FdError::OverLimit(_) => 0x1,
                FdError::Registered(_) => 0x2,
                FdError::AddFailed { .. } => 0x3,
                FdError::Closing(_) => 0x4,
                FdError::Misused(_) => 0x5,
                FdError::TimedOut => 0x6,
                FdError::NotAdded(_) => 0x7,
            }
    }
}
