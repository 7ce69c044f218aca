// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Skein runtime core: descriptor readiness for M:N green threads.
//!
//! Green threads are futures; any executor can host them. This crate
//! supplies the blocking primitives they park on and the registry that
//! turns OS readiness into wakeups.
//!
//! Components:
//! - timer: 4-ary deadline heap with lock-free stop/reset, driver thread
//! - waitqueue: FIFO park/wake with optional per-waiter timeouts
//! - sema: counting semaphore over a wait queue
//! - fd: descriptor registry, lifecycle state machine, ordering gates
//! - poll: readiness cells and the backend trait (epoll on Linux)
//! - config: TOML + environment settings

pub mod clock;
pub mod config;
pub mod error;
pub mod fd;
pub mod green;
pub mod poll;
pub mod sema;
pub mod timer;
pub mod waitqueue;

pub use config::RuntimeConfig;
pub use error::{FdError, SemaError, StatusCode, TimerError, WaitQueueError};
pub use fd::{FdLock, FdRef, FdRegistry, PollState, RawLock};
pub use green::Timeout;
pub use poll::{Direction, PollDesc, ReadinessBackend};
pub use sema::Semaphore;
pub use timer::{sleep, TimerHandle, TimerHeap};
pub use waitqueue::WaitQueue;
