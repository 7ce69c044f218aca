// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-direction ordering gates.
//!
//! At most one green thread may wait on a given direction of a
//! descriptor at a time. `FdLock` holds that direction's gate and a
//! descriptor reference, so the in-lock waits skip the usual checks.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, trace};

use super::slot::FdRef;
use super::state::DescriptorState;
use super::FdRegistry;
use crate::error::FdError;
use crate::poll::Direction;

/// Held ordering gate on one direction of a descriptor. Dropping it
/// unlocks.
pub struct FdLock<'a> {
    registry: &'a FdRegistry,
    dir: Direction,
    held: bool,
    fd_ref: FdRef<'a>,
}

/// A lock given up by [`FdLock::into_raw`], to be handed back to
/// [`FdRegistry::unlock`].
#[derive(Debug)]
pub struct RawLock {
    pub(crate) registry: u64,
    pub(crate) fd: i32,
    pub(crate) dir: Direction,
}

impl<'a> FdLock<'a> {
    pub(crate) fn new(registry: &'a FdRegistry, dir: Direction, fd_ref: FdRef<'a>) -> Self {
        Self {
            registry,
            dir,
            held: true,
            fd_ref,
        }
    }

    pub fn fd(&self) -> i32 {
        self.fd_ref.fd()
    }

    pub fn direction(&self) -> Direction {
        self.dir
    }

    /// Park until the locked direction is ready.
    pub async fn wait(&self) -> Result<(), FdError> {
        self.fd_ref.state().wait_ready(self.dir).await
    }

    /// Park until ready or `timeout` elapses. Dropping the future cancels
    /// its timer.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<(), FdError> {
        if timeout.is_zero() {
            return Err(FdError::TimedOut);
        }
        let state = self.fd_ref.state();
        state.check_added()?;

        let dir = self.dir;
        let weak = Arc::downgrade(&self.fd_ref.arc());
        let timers = self.registry.timers();
        let seq = state
            .arm_timer(dir, |seq| {
                timers.create(timeout, Duration::ZERO, move || {
                    let Some(state) = weak.upgrade() else {
                        return;
                    };
                    // Only the timer still in the slot may report a timeout.
                    if let Some(timer) = state.take_timer(dir, seq) {
                        drop(timer);
                        state.desc.ready(dir);
                    }
                })
            })
            .map_err(|e| {
                error!(fd = self.fd(), error = %e, "failed to arm descriptor timer");
                FdError::InitResource
            })?;
        let armed = SlotTimer { state, dir, seq };

        let ready = state.desc.wait(dir).await;
        let won = armed.claim();
        if !ready {
            return Err(FdError::Closing(self.fd()));
        }
        if won {
            Ok(())
        } else {
            Err(FdError::TimedOut)
        }
    }

    /// Release the gate and the descriptor reference.
    pub fn unlock(mut self) -> Result<(), FdError> {
        self.release()
    }

    /// Keep the gate and the reference held past this guard. The lock
    /// must later be passed to [`FdRegistry::unlock`].
    pub fn into_raw(self) -> RawLock {
        let raw = RawLock {
            registry: self.registry.id(),
            fd: self.fd(),
            dir: self.dir,
        };
        std::mem::forget(self);
        raw
    }

    fn release(&mut self) -> Result<(), FdError> {
        if !self.held {
            return Ok(());
        }
        self.held = false;
        trace!(fd = self.fd(), dir = ?self.dir, "descriptor unlocked");
        self.fd_ref
            .state()
            .gate(self.dir)
            .release()
            .map_err(|e| {
                error!(fd = self.fd(), error = %e, "failed to release descriptor gate");
                FdError::Misused(self.fd())
            })
    }
}

/// In-lock timer armed by one `wait_timeout` call. Claims (and cancels)
/// its own slot entry when the wait finishes or is dropped.
struct SlotTimer<'a> {
    state: &'a DescriptorState,
    dir: Direction,
    seq: u64,
}

impl SlotTimer<'_> {
    /// True if the waiter took the timer before it fired.
    fn claim(&self) -> bool {
        match self.state.take_timer(self.dir, self.seq) {
            Some(timer) => {
                let _ = timer.try_stop();
                true
            }
            None => false,
        }
    }
}

impl Drop for SlotTimer<'_> {
    fn drop(&mut self) {
        self.claim();
    }
}

impl Drop for FdLock<'_> {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

impl std::fmt::Debug for FdLock<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdLock")
            .field("fd", &self.fd())
            .field("dir", &self.dir)
            .finish()
    }
}
