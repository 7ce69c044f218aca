// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Counting semaphore: an atomic permit counter plus a wait queue.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{SemaError, WaitQueueError};
use crate::green::Timeout;
use crate::timer::TimerHeap;
use crate::waitqueue::WaitQueue;

pub struct Semaphore {
    permits: AtomicU32,
    queue: WaitQueue,
}

impl Semaphore {
    pub fn new(permits: u32) -> Self {
        Self {
            permits: AtomicU32::new(permits),
            queue: WaitQueue::new(),
        }
    }

    pub fn with_timers(permits: u32, timers: Arc<TimerHeap>) -> Self {
        Self {
            permits: AtomicU32::new(permits),
            queue: WaitQueue::with_timers(timers),
        }
    }

    /// Take a permit if one is free. Never parks.
    pub fn try_acquire(&self) -> bool {
        let mut cur = self.permits.load(Ordering::SeqCst);
        loop {
            if cur == 0 {
                return false;
            }
            match self.permits.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Take a permit, parking at the tail of the queue until one is free.
    pub async fn acquire(&self) -> Result<(), SemaError> {
        self.acquire_inner(false).await
    }

    /// Take a permit, parking ahead of earlier waiters.
    pub async fn acquire_at_head(&self) -> Result<(), SemaError> {
        self.acquire_inner(true).await
    }

    async fn acquire_inner(&self, at_head: bool) -> Result<(), SemaError> {
        if self.try_acquire() {
            return Ok(());
        }
        loop {
            // The admission check re-tries under the queue lock, so a
            // release between the fast path and the park is not lost.
            match self
                .queue
                .park_with(Timeout::Never, at_head, || self.try_acquire())
                .await
            {
                Err(WaitQueueError::ConditionMet) => return Ok(()),
                Err(e) => return Err(e.into()),
                Ok(()) => {
                    if self.try_acquire() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Return a permit and wake one waiter, if any.
    pub fn release(&self) -> Result<(), SemaError> {
        let mut cur = self.permits.load(Ordering::SeqCst);
        loop {
            if cur == u32::MAX {
                return Err(SemaError::Overflow);
            }
            match self.permits.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
        if self.queue.wait_count() == 0 {
            return Ok(());
        }
        match self.queue.wake_one() {
            Ok(()) | Err(WaitQueueError::Empty) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Free permits minus parked waiters. Advisory only: stale as soon
    /// as it is read.
    pub fn value(&self) -> i64 {
        i64::from(self.permits.load(Ordering::SeqCst)) - i64::from(self.queue.wait_count())
    }

    pub(crate) fn permits(&self) -> u32 {
        self.permits.load(Ordering::SeqCst)
    }

    pub fn wait_count(&self) -> u32 {
        self.queue.wait_count()
    }

    /// Tear down. Refused while waiters remain.
    pub fn delete(self) -> Result<(), (Self, SemaError)> {
        if self.queue.wait_count() > 0 {
            return Err((self, SemaError::Busy));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("permits", &self.permits())
            .field("waiters", &self.wait_count())
            .finish()
    }
}
