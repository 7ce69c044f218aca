// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! FIFO wait queue: park green threads, wake them in order.
//!
//! A park pushes a waiter under the queue lock, first running an optional
//! admission check under that same lock so a wake landing between "check
//! the condition" and "go to sleep" is never lost. A finite timeout arms a
//! timer whose callback dequeues the waiter. A waker and an expiring timer
//! race on the timer status: the waker must win `try_stop` before it may
//! claim a timed waiter, so each waiter is delivered exactly once.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::error::WaitQueueError;
use crate::green::Timeout;
use crate::timer::{self, TimerHandle, TimerHeap};

const PENDING: u8 = 0;
const WOKEN: u8 = 1;
const TIMED_OUT: u8 = 2;

struct Waiter {
    id: u64,
    waker: Waker,
    /// Written under the queue lock before the waker fires.
    outcome: Arc<AtomicU8>,
    timer: Option<TimerHandle>,
}

impl Waiter {
    /// A timed waiter may only be claimed once its timer is cancelled.
    fn claim(&self) -> bool {
        self.timer.as_ref().map_or(true, |t| t.try_stop().is_ok())
    }
}

struct QueueInner {
    waiters: Mutex<VecDeque<Waiter>>,
    nwait: AtomicU32,
    timer_nwait: AtomicU32,
    next_id: AtomicU64,
}

impl QueueInner {
    fn take(&self, waiters: &mut VecDeque<Waiter>, id: u64) -> Option<Waiter> {
        let pos = waiters.iter().position(|w| w.id == id)?;
        let waiter = waiters.remove(pos)?;
        self.nwait.fetch_sub(1, Ordering::SeqCst);
        Some(waiter)
    }

    /// Drop the waiter's timer bookkeeping and ready it.
    fn finish(&self, waiter: Waiter) {
        let Waiter { waker, timer, .. } = waiter;
        if timer.is_some() {
            self.timer_nwait.fetch_sub(1, Ordering::AcqRel);
        }
        drop(timer);
        waker.wake();
    }
}

/// Timer callback for a timed park.
fn expire(queue: &Weak<QueueInner>, id: u64) {
    let Some(inner) = queue.upgrade() else {
        return;
    };
    let waiter = {
        let mut waiters = inner.waiters.lock();
        let Some(waiter) = inner.take(&mut waiters, id) else {
            // Woken or cancelled first.
            return;
        };
        waiter.outcome.store(TIMED_OUT, Ordering::Release);
        waiter
    };
    trace!(id, "park timed out");
    inner.finish(waiter);
}

/// FIFO queue of parked green threads.
pub struct WaitQueue {
    inner: Arc<QueueInner>,
    timers: OnceLock<Arc<TimerHeap>>,
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitQueue {
    /// Queue whose timed parks use the process-wide timer heap.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                waiters: Mutex::new(VecDeque::new()),
                nwait: AtomicU32::new(0),
                timer_nwait: AtomicU32::new(0),
                next_id: AtomicU64::new(0),
            }),
            timers: OnceLock::new(),
        }
    }

    pub fn with_timers(timers: Arc<TimerHeap>) -> Self {
        let queue = Self::new();
        let _ = queue.timers.set(timers);
        queue
    }

    fn timers(&self) -> &Arc<TimerHeap> {
        self.timers.get_or_init(timer::default_heap)
    }

    /// Park the current green thread until woken or `timeout` elapses.
    pub fn park(&self, timeout: Timeout, at_head: bool) -> Park<'_, fn() -> bool> {
        Park {
            queue: self,
            timeout,
            at_head,
            check: None,
            state: ParkState::Init,
        }
    }

    /// Park unless `check` returns true under the queue lock, in which
    /// case the park resolves to `Err(ConditionMet)` without suspending.
    pub fn park_with<F>(&self, timeout: Timeout, at_head: bool, check: F) -> Park<'_, F>
    where
        F: FnMut() -> bool,
    {
        Park {
            queue: self,
            timeout,
            at_head,
            check: Some(check),
            state: ParkState::Init,
        }
    }

    /// Wake the oldest waiter that can be claimed.
    pub fn wake_one(&self) -> Result<(), WaitQueueError> {
        self.wake_one_with(|| false)
    }

    /// Like `wake_one`, but abort with `ConditionMet` if `check` returns
    /// true under the queue lock.
    pub fn wake_one_with(&self, check: impl FnOnce() -> bool) -> Result<(), WaitQueueError> {
        let waiter = {
            let mut waiters = self.inner.waiters.lock();
            if check() {
                return Err(WaitQueueError::ConditionMet);
            }
            if self.inner.nwait.load(Ordering::SeqCst) == 0 {
                return Err(WaitQueueError::Empty);
            }
            let pos = waiters
                .iter()
                .position(Waiter::claim)
                .ok_or(WaitQueueError::Empty)?;
            let waiter = waiters.remove(pos).ok_or(WaitQueueError::Empty)?;
            self.inner.nwait.fetch_sub(1, Ordering::SeqCst);
            waiter.outcome.store(WOKEN, Ordering::Release);
            waiter
        };
        self.inner.finish(waiter);
        Ok(())
    }

    /// Wake every claimable waiter. Returns how many were woken.
    pub fn wake_all(&self) -> Result<usize, WaitQueueError> {
        self.wake_all_with(|| false)
    }

    pub fn wake_all_with(&self, check: impl FnOnce() -> bool) -> Result<usize, WaitQueueError> {
        let woken = {
            let mut waiters = self.inner.waiters.lock();
            if check() {
                return Err(WaitQueueError::ConditionMet);
            }
            if self.inner.nwait.load(Ordering::SeqCst) == 0 {
                return Err(WaitQueueError::Empty);
            }
            let mut woken = Vec::new();
            let all: Vec<Waiter> = waiters.drain(..).collect();
            for waiter in all {
                if waiter.claim() {
                    waiter.outcome.store(WOKEN, Ordering::Release);
                    woken.push(waiter);
                } else {
                    waiters.push_back(waiter);
                }
            }
            self.inner
                .nwait
                .fetch_sub(woken.len() as u32, Ordering::SeqCst);
            woken
        };
        let count = woken.len();
        for waiter in woken {
            self.inner.finish(waiter);
        }
        Ok(count)
    }

    /// Live parked waiters.
    pub fn wait_count(&self) -> u32 {
        self.inner.nwait.load(Ordering::SeqCst)
    }

    /// Parked waiters with an armed timeout.
    pub fn timed_wait_count(&self) -> u32 {
        self.inner.timer_nwait.load(Ordering::Acquire)
    }

    /// Tear the queue down. Refused while waiters remain.
    pub fn delete(self) -> Result<(), (Self, WaitQueueError)> {
        if self.wait_count() > 0 {
            return Err((self, WaitQueueError::Busy));
        }
        Ok(())
    }

    fn deliver(&self, id: u64, outcome: &AtomicU8, cx: &mut Context<'_>) -> Poll<Result<(), WaitQueueError>> {
        if let Some(result) = resolved(outcome) {
            return Poll::Ready(result);
        }
        let mut waiters = self.inner.waiters.lock();
        if let Some(result) = resolved(outcome) {
            return Poll::Ready(result);
        }
        if let Some(w) = waiters.iter_mut().find(|w| w.id == id) {
            if !w.waker.will_wake(cx.waker()) {
                w.waker = cx.waker().clone();
            }
        }
        Poll::Pending
    }
}

impl Drop for WaitQueue {
    fn drop(&mut self) {
        let n = self.wait_count();
        if n > 0 {
            warn!(waiters = n, "wait queue dropped with parked waiters");
        }
    }
}

impl std::fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitQueue")
            .field("waiters", &self.wait_count())
            .field("timed", &self.timed_wait_count())
            .finish()
    }
}

fn resolved(outcome: &AtomicU8) -> Option<Result<(), WaitQueueError>> {
    match outcome.load(Ordering::Acquire) {
        WOKEN => Some(Ok(())),
        TIMED_OUT => Some(Err(WaitQueueError::TimedOut)),
        _ => None,
    }
}

enum ParkState {
    Init,
    Parked { id: u64, outcome: Arc<AtomicU8> },
    Done,
}

/// Future returned by [`WaitQueue::park`] and [`WaitQueue::park_with`].
///
/// Dropping a parked future dequeues it; a wake it received but never
/// observed is passed on to the next waiter.
#[must_use = "futures do nothing unless polled"]
pub struct Park<'a, F> {
    queue: &'a WaitQueue,
    timeout: Timeout,
    at_head: bool,
    check: Option<F>,
    state: ParkState,
}

// Never pinned-projected.
impl<F> Unpin for Park<'_, F> {}

impl<F: FnMut() -> bool> Park<'_, F> {
    fn enqueue(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), WaitQueueError>> {
        let after = match self.timeout {
            Timeout::After(d) if d.is_zero() => return Poll::Ready(Err(WaitQueueError::InvalidDuration)),
            Timeout::After(d) => Some(d),
            Timeout::Never => None,
        };
        let queue = self.queue;
        let inner = &queue.inner;

        let mut waiters = inner.waiters.lock();
        let n = inner.nwait.load(Ordering::SeqCst);
        if n == u32::MAX {
            return Poll::Ready(Err(WaitQueueError::Capacity));
        }
        inner.nwait.store(n + 1, Ordering::SeqCst);

        if let Some(mut check) = self.check.take() {
            if check() {
                inner.nwait.fetch_sub(1, Ordering::SeqCst);
                return Poll::Ready(Err(WaitQueueError::ConditionMet));
            }
        }
        if waiters.try_reserve(1).is_err() {
            inner.nwait.fetch_sub(1, Ordering::SeqCst);
            return Poll::Ready(Err(WaitQueueError::Alloc));
        }

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let timer = match after {
            Some(d) => {
                let weak = Arc::downgrade(inner);
                match queue
                    .timers()
                    .create(d, Duration::ZERO, move || expire(&weak, id))
                {
                    Ok(timer) => {
                        inner.timer_nwait.fetch_add(1, Ordering::AcqRel);
                        Some(timer)
                    }
                    Err(e) => {
                        inner.nwait.fetch_sub(1, Ordering::SeqCst);
                        return Poll::Ready(Err(e.into()));
                    }
                }
            }
            None => None,
        };

        let outcome = Arc::new(AtomicU8::new(PENDING));
        let waiter = Waiter {
            id,
            waker: cx.waker().clone(),
            outcome: Arc::clone(&outcome),
            timer,
        };
        if self.at_head {
            waiters.push_front(waiter);
        } else {
            waiters.push_back(waiter);
        }
        self.state = ParkState::Parked { id, outcome };
        Poll::Pending
    }
}

impl<F: FnMut() -> bool> Future for Park<'_, F> {
    type Output = Result<(), WaitQueueError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let result = match &this.state {
            ParkState::Init => this.enqueue(cx),
            ParkState::Parked { id, outcome } => this.queue.deliver(*id, outcome, cx),
            ParkState::Done => return Poll::Ready(Ok(())),
        };
        if result.is_ready() {
            this.state = ParkState::Done;
        }
        result
    }
}

impl<F> Drop for Park<'_, F> {
    fn drop(&mut self) {
        let ParkState::Parked { id, outcome } = &self.state else {
            return;
        };
        let inner = &self.queue.inner;
        let cancelled = {
            let mut waiters = inner.waiters.lock();
            inner.take(&mut waiters, *id)
        };
        match cancelled {
            Some(waiter) => {
                if let Some(timer) = &waiter.timer {
                    let _ = timer.try_stop();
                    inner.timer_nwait.fetch_sub(1, Ordering::AcqRel);
                }
            }
            None if outcome.load(Ordering::Acquire) == WOKEN => {
                // Pass the unobserved wake on.
                let _ = self.queue.wake_one();
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker_ref;
    use std::sync::atomic::AtomicBool;

    fn poll<F: Future + Unpin>(fut: &mut F) -> Poll<F::Output> {
        let mut cx = Context::from_waker(noop_waker_ref());
        Pin::new(fut).poll(&mut cx)
    }

    #[test]
    fn wakes_in_park_order() {
        let q = WaitQueue::new();
        let mut parks: Vec<_> = (0..5).map(|_| q.park(Timeout::Never, false)).collect();
        for p in parks.iter_mut() {
            assert!(poll(p).is_pending());
        }
        assert_eq!(q.wait_count(), 5);

        for i in 0..5 {
            q.wake_one().unwrap();
            for (j, p) in parks.iter_mut().enumerate().skip(i) {
                if j == i {
                    assert!(matches!(poll(p), Poll::Ready(Ok(()))));
                } else {
                    assert!(poll(p).is_pending());
                }
            }
        }
        assert_eq!(q.wait_count(), 0);
        assert_eq!(q.wake_one(), Err(WaitQueueError::Empty));
    }

    #[test]
    fn head_park_jumps_the_line() {
        let q = WaitQueue::new();
        let mut tail = q.park(Timeout::Never, false);
        let mut head = q.park(Timeout::Never, true);
        assert!(poll(&mut tail).is_pending());
        assert!(poll(&mut head).is_pending());
        q.wake_one().unwrap();
        assert!(poll(&mut head).is_ready());
        assert!(poll(&mut tail).is_pending());
    }

    #[test]
    fn admission_check_aborts_park() {
        let q = WaitQueue::new();
        let mut p = q.park_with(Timeout::Never, false, || true);
        assert!(matches!(poll(&mut p), Poll::Ready(Err(WaitQueueError::ConditionMet))));
        assert_eq!(q.wait_count(), 0);
    }

    #[test]
    fn admission_check_runs_once() {
        let q = WaitQueue::new();
        let calls = AtomicU32::new(0);
        let mut p = q.park_with(Timeout::Never, false, || {
            calls.fetch_add(1, Ordering::SeqCst);
            false
        });
        assert!(poll(&mut p).is_pending());
        assert!(poll(&mut p).is_pending());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        q.wake_one().unwrap();
        assert!(poll(&mut p).is_ready());
    }

    #[test]
    fn zero_timeout_is_invalid() {
        let q = WaitQueue::new();
        let mut p = q.park(Timeout::After(Duration::ZERO), false);
        assert!(matches!(poll(&mut p), Poll::Ready(Err(WaitQueueError::InvalidDuration))));
    }

    #[test]
    fn capacity_is_bounded() {
        let q = WaitQueue::new();
        q.inner.nwait.store(u32::MAX, Ordering::SeqCst);
        let mut p = q.park(Timeout::Never, false);
        assert!(matches!(poll(&mut p), Poll::Ready(Err(WaitQueueError::Capacity))));
        q.inner.nwait.store(0, Ordering::SeqCst);
    }

    #[test]
    fn wake_check_aborts() {
        let q = WaitQueue::new();
        assert_eq!(q.wake_one_with(|| true), Err(WaitQueueError::ConditionMet));
        assert_eq!(q.wake_all_with(|| true), Err(WaitQueueError::ConditionMet));
        assert_eq!(q.wake_all(), Err(WaitQueueError::Empty));
    }

    #[test]
    fn timeout_dequeues_waiter() {
        let heap = Arc::new(TimerHeap::new());
        let q = WaitQueue::with_timers(heap.clone());
        let mut p = q.park(Timeout::After(Duration::from_millis(1)), false);
        assert!(poll(&mut p).is_pending());
        assert_eq!(q.timed_wait_count(), 1);

        assert_eq!(heap.trigger(u64::MAX), 1);
        assert_eq!(q.wait_count(), 0);
        assert_eq!(q.timed_wait_count(), 0);
        assert!(matches!(poll(&mut p), Poll::Ready(Err(WaitQueueError::TimedOut))));
        assert_eq!(heap.live_timers(), 0);
    }

    #[test]
    fn wake_beats_timer() {
        let heap = Arc::new(TimerHeap::new());
        let q = WaitQueue::with_timers(heap.clone());
        let mut p = q.park(Timeout::After(Duration::from_secs(60)), false);
        assert!(poll(&mut p).is_pending());
        q.wake_one().unwrap();
        assert_eq!(heap.trigger(u64::MAX), 0);
        assert!(matches!(poll(&mut p), Poll::Ready(Ok(()))));
        assert_eq!(q.timed_wait_count(), 0);
        assert_eq!(heap.live_timers(), 0);
    }

    #[test]
    fn wake_all_counts() {
        let q = WaitQueue::new();
        let mut parks: Vec<_> = (0..3).map(|_| q.park(Timeout::Never, false)).collect();
        for p in parks.iter_mut() {
            assert!(poll(p).is_pending());
        }
        assert_eq!(q.wake_all(), Ok(3));
        for p in parks.iter_mut() {
            assert!(matches!(poll(p), Poll::Ready(Ok(()))));
        }
    }

    #[test]
    fn dropped_park_leaves_queue() {
        let heap = Arc::new(TimerHeap::new());
        let q = WaitQueue::with_timers(heap.clone());
        let mut p = q.park(Timeout::After(Duration::from_secs(60)), false);
        assert!(poll(&mut p).is_pending());
        drop(p);
        assert_eq!(q.wait_count(), 0);
        assert_eq!(q.timed_wait_count(), 0);
        heap.trigger(u64::MAX);
        assert_eq!(heap.live_timers(), 0);
    }

    #[test]
    fn unobserved_wake_is_forwarded() {
        let q = WaitQueue::new();
        let mut first = q.park(Timeout::Never, false);
        let mut second = q.park(Timeout::Never, false);
        assert!(poll(&mut first).is_pending());
        assert!(poll(&mut second).is_pending());
        q.wake_one().unwrap();
        drop(first);
        assert!(matches!(poll(&mut second), Poll::Ready(Ok(()))));
    }

    #[test]
    fn waker_is_refreshed_on_repoll() {
        struct Flag(AtomicBool);
        impl std::task::Wake for Flag {
            fn wake(self: Arc<Self>) {
                self.0.store(true, Ordering::SeqCst);
            }
        }
        let q = WaitQueue::new();
        let mut p = q.park(Timeout::Never, false);
        assert!(poll(&mut p).is_pending());
        let flag = Arc::new(Flag(AtomicBool::new(false)));
        let waker = Waker::from(flag.clone());
        let mut cx = Context::from_waker(&waker);
        assert!(Pin::new(&mut p).poll(&mut cx).is_pending());
        q.wake_one().unwrap();
        assert!(flag.0.load(Ordering::SeqCst));
    }

    #[test]
    fn delete_refuses_with_waiters() {
        let q = WaitQueue::new();
        let mut p = q.park(Timeout::Never, false);
        assert!(poll(&mut p).is_pending());
        std::mem::forget(p);
        let (q, err) = q.delete().unwrap_err();
        assert_eq!(err, WaitQueueError::Busy);
        q.wake_one().unwrap();
        q.delete().unwrap();
    }
}
