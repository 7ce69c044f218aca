// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Sleep: park the current green thread until a one-shot timer fires.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::task::AtomicWaker;

use super::{default_heap, TimerHandle, TimerHeap};
use crate::error::TimerError;

/// Sleep on the process-wide timer heap. A zero duration yields once.
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        heap: None,
        duration,
        state: SleepState::Init,
    }
}

/// Sleep on an explicit heap.
pub fn sleep_on(heap: Arc<TimerHeap>, duration: Duration) -> Sleep {
    Sleep {
        heap: Some(heap),
        duration,
        state: SleepState::Init,
    }
}

struct Wakeup {
    fired: AtomicBool,
    waker: AtomicWaker,
}

enum SleepState {
    Init,
    Armed {
        wakeup: Arc<Wakeup>,
        timer: TimerHandle,
    },
    Done,
}

/// Future returned by [`sleep`] and [`sleep_on`].
#[must_use = "futures do nothing unless polled"]
pub struct Sleep {
    heap: Option<Arc<TimerHeap>>,
    duration: Duration,
    state: SleepState,
}

impl Future for Sleep {
    type Output = Result<(), TimerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match &this.state {
            SleepState::Init => {
                if this.duration.is_zero() {
                    this.state = SleepState::Done;
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }
                let wakeup = Arc::new(Wakeup {
                    fired: AtomicBool::new(false),
                    waker: AtomicWaker::new(),
                });
                wakeup.waker.register(cx.waker());
                let heap = this.heap.get_or_insert_with(default_heap);
                let w = Arc::clone(&wakeup);
                let timer = heap.create(this.duration, Duration::ZERO, move || {
                    w.fired.store(true, Ordering::Release);
                    w.waker.wake();
                })?;
                this.state = SleepState::Armed {
                    wakeup,
                    timer,
                };
                Poll::Pending
            }
            SleepState::Armed { wakeup, .. } => {
                wakeup.waker.register(cx.waker());
                if wakeup.fired.load(Ordering::Acquire) {
                    this.state = SleepState::Done;
                    Poll::Ready(Ok(()))
                } else {
                    Poll::Pending
                }
            }
            SleepState::Done => Poll::Ready(Ok(())),
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let SleepState::Armed { timer, .. } = &self.state {
            // Cancelled sleep: free the heap slot early.
            let _ = timer.try_stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use futures::task::noop_waker_ref;
    use std::time::Instant;

    #[test]
    fn sleep_waits_at_least_duration() {
        let start = Instant::now();
        block_on(sleep(Duration::from_millis(15))).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn zero_sleep_yields_once() {
        let mut fut = sleep_on(Arc::new(TimerHeap::new()), Duration::ZERO);
        let mut cx = Context::from_waker(noop_waker_ref());
        assert!(Pin::new(&mut fut).poll(&mut cx).is_pending());
        assert!(matches!(Pin::new(&mut fut).poll(&mut cx), Poll::Ready(Ok(()))));
    }

    #[test]
    fn dropped_sleep_cancels_timer() {
        let heap = Arc::new(TimerHeap::new());
        let mut fut = sleep_on(heap.clone(), Duration::from_secs(60));
        let mut cx = Context::from_waker(noop_waker_ref());
        assert!(Pin::new(&mut fut).poll(&mut cx).is_pending());
        assert_eq!(heap.live_timers(), 1);
        drop(fut);
        assert_eq!(heap.trigger(u64::MAX), 0);
        assert_eq!(heap.live_timers(), 0);
    }

    #[test]
    fn closed_heap_reports_error() {
        let heap = Arc::new(TimerHeap::new());
        heap.shutdown();
        let err = block_on(sleep_on(heap, Duration::from_millis(1))).unwrap_err();
        assert_eq!(err, TimerError::HeapClosed);
    }
}
