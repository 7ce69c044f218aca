// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Green-thread primitives consumed by the synchronization layer.
//!
//! Green threads are futures driven by whatever executor hosts them.
//! Parking is returning `Pending` after publishing a waker, readying is
//! `Waker::wake`, and a cooperative reschedule is [`yield_now`].

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

/// How long a park may last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// No timer is armed.
    Never,
    /// Arm a timer; a zero duration is rejected as invalid.
    After(Duration),
}

impl From<Option<Duration>> for Timeout {
    fn from(d: Option<Duration>) -> Self {
        match d {
            Some(d) => Timeout::After(d),
            None => Timeout::Never,
        }
    }
}

/// Give the executor a chance to run other green threads.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker_ref;

    #[test]
    fn yield_pends_once() {
        let mut fut = yield_now();
        let mut cx = Context::from_waker(noop_waker_ref());
        assert!(Pin::new(&mut fut).poll(&mut cx).is_pending());
        assert!(Pin::new(&mut fut).poll(&mut cx).is_ready());
    }

    #[test]
    fn timeout_from_option() {
        assert_eq!(Timeout::from(None), Timeout::Never);
        let d = Duration::from_millis(3);
        assert_eq!(Timeout::from(Some(d)), Timeout::After(d));
    }
}
