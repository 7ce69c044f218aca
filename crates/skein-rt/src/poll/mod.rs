// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Readiness glue between descriptors and the OS poller.
//!
//! Each registered descriptor owns a `PollDesc` with one readiness cell
//! per direction. The backend marks a cell ready; a parked waiter consumes
//! the readiness or learns the descriptor is closing.

#[cfg(target_os = "linux")]
mod epoll;

#[cfg(target_os = "linux")]
pub use epoll::EpollBackend;

use std::future::Future;
use std::io;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::task::AtomicWaker;

/// I/O direction of a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

const NOWAIT: u8 = 0;
const READY: u8 = 1;
const CLOSING: u8 = 2;

/// One direction's readiness slot.
struct ReadinessCell {
    state: AtomicU8,
    waker: AtomicWaker,
}

impl ReadinessCell {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(NOWAIT),
            waker: AtomicWaker::new(),
        }
    }

    /// Publish `to` unless closing or already there. Wakes the waiter on change.
    fn publish(&self, to: u8) -> bool {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            if cur == CLOSING || cur == to {
                return false;
            }
            match self
                .state
                .compare_exchange_weak(cur, to, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
        self.waker.wake();
        true
    }

    /// `Some(true)` consumed readiness, `Some(false)` closing.
    fn take(&self) -> Option<bool> {
        match self.state.load(Ordering::Acquire) {
            CLOSING => Some(false),
            READY => match self.state.compare_exchange(
                READY,
                NOWAIT,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => Some(true),
                Err(CLOSING) => Some(false),
                Err(_) => None,
            },
            _ => None,
        }
    }
}

/// Per-descriptor readiness record handed to the backend.
pub struct PollDesc {
    fd: RawFd,
    read: ReadinessCell,
    write: ReadinessCell,
}

impl PollDesc {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            read: ReadinessCell::new(),
            write: ReadinessCell::new(),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    fn cell(&self, dir: Direction) -> &ReadinessCell {
        match dir {
            Direction::Read => &self.read,
            Direction::Write => &self.write,
        }
    }

    /// Mark `dir` ready and wake its waiter. Returns true if the state
    /// changed.
    pub fn ready(&self, dir: Direction) -> bool {
        self.cell(dir).publish(READY)
    }

    /// Move both directions to closing, waking both waiters.
    pub fn close(&self) {
        self.read.publish(CLOSING);
        self.write.publish(CLOSING);
    }

    pub fn is_closing(&self) -> bool {
        self.read.state.load(Ordering::Acquire) == CLOSING
    }

    /// Park until `dir` is ready (`true`) or the descriptor closes (`false`).
    pub fn wait(&self, dir: Direction) -> Readiness<'_> {
        Readiness { desc: self, dir }
    }
}

impl std::fmt::Debug for PollDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollDesc")
            .field("fd", &self.fd)
            .field("read", &self.read.state.load(Ordering::Relaxed))
            .field("write", &self.write.state.load(Ordering::Relaxed))
            .finish()
    }
}

/// Future returned by [`PollDesc::wait`].
#[must_use = "futures do nothing unless polled"]
pub struct Readiness<'a> {
    desc: &'a PollDesc,
    dir: Direction,
}

impl Future for Readiness<'_> {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        let cell = self.desc.cell(self.dir);
        if let Some(ready) = cell.take() {
            return Poll::Ready(ready);
        }
        cell.waker.register(cx.waker());
        match cell.take() {
            Some(ready) => Poll::Ready(ready),
            None => Poll::Pending,
        }
    }
}

/// OS readiness notification source.
pub trait ReadinessBackend: Send + Sync {
    /// Start delivering readiness for `desc.fd()` into `desc`.
    fn add(&self, desc: &Arc<PollDesc>) -> io::Result<()>;

    /// Stop delivering readiness for `desc.fd()`.
    fn delete(&self, desc: &PollDesc) -> io::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use futures::task::noop_waker_ref;

    #[test]
    fn ready_before_wait_is_consumed() {
        let pd = PollDesc::new(3);
        assert!(pd.ready(Direction::Read));
        assert!(!pd.ready(Direction::Read));
        assert!(block_on(pd.wait(Direction::Read)));

        let mut cx = Context::from_waker(noop_waker_ref());
        let mut again = pd.wait(Direction::Read);
        assert!(Pin::new(&mut again).poll(&mut cx).is_pending());
    }

    #[test]
    fn directions_are_independent() {
        let pd = PollDesc::new(3);
        pd.ready(Direction::Write);
        let mut cx = Context::from_waker(noop_waker_ref());
        let mut read = pd.wait(Direction::Read);
        assert!(Pin::new(&mut read).poll(&mut cx).is_pending());
        assert!(block_on(pd.wait(Direction::Write)));
    }

    #[test]
    fn close_wakes_both_with_false() {
        let pd = Arc::new(PollDesc::new(3));
        let waiter = {
            let pd = pd.clone();
            std::thread::spawn(move || block_on(pd.wait(Direction::Write)))
        };
        std::thread::sleep(std::time::Duration::from_millis(10));
        pd.close();
        assert!(!waiter.join().unwrap());
        assert!(!block_on(pd.wait(Direction::Read)));
        assert!(pd.is_closing());
    }

    #[test]
    fn ready_after_close_is_ignored() {
        let pd = PollDesc::new(3);
        pd.close();
        assert!(!pd.ready(Direction::Read));
        assert!(!block_on(pd.wait(Direction::Read)));
    }
}
