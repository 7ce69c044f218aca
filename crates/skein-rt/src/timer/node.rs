// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Timer node and its status machine.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Timer node status.
///
/// Stop and reset race the firing path through compare-and-swap on this
/// field. Structural heap edits happen under the heap lock; the transient
/// states (`Running`, `Modifying`, `Moving`, `Removing`) tell other
/// threads to back off and retry.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerStatus {
    /// Not in any heap: fired one-shot or never armed.
    Idle = 0,
    /// In the heap, waiting for its deadline.
    Waiting = 1,
    /// Callback is being run by the firing path.
    Running = 2,
    /// Cancelled; evicted on the next maintenance pass.
    Stopped = 3,
    /// A stop or reset holds the node exclusively.
    Modifying = 4,
    /// Reset to an earlier deadline; heap position not yet fixed.
    ModifiedAhead = 5,
    /// Reset to a later deadline; heap position not yet fixed.
    ModifiedDelayed = 6,
    /// Being evicted under the heap lock.
    Removing = 7,
    /// Evicted after a stop.
    Removed = 8,
    /// Being repositioned under the heap lock.
    Moving = 9,
}

impl TimerStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Waiting,
            2 => Self::Running,
            3 => Self::Stopped,
            4 => Self::Modifying,
            5 => Self::ModifiedAhead,
            6 => Self::ModifiedDelayed,
            7 => Self::Removing,
            8 => Self::Removed,
            _ => Self::Moving,
        }
    }
}

pub(crate) type Callback = Arc<dyn Fn() + Send + Sync>;

pub(crate) struct TimerNode {
    status: AtomicU8,
    /// Absolute deadline in clock nanoseconds. Written under the heap lock
    /// or while the node is out of the heap.
    pub(crate) deadline: AtomicU64,
    /// Deadline requested by the last reset.
    pub(crate) new_deadline: AtomicU64,
    /// Zero for one-shot timers.
    pub(crate) period: AtomicU64,
    pub(crate) callback: Mutex<Callback>,
    /// The handle is gone; whoever finishes with the node frees it.
    /// Only touched under the heap lock.
    pub(crate) auto_release: AtomicBool,
}

impl TimerNode {
    pub(crate) fn new(deadline: u64, period: u64, callback: Callback) -> Self {
        Self {
            status: AtomicU8::new(TimerStatus::Waiting as u8),
            deadline: AtomicU64::new(deadline),
            new_deadline: AtomicU64::new(deadline),
            period: AtomicU64::new(period),
            callback: Mutex::new(callback),
            auto_release: AtomicBool::new(false),
        }
    }

    pub(crate) fn status(&self) -> TimerStatus {
        TimerStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: TimerStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Single compare-and-swap from `from` to `to`.
    pub(crate) fn transition(&self, from: TimerStatus, to: TimerStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn deadline(&self) -> u64 {
        self.deadline.load(Ordering::Acquire)
    }
}

thread_local! {
    /// Node whose callback this thread is running.
    static FIRING: Cell<*const TimerNode> = const { Cell::new(std::ptr::null()) };
}

struct FiringGuard(*const TimerNode);

impl Drop for FiringGuard {
    fn drop(&mut self) {
        FIRING.with(|f| f.set(self.0));
    }
}

/// Run `callback` with `node` marked as firing on this thread.
pub(crate) fn invoke(node: &Arc<TimerNode>, callback: &Callback) {
    let prev = FIRING.with(|f| f.replace(Arc::as_ptr(node)));
    let _restore = FiringGuard(prev);
    callback();
}

/// True while the current thread is inside `node`'s callback.
pub(crate) fn is_firing(node: &Arc<TimerNode>) -> bool {
    FIRING.with(|f| f.get() == Arc::as_ptr(node))
}
