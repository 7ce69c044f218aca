// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Timer service: a 4-ary min-heap of deadlines with per-node atomic status.
//!
//! The firing path (`TimerHeap::trigger`) pops every due node, runs
//! callbacks with the heap lock released, and reinserts periodic timers.
//! Stop and reset never take the heap lock: they flip the node status and
//! leave heap eviction or repositioning to the next maintenance pass.
//!
//! Every `create` is matched by exactly one release, enforced by
//! `TimerHandle` ownership (drop releases).

mod driver;
mod heap;
mod node;
mod sleep;

pub use driver::TimerDriver;
pub use node::TimerStatus;
pub use sleep::{sleep, sleep_on, Sleep};

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, trace, warn};

use crate::clock;
use crate::config::{RuntimeConfig, TimerConfig};
use crate::error::TimerError;
use heap::NodeHeap;
use node::{Callback, TimerNode};

/// Wakes the driver thread when the earliest deadline moves forward.
struct Signal {
    pending: Mutex<bool>,
    cv: Condvar,
}

impl Signal {
    fn notify(&self) {
        *self.pending.lock() = true;
        self.cv.notify_one();
    }

    fn wait(&self, timeout: Duration) {
        let mut pending = self.pending.lock();
        if !*pending {
            self.cv.wait_for(&mut pending, timeout);
        }
        *pending = false;
    }
}

/// A heap of timers served by one firing path.
pub struct TimerHeap {
    nodes: Mutex<NodeHeap>,
    /// Nodes in `ModifiedAhead` awaiting repositioning.
    adjust_timers: AtomicU32,
    /// Nodes in `Stopped` awaiting eviction.
    stopped_timers: AtomicU32,
    /// Cached deadline of the heap top, 0 when empty.
    timer0_deadline: AtomicU64,
    /// Created and not yet freed.
    live: AtomicUsize,
    closed: AtomicBool,
    signal: Signal,
}

impl Default for TimerHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerHeap {
    pub fn new() -> Self {
        Self::with_config(&TimerConfig::default())
    }

    pub fn with_config(config: &TimerConfig) -> Self {
        Self {
            nodes: Mutex::new(NodeHeap::with_capacity(config.initial_capacity)),
            adjust_timers: AtomicU32::new(0),
            stopped_timers: AtomicU32::new(0),
            timer0_deadline: AtomicU64::new(0),
            live: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            signal: Signal {
                pending: Mutex::new(false),
                cv: Condvar::new(),
            },
        }
    }

    /// Arm a timer that runs `callback` after `after`, then every `period`
    /// if `period` is non-zero.
    pub fn create<F>(
        self: &Arc<Self>,
        after: Duration,
        period: Duration,
        callback: F,
    ) -> Result<TimerHandle, TimerError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(TimerError::HeapClosed);
        }
        let node = Arc::new(TimerNode::new(
            clock::deadline_after(after),
            clock::duration_ns(period),
            Arc::new(callback),
        ));
        self.insert(&node)?;
        self.live.fetch_add(1, Ordering::AcqRel);
        trace!(deadline = node.deadline(), "timer armed");
        Ok(TimerHandle {
            node,
            heap: Arc::clone(self),
            released: false,
        })
    }

    /// Timers created and not yet freed.
    pub fn live_timers(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Nodes currently indexed by the heap, including stopped ones not
    /// yet evicted.
    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest deadline in clock nanoseconds, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        match self.timer0_deadline.load(Ordering::Acquire) {
            0 => None,
            d => Some(d),
        }
    }

    /// Run every timer due at `now`. Returns the number of callbacks run.
    pub fn trigger(&self, now: u64) -> usize {
        if self.adjust_timers.load(Ordering::Acquire) == 0 {
            let t0 = self.timer0_deadline.load(Ordering::Acquire);
            if t0 == 0 || now < t0 {
                return 0;
            }
        }

        let mut nodes = self.nodes.lock();
        if self.adjust_timers.load(Ordering::Acquire) > 0 {
            self.adjust_all(&mut nodes);
        }
        let fired = self.fire_due(&mut nodes, now);
        if self.stopped_timers.load(Ordering::Acquire) as usize > nodes.len() / 4 {
            self.sweep_stopped(&mut nodes);
        }
        self.update_timer0(&nodes);
        fired
    }

    /// Drop every armed timer. Later `create` calls fail.
    pub fn shutdown(&self) {
        let mut nodes = self.nodes.lock();
        self.closed.store(true, Ordering::Release);
        let drained = nodes.drain();
        debug!(timers = drained.len(), "timer heap shut down");
        for node in &drained {
            self.finish_removal(node);
        }
        self.adjust_timers.store(0, Ordering::Release);
        self.stopped_timers.store(0, Ordering::Release);
        self.update_timer0(&nodes);
        drop(nodes);
        self.signal.notify();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn insert(&self, node: &Arc<TimerNode>) -> Result<(), TimerError> {
        let mut nodes = self.nodes.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(TimerError::HeapClosed);
        }
        self.top_adjust(&mut nodes);
        let previous = self.timer0_deadline.load(Ordering::Acquire);
        nodes.push(Arc::clone(node))?;
        self.update_timer0(&nodes);
        drop(nodes);
        if previous == 0 || node.deadline() < previous {
            self.signal.notify();
        }
        Ok(())
    }

    fn update_timer0(&self, nodes: &NodeHeap) {
        self.timer0_deadline
            .store(nodes.top_deadline(), Ordering::Release);
    }

    /// Settle stopped or modified nodes sitting at the top.
    fn top_adjust(&self, nodes: &mut NodeHeap) {
        while let Some(top) = nodes.top().cloned() {
            match top.status() {
                TimerStatus::Stopped => {
                    if top.transition(TimerStatus::Stopped, TimerStatus::Removing) {
                        nodes.remove(0);
                        self.stopped_timers.fetch_sub(1, Ordering::AcqRel);
                        self.finish_removal(&top);
                    }
                }
                s @ (TimerStatus::ModifiedAhead | TimerStatus::ModifiedDelayed) => {
                    if top.transition(s, TimerStatus::Moving) {
                        let node = nodes.remove(0);
                        self.apply_new_deadline(&node, s);
                        nodes.reinsert(Arc::clone(&node));
                        self.finish_move(&node);
                    }
                }
                _ => break,
            }
        }
        self.update_timer0(nodes);
    }

    /// Reposition or evict every pending node in the heap. One filtering
    /// pass followed by a heapify, so no node is skipped when a removal
    /// reorders the array.
    fn adjust_all(&self, nodes: &mut NodeHeap) {
        let mut moved = Vec::new();
        let mut evicted = Vec::new();
        nodes.retain(|node| loop {
            match node.status() {
                TimerStatus::Stopped => {
                    if node.transition(TimerStatus::Stopped, TimerStatus::Removing) {
                        evicted.push(Arc::clone(node));
                        return false;
                    }
                }
                s @ (TimerStatus::ModifiedAhead | TimerStatus::ModifiedDelayed) => {
                    if node.transition(s, TimerStatus::Moving) {
                        self.apply_new_deadline(node, s);
                        moved.push(Arc::clone(node));
                        return false;
                    }
                }
                TimerStatus::Modifying => std::thread::yield_now(),
                _ => return true,
            }
        });
        for node in &evicted {
            self.stopped_timers.fetch_sub(1, Ordering::AcqRel);
            self.finish_removal(node);
        }
        for node in moved {
            nodes.reinsert(Arc::clone(&node));
            self.finish_move(&node);
        }
    }

    /// Copy the requested deadline. Returns true when this consumed the
    /// last pending ahead adjustment.
    fn apply_new_deadline(&self, node: &TimerNode, was: TimerStatus) -> bool {
        node.deadline
            .store(node.new_deadline.load(Ordering::Acquire), Ordering::Release);
        was == TimerStatus::ModifiedAhead && self.adjust_timers.fetch_sub(1, Ordering::AcqRel) == 1
    }

    fn finish_move(&self, node: &TimerNode) {
        if !node.transition(TimerStatus::Moving, TimerStatus::Waiting) {
            error!(status = ?node.status(), "timer left Moving unexpectedly");
            node.set_status(TimerStatus::Waiting);
        }
    }

    /// Node has left the heap for good. Caller holds the heap lock.
    fn finish_removal(&self, node: &TimerNode) {
        if node.auto_release.load(Ordering::Acquire) {
            self.live.fetch_sub(1, Ordering::AcqRel);
        } else {
            node.set_status(TimerStatus::Removed);
        }
    }

    fn fire_due(&self, nodes: &mut MutexGuard<'_, NodeHeap>, now: u64) -> usize {
        let mut fired = 0;
        while let Some(top) = nodes.top().cloned() {
            match top.status() {
                TimerStatus::Waiting => {
                    let now = now.max(clock::now_ns());
                    if top.deadline() > now {
                        break;
                    }
                    if top.transition(TimerStatus::Waiting, TimerStatus::Running) {
                        self.run(nodes, &top, now);
                        fired += 1;
                    }
                }
                TimerStatus::Stopped
                | TimerStatus::ModifiedAhead
                | TimerStatus::ModifiedDelayed => self.top_adjust(nodes),
                TimerStatus::Modifying => std::thread::yield_now(),
                status => {
                    error!(?status, "timer in unexpected state at heap top");
                    break;
                }
            }
        }
        fired
    }

    fn run(&self, nodes: &mut MutexGuard<'_, NodeHeap>, node: &Arc<TimerNode>, now: u64) {
        let callback: Callback = node.callback.lock().clone();
        let period = node.period.load(Ordering::Acquire);

        if period > 0 {
            let deadline = node.deadline();
            let missed = now.saturating_sub(deadline) / period;
            let step = period.saturating_mul(missed.saturating_add(1));
            node.deadline
                .store(deadline.saturating_add(step), Ordering::Release);
            nodes.sift_down(0);
            if !node.transition(TimerStatus::Running, TimerStatus::Waiting) {
                error!(status = ?node.status(), "periodic timer left Running unexpectedly");
            }
            self.update_timer0(nodes);
            MutexGuard::unlocked(nodes, || node::invoke(node, &callback));
            return;
        }

        nodes.remove(0);
        self.update_timer0(nodes);
        MutexGuard::unlocked(nodes, || node::invoke(node, &callback));
        if node.auto_release.load(Ordering::Acquire) {
            self.live.fetch_sub(1, Ordering::AcqRel);
        } else if !node.transition(TimerStatus::Running, TimerStatus::Idle) {
            error!(status = ?node.status(), "one-shot timer left Running unexpectedly");
        }
    }

    fn sweep_stopped(&self, nodes: &mut NodeHeap) {
        let mut evicted = Vec::new();
        nodes.retain(|node| {
            if node.status() == TimerStatus::Stopped
                && node.transition(TimerStatus::Stopped, TimerStatus::Removing)
            {
                evicted.push(Arc::clone(node));
                false
            } else {
                true
            }
        });
        if !evicted.is_empty() {
            trace!(evicted = evicted.len(), "swept stopped timers");
        }
        for node in &evicted {
            self.stopped_timers.fetch_sub(1, Ordering::AcqRel);
            self.finish_removal(node);
        }
    }

    fn release_node(&self, node: &Arc<TimerNode>) {
        if node.period.load(Ordering::Acquire) > 0 {
            let _ = self.stop_node(node);
        }
        let _nodes = self.nodes.lock();
        match node.status() {
            TimerStatus::Removed | TimerStatus::Idle => {
                self.live.fetch_sub(1, Ordering::AcqRel);
            }
            _ => node.auto_release.store(true, Ordering::Release),
        }
    }

    fn stop_node(&self, node: &Arc<TimerNode>) -> Result<(), TimerError> {
        loop {
            match node.status() {
                s @ (TimerStatus::Waiting | TimerStatus::ModifiedDelayed) => {
                    if node.transition(s, TimerStatus::Stopped) {
                        self.stopped_timers.fetch_add(1, Ordering::AcqRel);
                        return Ok(());
                    }
                }
                TimerStatus::ModifiedAhead => {
                    if node.transition(TimerStatus::ModifiedAhead, TimerStatus::Modifying) {
                        self.adjust_timers.fetch_sub(1, Ordering::AcqRel);
                        node.set_status(TimerStatus::Stopped);
                        self.stopped_timers.fetch_add(1, Ordering::AcqRel);
                        return Ok(());
                    }
                }
                TimerStatus::Running if node::is_firing(node) => {
                    return Err(TimerError::StopFailed)
                }
                TimerStatus::Running | TimerStatus::Moving | TimerStatus::Modifying => {
                    std::thread::yield_now()
                }
                TimerStatus::Idle
                | TimerStatus::Stopped
                | TimerStatus::Removing
                | TimerStatus::Removed => return Err(TimerError::StopFailed),
            }
        }
    }

    fn reset_node(
        &self,
        node: &Arc<TimerNode>,
        after: Duration,
        period: Duration,
        callback: Option<Callback>,
    ) -> Result<(), TimerError> {
        let (was, removed) = loop {
            match node.status() {
                s @ (TimerStatus::Waiting
                | TimerStatus::ModifiedAhead
                | TimerStatus::ModifiedDelayed) => {
                    if node.transition(s, TimerStatus::Modifying) {
                        break (s, false);
                    }
                }
                s @ (TimerStatus::Idle | TimerStatus::Removed) => {
                    if node.transition(s, TimerStatus::Modifying) {
                        break (s, true);
                    }
                }
                TimerStatus::Stopped => {
                    if node.transition(TimerStatus::Stopped, TimerStatus::Modifying) {
                        self.stopped_timers.fetch_sub(1, Ordering::AcqRel);
                        break (TimerStatus::Stopped, false);
                    }
                }
                TimerStatus::Running if node::is_firing(node) => return Err(TimerError::Busy),
                TimerStatus::Running
                | TimerStatus::Removing
                | TimerStatus::Modifying
                | TimerStatus::Moving => std::thread::yield_now(),
            }
        };

        let new_deadline = clock::deadline_after(after);
        node.period
            .store(clock::duration_ns(period), Ordering::Release);
        if let Some(callback) = callback {
            *node.callback.lock() = callback;
        }

        if removed {
            // Out of the heap: re-arm from scratch.
            node.deadline.store(new_deadline, Ordering::Release);
            node.new_deadline.store(new_deadline, Ordering::Release);
            node.set_status(TimerStatus::Waiting);
            if let Err(e) = self.insert(node) {
                node.set_status(was);
                return Err(e);
            }
            return Ok(());
        }

        node.new_deadline.store(new_deadline, Ordering::Release);
        let status = if new_deadline < node.deadline() {
            TimerStatus::ModifiedAhead
        } else {
            TimerStatus::ModifiedDelayed
        };
        if was == TimerStatus::ModifiedAhead {
            self.adjust_timers.fetch_sub(1, Ordering::AcqRel);
        }
        if status == TimerStatus::ModifiedAhead {
            self.adjust_timers.fetch_add(1, Ordering::AcqRel);
        }
        if !node.transition(TimerStatus::Modifying, status) {
            error!(status = ?node.status(), "timer left Modifying during reset");
            node.set_status(status);
            return Err(TimerError::State(node.status() as u8));
        }
        if status == TimerStatus::ModifiedAhead {
            self.signal.notify();
        }
        Ok(())
    }
}

/// Owned handle to an armed timer. Dropping it releases the timer.
pub struct TimerHandle {
    node: Arc<TimerNode>,
    heap: Arc<TimerHeap>,
    released: bool,
}

impl TimerHandle {
    /// Cancel the timer. Fails with `StopFailed` once it has fired, is
    /// running its one-shot callback, or was already stopped.
    pub fn stop(&self) -> Result<(), TimerError> {
        self.heap.stop_node(&self.node)
    }

    /// Cancel only if the timer is plainly waiting; never waits on a
    /// concurrent modification.
    pub fn try_stop(&self) -> Result<(), TimerError> {
        if self
            .node
            .transition(TimerStatus::Waiting, TimerStatus::Stopped)
        {
            self.heap.stopped_timers.fetch_add(1, Ordering::AcqRel);
            Ok(())
        } else {
            Err(TimerError::NotWaiting)
        }
    }

    /// Re-arm with a new duration and period, optionally swapping the
    /// callback. Re-inserts timers that already left the heap.
    pub fn reset(&self, after: Duration, period: Duration) -> Result<(), TimerError> {
        self.heap.reset_node(&self.node, after, period, None)
    }

    pub fn reset_with<F>(&self, after: Duration, period: Duration, callback: F) -> Result<(), TimerError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.heap
            .reset_node(&self.node, after, period, Some(Arc::new(callback)))
    }

    pub fn status(&self) -> TimerStatus {
        self.node.status()
    }

    /// Give up the handle. An armed one-shot still fires; a periodic timer
    /// is stopped first.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.heap.release_node(&self.node);
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("status", &self.node.status())
            .field("deadline", &self.node.deadline())
            .finish()
    }
}

struct DefaultTimers {
    heap: Arc<TimerHeap>,
    _driver: Option<TimerDriver>,
}

static DEFAULT: OnceLock<DefaultTimers> = OnceLock::new();

/// Process-wide heap, driven by a background thread spawned on first use.
pub fn default_heap() -> Arc<TimerHeap> {
    let timers = DEFAULT.get_or_init(|| {
        let mut config = RuntimeConfig::default();
        if let Err(e) = config.apply_env() {
            warn!(error = %e, "ignoring timer environment overrides");
        }
        let heap = Arc::new(TimerHeap::with_config(&config.timer));
        let driver = match TimerDriver::spawn(Arc::clone(&heap), &config.timer) {
            Ok(driver) => Some(driver),
            Err(e) => {
                error!(error = %e, "failed to spawn timer driver");
                None
            }
        };
        DefaultTimers {
            heap,
            _driver: driver,
        }
    });
    Arc::clone(&timers.heap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const FAR: u64 = u64::MAX / 2;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn one_shot_fires_once() {
        let heap = Arc::new(TimerHeap::new());
        let (count, cb) = counter();
        let t = heap.create(Duration::from_millis(1), Duration::ZERO, cb).unwrap();
        assert_eq!(heap.trigger(FAR), 1);
        assert_eq!(heap.trigger(FAR), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(t.status(), TimerStatus::Idle);
        assert_eq!(t.stop(), Err(TimerError::StopFailed));
        t.release();
        assert_eq!(heap.live_timers(), 0);
    }

    #[test]
    fn not_due_does_not_fire() {
        let heap = Arc::new(TimerHeap::new());
        let (count, cb) = counter();
        let _t = heap.create(Duration::from_secs(3600), Duration::ZERO, cb).unwrap();
        assert_eq!(heap.trigger(clock::now_ns()), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(heap.next_deadline().is_some());
    }

    #[test]
    fn fires_in_deadline_order() {
        let heap = Arc::new(TimerHeap::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for ms in [30u64, 10, 50, 20, 40] {
            let order = order.clone();
            handles.push(
                heap.create(Duration::from_millis(ms), Duration::ZERO, move || {
                    order.lock().push(ms)
                })
                .unwrap(),
            );
        }
        assert_eq!(heap.trigger(FAR), 5);
        assert_eq!(*order.lock(), vec![10, 20, 30, 40, 50]);
    }

    #[test]
    fn stop_before_fire_wins() {
        let heap = Arc::new(TimerHeap::new());
        let (count, cb) = counter();
        let t = heap.create(Duration::from_millis(1), Duration::ZERO, cb).unwrap();
        t.stop().unwrap();
        assert_eq!(t.stop(), Err(TimerError::StopFailed));
        assert_eq!(heap.trigger(FAR), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(t.status(), TimerStatus::Removed);
        assert!(heap.is_empty());
        drop(t);
        assert_eq!(heap.live_timers(), 0);
    }

    #[test]
    fn try_stop_only_from_waiting() {
        let heap = Arc::new(TimerHeap::new());
        let (_, cb) = counter();
        let t = heap.create(Duration::from_secs(10), Duration::ZERO, cb).unwrap();
        t.reset(Duration::from_secs(20), Duration::ZERO).unwrap();
        assert_eq!(t.status(), TimerStatus::ModifiedDelayed);
        assert_eq!(t.try_stop(), Err(TimerError::NotWaiting));
        // stop handles the modified state
        t.stop().unwrap();
    }

    #[test]
    fn reset_ahead_fires_earlier() {
        let heap = Arc::new(TimerHeap::new());
        let (count, cb) = counter();
        let t = heap.create(Duration::from_secs(3600), Duration::ZERO, cb).unwrap();
        t.reset(Duration::ZERO, Duration::ZERO).unwrap();
        assert_eq!(t.status(), TimerStatus::ModifiedAhead);
        assert_eq!(heap.trigger(clock::now_ns()), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn adjust_reaches_node_moved_by_eviction() {
        let heap = Arc::new(TimerHeap::new());
        let (count, cb) = counter();
        let mut handles = Vec::new();
        // Insertion order leaves the array in exactly this layout.
        for secs in [10u64, 20, 30, 15, 40, 21, 22, 23, 24, 31, 32, 33, 34] {
            handles.push(
                heap.create(Duration::from_secs(secs), Duration::ZERO, || {})
                    .unwrap(),
            );
        }
        let last = heap.create(Duration::from_secs(16), Duration::ZERO, cb).unwrap();

        // Evicting index 9 moves the last node up past the scan position.
        handles[9].stop().unwrap();
        last.reset(Duration::ZERO, Duration::ZERO).unwrap();
        assert_eq!(heap.trigger(clock::now_ns()), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(last.status(), TimerStatus::Idle);
        assert_eq!(handles[9].status(), TimerStatus::Removed);
        assert_eq!(heap.len(), 12);
    }

    #[test]
    fn reset_delayed_postpones() {
        let heap = Arc::new(TimerHeap::new());
        let (count, cb) = counter();
        let t = heap.create(Duration::ZERO, Duration::ZERO, cb).unwrap();
        t.reset(Duration::from_secs(3600), Duration::ZERO).unwrap();
        assert_eq!(heap.trigger(clock::now_ns()), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(t.status(), TimerStatus::Waiting);
        assert_eq!(heap.trigger(FAR), 1);
    }

    #[test]
    fn reset_after_fire_rearms() {
        let heap = Arc::new(TimerHeap::new());
        let (count, cb) = counter();
        let t = heap.create(Duration::ZERO, Duration::ZERO, cb).unwrap();
        assert_eq!(heap.trigger(FAR), 1);
        t.reset(Duration::ZERO, Duration::ZERO).unwrap();
        assert_eq!(t.status(), TimerStatus::Waiting);
        assert_eq!(heap.trigger(FAR), 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn reset_swaps_callback() {
        let heap = Arc::new(TimerHeap::new());
        let (old, cb) = counter();
        let (new, cb2) = counter();
        let t = heap.create(Duration::from_secs(1), Duration::ZERO, cb).unwrap();
        t.reset_with(Duration::from_secs(1), Duration::ZERO, cb2).unwrap();
        heap.trigger(FAR);
        assert_eq!(old.load(Ordering::SeqCst), 0);
        assert_eq!(new.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn periodic_collapses_missed_periods() {
        let heap = Arc::new(TimerHeap::new());
        let (count, cb) = counter();
        let t = heap
            .create(Duration::from_millis(1), Duration::from_millis(1), cb)
            .unwrap();
        let later = clock::now_ns() + 50_000_000;
        assert_eq!(heap.trigger(later), 1);
        assert_eq!(t.status(), TimerStatus::Waiting);
        assert!(heap.next_deadline().unwrap() > later);
        t.stop().unwrap();
        assert_eq!(heap.trigger(FAR), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_of_armed_one_shot_still_fires_then_frees() {
        let heap = Arc::new(TimerHeap::new());
        let (count, cb) = counter();
        heap.create(Duration::ZERO, Duration::ZERO, cb).unwrap().release();
        assert_eq!(heap.live_timers(), 1);
        heap.trigger(FAR);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(heap.live_timers(), 0);
    }

    #[test]
    fn release_of_periodic_stops_it() {
        let heap = Arc::new(TimerHeap::new());
        let (count, cb) = counter();
        let t = heap
            .create(Duration::ZERO, Duration::from_millis(1), cb)
            .unwrap();
        drop(t);
        heap.trigger(FAR);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(heap.live_timers(), 0);
    }

    #[test]
    fn stop_inside_own_callback_fails_fast() {
        let heap = Arc::new(TimerHeap::new());
        let slot: Arc<Mutex<Option<TimerHandle>>> = Arc::new(Mutex::new(None));
        let result = Arc::new(Mutex::new(None));
        let (s, r) = (slot.clone(), result.clone());
        let t = heap
            .create(Duration::ZERO, Duration::ZERO, move || {
                if let Some(t) = s.lock().as_ref() {
                    *r.lock() = Some(t.stop());
                }
            })
            .unwrap();
        *slot.lock() = Some(t);
        heap.trigger(FAR);
        assert_eq!(*result.lock(), Some(Err(TimerError::StopFailed)));
        slot.lock().take();
        assert_eq!(heap.live_timers(), 0);
    }

    #[test]
    fn stopped_nodes_are_swept() {
        let heap = Arc::new(TimerHeap::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let (_, cb) = counter();
            handles.push(
                heap.create(Duration::from_secs(100 + i), Duration::ZERO, cb)
                    .unwrap(),
            );
        }
        let (_, cb) = counter();
        let _due = heap.create(Duration::ZERO, Duration::ZERO, cb).unwrap();
        for h in &handles[4..] {
            h.stop().unwrap();
        }
        heap.trigger(clock::now_ns());
        assert_eq!(heap.len(), 4);
        for h in &handles[4..] {
            assert_eq!(h.status(), TimerStatus::Removed);
        }
    }

    #[test]
    fn shutdown_rejects_new_timers() {
        let heap = Arc::new(TimerHeap::new());
        let (_, cb) = counter();
        let t = heap.create(Duration::from_secs(1), Duration::ZERO, cb).unwrap();
        heap.shutdown();
        assert!(heap.is_empty());
        assert_eq!(t.stop(), Err(TimerError::StopFailed));
        let (_, cb) = counter();
        assert_eq!(
            heap.create(Duration::ZERO, Duration::ZERO, cb).unwrap_err(),
            TimerError::HeapClosed
        );
        drop(t);
        assert_eq!(heap.live_timers(), 0);
    }

    #[test]
    fn callback_may_create_timers() {
        let heap = Arc::new(TimerHeap::new());
        let inner = Arc::new(Mutex::new(None));
        let (h, slot) = (heap.clone(), inner.clone());
        let _t = heap
            .create(Duration::ZERO, Duration::ZERO, move || {
                let t = h.create(Duration::from_secs(5), Duration::ZERO, || {});
                *slot.lock() = t.ok();
            })
            .unwrap();
        heap.trigger(clock::now_ns());
        assert!(inner.lock().is_some());
    }
}
