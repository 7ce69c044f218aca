// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Timer driver: dedicated thread running the firing path.
//!
//! Sleeps until the earliest deadline (or the configured idle wait), and
//! is woken early when an insert or an ahead reset moves the deadline up.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::debug;

use super::TimerHeap;
use crate::clock;
use crate::config::TimerConfig;

/// Background thread firing a heap's timers. Stops and joins on drop.
pub struct TimerDriver {
    heap: Arc<TimerHeap>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl TimerDriver {
    pub fn spawn(heap: Arc<TimerHeap>, config: &TimerConfig) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let idle = Duration::from_millis(config.idle_wait_ms.max(1));
        let thread = {
            let heap = Arc::clone(&heap);
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name(config.driver_thread_name.clone())
                .spawn(move || driver_loop(&heap, &stop, idle))?
        };
        Ok(Self {
            heap,
            stop,
            thread: Some(thread),
        })
    }

    pub fn heap(&self) -> &Arc<TimerHeap> {
        &self.heap
    }
}

impl Drop for TimerDriver {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.heap.signal.notify();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn driver_loop(heap: &TimerHeap, stop: &AtomicBool, idle: Duration) {
    debug!("timer driver started");
    while !stop.load(Ordering::Acquire) {
        heap.trigger(clock::now_ns());
        let wait = match heap.next_deadline() {
            Some(deadline) => {
                Duration::from_nanos(deadline.saturating_sub(clock::now_ns())).min(idle)
            }
            None => idle,
        };
        if !wait.is_zero() {
            heap.signal.wait(wait);
        }
    }
    debug!("timer driver stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    #[test]
    fn driver_fires_due_timer() {
        let heap = Arc::new(TimerHeap::new());
        let driver = TimerDriver::spawn(heap.clone(), &TimerConfig::default()).unwrap();
        let (tx, rx) = mpsc::channel();
        let tx = parking_lot::Mutex::new(tx);
        let start = Instant::now();
        let _t = heap
            .create(Duration::from_millis(10), Duration::ZERO, move || {
                let _ = tx.lock().send(());
            })
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
        drop(driver);
    }

    #[test]
    fn earlier_insert_wakes_sleeping_driver() {
        let heap = Arc::new(TimerHeap::new());
        let config = TimerConfig {
            idle_wait_ms: 60_000,
            ..TimerConfig::default()
        };
        let _driver = TimerDriver::spawn(heap.clone(), &config).unwrap();
        let _far = heap.create(Duration::from_secs(600), Duration::ZERO, || {}).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let (tx, rx) = mpsc::channel();
        let tx = parking_lot::Mutex::new(tx);
        let _near = heap
            .create(Duration::from_millis(5), Duration::ZERO, move || {
                let _ = tx.lock().send(());
            })
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn drop_joins_thread() {
        let heap = Arc::new(TimerHeap::new());
        let driver = TimerDriver::spawn(heap.clone(), &TimerConfig::default()).unwrap();
        drop(driver);
        assert_eq!(Arc::strong_count(&heap), 1);
    }
}
