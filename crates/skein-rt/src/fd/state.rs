// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-descriptor state block.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::FdError;
use crate::poll::{Direction, PollDesc};
use crate::sema::Semaphore;
use crate::timer::TimerHandle;

/// Where a descriptor is in its poller lifecycle.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// Registered, not yet handed to the poller.
    ToAdd = 0,
    /// Backend registration in progress.
    Adding = 1,
    /// Readiness is being delivered.
    Added = 2,
    /// Deregistration started. Terminal.
    Closing = 3,
}

impl PollState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::ToAdd,
            1 => Self::Adding,
            2 => Self::Added,
            _ => Self::Closing,
        }
    }
}

pub(crate) struct DescriptorState {
    fd: i32,
    poll_state: AtomicU8,
    read_gate: Semaphore,
    write_gate: Semaphore,
    pub(crate) desc: Arc<PollDesc>,
    /// In-lock wait timers, tagged with the arming sequence number.
    /// Whoever takes the handle first (the waiter or the firing timer)
    /// decides the outcome.
    read_timer: Mutex<Option<(u64, TimerHandle)>>,
    write_timer: Mutex<Option<(u64, TimerHandle)>>,
    timer_seq: AtomicU64,
}

impl DescriptorState {
    pub(crate) fn new(fd: i32) -> Self {
        Self {
            fd,
            poll_state: AtomicU8::new(PollState::ToAdd as u8),
            read_gate: Semaphore::new(1),
            write_gate: Semaphore::new(1),
            desc: Arc::new(PollDesc::new(fd)),
            read_timer: Mutex::new(None),
            write_timer: Mutex::new(None),
            timer_seq: AtomicU64::new(0),
        }
    }

    pub(crate) fn poll_state(&self) -> PollState {
        PollState::from_u8(self.poll_state.load(Ordering::Acquire))
    }

    pub(crate) fn set_poll_state(&self, state: PollState) {
        self.poll_state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn transition(&self, from: PollState, to: PollState) -> bool {
        self.poll_state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn gate(&self, dir: Direction) -> &Semaphore {
        match dir {
            Direction::Read => &self.read_gate,
            Direction::Write => &self.write_gate,
        }
    }

    fn timer_slot(&self, dir: Direction) -> &Mutex<Option<(u64, TimerHandle)>> {
        match dir {
            Direction::Read => &self.read_timer,
            Direction::Write => &self.write_timer,
        }
    }

    /// Arm the in-lock timer for `dir`. `create` gets the sequence number
    /// the timer must present to `take_timer`; it runs under the slot lock,
    /// so a timer firing early still finds itself in the slot.
    pub(crate) fn arm_timer<E>(
        &self,
        dir: Direction,
        create: impl FnOnce(u64) -> Result<TimerHandle, E>,
    ) -> Result<u64, E> {
        let mut slot = self.timer_slot(dir).lock();
        let seq = self.timer_seq.fetch_add(1, Ordering::Relaxed);
        let timer = create(seq)?;
        let stale = slot.replace((seq, timer));
        drop(slot);
        drop(stale);
        Ok(seq)
    }

    /// Take the timer armed as `seq`, if it is still in the slot.
    pub(crate) fn take_timer(&self, dir: Direction, seq: u64) -> Option<TimerHandle> {
        let mut slot = self.timer_slot(dir).lock();
        if slot.as_ref().map(|(armed, _)| *armed) != Some(seq) {
            return None;
        }
        slot.take().map(|(_, timer)| timer)
    }

    /// Cancel any in-lock timers left behind.
    pub(crate) fn cancel_timers(&self) {
        for dir in [Direction::Read, Direction::Write] {
            let taken = self.timer_slot(dir).lock().take();
            if let Some((_, timer)) = taken {
                let _ = timer.try_stop();
            }
        }
    }

    /// Waiting needs the descriptor in the poller.
    pub(crate) fn check_added(&self) -> Result<(), FdError> {
        match self.poll_state() {
            PollState::Added => Ok(()),
            PollState::Closing => Err(FdError::Closing(self.fd)),
            PollState::ToAdd | PollState::Adding => Err(FdError::NotAdded(self.fd)),
        }
    }

    /// Park until `dir` is ready.
    pub(crate) async fn wait_ready(&self, dir: Direction) -> Result<(), FdError> {
        self.check_added()?;
        if self.desc.wait(dir).await {
            Ok(())
        } else {
            Err(FdError::Closing(self.fd))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn starts_to_add_with_open_gates() {
        let state = DescriptorState::new(4);
        assert_eq!(state.poll_state(), PollState::ToAdd);
        assert!(state.gate(Direction::Read).try_acquire());
        assert!(state.gate(Direction::Write).try_acquire());
        assert!(!state.gate(Direction::Read).try_acquire());
    }

    #[test]
    fn transitions_are_compare_and_swap() {
        let state = DescriptorState::new(4);
        assert!(!state.transition(PollState::Adding, PollState::Added));
        assert!(state.transition(PollState::ToAdd, PollState::Adding));
        assert_eq!(state.poll_state(), PollState::Adding);
    }

    #[test]
    fn wait_requires_added() {
        let state = DescriptorState::new(4);
        let err = block_on(state.wait_ready(Direction::Read)).unwrap_err();
        assert!(matches!(err, FdError::NotAdded(4)));
    }

    #[test]
    fn wait_sees_readiness_and_close() {
        let state = DescriptorState::new(4);
        state.set_poll_state(PollState::Added);
        state.desc.ready(Direction::Write);
        block_on(state.wait_ready(Direction::Write)).unwrap();
        state.desc.close();
        let err = block_on(state.wait_ready(Direction::Read)).unwrap_err();
        assert!(matches!(err, FdError::Closing(4)));
    }

    #[test]
    fn closing_state_reports_closing() {
        let state = DescriptorState::new(4);
        state.set_poll_state(PollState::Closing);
        let err = block_on(state.wait_ready(Direction::Read)).unwrap_err();
        assert!(matches!(err, FdError::Closing(4)));
    }
}
