// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Registry slot: tagged reference count plus the state pointer.
//!
//! The high bit of `refs` is the closing flag; the rest is the count.
//! A reference may only be taken while the flag is clear. The closer sets
//! the flag and takes its own reference in one compare-and-swap, then waits
//! for the count to drain to just itself before the state is freed.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::error;

use super::state::DescriptorState;

pub(crate) const CLOSING: u64 = 1 << 63;
const COUNT: u64 = !CLOSING;

pub(crate) enum Drain {
    /// Only the closer's reference was left and it has been dropped.
    Done,
    /// Other holders remain.
    Busy,
    /// No closer reference to drain.
    Misused,
}

pub(crate) struct Slot {
    refs: AtomicU64,
    /// `Arc::into_raw` of the state; null when unregistered.
    state: AtomicPtr<DescriptorState>,
}

impl Slot {
    pub(crate) fn new() -> Self {
        Self {
            refs: AtomicU64::new(0),
            state: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(crate) fn is_installed(&self) -> bool {
        !self.state.load(Ordering::Acquire).is_null()
    }

    pub(crate) fn refs(&self) -> u64 {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.refs() & CLOSING != 0
    }

    /// Publish a fresh state block. Fails if one is already installed.
    /// The count is left alone: a reference taken the instant the pointer
    /// appears is a real one.
    pub(crate) fn install(&self, state: Arc<DescriptorState>) -> Result<(), Arc<DescriptorState>> {
        let raw = Arc::into_raw(state) as *mut DescriptorState;
        match self
            .state
            .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            // SAFETY: `raw` came from `Arc::into_raw` above and was never published.
            Err(_) => Err(unsafe { Arc::from_raw(raw) }),
        }
    }

    /// Unpublish the state block, then clear the drained closing flag so
    /// the slot can be reused.
    pub(crate) fn take(&self) -> Option<Arc<DescriptorState>> {
        let raw = self.state.swap(ptr::null_mut(), Ordering::AcqRel);
        if raw.is_null() {
            return None;
        }
        // Only the exact drained value is cleared; with the pointer gone no
        // new reference can stick.
        let _ = self
            .refs
            .compare_exchange(CLOSING, 0, Ordering::AcqRel, Ordering::Acquire);
        // SAFETY: non-null values are only ever stored by `install`, and the
        // swap makes this the sole owner of that strong count.
        Some(unsafe { Arc::from_raw(raw) })
    }

    /// The state pointer, for a caller that already holds a reference.
    pub(crate) fn held_state(&self) -> Option<*const DescriptorState> {
        let raw = self.state.load(Ordering::Acquire);
        (!raw.is_null()).then_some(raw as *const DescriptorState)
    }

    /// Take a reference, or the closer reference when `close` is set.
    /// Fails once a close is in flight.
    pub(crate) fn incref(&self, close: bool) -> Option<*const DescriptorState> {
        if self.state.load(Ordering::Acquire).is_null() {
            return None;
        }
        let flag = if close { CLOSING } else { 0 };
        let mut cur = self.refs.load(Ordering::Acquire);
        loop {
            if cur & CLOSING != 0 || cur & COUNT == COUNT {
                return None;
            }
            match self.refs.compare_exchange_weak(
                cur,
                (cur | flag) + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
        // Re-read: the pointer seen before the CAS may belong to an earlier
        // registration of the same descriptor.
        let raw = self.state.load(Ordering::Acquire);
        if raw.is_null() {
            self.refs.fetch_sub(flag + 1, Ordering::AcqRel);
            return None;
        }
        Some(raw)
    }

    /// Drop a non-closer reference.
    pub(crate) fn decref(&self, fd: i32) {
        let mut cur = self.refs.load(Ordering::Acquire);
        loop {
            if cur & COUNT == 0 {
                error!(fd, "descriptor reference released without being held");
                return;
            }
            match self.refs.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Drop the closer reference if it is the last one.
    pub(crate) fn finish_close(&self) -> Drain {
        let cur = self.refs.load(Ordering::Acquire);
        if cur & CLOSING == 0 || cur & COUNT == 0 {
            return Drain::Misused;
        }
        if cur != CLOSING | 1 {
            return Drain::Busy;
        }
        match self
            .refs
            .compare_exchange(cur, CLOSING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Drain::Done,
            Err(_) => Drain::Busy,
        }
    }
}

/// A counted reference to a registered descriptor. Dropping it releases
/// the reference.
pub struct FdRef<'a> {
    fd: i32,
    slot: &'a Slot,
    state: &'a DescriptorState,
}

impl<'a> FdRef<'a> {
    pub(crate) fn acquire(fd: i32, slot: &'a Slot) -> Option<Self> {
        let raw = slot.incref(false)?;
        // SAFETY: the reference just taken keeps the state alive until
        // this `FdRef` drops; deregistration drains it before freeing.
        let state = unsafe { &*raw };
        Some(Self { fd, slot, state })
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub(crate) fn state(&self) -> &'a DescriptorState {
        self.state
    }

    pub(crate) fn slot(&self) -> &'a Slot {
        self.slot
    }

    /// An owning handle to the state, for callbacks that may outlive
    /// this reference.
    pub(crate) fn arc(&self) -> Arc<DescriptorState> {
        let raw: *const DescriptorState = self.state;
        // SAFETY: `raw` is the pointer published by `Slot::install`, whose
        // strong count is held by the slot while this reference lives.
        unsafe {
            Arc::increment_strong_count(raw);
            Arc::from_raw(raw)
        }
    }
}

impl Drop for FdRef<'_> {
    fn drop(&mut self) {
        self.slot.decref(self.fd);
    }
}

impl std::fmt::Debug for FdRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdRef").field("fd", &self.fd).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn installed() -> Slot {
        let slot = Slot::new();
        assert!(slot.install(Arc::new(DescriptorState::new(9))).is_ok());
        slot
    }

    #[test]
    fn empty_slot_refuses_references() {
        let slot = Slot::new();
        assert!(slot.incref(false).is_none());
        assert!(slot.incref(true).is_none());
    }

    #[test]
    fn second_install_is_rejected() {
        let slot = installed();
        assert!(slot.install(Arc::new(DescriptorState::new(9))).is_err());
        drop(slot.take());
    }

    #[test]
    fn references_count_and_release() {
        let slot = installed();
        let a = FdRef::acquire(9, &slot).unwrap();
        let b = FdRef::acquire(9, &slot).unwrap();
        assert_eq!(slot.refs(), 2);
        drop(a);
        drop(b);
        assert_eq!(slot.refs(), 0);
        drop(slot.take());
    }

    #[test]
    fn decref_never_underflows() {
        let slot = installed();
        slot.decref(9);
        assert_eq!(slot.refs(), 0);
        drop(slot.take());
    }

    #[test]
    fn closer_blocks_new_references_and_drains() {
        let slot = installed();
        let holder = FdRef::acquire(9, &slot).unwrap();
        assert!(slot.incref(true).is_some());
        assert!(slot.is_closing());
        assert!(slot.incref(false).is_none());
        assert!(slot.incref(true).is_none());
        assert!(matches!(slot.finish_close(), Drain::Busy));
        drop(holder);
        assert!(matches!(slot.finish_close(), Drain::Done));
        assert_eq!(slot.refs(), CLOSING);
        assert!(matches!(slot.finish_close(), Drain::Misused));
        drop(slot.take());
        assert_eq!(slot.refs(), 0);
    }

    #[test]
    fn install_keeps_a_racing_reference() {
        let slot = Slot::new();
        // An acquire that counted itself just as the pointer was published.
        slot.refs.fetch_add(1, Ordering::AcqRel);
        assert!(slot.install(Arc::new(DescriptorState::new(9))).is_ok());
        assert_eq!(slot.refs(), 1);
        slot.decref(9);
        assert_eq!(slot.refs(), 0);
        drop(slot.take());
    }

    #[test]
    fn closed_slot_is_reusable() {
        let slot = installed();
        assert!(slot.incref(true).is_some());
        assert!(matches!(slot.finish_close(), Drain::Done));
        drop(slot.take());
        assert_eq!(slot.refs(), 0);

        assert!(slot.install(Arc::new(DescriptorState::new(9))).is_ok());
        let r = FdRef::acquire(9, &slot).unwrap();
        assert_eq!(slot.refs(), 1);
        drop(r);
        drop(slot.take());
    }

    #[test]
    fn arc_shares_the_installed_state() {
        let slot = installed();
        let r = FdRef::acquire(9, &slot).unwrap();
        let owned = r.arc();
        assert!(std::ptr::eq(Arc::as_ptr(&owned), r.state()));
        drop(r);
        let taken = slot.take().unwrap();
        assert_eq!(Arc::strong_count(&taken), 2);
    }
}
