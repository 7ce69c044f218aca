// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Descriptor registry.
//!
//! Maps a raw descriptor to reference-counted state through a sparse
//! three-level table `[layer][line][slot]`. Layers and lines are allocated
//! lazily under the registry's init lock; lookups and reference counting
//! on an allocated line are lock-free.
//!
//! Lifecycle of one descriptor:
//!
//! ```text
//! register ──► ToAdd ──add──► Adding ──► Added
//!                │  ▲           │
//!                │  └─ backend ─┘
//!                │     refused
//!                └──── deregister (from ToAdd or Added) ──► Closing
//! ```
//!
//! Deregistration sets the closing flag, wakes every waiter, waits for
//! outstanding references to drain, and only then frees the state.

mod gate;
mod slot;
mod state;

pub use gate::{FdLock, RawLock};
pub use slot::FdRef;
pub use state::PollState;

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::config::RegistryConfig;
use crate::error::FdError;
use crate::green::yield_now;
use crate::poll::{Direction, ReadinessBackend};
use crate::timer::{self, TimerHandle, TimerHeap};
use slot::{Drain, Slot};
use state::DescriptorState;

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

const LAYERS: usize = 1 << 8;
const LINES: usize = 1 << 12;
const SLOTS: usize = 1 << 12;

type Line = Box<[Slot]>;
type Layer = Box<[OnceLock<Line>]>;

/// Split a descriptor into `(layer, line, slot)`.
fn index(fd: RawFd) -> Result<(usize, usize, usize), FdError> {
    let raw = u32::try_from(fd).map_err(|_| FdError::OverLimit(fd))?;
    let layer = (raw >> 24) as usize & (LAYERS - 1);
    let line = (raw >> 12) as usize & (LINES - 1);
    let slot = raw as usize & (SLOTS - 1);
    Ok((layer, line, slot))
}

fn alloc_with<T>(len: usize, make: impl FnMut() -> T) -> Result<Box<[T]>, FdError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|_| FdError::InitResource)?;
    v.resize_with(len, make);
    Ok(v.into_boxed_slice())
}

/// Table of registered descriptors.
pub struct FdRegistry {
    /// Process-unique; ties a `RawLock` to the registry that issued it.
    id: u64,
    layers: Box<[OnceLock<Layer>]>,
    init_lock: Mutex<()>,
    backend: Arc<dyn ReadinessBackend>,
    timers: OnceLock<Arc<TimerHeap>>,
    config: RegistryConfig,
}

impl FdRegistry {
    pub fn new(backend: Arc<dyn ReadinessBackend>) -> Self {
        Self::with_config(&RegistryConfig::default(), backend)
    }

    pub fn with_config(config: &RegistryConfig, backend: Arc<dyn ReadinessBackend>) -> Self {
        Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            layers: (0..LAYERS).map(|_| OnceLock::new()).collect(),
            init_lock: Mutex::new(()),
            backend,
            timers: OnceLock::new(),
            config: config.clone(),
        }
    }

    /// Use `timers` for descriptor wait timeouts instead of the
    /// process-wide heap.
    pub fn with_timers(self, timers: Arc<TimerHeap>) -> Self {
        let _ = self.timers.set(timers);
        self
    }

    pub(crate) fn timers(&self) -> &Arc<TimerHeap> {
        self.timers.get_or_init(timer::default_heap)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Slot lookup without allocating.
    fn slot(&self, fd: RawFd) -> Result<Option<&Slot>, FdError> {
        let (layer, line, slot) = index(fd)?;
        Ok(self.layers[layer]
            .get()
            .and_then(|lines| lines[line].get())
            .map(|slots| &slots[slot]))
    }

    /// Slot lookup, allocating its layer and line on first use.
    fn slot_or_init(&self, fd: RawFd) -> Result<&Slot, FdError> {
        let (layer, line, slot) = index(fd)?;
        if let Some(slots) = self.layers[layer].get().and_then(|l| l[line].get()) {
            return Ok(&slots[slot]);
        }

        let _init = self.init_lock.lock();
        let lines = match self.layers[layer].get() {
            Some(lines) => lines,
            None => {
                let fresh = alloc_with(LINES, OnceLock::new)?;
                let _ = self.layers[layer].set(fresh);
                self.layers[layer].get().ok_or(FdError::InitResource)?
            }
        };
        let slots = match lines[line].get() {
            Some(slots) => slots,
            None => {
                let fresh = alloc_with(SLOTS, Slot::new)?;
                let _ = lines[line].set(fresh);
                lines[line].get().ok_or(FdError::InitResource)?
            }
        };
        Ok(&slots[slot])
    }

    /// A reference that fails when `fd` is unknown or closing.
    fn checked_ref(&self, fd: RawFd) -> Result<FdRef<'_>, FdError> {
        let Some(slot) = self.slot(fd)? else {
            error!(fd, "descriptor not registered");
            return Err(FdError::Closing(fd));
        };
        FdRef::acquire(fd, slot).ok_or(FdError::Closing(fd))
    }

    /// Create state for `fd` in `ToAdd`.
    pub fn register(&self, fd: RawFd) -> Result<(), FdError> {
        let slot = self.slot_or_init(fd)?;
        if slot.is_installed() {
            return Err(FdError::Registered(fd));
        }
        slot.install(Arc::new(DescriptorState::new(fd)))
            .map_err(|_| FdError::Registered(fd))?;
        debug!(fd, "descriptor registered");
        Ok(())
    }

    /// Take a counted reference, if `fd` is registered and not closing.
    pub fn acquire(&self, fd: RawFd) -> Option<FdRef<'_>> {
        let slot = self.slot(fd).ok()??;
        FdRef::acquire(fd, slot)
    }

    /// Hand `fd` to the readiness backend. Concurrent calls register with
    /// the backend once; all of them see `Added` on success.
    pub async fn add(&self, fd: RawFd) -> Result<(), FdError> {
        let fd_ref = self.checked_ref(fd)?;
        let state = fd_ref.state();
        loop {
            match state.poll_state() {
                PollState::Added => return Ok(()),
                PollState::Closing => return Err(FdError::Closing(fd)),
                PollState::ToAdd => {
                    if state.transition(PollState::ToAdd, PollState::Adding) {
                        break;
                    }
                }
                PollState::Adding => yield_now().await,
            }
        }

        match self.backend.add(&state.desc) {
            Ok(()) => {
                state.set_poll_state(PollState::Added);
                debug!(fd, "descriptor added to poller");
                Ok(())
            }
            Err(source) => {
                state.set_poll_state(PollState::ToAdd);
                warn!(fd, error = %source, "poller refused descriptor");
                Err(FdError::AddFailed { fd, source })
            }
        }
    }

    /// `register` then `add`, undoing the registration if the backend
    /// refuses.
    pub async fn register_and_add(&self, fd: RawFd) -> Result<(), FdError> {
        self.register(fd)?;
        if let Err(e) = self.add(fd).await {
            if let Err(undo) = self.deregister(fd).await {
                error!(fd, error = %undo, "failed to undo registration");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Close `fd`: wake its waiters, wait for references to drain, then
    /// free its state. A second close fails with `Closing`.
    pub async fn deregister(&self, fd: RawFd) -> Result<(), FdError> {
        let Some(slot) = self.slot(fd)? else {
            error!(fd, "descriptor not registered");
            return Err(FdError::Closing(fd));
        };
        let state: &DescriptorState = match slot.incref(true) {
            // SAFETY: the closer reference keeps the state alive until the
            // drain below completes.
            Some(raw) => unsafe { &*raw },
            None => {
                error!(fd, "descriptor not registered or closed twice");
                return Err(FdError::Closing(fd));
            }
        };

        let was_added = self.begin_close(state).await;
        state.desc.close();
        self.drain(fd, slot).await?;

        let Some(state) = slot.take() else {
            error!(fd, "descriptor state vanished during close");
            return Err(FdError::Misused(fd));
        };
        if was_added {
            if let Err(e) = self.backend.delete(&state.desc) {
                warn!(fd, error = %e, "poller failed to drop descriptor");
            }
        }
        state.cancel_timers();
        debug!(fd, "descriptor deregistered");
        Ok(())
    }

    /// Move to `Closing`, waiting out an in-flight add. Returns whether
    /// the backend had the descriptor.
    async fn begin_close(&self, state: &DescriptorState) -> bool {
        loop {
            match state.poll_state() {
                PollState::Added => {
                    if state.transition(PollState::Added, PollState::Closing) {
                        return true;
                    }
                }
                PollState::ToAdd => {
                    if state.transition(PollState::ToAdd, PollState::Closing) {
                        return false;
                    }
                }
                PollState::Adding => yield_now().await,
                PollState::Closing => return false,
            }
        }
    }

    async fn drain(&self, fd: RawFd, slot: &Slot) -> Result<(), FdError> {
        let mut spins = 0;
        loop {
            match slot.finish_close() {
                Drain::Done => return Ok(()),
                Drain::Misused => {
                    error!(fd, "close drain without a closer reference");
                    return Err(FdError::Misused(fd));
                }
                Drain::Busy if spins < self.config.drain_spins => {
                    spins += 1;
                    std::hint::spin_loop();
                }
                Drain::Busy => {
                    spins = 0;
                    yield_now().await;
                }
            }
        }
    }

    /// Wake every readiness waiter on `fd` with the closing outcome.
    /// The descriptor stays registered.
    pub async fn wake_all(&self, fd: RawFd) -> Result<(), FdError> {
        let fd_ref = self.checked_ref(fd)?;
        let state = fd_ref.state();
        loop {
            match state.poll_state() {
                PollState::Added | PollState::Closing => break,
                PollState::ToAdd => {
                    if state.transition(PollState::ToAdd, PollState::Closing) {
                        break;
                    }
                }
                PollState::Adding => yield_now().await,
            }
        }
        state.desc.close();
        Ok(())
    }

    /// Park until `fd` is ready in `dir`. One waiter per direction; use
    /// [`lock`](Self::lock) to serialize.
    pub async fn wait(&self, fd: RawFd, dir: Direction) -> Result<(), FdError> {
        let fd_ref = self.checked_ref(fd)?;
        fd_ref.state().wait_ready(dir).await
    }

    /// Like [`wait`](Self::wait), failing with `TimedOut` after `timeout`.
    /// Dropping the future cancels its timer.
    pub async fn wait_timeout(
        &self,
        fd: RawFd,
        dir: Direction,
        timeout: Duration,
    ) -> Result<(), FdError> {
        if timeout.is_zero() {
            return Err(FdError::TimedOut);
        }
        let fd_ref = self.checked_ref(fd)?;
        let state = fd_ref.state();
        state.check_added()?;

        let claimed = Arc::new(AtomicBool::new(false));
        let timer = {
            let desc = Arc::clone(&state.desc);
            let claimed = Arc::clone(&claimed);
            self.timers()
                .create(timeout, Duration::ZERO, move || {
                    if !claimed.swap(true, Ordering::AcqRel) {
                        desc.ready(dir);
                    }
                })
                .map_err(|e| {
                    error!(fd, error = %e, "failed to arm descriptor timer");
                    FdError::InitResource
                })?
        };
        let armed = ClaimTimer { timer, claimed };

        let ready = state.desc.wait(dir).await;
        let won = armed.claim();
        if !ready {
            return Err(FdError::Closing(fd));
        }
        if won {
            Ok(())
        } else {
            Err(FdError::TimedOut)
        }
    }

    /// Take the ordering gate for `dir`. Fails with `Closing` if the
    /// descriptor starts closing while the caller is queued.
    pub async fn lock(&self, fd: RawFd, dir: Direction) -> Result<FdLock<'_>, FdError> {
        let fd_ref = self.checked_ref(fd)?;
        let gate = fd_ref.state().gate(dir);
        gate.acquire().await.map_err(|e| {
            error!(fd, error = %e, "failed to queue on descriptor gate");
            FdError::InitResource
        })?;
        if fd_ref.slot().is_closing() {
            if let Err(e) = gate.release() {
                error!(fd, error = %e, "failed to release descriptor gate");
            }
            return Err(FdError::Closing(fd));
        }
        Ok(FdLock::new(self, dir, fd_ref))
    }

    /// Release a lock given up with [`FdLock::into_raw`].
    pub fn unlock(&self, lock: RawLock) -> Result<(), FdError> {
        let fd = lock.fd;
        if lock.registry != self.id() {
            error!(fd, "unlock with a lock from another registry");
            return Err(FdError::Misused(fd));
        }
        let Some(slot) = self.slot(fd)? else {
            error!(fd, "unlock of unregistered descriptor");
            return Err(FdError::Misused(fd));
        };
        if slot.refs() & !slot::CLOSING == 0 {
            error!(fd, "unlock without a held reference");
            return Err(FdError::Misused(fd));
        }
        let Some(raw) = slot.held_state() else {
            error!(fd, "unlock of unregistered descriptor");
            return Err(FdError::Misused(fd));
        };
        // SAFETY: the raw lock carries a reference, so the state is live
        // until the decref below.
        let state = unsafe { &*raw };
        let gate = state.gate(lock.dir);
        if gate.permits() > 0 {
            error!(fd, dir = ?lock.dir, "unlock of a gate nobody holds");
            return Err(FdError::Misused(fd));
        }
        let result = gate.release().map_err(|e| {
            error!(fd, error = %e, "failed to release descriptor gate");
            FdError::Misused(fd)
        });
        slot.decref(fd);
        result
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        matches!(self.slot(fd), Ok(Some(slot)) if slot.is_installed())
    }

    /// Current poller state, `None` when unregistered or closing.
    pub fn poll_state(&self, fd: RawFd) -> Option<PollState> {
        self.acquire(fd).map(|r| r.state().poll_state())
    }

    /// Outstanding references, excluding the closing flag.
    pub fn ref_count(&self, fd: RawFd) -> u64 {
        match self.slot(fd) {
            Ok(Some(slot)) => slot.refs() & !slot::CLOSING,
            _ => 0,
        }
    }
}

/// Timer for an unlocked `wait_timeout`. The waiter and the firing
/// timer race on `claimed`; the loser does nothing. Dropped unclaimed, it
/// cancels the timer.
struct ClaimTimer {
    timer: TimerHandle,
    claimed: Arc<AtomicBool>,
}

impl ClaimTimer {
    /// True if the waiter claimed the outcome before the timer fired.
    fn claim(&self) -> bool {
        if self.claimed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.timer.try_stop();
        true
    }
}

impl Drop for ClaimTimer {
    fn drop(&mut self) {
        self.claim();
    }
}

impl Drop for FdRegistry {
    fn drop(&mut self) {
        let mut freed = 0usize;
        for lines in self.layers.iter().filter_map(OnceLock::get) {
            for slots in lines.iter().filter_map(OnceLock::get) {
                for slot in slots.iter() {
                    if let Some(state) = slot.take() {
                        state.cancel_timers();
                        freed += 1;
                    }
                }
            }
        }
        if freed > 0 {
            debug!(freed, "registry dropped with live descriptors");
        }
    }
}

impl std::fmt::Debug for FdRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
