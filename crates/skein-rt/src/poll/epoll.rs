// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Epoll readiness backend.
//!
//! Edge-triggered epoll with an eventfd for waking the poller thread.
//! Events are routed to the descriptor's `PollDesc` cells.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, error};

use super::{Direction, PollDesc, ReadinessBackend};
use crate::config::PollerConfig;

const READ_EVENTS: u32 =
    (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32;
const WRITE_EVENTS: u32 = (libc::EPOLLOUT | libc::EPOLLHUP | libc::EPOLLERR) as u32;

/// Epoll instance plus the fd → readiness record map.
pub struct EpollBackend {
    epoll_fd: RawFd,
    /// Eventfd for interrupting `epoll_wait` (shutdown).
    wake_fd: RawFd,
    descs: Mutex<HashMap<RawFd, Arc<PollDesc>>>,
    max_events: usize,
    shutdown: AtomicBool,
}

impl EpollBackend {
    pub fn new(config: &PollerConfig) -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(err);
        }

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: wake_fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wake_fd, &mut ev) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(wake_fd);
                libc::close(epoll_fd);
            }
            return Err(err);
        }

        Ok(Self {
            epoll_fd,
            wake_fd,
            descs: Mutex::new(HashMap::new()),
            max_events: config.max_events.max(1),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Run one poll cycle: wait up to `timeout_ms`, then deliver readiness.
    /// Returns the number of cells that changed state.
    pub fn poll_once(&self, timeout_ms: i32) -> io::Result<usize> {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.max_events];
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                events.as_mut_ptr(),
                events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        // Resolve records under the lock, deliver outside it: a wake may
        // run arbitrary executor code.
        let mut ready = Vec::with_capacity(n as usize);
        {
            let descs = self.descs.lock();
            for ev in &events[..n as usize] {
                let fd = ev.u64 as RawFd;
                if fd == self.wake_fd {
                    self.drain_wake_fd();
                    continue;
                }
                if let Some(pd) = descs.get(&fd) {
                    ready.push((Arc::clone(pd), ev.events));
                }
            }
        }

        let mut changed = 0;
        for (pd, bits) in ready {
            if bits & READ_EVENTS != 0 && pd.ready(Direction::Read) {
                changed += 1;
            }
            if bits & WRITE_EVENTS != 0 && pd.ready(Direction::Write) {
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn drain_wake_fd(&self) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(self.wake_fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
        }
    }

    /// Interrupt a blocked `poll_once`.
    pub fn wake(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(self.wake_fd, &val as *const u64 as *const libc::c_void, 8);
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake();
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn registered(&self) -> usize {
        self.descs.lock().len()
    }

    /// Spawn the poller thread. It runs until `request_shutdown`.
    pub fn spawn_driver(self: &Arc<Self>, config: &PollerConfig) -> io::Result<JoinHandle<()>> {
        let backend = Arc::clone(self);
        let timeout_ms = config.poll_timeout_ms;
        std::thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || {
                debug!("poller started");
                while !backend.should_shutdown() {
                    if let Err(e) = backend.poll_once(timeout_ms) {
                        error!(error = %e, "epoll_wait failed");
                        break;
                    }
                }
                debug!("poller stopped");
            })
    }
}

impl ReadinessBackend for EpollBackend {
    fn add(&self, desc: &Arc<PollDesc>) -> io::Result<()> {
        let fd = desc.fd();
        let mut descs = self.descs.lock();
        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLRDHUP | libc::EPOLLET) as u32,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        descs.insert(fd, Arc::clone(desc));
        Ok(())
    }

    fn delete(&self, desc: &PollDesc) -> io::Result<()> {
        let fd = desc.fd();
        let mut descs = self.descs.lock();
        if descs.remove(&fd).is_some() {
            let ret = unsafe {
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                // Already closed by the owner.
                if err.raw_os_error() != Some(libc::ENOENT)
                    && err.raw_os_error() != Some(libc::EBADF)
                {
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        let descs = self.descs.get_mut();
        for &fd in descs.keys() {
            unsafe {
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            }
        }
        descs.clear();
        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epoll_fd);
        }
    }
}
