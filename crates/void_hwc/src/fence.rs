//! Fences
//!
//! A [`Fence`] owns one synchronization primitive. Dropping the fence
//! closes it; [`Fence::close`] spells that out at call sites.
//!
//! Two primitives are provided:
//! - [`SyncFile`]: a kernel sync_file descriptor, signaled when it polls readable
//! - [`Timeline`]: a software timeline (sw_sync style) where a fence for
//!   point `n` signals once the timeline counter reaches `n`

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::FenceError;

/// A waitable synchronization primitive backing a [`Fence`]
pub trait SyncPrimitive: Send + Sync + fmt::Debug {
    /// Block until signaled or until `timeout` elapses.
    ///
    /// Returns `Ok(false)` on timeout.
    fn wait(&self, timeout: Option<Duration>) -> Result<bool, FenceError>;
}

/// An owned fence
#[derive(Debug)]
pub struct Fence {
    inner: Box<dyn SyncPrimitive>,
}

impl Fence {
    /// Wrap a synchronization primitive
    pub fn new(primitive: impl SyncPrimitive + 'static) -> Self {
        Self {
            inner: Box::new(primitive),
        }
    }

    /// Take ownership of a sync_file descriptor
    #[cfg(unix)]
    pub fn from_fd(fd: std::os::fd::OwnedFd) -> Self {
        Self::new(SyncFile::new(fd))
    }

    /// Wait for the fence, `None` meaning no bound
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool, FenceError> {
        self.inner.wait(timeout)
    }

    /// Non-blocking signal check
    pub fn is_signaled(&self) -> bool {
        self.inner.wait(Some(Duration::ZERO)).unwrap_or(false)
    }

    /// Close the fence without waiting
    pub fn close(self) {}
}

/// Kernel sync_file fence
#[cfg(unix)]
#[derive(Debug)]
pub struct SyncFile {
    fd: std::os::fd::OwnedFd,
}

#[cfg(unix)]
impl SyncFile {
    /// Wrap an owned sync_file descriptor
    pub fn new(fd: std::os::fd::OwnedFd) -> Self {
        Self { fd }
    }
}

#[cfg(unix)]
impl SyncPrimitive for SyncFile {
    fn wait(&self, timeout: Option<Duration>) -> Result<bool, FenceError> {
        use nix::errno::Errno;
        use nix::poll::{poll, PollFd, PollFlags};
        use std::os::fd::AsFd;

        let timeout = poll_timeout(timeout);

        loop {
            let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, timeout) {
                Ok(0) => return Ok(false),
                Ok(_) => {
                    let failed = fds[0]
                        .revents()
                        .map_or(false, |r| r.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL));
                    if failed {
                        return Err(FenceError::Wait("sync_file reported an error".into()));
                    }
                    return Ok(true);
                }
                Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
                Err(e) => return Err(FenceError::Wait(e.to_string())),
            }
        }
    }
}

/// Poll timeout for a wait bound, saturating at the longest poll accepts
#[cfg(unix)]
fn poll_timeout(timeout: Option<Duration>) -> nix::poll::PollTimeout {
    use nix::poll::PollTimeout;

    match timeout {
        None => PollTimeout::NONE,
        Some(d) => PollTimeout::try_from(d).unwrap_or(PollTimeout::MAX),
    }
}

#[derive(Debug, Default)]
struct TimelineState {
    value: Mutex<u64>,
    advanced: Condvar,
}

/// Software fence timeline
///
/// Cloning shares the same counter.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    state: Arc<TimelineState>,
}

impl Timeline {
    /// Create a timeline starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counter value
    pub fn value(&self) -> u64 {
        *self.state.value.lock()
    }

    /// Create a fence that signals when the counter reaches `point`
    pub fn create_fence(&self, point: u64) -> Fence {
        Fence::new(TimelinePoint {
            state: Arc::clone(&self.state),
            point,
        })
    }

    /// Advance the counter by `steps`, signaling every fence at or below it
    pub fn advance(&self, steps: u64) {
        let mut value = self.state.value.lock();
        *value += steps;
        self.state.advanced.notify_all();
    }

    /// Advance the counter to `point` (no-op if already past it)
    pub fn signal_to(&self, point: u64) {
        let mut value = self.state.value.lock();
        if *value < point {
            *value = point;
            self.state.advanced.notify_all();
        }
    }
}

#[derive(Debug)]
struct TimelinePoint {
    state: Arc<TimelineState>,
    point: u64,
}

impl SyncPrimitive for TimelinePoint {
    fn wait(&self, timeout: Option<Duration>) -> Result<bool, FenceError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut value = self.state.value.lock();
        while *value < self.point {
            match deadline {
                None => self.state.advanced.wait(&mut value),
                Some(deadline) => {
                    if self.state.advanced.wait_until(&mut value, deadline).timed_out() {
                        return Ok(*value >= self.point);
                    }
                }
            }
        }
        Ok(true)
    }
}
