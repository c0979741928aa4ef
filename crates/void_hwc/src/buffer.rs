//! Graphic buffers exchanged with the hardware composer

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::FenceError;
use crate::fence::Fence;

/// Opaque graphic buffer handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(u64);

impl BufferHandle {
    /// Wrap a raw handle value
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw handle value
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A full-screen buffer rendered by the producer (the EGL window surface)
///
/// Shared between the producer and the composition thread. The producer sets
/// the acquire fence before presenting; the composition thread stores the
/// release fence once the hardware has taken the buffer.
#[derive(Debug)]
pub struct SurfaceBuffer {
    handle: BufferHandle,
    acquire_fence: Mutex<Option<Fence>>,
    release_fence: Mutex<Option<Fence>>,
}

impl SurfaceBuffer {
    /// Create a buffer with no fences attached
    pub fn new(handle: BufferHandle) -> Self {
        Self {
            handle,
            acquire_fence: Mutex::new(None),
            release_fence: Mutex::new(None),
        }
    }

    /// Buffer handle
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    /// Attach the fence the hardware must wait on before reading
    pub fn set_acquire_fence(&self, fence: Option<Fence>) {
        *self.acquire_fence.lock() = fence;
    }

    pub(crate) fn take_acquire_fence(&self) -> Option<Fence> {
        self.acquire_fence.lock().take()
    }

    pub(crate) fn set_release_fence(&self, fence: Option<Fence>) {
        *self.release_fence.lock() = fence;
    }

    /// Take the release fence, leaving none behind
    pub fn take_release_fence(&self) -> Option<Fence> {
        self.release_fence.lock().take()
    }

    /// Whether the hardware may still be reading this buffer
    pub fn has_release_fence(&self) -> bool {
        self.release_fence.lock().is_some()
    }

    /// Wait until the buffer may be written again.
    ///
    /// Returns `Ok(false)` on timeout, in which case the fence stays attached.
    pub fn wait_for_release(&self, timeout: Option<Duration>) -> Result<bool, FenceError> {
        let Some(fence) = self.take_release_fence() else {
            return Ok(true);
        };
        if fence.wait(timeout)? {
            return Ok(true);
        }
        let mut slot = self.release_fence.lock();
        // A newer composition may have attached a fence meanwhile
        if slot.is_none() {
            *slot = Some(fence);
        }
        Ok(false)
    }
}
