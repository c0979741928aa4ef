//! Release fence bookkeeping for layer-list buffers
//!
//! After each layer-list commit the tracker remembers, per slot, which buffer
//! was posted and the release fence the hardware returned for it. Buffers
//! without a fence are handed back immediately. Buffers with a fence are
//! handed back once the fence has signaled: [`FenceTracker::collect_signaled`]
//! picks up signaled fences before a commit without waiting, and
//! [`FenceTracker::sync_and_close`] waits, after a commit, for the fences
//! of buffers that commit replaced.

use std::time::Duration;

use crate::buffer::BufferHandle;
use crate::contents::HwLayer;
use crate::fence::Fence;

/// A posted buffer and its outstanding release fence
#[derive(Debug)]
pub struct ReleaseFenceEntry {
    pub buffer: BufferHandle,
    pub fence: Option<Fence>,
}

#[derive(Debug, Default)]
pub struct FenceTracker {
    /// Entries of the previous commit, indexed by layer slot
    slots: Vec<ReleaseFenceEntry>,
    /// Entries whose fence did not signal within the wait bound
    lingering: Vec<ReleaseFenceEntry>,
}

impl FenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffers still waiting on a release fence
    pub fn pending(&self) -> usize {
        self.slots
            .iter()
            .chain(&self.lingering)
            .filter(|e| e.fence.is_some())
            .count()
    }

    /// Close, without waiting, the fence of every buffer posted again in the
    /// same slot. Its owner is notified after the upcoming commit instead.
    pub fn discard_reposted(&mut self, buffers: &[BufferHandle]) -> usize {
        let mut discarded = 0;
        for (entry, buffer) in self.slots.iter_mut().zip(buffers) {
            if entry.buffer != *buffer {
                continue;
            }
            if let Some(fence) = entry.fence.take() {
                log::debug!("posting buffer {} again, closing its release fence", buffer);
                fence.close();
                discarded += 1;
            }
        }
        discarded
    }

    /// Hand back, without waiting, every buffer whose fence has signaled.
    ///
    /// Unsignaled fences stay where they are. Returns the number of buffers
    /// handed back.
    pub fn collect_signaled(&mut self, mut buffer_available: impl FnMut(BufferHandle)) -> usize {
        let mut released = 0;
        for entry in self.slots.iter_mut().chain(self.lingering.iter_mut()) {
            if !entry.fence.as_ref().map_or(false, Fence::is_signaled) {
                continue;
            }
            if let Some(fence) = entry.fence.take() {
                fence.close();
            }
            log::debug!("old buffer {} is released from hwc", entry.buffer);
            buffer_available(entry.buffer);
            released += 1;
        }
        self.lingering.retain(|e| e.fence.is_some());
        released
    }

    /// Mark the previous commit's buffers as off screen.
    ///
    /// Called after a commit that does not carry them; their fences can
    /// then be waited on by [`sync_and_close`](Self::sync_and_close).
    pub fn supersede(&mut self) {
        for entry in self.slots.drain(..) {
            if entry.fence.is_some() {
                self.lingering.push(entry);
            }
        }
    }

    /// Number of superseded buffers still waiting on a release fence
    pub fn lingering(&self) -> usize {
        self.lingering.len()
    }

    /// Wait for the fences of superseded buffers, close them and hand the
    /// buffers back.
    ///
    /// Only fences of commits that a later commit replaced are waited on,
    /// so they are due to signal. Fences that do not signal within
    /// `timeout` are kept and retried on the next call. Returns the number
    /// of buffers handed back.
    pub fn sync_and_close(
        &mut self,
        timeout: Option<Duration>,
        mut buffer_available: impl FnMut(BufferHandle),
    ) -> usize {
        let entries: Vec<_> = self.lingering.drain(..).collect();
        let mut released = 0;

        for entry in entries {
            let Some(fence) = entry.fence else {
                continue;
            };
            match fence.wait(timeout) {
                Ok(true) => {}
                Ok(false) => {
                    log::warn!("release fence of buffer {} still pending after {:?}", entry.buffer, timeout);
                    self.lingering.push(ReleaseFenceEntry {
                        buffer: entry.buffer,
                        fence: Some(fence),
                    });
                    continue;
                }
                Err(e) => {
                    log::warn!("release fence of buffer {} failed: {}, releasing anyway", entry.buffer, e);
                }
            }
            fence.close();
            log::debug!("old buffer {} is released from hwc", entry.buffer);
            buffer_available(entry.buffer);
            released += 1;
        }

        released
    }

    /// Record the release fences of a finished commit.
    ///
    /// `layers` are the posted layer slots, in order. Buffers without a
    /// release fence are available right away.
    pub fn record(&mut self, layers: &mut [HwLayer], mut buffer_available: impl FnMut(BufferHandle)) {
        // Never drop an unsignaled fence on the floor
        self.supersede();

        for layer in layers {
            let Some(buffer) = layer.handle else {
                continue;
            };
            let fence = layer.release_fence.take();
            if fence.is_none() {
                log::debug!("buffer {} has no release fence, available right away", buffer);
                buffer_available(buffer);
            } else {
                log::debug!("buffer {} stored until its release fence signals", buffer);
            }
            self.slots.push(ReleaseFenceEntry { buffer, fence });
        }
    }

    /// Close every fence and hand every outstanding buffer back.
    ///
    /// Only valid once the hardware can no longer read the buffers.
    pub fn drain_all(&mut self, mut buffer_available: impl FnMut(BufferHandle)) {
        for entry in self.lingering.drain(..).chain(self.slots.drain(..)) {
            if let Some(fence) = entry.fence {
                fence.close();
                buffer_available(entry.buffer);
            }
        }
    }
}
