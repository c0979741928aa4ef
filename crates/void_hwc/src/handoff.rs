//! Single-slot frame handoff between the producer and the composition thread
//!
//! The slot holds at most one frame. A producer waits while the slot is
//! occupied or while the previous frame is still being composed; the
//! composition thread takes the frame, composes it without holding the
//! lock, then marks the slot free and wakes waiters.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::buffer::{BufferHandle, SurfaceBuffer};
use crate::error::{HwcError, HwcResult};
use crate::layer::LayerListId;
use crate::Size;

#[derive(Debug, Default)]
pub(crate) struct Slot {
    /// Pending surface buffer
    pub surface: Option<Arc<SurfaceBuffer>>,
    /// Pending layer buffers, in accepted-layer order
    pub layer_buffers: Vec<BufferHandle>,
    /// List the pending layer buffers belong to
    pub layer_list: Option<LayerListId>,
    /// Next present carries the accepted layer buffers along
    pub surface_with_layers: bool,
    /// Target size, cleared on teardown
    pub size: Option<Size>,
    pub stopped: bool,
    in_flight: bool,
}

impl Slot {
    pub fn is_occupied(&self) -> bool {
        self.surface.is_some() || self.layer_list.is_some()
    }
}

/// A frame taken out of the slot
#[derive(Debug)]
pub(crate) enum Pending {
    Surface(Arc<SurfaceBuffer>),
    LayerList {
        id: LayerListId,
        buffers: Vec<BufferHandle>,
        surface: Option<Arc<SurfaceBuffer>>,
    },
}

impl Pending {
    fn take(slot: &mut Slot) -> Option<Self> {
        let surface = slot.surface.take();
        match slot.layer_list.take() {
            Some(id) => Some(Pending::LayerList {
                id,
                buffers: std::mem::take(&mut slot.layer_buffers),
                surface,
            }),
            None => surface.map(Pending::Surface),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Handoff {
    slot: Mutex<Slot>,
    vacated: Condvar,
}

impl Handoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock()
    }

    /// Block until the slot is free and nothing is being composed
    pub fn wait_vacant(&self, slot: &mut MutexGuard<'_, Slot>) -> HwcResult<()> {
        while !slot.stopped && (slot.is_occupied() || slot.in_flight) {
            self.vacated.wait(slot);
        }
        if slot.stopped {
            return Err(HwcError::Stopped);
        }
        Ok(())
    }

    /// Take the pending frame for composition
    pub fn take_pending(&self) -> Option<(Pending, Option<Size>)> {
        let mut slot = self.slot.lock();
        let pending = Pending::take(&mut slot)?;
        slot.in_flight = true;
        Some((pending, slot.size))
    }

    /// The taken frame is done; wake blocked producers
    pub fn complete(&self) {
        self.slot.lock().in_flight = false;
        self.vacated.notify_all();
    }

    /// Empty the slot without composing, returning what was abandoned
    pub fn flush(&self) -> Option<Pending> {
        let pending = Pending::take(&mut self.slot.lock());
        self.vacated.notify_all();
        pending
    }

    /// Refuse further frames and wake every waiter
    pub fn stop(&self) {
        let mut slot = self.slot.lock();
        slot.stopped = true;
        slot.in_flight = false;
        slot.surface_with_layers = false;
        drop(slot);
        self.vacated.notify_all();
    }
}
