//! Application layer lists
//!
//! A [`LayerList`] is the producer's request to put several buffers on
//! screen as independent hardware layers. The list is submitted once, the
//! composition thread negotiates which prefix the hardware can take, and
//! the list is handed back through the release callback when it is no
//! longer referenced.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::buffer::BufferHandle;
use crate::error::{fatal, ContractViolation, NegotiationFailure};
use crate::Rect;

/// Unique identifier for a layer list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerListId(u64);

impl LayerListId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// A single requested layer
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    /// Buffer to scan out
    pub handle: Option<BufferHandle>,
    /// Destination on screen
    pub target: Rect,
    /// Source crop within the buffer
    pub source: Rect,
    accepted: bool,
}

impl Layer {
    /// Create a layer
    pub fn new(handle: BufferHandle, target: Rect, source: Rect) -> Self {
        Self {
            handle: Some(handle),
            target,
            source,
            accepted: false,
        }
    }

    /// Whether the hardware accepted this layer in the last negotiation
    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    pub(crate) fn set_accepted(&mut self, accepted: bool) {
        self.accepted = accepted;
    }
}

/// Ordered layer list, front-most priority first
///
/// Negotiation truncates from the back, so put the layers that matter
/// most for hardware composition first.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerList {
    id: LayerListId,
    layers: Vec<Layer>,
    egl_rendering_enabled: bool,
}

impl LayerList {
    /// Create a list with a fresh identity
    pub fn new(layers: Vec<Layer>, egl_rendering_enabled: bool) -> Self {
        Self {
            id: LayerListId::next(),
            layers,
            egl_rendering_enabled,
        }
    }

    /// List identity, preserved across snapshots
    pub fn id(&self) -> LayerListId {
        self.id
    }

    /// Number of requested layers
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer(&self, index: usize) -> Option<&Layer> {
        self.layers.get(index)
    }

    pub fn layer_mut(&mut self, index: usize) -> Option<&mut Layer> {
        self.layers.get_mut(index)
    }

    /// Whether the GPU-rendered surface is composited alongside the layers
    pub fn egl_rendering_enabled(&self) -> bool {
        self.egl_rendering_enabled
    }

    pub(crate) fn set_egl_rendering_enabled(&mut self, enabled: bool) {
        self.egl_rendering_enabled = enabled;
    }

    pub(crate) fn layers_mut(&mut self) -> &mut [Layer] {
        &mut self.layers
    }

    /// Length of the accepted prefix
    pub fn accepted_count(&self) -> usize {
        self.layers.iter().take_while(|l| l.accepted).count()
    }

    /// Index of the first layer without a buffer handle
    pub fn first_missing_handle(&self) -> Option<usize> {
        self.layers.iter().position(|l| l.handle.is_none())
    }

    /// Buffers of the accepted prefix, in slot order
    pub(crate) fn hardware_buffers(&self) -> Vec<BufferHandle> {
        self.layers
            .iter()
            .take_while(|l| l.accepted)
            .filter_map(|l| l.handle)
            .collect()
    }

    /// Pick up the buffer handles the producer placed in a snapshot
    pub(crate) fn copy_handles_from(&mut self, snapshot: &LayerList) {
        if snapshot.layers.len() != self.layers.len() {
            fatal(ContractViolation::LayerCountMismatch {
                expected: self.layers.len(),
                found: snapshot.layers.len(),
            });
        }
        for (i, (dst, src)) in self.layers.iter_mut().zip(&snapshot.layers).enumerate() {
            if dst.accepted && src.handle.is_none() {
                fatal(ContractViolation::MissingBufferHandle(i));
            }
            dst.handle = src.handle;
        }
    }
}

/// Why a layer list was handed back to its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// A newer list replaced it
    Superseded,
    /// The hardware did not accept it
    Rejected(NegotiationFailure),
    /// The composer shut down
    TornDown,
}
