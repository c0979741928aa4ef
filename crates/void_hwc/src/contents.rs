//! Hardware-facing display contents
//!
//! [`DisplayContents`] is what the hardware composer validates and commits.
//! It always ends with a framebuffer target layer, even when nothing is
//! rendered into it.

use std::fmt;

use crate::buffer::BufferHandle;
use crate::fence::Fence;
use crate::layer::Layer;
use crate::Rect;

/// How a layer is composed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositionType {
    /// Composed by the GPU into the framebuffer target
    Framebuffer,
    /// Scanned out directly by the hardware
    Overlay,
    /// The GPU framebuffer destination
    FramebufferTarget,
}

/// Layer blending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Blending {
    None,
    #[default]
    Premultiplied,
    Coverage,
}

/// A layer as seen by the hardware composer
#[derive(Debug)]
pub struct HwLayer {
    pub handle: Option<BufferHandle>,
    pub composition_type: CompositionType,
    /// Geometry changed since the last commit
    pub geometry_changed: bool,
    pub blending: Blending,
    pub transform: u32,
    pub plane_alpha: u8,
    pub source_crop: Rect,
    pub display_frame: Rect,
    pub visible_region: Vec<Rect>,
    /// Hardware must wait on this before reading the buffer
    pub acquire_fence: Option<Fence>,
    /// Set by the hardware on commit; signals when the buffer may be reused
    pub release_fence: Option<Fence>,
}

impl HwLayer {
    /// Populate a layer with fresh geometry
    pub fn new(
        display_frame: Rect,
        source_crop: Rect,
        handle: Option<BufferHandle>,
        composition_type: CompositionType,
    ) -> Self {
        Self {
            handle,
            composition_type,
            geometry_changed: true,
            blending: Blending::Premultiplied,
            transform: 0,
            plane_alpha: 0xff,
            source_crop,
            display_frame,
            visible_region: vec![display_frame],
            acquire_fence: None,
            release_fence: None,
        }
    }

    /// Build a hardware layer from a requested one
    pub fn from_layer(layer: &Layer) -> Self {
        Self::new(layer.target, layer.source, layer.handle, CompositionType::Framebuffer)
    }

    /// Swap in a new buffer for the next commit
    pub fn update(&mut self, acquire_fence: Option<Fence>, handle: Option<BufferHandle>) {
        self.handle = handle;
        self.acquire_fence = acquire_fence;
        self.release_fence = None;
        self.geometry_changed = true;
    }

    pub fn is_target(&self) -> bool {
        self.composition_type == CompositionType::FramebufferTarget
    }
}

/// A full composition request for one display
#[derive(Debug)]
pub struct DisplayContents {
    pub layers: Vec<HwLayer>,
    /// Set by the hardware on commit; signals when the whole frame is retired
    pub retire_fence: Option<Fence>,
    pub geometry_changed: bool,
}

impl DisplayContents {
    /// Create contents from layers; the last layer must be the target
    pub fn new(layers: Vec<HwLayer>) -> Self {
        debug_assert!(layers.last().map_or(false, HwLayer::is_target));
        Self {
            layers,
            retire_fence: None,
            geometry_changed: true,
        }
    }

    /// Single full-screen layer used for plain surface composition
    pub fn surface_only(screen: Rect) -> Self {
        Self::new(vec![HwLayer::new(
            screen,
            screen,
            None,
            CompositionType::FramebufferTarget,
        )])
    }

    /// Layers other than the trailing target
    pub fn composed_layers(&self) -> &[HwLayer] {
        let end = self.layers.len().saturating_sub(1);
        &self.layers[..end]
    }

    /// Index of the first non-target layer the hardware did not take as overlay
    pub fn first_rejected(&self) -> Option<usize> {
        self.composed_layers()
            .iter()
            .position(|l| l.composition_type != CompositionType::Overlay)
    }

    /// Reset per-commit state required by `set`
    pub fn begin_commit(&mut self) {
        self.retire_fence = None;
        self.geometry_changed = true;
    }
}

impl fmt::Display for DisplayContents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "display contents: retire={}, geometry_changed={}, layers={}",
            self.retire_fence.is_some(),
            self.geometry_changed,
            self.layers.len()
        )?;
        for (i, l) in self.layers.iter().enumerate() {
            let handle = l.handle.map_or_else(|| "none".to_string(), |h| h.to_string());
            writeln!(
                f,
                "  - {}: {:?} handle={} src={} dst={} blend={:?} alpha={} acquire={} release={}",
                i,
                l.composition_type,
                handle,
                l.source_crop,
                l.display_frame,
                l.blending,
                l.plane_alpha,
                l.acquire_fence.is_some(),
                l.release_fence.is_some(),
            )?;
        }
        Ok(())
    }
}
