//! # Void HWC
//!
//! Hardware composer frame scheduling for Void Engine.
//!
//! This crate sits between the renderer and a fixed-function display
//! composer, handling:
//! - Single-slot blocking handoff of rendered frames
//! - A dedicated composition thread driving the hardware
//! - Negotiation of hardware overlay layer lists
//! - Release fence tracking so buffers are reused only once safe
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Renderer (producer thread)                                 │
//! │  ├─ WindowSurface::present(buffer)                          │
//! │  └─ schedule_layer_list / swap_layer_list                   │
//! ├──────────────────────── handoff slot ───────────────────────┤
//! │  void_hwc composition thread (this crate)                   │
//! │  ├─ action queue (initialize, compose, negotiate, cleanup)  │
//! │  ├─ layer list negotiation                                  │
//! │  └─ release fence tracking                                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  HardwareComposer port (prepare / set / blank)              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Platform Support
//!
//! - **Linux/Android**: sync_file fences through [`SyncFile`]
//! - **Everywhere**: [`HeadlessComposer`] with software [`Timeline`] fences

use std::fmt;

pub mod buffer;
pub mod composer;
pub mod config;
pub mod contents;
pub mod error;
pub mod fence;
pub mod fence_tracker;
pub mod frame;
pub mod headless;
pub mod layer;
pub mod negotiate;
pub mod port;

mod handoff;
mod worker;

pub use buffer::{BufferHandle, SurfaceBuffer};
pub use composer::{BufferAvailableFn, HwComposer, ReleaseLayerListFn, SwapMode, WindowSurface};
pub use config::{ConfigError, HwcConfig};
pub use contents::{Blending, CompositionType, DisplayContents, HwLayer};
pub use error::{ContractViolation, FenceError, HwcError, HwcResult, NegotiationFailure, PortError, PortResult};
#[cfg(unix)]
pub use fence::SyncFile;
pub use fence::{Fence, SyncPrimitive, Timeline};
pub use fence_tracker::FenceTracker;
pub use frame::{CompositionStats, FrameOutcome, StatsSnapshot};
pub use headless::{HeadlessComposer, HeadlessProbe, OverlayPolicy};
pub use layer::{Layer, LayerList, LayerListId, ReleaseReason};
pub use port::{DisplayId, HardwareComposer, HwcEvent, HwcProcs};

/// Size of the composition target in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Both dimensions must exceed one pixel
    pub fn is_degenerate(&self) -> bool {
        self.width <= 1 || self.height <= 1
    }
}

/// Integer rectangle in screen or buffer coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    /// Rectangle covering a whole target
    pub fn full(size: Size) -> Self {
        Self::new(
            0,
            0,
            i32::try_from(size.width).unwrap_or(i32::MAX),
            i32::try_from(size.height).unwrap_or(i32::MAX),
        )
    }

    pub fn right(&self) -> i32 {
        self.x.saturating_add(self.width)
    }

    pub fn bottom(&self) -> i32 {
        self.y.saturating_add(self.height)
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}, {}, {}]", self.x, self.y, self.right(), self.bottom())
    }
}
