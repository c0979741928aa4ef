//! Hardware composer port
//!
//! The physical composition device is an external collaborator. This module
//! defines the contract the composition thread consumes; device discovery
//! and the vendor implementation live outside this crate.

use std::fmt;
use std::sync::Arc;

use crate::contents::DisplayContents;
use crate::error::PortResult;

/// Display index understood by the hardware composer
pub type DisplayId = u32;

/// Hardware events that can be toggled with `event_control`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HwcEvent {
    Vsync,
}

type InvalidateFn = Arc<dyn Fn() + Send + Sync>;
type HotplugFn = Arc<dyn Fn(DisplayId, bool) + Send + Sync>;
type VsyncFn = Arc<dyn Fn(DisplayId, i64) + Send + Sync>;

/// Callbacks handed to the hardware composer at initialization
///
/// The hardware may invoke these from its own threads.
#[derive(Clone)]
pub struct HwcProcs {
    invalidate: InvalidateFn,
    hotplug: HotplugFn,
    vsync: VsyncFn,
}

impl Default for HwcProcs {
    fn default() -> Self {
        Self {
            invalidate: Arc::new(|| log::debug!("hwc callback: invalidate")),
            hotplug: Arc::new(|display, connected| {
                log::debug!("hwc callback: hotplug display={} connected={}", display, connected)
            }),
            vsync: Arc::new(|display, timestamp| {
                log::trace!("hwc callback: vsync display={} timestamp={}", display, timestamp)
            }),
        }
    }
}

impl HwcProcs {
    /// Replace the invalidate handler
    pub fn with_invalidate<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.invalidate = Arc::new(f);
        self
    }

    /// Replace the hotplug handler
    pub fn with_hotplug<F>(mut self, f: F) -> Self
    where
        F: Fn(DisplayId, bool) + Send + Sync + 'static,
    {
        self.hotplug = Arc::new(f);
        self
    }

    /// Replace the vsync handler (timestamp in nanoseconds)
    pub fn with_vsync<F>(mut self, f: F) -> Self
    where
        F: Fn(DisplayId, i64) + Send + Sync + 'static,
    {
        self.vsync = Arc::new(f);
        self
    }

    /// Hardware requests a full recomposition
    pub fn invalidate(&self) {
        (self.invalidate)()
    }

    pub fn hotplug(&self, display: DisplayId, connected: bool) {
        (self.hotplug)(display, connected)
    }

    pub fn vsync(&self, display: DisplayId, timestamp: i64) {
        (self.vsync)(display, timestamp)
    }
}

impl fmt::Debug for HwcProcs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HwcProcs").finish_non_exhaustive()
    }
}

/// The hardware composer device
///
/// Only the composition thread calls into the port.
pub trait HardwareComposer: Send {
    /// Install event callbacks
    fn register_procs(&mut self, procs: HwcProcs);

    /// Enable or disable a hardware event
    fn event_control(&mut self, display: DisplayId, event: HwcEvent, enabled: bool) -> PortResult;

    /// Validate contents and resolve each layer's composition type
    fn prepare(&mut self, display: DisplayId, contents: &mut DisplayContents) -> PortResult;

    /// Commit validated contents, filling in release and retire fences
    fn set(&mut self, display: DisplayId, contents: &mut DisplayContents) -> PortResult;

    /// Blank (`true`) or unblank the display
    fn blank(&mut self, display: DisplayId, blank: bool) -> PortResult;

    /// Close the device
    fn close(&mut self) -> PortResult;
}
