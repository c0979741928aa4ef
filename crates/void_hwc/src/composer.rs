//! Producer-facing hardware composer API
//!
//! [`HwComposer`] owns the composition thread. The renderer gets a
//! [`WindowSurface`] from [`HwComposer::create_window`], which can only
//! present frames; layer lists are scheduled and swapped through the
//! composer itself.
//!
//! Two locks guard the shared state: the handoff slot and the layer list
//! state. When both are needed the handoff slot is locked first, and the
//! layer list lock is never held while waiting on the slot. Owner callbacks
//! are always invoked with neither lock held.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use crate::buffer::{BufferHandle, SurfaceBuffer};
use crate::config::HwcConfig;
use crate::error::{fatal, ContractViolation, HwcError, HwcResult};
use crate::frame::{CompositionStats, FrameOutcome, StatsSnapshot};
use crate::handoff::{Handoff, Pending};
use crate::layer::{LayerList, ReleaseReason};
use crate::port::{HardwareComposer, HwcProcs};
use crate::worker::{Action, CompositionWorker};
use crate::Size;

/// Called when a layer buffer may be reused by its owner
pub type BufferAvailableFn = Arc<dyn Fn(BufferHandle) + Send + Sync>;

/// Called when a layer list is handed back to its owner
pub type ReleaseLayerListFn = Arc<dyn Fn(LayerList, ReleaseReason) + Send + Sync>;

#[derive(Default)]
pub(crate) struct OwnerCallbacks {
    buffer_available: Option<BufferAvailableFn>,
    release_layer_list: Option<ReleaseLayerListFn>,
}

#[derive(Debug, Default)]
pub(crate) struct LayerListState {
    /// Submitted, awaiting negotiation
    pub scheduled: Option<LayerList>,
    /// Negotiated and in use
    pub accepted: Option<LayerList>,
    /// The composition thread is negotiating a list taken from `scheduled`
    pub negotiating: bool,
}

/// State shared between the owner, the window surface and the worker
pub(crate) struct Shared {
    pub config: HwcConfig,
    pub handoff: Handoff,
    pub layers: Mutex<LayerListState>,
    pub stats: CompositionStats,
    callbacks: RwLock<OwnerCallbacks>,
}

impl Shared {
    fn new(config: HwcConfig) -> Self {
        Self {
            config,
            handoff: Handoff::new(),
            layers: Mutex::new(LayerListState::default()),
            stats: CompositionStats::new(),
            callbacks: RwLock::new(OwnerCallbacks::default()),
        }
    }

    /// Tell the owner a layer buffer is free
    pub fn buffer_available(&self, buffer: BufferHandle) {
        let callback = self.callbacks.read().buffer_available.clone();
        self.stats.record_buffer_release();
        match callback {
            Some(callback) => callback(buffer),
            None => log::warn!("buffer {} released with no BufferAvailable callback installed", buffer),
        }
    }

    /// Hand a layer list back to its owner
    pub fn release_layer_list(&self, list: LayerList, reason: ReleaseReason) {
        log::debug!("releasing layer list {} ({:?})", list.id().raw(), reason);
        let callback = self.callbacks.read().release_layer_list.clone();
        self.stats.record_list_release(reason);
        match callback {
            Some(callback) => callback(list, reason),
            None => log::warn!("layer list {} dropped with no ReleaseLayerList callback installed", list.id().raw()),
        }
    }

    /// Give back everything held by a frame that will not be composed
    pub fn abandon(&self, pending: Pending) {
        let (surface, buffers) = match pending {
            Pending::Surface(surface) => (Some(surface), Vec::new()),
            Pending::LayerList { buffers, surface, .. } => (surface, buffers),
        };
        if let Some(surface) = surface {
            surface.set_release_fence(None);
        }
        for buffer in buffers {
            self.buffer_available(buffer);
        }
        self.stats.record_frame(FrameOutcome::Dropped);
    }
}

/// How a swapped layer list reaches the display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapMode {
    /// The layer buffers were posted for composition
    Posted,
    /// The layer buffers go out with the next surface `present`
    AwaitingSurface,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowState {
    None,
    Created,
    Destroyed,
}

/// Everything the worker needs before it is spawned
struct WorkerSeed {
    port: Box<dyn HardwareComposer>,
    actions: Receiver<Action>,
    procs: HwcProcs,
}

/// Hardware composer owner
///
/// All methods take `&self`; share it between threads with an `Arc`.
pub struct HwComposer {
    shared: Arc<Shared>,
    actions: Sender<Action>,
    seed: Mutex<Option<WorkerSeed>>,
    window: Mutex<WindowState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HwComposer {
    /// Create a composer around a hardware port
    pub fn new(port: Box<dyn HardwareComposer>, config: HwcConfig, procs: HwcProcs) -> HwcResult<Self> {
        config.validate()?;
        let (actions, receiver) = unbounded();
        log::info!(
            "hwc composer created (display {}, {} Hz, vsync {})",
            config.display,
            config.refresh_rate,
            config.vsync
        );
        Ok(Self {
            shared: Arc::new(Shared::new(config)),
            actions,
            seed: Mutex::new(Some(WorkerSeed {
                port,
                actions: receiver,
                procs,
            })),
            window: Mutex::new(WindowState::None),
            worker: Mutex::new(None),
        })
    }

    /// Create the single composition window and start the composition thread
    pub fn create_window(&self, width: u32, height: u32) -> HwcResult<WindowSurface> {
        let size = Size::new(width, height);
        if size.is_degenerate() {
            fatal(ContractViolation::DegenerateSize { width, height });
        }

        let mut window = self.window.lock();
        let seed = match (*window, self.seed.lock().take()) {
            (WindowState::None, Some(seed)) => seed,
            _ => fatal(ContractViolation::WindowAlreadyCreated),
        };

        self.shared.handoff.lock().size = Some(size);
        // The receiver is still held by the seed, so this cannot fail
        let _ = self.actions.send(Action::Initialize(size));

        let worker = CompositionWorker::new(seed.port, Arc::clone(&self.shared), seed.procs);
        let receiver = seed.actions;
        let handle = thread::Builder::new()
            .name(self.shared.config.thread_name.clone())
            .spawn(move || worker.run(receiver))
            .map_err(HwcError::Spawn)?;

        *self.worker.lock() = Some(handle);
        *window = WindowState::Created;
        log::info!("hwc window created: {}x{}", width, height);

        Ok(WindowSurface {
            shared: Arc::clone(&self.shared),
            actions: self.actions.clone(),
            size,
        })
    }

    /// Stop composing and shut the hardware down.
    ///
    /// A producer blocked in `present` is woken and gets `HwcError::Stopped`.
    pub fn destroy_window(&self) {
        {
            let mut window = self.window.lock();
            if *window != WindowState::Created {
                return;
            }
            *window = WindowState::Destroyed;
        }
        log::info!("hwc window destroyed");

        if self.actions.send(Action::Cleanup).is_err() {
            log::warn!("composition thread already gone at window teardown");
        }

        let abandoned = {
            let mut slot = self.shared.handoff.lock();
            slot.size = None;
            slot.stopped = true;
            slot.surface_with_layers = false;
            drop(slot);
            self.shared.handoff.flush()
        };
        if let Some(pending) = abandoned {
            log::warn!("pending frame abandoned at window teardown");
            self.shared.abandon(pending);
        }
    }

    /// Blank (`true`) or unblank the display
    pub fn sleep_display(&self, sleep: bool) -> HwcResult<()> {
        if *self.window.lock() != WindowState::Created {
            log::warn!("sleep_display({}) ignored without a window", sleep);
            return Ok(());
        }
        let action = if sleep { Action::DisplaySleep } else { Action::DisplayWake };
        self.actions.send(action).map_err(|_| HwcError::Stopped)
    }

    /// Refresh rate of the display in Hz
    pub fn refresh_rate(&self) -> f32 {
        self.shared.config.refresh_rate
    }

    pub fn config(&self) -> &HwcConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn set_buffer_available_callback<F>(&self, callback: F)
    where
        F: Fn(BufferHandle) + Send + Sync + 'static,
    {
        self.shared.callbacks.write().buffer_available = Some(Arc::new(callback));
    }

    pub fn set_release_layer_list_callback<F>(&self, callback: F)
    where
        F: Fn(LayerList, ReleaseReason) + Send + Sync + 'static,
    {
        self.shared.callbacks.write().release_layer_list = Some(Arc::new(callback));
    }

    /// Submit a layer list for negotiation.
    ///
    /// A list still awaiting negotiation is replaced and released. The
    /// result shows up in [`accepted_layer_list`](Self::accepted_layer_list),
    /// or the list comes back through the release callback.
    pub fn schedule_layer_list(&self, list: LayerList) {
        {
            let callbacks = self.shared.callbacks.read();
            if callbacks.buffer_available.is_none() {
                fatal(ContractViolation::MissingCallback("BufferAvailable"));
            }
            if callbacks.release_layer_list.is_none() {
                fatal(ContractViolation::MissingCallback("ReleaseLayerList"));
            }
        }
        if let Some(index) = list.first_missing_handle() {
            fatal(ContractViolation::MissingBufferHandle(index));
        }

        log::debug!(
            "scheduling layer list {} with {} layers (egl: {})",
            list.id().raw(),
            list.layer_count(),
            list.egl_rendering_enabled()
        );
        let replaced = self.shared.layers.lock().scheduled.replace(list);
        if let Some(old) = replaced {
            self.shared.release_layer_list(old, ReleaseReason::Superseded);
        }

        if self.actions.send(Action::CheckLayerList).is_err() {
            let orphan = self.shared.layers.lock().scheduled.take();
            if let Some(list) = orphan {
                self.shared.release_layer_list(list, ReleaseReason::TornDown);
            }
        }
    }

    /// Snapshot of the accepted layer list
    pub fn accepted_layer_list(&self) -> Option<LayerList> {
        self.shared.layers.lock().accepted.clone()
    }

    /// Put new buffers of the accepted list on screen.
    ///
    /// `list` must be a snapshot of the accepted list with the next buffer
    /// handles filled in. When the list needs GPU rendering the buffers are
    /// shown with the next surface `present`; otherwise they are posted
    /// right away, blocking like `present` while a frame is pending.
    pub fn swap_layer_list(&self, list: &LayerList) -> HwcResult<SwapMode> {
        let mut slot = self.shared.handoff.lock();
        if slot.stopped {
            return Err(HwcError::Stopped);
        }

        let buffers = {
            let mut layers = self.shared.layers.lock();
            if layers.scheduled.is_some() || layers.negotiating {
                fatal(ContractViolation::PendingScheduledList);
            }
            let accepted = match layers.accepted.as_mut() {
                Some(accepted) if accepted.id() == list.id() => accepted,
                _ => fatal(ContractViolation::NotAcceptedList),
            };

            if accepted.egl_rendering_enabled() {
                accepted.copy_handles_from(list);
                slot.surface_with_layers = true;
                return Ok(SwapMode::AwaitingSurface);
            }
            let mut next = accepted.clone();
            next.copy_handles_from(list);
            next.hardware_buffers()
        };

        self.shared.handoff.wait_vacant(&mut slot)?;

        // The slot lock was released while waiting
        {
            let mut layers = self.shared.layers.lock();
            match layers.accepted.as_mut() {
                Some(accepted) if accepted.id() == list.id() => accepted.copy_handles_from(list),
                _ => return Err(HwcError::Superseded(list.id().raw())),
            }
        }
        slot.layer_list = Some(list.id());
        slot.layer_buffers = buffers;
        drop(slot);

        self.actions.send(Action::ComposeLayerList).map_err(|_| HwcError::Stopped)?;
        Ok(SwapMode::Posted)
    }
}

impl Drop for HwComposer {
    fn drop(&mut self) {
        self.destroy_window();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                log::error!("composition thread panicked");
            }
        }
    }
}

/// Present-only handle for the composition window
pub struct WindowSurface {
    shared: Arc<Shared>,
    actions: Sender<Action>,
    size: Size,
}

impl WindowSurface {
    pub fn width(&self) -> u32 {
        self.size.width
    }

    pub fn height(&self) -> u32 {
        self.size.height
    }

    /// Hand a rendered frame to the composition thread.
    ///
    /// Blocks while the previous frame is pending or being composed.
    pub fn present(&self, buffer: Arc<SurfaceBuffer>) -> HwcResult<()> {
        let mut slot = self.shared.handoff.lock();
        self.shared.handoff.wait_vacant(&mut slot)?;
        if slot.is_occupied() {
            fatal(ContractViolation::SlotOccupied);
        }

        let mut action = Action::ComposeSurface;
        if std::mem::take(&mut slot.surface_with_layers) {
            let layers = self.shared.layers.lock();
            if let Some(accepted) = layers.accepted.as_ref() {
                slot.layer_list = Some(accepted.id());
                slot.layer_buffers = accepted.hardware_buffers();
                action = Action::ComposeLayerList;
            }
        }

        log::trace!("presenting surface buffer {}", buffer.handle());
        slot.surface = Some(buffer);
        drop(slot);

        self.shared.stats.record_present();
        self.actions.send(action).map_err(|_| HwcError::Stopped)
    }
}
