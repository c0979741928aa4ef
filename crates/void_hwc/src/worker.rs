//! The composition thread
//!
//! A single thread drains a FIFO of [`Action`]s and is the only caller of the
//! hardware port. Frames are taken out of the handoff slot, composed without
//! holding any shared lock, and the slot is released afterwards.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::Receiver;

use crate::buffer::{BufferHandle, SurfaceBuffer};
use crate::composer::Shared;
use crate::contents::{CompositionType, DisplayContents};
use crate::error::{fatal, ContractViolation, PortError};
use crate::fence_tracker::FenceTracker;
use crate::frame::FrameOutcome;
use crate::handoff::Pending;
use crate::layer::{LayerListId, ReleaseReason};
use crate::negotiate::negotiate;
use crate::port::{HardwareComposer, HwcEvent, HwcProcs};
use crate::{Rect, Size};

/// Work items for the composition thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    Initialize(Size),
    Cleanup,
    DisplaySleep,
    DisplayWake,
    CheckLayerList,
    ComposeSurface,
    ComposeLayerList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerState {
    Uninitialized,
    Running,
    Stopped,
}

/// Contents negotiated for the accepted layer list
#[derive(Debug)]
struct AcceptedContents {
    id: LayerListId,
    contents: DisplayContents,
    /// Layers scanned out directly
    accepted: usize,
    /// Slot `accepted` holds the GPU surface
    surface_layer: bool,
}

/// Marks the handoff stopped when the worker exits, panicking or not
struct StopOnExit(Arc<Shared>);

impl Drop for StopOnExit {
    fn drop(&mut self) {
        if thread::panicking() {
            log::error!("composition thread panicked, waking producers");
        }
        self.0.handoff.stop();
    }
}

pub(crate) struct CompositionWorker {
    port: Box<dyn HardwareComposer>,
    shared: Arc<Shared>,
    procs: Option<HwcProcs>,
    state: WorkerState,
    screen: Rect,
    surface_contents: Option<DisplayContents>,
    layer_contents: Option<AcceptedContents>,
    tracker: FenceTracker,
    /// Most recently composed surface buffer, used as negotiation filler
    last_surface_buffer: Option<BufferHandle>,
}

impl CompositionWorker {
    pub fn new(port: Box<dyn HardwareComposer>, shared: Arc<Shared>, procs: HwcProcs) -> Self {
        Self {
            port,
            shared,
            procs: Some(procs),
            state: WorkerState::Uninitialized,
            screen: Rect::default(),
            surface_contents: None,
            layer_contents: None,
            tracker: FenceTracker::new(),
            last_surface_buffer: None,
        }
    }

    /// Process actions until cleanup or until every sender is gone
    pub fn run(mut self, actions: Receiver<Action>) {
        let _guard = StopOnExit(Arc::clone(&self.shared));
        log::info!("composition thread started");

        while let Ok(action) = actions.recv() {
            log::debug!("composition action: {:?}", action);
            match action {
                Action::Initialize(size) => self.initialize(size),
                Action::Cleanup => {
                    self.cleanup();
                    break;
                }
                Action::DisplaySleep => self.blank(true),
                Action::DisplayWake => self.blank(false),
                Action::CheckLayerList => self.check_layer_list(),
                Action::ComposeSurface | Action::ComposeLayerList => self.compose_pending(),
            }
        }

        if self.state == WorkerState::Running {
            log::warn!("action queue closed without cleanup");
            self.cleanup();
        }
        log::info!("composition thread stopped");
    }

    /// Lifecycle calls on the hardware must not fail
    fn hardware_fatal(&self, operation: &'static str, err: PortError) -> ! {
        let violation = ContractViolation::Hardware {
            operation,
            status: err.status,
        };
        if self.shared.config.abort_on_fatal {
            log::error!("fatal: {}", violation);
            std::process::abort();
        }
        fatal(violation)
    }

    fn display(&self) -> u32 {
        self.shared.config.display
    }

    fn initialize(&mut self, size: Size) {
        if size.is_degenerate() {
            fatal(ContractViolation::DegenerateSize {
                width: size.width,
                height: size.height,
            });
        }

        let procs = self.procs.take().unwrap_or_default();
        self.port.register_procs(procs);

        let display = self.display();
        let vsync = self.shared.config.vsync;
        if let Err(e) = self.port.event_control(display, HwcEvent::Vsync, vsync) {
            self.hardware_fatal("eventControl", e);
        }

        self.screen = Rect::full(size);
        self.surface_contents = Some(DisplayContents::surface_only(self.screen));
        self.state = WorkerState::Running;
        log::info!("hwc initialized for {}x{} on display {}", size.width, size.height, display);

        // Lists scheduled before the window existed
        self.check_layer_list();
    }

    fn blank(&mut self, blank: bool) {
        let display = self.display();
        if let Err(e) = self.port.blank(display, blank) {
            self.hardware_fatal("blank", e);
        }
        log::info!("display {} {}", display, if blank { "asleep" } else { "awake" });
    }

    fn cleanup(&mut self) {
        let (accepted, scheduled) = {
            let mut layers = self.shared.layers.lock();
            layers.negotiating = false;
            (layers.accepted.take(), layers.scheduled.take())
        };
        for list in accepted.into_iter().chain(scheduled) {
            self.shared.release_layer_list(list, ReleaseReason::TornDown);
        }
        self.layer_contents = None;
        self.surface_contents = None;

        if let Err(e) = self.port.close() {
            self.hardware_fatal("close", e);
        }

        // The device is closed, nothing reads the buffers anymore
        let shared = &self.shared;
        self.tracker.drain_all(|buffer| shared.buffer_available(buffer));

        self.state = WorkerState::Stopped;
        self.shared.handoff.stop();
        log::info!("hwc cleaned up");
    }

    /// Validate then commit, closing the retire fence
    fn commit(port: &mut dyn HardwareComposer, display: u32, contents: &mut DisplayContents) -> Result<(), PortError> {
        contents.begin_commit();
        if log::log_enabled!(log::Level::Trace) {
            log::trace!("before prepare: {}", contents);
        }
        port.prepare(display, contents).map_err(|e| {
            log::error!("hwc prepare failed: {}", e);
            e
        })?;
        port.set(display, contents).map_err(|e| {
            log::error!("hwc set failed: {}", e);
            e
        })?;
        if log::log_enabled!(log::Level::Trace) {
            log::trace!("after set: {}", contents);
        }
        drop(contents.retire_fence.take());
        Ok(())
    }

    fn compose_pending(&mut self) {
        let Some((pending, size)) = self.shared.handoff.take_pending() else {
            log::debug!("nothing pending, frame was flushed");
            return;
        };

        let outcome = if size.is_none() || self.state != WorkerState::Running {
            log::warn!("window gone, dropping frame");
            self.shared.abandon(pending);
            FrameOutcome::Dropped
        } else {
            match pending {
                Pending::Surface(buffer) => self.compose_surface(&buffer),
                Pending::LayerList { id, buffers, surface } => self.compose_layer_list(id, buffers, surface),
            }
        };

        if outcome == FrameOutcome::Composed {
            self.shared.stats.record_frame(outcome);
        }
        self.shared.handoff.complete();

        // Producers are already released; buffers the commit replaced are
        // due to come off screen
        if self.tracker.lingering() > 0 {
            let shared = &self.shared;
            self.tracker
                .sync_and_close(shared.config.fence_timeout(), |b| shared.buffer_available(b));
        }
    }

    fn compose_surface(&mut self, buffer: &SurfaceBuffer) -> FrameOutcome {
        let display = self.display();
        let Some(contents) = self.surface_contents.as_mut() else {
            buffer.set_release_fence(None);
            self.shared.stats.record_frame(FrameOutcome::Dropped);
            return FrameOutcome::Dropped;
        };

        contents.layers[0].update(buffer.take_acquire_fence(), Some(buffer.handle()));
        if Self::commit(self.port.as_mut(), display, contents).is_err() {
            buffer.set_release_fence(None);
            self.shared.stats.record_frame(FrameOutcome::Dropped);
            return FrameOutcome::Dropped;
        }

        buffer.set_release_fence(contents.layers[0].release_fence.take());
        self.last_surface_buffer = Some(buffer.handle());

        // Layer buffers from an earlier list are off screen now
        self.tracker.supersede();
        FrameOutcome::Composed
    }

    fn compose_layer_list(
        &mut self,
        id: LayerListId,
        buffers: Vec<BufferHandle>,
        surface: Option<Arc<SurfaceBuffer>>,
    ) -> FrameOutcome {
        let display = self.display();
        let shared = &self.shared;

        let accepted = match self.layer_contents.as_mut() {
            Some(accepted) if accepted.id == id && accepted.accepted == buffers.len() => accepted,
            _ => {
                log::warn!("layer list {} is no longer accepted, dropping frame", id.raw());
                shared.abandon(Pending::LayerList { id, buffers, surface });
                return FrameOutcome::Dropped;
            }
        };

        // Never wait here: the previous frame's fences signal only once
        // this frame is on screen
        self.tracker.discard_reposted(&buffers);
        self.tracker.collect_signaled(|b| shared.buffer_available(b));

        let count = accepted.accepted;
        let layers = &mut accepted.contents.layers;
        for (layer, buffer) in layers.iter_mut().zip(&buffers) {
            layer.update(None, Some(*buffer));
            layer.composition_type = CompositionType::Framebuffer;
        }
        if accepted.surface_layer {
            let layer = &mut layers[count];
            match surface.as_deref() {
                Some(surface) => layer.update(surface.take_acquire_fence(), Some(surface.handle())),
                None => layer.update(None, self.last_surface_buffer),
            }
            layer.composition_type = CompositionType::Framebuffer;
        }

        if Self::commit(self.port.as_mut(), display, &mut accepted.contents).is_err() {
            shared.abandon(Pending::LayerList { id, buffers, surface });
            return FrameOutcome::Dropped;
        }

        let layers = &mut accepted.contents.layers;
        if let Some(surface) = surface.as_deref() {
            if accepted.surface_layer {
                surface.set_release_fence(layers[count].release_fence.take());
                self.last_surface_buffer = Some(surface.handle());
            } else {
                surface.set_release_fence(None);
            }
        }
        self.tracker.record(&mut layers[..count], |b| shared.buffer_available(b));
        FrameOutcome::Composed
    }

    fn check_layer_list(&mut self) {
        if self.state != WorkerState::Running {
            log::debug!("layer list check deferred until initialized");
            return;
        }

        let (mut list, previous) = {
            let mut layers = self.shared.layers.lock();
            let Some(list) = layers.scheduled.take() else {
                return;
            };
            layers.negotiating = true;
            (list, layers.accepted.take())
        };

        if let Some(previous) = previous {
            self.layer_contents = None;
            self.shared.release_layer_list(previous, ReleaseReason::Superseded);
        }

        let display = self.display();
        let result = negotiate(self.port.as_mut(), display, &mut list, self.last_surface_buffer, self.screen);
        self.shared
            .stats
            .record_negotiation(result.as_ref().map(|n| n.trials).map_err(|e| *e));

        match result {
            Ok(negotiation) => {
                self.layer_contents = Some(AcceptedContents {
                    id: list.id(),
                    surface_layer: negotiation.has_surface_layer(),
                    accepted: negotiation.accepted,
                    contents: negotiation.contents,
                });
                let mut layers = self.shared.layers.lock();
                layers.accepted = Some(list);
                layers.negotiating = false;
            }
            Err(failure) => {
                log::warn!("layer list {} rejected: {}", list.id().raw(), failure);
                self.shared.layers.lock().negotiating = false;
                self.shared.release_layer_list(list, ReleaseReason::Rejected(failure));
            }
        }
    }
}
