//! Headless hardware composer
//!
//! Software stand-in for the hardware composer device, for development
//! hosts without one and for tests. Validation follows an [`OverlayPolicy`];
//! release fences come from an optional [`Timeline`] so callers decide when
//! buffers are given back. A [`HeadlessProbe`] observes and steers the port
//! after it has been moved into the composer.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::buffer::BufferHandle;
use crate::contents::{CompositionType, DisplayContents, HwLayer};
use crate::error::{PortError, PortResult};
use crate::fence::Timeline;
use crate::port::{DisplayId, HardwareComposer, HwcEvent, HwcProcs};

/// Which layers the headless port takes as overlays
pub enum OverlayPolicy {
    AcceptAll,
    RejectAll,
    /// Accept the first `n` layers
    MaxOverlays(usize),
    Custom(Box<dyn Fn(&HwLayer) -> bool + Send>),
}

impl fmt::Debug for OverlayPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AcceptAll => write!(f, "AcceptAll"),
            Self::RejectAll => write!(f, "RejectAll"),
            Self::MaxOverlays(n) => write!(f, "MaxOverlays({})", n),
            Self::Custom(_) => write!(f, "Custom"),
        }
    }
}

#[derive(Debug)]
struct HeadlessState {
    policy: OverlayPolicy,
    fail_prepare: Option<i32>,
    fail_set: Option<i32>,
    release_timeline: Option<Timeline>,
    procs: Option<HwcProcs>,
    prepare_count: usize,
    set_count: u64,
    commits: Vec<Vec<Option<BufferHandle>>>,
    vsync_enabled: bool,
    blanked: bool,
    closed: bool,
}

#[derive(Debug, Default)]
struct CommitGate {
    paused: bool,
    waiting: usize,
}

#[derive(Debug)]
struct HeadlessShared {
    state: Mutex<HeadlessState>,
    gate: Mutex<CommitGate>,
    gate_changed: Condvar,
}

/// Headless hardware composer port
#[derive(Debug)]
pub struct HeadlessComposer {
    shared: Arc<HeadlessShared>,
}

/// Observation and control handle for a [`HeadlessComposer`]
#[derive(Debug, Clone)]
pub struct HeadlessProbe {
    shared: Arc<HeadlessShared>,
}

impl HeadlessComposer {
    /// Create a port and its probe
    pub fn new(policy: OverlayPolicy) -> (Self, HeadlessProbe) {
        let shared = Arc::new(HeadlessShared {
            state: Mutex::new(HeadlessState {
                policy,
                fail_prepare: None,
                fail_set: None,
                release_timeline: None,
                procs: None,
                prepare_count: 0,
                set_count: 0,
                commits: Vec::new(),
                vsync_enabled: false,
                blanked: false,
                closed: false,
            }),
            gate: Mutex::new(CommitGate::default()),
            gate_changed: Condvar::new(),
        });
        log::info!("headless hardware composer created");
        (
            Self {
                shared: Arc::clone(&shared),
            },
            HeadlessProbe { shared },
        )
    }

    fn pass_gate(&self) {
        let mut gate = self.shared.gate.lock();
        if !gate.paused {
            return;
        }
        gate.waiting += 1;
        self.shared.gate_changed.notify_all();
        while gate.paused {
            self.shared.gate_changed.wait(&mut gate);
        }
        gate.waiting -= 1;
    }
}

impl HardwareComposer for HeadlessComposer {
    fn register_procs(&mut self, procs: HwcProcs) {
        self.shared.state.lock().procs = Some(procs);
    }

    fn event_control(&mut self, display: DisplayId, event: HwcEvent, enabled: bool) -> PortResult {
        log::debug!("headless: display {} {:?} enabled={}", display, event, enabled);
        match event {
            HwcEvent::Vsync => self.shared.state.lock().vsync_enabled = enabled,
        }
        Ok(())
    }

    fn prepare(&mut self, _display: DisplayId, contents: &mut DisplayContents) -> PortResult {
        let mut state = self.shared.state.lock();
        state.prepare_count += 1;
        if let Some(status) = state.fail_prepare {
            return Err(PortError::new(status));
        }

        let end = contents.layers.len().saturating_sub(1);
        for (i, layer) in contents.layers[..end].iter_mut().enumerate() {
            let overlay = layer.handle.is_some()
                && match &state.policy {
                    OverlayPolicy::AcceptAll => true,
                    OverlayPolicy::RejectAll => false,
                    OverlayPolicy::MaxOverlays(n) => i < *n,
                    OverlayPolicy::Custom(accept) => accept(&*layer),
                };
            layer.composition_type = if overlay {
                CompositionType::Overlay
            } else {
                CompositionType::Framebuffer
            };
        }
        Ok(())
    }

    fn set(&mut self, _display: DisplayId, contents: &mut DisplayContents) -> PortResult {
        self.pass_gate();

        let mut state = self.shared.state.lock();
        if let Some(status) = state.fail_set {
            return Err(PortError::new(status));
        }
        state.set_count += 1;
        let point = state.set_count;

        for layer in &mut contents.layers {
            layer.acquire_fence = None;
            if layer.handle.is_some() {
                layer.release_fence = state.release_timeline.as_ref().map(|t| t.create_fence(point));
            }
        }
        contents.retire_fence = state.release_timeline.as_ref().map(|t| t.create_fence(point));
        state.commits.push(contents.layers.iter().map(|l| l.handle).collect());
        log::trace!("headless commit {}:\n{}", point, contents);
        Ok(())
    }

    fn blank(&mut self, display: DisplayId, blank: bool) -> PortResult {
        log::debug!("headless: display {} blank={}", display, blank);
        self.shared.state.lock().blanked = blank;
        Ok(())
    }

    fn close(&mut self) -> PortResult {
        self.shared.state.lock().closed = true;
        log::info!("headless hardware composer closed");
        Ok(())
    }
}

impl HeadlessProbe {
    /// Change the overlay policy for later validations
    pub fn set_policy(&self, policy: OverlayPolicy) {
        self.shared.state.lock().policy = policy;
    }

    /// Make every validation fail with `status`, or stop failing with `None`
    pub fn fail_prepare(&self, status: Option<i32>) {
        self.shared.state.lock().fail_prepare = status;
    }

    /// Make every commit fail with `status`, or stop failing with `None`
    pub fn fail_set(&self, status: Option<i32>) {
        self.shared.state.lock().fail_set = status;
    }

    /// Attach release fences to committed buffers.
    ///
    /// Commit `n` (1-based) gets fences at timeline point `n`.
    pub fn use_release_timeline(&self, timeline: Timeline) {
        self.shared.state.lock().release_timeline = Some(timeline);
    }

    /// Block commits until [`resume_commits`](Self::resume_commits)
    pub fn pause_commits(&self) {
        self.shared.gate.lock().paused = true;
    }

    pub fn resume_commits(&self) {
        self.shared.gate.lock().paused = false;
        self.shared.gate_changed.notify_all();
    }

    /// Wait until a commit is held at the paused gate
    pub fn wait_for_blocked_commit(&self) {
        let mut gate = self.shared.gate.lock();
        while gate.waiting == 0 {
            self.shared.gate_changed.wait(&mut gate);
        }
    }

    pub fn prepare_count(&self) -> usize {
        self.shared.state.lock().prepare_count
    }

    /// Number of successful commits
    pub fn set_count(&self) -> u64 {
        self.shared.state.lock().set_count
    }

    /// Buffer handles of every committed frame, layer by layer
    pub fn commits(&self) -> Vec<Vec<Option<BufferHandle>>> {
        self.shared.state.lock().commits.clone()
    }

    pub fn vsync_enabled(&self) -> bool {
        self.shared.state.lock().vsync_enabled
    }

    pub fn is_blanked(&self) -> bool {
        self.shared.state.lock().blanked
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Deliver a vsync event through the registered callbacks.
    ///
    /// Returns false when vsync is disabled or no callbacks are registered.
    pub fn emit_vsync(&self, display: DisplayId, timestamp: i64) -> bool {
        let procs = {
            let state = self.shared.state.lock();
            if !state.vsync_enabled {
                return false;
            }
            state.procs.clone()
        };
        match procs {
            Some(procs) => {
                procs.vsync(display, timestamp);
                true
            }
            None => false,
        }
    }

    /// Ask the owner to recompose, as hardware does after losing a plane
    pub fn emit_invalidate(&self) -> bool {
        let procs = self.shared.state.lock().procs.clone();
        procs.map(|p| p.invalidate()).is_some()
    }
}
