//! Integration tests for void_hwc against the headless hardware composer

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use void_hwc::*;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

fn test_config() -> HwcConfig {
    HwcConfig {
        abort_on_fatal: false,
        fence_timeout_ms: 50,
        thread_name: "hwc-test".to_string(),
        ..HwcConfig::default()
    }
}

fn layer(handle: u64) -> Layer {
    let rect = Rect::new(0, 0, 320, 240);
    Layer::new(BufferHandle::new(handle), rect, rect)
}

fn layer_list(handles: &[u64], egl: bool) -> LayerList {
    LayerList::new(handles.iter().copied().map(layer).collect(), egl)
}

fn surface(handle: u64) -> Arc<SurfaceBuffer> {
    Arc::new(SurfaceBuffer::new(BufferHandle::new(handle)))
}

fn h(raw: u64) -> Option<BufferHandle> {
    Some(BufferHandle::new(raw))
}

struct Harness {
    composer: HwComposer,
    probe: HeadlessProbe,
    buffers: Arc<Mutex<Vec<BufferHandle>>>,
    lists: Arc<Mutex<Vec<(LayerListId, ReleaseReason)>>>,
}

impl Harness {
    fn new(policy: OverlayPolicy) -> Self {
        Self::with_procs(policy, HwcProcs::default())
    }

    fn with_procs(policy: OverlayPolicy, procs: HwcProcs) -> Self {
        let (port, probe) = HeadlessComposer::new(policy);
        Self::build(Box::new(port), probe, test_config(), procs)
    }

    fn build(port: Box<dyn HardwareComposer>, probe: HeadlessProbe, config: HwcConfig, procs: HwcProcs) -> Self {
        init_logging();
        let composer = HwComposer::new(port, config, procs).unwrap();

        let buffers = Arc::new(Mutex::new(Vec::new()));
        let lists = Arc::new(Mutex::new(Vec::new()));
        {
            let buffers = Arc::clone(&buffers);
            composer.set_buffer_available_callback(move |b| buffers.lock().push(b));
        }
        {
            let lists = Arc::clone(&lists);
            composer.set_release_layer_list_callback(move |list, reason| lists.lock().push((list.id(), reason)));
        }

        Self {
            composer,
            probe,
            buffers,
            lists,
        }
    }

    fn released_buffers(&self) -> Vec<BufferHandle> {
        self.buffers.lock().clone()
    }

    fn released_lists(&self) -> Vec<(LayerListId, ReleaseReason)> {
        self.lists.lock().clone()
    }

    fn wait_accepted(&self, id: LayerListId) -> LayerList {
        assert!(wait_until(|| self.composer.accepted_layer_list().map(|l| l.id()) == Some(id)));
        self.composer.accepted_layer_list().unwrap()
    }
}

/// Signals the release fences of commit N when commit N+1 is set, the way
/// display hardware does once the next frame is on screen
struct LatchingPort {
    inner: HeadlessComposer,
    timeline: Timeline,
    commits: u64,
}

impl HardwareComposer for LatchingPort {
    fn register_procs(&mut self, procs: HwcProcs) {
        self.inner.register_procs(procs);
    }

    fn event_control(&mut self, display: DisplayId, event: HwcEvent, enabled: bool) -> PortResult {
        self.inner.event_control(display, event, enabled)
    }

    fn prepare(&mut self, display: DisplayId, contents: &mut DisplayContents) -> PortResult {
        self.inner.prepare(display, contents)
    }

    fn set(&mut self, display: DisplayId, contents: &mut DisplayContents) -> PortResult {
        self.timeline.signal_to(self.commits);
        self.inner.set(display, contents)?;
        self.commits += 1;
        Ok(())
    }

    fn blank(&mut self, display: DisplayId, blank: bool) -> PortResult {
        self.inner.blank(display, blank)
    }

    fn close(&mut self) -> PortResult {
        self.inner.close()
    }
}

/// Lets a held commit through when the test unwinds
struct ResumeCommits(HeadlessProbe);

impl Drop for ResumeCommits {
    fn drop(&mut self) {
        self.0.resume_commits();
    }
}

#[test]
fn test_present_composes_surface() {
    let harness = Harness::new(OverlayPolicy::AcceptAll);
    let window = harness.composer.create_window(1280, 720).unwrap();
    assert_eq!((window.width(), window.height()), (1280, 720));

    window.present(surface(0xa)).unwrap();
    assert!(wait_until(|| harness.composer.stats().frames_composed == 1));

    assert_eq!(harness.probe.commits(), vec![vec![h(0xa)]]);
    assert_eq!(harness.composer.stats().frames_presented, 1);
    assert!(harness.probe.vsync_enabled());
}

#[test]
fn test_second_present_blocks_until_composed() {
    let harness = Harness::new(OverlayPolicy::AcceptAll);
    let window = Arc::new(harness.composer.create_window(640, 480).unwrap());

    harness.probe.pause_commits();
    window.present(surface(1)).unwrap();
    harness.probe.wait_for_blocked_commit();

    let producer = {
        let window = Arc::clone(&window);
        thread::spawn(move || window.present(surface(2)))
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!producer.is_finished());
    assert_eq!(harness.probe.set_count(), 0);

    harness.probe.resume_commits();
    producer.join().unwrap().unwrap();
    assert!(wait_until(|| harness.probe.set_count() == 2));
    assert_eq!(harness.probe.commits(), vec![vec![h(1)], vec![h(2)]]);
}

#[test]
fn test_surface_release_fence_round_trip() {
    let harness = Harness::new(OverlayPolicy::AcceptAll);
    let timeline = Timeline::new();
    harness.probe.use_release_timeline(timeline.clone());
    let window = harness.composer.create_window(640, 480).unwrap();

    let buffer = surface(7);
    window.present(Arc::clone(&buffer)).unwrap();
    assert!(wait_until(|| harness.composer.stats().frames_composed == 1));

    assert!(buffer.has_release_fence());
    assert!(!buffer.wait_for_release(Some(Duration::from_millis(5))).unwrap());

    timeline.signal_to(1);
    assert!(buffer.wait_for_release(None).unwrap());
}

#[test]
fn test_layer_list_accepted_and_swapped() {
    let harness = Harness::new(OverlayPolicy::AcceptAll);
    let _window = harness.composer.create_window(1920, 1080).unwrap();

    let list = layer_list(&[1, 2, 3], false);
    let id = list.id();
    harness.composer.schedule_layer_list(list);

    let accepted = harness.wait_accepted(id);
    assert_eq!(accepted.accepted_count(), 3);
    assert!(!accepted.egl_rendering_enabled());

    assert_eq!(harness.composer.swap_layer_list(&accepted).unwrap(), SwapMode::Posted);
    assert!(wait_until(|| harness.probe.set_count() == 1));
    assert_eq!(harness.probe.commits(), vec![vec![h(1), h(2), h(3), None]]);

    // No release fences: every buffer is available right after the commit
    assert!(wait_until(|| harness.released_buffers().len() == 3));
    assert_eq!(
        harness.released_buffers(),
        vec![BufferHandle::new(1), BufferHandle::new(2), BufferHandle::new(3)]
    );

    let stats = harness.composer.stats();
    assert_eq!(stats.negotiations, 1);
    assert_eq!(stats.trial_compositions, 1);
    assert_eq!(stats.layer_lists_accepted, 1);
}

#[test]
fn test_buffer_available_deferred_until_fence_signals() {
    let harness = Harness::new(OverlayPolicy::AcceptAll);
    let timeline = Timeline::new();
    harness.probe.use_release_timeline(timeline.clone());
    let _window = harness.composer.create_window(1920, 1080).unwrap();

    let list = layer_list(&[0x10], false);
    let id = list.id();
    harness.composer.schedule_layer_list(list);
    let mut snapshot = harness.wait_accepted(id);

    harness.composer.swap_layer_list(&snapshot).unwrap();
    assert!(wait_until(|| harness.composer.stats().frames_composed == 1));
    thread::sleep(Duration::from_millis(20));
    assert!(harness.released_buffers().is_empty());

    timeline.signal_to(1);
    snapshot.layer_mut(0).unwrap().handle = h(0x11);
    harness.composer.swap_layer_list(&snapshot).unwrap();
    assert!(wait_until(|| harness.composer.stats().frames_composed == 2));
    assert_eq!(harness.released_buffers(), vec![BufferHandle::new(0x10)]);

    // Teardown hands back what is still fenced
    drop(harness.composer);
    assert_eq!(
        harness.buffers.lock().clone(),
        vec![BufferHandle::new(0x10), BufferHandle::new(0x11)]
    );
}

#[test]
fn test_layer_commit_does_not_wait_on_fences_it_retires() {
    let (inner, probe) = HeadlessComposer::new(OverlayPolicy::AcceptAll);
    let timeline = Timeline::new();
    probe.use_release_timeline(timeline.clone());
    let port = LatchingPort {
        inner,
        timeline,
        commits: 0,
    };
    let config = HwcConfig {
        fence_timeout_ms: 2_000,
        ..test_config()
    };
    let harness = Harness::build(Box::new(port), probe, config, HwcProcs::default());
    let _window = harness.composer.create_window(1920, 1080).unwrap();

    let list = layer_list(&[1], false);
    let id = list.id();
    harness.composer.schedule_layer_list(list);
    let mut snapshot = harness.wait_accepted(id);

    let started = Instant::now();
    for handle in [1, 2, 3] {
        snapshot.layer_mut(0).unwrap().handle = h(handle);
        harness.composer.swap_layer_list(&snapshot).unwrap();
    }
    assert!(wait_until(|| harness.released_buffers().len() == 2));
    assert!(started.elapsed() < Duration::from_millis(1_000));

    assert_eq!(harness.probe.set_count(), 3);
    assert_eq!(
        harness.probe.commits(),
        vec![vec![h(1), None], vec![h(2), None], vec![h(3), None]]
    );
    assert_eq!(harness.released_buffers(), vec![BufferHandle::new(1), BufferHandle::new(2)]);
}

#[test]
fn test_failed_swap_keeps_accepted_handles() {
    let harness = Harness::new(OverlayPolicy::AcceptAll);
    let window = harness.composer.create_window(1920, 1080).unwrap();

    let list = layer_list(&[1], false);
    let id = list.id();
    harness.composer.schedule_layer_list(list);
    let mut snapshot = harness.wait_accepted(id);
    snapshot.layer_mut(0).unwrap().handle = h(2);

    harness.probe.pause_commits();
    let _resume = ResumeCommits(harness.probe.clone());
    window.present(surface(0x100)).unwrap();
    harness.probe.wait_for_blocked_commit();

    thread::scope(|s| {
        let swapper = s.spawn(|| harness.composer.swap_layer_list(&snapshot));
        thread::sleep(Duration::from_millis(50));
        assert!(!swapper.is_finished());

        harness.composer.destroy_window();
        assert!(matches!(swapper.join().unwrap(), Err(HwcError::Stopped)));
    });

    // The worker is still held in the surface commit, so the list is not torn down yet
    let accepted = harness.composer.accepted_layer_list().unwrap();
    assert_eq!(accepted.layer(0).unwrap().handle, h(1));
}

#[test]
fn test_reposted_buffer_not_released_early() {
    let harness = Harness::new(OverlayPolicy::AcceptAll);
    let timeline = Timeline::new();
    harness.probe.use_release_timeline(timeline.clone());
    let _window = harness.composer.create_window(1920, 1080).unwrap();

    let list = layer_list(&[0x20], false);
    let id = list.id();
    harness.composer.schedule_layer_list(list);
    let snapshot = harness.wait_accepted(id);

    harness.composer.swap_layer_list(&snapshot).unwrap();
    harness.composer.swap_layer_list(&snapshot).unwrap();
    assert!(wait_until(|| harness.composer.stats().frames_composed == 2));

    // The first fence was closed without notifying; the buffer is on screen again
    assert!(harness.released_buffers().is_empty());
}

#[test]
#[should_panic(expected = "submitted list is not the accepted list")]
fn test_swap_non_accepted_list_panics() {
    let harness = Harness::new(OverlayPolicy::AcceptAll);
    let stranger = layer_list(&[1], false);
    let _ = harness.composer.swap_layer_list(&stranger);
}

#[test]
fn test_superseded_list_released_before_next_negotiation() {
    let harness = Harness::new(OverlayPolicy::AcceptAll);
    let prepares_at_release = Arc::new(Mutex::new(Vec::new()));
    {
        let lists = Arc::clone(&harness.lists);
        let probe = harness.probe.clone();
        let seen = Arc::clone(&prepares_at_release);
        harness.composer.set_release_layer_list_callback(move |list, reason| {
            seen.lock().push(probe.prepare_count());
            lists.lock().push((list.id(), reason));
        });
    }
    let _window = harness.composer.create_window(1920, 1080).unwrap();

    let a = layer_list(&[1, 2], false);
    let a_id = a.id();
    harness.composer.schedule_layer_list(a);
    harness.wait_accepted(a_id);

    let b = layer_list(&[3], false);
    let b_id = b.id();
    harness.composer.schedule_layer_list(b);
    harness.wait_accepted(b_id);

    assert_eq!(harness.released_lists(), vec![(a_id, ReleaseReason::Superseded)]);
    // Only list A had been validated when it was released
    assert_eq!(*prepares_at_release.lock(), vec![1]);
}

#[test]
fn test_schedule_replaces_list_awaiting_negotiation() {
    let harness = Harness::new(OverlayPolicy::AcceptAll);
    let a = layer_list(&[1], false);
    let a_id = a.id();
    let b = layer_list(&[2, 3], false);
    let b_id = b.id();

    harness.composer.schedule_layer_list(a);
    harness.composer.schedule_layer_list(b);
    assert_eq!(harness.released_lists(), vec![(a_id, ReleaseReason::Superseded)]);

    let _window = harness.composer.create_window(1920, 1080).unwrap();
    let accepted = harness.wait_accepted(b_id);
    assert_eq!(accepted.accepted_count(), 2);

    assert_eq!(harness.released_lists(), vec![(a_id, ReleaseReason::Superseded)]);
    assert_eq!(harness.composer.stats().negotiations, 1);
}

#[test]
#[should_panic(expected = "layer list swapped while a scheduled list is pending negotiation")]
fn test_swap_while_list_scheduled_panics() {
    let harness = Harness::new(OverlayPolicy::AcceptAll);
    let window = harness.composer.create_window(1920, 1080).unwrap();

    // Hold the worker in a commit so the list stays scheduled
    harness.probe.pause_commits();
    let _resume = ResumeCommits(harness.probe.clone());
    window.present(surface(1)).unwrap();
    harness.probe.wait_for_blocked_commit();

    let list = layer_list(&[1], false);
    let snapshot = list.clone();
    harness.composer.schedule_layer_list(list);
    let _ = harness.composer.swap_layer_list(&snapshot);
}

#[test]
fn test_rejected_layer_falls_back_to_egl() {
    let policy = OverlayPolicy::Custom(Box::new(|l| l.handle != Some(BufferHandle::new(3))));
    let harness = Harness::new(policy);
    let window = harness.composer.create_window(1920, 1080).unwrap();

    // Gives negotiation a surface buffer to fill the GPU layer with
    window.present(surface(0x100)).unwrap();
    assert!(wait_until(|| harness.composer.stats().frames_composed == 1));

    let list = layer_list(&[1, 2, 3], false);
    let id = list.id();
    harness.composer.schedule_layer_list(list);
    let accepted = harness.wait_accepted(id);

    assert_eq!(accepted.accepted_count(), 2);
    assert!(accepted.egl_rendering_enabled());
    assert!(!accepted.layer(2).unwrap().is_accepted());
    assert_eq!(harness.composer.stats().trial_compositions, 2);

    assert_eq!(harness.composer.swap_layer_list(&accepted).unwrap(), SwapMode::AwaitingSurface);
    window.present(surface(0x101)).unwrap();
    assert!(wait_until(|| harness.composer.stats().frames_composed == 2));
    assert_eq!(harness.probe.commits()[1], vec![h(1), h(2), h(0x101), None]);
    assert_eq!(harness.released_buffers(), vec![BufferHandle::new(1), BufferHandle::new(2)]);

    // Without another swap the next present is a plain surface frame
    window.present(surface(0x102)).unwrap();
    assert!(wait_until(|| harness.composer.stats().frames_composed == 3));
    assert_eq!(harness.probe.commits()[2], vec![h(0x102)]);
}

#[test]
fn test_all_rejected_list_released() {
    let harness = Harness::new(OverlayPolicy::RejectAll);
    let _window = harness.composer.create_window(1920, 1080).unwrap();

    let list = layer_list(&[1, 2, 3], false);
    let id = list.id();
    harness.composer.schedule_layer_list(list);

    assert!(wait_until(|| !harness.released_lists().is_empty()));
    assert_eq!(
        harness.released_lists(),
        vec![(id, ReleaseReason::Rejected(NegotiationFailure::NothingAccepted { trials: 3 }))]
    );
    assert!(harness.composer.accepted_layer_list().is_none());
    assert_eq!(harness.probe.prepare_count(), 3);
    assert_eq!(harness.composer.stats().layer_lists_rejected, 1);
}

#[test]
fn test_validation_failure_releases_list() {
    let harness = Harness::new(OverlayPolicy::AcceptAll);
    harness.probe.fail_prepare(Some(-22));
    let window = harness.composer.create_window(1920, 1080).unwrap();

    let list = layer_list(&[1], true);
    let id = list.id();
    harness.composer.schedule_layer_list(list);

    assert!(wait_until(|| !harness.released_lists().is_empty()));
    assert_eq!(
        harness.released_lists(),
        vec![(id, ReleaseReason::Rejected(NegotiationFailure::ValidationFailed { status: -22, trial: 1 }))]
    );

    // The composer keeps running
    harness.probe.fail_prepare(None);
    window.present(surface(9)).unwrap();
    assert!(wait_until(|| harness.composer.stats().frames_composed == 1));
}

#[test]
fn test_list_scheduled_before_window() {
    let harness = Harness::new(OverlayPolicy::AcceptAll);
    let list = layer_list(&[5], false);
    let id = list.id();
    harness.composer.schedule_layer_list(list);

    let _window = harness.composer.create_window(800, 600).unwrap();
    let accepted = harness.wait_accepted(id);
    assert_eq!(accepted.accepted_count(), 1);
}

#[test]
fn test_commit_failure_drops_frame() {
    let harness = Harness::new(OverlayPolicy::AcceptAll);
    let window = harness.composer.create_window(640, 480).unwrap();

    harness.probe.fail_set(Some(-5));
    let buffer = surface(1);
    window.present(Arc::clone(&buffer)).unwrap();
    assert!(wait_until(|| harness.composer.stats().frames_dropped == 1));
    assert!(!buffer.has_release_fence());

    harness.probe.fail_set(None);
    window.present(surface(2)).unwrap();
    assert!(wait_until(|| harness.composer.stats().frames_composed == 1));
}

#[test]
fn test_destroy_window_wakes_blocked_producer() {
    let harness = Harness::new(OverlayPolicy::AcceptAll);
    let window = Arc::new(harness.composer.create_window(640, 480).unwrap());

    harness.probe.pause_commits();
    window.present(surface(1)).unwrap();
    harness.probe.wait_for_blocked_commit();

    let producer = {
        let window = Arc::clone(&window);
        thread::spawn(move || window.present(surface(2)))
    };

    harness.composer.destroy_window();
    assert!(matches!(producer.join().unwrap(), Err(HwcError::Stopped)));
    assert!(matches!(window.present(surface(3)), Err(HwcError::Stopped)));

    harness.probe.resume_commits();
    assert!(wait_until(|| harness.probe.is_closed()));
}

#[test]
fn test_teardown_releases_accepted_list() {
    let harness = Harness::new(OverlayPolicy::AcceptAll);
    let _window = harness.composer.create_window(1920, 1080).unwrap();

    let list = layer_list(&[1], false);
    let id = list.id();
    harness.composer.schedule_layer_list(list);
    harness.wait_accepted(id);

    let probe = harness.probe.clone();
    let lists = Arc::clone(&harness.lists);
    drop(harness.composer);

    assert!(probe.is_closed());
    assert_eq!(*lists.lock(), vec![(id, ReleaseReason::TornDown)]);
}

#[test]
fn test_sleep_and_vsync() {
    let last_vsync = Arc::new(AtomicI64::new(0));
    let procs = {
        let last_vsync = Arc::clone(&last_vsync);
        HwcProcs::default().with_vsync(move |_, ts| last_vsync.store(ts, Ordering::SeqCst))
    };
    let harness = Harness::with_procs(OverlayPolicy::AcceptAll, procs);
    let _window = harness.composer.create_window(1920, 1080).unwrap();
    assert!(wait_until(|| harness.probe.vsync_enabled()));

    assert!(harness.probe.emit_vsync(0, 16_666_667));
    assert_eq!(last_vsync.load(Ordering::SeqCst), 16_666_667);

    harness.composer.sleep_display(true).unwrap();
    assert!(wait_until(|| harness.probe.is_blanked()));
    harness.composer.sleep_display(false).unwrap();
    assert!(wait_until(|| !harness.probe.is_blanked()));
    assert!((harness.composer.refresh_rate() - 60.0).abs() < f32::EPSILON);
}

#[test]
#[should_panic(expected = "BufferAvailable callback has not been installed")]
fn test_schedule_without_callbacks_panics() {
    init_logging();
    let (port, _probe) = HeadlessComposer::new(OverlayPolicy::AcceptAll);
    let composer = HwComposer::new(Box::new(port), test_config(), HwcProcs::default()).unwrap();
    composer.schedule_layer_list(layer_list(&[1], false));
}

#[test]
#[should_panic(expected = "missing buffer handle for layer 1")]
fn test_schedule_missing_handle_panics() {
    let harness = Harness::new(OverlayPolicy::AcceptAll);
    let mut list = layer_list(&[1, 2], false);
    list.layer_mut(1).unwrap().handle = None;
    harness.composer.schedule_layer_list(list);
}

#[test]
#[should_panic(expected = "only a single window is supported")]
fn test_second_window_panics() {
    let harness = Harness::new(OverlayPolicy::AcceptAll);
    let _first = harness.composer.create_window(640, 480).unwrap();
    let _second = harness.composer.create_window(640, 480);
}

#[test]
#[should_panic(expected = "target size 1x480 is degenerate")]
fn test_degenerate_window_panics() {
    let harness = Harness::new(OverlayPolicy::AcceptAll);
    let _ = harness.composer.create_window(1, 480);
}
