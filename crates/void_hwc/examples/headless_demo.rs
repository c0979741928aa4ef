//! Headless composition demo
//!
//! Drives the composition thread against the headless hardware composer:
//! a few plain surface frames, then a layer list the hardware can only
//! partly scan out.
//!
//! Run with:
//! ```
//! RUST_LOG=debug cargo run --example headless_demo
//! ```

use std::sync::Arc;
use std::time::Duration;

use void_hwc::{
    BufferHandle, HeadlessComposer, HwComposer, HwcConfig, HwcProcs, Layer, LayerList, OverlayPolicy, Rect,
    SurfaceBuffer, SwapMode, Timeline,
};

fn main() {
    env_logger::init();

    println!("Headless HWC Demo");
    println!("=================\n");

    // The headless port scans out at most two overlays
    let (port, probe) = HeadlessComposer::new(OverlayPolicy::MaxOverlays(2));
    let timeline = Timeline::new();
    probe.use_release_timeline(timeline.clone());

    let composer = match HwComposer::new(Box::new(port), HwcConfig::default(), HwcProcs::default()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to create composer: {}", e);
            return;
        }
    };
    composer.set_buffer_available_callback(|buffer| println!("  buffer {} available", buffer));
    composer.set_release_layer_list_callback(|list, reason| {
        println!("  layer list {} released: {:?}", list.id().raw(), reason)
    });

    let window = match composer.create_window(1920, 1080) {
        Ok(w) => w,
        Err(e) => {
            eprintln!("Failed to create window: {}", e);
            return;
        }
    };
    println!("Window: {}x{} @ {} Hz\n", window.width(), window.height(), composer.refresh_rate());

    println!("Surface frames:");
    for i in 0..3u64 {
        let buffer = Arc::new(SurfaceBuffer::new(BufferHandle::new(0x1000 + i)));
        if let Err(e) = window.present(buffer) {
            eprintln!("  present failed: {}", e);
            return;
        }
        timeline.advance(1);
    }

    println!("\nLayer list:");
    let rect = Rect::new(0, 0, 640, 360);
    let layers = (1..=3).map(|h| Layer::new(BufferHandle::new(h), rect, rect)).collect();
    let list = LayerList::new(layers, false);
    let id = list.id();
    composer.schedule_layer_list(list);

    let mut accepted = None;
    for _ in 0..100 {
        accepted = composer.accepted_layer_list().filter(|l| l.id() == id);
        if accepted.is_some() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    let Some(accepted) = accepted else {
        println!("  layer list was not accepted");
        return;
    };
    println!(
        "  accepted {} of {} layers (GPU surface: {})",
        accepted.accepted_count(),
        accepted.layer_count(),
        accepted.egl_rendering_enabled()
    );

    match composer.swap_layer_list(&accepted) {
        Ok(SwapMode::AwaitingSurface) => {
            let buffer = Arc::new(SurfaceBuffer::new(BufferHandle::new(0x2000)));
            if let Err(e) = window.present(buffer) {
                eprintln!("  present failed: {}", e);
            }
        }
        Ok(SwapMode::Posted) => {}
        Err(e) => eprintln!("  swap failed: {}", e),
    }

    std::thread::sleep(Duration::from_millis(50));
    timeline.advance(1);

    composer.destroy_window();
    drop(composer);

    let commits = probe.commits().len();
    println!("\nCommitted {} frames, device closed: {}", commits, probe.is_closed());
}
