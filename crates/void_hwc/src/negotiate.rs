//! Layer list negotiation
//!
//! The hardware is asked to validate the whole list first. Whenever it
//! rejects any layer, the list is shrunk by one from the back and the GPU
//! surface is switched on to cover what was dropped:
//!
//! ```text
//! trial 1:  [L0 L1 L2]            + target
//! trial 2:  [L0 L1]    + surface  + target
//! trial 3:  [L0]       + surface  + target
//! ```
//!
//! The first trial where every non-target layer becomes an overlay wins.

use crate::buffer::BufferHandle;
use crate::contents::{CompositionType, DisplayContents, HwLayer};
use crate::error::NegotiationFailure;
use crate::layer::LayerList;
use crate::port::{DisplayId, HardwareComposer};
use crate::Rect;

/// Outcome of a successful negotiation
#[derive(Debug)]
pub struct Negotiation {
    /// Contents of the winning trial, reused for every later commit
    pub contents: DisplayContents,
    /// Length of the accepted prefix
    pub accepted: usize,
    /// Validation calls made
    pub trials: usize,
}

impl Negotiation {
    /// Whether the contents carry the GPU surface layer
    pub fn has_surface_layer(&self) -> bool {
        self.contents.layers.len() == self.accepted + 2
    }
}

/// Build the contents for one trial over the first `count` layers.
///
/// `surface` is the buffer shown in the GPU surface layer, present only when
/// the list has EGL rendering enabled.
pub fn build_trial(list: &LayerList, count: usize, surface: Option<BufferHandle>, screen: Rect) -> DisplayContents {
    let mut layers: Vec<HwLayer> = list.layers()[..count].iter().map(HwLayer::from_layer).collect();

    if list.egl_rendering_enabled() {
        layers.push(HwLayer::new(screen, screen, surface, CompositionType::Framebuffer));
    }
    layers.push(HwLayer::new(screen, screen, None, CompositionType::FramebufferTarget));

    DisplayContents::new(layers)
}

/// Find the longest prefix of `list` the hardware takes entirely as overlays.
///
/// On success the accepted layers are flagged in `list`. Any failed trial
/// forces EGL rendering on in `list`.
pub fn negotiate(
    port: &mut dyn HardwareComposer,
    display: DisplayId,
    list: &mut LayerList,
    surface: Option<BufferHandle>,
    screen: Rect,
) -> Result<Negotiation, NegotiationFailure> {
    for layer in list.layers_mut() {
        layer.set_accepted(false);
    }

    let mut count = list.layer_count();
    let mut trials = 0;

    while count > 0 {
        trials += 1;
        let mut contents = build_trial(list, count, surface, screen);

        if let Err(e) = port.prepare(display, &mut contents) {
            log::error!("hwc prepare failed on trial {} with {} layers: {}", trials, count, e);
            return Err(NegotiationFailure::ValidationFailed {
                status: e.status,
                trial: trials,
            });
        }

        match contents.first_rejected() {
            None => {
                for layer in &mut list.layers_mut()[..count] {
                    layer.set_accepted(true);
                }
                log::debug!(
                    "layer list {} accepted {} of {} layers after {} trials (egl: {})",
                    list.id().raw(),
                    count,
                    list.layer_count(),
                    trials,
                    list.egl_rendering_enabled()
                );
                return Ok(Negotiation {
                    contents,
                    accepted: count,
                    trials,
                });
            }
            Some(index) => {
                log::debug!("trial {}: layer {} rejected, shrinking to {}", trials, index, count - 1);
                count -= 1;
                list.set_egl_rendering_enabled(true);
            }
        }
    }

    log::info!("layer list {} not accepted after {} trials", list.id().raw(), trials);
    Err(NegotiationFailure::NothingAccepted { trials })
}
