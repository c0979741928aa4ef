//! Error types for hardware composition
//!
//! Errors fall into two tiers:
//! - [`HwcError`] and [`NegotiationFailure`] are recoverable and travel
//!   through `Result` or alongside a released layer list.
//! - [`ContractViolation`] describes caller misuse. It is never returned;
//!   it is raised through [`fatal`], which terminates with a diagnostic.

use std::fmt;

use thiserror::Error;

use crate::config::ConfigError;

/// Non-zero status reported by the hardware composer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("hardware composer returned status {status}")]
pub struct PortError {
    /// Raw status code (never zero)
    pub status: i32,
}

impl PortError {
    /// Wrap a raw status code
    pub fn new(status: i32) -> Self {
        Self { status }
    }
}

/// Result of a hardware composer call
pub type PortResult = Result<(), PortError>;

/// Recoverable reasons a layer list was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NegotiationFailure {
    /// The validation (prepare) call itself failed
    #[error("validation failed with status {status} on trial {trial}")]
    ValidationFailed { status: i32, trial: usize },

    /// Every candidate prefix was rejected by the hardware
    #[error("no layer accepted by hardware after {trials} trials")]
    NothingAccepted { trials: usize },
}

/// Fence wait errors
#[derive(Debug, Error)]
pub enum FenceError {
    #[error("fence wait failed: {0}")]
    Wait(String),
}

/// Recoverable hardware composer errors
#[derive(Debug, Error)]
pub enum HwcError {
    #[error("composition worker has stopped")]
    Stopped,

    #[error("layer list {0} was replaced before its buffers were posted")]
    Superseded(u64),

    #[error("hardware port error: {0}")]
    Port(#[from] PortError),

    #[error("layer list negotiation failed: {0}")]
    Negotiation(#[from] NegotiationFailure),

    #[error("fence error: {0}")]
    Fence(#[from] FenceError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to spawn composition thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Result type for hardware composer operations
pub type HwcResult<T> = Result<T, HwcError>;

/// Caller misuse that cannot be recovered from
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractViolation {
    #[error("{0} callback has not been installed")]
    MissingCallback(&'static str),

    #[error("missing buffer handle for layer {0}")]
    MissingBufferHandle(usize),

    #[error("submitted list is not the accepted list")]
    NotAcceptedList,

    #[error("layer list swapped while a scheduled list is pending negotiation")]
    PendingScheduledList,

    #[error("swapped list has {found} layers, accepted list has {expected}")]
    LayerCountMismatch { expected: usize, found: usize },

    #[error("a buffer is already pending in the handoff slot")]
    SlotOccupied,

    #[error("target size {width}x{height} is degenerate")]
    DegenerateSize { width: u32, height: u32 },

    #[error("only a single window is supported")]
    WindowAlreadyCreated,

    #[error("hardware {operation} failed with status {status}")]
    Hardware { operation: &'static str, status: i32 },
}

/// Log and raise an unrecoverable diagnostic
///
/// Release builds run with `panic = "abort"`, so this terminates the process.
#[track_caller]
pub fn fatal(violation: impl fmt::Display) -> ! {
    log::error!("fatal: {}", violation);
    panic!("{}", violation);
}
