//! Media playback for grid tiles.
//!
//! This module provides:
//! - `MediaBackend` / `MediaElement` - The host's playable nodes
//! - `MediaTile` - Per-tile load/play/error state machine
//! - `StallWatchdog` - One shared checker for stalled playback clocks

pub mod element;
pub mod lifecycle;
pub mod watchdog;

pub use element::{
    ElementOptions, MediaBackend, MediaElement, MediaEvent, MediaEventChannel,
    MediaEventEnvelope, MediaEventSink,
};
pub use lifecycle::{MediaState, MediaTile, TileEffect};
pub use watchdog::{PlaybackSample, StallWatchdog};
