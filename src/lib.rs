//! Virtualized masonry grid for image and video tiles.
//!
//! The grid places tiles into the shortest column, loads media only for tiles
//! near the viewport, keeps playback healthy with a shared stall watchdog and
//! holds the user's view steady while the layout shifts underneath it.
//!
//! Everything runs on one thread against a [`Scheduler`]; host integration
//! happens through a handful of traits (`ScrollContainer`, `RenderSurface`,
//! `StyleSource`, `MediaBackend`). GTK4 adapters live in `ui` behind the
//! `gtk` feature.

pub mod anchor;
pub mod config;
pub mod error;
pub mod grid;
pub mod layout;
pub mod media;
pub mod models;
pub mod scheduler;
pub mod visibility;

#[cfg(feature = "gtk")]
pub mod ui;

#[cfg(test)]
mod testing;

pub use anchor::{AnchorStrategy, ChangeOptions, FocusMode, StableViewAnchor};
pub use config::GridConfig;
pub use error::{GridError, GridResult, MediaErrorCode, PlaybackError};
pub use grid::{AdmissionQuery, LoadReason, MediaGrid, MediaGridBuilder, ScrollContainer, VirtualScroll};
pub use layout::{LayoutResult, LayoutTrigger, RenderSurface, StyleSource, ZoomLevel};
pub use media::{MediaBackend, MediaElement, MediaEvent, MediaState, StallWatchdog};
pub use models::{MediaKind, Rect, TileId, TileInput};
pub use scheduler::{ManualScheduler, Scheduler};
