//! Masonry layout for the media grid.
//!
//! This module provides:
//! - `MasonryLayout` - Pure shortest-column placement
//! - `MasonryEngine` - Style resolution, memoization and patch diffing
//! - `LayoutCache` - LRU of finished passes keyed by an xxh3 fingerprint
//! - `RenderSurface` - Where placement patches are applied

pub mod layout_cache;
pub mod masonry;
pub mod metrics;
pub mod patch;

pub use layout_cache::LayoutCache;
pub use masonry::{LayoutPass, LayoutResult, LayoutTrigger, MasonryEngine, MasonryLayout};
pub use metrics::{GridStyle, LayoutMetrics, StyleSource, ZoomLevel, ZoomedStyle};
pub use patch::{NodePatch, Patch, PatchTarget, RecordingSurface, RenderSurface};
