//! Stable view anchoring.
//!
//! This module provides:
//! - `resolve_target` / `measure` - Picking and measuring the focal tile(s)
//! - `StableViewAnchor` - Scroll compensation around layout changes

pub mod measure;
pub mod stable_view;

pub use measure::{
    measure, resolve_target, AnchorGeometry, AnchorKind, AnchorMeasurement, AnchorStrategy,
    AnchorTarget, SelectionSource,
};
pub use stable_view::{AnchorStats, ChangeHandle, ChangeOptions, FocusMode, StableViewAnchor};
