//! Anchor selection and measurement.

use crate::models::{Rect, TileId};

/// Which tile(s) to keep in place across a layout-affecting change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnchorStrategy {
    /// Single selection, else selection centroid, else first visible tile.
    #[default]
    Auto,
    SingleSelected,
    SelectionCentroid,
    FirstVisible,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnchorTarget {
    Selected(TileId),
    Centroid(Vec<TileId>),
    FirstVisible(TileId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorKind {
    Selected,
    Centroid,
    FirstVisible,
}

/// Live snapshot of the anchor, in viewport coordinates (0 = top edge of
/// the scroll container's visible area).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnchorMeasurement {
    pub kind: AnchorKind,
    pub top: f64,
    pub bottom: f64,
    pub height: f64,
    /// Scroll offset at measurement time.
    pub viewport_y: f64,
    pub viewport_height: f64,
    pub is_visible: bool,
}

impl AnchorMeasurement {
    pub fn center(&self) -> f64 {
        (self.top + self.bottom) / 2.0
    }

    /// Same anchor, expressed in content coordinates.
    pub fn content_top(&self) -> f64 {
        self.top + self.viewport_y
    }
}

/// Read/write access to the scroll container and tile geometry.
pub trait AnchorGeometry {
    fn scroll_top(&self) -> f64;
    fn set_scroll_top(&self, value: f64);
    fn viewport_height(&self) -> f64;
    fn content_height(&self) -> f64;
    /// Tile rect in content coordinates, if the tile is currently laid out.
    fn tile_rect(&self, id: &TileId) -> Option<Rect>;
}

/// Host selection state.
pub trait SelectionSource {
    fn selected(&self) -> Vec<TileId>;
    /// Tile ids in navigation order.
    fn ordered_ids(&self) -> Vec<TileId>;
}

/// Picks the anchor for `strategy`. `None` when nothing qualifies.
pub fn resolve_target(
    strategy: AnchorStrategy,
    selection: &dyn SelectionSource,
    geometry: &dyn AnchorGeometry,
) -> Option<AnchorTarget> {
    let selected = || {
        selection
            .selected()
            .into_iter()
            .filter(|id| geometry.tile_rect(id).is_some_and(|r| !r.is_collapsed()))
            .collect::<Vec<_>>()
    };
    match strategy {
        AnchorStrategy::SingleSelected => {
            let selected = selected();
            (selected.len() == 1).then(|| AnchorTarget::Selected(selected[0].clone()))
        }
        AnchorStrategy::SelectionCentroid => {
            let selected = selected();
            (!selected.is_empty()).then(|| AnchorTarget::Centroid(selected))
        }
        AnchorStrategy::FirstVisible => {
            first_visible(selection, geometry).map(AnchorTarget::FirstVisible)
        }
        AnchorStrategy::Auto => {
            let mut selected = selected();
            match selected.len() {
                0 => first_visible(selection, geometry).map(AnchorTarget::FirstVisible),
                1 => selected.pop().map(AnchorTarget::Selected),
                _ => Some(AnchorTarget::Centroid(selected)),
            }
        }
    }
}

fn first_visible(selection: &dyn SelectionSource, geometry: &dyn AnchorGeometry) -> Option<TileId> {
    let top = geometry.scroll_top();
    let bottom = top + geometry.viewport_height();
    // Topmost visible tile; the first in navigation order breaks ties.
    let mut best: Option<(f64, TileId)> = None;
    for id in selection.ordered_ids() {
        let Some(rect) = geometry.tile_rect(&id) else {
            continue;
        };
        if !rect.intersects_band(top, bottom) {
            continue;
        }
        if best.as_ref().map_or(true, |(y, _)| rect.y < *y) {
            best = Some((rect.y, id));
        }
    }
    best.map(|(_, id)| id)
}

/// Measures `target` against the current scroll position.
pub fn measure(target: &AnchorTarget, geometry: &dyn AnchorGeometry) -> Option<AnchorMeasurement> {
    let viewport_y = geometry.scroll_top();
    let viewport_height = geometry.viewport_height();

    let (kind, top, bottom) = match target {
        AnchorTarget::Selected(id) | AnchorTarget::FirstVisible(id) => {
            let rect = geometry.tile_rect(id).filter(|r| !r.is_collapsed())?;
            let kind = if matches!(target, AnchorTarget::Selected(_)) {
                AnchorKind::Selected
            } else {
                AnchorKind::FirstVisible
            };
            (kind, rect.y, rect.bottom())
        }
        AnchorTarget::Centroid(ids) => {
            let rects: Vec<Rect> = ids
                .iter()
                .filter_map(|id| geometry.tile_rect(id))
                .filter(|r| !r.is_collapsed())
                .collect();
            if rects.is_empty() {
                return None;
            }
            let n = rects.len() as f64;
            let top = rects.iter().map(|r| r.y).sum::<f64>() / n;
            let bottom = rects.iter().map(Rect::bottom).sum::<f64>() / n;
            (AnchorKind::Centroid, top, bottom)
        }
    };

    let top = top - viewport_y;
    let bottom = bottom - viewport_y;
    Some(AnchorMeasurement {
        kind,
        top,
        bottom,
        height: bottom - top,
        viewport_y,
        viewport_height,
        is_visible: bottom > 0.0 && top < viewport_height,
    })
}
