use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace};

use super::layout_cache::LayoutCache;
use super::metrics::{GridStyle, LayoutMetrics};
use super::patch::NodePatch;
use crate::models::{Placement, TileId};

/// Shortest-column masonry placement.
///
/// Tiles keep their document order; each one drops into the column whose
/// current bottom edge is lowest (lowest index on ties). Tile height follows
/// the column width and the tile's aspect ratio.
#[derive(Debug, Clone)]
pub struct MasonryLayout {
    /// Ratio used for tiles whose aspect ratio is unknown or invalid (default: 1.0)
    pub default_aspect_ratio: f64,
}

impl Default for MasonryLayout {
    fn default() -> Self {
        Self {
            default_aspect_ratio: 1.0,
        }
    }
}

/// Output of one layout pass.
#[derive(Debug, Clone, PartialEq)]
pub struct LayoutResult {
    pub metrics: LayoutMetrics,
    /// Placements in document order.
    pub placements: Vec<(TileId, Placement)>,
    /// Bottom edge of every column, trailing gap included.
    pub column_heights: Vec<f64>,
    pub content_height: f64,
    /// Tile ids sorted by (top, left): the order used for keyboard/range navigation.
    pub order: Vec<TileId>,
    index: HashMap<TileId, usize>,
}

impl LayoutResult {
    pub fn placement(&self, id: &TileId) -> Option<&Placement> {
        self.index.get(id).map(|&i| &self.placements[i].1)
    }

    pub fn len(&self) -> usize {
        self.placements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.placements.is_empty()
    }

    pub fn visual_index(&self, id: &TileId) -> Option<usize> {
        self.order.iter().position(|o| o == id)
    }
}

impl MasonryLayout {
    pub fn new(default_aspect_ratio: f64) -> Self {
        Self {
            default_aspect_ratio,
        }
    }

    pub fn resolve_aspect(&self, ratio: Option<f64>) -> f64 {
        match ratio {
            Some(r) if r.is_finite() && r > 0.0 => r,
            _ => self.default_aspect_ratio.max(f64::MIN_POSITIVE),
        }
    }

    /// Computes a masonry layout.
    ///
    /// # Algorithm
    /// 1. Tile height = column width / aspect ratio.
    /// 2. Walk tiles in document order, placing each in the shortest column.
    /// 3. Advance that column by tile height + gap.
    /// 4. Content height = tallest column minus its trailing gap.
    /// 5. Visual order = placements sorted by top, then left.
    pub fn compute(
        &self,
        ids: &[TileId],
        aspect_ratios: &HashMap<TileId, f64>,
        metrics: &LayoutMetrics,
    ) -> LayoutResult {
        let mut column_heights = vec![0.0f64; metrics.column_count.max(1)];
        let mut placements = Vec::with_capacity(ids.len());
        let mut index = HashMap::with_capacity(ids.len());

        for id in ids {
            if index.contains_key(id) {
                // Duplicate ids would alias one node; first occurrence wins.
                continue;
            }
            let ratio = self.resolve_aspect(aspect_ratios.get(id).copied());
            let height = (metrics.column_width / ratio).max(1.0);
            let column = shortest_column(&column_heights);
            let placement = Placement {
                column,
                x: metrics.column_x(column),
                y: column_heights[column],
                width: metrics.column_width,
                height,
            };
            column_heights[column] += height + metrics.gap;
            index.insert(id.clone(), placements.len());
            placements.push((id.clone(), placement));
        }

        let tallest = column_heights.iter().copied().fold(0.0f64, f64::max);
        let content_height = if placements.is_empty() {
            0.0
        } else {
            (tallest - metrics.gap).max(0.0)
        };

        let mut sorted: Vec<usize> = (0..placements.len()).collect();
        sorted.sort_by(|&a, &b| {
            let pa = &placements[a].1;
            let pb = &placements[b].1;
            pa.y.total_cmp(&pb.y)
                .then(pa.x.total_cmp(&pb.x))
                .then(a.cmp(&b))
        });
        let order = sorted.into_iter().map(|i| placements[i].0.clone()).collect();

        LayoutResult {
            metrics: *metrics,
            placements,
            column_heights,
            content_height,
            order,
            index,
        }
    }
}

fn shortest_column(heights: &[f64]) -> usize {
    let mut best = 0;
    for (i, h) in heights.iter().enumerate().skip(1) {
        if *h < heights[best] {
            best = i;
        }
    }
    best
}

/// Why a layout pass ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutTrigger {
    Mount,
    ItemsChanged,
    AspectRatio,
    Resize,
    /// Zoom class swap; always applies every placement.
    Zoom,
}

/// Result of [`MasonryEngine::run`].
#[derive(Debug, Clone)]
pub struct LayoutPass {
    pub trigger: LayoutTrigger,
    pub result: Arc<LayoutResult>,
    /// Patches for placements that differ from the previously applied pass.
    pub patches: Vec<NodePatch>,
    /// Set only when the visual order differs from the last emitted one.
    pub order_changed: Option<Vec<TileId>>,
    pub from_cache: bool,
}

/// Stateful wrapper around [`MasonryLayout`]: resolves metrics from style,
/// memoizes passes, diffs placements into patches and suppresses redundant
/// order notifications.
pub struct MasonryEngine {
    layout: MasonryLayout,
    fallback_gap: f64,
    cache: Arc<LayoutCache>,
    last: Option<Arc<LayoutResult>>,
    last_order: Option<Vec<TileId>>,
    applied: HashMap<TileId, Placement>,
    applied_content_height: Option<f64>,
}

impl MasonryEngine {
    pub fn new(layout: MasonryLayout, fallback_gap: f64, cache: Arc<LayoutCache>) -> Self {
        Self {
            layout,
            fallback_gap,
            cache,
            last: None,
            last_order: None,
            applied: HashMap::new(),
            applied_content_height: None,
        }
    }

    pub fn layout(&self) -> &MasonryLayout {
        &self.layout
    }

    pub fn last(&self) -> Option<&Arc<LayoutResult>> {
        self.last.as_ref()
    }

    /// Runs one layout pass against the current computed style.
    pub fn run(
        &mut self,
        trigger: LayoutTrigger,
        ids: &[TileId],
        aspect_ratios: &HashMap<TileId, f64>,
        style: &GridStyle,
        container_width: f64,
    ) -> LayoutPass {
        let started = Instant::now();
        let metrics = LayoutMetrics::resolve(style, container_width, self.fallback_gap);
        let key = LayoutCache::fingerprint(ids, aspect_ratios, &self.layout, &metrics);

        let (result, from_cache) = match self.cache.get(key) {
            Some(hit) => (hit, true),
            None => {
                let computed = Arc::new(self.layout.compute(ids, aspect_ratios, &metrics));
                self.cache.insert(key, computed.clone());
                (computed, false)
            }
        };

        let force = trigger == LayoutTrigger::Zoom;
        let patches = self.diff(&result, force);

        let order_changed = if self.last_order.as_ref() != Some(&result.order) {
            self.last_order = Some(result.order.clone());
            Some(result.order.clone())
        } else {
            None
        };

        debug!(
            ?trigger,
            tiles = result.len(),
            columns = metrics.column_count,
            patches = patches.len(),
            from_cache,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Layout pass"
        );

        self.last = Some(result.clone());
        LayoutPass {
            trigger,
            result,
            patches,
            order_changed,
            from_cache,
        }
    }

    fn diff(&mut self, result: &LayoutResult, force: bool) -> Vec<NodePatch> {
        let mut patches = Vec::new();
        let mut next_applied = HashMap::with_capacity(result.placements.len());
        for (id, placement) in &result.placements {
            if force || self.applied.get(id) != Some(placement) {
                trace!(tile = %id, column = placement.column, y = placement.y, "Placing tile");
                patches.push(NodePatch::place(id.clone(), placement));
            }
            next_applied.insert(id.clone(), *placement);
        }
        let mut removed: Vec<&TileId> = self
            .applied
            .keys()
            .filter(|id| !next_applied.contains_key(*id))
            .collect();
        removed.sort();
        for id in removed {
            trace!(tile = %id, "Removing tile");
            patches.push(NodePatch::remove(id.clone()));
        }
        self.applied = next_applied;

        if force || self.applied_content_height != Some(result.content_height) {
            patches.push(NodePatch::content_height(result.content_height));
            self.applied_content_height = Some(result.content_height);
        }
        patches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::patch::{Patch, PatchTarget};

    fn ids(n: usize) -> Vec<TileId> {
        (0..n).map(|i| TileId::new(format!("t{i}"))).collect()
    }

    fn metrics(columns: usize, width: f64, gap: f64) -> LayoutMetrics {
        LayoutMetrics::from_parts(columns, gap, 0.0, 0.0, width)
    }

    fn engine() -> MasonryEngine {
        MasonryEngine::new(MasonryLayout::default(), 0.0, Arc::new(LayoutCache::new(8)))
    }

    #[test]
    fn test_empty_items() {
        let layout = MasonryLayout::default();
        let result = layout.compute(&[], &HashMap::new(), &metrics(3, 900.0, 10.0));
        assert!(result.is_empty());
        assert_eq!(result.content_height, 0.0);
        assert_eq!(result.column_heights, vec![0.0; 3]);
    }

    #[test]
    fn test_single_item() {
        let layout = MasonryLayout::default();
        let tiles = ids(1);
        let mut ratios = HashMap::new();
        ratios.insert(tiles[0].clone(), 2.0);
        let result = layout.compute(&tiles, &ratios, &metrics(3, 920.0, 10.0));

        let p = result.placement(&tiles[0]).unwrap();
        assert_eq!(p.column, 0);
        assert!((p.width - 300.0).abs() < 1e-9);
        assert!((p.height - 150.0).abs() < 1e-9);
        assert!((result.content_height - 150.0).abs() < 1e-9);
    }

    #[test]
    fn test_shortest_column_wins_with_low_index_ties() {
        let layout = MasonryLayout::default();
        let tiles = ids(4);
        let mut ratios = HashMap::new();
        // Column width 100: heights 200, 100, 50 for the first row.
        ratios.insert(tiles[0].clone(), 0.5);
        ratios.insert(tiles[1].clone(), 1.0);
        ratios.insert(tiles[2].clone(), 2.0);
        ratios.insert(tiles[3].clone(), 1.0);
        let result = layout.compute(&tiles, &ratios, &metrics(3, 300.0, 0.0));

        let columns: Vec<usize> = tiles
            .iter()
            .map(|id| result.placement(id).unwrap().column)
            .collect();
        assert_eq!(columns, vec![0, 1, 2, 2]);
        assert!((result.placement(&tiles[3]).unwrap().y - 50.0).abs() < 1e-9);
        assert!((result.content_height - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_ratio_uses_default() {
        let layout = MasonryLayout::new(0.5);
        let tiles = ids(2);
        let mut ratios = HashMap::new();
        ratios.insert(tiles[1].clone(), f64::NAN);
        let result = layout.compute(&tiles, &ratios, &metrics(2, 200.0, 0.0));
        for id in &tiles {
            assert!((result.placement(id).unwrap().height - 200.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_visual_order_sorts_by_top_then_left() {
        let layout = MasonryLayout::default();
        let tiles = ids(4);
        let mut ratios = HashMap::new();
        ratios.insert(tiles[0].clone(), 0.25); // tall, column 0
        ratios.insert(tiles[1].clone(), 2.0); // short, column 1
        ratios.insert(tiles[2].clone(), 2.0); // column 1 again at y=50
        ratios.insert(tiles[3].clone(), 2.0); // column 1 at y=100
        let result = layout.compute(&tiles, &ratios, &metrics(2, 200.0, 0.0));
        assert_eq!(result.order, tiles);

        let mut ratios = HashMap::new();
        ratios.insert(tiles[0].clone(), 2.0);
        ratios.insert(tiles[1].clone(), 0.5);
        ratios.insert(tiles[2].clone(), 1.0);
        ratios.insert(tiles[3].clone(), 1.0);
        // t0: col0 y0 h50, t1: col1 y0 h200, t2: col0 y50 h100, t3: col0 y150
        let result = layout.compute(&tiles, &ratios, &metrics(2, 200.0, 0.0));
        assert_eq!(
            result.order,
            vec![
                tiles[0].clone(),
                tiles[1].clone(),
                tiles[2].clone(),
                tiles[3].clone()
            ]
        );
        assert_eq!(result.visual_index(&tiles[2]), Some(2));
    }

    #[test]
    fn test_column_balance_invariant() {
        let layout = MasonryLayout::default();
        let tiles = ids(57);
        let ratios: HashMap<TileId, f64> = tiles
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), 0.4 + (i % 7) as f64 * 0.35))
            .collect();
        let m = metrics(5, 1280.0, 12.0);
        let result = layout.compute(&tiles, &ratios, &m);

        let tallest = result.column_heights.iter().copied().fold(0.0, f64::max);
        assert!(result.column_heights.iter().all(|h| *h >= 0.0));
        for (_, p) in &result.placements {
            assert!(p.bottom() <= result.column_heights[p.column] + 1e-9);
            assert!(p.bottom() <= tallest + 1e-9);
            assert!(p.bottom() <= result.content_height + 1e-9);
        }
        assert!((result.content_height - (tallest - 12.0)).abs() < 1e-9);
    }

    #[test]
    fn test_determinism_bit_identical() {
        let layout = MasonryLayout::default();
        let tiles = ids(40);
        let ratios: HashMap<TileId, f64> = tiles
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), 1.0 / (1.0 + (i % 5) as f64 * 0.3)))
            .collect();
        let m = metrics(4, 1033.7, 7.5);
        let a = layout.compute(&tiles, &ratios, &m);
        let b = layout.compute(&tiles, &ratios, &m);
        for ((ia, pa), (ib, pb)) in a.placements.iter().zip(b.placements.iter()) {
            assert_eq!(ia, ib);
            assert_eq!(pa.x.to_bits(), pb.x.to_bits());
            assert_eq!(pa.y.to_bits(), pb.y.to_bits());
            assert_eq!(pa.height.to_bits(), pb.height.to_bits());
        }
        assert_eq!(a.order, b.order);
    }

    #[test]
    fn test_engine_idempotent_passes() {
        let mut engine = engine();
        let tiles = ids(10);
        let ratios = HashMap::new();
        let style = GridStyle::new("repeat(3, 300px)", "10px");

        let first = engine.run(LayoutTrigger::Mount, &tiles, &ratios, &style, 920.0);
        assert!(first.order_changed.is_some());
        assert_eq!(first.patches.len(), tiles.len() + 1);

        let second = engine.run(LayoutTrigger::ItemsChanged, &tiles, &ratios, &style, 920.0);
        assert!(second.order_changed.is_none());
        assert!(second.patches.is_empty());
        assert!(second.from_cache);
        assert_eq!(first.result.placements, second.result.placements);
    }

    #[test]
    fn test_engine_patches_only_moved_tiles() {
        let mut engine = engine();
        let tiles = ids(4);
        let mut ratios = HashMap::new();
        let style = GridStyle::new("100px 100px", "0px");
        engine.run(LayoutTrigger::Mount, &tiles, &ratios, &style, 200.0);

        // t3 is last in column 1; making it taller only reshapes itself.
        ratios.insert(tiles[3].clone(), 0.5);
        let pass = engine.run(LayoutTrigger::AspectRatio, &tiles, &ratios, &style, 200.0);
        let touched: Vec<&PatchTarget> = pass.patches.iter().map(|p| &p.target).collect();
        assert!(touched.contains(&&PatchTarget::Tile(tiles[3].clone())));
        assert!(!touched.contains(&&PatchTarget::Tile(tiles[0].clone())));
        assert!(pass
            .patches
            .iter()
            .any(|p| matches!(p.patch, Patch::ContentHeight(_))));
        assert!(pass.order_changed.is_none());
    }

    #[test]
    fn test_zoom_forces_full_patch_set() {
        let mut engine = engine();
        let tiles = ids(6);
        let ratios = HashMap::new();
        let style = GridStyle::new("100px 100px", "0px");
        engine.run(LayoutTrigger::Mount, &tiles, &ratios, &style, 200.0);
        let pass = engine.run(LayoutTrigger::Zoom, &tiles, &ratios, &style, 200.0);
        assert_eq!(pass.patches.len(), tiles.len() + 1);
    }

    #[test]
    fn test_dropped_tiles_are_removed() {
        let mut engine = engine();
        let tiles = ids(3);
        let ratios = HashMap::new();
        let style = GridStyle::new("100px 100px", "0px");
        engine.run(LayoutTrigger::Mount, &tiles, &ratios, &style, 200.0);

        let pass = engine.run(LayoutTrigger::ItemsChanged, &tiles[..1], &ratios, &style, 200.0);
        let removed: Vec<&PatchTarget> = pass
            .patches
            .iter()
            .filter(|p| p.patch == Patch::Remove)
            .map(|p| &p.target)
            .collect();
        assert_eq!(
            removed,
            vec![
                &PatchTarget::Tile(tiles[1].clone()),
                &PatchTarget::Tile(tiles[2].clone())
            ]
        );

        // Already removed: nothing left to remove on the next pass.
        let pass = engine.run(LayoutTrigger::ItemsChanged, &tiles[..1], &ratios, &style, 200.0);
        assert!(pass.patches.is_empty());
    }

    #[test]
    fn test_column_count_follows_style_not_width() {
        let mut engine = engine();
        let tiles = ids(6);
        let ratios = HashMap::new();
        let pass = engine.run(
            LayoutTrigger::Mount,
            &tiles,
            &ratios,
            &GridStyle::new("1fr 1fr 1fr", "0px"),
            3000.0,
        );
        assert_eq!(pass.result.metrics.column_count, 3);
        assert!((pass.result.metrics.column_width - 1000.0).abs() < 1e-9);
    }
}
