//! Grid orchestrator.
//!
//! This module provides:
//! - `MediaGrid` - Wires visibility, lifecycle, layout, anchoring and the stall watchdog together
//! - `MediaGridBuilder` - Collects the host seams a grid needs
//! - `ScrollContainer` - The scroll offset and viewport height the grid reads and writes
//! - `VirtualScroll` - Headless scroll container and render surface
//!
//! All state sits behind one `RefCell`. Host callbacks and visibility
//! listeners are invoked only after that borrow has been released, so they
//! may call back into the grid.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::anchor::{AnchorGeometry, FocusMode, SelectionSource, StableViewAnchor};
use crate::config::GridConfig;
use crate::error::{GridError, GridResult, PlaybackError};
use crate::layout::{
    LayoutCache, LayoutResult, LayoutTrigger, MasonryEngine, MasonryLayout, NodePatch, Patch,
    PatchTarget, RenderSurface, StyleSource, ZoomLevel, ZoomedStyle,
};
use crate::media::{
    ElementOptions, MediaBackend, MediaElement, MediaEventChannel, MediaState, MediaTile,
    PlaybackSample, StallWatchdog, TileEffect,
};
use crate::models::{MediaKind, Rect, Tile, TileId, TileInput};
use crate::scheduler::{Scheduler, TaskFlow, TaskId};
use crate::visibility::{
    margin_near, GeometrySource, GeometryWatcher, SubscriptionId, Viewport, ViewportSnapshot,
    ViewportWatcher, VisibilityDispatch, VisibilityEntry, VisibilityListener, VisibilityRegistry,
    VisibilityTransition,
};

/// The host's scroll container.
pub trait ScrollContainer {
    fn scroll_top(&self) -> f64;
    fn set_scroll_top(&self, value: f64);
    fn viewport_height(&self) -> f64;
}

/// In-memory scroll container that also records tile geometry.
///
/// The scroll offset is clamped to `[0, content_height - viewport_height]`,
/// like a real scrolled window.
#[derive(Debug, Default)]
pub struct VirtualScroll {
    top: Cell<f64>,
    viewport: Cell<f64>,
    content: Cell<f64>,
    rects: RefCell<HashMap<TileId, Rect>>,
    batches: Cell<usize>,
}

impl VirtualScroll {
    pub fn new(viewport_height: f64) -> Self {
        Self {
            viewport: Cell::new(viewport_height.max(0.0)),
            ..Self::default()
        }
    }

    pub fn scroll_top(&self) -> f64 {
        self.top.get()
    }

    pub fn set_scroll_top(&self, value: f64) {
        let max = (self.content.get() - self.viewport.get()).max(0.0);
        let value = if value.is_finite() { value } else { 0.0 };
        self.top.set(value.clamp(0.0, max));
    }

    pub fn viewport_height(&self) -> f64 {
        self.viewport.get()
    }

    pub fn set_viewport_height(&self, height: f64) {
        self.viewport.set(height.max(0.0));
        self.set_scroll_top(self.top.get());
    }

    pub fn content_height(&self) -> f64 {
        self.content.get()
    }

    /// Shrinking the content pulls the scroll offset back into range.
    pub fn set_content_height(&self, height: f64) {
        self.content.set(height.max(0.0));
        self.set_scroll_top(self.top.get());
    }

    pub fn viewport(&self) -> Viewport {
        Viewport::new(self.top.get(), self.viewport.get())
    }

    pub fn rect(&self, id: &TileId) -> Option<Rect> {
        self.rects.borrow().get(id).copied()
    }

    pub fn set_rect(&self, id: TileId, rect: Rect) {
        self.rects.borrow_mut().insert(id, rect);
    }

    pub fn remove_rect(&self, id: &TileId) {
        self.rects.borrow_mut().remove(id);
    }

    /// Patch batches applied so far.
    pub fn batches(&self) -> usize {
        self.batches.get()
    }
}

impl ScrollContainer for VirtualScroll {
    fn scroll_top(&self) -> f64 {
        VirtualScroll::scroll_top(self)
    }

    fn set_scroll_top(&self, value: f64) {
        VirtualScroll::set_scroll_top(self, value);
    }

    fn viewport_height(&self) -> f64 {
        VirtualScroll::viewport_height(self)
    }
}

impl AnchorGeometry for VirtualScroll {
    fn scroll_top(&self) -> f64 {
        VirtualScroll::scroll_top(self)
    }

    fn set_scroll_top(&self, value: f64) {
        VirtualScroll::set_scroll_top(self, value);
    }

    fn viewport_height(&self) -> f64 {
        VirtualScroll::viewport_height(self)
    }

    fn content_height(&self) -> f64 {
        VirtualScroll::content_height(self)
    }

    fn tile_rect(&self, id: &TileId) -> Option<Rect> {
        self.rect(id)
    }
}

impl GeometrySource for VirtualScroll {
    fn rect(&self, id: &TileId) -> Option<Rect> {
        VirtualScroll::rect(self, id)
    }
}

impl RenderSurface for Rc<VirtualScroll> {
    fn apply(&mut self, patches: &[NodePatch]) {
        self.batches.set(self.batches.get() + 1);
        for patch in patches {
            match (&patch.target, patch.patch) {
                (
                    PatchTarget::Tile(id),
                    Patch::Place {
                        x,
                        y,
                        width,
                        height,
                    },
                ) => self.set_rect(id.clone(), Rect::new(x, y, width, height)),
                (PatchTarget::Tile(id), Patch::Remove) => self.remove_rect(id),
                (PatchTarget::Container, Patch::ContentHeight(h)) => self.set_content_height(h),
                _ => {}
            }
        }
    }
}

/// Anchor geometry backed by the host scroll container and the last layout
/// pass, so measurements never depend on the host having painted yet.
struct LayoutGeometry {
    scroll: Rc<dyn ScrollContainer>,
    layout: Rc<RefCell<Option<Arc<LayoutResult>>>>,
}

impl AnchorGeometry for LayoutGeometry {
    fn scroll_top(&self) -> f64 {
        self.scroll.scroll_top()
    }

    fn set_scroll_top(&self, value: f64) {
        self.scroll.set_scroll_top(value);
    }

    fn viewport_height(&self) -> f64 {
        self.scroll.viewport_height()
    }

    fn content_height(&self) -> f64 {
        self.layout
            .borrow()
            .as_ref()
            .map_or(0.0, |l| l.content_height)
    }

    fn tile_rect(&self, id: &TileId) -> Option<Rect> {
        self.layout
            .borrow()
            .as_ref()
            .and_then(|l| l.placement(id).map(|p| p.rect()))
    }
}

/// Selection used when the host has none: nothing selected, navigation in
/// visual order.
struct VisualOrder {
    order: Rc<RefCell<Vec<TileId>>>,
}

impl SelectionSource for VisualOrder {
    fn selected(&self) -> Vec<TileId> {
        Vec::new()
    }

    fn ordered_ids(&self) -> Vec<TileId> {
        self.order.borrow().clone()
    }
}

/// Why a load is being considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadReason {
    Visibility,
    Retry,
    Sweep,
    FileChanged,
    /// The element came back from an external viewer.
    Returned,
}

/// Handed to the admission predicate before every load.
#[derive(Debug, Clone)]
pub struct AdmissionQuery<'a> {
    pub id: &'a TileId,
    pub kind: MediaKind,
    pub reason: LoadReason,
    pub visible: bool,
    /// Tiles waiting for their first frame.
    pub in_flight: usize,
    /// Tiles currently holding an element.
    pub live: usize,
}

/// Must not call back into the grid.
pub type AdmissionFn = Box<dyn Fn(&AdmissionQuery<'_>) -> bool>;

pub type LoadCallback = Rc<dyn Fn(&TileId, f64)>;
pub type TileCallback = Rc<dyn Fn(&TileId)>;
pub type PlayErrorCallback = Rc<dyn Fn(&TileId, &PlaybackError)>;
pub type VisibilityCallback = Rc<dyn Fn(&TileId, bool)>;
pub type OrderCallback = Rc<dyn Fn(&[TileId])>;
pub type LayoutCompleteCallback = Rc<dyn Fn(LayoutTrigger, &LayoutResult)>;

#[derive(Default)]
struct GridCallbacks {
    on_load: RefCell<Option<LoadCallback>>,
    on_play: RefCell<Option<TileCallback>>,
    on_pause: RefCell<Option<TileCallback>>,
    on_play_error: RefCell<Option<PlayErrorCallback>>,
    on_visibility_changed: RefCell<Option<VisibilityCallback>>,
    on_order_changed: RefCell<Option<OrderCallback>>,
    on_layout_complete: RefCell<Option<LayoutCompleteCallback>>,
}

/// Host notifications collected while the grid state is borrowed.
enum Notice {
    Load(TileId, f64),
    Play(TileId),
    Pause(TileId),
    PlayError(TileId, PlaybackError),
    Visibility(TileId, bool),
    Order(Vec<TileId>),
    LayoutComplete(LayoutTrigger, Arc<LayoutResult>),
}

struct TileSlot<E> {
    tile: MediaTile<E>,
    model: Tile,
    hint: Option<f64>,
    subscription: SubscriptionId,
    load_timeout: Option<TaskId>,
    retry: Option<TaskId>,
}

impl<E> TileSlot<E> {
    fn aspect_ratio(&self) -> Option<f64>
    where
        E: MediaElement,
    {
        self.tile.natural_aspect_ratio().or(self.hint)
    }
}

struct GridState<E> {
    /// Document order.
    order: Vec<TileId>,
    tiles: HashMap<TileId, TileSlot<E>>,
    engine: MasonryEngine,
    surface: Box<dyn RenderSurface>,
    registry: VisibilityRegistry,
    container_width: f64,
    zoom: ZoomLevel,
    pump_task: Option<TaskId>,
    sweep_task: Option<TaskId>,
}

struct GridShared<B: MediaBackend> {
    config: GridConfig,
    backend: B,
    scheduler: Rc<dyn Scheduler>,
    channel: MediaEventChannel,
    watchdog: StallWatchdog,
    anchor: StableViewAnchor,
    scroll: Rc<dyn ScrollContainer>,
    style: Rc<dyn StyleSource>,
    layout: Rc<RefCell<Option<Arc<LayoutResult>>>>,
    visual_order: Rc<RefCell<Vec<TileId>>>,
    admission: AdmissionFn,
    callbacks: GridCallbacks,
    state: RefCell<GridState<B::Element>>,
}

/// A virtualized masonry grid of media tiles. Clones share the same grid.
pub struct MediaGrid<B: MediaBackend> {
    shared: Rc<GridShared<B>>,
}

impl<B: MediaBackend> Clone for MediaGrid<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

pub struct MediaGridBuilder<B: MediaBackend> {
    backend: B,
    config: GridConfig,
    scheduler: Option<Rc<dyn Scheduler>>,
    surface: Option<Box<dyn RenderSurface>>,
    scroll: Option<Rc<dyn ScrollContainer>>,
    style: Option<Rc<dyn StyleSource>>,
    selection: Option<Rc<dyn SelectionSource>>,
    watcher: Option<Box<dyn ViewportWatcher>>,
    admission: Option<AdmissionFn>,
    layout_cache: Option<Arc<LayoutCache>>,
    container_width: f64,
    zoom: ZoomLevel,
}

impl<B: MediaBackend + 'static> MediaGridBuilder<B> {
    pub fn config(mut self, config: GridConfig) -> Self {
        self.config = config;
        self
    }

    pub fn scheduler(mut self, scheduler: Rc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn surface(mut self, surface: impl RenderSurface + 'static) -> Self {
        self.surface = Some(Box::new(surface));
        self
    }

    pub fn scroll(mut self, scroll: Rc<dyn ScrollContainer>) -> Self {
        self.scroll = Some(scroll);
        self
    }

    pub fn style(mut self, style: Rc<dyn StyleSource>) -> Self {
        self.style = Some(style);
        self
    }

    pub fn selection(mut self, selection: Rc<dyn SelectionSource>) -> Self {
        self.selection = Some(selection);
        self
    }

    /// Replaces the built-in geometry watcher with a push/pull host watcher.
    pub fn watcher(mut self, watcher: Box<dyn ViewportWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn admission(mut self, admission: impl Fn(&AdmissionQuery<'_>) -> bool + 'static) -> Self {
        self.admission = Some(Box::new(admission));
        self
    }

    /// Shares a layout cache between grids.
    pub fn layout_cache(mut self, cache: Arc<LayoutCache>) -> Self {
        self.layout_cache = Some(cache);
        self
    }

    pub fn container_width(mut self, width: f64) -> Self {
        self.container_width = width;
        self
    }

    pub fn zoom(mut self, zoom: ZoomLevel) -> Self {
        self.zoom = zoom;
        self
    }

    pub fn build(self) -> GridResult<MediaGrid<B>> {
        self.config.validate()?;
        let scheduler = self
            .scheduler
            .ok_or_else(|| GridError::config("a scheduler is required"))?;
        let scroll = self
            .scroll
            .ok_or_else(|| GridError::config("a scroll container is required"))?;
        let surface = self
            .surface
            .ok_or_else(|| GridError::config("a render surface is required"))?;
        let style = self
            .style
            .unwrap_or_else(|| Rc::new(ZoomedStyle::new(self.zoom, 8.0, 0.0)));

        let config = self.config;
        let layout: Rc<RefCell<Option<Arc<LayoutResult>>>> = Rc::new(RefCell::new(None));
        let visual_order = Rc::new(RefCell::new(Vec::new()));
        let selection = self.selection.unwrap_or_else(|| {
            Rc::new(VisualOrder {
                order: visual_order.clone(),
            })
        });
        let geometry = Rc::new(LayoutGeometry {
            scroll: scroll.clone(),
            layout: layout.clone(),
        });
        let anchor = StableViewAnchor::new(
            config.anchor.clone(),
            scheduler.clone(),
            geometry,
            selection,
        );

        let mut registry = VisibilityRegistry::new(
            self.watcher
                .unwrap_or_else(|| Box::new(GeometryWatcher::new())),
            config.visibility.collapse_policy,
        );
        registry.set_near_predicate(margin_near(config.visibility.near_margin_viewports));

        let cache = self
            .layout_cache
            .unwrap_or_else(|| Arc::new(LayoutCache::new(config.layout.cache_capacity)));
        let engine = MasonryEngine::new(
            MasonryLayout::new(config.layout.default_aspect_ratio),
            config.layout.fallback_gap,
            cache,
        );

        info!(
            width = self.container_width,
            zoom = self.zoom.class_name(),
            "Creating media grid"
        );

        Ok(MediaGrid {
            shared: Rc::new(GridShared {
                watchdog: StallWatchdog::new(config.watchdog.clone(), scheduler.clone()),
                backend: self.backend,
                scheduler,
                channel: MediaEventChannel::new(),
                anchor,
                scroll,
                style,
                layout,
                visual_order,
                admission: self
                    .admission
                    .unwrap_or_else(|| Box::new(|_: &AdmissionQuery<'_>| true)),
                callbacks: GridCallbacks::default(),
                state: RefCell::new(GridState {
                    order: Vec::new(),
                    tiles: HashMap::new(),
                    engine,
                    surface,
                    registry,
                    container_width: self.container_width,
                    zoom: self.zoom,
                    pump_task: None,
                    sweep_task: None,
                }),
                config,
            }),
        })
    }
}

impl<B: MediaBackend + 'static> MediaGrid<B> {
    pub fn builder(backend: B) -> MediaGridBuilder<B> {
        MediaGridBuilder {
            backend,
            config: GridConfig::default(),
            scheduler: None,
            surface: None,
            scroll: None,
            style: None,
            selection: None,
            watcher: None,
            admission: None,
            layout_cache: None,
            container_width: 0.0,
            zoom: ZoomLevel::default(),
        }
    }

    /// Replaces the active item set. New tiles are created, removed ones are
    /// torn down, and changed file signals clear permanent errors.
    pub fn set_items(&self, items: Vec<TileInput>) {
        self.shared.set_items(items);
    }

    pub fn set_container_width(&self, width: f64) {
        {
            let mut state = self.shared.state.borrow_mut();
            if (state.container_width - width).abs() < 0.5 {
                return;
            }
            state.container_width = width;
        }
        self.shared.relayout(LayoutTrigger::Resize);
    }

    /// Swaps the zoom class and forces a full relayout.
    pub fn set_zoom(&self, zoom: ZoomLevel) {
        let previous = {
            let mut state = self.shared.state.borrow_mut();
            if state.zoom == zoom {
                return;
            }
            std::mem::replace(&mut state.zoom, zoom)
        };
        debug!(from = previous.class_name(), to = zoom.class_name(), "Zoom changed");
        self.shared.style.swap_zoom_class(previous, zoom);
        self.shared.relayout(LayoutTrigger::Zoom);
    }

    pub fn zoom(&self) -> ZoomLevel {
        self.shared.state.borrow().zoom
    }

    pub fn container_width(&self) -> f64 {
        self.shared.state.borrow().container_width
    }

    /// Desired play/pause state for a tile.
    pub fn set_playing(&self, id: &TileId, playing: bool) -> GridResult<()> {
        self.shared.with_tile(id, |tile, now| tile.set_playing(playing, now))
    }

    /// Marks a tile's element as reparented into an external viewer.
    pub fn set_on_loan(&self, id: &TileId, on_loan: bool) -> GridResult<()> {
        self.shared.with_tile(id, |tile, _| tile.set_on_loan(on_loan))?;
        if !on_loan {
            self.shared.request(id, LoadReason::Returned);
        }
        Ok(())
    }

    pub fn on_scroll(&self) {
        self.shared.refresh_visibility();
    }

    /// Measures every observed tile against the current viewport.
    pub fn refresh_visibility(&self) {
        self.shared.refresh_visibility();
    }

    /// Feeds entries from a host-side watcher.
    pub fn dispatch_visibility(&self, entries: Vec<VisibilityEntry>) {
        let dispatch = self.shared.state.borrow_mut().registry.dispatch(entries);
        dispatch.notify();
    }

    /// Applies queued media events. Returns how many were drained.
    pub fn pump(&self) -> usize {
        self.shared.pump()
    }

    /// Re-offers wanted idle tiles to the admission predicate.
    pub fn sweep(&self) {
        self.shared.sweep();
    }

    /// Installs the periodic event pump and backup admission sweep.
    pub fn start(&self) {
        let shared = &self.shared;
        if shared.state.borrow().pump_task.is_some() {
            return;
        }
        let pump = {
            let weak = Rc::downgrade(shared);
            shared.scheduler.interval(
                shared.config.lifecycle.pump_interval,
                Box::new(move || match weak.upgrade() {
                    Some(grid) => {
                        grid.pump();
                        TaskFlow::Continue
                    }
                    None => TaskFlow::Break,
                }),
            )
        };
        let sweep = {
            let weak = Rc::downgrade(shared);
            shared.scheduler.interval(
                shared.config.lifecycle.backup_sweep_interval,
                Box::new(move || match weak.upgrade() {
                    Some(grid) => {
                        grid.sweep();
                        TaskFlow::Continue
                    }
                    None => TaskFlow::Break,
                }),
            )
        };
        let mut state = shared.state.borrow_mut();
        state.pump_task = Some(pump);
        state.sweep_task = Some(sweep);
        debug!("Grid started");
    }

    pub fn stop(&self) {
        let tasks = {
            let mut state = self.shared.state.borrow_mut();
            [state.pump_task.take(), state.sweep_task.take()]
        };
        for task in tasks.into_iter().flatten() {
            self.shared.scheduler.cancel(task);
        }
    }

    pub fn is_started(&self) -> bool {
        self.shared.state.borrow().pump_task.is_some()
    }

    pub fn focus_current_anchor(&self, mode: FocusMode) -> bool {
        let moved = self.shared.anchor.focus_current_anchor(mode);
        if moved {
            self.shared.refresh_visibility();
        }
        moved
    }

    pub fn anchor(&self) -> &StableViewAnchor {
        &self.shared.anchor
    }

    pub fn watchdog(&self) -> &StallWatchdog {
        &self.shared.watchdog
    }

    pub fn connect_load<F: Fn(&TileId, f64) + 'static>(&self, f: F) {
        *self.shared.callbacks.on_load.borrow_mut() = Some(Rc::new(f));
    }

    pub fn connect_play<F: Fn(&TileId) + 'static>(&self, f: F) {
        *self.shared.callbacks.on_play.borrow_mut() = Some(Rc::new(f));
    }

    pub fn connect_pause<F: Fn(&TileId) + 'static>(&self, f: F) {
        *self.shared.callbacks.on_pause.borrow_mut() = Some(Rc::new(f));
    }

    pub fn connect_play_error<F: Fn(&TileId, &PlaybackError) + 'static>(&self, f: F) {
        *self.shared.callbacks.on_play_error.borrow_mut() = Some(Rc::new(f));
    }

    pub fn connect_visibility_changed<F: Fn(&TileId, bool) + 'static>(&self, f: F) {
        *self.shared.callbacks.on_visibility_changed.borrow_mut() = Some(Rc::new(f));
    }

    pub fn connect_order_changed<F: Fn(&[TileId]) + 'static>(&self, f: F) {
        *self.shared.callbacks.on_order_changed.borrow_mut() = Some(Rc::new(f));
    }

    pub fn connect_layout_complete<F: Fn(LayoutTrigger, &LayoutResult) + 'static>(&self, f: F) {
        *self.shared.callbacks.on_layout_complete.borrow_mut() = Some(Rc::new(f));
    }

    pub fn tile(&self, id: &TileId) -> Option<Tile> {
        self.shared
            .state
            .borrow()
            .tiles
            .get(id)
            .map(|slot| slot.model.clone())
    }

    pub fn media_state(&self, id: &TileId) -> Option<MediaState> {
        self.shared
            .state
            .borrow()
            .tiles
            .get(id)
            .map(|slot| slot.tile.state())
    }

    pub fn last_error(&self, id: &TileId) -> Option<PlaybackError> {
        self.shared
            .state
            .borrow()
            .tiles
            .get(id)
            .and_then(|slot| slot.tile.last_error().cloned())
    }

    pub fn layout(&self) -> Option<Arc<LayoutResult>> {
        self.shared.layout.borrow().clone()
    }

    /// Tile ids in visual (navigation) order.
    pub fn order(&self) -> Vec<TileId> {
        self.shared.visual_order.borrow().clone()
    }

    /// Tile ids in document order.
    pub fn items(&self) -> Vec<TileId> {
        self.shared.state.borrow().order.clone()
    }

    pub fn len(&self) -> usize {
        self.shared.state.borrow().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.state.borrow().order.is_empty()
    }
}

impl<B: MediaBackend + 'static> GridShared<B> {
    fn set_items(self: &Rc<Self>, items: Vec<TileInput>) {
        let mut notices = Vec::new();
        let mut changed = Vec::new();
        {
            let mut state = self.state.borrow_mut();
            let mut seen = HashSet::with_capacity(items.len());
            let mut order = Vec::with_capacity(items.len());
            let mut inputs = Vec::with_capacity(items.len());
            for input in items {
                if !seen.insert(input.id.clone()) {
                    warn!(tile = %input.id, "Duplicate tile id, keeping the first");
                    continue;
                }
                order.push(input.id.clone());
                inputs.push(input);
            }

            let removed: Vec<TileId> = state
                .tiles
                .keys()
                .filter(|id| !seen.contains(*id))
                .cloned()
                .collect();
            for id in &removed {
                if let Some(slot) = state.tiles.remove(id) {
                    self.dispose_slot(&mut state, id, slot, &mut notices);
                }
            }

            let mut added = 0usize;
            for input in &inputs {
                if let Some(slot) = state.tiles.get_mut(&input.id) {
                    slot.hint = input.hinted_aspect_ratio();
                    if slot.tile.update_input(input) {
                        changed.push(input.id.clone());
                    }
                    slot.model.natural_aspect_ratio = slot.aspect_ratio();
                    continue;
                }
                let slot = self.new_slot(&mut state, input);
                state.tiles.insert(input.id.clone(), slot);
                added += 1;
            }
            state.order = order;
            debug!(
                tiles = state.order.len(),
                added,
                removed = removed.len(),
                file_changes = changed.len(),
                "Items updated"
            );
        }
        self.emit(notices);
        self.relayout(LayoutTrigger::ItemsChanged);

        // A cleared error does not change visibility, so no transition would
        // trigger the fresh load.
        for id in changed {
            self.request(&id, LoadReason::FileChanged);
        }
    }

    fn new_slot(
        self: &Rc<Self>,
        state: &mut GridState<B::Element>,
        input: &TileInput,
    ) -> TileSlot<B::Element> {
        let weak = Rc::downgrade(self);
        let listener: VisibilityListener = Rc::new(move |transition: &VisibilityTransition| {
            if let Some(grid) = weak.upgrade() {
                grid.on_visibility(transition);
            }
        });
        let subscription = state.registry.observe(&input.id, listener);
        let hint = input.hinted_aspect_ratio();
        let mut model = Tile::new(input.id.clone());
        model.natural_aspect_ratio = hint;
        TileSlot {
            tile: MediaTile::new(input, &self.config.lifecycle),
            model,
            hint,
            subscription,
            load_timeout: None,
            retry: None,
        }
    }

    /// Unconditional teardown of a removed tile.
    fn dispose_slot(
        &self,
        state: &mut GridState<B::Element>,
        id: &TileId,
        slot: TileSlot<B::Element>,
        notices: &mut Vec<Notice>,
    ) {
        for task in [slot.load_timeout, slot.retry].into_iter().flatten() {
            self.scheduler.cancel(task);
        }
        state.registry.unobserve(slot.subscription);
        let (effects, loaned) = slot.tile.dispose();
        for effect in effects {
            match effect {
                TileEffect::UnwatchStall => self.watchdog.unregister(id),
                TileEffect::Paused => notices.push(Notice::Pause(id.clone())),
                _ => {}
            }
        }
        if loaned.is_some() {
            debug!(tile = %id, "Removed tile leaves its element with the viewer");
        }
    }

    fn with_tile(
        self: &Rc<Self>,
        id: &TileId,
        f: impl FnOnce(&mut MediaTile<B::Element>, std::time::Instant) -> Vec<TileEffect>,
    ) -> GridResult<()> {
        let mut notices = Vec::new();
        let relayout = {
            let mut state = self.state.borrow_mut();
            let slot = state
                .tiles
                .get_mut(id)
                .ok_or_else(|| GridError::UnknownTile(id.clone()))?;
            let effects = f(&mut slot.tile, self.scheduler.now());
            self.apply_effects(&mut state, id, effects, &mut notices)
        };
        self.emit(notices);
        if relayout {
            self.relayout(LayoutTrigger::AspectRatio);
        }
        Ok(())
    }

    fn request(self: &Rc<Self>, id: &TileId, reason: LoadReason) {
        let mut notices = Vec::new();
        {
            let mut state = self.state.borrow_mut();
            self.try_request(&mut state, id, reason, &mut notices);
        }
        self.emit(notices);
    }

    /// Starts a load if the tile is wanted, idle and admitted.
    fn try_request(
        self: &Rc<Self>,
        state: &mut GridState<B::Element>,
        id: &TileId,
        reason: LoadReason,
        notices: &mut Vec<Notice>,
    ) {
        let (in_flight, live) = state.tiles.values().fold((0, 0), |(f, l), slot| {
            (
                f + usize::from(slot.tile.state() == MediaState::Requested),
                l + usize::from(slot.tile.has_element()),
            )
        });
        let Some(slot) = state.tiles.get_mut(id) else {
            return;
        };
        if !slot.tile.is_wanted() || !slot.tile.can_request() {
            return;
        }

        let query = AdmissionQuery {
            id,
            kind: slot.tile.kind(),
            reason,
            visible: slot.tile.is_visible(),
            in_flight,
            live,
        };
        if !(self.admission)(&query) {
            if !slot.tile.admission_rejected() {
                debug!(tile = %id, ?reason, in_flight, live, "Admission rejected");
            }
            slot.tile.set_admission_rejected(true);
            return;
        }

        let generation = slot.tile.next_generation();
        let sink = self.channel.sink(id.clone(), generation);
        let element =
            self.backend
                .create_element(id, slot.tile.kind(), ElementOptions::default(), sink);
        let effects = slot.tile.begin_load(element, self.scheduler.now());
        trace!(tile = %id, ?reason, generation, "Element created");
        self.apply_effects(state, id, effects, notices);
    }

    /// Carries out tile effects. Returns whether an aspect ratio changed.
    fn apply_effects(
        self: &Rc<Self>,
        state: &mut GridState<B::Element>,
        id: &TileId,
        effects: Vec<TileEffect>,
        notices: &mut Vec<Notice>,
    ) -> bool {
        let mut relayout = false;
        for effect in effects {
            match effect {
                TileEffect::ArmLoadTimeout(delay) => {
                    let weak = Rc::downgrade(self);
                    let tile = id.clone();
                    let task = self.scheduler.timeout(
                        delay,
                        Box::new(move || {
                            if let Some(grid) = weak.upgrade() {
                                grid.on_load_timeout(&tile);
                            }
                        }),
                    );
                    let previous = match state.tiles.get_mut(id) {
                        Some(slot) => slot.load_timeout.replace(task),
                        None => Some(task),
                    };
                    if let Some(previous) = previous {
                        self.scheduler.cancel(previous);
                    }
                }
                TileEffect::CancelLoadTimeout => {
                    if let Some(task) = state.tiles.get_mut(id).and_then(|s| s.load_timeout.take())
                    {
                        self.scheduler.cancel(task);
                    }
                }
                TileEffect::ScheduleRetry(delay) => {
                    let weak = Rc::downgrade(self);
                    let tile = id.clone();
                    let task = self.scheduler.timeout(
                        delay,
                        Box::new(move || {
                            if let Some(grid) = weak.upgrade() {
                                grid.on_retry(&tile);
                            }
                        }),
                    );
                    let previous = match state.tiles.get_mut(id) {
                        Some(slot) => slot.retry.replace(task),
                        None => Some(task),
                    };
                    if let Some(previous) = previous {
                        self.scheduler.cancel(previous);
                    }
                }
                TileEffect::CancelRetry => {
                    if let Some(task) = state.tiles.get_mut(id).and_then(|s| s.retry.take()) {
                        self.scheduler.cancel(task);
                    }
                }
                TileEffect::AspectRatio(ratio) => {
                    if let Some(slot) = state.tiles.get_mut(id) {
                        slot.model.natural_aspect_ratio = Some(ratio);
                    }
                    notices.push(Notice::Load(id.clone(), ratio));
                    relayout = true;
                }
                TileEffect::Played => notices.push(Notice::Play(id.clone())),
                TileEffect::Paused => notices.push(Notice::Pause(id.clone())),
                TileEffect::Failed(err) => notices.push(Notice::PlayError(id.clone(), err)),
                TileEffect::WatchStall => {
                    let is_video = state
                        .tiles
                        .get(id)
                        .is_some_and(|slot| slot.tile.kind().is_video());
                    if is_video {
                        self.watch_stall(id);
                    }
                }
                TileEffect::UnwatchStall => self.watchdog.unregister(id),
            }
        }
        relayout
    }

    fn watch_stall(self: &Rc<Self>, id: &TileId) {
        let sample = {
            let weak = Rc::downgrade(self);
            let id = id.clone();
            Box::new(move || weak.upgrade().and_then(|grid| grid.sample(&id)))
        };
        let recover = {
            let weak = Rc::downgrade(self);
            let id = id.clone();
            Box::new(move || {
                if let Some(grid) = weak.upgrade() {
                    grid.recover_stalled(&id);
                }
            })
        };
        self.watchdog.register(id.clone(), sample, recover);
    }

    fn sample(&self, id: &TileId) -> Option<PlaybackSample> {
        let state = self.state.try_borrow().ok()?;
        let slot = state.tiles.get(id)?;
        if slot.tile.state() != MediaState::Playing {
            return None;
        }
        let element = slot.tile.element()?;
        Some(PlaybackSample {
            current_time: element.current_time(),
            paused: element.is_paused(),
            enough_data: element.has_enough_data(),
        })
    }

    fn recover_stalled(self: &Rc<Self>, id: &TileId) {
        let mut notices = Vec::new();
        {
            let Ok(mut state) = self.state.try_borrow_mut() else {
                return;
            };
            let Some(slot) = state.tiles.get_mut(id) else {
                return;
            };
            let effects = slot.tile.soft_recover(self.scheduler.now());
            self.apply_effects(&mut state, id, effects, &mut notices);
        }
        self.emit(notices);
    }

    fn on_load_timeout(self: &Rc<Self>, id: &TileId) {
        let mut notices = Vec::new();
        {
            let mut state = self.state.borrow_mut();
            let Some(slot) = state.tiles.get_mut(id) else {
                return;
            };
            slot.load_timeout = None;
            let effects = slot.tile.load_timed_out(self.scheduler.now());
            self.apply_effects(&mut state, id, effects, &mut notices);
        }
        self.emit(notices);
    }

    fn on_retry(self: &Rc<Self>, id: &TileId) {
        let mut notices = Vec::new();
        {
            let mut state = self.state.borrow_mut();
            let Some(slot) = state.tiles.get_mut(id) else {
                return;
            };
            slot.retry = None;
            slot.tile.retry_fired();
            self.try_request(&mut state, id, LoadReason::Retry, &mut notices);
        }
        self.emit(notices);
    }

    fn on_visibility(self: &Rc<Self>, transition: &VisibilityTransition) {
        let id = &transition.id;
        let mut notices = Vec::new();
        {
            let mut state = self.state.borrow_mut();
            let Some(slot) = state.tiles.get_mut(id) else {
                return;
            };
            let effects =
                slot.tile
                    .set_visibility(transition.visible, transition.near, self.scheduler.now());
            self.apply_effects(&mut state, id, effects, &mut notices);
            if transition.visible_changed {
                notices.push(Notice::Visibility(id.clone(), transition.visible));
            }
            self.try_request(&mut state, id, LoadReason::Visibility, &mut notices);
        }
        self.emit(notices);
    }

    fn refresh_visibility(&self) {
        let dispatch: VisibilityDispatch = {
            let mut state = self.state.borrow_mut();
            let viewport = Viewport::new(self.scroll.scroll_top(), self.scroll.viewport_height());
            let layout = self.layout.borrow().clone();
            let empty: HashMap<TileId, Rect> = HashMap::new();
            let geometry: &dyn GeometrySource = match &layout {
                Some(layout) => layout.as_ref(),
                None => &empty,
            };
            state.registry.refresh(&ViewportSnapshot { viewport, geometry })
        };
        dispatch.notify();
    }

    fn pump(self: &Rc<Self>) -> usize {
        let envelopes = self.channel.drain();
        if envelopes.is_empty() {
            return 0;
        }
        let count = envelopes.len();
        let mut notices = Vec::new();
        let mut relayout = false;
        {
            let mut state = self.state.borrow_mut();
            let now = self.scheduler.now();
            for envelope in envelopes {
                let Some(slot) = state.tiles.get_mut(&envelope.id) else {
                    continue;
                };
                if envelope.generation != slot.tile.generation() {
                    trace!(
                        tile = %envelope.id,
                        generation = envelope.generation,
                        current = slot.tile.generation(),
                        "Dropping event from a torn-down element"
                    );
                    continue;
                }
                let effects = slot.tile.handle_event(envelope.event, now);
                relayout |= self.apply_effects(&mut state, &envelope.id, effects, &mut notices);
            }
        }
        self.emit(notices);
        // Every ratio discovered in this batch lands in one anchored pass.
        if relayout {
            self.relayout(LayoutTrigger::AspectRatio);
        }
        count
    }

    fn sweep(self: &Rc<Self>) {
        let mut notices = Vec::new();
        {
            let mut state = self.state.borrow_mut();
            let candidates: Vec<TileId> = state
                .order
                .iter()
                .filter(|id| {
                    state
                        .tiles
                        .get(*id)
                        .is_some_and(|slot| slot.tile.is_wanted() && slot.tile.can_request())
                })
                .cloned()
                .collect();
            if !candidates.is_empty() {
                trace!(candidates = candidates.len(), "Backup admission sweep");
            }
            for id in candidates {
                self.try_request(&mut state, &id, LoadReason::Sweep, &mut notices);
            }
        }
        self.emit(notices);
    }

    /// Anchored relayout followed by a visibility pass over the new geometry.
    fn relayout(self: &Rc<Self>, trigger: LayoutTrigger) {
        self.anchor
            .run_with_stable_anchor(trigger, || self.layout_now(trigger));
        self.refresh_visibility();
    }

    fn layout_now(&self, trigger: LayoutTrigger) {
        let mut notices = Vec::new();
        {
            let mut state = self.state.borrow_mut();
            let width = state.container_width;
            if width <= 0.0 {
                debug!(?trigger, "Skipping layout, container has no width yet");
                return;
            }
            let ratios: HashMap<TileId, f64> = state
                .tiles
                .iter()
                .filter_map(|(id, slot)| slot.aspect_ratio().map(|r| (id.clone(), r)))
                .collect();
            let style = self.style.computed_grid_style(width);
            let ids = state.order.clone();

            let GridState {
                engine,
                surface,
                tiles,
                ..
            } = &mut *state;
            let pass = engine.run(trigger, &ids, &ratios, &style, width);
            if !pass.patches.is_empty() {
                surface.apply(&pass.patches);
            }

            for (id, placement) in &pass.result.placements {
                if let Some(slot) = tiles.get_mut(id) {
                    slot.model.placement = Some(*placement);
                    slot.model.natural_aspect_ratio = slot.aspect_ratio();
                }
            }
            for (index, id) in pass.result.order.iter().enumerate() {
                if let Some(slot) = tiles.get_mut(id) {
                    slot.model.visual_order_index = Some(index);
                }
            }

            *self.layout.borrow_mut() = Some(pass.result.clone());
            *self.visual_order.borrow_mut() = pass.result.order.clone();
            if let Some(order) = pass.order_changed {
                notices.push(Notice::Order(order));
            }
            notices.push(Notice::LayoutComplete(trigger, pass.result));
        }
        self.emit(notices);
    }

    fn emit(&self, notices: Vec<Notice>) {
        let callbacks = &self.callbacks;
        for notice in notices {
            match notice {
                Notice::Load(id, ratio) => {
                    let cb = callbacks.on_load.borrow().clone();
                    if let Some(cb) = cb {
                        cb(&id, ratio);
                    }
                }
                Notice::Play(id) => {
                    let cb = callbacks.on_play.borrow().clone();
                    if let Some(cb) = cb {
                        cb(&id);
                    }
                }
                Notice::Pause(id) => {
                    let cb = callbacks.on_pause.borrow().clone();
                    if let Some(cb) = cb {
                        cb(&id);
                    }
                }
                Notice::PlayError(id, err) => {
                    let cb = callbacks.on_play_error.borrow().clone();
                    if let Some(cb) = cb {
                        cb(&id, &err);
                    }
                }
                Notice::Visibility(id, visible) => {
                    let cb = callbacks.on_visibility_changed.borrow().clone();
                    if let Some(cb) = cb {
                        cb(&id, visible);
                    }
                }
                Notice::Order(order) => {
                    let cb = callbacks.on_order_changed.borrow().clone();
                    if let Some(cb) = cb {
                        cb(&order);
                    }
                }
                Notice::LayoutComplete(trigger, result) => {
                    let cb = callbacks.on_layout_complete.borrow().clone();
                    if let Some(cb) = cb {
                        cb(trigger, &result);
                    }
                }
            }
        }
    }
}

impl<B: MediaBackend> Drop for GridShared<B> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for task in [state.pump_task.take(), state.sweep_task.take()]
            .into_iter()
            .flatten()
        {
            self.scheduler.cancel(task);
        }
        for (id, slot) in state.tiles.drain() {
            for task in [slot.load_timeout, slot.retry].into_iter().flatten() {
                self.scheduler.cancel(task);
            }
            let _ = slot.tile.dispose();
            self.watchdog.unregister(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorClass, MediaErrorCode};
    use crate::layout::RecordingSurface;
    use crate::media::MediaEvent;
    use crate::models::FileSignal;
    use crate::scheduler::ManualScheduler;
    use crate::testing::{Call, FakeBackend, FakeSelection};
    use std::time::Duration;

    struct Fixture {
        scheduler: Rc<ManualScheduler>,
        scroll: Rc<VirtualScroll>,
        backend: FakeBackend,
        selection: Rc<FakeSelection>,
        grid: MediaGrid<FakeBackend>,
    }

    fn id(i: usize) -> TileId {
        TileId::new(format!("t{i}"))
    }

    fn videos(n: usize) -> Vec<TileInput> {
        (0..n)
            .map(|i| TileInput::from_path(id(i), format!("/media/clip{i}.webm")).with_size_hint(1, 1))
            .collect()
    }

    fn fixture_with(admission: Option<AdmissionFn>) -> Fixture {
        let scheduler = Rc::new(ManualScheduler::new());
        let scroll = Rc::new(VirtualScroll::new(600.0));
        let backend = FakeBackend::new();
        let selection = Rc::new(FakeSelection::new(Vec::new()));
        let mut builder = MediaGrid::builder(backend.clone())
            .scheduler(scheduler.clone())
            .scroll(scroll.clone())
            .surface(scroll.clone())
            .selection(selection.clone())
            // 1000px at the comfortable zoom: four 244px columns, 8px gap.
            .style(Rc::new(ZoomedStyle::new(ZoomLevel::Comfortable, 8.0, 0.0)))
            .container_width(1000.0);
        if let Some(admission) = admission {
            builder.admission = Some(admission);
        }
        let grid = builder.build().unwrap();
        Fixture {
            scheduler,
            scroll,
            backend,
            selection,
            grid,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(None)
    }

    #[test]
    fn test_builder_requires_host_seams() {
        let result = MediaGrid::builder(FakeBackend::new()).build();
        assert!(matches!(result, Err(GridError::InvalidConfig(_))));
    }

    #[test]
    fn test_loads_only_near_tiles() {
        let f = fixture();
        f.grid.set_items(videos(24));

        // Rows start every 252px; the near band reaches 1200px.
        assert_eq!(f.backend.elements_created(), 20);
        assert_eq!(f.grid.media_state(&id(19)), Some(MediaState::Requested));
        assert_eq!(f.grid.media_state(&id(20)), Some(MediaState::Idle));

        let tile = f.grid.tile(&id(5)).unwrap();
        assert_eq!(tile.assigned_column(), Some(1));
        assert_eq!(tile.visual_order_index, Some(5));
        assert_eq!(f.scroll.content_height(), 6.0 * 252.0 - 8.0);
    }

    #[test]
    fn test_order_reported_only_on_change() {
        let f = fixture();
        let reports = Rc::new(Cell::new(0));
        let counter = reports.clone();
        f.grid.connect_order_changed(move |_| counter.set(counter.get() + 1));

        f.grid.set_items(videos(8));
        f.grid.set_items(videos(8));
        f.grid.set_container_width(1000.2);
        assert_eq!(reports.get(), 1);

        f.grid.set_items(videos(9));
        assert_eq!(reports.get(), 2);
    }

    #[test]
    fn test_aspect_ratios_coalesced_into_one_pass() {
        let f = fixture();
        let passes = Rc::new(RefCell::new(Vec::new()));
        let log = passes.clone();
        f.grid
            .connect_layout_complete(move |trigger, _| log.borrow_mut().push(trigger));
        let loads = Rc::new(Cell::new(0));
        let counter = loads.clone();
        f.grid.connect_load(move |_, _| counter.set(counter.get() + 1));

        f.grid.set_items(videos(4));
        for i in 0..4 {
            f.backend.load_ok(&id(i), 1600, 900);
        }
        f.grid.pump();

        assert_eq!(loads.get(), 4);
        assert_eq!(
            *passes.borrow(),
            vec![LayoutTrigger::ItemsChanged, LayoutTrigger::AspectRatio]
        );
        let tile = f.grid.tile(&id(0)).unwrap();
        assert!((tile.natural_aspect_ratio.unwrap() - 16.0 / 9.0).abs() < 1e-9);
        assert!((tile.placement.unwrap().height - 244.0 * 9.0 / 16.0).abs() < 1e-9);
    }

    #[test]
    fn test_retry_bound_through_grid() {
        let f = fixture();
        let errors = Rc::new(RefCell::new(Vec::new()));
        let log = errors.clone();
        f.grid
            .connect_play_error(move |id, err| log.borrow_mut().push((id.clone(), err.clone())));
        f.grid.set_items(videos(1));
        let clip = id(0);
        assert_eq!(f.backend.created_for(&clip), 1);

        // Soft recovery absorbs the first error, the second is classified.
        f.backend.fail(&clip, MediaErrorCode::Network);
        f.backend.fail(&clip, MediaErrorCode::Network);
        f.grid.pump();
        assert_eq!(f.grid.media_state(&clip), Some(MediaState::TransientError));

        f.scheduler.advance(Duration::from_millis(1199));
        assert_eq!(f.backend.created_for(&clip), 1);
        f.scheduler.advance(Duration::from_millis(1));
        assert_eq!(f.backend.created_for(&clip), 2);

        f.backend.fail(&clip, MediaErrorCode::Network);
        f.backend.fail(&clip, MediaErrorCode::Network);
        f.grid.pump();
        f.scheduler.advance(Duration::from_secs(30));
        f.grid.sweep();
        f.grid.on_scroll();

        assert_eq!(f.backend.created_for(&clip), 2);
        assert_eq!(f.grid.media_state(&clip), Some(MediaState::PermanentError));
        let errors = errors.borrow();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].1.class, ErrorClass::Permanent);
    }

    #[test]
    fn test_file_change_recovers_permanent_tile() {
        let f = fixture();
        let input = TileInput::from_path("clip", "/media/clip.webm")
            .with_signal(FileSignal::new(100, 1));
        f.grid.set_items(vec![input.clone()]);
        let clip = TileId::from("clip");
        for _ in 0..2 {
            f.backend.fail(&clip, MediaErrorCode::Decode);
            f.backend.fail(&clip, MediaErrorCode::Decode);
            f.grid.pump();
            f.scheduler.advance(Duration::from_millis(1200));
        }
        assert_eq!(f.grid.media_state(&clip), Some(MediaState::PermanentError));
        assert_eq!(f.backend.created_for(&clip), 2);

        // Same identity: nothing happens.
        f.grid.set_items(vec![input.clone()]);
        assert_eq!(f.backend.created_for(&clip), 2);

        f.grid
            .set_items(vec![input.with_signal(FileSignal::new(2048, 2))]);
        assert_eq!(f.backend.created_for(&clip), 3);
        assert_eq!(f.grid.media_state(&clip), Some(MediaState::Requested));
        assert!(f.grid.last_error(&clip).is_none());
    }

    #[test]
    fn test_teardown_completes_before_next_request() {
        let f = fixture();
        f.grid.set_items(videos(24));
        let first = id(0);
        f.backend.load_ok(&first, 640, 640);
        f.grid.pump();
        assert_eq!(f.backend.attached_for(&first), 1);

        f.scroll.set_scroll_top(f.scroll.content_height());
        f.grid.on_scroll();
        assert_eq!(f.grid.media_state(&first), Some(MediaState::Idle));
        assert_eq!(f.backend.retained_for(&first), 0);
        assert_eq!(f.backend.attached_for(&first), 0);

        f.scroll.set_scroll_top(0.0);
        f.grid.on_scroll();
        assert_eq!(f.backend.created_for(&first), 2);
        assert_eq!(f.backend.retained_for(&first), 1);
        let calls = f.backend.calls_for(&first);
        let release = calls.iter().position(|c| *c == Call::ReleaseDecoder).unwrap();
        let reload = calls.iter().rposition(|c| *c == Call::SetSource).unwrap();
        assert!(release < reload);
    }

    #[test]
    fn test_removal_tears_down_and_stops_watchdog() {
        let f = fixture();
        f.grid.set_items(videos(2));
        f.grid.set_playing(&id(0), true).unwrap();
        f.backend.load_ok(&id(0), 640, 640);
        f.grid.pump();
        assert_eq!(f.grid.media_state(&id(0)), Some(MediaState::Playing));
        assert!(f.grid.watchdog().is_running());

        f.grid.set_items(Vec::new());
        assert_eq!(f.backend.retained_for(&id(0)), 0);
        assert_eq!(f.backend.retained_for(&id(1)), 0);
        assert!(f.grid.watchdog().is_empty());
        assert!(!f.grid.watchdog().is_running());
        assert!(f.grid.is_empty());
    }

    #[test]
    fn test_stalled_playback_recovered_by_watchdog() {
        let f = fixture();
        f.grid.set_items(videos(1));
        let clip = id(0);
        let played = Rc::new(Cell::new(0));
        let counter = played.clone();
        f.grid.connect_play(move |_| counter.set(counter.get() + 1));
        f.grid.set_playing(&clip, true).unwrap();
        f.backend.load_ok(&clip, 640, 360);
        f.grid.pump();
        assert_eq!(played.get(), 1);

        f.backend.set_time(&clip, 3.0);
        f.backend.clear_calls();
        // Baseline plus three ticks without progress.
        f.scheduler.advance(Duration::from_millis(10_000));
        assert_eq!(
            f.backend.calls_for(&clip),
            vec![Call::Pause, Call::Load, Call::Seek(3.0), Call::Play]
        );
        assert_eq!(f.grid.watchdog().recoveries(&clip), 1);
    }

    #[test]
    fn test_play_requests_need_visibility() {
        let f = fixture();
        f.grid.set_items(videos(24));
        for i in [0, 16] {
            f.grid.set_playing(&id(i), true).unwrap();
            f.backend.load_ok(&id(i), 640, 640);
        }
        f.grid.pump();
        assert_eq!(f.grid.media_state(&id(0)), Some(MediaState::Playing));
        // Near but off-screen: loaded, not playing.
        assert_eq!(f.grid.media_state(&id(16)), Some(MediaState::Loaded));
        assert!(matches!(
            f.grid.set_playing(&TileId::from("missing"), true),
            Err(GridError::UnknownTile(_))
        ));
    }

    #[test]
    fn test_admission_rejection_retried_by_sweep() {
        let open = Rc::new(Cell::new(false));
        let gate = open.clone();
        let f = fixture_with(Some(Box::new(move |q: &AdmissionQuery<'_>| {
            gate.get() && q.in_flight < 2
        })));
        f.grid.set_items(videos(4));
        assert_eq!(f.backend.elements_created(), 0);
        assert_eq!(f.grid.media_state(&id(0)), Some(MediaState::Idle));

        open.set(true);
        f.grid.start();
        f.scheduler.advance(Duration::from_secs(1));
        assert_eq!(f.backend.elements_created(), 2);

        f.backend.load_ok(&id(0), 640, 640);
        f.backend.load_ok(&id(1), 640, 640);
        // The pump task drains the events, the next sweep admits the rest.
        f.scheduler.advance(Duration::from_secs(1));
        assert_eq!(f.backend.elements_created(), 4);

        f.grid.stop();
        assert!(!f.grid.is_started());
    }

    #[test]
    fn test_on_loan_element_kept_while_off_screen() {
        let f = fixture();
        f.grid.set_items(videos(24));
        let first = id(0);
        f.backend.load_ok(&first, 640, 640);
        f.grid.pump();
        f.grid.set_on_loan(&first, true).unwrap();

        f.scroll.set_scroll_top(f.scroll.content_height());
        f.grid.on_scroll();
        assert_eq!(f.backend.retained_for(&first), 1);

        f.grid.set_on_loan(&first, false).unwrap();
        assert_eq!(f.backend.retained_for(&first), 0);
    }

    #[test]
    fn test_zoom_keeps_selected_tile_in_place() {
        let f = fixture();
        f.grid.set_items(videos(24));
        f.scroll.set_scroll_top(400.0);
        f.grid.on_scroll();
        f.selection.select(&["t9"]);
        let layout = f.grid.layout().unwrap();
        let before = layout.placement(&id(9)).unwrap().rect().center_y() - f.scroll.scroll_top();

        f.grid.set_zoom(ZoomLevel::Large);
        assert_eq!(f.grid.layout().unwrap().metrics.column_count, 2);
        f.scheduler.run_frames(6);

        let layout = f.grid.layout().unwrap();
        let after = layout.placement(&id(9)).unwrap().rect().center_y() - f.scroll.scroll_top();
        assert!((after - before).abs() < 1.0);
        assert_eq!(f.grid.anchor().stats().applied, 1);
    }

    #[test]
    fn test_removed_tiles_leave_the_scroll_geometry() {
        let f = fixture();
        f.grid.set_items(videos(3));
        assert!(f.scroll.rect(&id(2)).is_some());

        f.grid.set_items(videos(1));
        assert!(f.scroll.rect(&id(0)).is_some());
        assert_eq!(f.scroll.rect(&id(1)), None);
        assert_eq!(f.scroll.rect(&id(2)), None);
    }

    #[test]
    fn test_removal_patches_reach_the_render_surface() {
        let scroll = Rc::new(VirtualScroll::new(600.0));
        let surface = Rc::new(RefCell::new(RecordingSurface::new()));
        let grid = MediaGrid::builder(FakeBackend::new())
            .scheduler(Rc::new(ManualScheduler::new()))
            .scroll(scroll)
            .surface(surface.clone())
            .container_width(1000.0)
            .build()
            .unwrap();

        grid.set_items(videos(6));
        assert_eq!(surface.borrow().rects.len(), 6);
        let batches = surface.borrow().batches;

        grid.set_items(videos(6).into_iter().skip(4).collect());
        let surface = surface.borrow();
        assert!(surface.batches > batches);
        assert_eq!(surface.rects.len(), 2);
        assert!(surface.rect(&id(0)).is_none());
        assert!(surface.rect(&id(4)).is_some());
        // Survivors move up to the first row.
        assert_eq!(surface.rect(&id(5)).map(|r| r.y), Some(0.0));
        assert_eq!(surface.content_height, 244.0);
    }

    #[test]
    fn test_zoom_keeps_first_visible_tile_in_host_order() {
        let f = fixture();
        f.grid.set_items(videos(24));
        f.selection.set_order((0..24).map(id).collect());
        f.scroll.set_scroll_top(400.0);
        f.grid.on_scroll();
        // Row 1 is the topmost row crossing the viewport; t4 leads it.
        let layout = f.grid.layout().unwrap();
        let before = layout.placement(&id(4)).unwrap().rect().center_y() - f.scroll.scroll_top();

        f.grid.set_zoom(ZoomLevel::Large);
        f.scheduler.run_frames(6);

        let layout = f.grid.layout().unwrap();
        let after = layout.placement(&id(4)).unwrap().rect().center_y() - f.scroll.scroll_top();
        assert!((after - before).abs() < 1.0);
        assert_eq!(f.grid.anchor().stats().applied, 1);
    }

    #[test]
    fn test_zoom_without_host_order_has_no_anchor() {
        let f = fixture();
        f.grid.set_items(videos(24));
        f.scroll.set_scroll_top(400.0);
        f.grid.on_scroll();
        f.grid.set_zoom(ZoomLevel::Large);
        f.scheduler.run_frames(6);
        assert_eq!(f.grid.anchor().stats().applied, 0);
    }

    #[test]
    fn test_zoom_anchors_on_visual_order_without_selection_source() {
        let scheduler = Rc::new(ManualScheduler::new());
        let scroll = Rc::new(VirtualScroll::new(600.0));
        let grid = MediaGrid::builder(FakeBackend::new())
            .scheduler(scheduler.clone())
            .scroll(scroll.clone())
            .surface(scroll.clone())
            .style(Rc::new(ZoomedStyle::new(ZoomLevel::Comfortable, 8.0, 0.0)))
            .container_width(1000.0)
            .build()
            .unwrap();
        grid.set_items(videos(24));
        scroll.set_scroll_top(400.0);
        grid.on_scroll();
        let before = grid.layout().unwrap().placement(&id(4)).unwrap().rect().center_y() - scroll.scroll_top();

        grid.set_zoom(ZoomLevel::Large);
        scheduler.run_frames(6);

        let after = grid.layout().unwrap().placement(&id(4)).unwrap().rect().center_y() - scroll.scroll_top();
        assert!((after - before).abs() < 1.0);
        assert_eq!(grid.anchor().stats().applied, 1);
    }

    #[test]
    fn test_pause_during_recovery_applied_through_grid() {
        let f = fixture();
        f.grid.set_items(videos(1));
        let clip = id(0);
        let paused = Rc::new(Cell::new(0));
        let counter = paused.clone();
        f.grid.connect_pause(move |_| counter.set(counter.get() + 1));
        f.grid.set_playing(&clip, true).unwrap();
        f.backend.load_ok(&clip, 640, 360);
        f.grid.pump();
        assert_eq!(f.grid.media_state(&clip), Some(MediaState::Playing));

        f.backend.fail(&clip, MediaErrorCode::Network);
        f.grid.pump();
        f.grid.set_playing(&clip, false).unwrap();
        assert_eq!(paused.get(), 0);

        f.backend.emit(&clip, MediaEvent::Playing);
        f.grid.pump();
        assert_eq!(paused.get(), 1);
        assert_eq!(f.grid.media_state(&clip), Some(MediaState::Paused));
        assert_eq!(f.backend.paused_for(&clip), Some(true));
    }

    #[test]
    fn test_watchdog_recovery_with_rejected_resume_schedules_retry() {
        let f = fixture();
        f.grid.set_items(videos(1));
        let clip = id(0);
        f.grid.set_playing(&clip, true).unwrap();
        f.backend.load_ok(&clip, 640, 360);
        f.grid.pump();
        f.backend.set_time(&clip, 3.0);
        f.backend.fail_next_play(&clip, MediaErrorCode::Network);

        f.scheduler.advance(Duration::from_millis(10_000));
        assert_eq!(f.grid.media_state(&clip), Some(MediaState::TransientError));
        assert_eq!(f.backend.retained_for(&clip), 0);
        assert!(!f.grid.watchdog().is_running());

        f.scheduler.advance(Duration::from_millis(1200));
        assert_eq!(f.backend.created_for(&clip), 2);
    }

    #[test]
    fn test_focus_reveals_offscreen_selection() {
        let f = fixture();
        f.grid.set_items(videos(24));
        f.selection.select(&["t22"]);
        assert!(f.grid.focus_current_anchor(FocusMode::Nudge));
        let rect = f.grid.layout().unwrap().placement(&id(22)).unwrap().rect();
        assert!((f.scroll.scroll_top() - (rect.bottom() - 600.0)).abs() < 1e-6);
        assert_eq!(f.grid.media_state(&id(22)), Some(MediaState::Requested));
    }
}
