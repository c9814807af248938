//! Visibility registry.
//!
//! Many per-tile subscriptions share one underlying [`ViewportWatcher`]. The
//! watcher is asked to observe an id when its first subscriber arrives and to
//! stop when the last one leaves. Raw watcher entries are folded into per-tile
//! `visible`/`near` state, and only actual transitions reach listeners.

use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use tracing::trace;

use crate::layout::{LayoutResult, RecordingSurface};
use crate::models::{Rect, TileId};

/// Visible band of the scroll container, in grid content coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Viewport {
    pub top: f64,
    pub height: f64,
}

impl Viewport {
    pub fn new(top: f64, height: f64) -> Self {
        Self { top, height }
    }

    pub fn bottom(&self) -> f64 {
        self.top + self.height
    }
}

/// One watcher observation for one tile.
#[derive(Debug, Clone, PartialEq)]
pub struct VisibilityEntry {
    pub id: TileId,
    pub rect: Rect,
    pub viewport: Viewport,
    pub intersecting: bool,
}

impl VisibilityEntry {
    /// Builds an entry by intersecting `rect` with the viewport band.
    pub fn measure(id: TileId, rect: Rect, viewport: Viewport) -> Self {
        let intersecting = rect.intersects_band(viewport.top, viewport.bottom());
        Self {
            id,
            rect,
            viewport,
            intersecting,
        }
    }
}

/// What to do with an entry whose rect has collapsed to zero by zero (a tile
/// that is being re-parented or whose content was momentarily removed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollapsePolicy {
    /// Keep reporting visible if the tile was visible before it collapsed.
    #[default]
    AssumeVisibleIfPreviouslyVisible,
    /// Collapsed tiles are hidden.
    TreatAsHidden,
}

/// Geometry lookup used by pull-based watchers.
pub trait GeometrySource {
    fn rect(&self, id: &TileId) -> Option<Rect>;
}

impl GeometrySource for LayoutResult {
    fn rect(&self, id: &TileId) -> Option<Rect> {
        self.placement(id).map(|p| p.rect())
    }
}

impl GeometrySource for RecordingSurface {
    fn rect(&self, id: &TileId) -> Option<Rect> {
        RecordingSurface::rect(self, id)
    }
}

impl GeometrySource for HashMap<TileId, Rect> {
    fn rect(&self, id: &TileId) -> Option<Rect> {
        self.get(id).copied()
    }
}

/// Current viewport plus a way to measure tiles.
pub struct ViewportSnapshot<'a> {
    pub viewport: Viewport,
    pub geometry: &'a dyn GeometrySource,
}

/// The single underlying observer shared by every subscription.
pub trait ViewportWatcher {
    fn observe(&mut self, id: &TileId);
    fn unobserve(&mut self, id: &TileId);
    /// Entries for observed tiles given the current viewport.
    fn poll(&mut self, snapshot: &ViewportSnapshot<'_>) -> Vec<VisibilityEntry>;
}

/// Headless watcher that measures observed tiles against the viewport.
///
/// Tiles without geometry are reported with a collapsed rect.
#[derive(Debug, Default)]
pub struct GeometryWatcher {
    observed: BTreeSet<TileId>,
}

impl GeometryWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observed_count(&self) -> usize {
        self.observed.len()
    }

    pub fn is_observing(&self, id: &TileId) -> bool {
        self.observed.contains(id)
    }
}

impl ViewportWatcher for GeometryWatcher {
    fn observe(&mut self, id: &TileId) {
        self.observed.insert(id.clone());
    }

    fn unobserve(&mut self, id: &TileId) {
        self.observed.remove(id);
    }

    fn poll(&mut self, snapshot: &ViewportSnapshot<'_>) -> Vec<VisibilityEntry> {
        self.observed
            .iter()
            .map(|id| {
                let rect = snapshot.geometry.rect(id).unwrap_or_default();
                VisibilityEntry::measure(id.clone(), rect, snapshot.viewport)
            })
            .collect()
    }
}

impl<W: ViewportWatcher> ViewportWatcher for Rc<std::cell::RefCell<W>> {
    fn observe(&mut self, id: &TileId) {
        self.borrow_mut().observe(id);
    }

    fn unobserve(&mut self, id: &TileId) {
        self.borrow_mut().unobserve(id);
    }

    fn poll(&mut self, snapshot: &ViewportSnapshot<'_>) -> Vec<VisibilityEntry> {
        self.borrow_mut().poll(snapshot)
    }
}

pub type NearPredicate = Box<dyn Fn(&VisibilityEntry) -> bool>;
pub type VisibilityListener = Rc<dyn Fn(&VisibilityTransition)>;

/// "Near" = intersects the viewport grown by `margin_viewports` viewport
/// heights above and below.
pub fn margin_near(margin_viewports: f64) -> NearPredicate {
    let margin = margin_viewports.max(0.0);
    Box::new(move |entry: &VisibilityEntry| {
        let extra = entry.viewport.height * margin;
        entry.rect.intersects_band(
            entry.viewport.top - extra,
            entry.viewport.bottom() + extra,
        )
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileVisibility {
    pub visible: bool,
    pub near: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisibilityTransition {
    pub id: TileId,
    pub visible: bool,
    pub near: bool,
    pub visible_changed: bool,
    pub near_changed: bool,
    pub entry: VisibilityEntry,
}

pub type SubscriptionId = u64;

/// Transitions from one dispatch, with the listeners still to be notified.
///
/// Listeners are not invoked inside [`VisibilityRegistry::dispatch`] so the
/// caller can release its own borrows first.
pub struct VisibilityDispatch {
    pub transitions: Vec<VisibilityTransition>,
    pending: Vec<(VisibilityListener, usize)>,
}

impl VisibilityDispatch {
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    pub fn notify(&self) {
        for (listener, index) in &self.pending {
            listener(&self.transitions[*index]);
        }
    }
}

pub struct VisibilityRegistry {
    watcher: Box<dyn ViewportWatcher>,
    near: NearPredicate,
    collapse_policy: CollapsePolicy,
    next_subscription: SubscriptionId,
    subscriptions: HashMap<SubscriptionId, TileId>,
    listeners: HashMap<TileId, Vec<(SubscriptionId, VisibilityListener)>>,
    state: HashMap<TileId, TileVisibility>,
}

impl VisibilityRegistry {
    pub fn new(watcher: Box<dyn ViewportWatcher>, collapse_policy: CollapsePolicy) -> Self {
        Self {
            watcher,
            near: margin_near(1.0),
            collapse_policy,
            next_subscription: 1,
            subscriptions: HashMap::new(),
            listeners: HashMap::new(),
            state: HashMap::new(),
        }
    }

    /// Replaces the "near" predicate used for pre-emptive loading.
    pub fn set_near_predicate(&mut self, near: NearPredicate) {
        self.near = near;
    }

    pub fn observe(&mut self, id: &TileId, listener: VisibilityListener) -> SubscriptionId {
        let subscription = self.next_subscription;
        self.next_subscription += 1;

        let listeners = self.listeners.entry(id.clone()).or_default();
        if listeners.is_empty() {
            self.watcher.observe(id);
        }
        listeners.push((subscription, listener));
        self.subscriptions.insert(subscription, id.clone());
        subscription
    }

    /// Drops one subscription. The watcher stops observing the tile once its
    /// last subscription is gone, and the tile's state is forgotten.
    pub fn unobserve(&mut self, subscription: SubscriptionId) {
        let Some(id) = self.subscriptions.remove(&subscription) else {
            return;
        };
        let now_empty = match self.listeners.get_mut(&id) {
            Some(listeners) => {
                listeners.retain(|(s, _)| *s != subscription);
                listeners.is_empty()
            }
            None => true,
        };
        if now_empty {
            self.listeners.remove(&id);
            self.state.remove(&id);
            self.watcher.unobserve(&id);
        }
    }

    pub fn subscriber_count(&self, id: &TileId) -> usize {
        self.listeners.get(id).map_or(0, Vec::len)
    }

    pub fn state(&self, id: &TileId) -> TileVisibility {
        self.state.get(id).copied().unwrap_or_default()
    }

    pub fn is_visible(&self, id: &TileId) -> bool {
        self.state(id).visible
    }

    pub fn is_near(&self, id: &TileId) -> bool {
        self.state(id).near
    }

    /// Pulls fresh entries from the watcher and dispatches them.
    pub fn refresh(&mut self, snapshot: &ViewportSnapshot<'_>) -> VisibilityDispatch {
        let entries = self.watcher.poll(snapshot);
        self.dispatch(entries)
    }

    /// Folds watcher entries into per-tile state. Entries for tiles without
    /// subscribers are ignored.
    pub fn dispatch(&mut self, entries: Vec<VisibilityEntry>) -> VisibilityDispatch {
        let mut transitions = Vec::new();
        let mut pending = Vec::new();

        for entry in entries {
            let Some(listeners) = self.listeners.get(&entry.id) else {
                continue;
            };
            let previous = self.state.get(&entry.id).copied();
            let was_visible = previous.map_or(false, |s| s.visible);

            let visible = if entry.rect.is_collapsed() {
                match self.collapse_policy {
                    CollapsePolicy::AssumeVisibleIfPreviouslyVisible => was_visible,
                    CollapsePolicy::TreatAsHidden => false,
                }
            } else {
                entry.intersecting
            };
            let near = visible || (!entry.rect.is_collapsed() && (self.near)(&entry));
            let next = TileVisibility { visible, near };

            if previous == Some(next) {
                continue;
            }
            let previous = previous.unwrap_or_default();
            self.state.insert(entry.id.clone(), next);

            trace!(tile = %entry.id, visible, near, "Visibility transition");
            let index = transitions.len();
            pending.extend(listeners.iter().map(|(_, l)| (l.clone(), index)));
            transitions.push(VisibilityTransition {
                id: entry.id.clone(),
                visible,
                near,
                visible_changed: previous.visible != visible,
                near_changed: previous.near != near,
                entry,
            });
        }

        VisibilityDispatch {
            transitions,
            pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn registry() -> (VisibilityRegistry, Rc<RefCell<GeometryWatcher>>) {
        let watcher = Rc::new(RefCell::new(GeometryWatcher::new()));
        let registry = VisibilityRegistry::new(
            Box::new(watcher.clone()),
            CollapsePolicy::AssumeVisibleIfPreviouslyVisible,
        );
        (registry, watcher)
    }

    fn noop() -> VisibilityListener {
        Rc::new(|_| {})
    }

    #[test]
    fn test_watcher_observes_once_per_tile() {
        let (mut registry, watcher) = registry();
        let id = TileId::from("a");
        let first = registry.observe(&id, noop());
        let second = registry.observe(&id, noop());
        assert_eq!(watcher.borrow().observed_count(), 1);
        assert_eq!(registry.subscriber_count(&id), 2);

        registry.unobserve(first);
        assert!(watcher.borrow().is_observing(&id));
        registry.unobserve(second);
        assert!(!watcher.borrow().is_observing(&id));
        // Unknown subscriptions are ignored
        registry.unobserve(second);
    }

    #[test]
    fn test_transitions_reach_every_listener_once() {
        let (mut registry, _watcher) = registry();
        let id = TileId::from("a");
        let seen = Rc::new(RefCell::new(Vec::new()));
        for _ in 0..2 {
            let seen = seen.clone();
            registry.observe(&id, Rc::new(move |t| seen.borrow_mut().push(t.visible)));
        }

        let mut rects = HashMap::new();
        rects.insert(id.clone(), Rect::new(0.0, 100.0, 50.0, 50.0));
        let snapshot = ViewportSnapshot {
            viewport: Viewport::new(0.0, 500.0),
            geometry: &rects,
        };

        let dispatch = registry.refresh(&snapshot);
        assert_eq!(dispatch.transitions.len(), 1);
        dispatch.notify();
        assert_eq!(*seen.borrow(), vec![true, true]);

        // Same geometry again: no transition
        let dispatch = registry.refresh(&snapshot);
        assert!(dispatch.is_empty());
    }

    #[test]
    fn test_near_band_extends_past_viewport() {
        let (mut registry, _watcher) = registry();
        let near_id = TileId::from("near");
        let far_id = TileId::from("far");
        registry.observe(&near_id, noop());
        registry.observe(&far_id, noop());

        let mut rects = HashMap::new();
        rects.insert(near_id.clone(), Rect::new(0.0, 700.0, 50.0, 50.0));
        rects.insert(far_id.clone(), Rect::new(0.0, 1200.0, 50.0, 50.0));
        let snapshot = ViewportSnapshot {
            viewport: Viewport::new(0.0, 500.0),
            geometry: &rects,
        };
        registry.refresh(&snapshot);

        assert!(!registry.is_visible(&near_id));
        assert!(registry.is_near(&near_id));
        assert!(!registry.is_near(&far_id));
    }

    #[test]
    fn test_custom_near_predicate() {
        let (mut registry, _watcher) = registry();
        registry.set_near_predicate(Box::new(|_| false));
        let id = TileId::from("a");
        registry.observe(&id, noop());
        let entry = VisibilityEntry::measure(
            id.clone(),
            Rect::new(0.0, 600.0, 10.0, 10.0),
            Viewport::new(0.0, 500.0),
        );
        let dispatch = registry.dispatch(vec![entry]);
        assert!(dispatch.is_empty() || !dispatch.transitions[0].near);
        assert!(!registry.is_near(&id));
    }

    #[test]
    fn test_collapsed_rect_keeps_previous_visibility() {
        let (mut registry, _watcher) = registry();
        let id = TileId::from("a");
        registry.observe(&id, noop());
        let viewport = Viewport::new(0.0, 500.0);

        registry.dispatch(vec![VisibilityEntry::measure(
            id.clone(),
            Rect::new(0.0, 0.0, 10.0, 10.0),
            viewport,
        )]);
        assert!(registry.is_visible(&id));

        registry.dispatch(vec![VisibilityEntry::measure(
            id.clone(),
            Rect::default(),
            viewport,
        )]);
        assert!(registry.is_visible(&id));
    }

    #[test]
    fn test_collapsed_rect_hidden_when_never_visible() {
        let (mut registry, _watcher) = registry();
        let id = TileId::from("a");
        registry.observe(&id, noop());
        registry.dispatch(vec![VisibilityEntry::measure(
            id.clone(),
            Rect::default(),
            Viewport::new(0.0, 500.0),
        )]);
        assert!(!registry.is_visible(&id));
        assert!(!registry.is_near(&id));
    }

    #[test]
    fn test_treat_as_hidden_policy() {
        let mut registry = VisibilityRegistry::new(
            Box::new(GeometryWatcher::new()),
            CollapsePolicy::TreatAsHidden,
        );
        let id = TileId::from("a");
        registry.observe(&id, noop());
        let viewport = Viewport::new(0.0, 500.0);
        registry.dispatch(vec![VisibilityEntry::measure(
            id.clone(),
            Rect::new(0.0, 0.0, 10.0, 10.0),
            viewport,
        )]);
        let dispatch = registry.dispatch(vec![VisibilityEntry::measure(
            id.clone(),
            Rect::default(),
            viewport,
        )]);
        assert!(dispatch.transitions[0].visible_changed);
        assert!(!registry.is_visible(&id));
    }

    #[test]
    fn test_entries_for_unobserved_tiles_are_ignored() {
        let (mut registry, _watcher) = registry();
        let dispatch = registry.dispatch(vec![VisibilityEntry::measure(
            TileId::from("ghost"),
            Rect::new(0.0, 0.0, 10.0, 10.0),
            Viewport::new(0.0, 100.0),
        )]);
        assert!(dispatch.is_empty());
    }
}
