//! GTK render surface and scroll container.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use gtk4::prelude::*;
use gtk4::{Box as GtkBox, Fixed, Orientation, Overflow, PolicyType, ScrolledWindow};
use tracing::trace;

use crate::grid::ScrollContainer;
use crate::layout::{
    GridStyle, NodePatch, Patch, PatchTarget, RenderSurface, StyleSource, ZoomLevel, ZoomedStyle,
};
use crate::models::TileId;

/// Absolutely positioned tile frames inside a vertically scrolling `Fixed`.
///
/// Each tile gets a `GtkBox` frame created on first use; media elements
/// attach their widget into it. Clones share the same widgets.
#[derive(Clone)]
pub struct GtkGridSurface {
    scrolled: ScrolledWindow,
    fixed: Fixed,
    frames: Rc<RefCell<HashMap<TileId, GtkBox>>>,
}

impl GtkGridSurface {
    pub fn new() -> Self {
        let fixed = Fixed::new();
        fixed.add_css_class("media-grid");
        fixed.set_hexpand(true);

        let scrolled = ScrolledWindow::new();
        scrolled.set_hscrollbar_policy(PolicyType::Never);
        scrolled.set_vscrollbar_policy(PolicyType::Automatic);
        scrolled.set_vexpand(true);
        scrolled.set_child(Some(&fixed));

        Self {
            scrolled,
            fixed,
            frames: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    /// The widget to pack into the host window.
    pub fn widget(&self) -> &ScrolledWindow {
        &self.scrolled
    }

    pub fn grid_widget(&self) -> &Fixed {
        &self.fixed
    }

    /// Frame for `id`, created and placed at the origin if missing.
    pub fn frame(&self, id: &TileId) -> GtkBox {
        if let Some(frame) = self.frames.borrow().get(id) {
            return frame.clone();
        }
        let frame = GtkBox::new(Orientation::Vertical, 0);
        frame.add_css_class("media-tile");
        frame.set_overflow(Overflow::Hidden);
        frame.set_widget_name(id.as_str());
        self.fixed.put(&frame, 0.0, 0.0);
        self.frames.borrow_mut().insert(id.clone(), frame.clone());
        frame
    }

    /// Drops the frame of a tile that left the item set.
    pub fn remove_tile(&self, id: &TileId) {
        let frame = self.frames.borrow_mut().remove(id);
        if let Some(frame) = frame {
            self.fixed.remove(&frame);
        }
    }

    /// Drops every frame whose tile is not in `keep`.
    pub fn retain_tiles(&self, keep: &[TileId]) {
        let stale: Vec<TileId> = self
            .frames
            .borrow()
            .keys()
            .filter(|id| !keep.contains(id))
            .cloned()
            .collect();
        for id in stale {
            self.remove_tile(&id);
        }
    }

    /// Calls `f` whenever the vertical scroll offset changes.
    pub fn connect_scrolled<F: Fn() + 'static>(&self, f: F) -> glib::SignalHandlerId {
        self.scrolled
            .vadjustment()
            .connect_value_changed(move |_| f())
    }

    /// Calls `f` with the new width whenever the grid is resized horizontally.
    pub fn connect_width_changed<F: Fn(f64) + 'static>(&self, f: F) -> glib::SignalHandlerId {
        self.scrolled
            .hadjustment()
            .connect_page_size_notify(move |adj| f(adj.page_size()))
    }
}

impl Default for GtkGridSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderSurface for GtkGridSurface {
    fn apply(&mut self, patches: &[NodePatch]) {
        trace!(patches = patches.len(), "Applying grid patches");
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
                ) => {
                    let frame = self.frame(id);
                    frame.set_size_request(width.round() as i32, height.round() as i32);
                    self.fixed.move_(&frame, x.round(), y.round());
                }
                (PatchTarget::Tile(id), Patch::Remove) => self.remove_tile(id),
                (PatchTarget::Container, Patch::ContentHeight(height)) => {
                    self.fixed.set_size_request(-1, height.ceil() as i32);
                }
                _ => {}
            }
        }
    }
}

impl ScrollContainer for GtkGridSurface {
    fn scroll_top(&self) -> f64 {
        self.scrolled.vadjustment().value()
    }

    fn set_scroll_top(&self, value: f64) {
        let adj = self.scrolled.vadjustment();
        let max = (adj.upper() - adj.page_size()).max(adj.lower());
        adj.set_value(value.clamp(adj.lower(), max));
    }

    fn viewport_height(&self) -> f64 {
        self.scrolled.vadjustment().page_size()
    }
}

/// Zoom class swapping on the grid widget. GTK has no CSS grid, so the
/// track list itself is resolved by [`ZoomedStyle`].
pub struct GtkZoomStyle {
    widget: Fixed,
    tracks: ZoomedStyle,
}

impl GtkZoomStyle {
    pub fn new(surface: &GtkGridSurface, zoom: ZoomLevel, gap: f64, padding: f64) -> Self {
        let widget = surface.grid_widget().clone();
        widget.add_css_class(zoom.class_name());
        Self {
            widget,
            tracks: ZoomedStyle::new(zoom, gap, padding),
        }
    }
}

impl StyleSource for GtkZoomStyle {
    fn computed_grid_style(&self, container_width: f64) -> GridStyle {
        self.tracks.computed_grid_style(container_width)
    }

    fn swap_zoom_class(&self, from: ZoomLevel, to: ZoomLevel) {
        self.widget.remove_css_class(from.class_name());
        self.widget.add_css_class(to.class_name());
        self.tracks.swap_zoom_class(from, to);
    }
}
