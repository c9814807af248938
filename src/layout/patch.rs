//! Render patches.
//!
//! Layout never touches host nodes directly. Each pass produces `NodePatch`
//! records which a [`RenderSurface`] applies to whatever toolkit owns the
//! tiles.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::models::{Placement, Rect, TileId};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PatchTarget {
    Tile(TileId),
    /// The grid container itself.
    Container,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Patch {
    Place {
        x: f64,
        y: f64,
        width: f64,
        height: f64,
    },
    ContentHeight(f64),
    /// The tile left the item set.
    Remove,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodePatch {
    pub target: PatchTarget,
    pub patch: Patch,
}

impl NodePatch {
    pub fn place(id: TileId, placement: &Placement) -> Self {
        Self {
            target: PatchTarget::Tile(id),
            patch: Patch::Place {
                x: placement.x,
                y: placement.y,
                width: placement.width,
                height: placement.height,
            },
        }
    }

    pub fn remove(id: TileId) -> Self {
        Self {
            target: PatchTarget::Tile(id),
            patch: Patch::Remove,
        }
    }

    pub fn content_height(height: f64) -> Self {
        Self {
            target: PatchTarget::Container,
            patch: Patch::ContentHeight(height),
        }
    }
}

/// Applies patches to host nodes.
pub trait RenderSurface {
    fn apply(&mut self, patches: &[NodePatch]);
}

impl<T: RenderSurface> RenderSurface for Rc<RefCell<T>> {
    fn apply(&mut self, patches: &[NodePatch]) {
        self.borrow_mut().apply(patches);
    }
}

/// Headless surface that keeps the latest geometry of every node.
#[derive(Debug, Default)]
pub struct RecordingSurface {
    pub rects: HashMap<TileId, Rect>,
    pub content_height: f64,
    pub batches: usize,
    pub patches_applied: usize,
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rect(&self, id: &TileId) -> Option<Rect> {
        self.rects.get(id).copied()
    }
}

impl RenderSurface for RecordingSurface {
    fn apply(&mut self, patches: &[NodePatch]) {
        self.batches += 1;
        self.patches_applied += patches.len();
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
                    self.rects.insert(id.clone(), Rect::new(x, y, width, height));
                }
                (PatchTarget::Tile(id), Patch::Remove) => {
                    self.rects.remove(id);
                }
                (PatchTarget::Container, Patch::ContentHeight(h)) => self.content_height = h,
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_surface_tracks_latest_geometry() {
        let mut surface = RecordingSurface::new();
        let a = TileId::from("a");
        let b = TileId::from("b");
        surface.apply(&[
            NodePatch {
                target: PatchTarget::Tile(a.clone()),
                patch: Patch::Place { x: 0.0, y: 0.0, width: 10.0, height: 20.0 },
            },
            NodePatch {
                target: PatchTarget::Tile(b.clone()),
                patch: Patch::Place { x: 12.0, y: 0.0, width: 10.0, height: 10.0 },
            },
            NodePatch::content_height(20.0),
        ]);
        surface.apply(&[NodePatch::remove(a.clone()), NodePatch::content_height(10.0)]);

        assert_eq!(surface.rect(&a), None);
        assert_eq!(surface.rect(&b), Some(Rect::new(12.0, 0.0, 10.0, 10.0)));
        assert_eq!(surface.content_height, 10.0);
        assert_eq!(surface.batches, 2);
        assert_eq!(surface.patches_applied, 5);
    }
}
