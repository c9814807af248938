use super::TileId;

/// Axis-aligned rectangle in grid content coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn center_y(&self) -> f64 {
        self.y + self.height / 2.0
    }

    pub fn is_collapsed(&self) -> bool {
        self.width <= 0.0 && self.height <= 0.0
    }

    /// Vertical overlap test against the band `[top, bottom)`.
    pub fn intersects_band(&self, top: f64, bottom: f64) -> bool {
        self.height > 0.0 && self.y < bottom && self.bottom() > top
    }
}

/// Where one tile landed in a layout pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub column: usize,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Placement {
    pub fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.width, self.height)
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }
}

/// A grid cell as the host sees it after layout and loading.
#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    pub id: TileId,
    /// Known once the media reports its metadata (or from a size hint).
    pub natural_aspect_ratio: Option<f64>,
    pub placement: Option<Placement>,
    pub visual_order_index: Option<usize>,
}

impl Tile {
    pub fn new(id: TileId) -> Self {
        Self {
            id,
            natural_aspect_ratio: None,
            placement: None,
            visual_order_index: None,
        }
    }

    pub fn assigned_column(&self) -> Option<usize> {
        self.placement.map(|p| p.column)
    }
}
