//! Layout metrics resolved from the grid container's computed style.
//!
//! The column count is whatever the active style rule declares (its resolved
//! track list), so the engine follows responsive rules and zoom classes
//! instead of second-guessing them from the container width.

use std::cell::Cell;

use tracing::warn;

use crate::error::{GridError, GridResult};

/// The part of the container's computed style the engine reads.
#[derive(Debug, Clone, PartialEq)]
pub struct GridStyle {
    /// Resolved track list, e.g. `"240px 240px 240px"` or `"repeat(3, 240px)"`.
    pub grid_template_columns: String,
    /// e.g. `"12px"` or `"normal"`.
    pub column_gap: String,
    pub padding_left: String,
    pub padding_right: String,
}

impl GridStyle {
    pub fn new(columns: &str, gap: &str) -> Self {
        Self {
            grid_template_columns: columns.to_string(),
            column_gap: gap.to_string(),
            padding_left: "0px".to_string(),
            padding_right: "0px".to_string(),
        }
    }

    pub fn with_padding(mut self, left: &str, right: &str) -> Self {
        self.padding_left = left.to_string();
        self.padding_right = right.to_string();
        self
    }
}

/// Supplies the grid container's computed style.
pub trait StyleSource {
    /// `container_width` is only a hint for headless sources; a real computed
    /// style already reflects the container it was resolved against.
    fn computed_grid_style(&self, container_width: f64) -> GridStyle;

    /// Swaps the zoom-level class on the grid container.
    fn swap_zoom_class(&self, from: ZoomLevel, to: ZoomLevel);
}

/// Zoom levels, each backed by a class on the grid container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ZoomLevel {
    Compact,
    #[default]
    Comfortable,
    Large,
}

impl ZoomLevel {
    pub fn class_name(&self) -> &'static str {
        match self {
            Self::Compact => "zoom-compact",
            Self::Comfortable => "zoom-comfortable",
            Self::Large => "zoom-large",
        }
    }

    /// Minimum track width declared by the zoom class.
    pub fn min_track_width(&self) -> f64 {
        match self {
            Self::Compact => 160.0,
            Self::Comfortable => 240.0,
            Self::Large => 360.0,
        }
    }

    pub fn zoom_in(&self) -> Self {
        match self {
            Self::Compact => Self::Comfortable,
            Self::Comfortable | Self::Large => Self::Large,
        }
    }

    pub fn zoom_out(&self) -> Self {
        match self {
            Self::Large => Self::Comfortable,
            Self::Comfortable | Self::Compact => Self::Compact,
        }
    }
}

/// Headless style source emulating `repeat(auto-fill, minmax(<zoom min>, 1fr))`.
#[derive(Debug)]
pub struct ZoomedStyle {
    zoom: Cell<ZoomLevel>,
    gap: f64,
    padding: f64,
}

impl ZoomedStyle {
    pub fn new(zoom: ZoomLevel, gap: f64, padding: f64) -> Self {
        Self {
            zoom: Cell::new(zoom),
            gap,
            padding,
        }
    }

    pub fn zoom(&self) -> ZoomLevel {
        self.zoom.get()
    }
}

impl Default for ZoomedStyle {
    fn default() -> Self {
        Self::new(ZoomLevel::default(), 8.0, 0.0)
    }
}

impl StyleSource for ZoomedStyle {
    fn computed_grid_style(&self, container_width: f64) -> GridStyle {
        let inner = (container_width - 2.0 * self.padding).max(0.0);
        let min = self.zoom.get().min_track_width();
        let count = (((inner + self.gap) / (min + self.gap)).floor() as usize).max(1);
        let track = ((inner - self.gap * (count - 1) as f64) / count as f64).max(0.0);
        GridStyle {
            grid_template_columns: format!("repeat({count}, {track:.3}px)"),
            column_gap: format!("{}px", self.gap),
            padding_left: format!("{}px", self.padding),
            padding_right: format!("{}px", self.padding),
        }
    }

    fn swap_zoom_class(&self, _from: ZoomLevel, to: ZoomLevel) {
        self.zoom.set(to);
    }
}

/// Column geometry for one layout pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayoutMetrics {
    pub column_count: usize,
    pub column_width: f64,
    pub gap: f64,
    pub padding_left: f64,
    pub padding_right: f64,
}

impl LayoutMetrics {
    /// Resolves metrics from computed style. Unparseable values degrade to a
    /// single column / the fallback gap / zero padding instead of failing the pass.
    pub fn resolve(style: &GridStyle, container_width: f64, fallback_gap: f64) -> Self {
        let column_count = parse_track_count(&style.grid_template_columns).unwrap_or_else(|err| {
            warn!(error = %err, "Falling back to a single column");
            1
        });
        let gap = parse_length(&style.column_gap, "column-gap").unwrap_or_else(|err| {
            warn!(error = %err, "Falling back to the configured gap");
            fallback_gap
        });
        let padding_left = parse_length(&style.padding_left, "padding-left").unwrap_or(0.0);
        let padding_right = parse_length(&style.padding_right, "padding-right").unwrap_or(0.0);
        Self::from_parts(column_count, gap, padding_left, padding_right, container_width)
    }

    pub fn from_parts(
        column_count: usize,
        gap: f64,
        padding_left: f64,
        padding_right: f64,
        container_width: f64,
    ) -> Self {
        let column_count = column_count.clamp(1, MAX_COLUMNS);
        let gap = if gap.is_finite() { gap.max(0.0) } else { 0.0 };
        let width = if container_width.is_finite() {
            container_width
        } else {
            0.0
        };
        let inner = width - padding_left - padding_right - gap * (column_count - 1) as f64;
        let column_width = (inner / column_count as f64).max(1.0);
        Self {
            column_count,
            column_width,
            gap,
            padding_left,
            padding_right,
        }
    }

    pub fn column_x(&self, column: usize) -> f64 {
        self.padding_left + column as f64 * (self.column_width + self.gap)
    }
}

/// Parses a CSS length in px. `normal` (the default `column-gap`) is zero.
pub fn parse_length(value: &str, property: &'static str) -> GridResult<f64> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed == "normal" || trimmed == "0" {
        return Ok(0.0);
    }
    let number = trimmed.strip_suffix("px").unwrap_or(trimmed);
    number
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .ok_or_else(|| GridError::style(property, value))
}

/// Counts the tracks in a resolved `grid-template-columns` value.
///
/// Handles plain track lists, line names (`[a]`) and integer `repeat()`.
/// Upper bound on resolved columns; larger track lists are rejected.
pub const MAX_COLUMNS: usize = 1024;

pub fn parse_track_count(value: &str) -> GridResult<usize> {
    let err = || GridError::style("grid-template-columns", value);
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed == "none" {
        return Err(err());
    }

    let mut count = 0usize;
    let mut rest = trimmed;
    while !rest.is_empty() {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        if let Some(after) = rest.strip_prefix("repeat(") {
            let close = matching_paren(after).ok_or_else(err)?;
            let inner = &after[..close];
            let (times, tracks) = inner.split_once(',').ok_or_else(err)?;
            let times = times.trim().parse::<usize>().map_err(|_| err())?;
            count = times
                .checked_mul(parse_track_count(tracks)?)
                .and_then(|tracks| count.checked_add(tracks))
                .filter(|total| *total <= MAX_COLUMNS)
                .ok_or_else(err)?;
            rest = &after[close + 1..];
        } else if let Some(after) = rest.strip_prefix('[') {
            let close = after.find(']').ok_or_else(err)?;
            rest = &after[close + 1..];
        } else {
            let end = token_end(rest);
            count += 1;
            if count > MAX_COLUMNS {
                return Err(err());
            }
            rest = &rest[end..];
        }
    }

    if count == 0 {
        Err(err())
    } else {
        Ok(count)
    }
}

fn matching_paren(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, ch) in s.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' if depth == 0 => return Some(i),
            ')' => depth -= 1,
            _ => {}
        }
    }
    None
}

/// End of one track token; parenthesized functions (`minmax(...)`) count as one token.
fn token_end(s: &str) -> usize {
    let mut depth = 0usize;
    for (i, ch) in s.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            c if c.is_whitespace() && depth == 0 => return i,
            _ => {}
        }
    }
    s.len()
}
