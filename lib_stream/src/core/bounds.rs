//! # Viewport Geometry
//!
//! Numeric bounds of a tracked container's visible region, the dominant scroll
//! direction between two observations, and the grid-rounded `SectionKey` that
//! identifies one cacheable cell of streamed content.
//!
//! Two observations that round to the same `SectionKey` are the same section as
//! far as request deduplication and caching are concerned.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::core::errors::ParseError;

/// Default cell size, in container units, used to round bounds into a section key.
pub const SECTION_GRID: f64 = 100.0;

/// Dominant axis of the most recent viewport movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    /// Content moved towards the top of the container.
    Up,
    /// Content moved towards the bottom of the container.
    Down,
    /// Content moved towards the left edge.
    Left,
    /// Content moved towards the right edge.
    Right,
}

impl ScrollDirection {
    /// Computes the direction of travel from `previous` to `current`.
    ///
    /// Vertical movement wins only when its magnitude is strictly greater than
    /// the horizontal one. Returns `None` when nothing moved.
    pub fn between(previous: &ViewportBounds, current: &ViewportBounds) -> Option<Self> {
        let dv = current.top - previous.top;
        let dh = current.left - previous.left;

        if dv.abs() > dh.abs() {
            Some(if dv > 0.0 { Self::Down } else { Self::Up })
        } else if dh > 0.0 {
            Some(Self::Right)
        } else if dh < 0.0 {
            Some(Self::Left)
        } else {
            None
        }
    }
}

/// # Viewport Bounds
///
/// A rectangle in the tracked container's coordinate space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewportBounds {
    /// Offset of the top edge.
    pub top: f64,
    /// Offset of the bottom edge.
    pub bottom: f64,
    /// Offset of the left edge.
    pub left: f64,
    /// Offset of the right edge.
    pub right: f64,
    /// `right - left`.
    #[serde(default)]
    pub width: f64,
    /// `bottom - top`.
    #[serde(default)]
    pub height: f64,
    /// Direction of the movement that produced these bounds, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scroll_direction: Option<ScrollDirection>,
}

impl ViewportBounds {
    /// Builds bounds from the four edges, deriving width and height.
    pub fn new(top: f64, bottom: f64, left: f64, right: f64) -> Self {
        Self {
            top,
            bottom,
            left,
            right,
            width: right - left,
            height: bottom - top,
            scroll_direction: None,
        }
    }

    /// Returns a copy tagged with `direction`.
    pub fn with_direction(mut self, direction: Option<ScrollDirection>) -> Self {
        self.scroll_direction = direction;
        self
    }

    /// Rectangle intersection test.
    ///
    /// Two rectangles intersect unless one lies entirely to the left, right,
    /// above or below the other. Touching edges count as intersecting.
    pub fn intersects(&self, other: &ViewportBounds) -> bool {
        !(self.right < other.left
            || self.left > other.right
            || self.bottom < other.top
            || self.top > other.bottom)
    }

    /// Section key on the default grid.
    pub fn section_key(&self) -> SectionKey {
        SectionKey::from_bounds(self, SECTION_GRID)
    }
}

/// # Section Key
///
/// Grid-rounded identity of a viewport region, rendered as
/// `"{top}-{bottom}_{left}-{right}"` (for example `"0-500_0-300"`).
///
/// Every edge is snapped down to its grid line, so small scrolls inside the same
/// cell row/column produce the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionKey {
    top: i64,
    bottom: i64,
    left: i64,
    right: i64,
}

impl SectionKey {
    /// Creates a key from already-rounded edges.
    pub fn new(top: i64, bottom: i64, left: i64, right: i64) -> Self {
        Self { top, bottom, left, right }
    }

    /// Rounds `bounds` onto a grid of `grid` units.
    ///
    /// A non-positive or non-finite `grid` falls back to [`SECTION_GRID`].
    pub fn from_bounds(bounds: &ViewportBounds, grid: f64) -> Self {
        let grid = if grid.is_finite() && grid > 0.0 { grid } else { SECTION_GRID };
        let snap = |v: f64| ((v / grid).floor() * grid) as i64;

        Self {
            top: snap(bounds.top),
            bottom: snap(bounds.bottom),
            left: snap(bounds.left),
            right: snap(bounds.right),
        }
    }

    /// The rectangle covered by this section.
    pub fn bounds(&self) -> ViewportBounds {
        ViewportBounds::new(
            self.top as f64,
            self.bottom as f64,
            self.left as f64,
            self.right as f64,
        )
    }
}

impl fmt::Display for SectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}_{}-{}", self.top, self.bottom, self.left, self.right)
    }
}

/// Splits `"a-b"` where either side may carry its own leading minus sign.
fn parse_span(span: &str, raw: &str) -> Result<(i64, i64), ParseError> {
    let invalid = || ParseError::SectionKey(raw.to_string());
    let split_at = span
        .get(1..)
        .and_then(|rest| rest.find('-'))
        .map(|idx| idx + 1)
        .ok_or_else(invalid)?;
    let (start, end) = span.split_at(split_at);
    let start = start.trim().parse::<i64>().map_err(|_| invalid())?;
    let end = end[1..].trim().parse::<i64>().map_err(|_| invalid())?;
    Ok((start, end))
}

impl FromStr for SectionKey {
    type Err = ParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (vertical, horizontal) = raw
            .split_once('_')
            .ok_or_else(|| ParseError::SectionKey(raw.to_string()))?;
        let (top, bottom) = parse_span(vertical, raw)?;
        let (left, right) = parse_span(horizontal, raw)?;
        Ok(Self::new(top, bottom, left, right))
    }
}

impl Serialize for SectionKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SectionKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
