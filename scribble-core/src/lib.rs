//! # scribble-core — shared drawing primitives
//!
//! The replicated drawable entity and its value types. This crate is
//! pure data: no I/O, no locking, no rendering. The sync layer
//! (`scribble-sync`) moves these values between processes; canvas and
//! input handling live entirely outside this workspace.

use serde::{Deserialize, Serialize};

/// Unique identifier of a figure.
///
/// Ids are assigned once by the server and never reused or changed.
/// A freshly drawn figure carries [`FigureId::UNASSIGNED`] until the
/// server commits it and returns the canonical id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FigureId(pub u64);

impl FigureId {
    /// Placeholder id for a client-side draft that the server has not
    /// yet committed.
    pub const UNASSIGNED: FigureId = FigureId(0);

    /// Whether this id has been assigned by the server.
    pub fn is_assigned(&self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for FigureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// RGB color, 8 bits per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);
    /// The dark blue the original palette uses for selection frames.
    pub const DARK_BLUE: Rgb = Rgb::new(0, 0, 0x8b);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

/// The kind of shape a figure draws as.
///
/// Geometry and hit-testing belong to the canvas layer; the sync core
/// only carries the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShapeKind {
    Circle,
    Oval,
    Rectangle,
    Square,
}

impl ShapeKind {
    /// Display name, as shown in the shape picker.
    pub fn name(&self) -> &'static str {
        match self {
            ShapeKind::Circle => "Circle",
            ShapeKind::Oval => "Oval",
            ShapeKind::Rectangle => "Rectangle",
            ShapeKind::Square => "Square",
        }
    }
}

impl std::fmt::Display for ShapeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A figure to be drawn: shape kind, color, and bounding box.
///
/// Identity is immutable; every other field may be replaced wholesale
/// by an update. Selection state is deliberately *not* part of the
/// figure — it is per-client UI state and stays out of the wire
/// format (the mirror keeps it in a side table keyed by id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Figure {
    pub id: FigureId,
    pub shape: ShapeKind,
    pub color: Rgb,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Figure {
    /// Create a zero-sized draft at the given location, with the
    /// placeholder id. The server assigns the real id on commit.
    pub fn new(shape: ShapeKind, color: Rgb, x: f64, y: f64) -> Self {
        Self {
            id: FigureId::UNASSIGNED,
            shape,
            color,
            x,
            y,
            width: 0.0,
            height: 0.0,
        }
    }

    /// Same figure under a different id.
    pub fn with_id(mut self, id: FigureId) -> Self {
        self.id = id;
        self
    }

    /// True if the figure has a zero width or height.
    pub fn is_empty(&self) -> bool {
        self.width == 0.0 || self.height == 0.0
    }

    /// Canonical bounding box: fold a negative width or height into
    /// the origin so that both extents are non-negative. Dragging
    /// up/left while drawing produces negative extents.
    pub fn normalized(mut self) -> Self {
        if self.width < 0.0 {
            self.x += self.width;
            self.width = -self.width;
        }
        if self.height < 0.0 {
            self.y += self.height;
            self.height = -self.height;
        }
        self
    }
}

impl std::fmt::Display for Figure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} [{}, {}, {}x{}]",
            self.shape, self.id, self.x, self.y, self.width, self.height
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unassigned_id() {
        let fig = Figure::new(ShapeKind::Circle, Rgb::BLACK, 1.0, 2.0);
        assert_eq!(fig.id, FigureId::UNASSIGNED);
        assert!(!fig.id.is_assigned());
        assert!(FigureId(1).is_assigned());
    }

    #[test]
    fn test_with_id_keeps_fields() {
        let fig = Figure::new(ShapeKind::Square, Rgb::new(10, 20, 30), 5.0, 6.0)
            .with_id(FigureId(7));
        assert_eq!(fig.id, FigureId(7));
        assert_eq!(fig.shape, ShapeKind::Square);
        assert_eq!(fig.color, Rgb::new(10, 20, 30));
        assert_eq!((fig.x, fig.y), (5.0, 6.0));
    }

    #[test]
    fn test_is_empty() {
        let mut fig = Figure::new(ShapeKind::Oval, Rgb::BLACK, 0.0, 0.0);
        assert!(fig.is_empty());
        fig.width = 10.0;
        assert!(fig.is_empty());
        fig.height = 4.0;
        assert!(!fig.is_empty());
    }

    #[test]
    fn test_normalized_negative_extents() {
        let mut fig = Figure::new(ShapeKind::Rectangle, Rgb::BLACK, 10.0, 10.0);
        fig.width = -4.0;
        fig.height = -6.0;
        let norm = fig.normalized();
        assert_eq!((norm.x, norm.y), (6.0, 4.0));
        assert_eq!((norm.width, norm.height), (4.0, 6.0));
    }

    #[test]
    fn test_normalized_positive_is_identity() {
        let mut fig = Figure::new(ShapeKind::Circle, Rgb::BLACK, 1.0, 2.0);
        fig.width = 3.0;
        fig.height = 4.0;
        let norm = fig.clone().normalized();
        assert_eq!(norm, fig);
    }

    #[test]
    fn test_shape_names() {
        assert_eq!(ShapeKind::Circle.name(), "Circle");
        assert_eq!(ShapeKind::Oval.name(), "Oval");
        assert_eq!(ShapeKind::Rectangle.name(), "Rectangle");
        assert_eq!(ShapeKind::Square.name(), "Square");
    }
}
