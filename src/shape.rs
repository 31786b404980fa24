// shape.rs — Runtime-sized feature-map volumes.
//
// Every stage consumes and produces a 3D volume of f32 values laid out as
// `depth` planes of `height` rows of `width` columns, flattened row-major:
//
//   plane 0                plane 1
//   ┌──────────────┐       ┌──────────────┐
//   │ r0: c0 c1 .. │       │ r0: c0 c1 .. │     index(d, r, c) =
//   │ r1: c0 c1 .. │  ...  │ r1: c0 c1 .. │       (d * height + r) * width + c
//   └──────────────┘       └──────────────┘
//
// Dense stages (full connection, distance) produce a flat vector, which we
// represent as the shape `(len, 1, 1)`. Adjacent stages must agree on the
// exact shape, not just the element count, so a dense stage that follows a
// pooling stage declares its input as e.g. `14×14×6`.
//
// Unlike an image there is no stride: device buffers are tightly packed and
// the host never needs row padding.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Width, height and depth of one feature-map volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[usize; 3]", into = "[usize; 3]")]
pub struct Shape {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}

impl Shape {
    pub const fn new(width: usize, height: usize, depth: usize) -> Self {
        Shape { width, height, depth }
    }

    /// A flat vector of `len` elements, `(len, 1, 1)`.
    pub const fn flat(len: usize) -> Self {
        Shape { width: len, height: 1, depth: 1 }
    }

    /// Total number of f32 elements in the volume.
    #[inline]
    pub const fn len(&self) -> usize {
        self.width * self.height * self.depth
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Elements in one depth plane (`width * height`).
    #[inline]
    pub const fn plane(&self) -> usize {
        self.width * self.height
    }

    /// Flat row-major index of `(d, r, c)`.
    #[inline]
    pub fn index(&self, d: usize, r: usize, c: usize) -> usize {
        debug_assert!(d < self.depth && r < self.height && c < self.width);
        (d * self.height + r) * self.width + c
    }
}

impl From<[usize; 3]> for Shape {
    fn from([width, height, depth]: [usize; 3]) -> Self {
        Shape { width, height, depth }
    }
}

impl From<Shape> for [usize; 3] {
    fn from(s: Shape) -> Self {
        [s.width, s.height, s.depth]
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{}×{}", self.width, self.height, self.depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_len_and_plane() {
        let s = Shape::new(28, 28, 6);
        assert_eq!(s.len(), 4704);
        assert_eq!(s.plane(), 784);
        assert!(!s.is_empty());
    }

    #[test]
    fn test_index_row_major() {
        let s = Shape::new(4, 3, 2);
        assert_eq!(s.index(0, 0, 0), 0);
        assert_eq!(s.index(0, 0, 3), 3);
        assert_eq!(s.index(0, 1, 0), 4);
        assert_eq!(s.index(1, 0, 0), 12);
        assert_eq!(s.index(1, 2, 3), s.len() - 1);
    }

    #[test]
    fn test_flat_shape() {
        let s = Shape::flat(10);
        assert_eq!(s, Shape::new(10, 1, 1));
        assert_eq!(s.len(), 10);
    }

    #[test]
    fn test_display() {
        assert_eq!(Shape::new(32, 32, 1).to_string(), "32×32×1");
    }

    #[test]
    fn test_serde_as_triple() {
        let s: Shape = serde_json::from_str("[14, 14, 6]").unwrap();
        assert_eq!(s, Shape::new(14, 14, 6));
        assert_eq!(serde_json::to_string(&s).unwrap(), "[14,14,6]");
    }
}
