//! # Shapes
//!
//! A shape is the size bookkeeping of a tensor. Wrappers cache the shape of
//! the value they wrap, which is why in-place operations that resize their
//! target need a metadata refresh afterwards.
//!
//! Broadcasting follows the usual right-aligned rule: trailing dimensions
//! are compared pairwise and must be equal or 1; missing leading dimensions
//! count as 1.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Dimension sizes of a dense tensor (empty = scalar).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape {
    /// Dimension sizes, outermost first.
    pub dims: Vec<usize>,
}

impl Shape {
    /// Create a shape from dimension sizes.
    pub fn new(dims: Vec<usize>) -> Self {
        Self { dims }
    }

    /// Create a scalar shape (0-dimensional).
    pub fn scalar() -> Self {
        Self { dims: vec![] }
    }

    /// Create a vector shape (1-dimensional).
    pub fn vector(len: usize) -> Self {
        Self { dims: vec![len] }
    }

    /// Create a matrix shape (2-dimensional).
    pub fn matrix(rows: usize, cols: usize) -> Self {
        Self {
            dims: vec![rows, cols],
        }
    }

    /// Number of dimensions (rank).
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    /// Row-major strides, with zero stride for broadcast (size-1) dimensions.
    pub fn broadcast_strides(&self) -> Vec<usize> {
        let mut strides = vec![0; self.dims.len()];
        let mut acc = 1;
        for (i, &d) in self.dims.iter().enumerate().rev() {
            strides[i] = if d == 1 { 0 } else { acc };
            acc *= d;
        }
        strides
    }

    /// Shape with the leading dimension removed.
    pub fn drop_leading(&self) -> Shape {
        Shape::new(self.dims.iter().skip(1).copied().collect())
    }

    /// Shape with `size` prepended as the new leading dimension.
    pub fn with_leading(&self, size: usize) -> Shape {
        let mut dims = Vec::with_capacity(self.dims.len() + 1);
        dims.push(size);
        dims.extend_from_slice(&self.dims);
        Shape::new(dims)
    }

    /// Shape with a size-1 dimension inserted at `dim`.
    pub fn unsqueeze(&self, dim: usize) -> Option<Shape> {
        if dim > self.dims.len() {
            return None;
        }
        let mut dims = self.dims.clone();
        dims.insert(dim, 1);
        Some(Shape::new(dims))
    }

    /// Broadcast two shapes together, or `None` if they are incompatible.
    pub fn broadcast(&self, other: &Shape) -> Option<Shape> {
        let rank = self.rank().max(other.rank());
        let mut dims = vec![0; rank];
        for i in 0..rank {
            let a = dim_from_right(&self.dims, rank - 1 - i);
            let b = dim_from_right(&other.dims, rank - 1 - i);
            dims[i] = match (a, b) {
                (a, b) if a == b => a,
                (1, b) => b,
                (a, 1) => a,
                _ => return None,
            };
        }
        Some(Shape::new(dims))
    }
}

fn dim_from_right(dims: &[usize], from_right: usize) -> usize {
    if from_right < dims.len() {
        dims[dims.len() - 1 - from_right]
    } else {
        1
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape::new(dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}]",
            self.dims
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_shape() {
        let s = Shape::scalar();
        assert_eq!(s.rank(), 0);
        assert_eq!(s.numel(), 1);
        assert_eq!(s.to_string(), "[]");
    }

    #[test]
    fn test_matrix_shape() {
        let m = Shape::matrix(3, 4);
        assert_eq!(m.rank(), 2);
        assert_eq!(m.numel(), 12);
        assert_eq!(m.to_string(), "[3, 4]");
    }

    #[test]
    fn test_broadcast_right_aligned() {
        let a = Shape::matrix(4, 3);
        let b = Shape::vector(3);
        assert_eq!(a.broadcast(&b), Some(Shape::matrix(4, 3)));

        let c = Shape::new(vec![2, 1, 3]);
        let d = Shape::new(vec![5, 3]);
        assert_eq!(c.broadcast(&d), Some(Shape::new(vec![2, 5, 3])));
    }

    #[test]
    fn test_broadcast_incompatible() {
        assert_eq!(Shape::vector(3).broadcast(&Shape::vector(4)), None);
    }

    #[test]
    fn test_broadcast_strides_zero_for_unit_dims() {
        let s = Shape::new(vec![2, 1, 3]);
        assert_eq!(s.broadcast_strides(), vec![3, 0, 1]);
    }

    #[test]
    fn test_leading_dimension_helpers() {
        let s = Shape::vector(3).with_leading(4);
        assert_eq!(s, Shape::matrix(4, 3));
        assert_eq!(s.drop_leading(), Shape::vector(3));
        assert_eq!(Shape::vector(3).unsqueeze(0), Some(Shape::matrix(1, 3)));
        assert_eq!(Shape::vector(3).unsqueeze(2), None);
    }
}
