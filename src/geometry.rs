//! Geometry information

use crate::constants::{NDIM, PLACEHOLDER_COORD};

/// A point of the distributed point set.
pub type Point = [f32; 3];

/// An axis aligned box.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BoundingBox {
    coords: [f64; 6],
}

impl BoundingBox {
    /// Create a new bounding box.
    ///
    /// The coordinates are given by `[xmin, ymin, zmin, xmax, ymax, zmax]`.
    pub fn new(coords: [f64; 6]) -> Self {
        Self { coords }
    }

    /// Create a box from its minimum and maximum corners.
    pub fn from_min_max(min: [f64; 3], max: [f64; 3]) -> Self {
        Self {
            coords: [min[0], min[1], min[2], max[0], max[1], max[2]],
        }
    }

    /// The box used for placeholder nodes.
    pub fn placeholder() -> Self {
        Self {
            coords: [PLACEHOLDER_COORD; 6],
        }
    }

    /// An inverted box that is the neutral element for [BoundingBox::grow].
    pub fn empty() -> Self {
        Self::from_min_max([f64::MAX; 3], [f64::MIN; 3])
    }

    /// Give a slice of points. Compute the tight bounding box around them.
    ///
    /// Returns `None` for an empty slice.
    pub fn from_points(points: &[Point]) -> Option<BoundingBox> {
        if points.is_empty() {
            return None;
        }

        let mut bounds = BoundingBox::empty();
        for point in points {
            bounds.grow(point);
        }

        Some(bounds)
    }

    /// Extend the box so that it contains `point`.
    pub fn grow(&mut self, point: &Point) {
        for (dim, &coord) in point.iter().enumerate() {
            let coord = coord as f64;
            self.coords[dim] = f64::min(self.coords[dim], coord);
            self.coords[NDIM + dim] = f64::max(self.coords[NDIM + dim], coord);
        }
    }

    /// Return coordinates
    pub fn coordinates(&self) -> [f64; 6] {
        self.coords
    }

    /// Minimum along `dim`.
    pub fn min(&self, dim: usize) -> f64 {
        self.coords[dim]
    }

    /// Maximum along `dim`.
    pub fn max(&self, dim: usize) -> f64 {
        self.coords[NDIM + dim]
    }

    /// Set the minimum along `dim`.
    pub fn set_min(&mut self, dim: usize, value: f64) {
        self.coords[dim] = value;
    }

    /// Set the maximum along `dim`.
    pub fn set_max(&mut self, dim: usize, value: f64) {
        self.coords[NDIM + dim] = value;
    }

    /// Extent along `dim`.
    pub fn extent(&self, dim: usize) -> f64 {
        self.max(dim) - self.min(dim)
    }

    /// Volume of the box, zero for inverted boxes.
    pub fn volume(&self) -> f64 {
        (0..NDIM)
            .map(|dim| f64::max(self.extent(dim), 0.0))
            .product()
    }

    /// Volume of the intersection with `other`.
    pub fn intersection_volume(&self, other: &BoundingBox) -> f64 {
        (0..NDIM)
            .map(|dim| {
                let lower = f64::max(self.min(dim), other.min(dim));
                let upper = f64::min(self.max(dim), other.max(dim));
                f64::max(upper - lower, 0.0)
            })
            .product()
    }

    /// Split the box at `coord` along `dim` into a lower and an upper box.
    pub fn split(&self, dim: usize, coord: f64) -> (BoundingBox, BoundingBox) {
        let mut lower = *self;
        let mut upper = *self;
        lower.set_max(dim, coord);
        upper.set_min(dim, coord);
        (lower, upper)
    }

    /// True if the point lies inside the closed box.
    pub fn contains(&self, point: [f64; 3]) -> bool {
        (0..NDIM).all(|dim| self.min(dim) <= point[dim] && point[dim] <= self.max(dim))
    }

    /// Center of the box.
    pub fn center(&self) -> [f64; 3] {
        [0, 1, 2].map(|dim| 0.5 * (self.min(dim) + self.max(dim)))
    }
}

impl std::fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [xmin, ymin, zmin, xmax, ymax, zmax] = self.coords;

        write!(
            f,
            "(xmin: {}, ymin: {}, zmin: {}, xmax: {}, ymax: {}, zmax: {})",
            xmin, ymin, zmin, xmax, ymax, zmax
        )
    }
}
