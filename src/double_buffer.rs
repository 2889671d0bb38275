//! Ping-pong storage for the local slice of the distributed array.

use crate::error::{KdTreeError, Result};
use crate::geometry::Point;

/// Two equally sized point buffers. One is active, the other receives the next
/// arrangement of the points and becomes active on [DoubleBuffer::swap].
pub struct DoubleBuffer {
    buffers: [Vec<Point>; 2],
    active: usize,
}

impl DoubleBuffer {
    /// Take `points` as the active buffer and allocate the second buffer.
    pub fn new(points: Vec<Point>) -> Result<Self> {
        let mut next = Vec::new();
        next.try_reserve_exact(points.len())
            .map_err(|_| KdTreeError::Allocation {
                local: true,
                stage: "double buffer",
            })?;
        next.resize(points.len(), [0.0; 3]);

        Ok(Self {
            buffers: [points, next],
            active: 0,
        })
    }

    /// Number of points in each buffer.
    pub fn len(&self) -> usize {
        self.buffers[0].len()
    }

    /// True if there are no local points.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The active buffer.
    pub fn active(&self) -> &[Point] {
        &self.buffers[self.active]
    }

    /// The active buffer, mutable.
    pub fn active_mut(&mut self) -> &mut [Point] {
        &mut self.buffers[self.active]
    }

    /// The inactive buffer.
    pub fn next_mut(&mut self) -> &mut [Point] {
        &mut self.buffers[1 - self.active]
    }

    /// The active buffer for reading together with the inactive buffer for writing.
    pub fn split_mut(&mut self) -> (&[Point], &mut [Point]) {
        let [first, second] = &mut self.buffers;
        if self.active == 0 {
            (first, second)
        } else {
            (second, first)
        }
    }

    /// Copy the whole active buffer into the inactive one.
    pub fn copy_active_to_next(&mut self) {
        let (active, next) = self.split_mut();
        next.copy_from_slice(active);
    }

    /// Make the inactive buffer the active one.
    pub fn swap(&mut self) {
        self.active = 1 - self.active;
    }

    /// Consume the buffers and return the active one.
    pub fn into_active(self) -> Vec<Point> {
        let [first, second] = self.buffers;
        if self.active == 0 {
            first
        } else {
            second
        }
    }
}

#[cfg(test)]
mod test {
    use super::DoubleBuffer;

    #[test]
    fn test_swap_exchanges_buffers() {
        let mut buffer = DoubleBuffer::new(vec![[1.0, 0.0, 0.0], [2.0, 0.0, 0.0]]).unwrap();

        buffer.copy_active_to_next();
        buffer.next_mut()[0] = [5.0, 0.0, 0.0];
        assert_eq!(buffer.active()[0], [1.0, 0.0, 0.0]);

        buffer.swap();
        assert_eq!(buffer.active(), &[[5.0, 0.0, 0.0], [2.0, 0.0, 0.0]]);

        let points = buffer.into_active();
        assert_eq!(points[0][0], 5.0);
    }
}
