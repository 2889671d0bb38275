//! Map global point indices to the ranks that own them.

use std::ops::Range;

use crate::{process_group::ProcessGroup, tools::displacements};

/// Global index ranges of the distributed point array.
///
/// Rank `p` owns the global indices `start[p]..start[p] + num_cells[p]`. The ranges are
/// contiguous and ordered by rank.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GlobalIndexTable {
    start: Vec<usize>,
    num_cells: Vec<usize>,
    total: usize,
}

impl GlobalIndexTable {
    /// Build the table from the local point counts of all ranks.
    ///
    /// This is a collective operation on the whole process group.
    pub fn build<G: ProcessGroup>(comm: &G, local_count: usize, tag: i32) -> Self {
        let num_cells = comm.world(tag).all_gather(&[local_count]);
        Self::from_counts(num_cells)
    }

    /// Build the table from known counts.
    pub fn from_counts(num_cells: Vec<usize>) -> Self {
        let start = displacements(&num_cells);
        let total = num_cells.iter().sum();

        Self {
            start,
            num_cells,
            total,
        }
    }

    /// The total number of points.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Number of ranks.
    pub fn size(&self) -> usize {
        self.num_cells.len()
    }

    /// First global index on `rank`.
    pub fn start(&self, rank: usize) -> usize {
        self.start[rank]
    }

    /// One past the last global index on `rank`.
    pub fn end(&self, rank: usize) -> usize {
        self.start[rank] + self.num_cells[rank]
    }

    /// Number of points on `rank`.
    pub fn num_cells(&self, rank: usize) -> usize {
        self.num_cells[rank]
    }

    /// All local counts, ordered by rank.
    pub fn counts(&self) -> &[usize] {
        &self.num_cells
    }

    /// The global indices on `rank`.
    pub fn range(&self, rank: usize) -> Range<usize> {
        self.start(rank)..self.end(rank)
    }

    /// The part of the global range `l..=r` stored on `rank`, as global indices.
    ///
    /// An empty part is returned as the empty range at the start of the rank.
    pub fn local_part(&self, rank: usize, l: usize, r: usize) -> Range<usize> {
        let lo = usize::max(l, self.start(rank));
        let hi = usize::min(r + 1, self.end(rank));
        if lo < hi {
            lo..hi
        } else {
            self.start(rank)..self.start(rank)
        }
    }

    /// The rank owning the global index `pos`.
    ///
    /// Returns `None` if `pos` is not a valid index. Ranks without points never own an
    /// index.
    pub fn who_has(&self, pos: usize) -> Option<usize> {
        if pos >= self.total {
            return None;
        }

        Some(self.owner(pos))
    }

    /// The rank owning the valid global index `pos`.
    pub(crate) fn owner(&self, pos: usize) -> usize {
        debug_assert!(pos < self.total);
        // The last rank whose range starts at or before `pos`. Empty ranks share
        // their start with the next non-empty rank and are skipped by this.
        self.start.partition_point(|&s| s <= pos) - 1
    }
}
