//! Error types.

use thiserror::Error;

/// Errors that can occur while building or querying a distributed k-d tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KdTreeError {
    /// Memory for nodes or buffers could not be reserved.
    #[error("memory allocation failed in {stage} (on this rank: {local})")]
    Allocation {
        /// True if the failure happened on the reporting rank.
        local: bool,
        /// The build stage that failed.
        stage: &'static str,
    },

    /// The global bounding volume of the points has no extent.
    #[error("degenerate volume, the global point set is empty")]
    DegenerateVolume,

    /// A process id outside of `[0, size)`.
    #[error("invalid process id {0}")]
    InvalidProcess(usize),

    /// A region id outside of `[0, number_of_regions)`.
    #[error("invalid region id {0}")]
    InvalidRegion(usize),

    /// A user defined assignment with the wrong number of entries.
    #[error("assignment has {len} entries, the tree has {expected} regions")]
    InvalidAssignment {
        /// Number of entries provided.
        len: usize,
        /// Number of regions in the tree.
        expected: usize,
    },

    /// A user defined assignment maps a region to a rank that does not exist.
    #[error("region {region} assigned to invalid process id {rank} (size {size})")]
    InvalidAssignmentRank {
        /// The region.
        region: usize,
        /// The requested rank.
        rank: usize,
        /// Number of processes.
        size: usize,
    },

    /// An operation needs a tree but none has been built.
    #[error("no k-d tree has been built")]
    NoTree,

    /// A query needs the process data tables but they have not been created.
    #[error("process data tables have not been created")]
    NoProcessData,

    /// A point lies outside the volume of the tree.
    #[error("point outside of the tree (on this rank: {local})")]
    PointOutsideTree {
        /// True if the point is on the reporting rank.
        local: bool,
    },

    /// A serialized tree could not be decoded.
    #[error("corrupt serialized tree")]
    CorruptTree,
}

/// Result type of this crate.
pub type Result<T> = std::result::Result<T, KdTreeError>;
