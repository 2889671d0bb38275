//! Crate wide constants.

/// Default maximum depth of the tree.
pub const DEFAULT_MAX_LEVEL: usize = 20;

/// Deepest level a tree may reach. Node tags double with every level and have to
/// stay positive `i32` values.
pub const MAX_TREE_LEVEL: usize = 30;

/// Default minimum number of points in a region. A region is only
/// divided if each child would receive at least this many points.
pub const DEFAULT_MIN_CELLS: usize = 100;

/// Ranges larger than this are first narrowed down by sampling
/// before they are partitioned.
pub const SAMPLE_THRESHOLD: usize = 600;

/// Number of spatial dimensions.
pub const NDIM: usize = 3;

/// Bitmask that allows cuts along all three axes.
pub const ALL_DIRECTIONS: u8 = 0b111;

/// Half width given to every axis of a volume in which all points coincide.
pub const DEGENERATE_VOLUME_PAD: f64 = 1e-3;

/// Value used for the bounds of placeholder nodes.
pub const PLACEHOLDER_COORD: f64 = -1.0;

/// Point count of placeholder nodes.
pub const PLACEHOLDER_POINTS: i64 = -1;

/// Number of `f64` values needed to describe the children of a node.
pub const PACKED_NODE_LEN: usize = 27;

/// Tag of the root node. Children of a node with tag `t` use `t << 1` and `(t << 1) | 1`.
pub const ROOT_TAG: i32 = 0x0000_0001;

/// Tag for the rebuild and parameter checks at the start of a build.
pub const REBUILD_TAG: i32 = 0x0000_1000;

/// Tag for the failure vote after the breadth first division.
pub const DIVIDE_VOTE_TAG: i32 = 0x0000_2000;

/// Tag for completing and merging the tree.
pub const COMPLETE_TAG: i32 = 0x0000_3000;

/// Tag for sending node geometry to rank 0 during the merge.
pub const MERGE_TAG: i32 = 0x0000_1111;

/// Tag for building the process data tables.
pub const PROCESS_DATA_TAG: i32 = 0x0000_f000;
