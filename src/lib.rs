//! A Rust based library to build k-d trees over distributed point sets.
//!
//! The points of the tree live on the ranks of a [process group](process_group::ProcessGroup).
//! No rank ever holds the whole point set. The tree is built by distributed median
//! selection, merged into one consistent tree on every rank and finally used to hand
//! out its leaf regions to the processes.
#![cfg_attr(feature = "strict", deny(warnings), deny(unused_crate_dependencies))]
#![warn(missing_docs)]

pub mod assignment;
pub mod builder;
pub mod complete;
pub mod constants;
pub mod double_buffer;
pub mod error;
pub mod geometry;
pub mod index_table;
pub mod kdtree;
pub mod locator;
pub mod process_group;
pub mod process_tables;
pub mod select;
pub mod tools;

pub use error::{KdTreeError, Result};
pub use locator::{KdTreeConfig, ParallelKdTree, PointSource};
