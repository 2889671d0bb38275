//! The communication substrate.
//!
//! A [ProcessGroup] only needs to provide tagged point-to-point messages, its
//! collectives fall back to them. All collective operations of the tree build are
//! performed on a [SubGroup], a contiguous range of ranks that communicates under
//! its own tag. A sub group spanning all ranks uses the collectives of the process
//! group itself.
mod local;
mod mpi_group;
mod sub_group;

pub use local::{run_on_ranks, LocalGroup};
pub use mpi_group::MpiGroup;
pub use sub_group::{ReduceOp, Reducible, SubGroup};

use mpi::traits::Equivalence;

/// Any plain value that can be sent between ranks.
pub trait Message: Equivalence + Copy + Default + Send + 'static {}

impl<T: Equivalence + Copy + Default + Send + 'static> Message for T {}

/// A group of cooperating processes.
///
/// Messages between a given pair of ranks with the same tag must be received in the
/// order in which they were sent.
///
/// The collective operations span all ranks of the group. Their default versions
/// are built on tagged point to point messages, implementations with native
/// collectives override them.
pub trait ProcessGroup {
    /// The rank of the calling process.
    fn rank(&self) -> usize;

    /// The number of processes.
    fn size(&self) -> usize;

    /// Send `buf` to `dest`.
    fn send<T: Message>(&self, buf: &[T], dest: usize, tag: i32);

    /// Receive exactly `buf.len()` elements from `src`.
    fn receive<T: Message>(&self, buf: &mut [T], src: usize, tag: i32);

    /// Broadcast `buf` from `root` to all ranks.
    fn broadcast<T: Message>(&self, buf: &mut [T], root: usize, tag: i32)
    where
        Self: Sized,
    {
        self.sub_group(0, self.size() - 1, tag)
            .binomial_broadcast(buf, root);
    }

    /// Reduce `input` element wise into `output` on `root`.
    ///
    /// `output` is only written on `root`.
    fn reduce<T: Reducible>(&self, input: &[T], output: &mut [T], op: ReduceOp, root: usize, tag: i32)
    where
        Self: Sized,
    {
        self.sub_group(0, self.size() - 1, tag)
            .binomial_reduce(input, output, op, root);
    }

    /// Reduce `input` element wise and make the result available on all ranks.
    fn all_reduce<T: Reducible>(&self, input: &[T], op: ReduceOp, tag: i32) -> Vec<T>
    where
        Self: Sized,
    {
        let mut output = vec![T::default(); input.len()];
        ProcessGroup::reduce(self, input, &mut output, op, 0, tag);
        ProcessGroup::broadcast(self, &mut output, 0, tag);
        output
    }

    /// Gather `local` from all ranks on `root`, ordered by rank.
    ///
    /// Every rank contributes the same number of elements. Returns `None` on all
    /// ranks but `root`.
    fn gather<T: Message>(&self, local: &[T], root: usize, tag: i32) -> Option<Vec<T>>
    where
        Self: Sized,
    {
        self.sub_group(0, self.size() - 1, tag)
            .linear_gather(local, root)
    }

    /// Gather `local` from all ranks on all ranks, ordered by rank.
    fn all_gather<T: Message>(&self, local: &[T], tag: i32) -> Vec<T>
    where
        Self: Sized,
    {
        let mut result = ProcessGroup::gather(self, local, 0, tag)
            .unwrap_or_else(|| vec![T::default(); local.len() * self.size()]);
        ProcessGroup::broadcast(self, &mut result, 0, tag);
        result
    }

    /// Form the sub group of ranks `lo..=hi`.
    ///
    /// Only members of the range may use the returned group. Creating it involves no
    /// communication.
    fn sub_group(&self, lo: usize, hi: usize, tag: i32) -> SubGroup<'_, Self>
    where
        Self: Sized,
    {
        SubGroup::new(self, lo, hi, tag)
    }

    /// The sub group spanning all ranks.
    fn world(&self, tag: i32) -> SubGroup<'_, Self>
    where
        Self: Sized,
    {
        SubGroup::new(self, 0, self.size() - 1, tag)
    }
}
