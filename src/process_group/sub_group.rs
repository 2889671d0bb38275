//! Collective operations over a contiguous range of ranks.

use std::ops::Add;

use super::{Message, ProcessGroup};

/// Reduction operations supported by [SubGroup::reduce].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    /// Element wise minimum.
    Min,
    /// Element wise maximum.
    Max,
    /// Element wise sum.
    Sum,
}

/// Types that can be reduced.
pub trait Reducible: Message + PartialOrd + Add<Output = Self> {}

impl<T: Message + PartialOrd + Add<Output = T>> Reducible for T {}

impl ReduceOp {
    /// Combine `other` into `acc`.
    pub fn combine<T: Reducible>(&self, acc: &mut [T], other: &[T]) {
        assert_eq!(acc.len(), other.len());
        for (a, &b) in acc.iter_mut().zip(other) {
            *a = match self {
                ReduceOp::Min => {
                    if b < *a {
                        b
                    } else {
                        *a
                    }
                }
                ReduceOp::Max => {
                    if b > *a {
                        b
                    } else {
                        *a
                    }
                }
                ReduceOp::Sum => *a + b,
            };
        }
    }
}

/// A contiguous range of ranks `lo..=hi` with a private tag.
///
/// All roots are given as ranks local to the group, i.e. relative to `lo`. Every
/// member of the group has to take part in every collective operation, otherwise
/// the other members wait forever.
pub struct SubGroup<'g, G: ProcessGroup> {
    comm: &'g G,
    lo: usize,
    hi: usize,
    tag: i32,
}

impl<'g, G: ProcessGroup> SubGroup<'g, G> {
    /// Create the group of ranks `lo..=hi`.
    pub fn new(comm: &'g G, lo: usize, hi: usize, tag: i32) -> Self {
        assert!(lo <= hi && hi < comm.size());
        Self { comm, lo, hi, tag }
    }

    /// The underlying process group.
    pub fn comm(&self) -> &'g G {
        self.comm
    }

    /// The tag of the group.
    pub fn tag(&self) -> i32 {
        self.tag
    }

    /// First global rank of the group.
    pub fn first(&self) -> usize {
        self.lo
    }

    /// Last global rank of the group.
    pub fn last(&self) -> usize {
        self.hi
    }

    /// Number of ranks in the group.
    pub fn size(&self) -> usize {
        self.hi - self.lo + 1
    }

    /// True if the global `rank` is a member.
    pub fn contains(&self, rank: usize) -> bool {
        self.lo <= rank && rank <= self.hi
    }

    /// Translate a global rank into a group rank.
    pub fn local_rank(&self, rank: usize) -> usize {
        debug_assert!(self.contains(rank));
        rank - self.lo
    }

    /// The group rank of the calling process.
    pub fn my_rank(&self) -> usize {
        self.local_rank(self.comm.rank())
    }

    fn global_rank(&self, local: usize) -> usize {
        self.lo + local
    }

    /// True if the group holds every rank of the process group.
    pub fn spans_all_ranks(&self) -> bool {
        self.lo == 0 && self.hi + 1 == self.comm.size()
    }

    /// Broadcast `buf` from the group rank `root` to all members.
    pub fn broadcast<T: Message>(&self, buf: &mut [T], root: usize) {
        if self.spans_all_ranks() {
            self.comm.broadcast(buf, root, self.tag);
        } else {
            self.binomial_broadcast(buf, root);
        }
    }

    /// Reduce `input` element wise into `output` on the group rank `root`.
    ///
    /// `output` is only written on `root`.
    pub fn reduce<T: Reducible>(&self, input: &[T], output: &mut [T], op: ReduceOp, root: usize) {
        if self.spans_all_ranks() {
            self.comm.reduce(input, output, op, root, self.tag);
        } else {
            self.binomial_reduce(input, output, op, root);
        }
    }

    /// Reduce `input` and make the result available on every member.
    pub fn all_reduce<T: Reducible>(&self, input: &[T], op: ReduceOp) -> Vec<T> {
        if self.spans_all_ranks() {
            return self.comm.all_reduce(input, op, self.tag);
        }

        let mut output = vec![T::default(); input.len()];
        self.binomial_reduce(input, &mut output, op, 0);
        self.binomial_broadcast(&mut output, 0);
        output
    }

    /// Reduce a single value and make the result available on every member.
    pub fn all_reduce_value<T: Reducible>(&self, value: T, op: ReduceOp) -> T {
        self.all_reduce(std::slice::from_ref(&value), op)[0]
    }

    /// Gather `local` from every member on the group rank `root`.
    ///
    /// Each member contributes the same number of elements. The result is ordered by
    /// group rank and is `None` on all ranks but `root`.
    pub fn gather<T: Message>(&self, local: &[T], root: usize) -> Option<Vec<T>> {
        if self.spans_all_ranks() {
            self.comm.gather(local, root, self.tag)
        } else {
            self.linear_gather(local, root)
        }
    }

    /// Gather `local` from every member and make the result available everywhere.
    pub fn all_gather<T: Message>(&self, local: &[T]) -> Vec<T> {
        if self.spans_all_ranks() {
            return self.comm.all_gather(local, self.tag);
        }

        let mut result = self
            .linear_gather(local, 0)
            .unwrap_or_else(|| vec![T::default(); local.len() * self.size()]);
        self.binomial_broadcast(&mut result, 0);
        result
    }

    /// Broadcast along a binomial tree of point to point messages.
    pub(crate) fn binomial_broadcast<T: Message>(&self, buf: &mut [T], root: usize) {
        let n = self.size();
        if n == 1 {
            return;
        }

        // Position in a binomial tree rooted at `root`.
        let vrank = (self.my_rank() + n - root) % n;

        let mut mask = 1;
        while mask < n {
            if vrank & mask != 0 {
                let parent = (vrank - mask + root) % n;
                self.comm
                    .receive(buf, self.global_rank(parent), self.tag);
                break;
            }
            mask <<= 1;
        }

        mask >>= 1;
        while mask > 0 {
            if vrank + mask < n {
                let child = (vrank + mask + root) % n;
                self.comm.send(buf, self.global_rank(child), self.tag);
            }
            mask >>= 1;
        }
    }

    /// Reduce along a binomial tree of point to point messages.
    pub(crate) fn binomial_reduce<T: Reducible>(
        &self,
        input: &[T],
        output: &mut [T],
        op: ReduceOp,
        root: usize,
    ) {
        assert_eq!(input.len(), output.len());
        let n = self.size();
        let vrank = (self.my_rank() + n - root) % n;

        let mut acc = input.to_vec();
        let mut other = vec![T::default(); input.len()];

        let mut mask = 1;
        while mask < n {
            if vrank & mask == 0 {
                let source = vrank | mask;
                if source < n {
                    self.comm.receive(
                        &mut other,
                        self.global_rank((source + root) % n),
                        self.tag,
                    );
                    op.combine(&mut acc, &other);
                }
            } else {
                let dest = vrank & !mask;
                self.comm
                    .send(&acc, self.global_rank((dest + root) % n), self.tag);
                break;
            }
            mask <<= 1;
        }

        if vrank == 0 {
            output.copy_from_slice(&acc);
        }
    }

    /// Gather with one point to point message per member.
    pub(crate) fn linear_gather<T: Message>(&self, local: &[T], root: usize) -> Option<Vec<T>> {
        let me = self.my_rank();

        if me != root {
            if !local.is_empty() {
                self.comm.send(local, self.global_rank(root), self.tag);
            }
            return None;
        }

        let count = local.len();
        let mut result = vec![T::default(); count * self.size()];

        for (member, chunk) in result.chunks_mut(count.max(1)).enumerate() {
            if count == 0 {
                break;
            }
            if member == me {
                chunk.copy_from_slice(local);
            } else {
                self.comm.receive(chunk, self.global_rank(member), self.tag);
            }
        }

        Some(result)
    }
}

#[cfg(test)]
mod test {
    use std::cell::Cell;

    use itertools::Itertools;

    use super::ReduceOp;
    use crate::process_group::{run_on_ranks, LocalGroup, Message, ProcessGroup};

    /// Counts the calls to the collectives of the process group.
    struct RecordingGroup {
        inner: LocalGroup,
        collectives: Cell<usize>,
    }

    impl ProcessGroup for RecordingGroup {
        fn rank(&self) -> usize {
            self.inner.rank()
        }

        fn size(&self) -> usize {
            self.inner.size()
        }

        fn send<T: Message>(&self, buf: &[T], dest: usize, tag: i32) {
            self.inner.send(buf, dest, tag);
        }

        fn receive<T: Message>(&self, buf: &mut [T], src: usize, tag: i32) {
            self.inner.receive(buf, src, tag);
        }

        fn broadcast<T: Message>(&self, buf: &mut [T], root: usize, tag: i32) {
            self.collectives.set(self.collectives.get() + 1);
            self.inner.broadcast(buf, root, tag);
        }

        fn all_gather<T: Message>(&self, local: &[T], tag: i32) -> Vec<T> {
            self.collectives.set(self.collectives.get() + 1);
            self.inner.all_gather(local, tag)
        }
    }

    #[test]
    fn test_broadcast_from_every_root() {
        for root in 0..5 {
            let result = run_on_ranks(5, |comm| {
                let world = comm.world(7);
                let mut buf = if comm.rank() == root {
                    [root as i64, 42]
                } else {
                    [0, 0]
                };
                world.broadcast(&mut buf, root);
                buf
            });
            assert!(result.iter().all(|buf| *buf == [root as i64, 42]));
        }
    }

    #[test]
    fn test_reduce_operations() {
        let result = run_on_ranks(6, |comm| {
            let world = comm.world(3);
            let value = comm.rank() as i64 + 1;
            (
                world.all_reduce_value(value, ReduceOp::Min),
                world.all_reduce_value(value, ReduceOp::Max),
                world.all_reduce_value(value, ReduceOp::Sum),
            )
        });
        assert!(result.iter().all(|&r| r == (1, 6, 21)));
    }

    #[test]
    fn test_reduce_to_non_zero_root() {
        let result = run_on_ranks(3, |comm| {
            let world = comm.world(3);
            let input = [comm.rank() as f64, -(comm.rank() as f64)];
            let mut output = [0.0; 2];
            world.reduce(&input, &mut output, ReduceOp::Max, 2);
            output
        });
        assert_eq!(result[2], [2.0, 0.0]);
    }

    #[test]
    fn test_gather_on_sub_range() {
        let result = run_on_ranks(5, |comm| {
            let rank = comm.rank();
            if !(1..=3).contains(&rank) {
                return None;
            }
            let group = comm.sub_group(1, 3, 9);
            Some(group.all_gather(&[rank, 10 * rank]))
        });

        assert!(result[0].is_none() && result[4].is_none());
        for gathered in result.iter().flatten() {
            assert_eq!(*gathered, vec![1, 10, 2, 20, 3, 30]);
        }
    }

    #[test]
    fn test_disjoint_groups_share_tag() {
        let result = run_on_ranks(4, |comm| {
            let rank = comm.rank();
            let group = if rank < 2 {
                comm.sub_group(0, 1, 5)
            } else {
                comm.sub_group(2, 3, 5)
            };
            group.all_reduce_value(rank, ReduceOp::Sum)
        });
        assert_eq!(result.iter().copied().collect_vec(), vec![1, 1, 5, 5]);
    }

    #[test]
    fn test_process_group_collectives() {
        let result = run_on_ranks(4, |comm| {
            let rank = comm.rank();
            let max = comm.all_reduce(&[rank as i64, -(rank as i64)], ReduceOp::Max, 6);
            let gathered = comm.gather(&[rank, rank * rank], 1, 6);
            let mut sum = [0];
            comm.reduce(&[rank], &mut sum, ReduceOp::Sum, 3, 6);
            let empty = comm.all_gather::<usize>(&[], 6);
            (max, gathered, sum[0], empty)
        });

        for (rank, (max, gathered, sum, empty)) in result.into_iter().enumerate() {
            assert_eq!(max, vec![3, 0]);
            assert!(empty.is_empty());
            if rank == 1 {
                assert_eq!(gathered, Some(vec![0, 0, 1, 1, 2, 4, 3, 9]));
            } else {
                assert!(gathered.is_none());
            }
            if rank == 3 {
                assert_eq!(sum, 6);
            }
        }
    }

    #[test]
    fn test_spanning_groups_use_group_collectives() {
        let result = run_on_ranks(4, |comm| {
            let group = RecordingGroup {
                inner: comm.clone(),
                collectives: Cell::new(0),
            };
            let rank = group.rank();

            let all = group.world(3).all_gather(&[rank]);
            let mut value = [rank];
            group.world(3).broadcast(&mut value, 2);
            let spanning = group.collectives.get();

            let pair = if rank < 2 {
                group.sub_group(0, 1, 3)
            } else {
                group.sub_group(2, 3, 3)
            }
            .all_gather(&[rank]);

            (all, value[0], spanning, group.collectives.get(), pair)
        });

        for (rank, (all, value, spanning, after, pair)) in result.into_iter().enumerate() {
            assert_eq!(all, vec![0, 1, 2, 3]);
            assert_eq!(value, 2);
            assert_eq!(spanning, 2);
            // Sub ranges only use point to point messages.
            assert_eq!(after, 2);
            assert_eq!(pair, if rank < 2 { vec![0, 1] } else { vec![2, 3] });
        }
    }
}
