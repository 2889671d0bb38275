//! Distributed selection of order statistics.
//!
//! The points of all ranks form one logical array indexed through a
//! [GlobalIndexTable]. Selection rearranges a global index range of this array
//! so that a given index holds the order statistic along one axis, with smaller
//! values to its left and larger or equal values to its right.
pub mod partition;

use itertools::Itertools;
use log::trace;

use crate::{
    constants::SAMPLE_THRESHOLD,
    double_buffer::DoubleBuffer,
    geometry::Point,
    index_table::GlobalIndexTable,
    process_group::{ProcessGroup, ReduceOp, SubGroup},
};
use partition::{partition_about_my_value, partition_about_other_value};

/// A block of consecutive points moved from one rank to another.
///
/// Points are read from the active buffer of `from` and written to the inactive
/// buffer of `to`. Indices are global.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Transfer {
    /// Sending rank.
    pub from: usize,
    /// Receiving rank.
    pub to: usize,
    /// Global index of the first point sent.
    pub from_index: usize,
    /// Global index the first point is received at.
    pub to_index: usize,
    /// Number of points.
    pub count: usize,
}

/// The result of a local three-way partition on one rank.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PartitionCounts {
    /// The rank.
    pub rank: usize,
    /// Global index of the first point of the rank inside the partitioned range.
    pub first: usize,
    /// Number of values less than the pivot.
    pub less: usize,
    /// Number of values equal to the pivot.
    pub equal: usize,
    /// Number of values greater than the pivot.
    pub greater: usize,
}

impl PartitionCounts {
    /// Number of points of the rank inside the range.
    pub fn len(&self) -> usize {
        self.less + self.equal + self.greater
    }

    /// True if the rank holds no point of the range.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Compute the transfers that turn locally partitioned parts into a globally
/// partitioned range.
///
/// `parts` are ordered by rank and cover a contiguous range. In the new order the
/// range holds all smaller values, then all equal values, then all greater values,
/// each group ordered by the rank it came from. Every rank keeps the global
/// indices it had before.
pub fn transfer_schedule(parts: &[PartitionCounts]) -> Vec<Transfer> {
    let segments = (0..3)
        .flat_map(|group| {
            parts.iter().map(move |part| {
                let (offset, count) = match group {
                    0 => (0, part.less),
                    1 => (part.less, part.equal),
                    _ => (part.less + part.equal, part.greater),
                };
                (part.rank, part.first + offset, count)
            })
        })
        .filter(|&(_, _, count)| count > 0);

    let mut receivers = parts.iter().filter(|part| !part.is_empty()).peekable();
    let mut received = 0;
    let mut transfers = Vec::new();

    for (from, mut from_index, mut count) in segments {
        while count > 0 {
            let Some(&receiver) = receivers.peek() else {
                break;
            };

            let take = usize::min(count, receiver.len() - received);
            transfers.push(Transfer {
                from,
                to: receiver.rank,
                from_index,
                to_index: receiver.first + received,
                count: take,
            });

            from_index += take;
            count -= take;
            received += take;

            if received == receiver.len() {
                receivers.next();
                received = 0;
            }
        }
    }

    transfers
}

/// Selection on the part of the distributed array owned by a sub group.
///
/// All members of `group` must call the same operations with the same arguments.
pub struct DistributedSelector<'a, G: ProcessGroup> {
    group: &'a SubGroup<'a, G>,
    table: &'a GlobalIndexTable,
    buffer: &'a mut DoubleBuffer,
}

impl<'a, G: ProcessGroup> DistributedSelector<'a, G> {
    /// Create a selector for the ranks of `group`.
    pub fn new(
        group: &'a SubGroup<'a, G>,
        table: &'a GlobalIndexTable,
        buffer: &'a mut DoubleBuffer,
    ) -> Self {
        Self {
            group,
            table,
            buffer,
        }
    }

    fn rank(&self) -> usize {
        self.group.comm().rank()
    }

    fn local_offset(&self, pos: usize) -> usize {
        pos - self.table.start(self.rank())
    }

    fn value(&self, pos: usize, dim: usize) -> f32 {
        self.buffer.active()[self.local_offset(pos)][dim]
    }

    /// The points of the calling rank.
    pub fn points(&self) -> &[Point] {
        self.buffer.active()
    }

    /// Rearrange the range `l..=r` around its median along `dim`.
    ///
    /// With `k = (l + r) / 2 + 1`, afterwards the value at `k` is the order statistic
    /// of the range and the range is partitioned about it. The returned index is the
    /// first index of the range holding the same value as `k`, so all points left of
    /// it are strictly smaller.
    pub fn select(&mut self, dim: usize, l: usize, r: usize) -> usize {
        let k = (l + r) / 2 + 1;

        self.select_range(l, r, k, dim);

        if k == l {
            return k;
        }

        // Roll back to the first occurrence of the value at k.
        let has_k = self.table.owner(k);
        let has_k_left = self.table.owner(k - 1);
        let me = self.rank();

        let mut k_value = [0.0_f32];
        if has_k == me {
            k_value[0] = self.value(k, dim);
        }
        self.group.broadcast(&mut k_value, self.group.local_rank(has_k));

        let mut k_left_value = [0.0_f32];
        if has_k_left == me {
            k_left_value[0] = self.value(k - 1, dim);
        }
        self.group
            .broadcast(&mut k_left_value, self.group.local_rank(has_k_left));

        let [k_value] = k_value;
        if k_left_value[0] != k_value {
            return k;
        }

        let mut first = self.table.total();

        if me <= has_k_left && self.table.num_cells(me) > 0 {
            let lowest = usize::max(self.table.start(me), l);
            let start = usize::min(self.table.end(me) - 1, k - 1);

            if lowest <= start && self.value(start, dim) == k_value {
                first = start;
                while first > lowest && self.value(first - 1, dim) == k_value {
                    first -= 1;
                }
            }
        }

        let new_k = self.group.all_reduce_value(first, ReduceOp::Min);
        trace!("[{}] select dim {} on {}..={}: {} -> {}", me, dim, l, r, k, new_k);
        new_k
    }

    fn select_range(&mut self, mut l: usize, mut r: usize, k: usize, dim: usize) {
        while r > l {
            if r - l > SAMPLE_THRESHOLD {
                // Select on a sample around k first so that the following
                // partition uses a pivot close to the order statistic.
                let n = (r - l + 1) as f64;
                let i = (k - l + 1) as f64;
                let z = n.ln();
                let s = (0.5 * (2.0 * z / 3.0).exp()).trunc();
                let sign = if k - l + 1 < (r - l + 1) / 2 { -1.0 } else { 1.0 };
                let sd = (0.5 * (z * s * (n - s) / n).sqrt() * sign).trunc();

                let ll = f64::max(l as f64, k as f64 - (i * s / n).trunc() + sd) as usize;
                let rr = f64::min(r as f64, k as f64 + ((n - i) * s / n).trunc() + sd) as usize;

                if ll <= k && k <= rr && rr - ll < r - l {
                    self.select_range(ll, rr, k, dim);
                }
            }

            let (first_equal, first_greater) = self.partition_sub_array(l, r, k, dim);

            if k >= first_greater {
                l = first_greater;
            } else if k >= first_equal {
                break;
            } else {
                r = first_equal - 1;
            }
        }
    }

    /// Partition the range `l..=r` about the value at `k` along `dim`.
    ///
    /// Returns the global index of the first value equal to the pivot and of the first
    /// greater value. The latter is `r + 1` if no value is greater. Every member of
    /// the group takes part, ranks outside the range only receive the result.
    pub fn partition_sub_array(&mut self, l: usize, r: usize, k: usize, dim: usize) -> (usize, usize) {
        let me = self.rank();
        let p1 = self.table.owner(l);
        let p2 = self.table.owner(r);
        let root = self.group.local_rank(p1);
        let mut result = [0_usize; 2];

        if me < p1 || me > p2 {
            self.group.broadcast(&mut result, root);
            return (result[0], result[1]);
        }

        if p1 == p2 {
            let lo = self.local_offset(l);
            let hi = self.local_offset(r);
            let (first_equal, first_greater) =
                partition_about_my_value(&mut self.buffer.active_mut()[lo..=hi], k - l, dim);
            result = [l + first_equal, l + first_greater];
            self.group.broadcast(&mut result, root);
            return (result[0], result[1]);
        }

        let comm = self.group.comm();
        let tag = self.group.tag();
        let inner = comm.sub_group(p1, p2, tag);

        // Move the pivot to the front of the range, so the first rank holds it.
        self.exchange_values(l, k);

        let mut pivot = [0.0_f32];
        if me == p1 {
            pivot[0] = self.value(l, dim);
        }
        inner.broadcast(&mut pivot, 0);

        let part = self.table.local_part(me, l, r);
        let lo = self.local_offset(part.start);
        let hi = self.local_offset(part.end);
        let local = &mut self.buffer.active_mut()[lo..hi];

        let (first_equal, first_greater) = if me == p1 {
            partition_about_my_value(local, 0, dim)
        } else {
            partition_about_other_value(local, pivot[0], dim)
        };

        let gathered = inner.all_gather(&[
            part.start,
            first_equal,
            first_greater - first_equal,
            part.len() - first_greater,
        ]);

        let parts = gathered
            .chunks_exact(4)
            .enumerate()
            .map(|(index, counts)| PartitionCounts {
                rank: p1 + index,
                first: counts[0],
                less: counts[1],
                equal: counts[2],
                greater: counts[3],
            })
            .collect_vec();

        // Points outside of the range stay where they are.
        if part.start > self.table.start(me) || part.end < self.table.end(me) {
            self.buffer.copy_active_to_next();
        }

        let transfers = transfer_schedule(&parts);
        self.do_transfers(&transfers);
        self.buffer.swap();

        let less = parts.iter().map(|part| part.less).sum::<usize>();
        let equal = parts.iter().map(|part| part.equal).sum::<usize>();

        result = [l + less, l + less + equal];
        self.group.broadcast(&mut result, root);

        trace!(
            "[{}] partition {}..={} about {} on ranks {}..={}: {:?}",
            me,
            l,
            r,
            k,
            p1,
            p2,
            result
        );

        (result[0], result[1])
    }

    fn do_transfers(&mut self, transfers: &[Transfer]) {
        let me = self.rank();
        let offset = self.table.start(me);
        let comm = self.group.comm();
        let tag = self.group.tag();
        let (active, next) = self.buffer.split_mut();

        for transfer in transfers {
            let source = transfer.from_index - offset..transfer.from_index - offset + transfer.count;
            let target = transfer.to_index - offset..transfer.to_index - offset + transfer.count;

            if transfer.from == me && transfer.to == me {
                next[target].copy_from_slice(&active[source]);
            } else if transfer.from == me {
                comm.send(bytemuck::cast_slice::<Point, f32>(&active[source]), transfer.to, tag);
            } else if transfer.to == me {
                comm.receive(
                    bytemuck::cast_slice_mut::<Point, f32>(&mut next[target]),
                    transfer.from,
                    tag,
                );
            }
        }
    }

    /// Swap the points at the global indices `pos1` and `pos2`.
    ///
    /// Only the owners of the two positions take part. Two distinct owners trade
    /// their points with a blocking send and receive pair.
    pub fn exchange_values(&mut self, pos1: usize, pos2: usize) {
        let me = self.rank();
        let player1 = self.table.owner(pos1);
        let player2 = self.table.owner(pos2);
        let comm = self.group.comm();
        let tag = self.group.tag();

        if player1 == me && player2 == me {
            let first = self.local_offset(pos1);
            let second = self.local_offset(pos2);
            self.buffer.active_mut().swap(first, second);
        } else if player1 == me {
            let local = self.local_offset(pos1);
            let mine = self.buffer.active()[local];
            let mut other = [0.0_f32; 3];
            comm.send(&mine, player2, tag);
            comm.receive(&mut other, player2, tag);
            self.buffer.active_mut()[local] = other;
        } else if player2 == me {
            let local = self.local_offset(pos2);
            let mine = self.buffer.active()[local];
            let mut other = [0.0_f32; 3];
            comm.receive(&mut other, player1, tag);
            comm.send(&mine, player1, tag);
            self.buffer.active_mut()[local] = other;
        }
    }
}

#[cfg(test)]
mod test {
    use itertools::Itertools;
    use rand::Rng;

    use super::{transfer_schedule, DistributedSelector, PartitionCounts, Transfer};
    use crate::{
        double_buffer::DoubleBuffer,
        geometry::Point,
        index_table::GlobalIndexTable,
        process_group::{run_on_ranks, ProcessGroup},
        tools::seeded_rng,
    };

    /// Points with many repeated coordinates.
    fn coarse_points(npoints: usize, seed: usize) -> Vec<Point> {
        let mut rng = seeded_rng(seed);
        (0..npoints)
            .map(|_| {
                [
                    rng.gen_range(0..10) as f32,
                    rng.gen_range(0..3) as f32,
                    rng.gen::<f32>(),
                ]
            })
            .collect()
    }

    fn sorted_values(points: &[Point], dim: usize) -> Vec<f32> {
        points
            .iter()
            .map(|p| p[dim])
            .sorted_by(|a, b| a.total_cmp(b))
            .collect()
    }

    /// Run a distributed select on `l..=r` and return the new index and the global array.
    fn run_select(counts: &[usize], dim: usize, l: usize, r: usize) -> (Vec<Point>, Vec<Point>, usize) {
        let counts = counts.to_vec();
        let initial = counts
            .iter()
            .enumerate()
            .flat_map(|(rank, &count)| coarse_points(count, rank))
            .collect_vec();

        let result = run_on_ranks(counts.len(), |comm| {
            let rank = comm.rank();
            let table = GlobalIndexTable::build(comm, counts[rank], 1);
            let mut buffer = DoubleBuffer::new(coarse_points(counts[rank], rank)).unwrap();

            let p1 = table.who_has(l).unwrap();
            let p2 = table.who_has(r).unwrap();

            let k = if (p1..=p2).contains(&rank) {
                let group = comm.sub_group(p1, p2, 1);
                let mut selector = DistributedSelector::new(&group, &table, &mut buffer);
                Some(selector.select(dim, l, r))
            } else {
                None
            };

            (buffer.into_active(), k)
        });

        let ks = result.iter().filter_map(|(_, k)| *k).unique().collect_vec();
        assert_eq!(ks.len(), 1);

        let points = result.into_iter().flat_map(|(points, _)| points).collect_vec();
        (initial, points, ks[0])
    }

    fn check_select(initial: &[Point], points: &[Point], dim: usize, l: usize, r: usize, new_k: usize) {
        let k = (l + r) / 2 + 1;
        assert!(l < new_k && new_k <= k);

        // Points outside the range are untouched, the range is a permutation.
        assert_eq!(initial[..l], points[..l]);
        assert_eq!(initial[r + 1..], points[r + 1..]);
        let as_bits = |p: &[Point]| {
            p.iter()
                .map(|x| x.map(f32::to_bits))
                .sorted()
                .collect_vec()
        };
        assert_eq!(as_bits(&initial[l..=r]), as_bits(&points[l..=r]));

        let expected = sorted_values(&initial[l..=r], dim)[k - l];
        let value = points[new_k][dim];
        assert_eq!(value, expected);
        assert_eq!(points[k][dim], expected);
        assert!(points[l..new_k].iter().all(|p| p[dim] < value));
        assert!(points[new_k..=r].iter().all(|p| p[dim] >= value));
    }

    #[test]
    fn test_transfer_schedule() {
        // Two ranks with the range 10..=17.
        let parts = [
            PartitionCounts {
                rank: 2,
                first: 10,
                less: 1,
                equal: 2,
                greater: 1,
            },
            PartitionCounts {
                rank: 3,
                first: 14,
                less: 2,
                equal: 0,
                greater: 2,
            },
        ];

        let transfers = transfer_schedule(&parts);

        let expected = [
            Transfer { from: 2, to: 2, from_index: 10, to_index: 10, count: 1 },
            Transfer { from: 3, to: 2, from_index: 14, to_index: 11, count: 2 },
            Transfer { from: 2, to: 2, from_index: 11, to_index: 13, count: 1 },
            Transfer { from: 2, to: 3, from_index: 12, to_index: 14, count: 1 },
            Transfer { from: 2, to: 3, from_index: 13, to_index: 15, count: 1 },
            Transfer { from: 3, to: 3, from_index: 16, to_index: 16, count: 2 },
        ];

        assert_eq!(transfers, expected);
        assert_eq!(transfers.iter().map(|t| t.count).sum::<usize>(), 8);
    }

    #[test]
    fn test_select_full_range_with_duplicates() {
        let counts = [40, 25, 60];
        let total = counts.iter().sum::<usize>();
        for dim in 0..3 {
            let (initial, points, k) = run_select(&counts, dim, 0, total - 1);
            check_select(&initial, &points, dim, 0, total - 1, k);
        }
    }

    #[test]
    fn test_select_sub_range_with_empty_rank() {
        let counts = [30, 0, 45, 12, 50];
        let (initial, points, k) = run_select(&counts, 0, 17, 101);
        check_select(&initial, &points, 0, 17, 101, k);
    }

    #[test]
    fn test_select_above_sampling_threshold() {
        let counts = [700, 450, 900, 300];
        let total = counts.iter().sum::<usize>();

        let (initial, points, k) = run_select(&counts, 2, 0, total - 1);
        check_select(&initial, &points, 2, 0, total - 1, k);

        let (initial, points, k) = run_select(&counts, 1, 250, 2100);
        check_select(&initial, &points, 1, 250, 2100, k);
    }

    #[test]
    fn test_select_on_single_rank_range() {
        let counts = [10, 80, 10];
        let (initial, points, k) = run_select(&counts, 0, 15, 80);
        check_select(&initial, &points, 0, 15, 80, k);
    }

    #[test]
    fn test_exchange_values() {
        let result = run_on_ranks(3, |comm| {
            let rank = comm.rank();
            let points = (0..4).map(|i| [(4 * rank + i) as f32, 0.0, 0.0]).collect_vec();
            let table = GlobalIndexTable::build(comm, points.len(), 1);
            let mut buffer = DoubleBuffer::new(points).unwrap();
            let group = comm.world(1);

            let mut selector = DistributedSelector::new(&group, &table, &mut buffer);
            selector.exchange_values(1, 10);
            selector.exchange_values(5, 6);
            selector.points().iter().map(|p| p[0] as usize).collect_vec()
        });

        assert_eq!(result.concat(), vec![0, 10, 2, 3, 4, 6, 5, 7, 8, 9, 1, 11]);
    }

    #[test]
    fn test_partition_with_pivot_on_last_rank() {
        let values = [[5, 1, 7, 3], [9, 2, 6, 8], [4, 0, 10, 11]];

        let result = run_on_ranks(3, |comm| {
            let rank = comm.rank();
            let points = values[rank].iter().map(|&x| [x as f32, 0.0, 0.0]).collect_vec();
            let table = GlobalIndexTable::build(comm, points.len(), 1);
            let mut buffer = DoubleBuffer::new(points).unwrap();
            let group = comm.world(1);

            let mut selector = DistributedSelector::new(&group, &table, &mut buffer);
            let bounds = selector.partition_sub_array(2, 10, 8, 0);
            let points = selector.points().iter().map(|p| p[0] as usize).collect_vec();
            (bounds, points)
        });

        assert!(result.iter().all(|(bounds, _)| *bounds == (5, 6)));

        let points = result.into_iter().flat_map(|(_, points)| points).collect_vec();
        assert_eq!(&points[..2], &[5, 1]);
        assert_eq!(points[2..5].iter().copied().sorted().collect_vec(), vec![0, 2, 3]);
        assert_eq!(points[5], 4);
        assert_eq!(
            points[6..11].iter().copied().sorted().collect_vec(),
            vec![6, 7, 8, 9, 10]
        );
        assert_eq!(points[11], 11);
    }
}
