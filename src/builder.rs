//! Recursive subdivision of the point set.

use std::collections::VecDeque;
use std::time::Instant;

use log::{debug, trace};

use crate::{
    constants::{MAX_TREE_LEVEL, NDIM, ROOT_TAG},
    double_buffer::DoubleBuffer,
    error::{KdTreeError, Result},
    geometry::{BoundingBox, Point},
    index_table::GlobalIndexTable,
    kdtree::{KdNode, KdTree, NodeIndex},
    locator::KdTreeConfig,
    process_group::{ProcessGroup, ReduceOp, SubGroup},
    select::DistributedSelector,
    tools::all_check_for_failure,
};

/// A node waiting to be divided.
struct NodeInfo {
    node: NodeIndex,
    l: usize,
    level: usize,
    tag: i32,
}

/// Builds the part of the tree a rank takes part in.
///
/// Every node is divided by the ranks that hold its points. The points are
/// rearranged in place so that after the build the points of every leaf are
/// contiguous in the distributed array.
pub struct TreeBuilder<'a, G: ProcessGroup> {
    comm: &'a G,
    config: &'a KdTreeConfig,
    table: &'a GlobalIndexTable,
    buffer: DoubleBuffer,
}

impl<'a, G: ProcessGroup> TreeBuilder<'a, G> {
    /// Create a builder for the local `points`.
    ///
    /// Fails if the second point buffer cannot be allocated.
    pub fn new(
        comm: &'a G,
        config: &'a KdTreeConfig,
        table: &'a GlobalIndexTable,
        points: Vec<Point>,
    ) -> Result<Self> {
        debug_assert_eq!(points.len(), table.num_cells(comm.rank()));
        Ok(Self {
            comm,
            config,
            table,
            buffer: DoubleBuffer::new(points)?,
        })
    }

    /// The local points in their current order.
    pub fn points(&self) -> &[Point] {
        self.buffer.active()
    }

    /// Consume the builder and return the local points.
    pub fn into_points(self) -> Vec<Point> {
        self.buffer.into_active()
    }

    /// Decide whether a node with `number_of_points` points at `level` is divided.
    pub fn divide_test(&self, number_of_points: usize, level: usize) -> bool {
        let config = self.config;

        if level >= config.max_level.min(MAX_TREE_LEVEL) {
            return false;
        }

        if config.min_cells > 0 && config.min_cells > number_of_points / 2 {
            return false;
        }

        if config.number_of_regions_or_less > 0 && (2 << level) > config.number_of_regions_or_less
        {
            return false;
        }

        if config.number_of_regions_or_more > 0 && (1 << level) >= config.number_of_regions_or_more
        {
            return false;
        }

        config.valid_directions != 0
    }

    fn is_valid_direction(&self, dim: usize) -> bool {
        self.config.valid_directions & (1 << dim) != 0
    }

    /// The valid axis along which the data bounds of `node` are widest.
    pub fn select_cut_direction(&self, node: &KdNode) -> usize {
        let mut maxdim = 0;
        let mut max_extent = -1.0;

        for dim in (0..NDIM).filter(|&dim| self.is_valid_direction(dim)) {
            let extent = node.data_bounds.extent(dim);
            if extent > max_extent {
                max_extent = extent;
                maxdim = dim;
            }
        }

        maxdim
    }

    /// Divide `node`, whose points start at the global index `l`.
    ///
    /// Returns the global index of the first point of the right child, or `None` if
    /// the node is not divided or the calling rank does not take part. All ranks
    /// holding points of the node must call this together.
    pub fn divide_region(
        &mut self,
        tree: &mut KdTree,
        node: NodeIndex,
        l: usize,
        level: usize,
        tag: i32,
    ) -> Result<Option<usize>> {
        let number_of_points = usize::try_from(tree.node(node).number_of_points).unwrap_or(0);

        if !self.divide_test(number_of_points, level) {
            return Ok(None);
        }

        if number_of_points < 2 {
            return self.divide_small_region(tree, node, l, number_of_points);
        }

        let r = l + number_of_points - 1;
        let me = self.comm.rank();
        let p1 = self.table.owner(l);
        let p2 = self.table.owner(r);

        if me < p1 || me > p2 {
            return Ok(None);
        }

        let group = self.comm.sub_group(p1, p2, tag);
        let maxdim = self.select_cut_direction(tree.node(node));
        let alternatives = (0..NDIM)
            .filter(|&other| other != maxdim && self.is_valid_direction(other))
            .collect::<Vec<_>>();

        let (dim, midpt) = {
            let mut selector = DistributedSelector::new(&group, self.table, &mut self.buffer);
            let mut dim = maxdim;
            let mut midpt = selector.select(dim, l, r);

            if midpt < l + 1 {
                trace!(
                    "[{}] could not divide {}..={} along {}, midpoint {}",
                    me,
                    l,
                    r,
                    maxdim,
                    midpt
                );

                let mut candidates = alternatives.into_iter();

                while midpt < l + 1 {
                    match candidates.next() {
                        Some(other) => {
                            dim = other;
                            midpt = selector.select(dim, l, r);
                        }
                        None => {
                            // The points coincide along all valid axes. Partition about
                            // the middle index along the preferred axis and split there.
                            debug!("[{}] coincident points in {}..={}", me, l, r);
                            dim = maxdim;
                            selector.select(dim, l, r);
                            midpt = (l + r) / 2 + 1;
                        }
                    }
                }
            }

            (dim, midpt)
        };

        let [left_data, right_data] = self.data_bounds(&group, l, midpt, r);

        let fail = tree.reserve_children().is_err();
        if all_check_for_failure(&group, fail, "divide region") {
            return Err(KdTreeError::Allocation {
                local: fail,
                stage: "divide region",
            });
        }

        let coord = 0.5 * (left_data.max(dim) + right_data.min(dim));
        let (lower, upper) = tree.node(node).bounds.split(dim, coord);

        tree.node_mut(node).dim = Some(dim);
        tree.add_children(
            node,
            KdNode::new(lower, left_data, (midpt - l) as i64),
            KdNode::new(upper, right_data, (r - midpt + 1) as i64),
        )?;

        trace!(
            "[{}] divided {}..={} along {} at {} (index {})",
            me,
            l,
            r,
            dim,
            coord,
            midpt
        );

        Ok(Some(midpt))
    }

    /// Split a node with at most one point. Only the rank owning index `l` does this,
    /// so both children are handed to it by returning `l`.
    fn divide_small_region(
        &mut self,
        tree: &mut KdTree,
        node: NodeIndex,
        l: usize,
        number_of_points: usize,
    ) -> Result<Option<usize>> {
        if self.table.who_has(l) != Some(self.comm.rank()) {
            return Ok(None);
        }

        let maxdim = self.select_cut_direction(tree.node(node));
        let bounds = tree.node(node).bounds;

        let (lower, upper, left_data, right_data) = if number_of_points == 1 {
            let point = self.buffer.active()[l - self.table.start(self.comm.rank())];
            let coord = point[maxdim] as f64;
            let (lower, upper) = bounds.split(maxdim, coord);
            let point = point.map(|x| x as f64);
            let data = BoundingBox::from_min_max(point, point);
            (lower, upper, data, data)
        } else {
            let coord = 0.5 * (bounds.min(maxdim) + bounds.max(maxdim));
            let (lower, upper) = bounds.split(maxdim, coord);
            (lower, upper, lower, upper)
        };

        tree.node_mut(node).dim = Some(maxdim);
        tree.add_children(
            node,
            KdNode::new(lower, left_data, number_of_points as i64),
            KdNode::new(upper, right_data, 0),
        )?;

        Ok(Some(l))
    }

    /// Tight bounds of the points `l..midpt` and `midpt..=r`, from a single reduction.
    fn data_bounds(&self, group: &SubGroup<'_, G>, l: usize, midpt: usize, r: usize) -> [BoundingBox; 2] {
        let me = self.comm.rank();
        let offset = self.table.start(me);
        let points = self.buffer.active();

        // Minima and negated maxima of both halves, so one min-reduction suffices.
        let mut local = [f32::MAX; 12];
        for (half, (lo, hi)) in [(l, midpt - 1), (midpt, r)].into_iter().enumerate() {
            let part = self.table.local_part(me, lo, hi);
            for point in &points[part.start - offset..part.end - offset] {
                for dim in 0..NDIM {
                    let min = &mut local[6 * half + dim];
                    *min = f32::min(*min, point[dim]);
                    let neg_max = &mut local[6 * half + NDIM + dim];
                    *neg_max = f32::min(*neg_max, -point[dim]);
                }
            }
        }

        let global = group.all_reduce(&local, ReduceOp::Min);

        [0, 1].map(|half| {
            let values = &global[6 * half..6 * half + 6];
            BoundingBox::from_min_max(
                [0, 1, 2].map(|dim| values[dim] as f64),
                [0, 1, 2].map(|dim| -values[NDIM + dim] as f64),
            )
        })
    }

    /// Build the local view of the tree over `volume`.
    ///
    /// Nodes are divided in breadth first order. The root uses the tag
    /// [ROOT_TAG] and the children of a node with tag `t` use `t << 1` and
    /// `(t << 1) | 1`, so all ranks agree on the tag of every node. An allocation
    /// failure does not stop the division, since other ranks may still wait for
    /// this one, but it is reported once the queue is empty.
    pub fn breadth_first_divide(&mut self, volume: BoundingBox) -> Result<KdTree> {
        let now = Instant::now();
        let mut tree = KdTree::new(volume, self.table.total());
        let mut queue = VecDeque::new();
        let mut failure = None;

        queue.push_back(NodeInfo {
            node: tree.root(),
            l: 0,
            level: 0,
            tag: ROOT_TAG,
        });

        while let Some(info) = queue.pop_front() {
            match self.divide_region(&mut tree, info.node, info.l, info.level, info.tag) {
                Ok(Some(midpt)) => {
                    let Some((left, right)) = tree.node(info.node).children() else {
                        continue;
                    };
                    queue.push_back(NodeInfo {
                        node: left,
                        l: info.l,
                        level: info.level + 1,
                        tag: info.tag << 1,
                    });
                    queue.push_back(NodeInfo {
                        node: right,
                        l: midpt,
                        level: info.level + 1,
                        tag: (info.tag << 1) | 1,
                    });
                }
                Ok(None) => (),
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }

        debug!(
            "[{}] breadth first divide: {} ms",
            self.comm.rank(),
            now.elapsed().as_millis()
        );

        match failure {
            Some(err) => Err(err),
            None => Ok(tree),
        }
    }
}

#[cfg(test)]
mod test {
    use itertools::Itertools;

    use super::TreeBuilder;
    use crate::{
        constants::{MAX_TREE_LEVEL, ROOT_TAG},
        geometry::{BoundingBox, Point},
        index_table::GlobalIndexTable,
        kdtree::KdNode,
        locator::KdTreeConfig,
        process_group::{run_on_ranks, LocalGroup, ProcessGroup},
        tools::{generate_random_points, seeded_rng},
    };

    fn builder_for<'a>(
        comm: &'a LocalGroup,
        config: &'a KdTreeConfig,
        table: &'a GlobalIndexTable,
        points: Vec<Point>,
    ) -> TreeBuilder<'a, LocalGroup> {
        TreeBuilder::new(comm, config, table, points).unwrap()
    }

    #[test]
    fn test_divide_test() {
        let comm = LocalGroup::universe(1).remove(0);
        let table = GlobalIndexTable::from_counts(vec![0]);

        let config = KdTreeConfig::default().with_min_cells(10).with_max_level(4);
        let builder = builder_for(&comm, &config, &table, vec![]);
        assert!(builder.divide_test(20, 0));
        assert!(!builder.divide_test(19, 0));
        assert!(!builder.divide_test(1000, 4));

        let config = KdTreeConfig::default()
            .with_min_cells(0)
            .with_number_of_regions_or_less(6);
        let builder = builder_for(&comm, &config, &table, vec![]);
        assert!(builder.divide_test(2, 1));
        assert!(!builder.divide_test(2, 2));

        let config = KdTreeConfig::default()
            .with_min_cells(0)
            .with_number_of_regions_or_more(3);
        let builder = builder_for(&comm, &config, &table, vec![]);
        assert!(builder.divide_test(2, 1));
        assert!(!builder.divide_test(2, 2));
    }

    #[test]
    fn test_depth_is_capped() {
        let comm = LocalGroup::universe(1).remove(0);
        let table = GlobalIndexTable::from_counts(vec![0]);

        assert_eq!(KdTreeConfig::default().with_max_level(64).max_level, MAX_TREE_LEVEL);

        let mut config = KdTreeConfig::default().with_min_cells(0);
        config.max_level = usize::MAX;
        let builder = builder_for(&comm, &config, &table, vec![]);
        assert!(builder.divide_test(2, MAX_TREE_LEVEL - 1));
        assert!(!builder.divide_test(2, MAX_TREE_LEVEL));
        assert!(!builder.divide_test(2, 63));

        // The deepest nodes still carry positive tags.
        let deepest_tag = (ROOT_TAG << MAX_TREE_LEVEL) | ((1 << MAX_TREE_LEVEL) - 1);
        assert!(deepest_tag > 0);
    }

    #[test]
    fn test_select_cut_direction() {
        let comm = LocalGroup::universe(1).remove(0);
        let table = GlobalIndexTable::from_counts(vec![0]);
        let bounds = BoundingBox::new([0.0, 0.0, 0.0, 1.0, 3.0, 3.0]);
        let node = KdNode::new(bounds, bounds, 10);

        let config = KdTreeConfig::default();
        assert_eq!(builder_for(&comm, &config, &table, vec![]).select_cut_direction(&node), 1);

        let config = KdTreeConfig::default().with_valid_directions(0b101);
        assert_eq!(builder_for(&comm, &config, &table, vec![]).select_cut_direction(&node), 2);

        let config = KdTreeConfig::default().with_valid_directions(0b001);
        assert_eq!(builder_for(&comm, &config, &table, vec![]).select_cut_direction(&node), 0);
    }

    #[test]
    fn test_breadth_first_divide_conserves_points() {
        let npoints = [150, 0, 320, 90];
        let config = KdTreeConfig::default().with_min_cells(20);
        let volume = BoundingBox::new([0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);

        let result = run_on_ranks(npoints.len(), |comm| {
            let rank = comm.rank();
            let mut rng = seeded_rng(rank);
            let points = generate_random_points(npoints[rank], &mut rng);
            let table = GlobalIndexTable::build(comm, points.len(), 1);

            let mut builder = TreeBuilder::new(comm, &config, &table, points).unwrap();
            let tree = builder.breadth_first_divide(volume).unwrap();
            (tree, builder.into_points())
        });

        let total = npoints.iter().sum::<usize>() as i64;
        let points = result.iter().flat_map(|(_, points)| points.clone()).collect_vec();

        // Every rank sees the root divided.
        for (tree, _) in &result {
            assert!(tree.node(tree.root()).dim.is_some());
            assert_eq!(tree.node(tree.root()).number_of_points, total);
        }

        // The children of the root split the points at their boundary.
        let (tree, _) = &result[0];
        let (left, right) = tree.node(tree.root()).children().unwrap();
        let dim = tree.node(tree.root()).dim.unwrap();
        let coord = tree.node(left).bounds.max(dim);
        let nleft = tree.node(left).number_of_points as usize;

        assert_eq!(nleft as i64 + tree.node(right).number_of_points, total);
        assert!(points[..nleft].iter().all(|p| (p[dim] as f64) < coord));
        assert!(points[nleft..].iter().all(|p| (p[dim] as f64) > coord));
        assert!(tree.node(left).data_bounds.max(dim) < coord);
    }

    #[test]
    fn test_single_point_is_split_by_owner() {
        let config = KdTreeConfig::default().with_min_cells(0).with_max_level(1);
        let volume = BoundingBox::new([0.0, 0.0, 0.0, 2.0, 1.0, 1.0]);

        let result = run_on_ranks(2, |comm| {
            let points = if comm.rank() == 1 {
                vec![[0.5, 0.5, 0.5]]
            } else {
                vec![]
            };
            let table = GlobalIndexTable::build(comm, points.len(), 1);
            let mut builder = TreeBuilder::new(comm, &config, &table, points).unwrap();
            builder.breadth_first_divide(volume).unwrap()
        });

        assert!(result[0].node(0).is_leaf());
        let tree = &result[1];
        let (left, right) = tree.node(0).children().unwrap();
        assert_eq!(tree.node(0).dim, Some(0));
        assert_eq!(tree.node(left).bounds.max(0), 0.5);
        assert_eq!(tree.node(left).number_of_points, 1);
        assert_eq!(tree.node(right).number_of_points, 0);
    }
}
