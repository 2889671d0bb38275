//! Merging the partial trees of all ranks.

use std::time::Instant;

use log::debug;

use crate::{
    constants::{MERGE_TAG, PACKED_NODE_LEN},
    error::{KdTreeError, Result},
    kdtree::{KdTree, NodeIndex},
    process_group::{ProcessGroup, ReduceOp, SubGroup},
    tools::all_check_for_failure,
};

/// Turns the partial trees produced by the division into one tree that is
/// identical on all ranks.
pub struct TreeCompleter<'a, G: ProcessGroup> {
    comm: &'a G,
    tag: i32,
}

impl<'a, G: ProcessGroup> TreeCompleter<'a, G> {
    /// Create a completer communicating under `tag`.
    pub fn new(comm: &'a G, tag: i32) -> Self {
        Self { comm, tag }
    }

    /// Complete the local view `tree`.
    ///
    /// Every rank only knows the nodes it helped to divide. The local trees are
    /// padded with placeholder nodes to a common depth, rank 0 collects the geometry
    /// of every divided node from the first rank that divided it and drops
    /// subtrees nobody divided. Rank 0 then fixes the region boundaries and sends
    /// the merged tree to all ranks.
    pub fn complete_tree(&self, mut tree: KdTree) -> Result<KdTree> {
        let now = Instant::now();
        let world = self.comm.world(self.tag);

        let depth = world.all_reduce_value(tree.depth(), ReduceOp::Max);

        let fail = tree.fill_out(depth).is_err();
        if all_check_for_failure(&world, fail, "complete tree") {
            return Err(KdTreeError::Allocation {
                local: fail,
                stage: "complete tree",
            });
        }

        let root = tree.root();
        self.reduce_data(&world, &mut tree, root);

        if self.comm.rank() == 0 {
            tree.check_fix_region_boundaries();
        }

        let tree = self.broadcast_tree(&world, &tree)?;

        debug!(
            "[{}] complete tree (depth {}): {} ms",
            self.comm.rank(),
            depth,
            now.elapsed().as_millis()
        );

        Ok(tree)
    }

    /// Collect the children of `index` and all its descendants on rank 0.
    fn reduce_data(&self, world: &SubGroup<'_, G>, tree: &mut KdTree, index: NodeIndex) {
        let Some((left, right)) = tree.node(index).children() else {
            return;
        };

        let me = self.comm.rank();
        let divided = tree.node(index).dim.is_some();
        let sources = world.all_gather(&[divided]);

        if !sources[0] {
            match sources.iter().position(|&divided| divided) {
                None => {
                    // Nobody divided the node, the children are padding.
                    tree.delete_all_descendants(index);
                    return;
                }
                Some(source) if source == me => {
                    self.comm.send(&tree.pack_children(index), 0, MERGE_TAG);
                }
                Some(source) if me == 0 => {
                    let mut data = [0.0; PACKED_NODE_LEN];
                    self.comm.receive(&mut data, source, MERGE_TAG);
                    tree.unpack_children(index, &data);
                }
                Some(_) => (),
            }
        }

        self.reduce_data(world, tree, left);
        self.reduce_data(world, tree, right);
    }

    /// Send the tree of rank 0 to all ranks.
    fn broadcast_tree(&self, world: &SubGroup<'_, G>, tree: &KdTree) -> Result<KdTree> {
        let mut data = if self.comm.rank() == 0 {
            tree.to_flat()
        } else {
            Vec::new()
        };

        let mut len = [data.len()];
        world.broadcast(&mut len, 0);

        let fail = data.try_reserve_exact(len[0] - data.len()).is_err();
        if all_check_for_failure(world, fail, "broadcast tree") {
            return Err(KdTreeError::Allocation {
                local: fail,
                stage: "broadcast tree",
            });
        }
        data.resize(len[0], 0.0);

        world.broadcast(&mut data, 0);

        KdTree::from_flat(&data)
    }
}

#[cfg(test)]
mod test {
    use itertools::Itertools;

    use super::TreeCompleter;
    use crate::{
        builder::TreeBuilder,
        constants::COMPLETE_TAG,
        geometry::BoundingBox,
        index_table::GlobalIndexTable,
        kdtree::{KdNode, KdTree},
        locator::KdTreeConfig,
        process_group::{run_on_ranks, ProcessGroup},
        tools::{generate_random_points, seeded_rng},
    };

    #[test]
    fn test_merge_node_divided_on_other_rank() {
        let bounds = BoundingBox::new([0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);

        let result = run_on_ranks(3, |comm| {
            let mut tree = KdTree::new(bounds, 1);
            if comm.rank() == 2 {
                let (lower, upper) = bounds.split(2, 0.25);
                tree.node_mut(0).dim = Some(2);
                tree.add_children(0, KdNode::new(lower, lower, 1), KdNode::new(upper, upper, 0))
                    .unwrap();
            }
            let mut tree = TreeCompleter::new(comm, COMPLETE_TAG).complete_tree(tree).unwrap();
            tree.build_region_list();
            tree
        });

        for tree in &result {
            assert_eq!(*tree, result[0]);
        }

        let tree = &result[0];
        assert_eq!(tree.number_of_regions(), 2);
        assert_eq!(tree.node(0).dim, Some(2));
        assert_eq!(tree.region(0).unwrap().bounds.max(2), 0.25);
        assert_eq!(tree.region(0).unwrap().number_of_points, 1);
        assert_eq!(tree.region(1).unwrap().number_of_points, 0);
    }

    #[test]
    fn test_undivided_padding_is_dropped() {
        let bounds = BoundingBox::new([0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);

        let result = run_on_ranks(2, |comm| {
            // Both ranks divide the root, only rank 1 divides the upper child.
            let mut tree = KdTree::new(bounds, 3);
            let (lower, upper) = bounds.split(0, 0.5);
            tree.node_mut(0).dim = Some(0);
            let (_, right) = tree
                .add_children(0, KdNode::new(lower, lower, 1), KdNode::new(upper, upper, 2))
                .unwrap();
            if comm.rank() == 1 {
                let (front, back) = upper.split(1, 0.5);
                tree.node_mut(right).dim = Some(1);
                tree.add_children(right, KdNode::new(front, front, 1), KdNode::new(back, back, 1))
                    .unwrap();
            }
            let mut tree = TreeCompleter::new(comm, COMPLETE_TAG).complete_tree(tree).unwrap();
            tree.build_region_list();
            tree
        });

        let tree = &result[1];
        assert_eq!(*tree, result[0]);
        assert_eq!(tree.number_of_regions(), 3);
        assert_eq!(tree.depth(), 2);
        assert_eq!(tree.arena_len(), 5);
        assert!(tree.region(0).unwrap().is_leaf());
        assert_eq!(tree.region(0).unwrap().number_of_points, 1);
    }

    #[test]
    fn test_complete_random_tree() {
        let npoints = [300, 150, 0, 420, 75];
        let total = npoints.iter().sum::<usize>();
        let config = KdTreeConfig::default().with_min_cells(30);
        let volume = BoundingBox::new([0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);

        let result = run_on_ranks(npoints.len(), |comm| {
            let rank = comm.rank();
            let mut rng = seeded_rng(10 + rank);
            let points = generate_random_points(npoints[rank], &mut rng);
            let table = GlobalIndexTable::build(comm, points.len(), 1);

            let mut builder = TreeBuilder::new(comm, &config, &table, points).unwrap();
            let tree = builder.breadth_first_divide(volume).unwrap();
            let mut tree = TreeCompleter::new(comm, COMPLETE_TAG).complete_tree(tree).unwrap();
            tree.build_region_list();
            (tree, builder.into_points())
        });

        let (tree, _) = &result[0];
        for (other, _) in &result {
            assert_eq!(other, tree);
        }

        let regions = (0..tree.number_of_regions())
            .map(|region| tree.region(region).unwrap())
            .collect_vec();

        // Count conservation.
        assert!(regions.iter().all(|region| region.number_of_points >= 0));
        assert_eq!(
            regions.iter().map(|region| region.number_of_points).sum::<i64>(),
            total as i64
        );

        // Coverage without overlap.
        let volume_sum = regions.iter().map(|region| region.bounds.volume()).sum::<f64>();
        assert!((volume_sum - volume.volume()).abs() < 1e-10);
        for (first, second) in regions.iter().tuple_combinations() {
            assert!(first.bounds.intersection_volume(&second.bounds) < 1e-12);
        }

        // The points of every leaf are contiguous in the distributed array and lie
        // in the leaf.
        let points = result.iter().flat_map(|(_, points)| points.clone()).collect_vec();
        let mut start = 0;
        for region in &regions {
            let end = start + region.number_of_points as usize;
            for point in &points[start..end] {
                assert!(region.bounds.contains(point.map(|x| x as f64)));
            }
            start = end;
        }
    }
}
