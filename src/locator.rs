//! The distributed k-d tree and its build.

use std::time::Instant;

use log::{debug, info, warn};

use crate::{
    assignment::{AssignmentPolicy, RegionAssigner},
    builder::TreeBuilder,
    complete::TreeCompleter,
    constants::{
        ALL_DIRECTIONS, COMPLETE_TAG, DEFAULT_MAX_LEVEL, DEFAULT_MIN_CELLS, DEGENERATE_VOLUME_PAD,
        DIVIDE_VOTE_TAG, MAX_TREE_LEVEL, NDIM, REBUILD_TAG,
    },
    error::{KdTreeError, Result},
    geometry::{BoundingBox, Point},
    index_table::GlobalIndexTable,
    kdtree::{KdNode, KdTree},
    process_group::{ProcessGroup, ReduceOp},
    process_tables::ProcessDataTables,
    tools::all_check_result,
};

/// Parameters of the tree build.
///
/// All ranks must use the same parameters. At the start of every build the
/// parameters of rank 0 are adopted by all other ranks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KdTreeConfig {
    /// A region is only divided if both children receive at least this many points.
    /// Zero disables the check.
    pub min_cells: usize,
    /// Maximum depth of the tree. Depths beyond [MAX_TREE_LEVEL] are not reached.
    pub max_level: usize,
    /// Stop dividing before the number of regions exceeds this. Zero disables the check.
    pub number_of_regions_or_less: usize,
    /// Stop dividing once the number of regions reaches this. Zero disables the check.
    pub number_of_regions_or_more: usize,
    /// Bitmask of the axes along which regions may be divided, bit `i` for axis `i`.
    pub valid_directions: u8,
    /// How regions are assigned to processes.
    pub region_assignment: AssignmentPolicy,
}

impl Default for KdTreeConfig {
    fn default() -> Self {
        Self {
            min_cells: DEFAULT_MIN_CELLS,
            max_level: DEFAULT_MAX_LEVEL,
            number_of_regions_or_less: 0,
            number_of_regions_or_more: 0,
            valid_directions: ALL_DIRECTIONS,
            region_assignment: AssignmentPolicy::default(),
        }
    }
}

impl KdTreeConfig {
    /// Set the minimum number of points per region.
    pub fn with_min_cells(mut self, min_cells: usize) -> Self {
        self.min_cells = min_cells;
        self
    }

    /// Set the maximum depth, at most [MAX_TREE_LEVEL].
    pub fn with_max_level(mut self, max_level: usize) -> Self {
        self.max_level = max_level.min(MAX_TREE_LEVEL);
        self
    }

    /// Set the upper bound on the number of regions.
    pub fn with_number_of_regions_or_less(mut self, nregions: usize) -> Self {
        self.number_of_regions_or_less = nregions;
        self
    }

    /// Set the lower bound on the number of regions.
    pub fn with_number_of_regions_or_more(mut self, nregions: usize) -> Self {
        self.number_of_regions_or_more = nregions;
        self
    }

    /// Set the axes along which regions may be divided.
    pub fn with_valid_directions(mut self, valid_directions: u8) -> Self {
        self.valid_directions = valid_directions & ALL_DIRECTIONS;
        self
    }

    /// Set the region assignment policy.
    pub fn with_region_assignment(mut self, policy: AssignmentPolicy) -> Self {
        self.region_assignment = policy;
        self
    }

    fn to_params(&self) -> [usize; 6] {
        [
            self.valid_directions as usize,
            self.min_cells,
            self.number_of_regions_or_less,
            self.number_of_regions_or_more,
            self.region_assignment.as_usize(),
            self.max_level,
        ]
    }

    fn from_params(params: [usize; 6]) -> Self {
        Self {
            valid_directions: (params[0] & ALL_DIRECTIONS as usize) as u8,
            min_cells: params[1],
            number_of_regions_or_less: params[2],
            number_of_regions_or_more: params[3],
            region_assignment: AssignmentPolicy::from_usize(params[4]).unwrap_or_default(),
            max_level: params[5].min(MAX_TREE_LEVEL),
        }
    }
}

/// The local part of the point set a tree is built over.
pub trait PointSource {
    /// Number of local points.
    fn local_point_count(&self) -> usize;

    /// The local points, e.g. the centers of the local cells. Called once per build.
    fn compute_local_points(&self) -> Vec<Point>;

    /// Bounds of the local data given the computed `points`, `None` if there is none.
    ///
    /// Sources whose geometry extends beyond their points, like cells around their
    /// centers, report the larger bounds here.
    fn local_bounds(&self, points: &[Point]) -> Option<BoundingBox> {
        BoundingBox::from_points(points)
    }
}

impl PointSource for [Point] {
    fn local_point_count(&self) -> usize {
        self.len()
    }

    fn compute_local_points(&self) -> Vec<Point> {
        self.to_vec()
    }
}

impl PointSource for Vec<Point> {
    fn local_point_count(&self) -> usize {
        self.as_slice().local_point_count()
    }

    fn compute_local_points(&self) -> Vec<Point> {
        self.as_slice().compute_local_points()
    }
}

/// A k-d tree over a point set distributed across a process group.
///
/// After [ParallelKdTree::build_locator] every rank holds the same tree and the
/// same assignment of regions to processes.
pub struct ParallelKdTree<'g, G: ProcessGroup> {
    comm: &'g G,
    config: KdTreeConfig,
    tree: Option<KdTree>,
    actual_level: usize,
    points: Vec<Point>,
    index_table: Option<GlobalIndexTable>,
    assigner: RegionAssigner,
    process_tables: Option<ProcessDataTables>,
}

impl<'g, G: ProcessGroup> ParallelKdTree<'g, G> {
    /// A new locator without a tree.
    pub fn new(comm: &'g G, config: KdTreeConfig) -> Self {
        let assigner = RegionAssigner::new(comm.size(), config.region_assignment);
        Self {
            comm,
            config,
            tree: None,
            actual_level: 0,
            points: Vec::new(),
            index_table: None,
            assigner,
            process_tables: None,
        }
    }

    /// The parameters of the next build.
    pub fn config(&self) -> &KdTreeConfig {
        &self.config
    }

    /// Replace the parameters. They take effect with the next build.
    pub fn set_config(&mut self, config: KdTreeConfig) {
        self.assigner.set_policy(config.region_assignment);
        self.config = config;
    }

    /// Build the tree over the points of `source`.
    ///
    /// This is a collective operation on the whole process group. On failure all
    /// ranks return an error and no tree is left behind.
    pub fn build_locator<S: PointSource + ?Sized>(&mut self, source: &S) -> Result<()> {
        let now = Instant::now();
        let rank = self.comm.rank();

        self.clear();
        self.all_check_parameters();

        let (tree, points, index_table) = match self.build_tree(source) {
            Ok(built) => built,
            Err(err) => {
                warn!("[{}] building the k-d tree failed: {}", rank, err);
                self.assigner.clear();
                return Err(err);
            }
        };

        self.actual_level = tree.depth();
        info!(
            "[{}] built k-d tree over {} points: {} regions, depth {}",
            rank,
            index_table.total(),
            tree.number_of_regions(),
            self.actual_level
        );

        self.tree = Some(tree);
        self.points = points;
        self.index_table = Some(index_table);

        debug!("[{}] build locator: {} ms", rank, now.elapsed().as_millis());

        self.update_region_assignment()
    }

    fn build_tree<S: PointSource + ?Sized>(
        &self,
        source: &S,
    ) -> Result<(KdTree, Vec<Point>, GlobalIndexTable)> {
        let points = source.compute_local_points();
        debug_assert_eq!(points.len(), source.local_point_count());

        let volume = self.volume_bounds(source.local_bounds(&points))?;

        let index_table = GlobalIndexTable::build(self.comm, points.len(), REBUILD_TAG);

        let builder = TreeBuilder::new(self.comm, &self.config, &index_table, points);
        let mut builder = all_check_result(&self.comm.world(REBUILD_TAG), builder, "double buffer")?;

        let tree = builder.breadth_first_divide(volume);
        let tree = all_check_result(&self.comm.world(DIVIDE_VOTE_TAG), tree, "breadth first divide")?;
        let points = builder.into_points();

        let mut tree = TreeCompleter::new(self.comm, COMPLETE_TAG).complete_tree(tree)?;
        tree.build_region_list();

        Ok((tree, points, index_table))
    }

    /// Adopt the parameters of rank 0.
    fn all_check_parameters(&mut self) {
        let mut params = self.config.to_params();
        self.comm.world(REBUILD_TAG).broadcast(&mut params, 0);

        let config = KdTreeConfig::from_params(params);
        if config != self.config {
            warn!(
                "[{}] changing my runtime parameters to match process 0",
                self.comm.rank()
            );
            self.set_config(config);
        }
    }

    /// The global bounds of the point set, pushed out a little.
    ///
    /// Axes without extent are widened by a hundredth of the largest extent, all
    /// others by a thousandth of that. If all points coincide every axis is widened
    /// by [DEGENERATE_VOLUME_PAD].
    fn volume_bounds(&self, local_bounds: Option<BoundingBox>) -> Result<BoundingBox> {
        let mut local = [f64::MAX; 2 * NDIM];
        if let Some(bounds) = local_bounds {
            for dim in 0..NDIM {
                local[dim] = bounds.min(dim);
                local[NDIM + dim] = -bounds.max(dim);
            }
        }

        let global = self.comm.world(REBUILD_TAG).all_reduce(&local, ReduceOp::Min);
        if global[0] == f64::MAX || !global.iter().all(|value| value.is_finite()) {
            return Err(KdTreeError::DegenerateVolume);
        }

        let mut volume = BoundingBox::from_min_max(
            [0, 1, 2].map(|dim| global[dim]),
            [0, 1, 2].map(|dim| -global[NDIM + dim]),
        );

        let max_extent = (0..NDIM).map(|dim| volume.extent(dim)).fold(0.0, f64::max);

        let (a_little, fudge) = if max_extent > 0.0 {
            (max_extent / 100.0, max_extent / 100.0 * 1e-3)
        } else {
            warn!(
                "[{}] all points coincide at {:?}",
                self.comm.rank(),
                volume.center()
            );
            (DEGENERATE_VOLUME_PAD, DEGENERATE_VOLUME_PAD)
        };

        for dim in 0..NDIM {
            let pad = if volume.extent(dim) > 0.0 { fudge } else { a_little };
            volume.set_min(dim, volume.min(dim) - pad);
            volume.set_max(dim, volume.max(dim) + pad);
        }

        debug!("[{}] volume bounds {}", self.comm.rank(), volume);

        Ok(volume)
    }

    /// Drop the tree and everything derived from it.
    pub fn clear(&mut self) {
        self.tree = None;
        self.actual_level = 0;
        self.points.clear();
        self.index_table = None;
        self.process_tables = None;
    }

    /// The tree of the last successful build.
    pub fn tree(&self) -> Result<&KdTree> {
        self.tree.as_ref().ok_or(KdTreeError::NoTree)
    }

    /// The local slice of the spatially ordered point set.
    ///
    /// The points of every region are contiguous across the ranks, in region order.
    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// Global index ranges of [ParallelKdTree::points] on all ranks.
    pub fn index_table(&self) -> Result<&GlobalIndexTable> {
        self.index_table.as_ref().ok_or(KdTreeError::NoTree)
    }

    /// Depth of the tree.
    pub fn actual_level(&self) -> usize {
        self.actual_level
    }

    /// Number of leaf regions, zero without a tree.
    pub fn number_of_regions(&self) -> usize {
        self.tree.as_ref().map_or(0, |tree| tree.number_of_regions())
    }

    fn region(&self, region: usize) -> Result<&KdNode> {
        self.tree()?.region(region)
    }

    /// Spatial bounds of `region`.
    pub fn region_bounds(&self, region: usize) -> Result<BoundingBox> {
        Ok(self.region(region)?.bounds)
    }

    /// Tight bounds of the points in `region`.
    pub fn region_data_bounds(&self, region: usize) -> Result<BoundingBox> {
        Ok(self.region(region)?.data_bounds)
    }

    /// Number of points in `region`.
    pub fn region_point_count(&self, region: usize) -> Result<usize> {
        Ok(self.region(region)?.number_of_points.max(0) as usize)
    }

    /// The region containing `point`, `None` if it lies outside of the tree.
    pub fn region_containing_point(&self, point: [f64; 3]) -> Result<Option<usize>> {
        Ok(self.tree()?.region_containing_point(point))
    }

    /// Bounds of the nodes at `level`, left to right.
    pub fn regions_at_level(&self, level: usize) -> Result<Vec<BoundingBox>> {
        let tree = self.tree()?;
        Ok(tree
            .regions_at_level(level)
            .into_iter()
            .map(|index| tree.node(index).bounds)
            .collect())
    }

    /// Regions ordered front to back for a viewer looking along `direction`.
    pub fn view_order_regions_in_direction(&self, direction: [f64; 3]) -> Result<Vec<usize>> {
        Ok(self.tree()?.view_order_regions_in_direction(direction))
    }

    /// Regions ordered front to back for a viewer at `position`.
    pub fn view_order_regions_from_position(&self, position: [f64; 3]) -> Result<Vec<usize>> {
        Ok(self.tree()?.view_order_regions_from_position(position))
    }

    /// Processes ordered front to back for a viewer looking along `direction`.
    ///
    /// Every process appears once, at its frontmost region.
    pub fn view_order_processes_in_direction(&self, direction: [f64; 3]) -> Result<Vec<usize>> {
        let regions = self.view_order_regions_in_direction(direction)?;
        Ok(self.assigner.process_order(&regions))
    }

    /// Processes ordered front to back for a viewer at `position`.
    pub fn view_order_processes_from_position(&self, position: [f64; 3]) -> Result<Vec<usize>> {
        let regions = self.view_order_regions_from_position(position)?;
        Ok(self.assigner.process_order(&regions))
    }

    /// Recompute the region assignment with the active policy.
    pub fn update_region_assignment(&mut self) -> Result<()> {
        let now = Instant::now();
        let tree = self.tree.as_ref().ok_or(KdTreeError::NoTree)?;

        self.assigner.update_region_assignment(tree)?;

        debug!(
            "[{}] update region assignment: {} ms",
            self.comm.rank(),
            now.elapsed().as_millis()
        );

        Ok(())
    }

    /// Switch the assignment policy and reassign the regions of the current tree.
    pub fn set_region_assignment(&mut self, policy: AssignmentPolicy) -> Result<()> {
        self.config.region_assignment = policy;
        self.assigner.set_policy(policy);

        if self.tree.is_some() {
            self.update_region_assignment()?;
        }

        Ok(())
    }

    /// Assign region `i` to process `map[i]`.
    ///
    /// An invalid map is rejected and the previous assignment is kept.
    pub fn assign_regions(&mut self, map: &[usize]) -> Result<()> {
        let tree = self.tree.as_ref().ok_or(KdTreeError::NoTree)?;
        self.assigner.assign_regions(tree, map)?;
        self.config.region_assignment = AssignmentPolicy::UserDefined;
        Ok(())
    }

    /// The active assignment policy.
    pub fn region_assignment(&self) -> AssignmentPolicy {
        self.assigner.policy()
    }

    /// The owning process of every region.
    pub fn region_assignment_map(&self) -> &[usize] {
        self.assigner.region_assignment_map()
    }

    /// The regions assigned to `proc`.
    pub fn region_assignment_list(&self, proc: usize) -> Result<&[usize]> {
        self.assigner.region_assignment_list(proc)
    }

    /// The process owning `region`.
    pub fn process_assigned_to_region(&self, region: usize) -> Result<usize> {
        self.assigner.process_assigned_to_region(region)
    }

    /// Record which processes hold points of `source` in which regions.
    ///
    /// This is a collective operation. `source` is the input of the last build, or
    /// any other point set inside the tree.
    pub fn create_process_cell_count_data<S: PointSource + ?Sized>(&mut self, source: &S) -> Result<()> {
        self.process_tables = None;
        let tree = self.tree.as_ref().ok_or(KdTreeError::NoTree)?;
        let points = source.compute_local_points();

        self.process_tables = Some(ProcessDataTables::create(self.comm, tree, &points)?);

        Ok(())
    }

    /// The tables of the last call to [ParallelKdTree::create_process_cell_count_data].
    pub fn process_tables(&self) -> Result<&ProcessDataTables> {
        self.process_tables.as_ref().ok_or(KdTreeError::NoProcessData)
    }

    /// True if `proc` has points in `region`.
    pub fn has_data(&self, proc: usize, region: usize) -> Result<bool> {
        self.process_tables()?.has_data(proc, region)
    }
}
