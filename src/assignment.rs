//! Assignment of the leaf regions to processes.

use itertools::Itertools;
use log::debug;

use crate::{
    error::{KdTreeError, Result},
    kdtree::{KdTree, NodeIndex},
    tools::floor_log2,
};

/// How leaf regions are handed out to processes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum AssignmentPolicy {
    /// Every process receives a spatially contiguous set of regions.
    #[default]
    Contiguous,
    /// Region `i` goes to process `i mod P`.
    RoundRobin,
    /// An explicit map provided by the caller.
    UserDefined,
}

impl AssignmentPolicy {
    /// Encoding used when the configuration is exchanged between ranks.
    pub fn as_usize(&self) -> usize {
        match self {
            AssignmentPolicy::Contiguous => 0,
            AssignmentPolicy::RoundRobin => 1,
            AssignmentPolicy::UserDefined => 2,
        }
    }

    /// Inverse of [AssignmentPolicy::as_usize].
    pub fn from_usize(value: usize) -> Option<Self> {
        match value {
            0 => Some(AssignmentPolicy::Contiguous),
            1 => Some(AssignmentPolicy::RoundRobin),
            2 => Some(AssignmentPolicy::UserDefined),
            _ => None,
        }
    }
}

/// The region to process map and its inverse.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionAssigner {
    policy: AssignmentPolicy,
    nprocesses: usize,
    region_assignment_map: Vec<usize>,
    process_assignment_map: Vec<Vec<usize>>,
}

impl RegionAssigner {
    /// An assigner for `nprocesses` processes without any assignment yet.
    pub fn new(nprocesses: usize, policy: AssignmentPolicy) -> Self {
        Self {
            policy,
            nprocesses,
            region_assignment_map: Vec::new(),
            process_assignment_map: vec![Vec::new(); nprocesses],
        }
    }

    /// The active policy.
    pub fn policy(&self) -> AssignmentPolicy {
        self.policy
    }

    /// Number of processes.
    pub fn number_of_processes(&self) -> usize {
        self.nprocesses
    }

    /// Switch the policy. The maps are rebuilt by the next call to
    /// [RegionAssigner::update_region_assignment].
    pub fn set_policy(&mut self, policy: AssignmentPolicy) {
        self.policy = policy;
    }

    /// Recompute the assignment for `tree` according to the active policy.
    ///
    /// A user defined map is kept as long as it matches the number of regions of
    /// the tree. Otherwise it is dropped and an error is returned.
    pub fn update_region_assignment(&mut self, tree: &KdTree) -> Result<()> {
        match self.policy {
            AssignmentPolicy::Contiguous => self.assign_regions_contiguous(tree),
            AssignmentPolicy::RoundRobin => self.assign_regions_round_robin(tree),
            AssignmentPolicy::UserDefined => {
                let expected = tree.number_of_regions();
                let len = self.region_assignment_map.len();
                if len != expected {
                    self.clear();
                    return Err(KdTreeError::InvalidAssignment { len, expected });
                }
            }
        }

        Ok(())
    }

    /// Region `i` goes to process `i mod P`.
    pub fn assign_regions_round_robin(&mut self, tree: &KdTree) {
        self.policy = AssignmentPolicy::RoundRobin;
        self.round_robin(tree.number_of_regions());
    }

    fn round_robin(&mut self, nregions: usize) {
        self.region_assignment_map = (0..nregions).map(|region| region % self.nprocesses).collect();
        self.build_region_lists_for_processes();
    }

    /// Hand every process the leaves of one or two subtrees.
    ///
    /// With `2^k <= P < 2^(k+1)` the subtrees at level `k` are distributed. If `P`
    /// is not a power of two, the first subtrees are split into their two children
    /// until the remaining subtrees match the remaining processes. With no more
    /// regions than processes this is a round robin assignment.
    pub fn assign_regions_contiguous(&mut self, tree: &KdTree) {
        self.policy = AssignmentPolicy::Contiguous;

        let nregions = tree.number_of_regions();
        if nregions <= self.nprocesses {
            self.round_robin(nregions);
            return;
        }

        let mut map = vec![0; nregions];
        let mut assign = |proc: usize, node: NodeIndex| {
            for region in tree.leaf_region_ids(node) {
                map[region] = proc;
            }
        };

        let floor_log_p = floor_log2(self.nprocesses);
        let nodes = tree.regions_at_level(floor_log_p);

        if self.nprocesses == 1 << floor_log_p {
            for (proc, &node) in nodes.iter().enumerate() {
                assign(proc, node);
            }
        } else {
            let mut nodes_left = 1 << (floor_log_p + 1);
            let mut procs_left = self.nprocesses;
            let mut proc = 0;

            for &node in &nodes {
                if nodes_left > procs_left {
                    assign(proc, node);
                    procs_left -= 1;
                    proc += 1;
                } else {
                    match tree.node(node).children() {
                        Some((left, right)) => {
                            assign(proc, left);
                            assign(proc + 1, right);
                        }
                        // A leaf above the level cannot be split, the second process
                        // stays idle.
                        None => assign(proc, node),
                    }
                    procs_left -= 2;
                    proc += 2;
                }
                nodes_left -= 2;
            }
        }

        self.region_assignment_map = map;
        self.build_region_lists_for_processes();
    }

    /// Use an explicit region to process map.
    ///
    /// The map must have one entry per region of `tree`, each a valid process id.
    /// An invalid map is rejected as a whole and the previous assignment is kept.
    pub fn assign_regions(&mut self, tree: &KdTree, map: &[usize]) -> Result<()> {
        let expected = tree.number_of_regions();
        if map.len() != expected {
            return Err(KdTreeError::InvalidAssignment {
                len: map.len(),
                expected,
            });
        }

        if let Some((region, &rank)) = map.iter().find_position(|&&rank| rank >= self.nprocesses) {
            return Err(KdTreeError::InvalidAssignmentRank {
                region,
                rank,
                size: self.nprocesses,
            });
        }

        self.policy = AssignmentPolicy::UserDefined;
        self.region_assignment_map = map.to_vec();
        self.build_region_lists_for_processes();

        Ok(())
    }

    /// Rebuild the process to region lists in one pass over the region map.
    fn build_region_lists_for_processes(&mut self) {
        let mut lists = vec![Vec::new(); self.nprocesses];
        for (region, &proc) in self.region_assignment_map.iter().enumerate() {
            lists[proc].push(region);
        }
        self.process_assignment_map = lists;

        debug!(
            "region assignment ({:?}): {} regions, {:?} per process",
            self.policy,
            self.region_assignment_map.len(),
            self.process_assignment_map.iter().map(|list| list.len()).collect_vec()
        );
    }

    /// Forget the current assignment.
    pub fn clear(&mut self) {
        self.region_assignment_map.clear();
        self.process_assignment_map = vec![Vec::new(); self.nprocesses];
    }

    /// The owning process of every region.
    pub fn region_assignment_map(&self) -> &[usize] {
        &self.region_assignment_map
    }

    /// The regions of every process, in ascending order.
    pub fn process_assignment_map(&self) -> &[Vec<usize>] {
        &self.process_assignment_map
    }

    /// The regions assigned to `proc`.
    pub fn region_assignment_list(&self, proc: usize) -> Result<&[usize]> {
        self.process_assignment_map
            .get(proc)
            .map(|list| list.as_slice())
            .ok_or(KdTreeError::InvalidProcess(proc))
    }

    /// The process owning `region`.
    pub fn process_assigned_to_region(&self, region: usize) -> Result<usize> {
        self.region_assignment_map
            .get(region)
            .copied()
            .ok_or(KdTreeError::InvalidRegion(region))
    }

    /// The owners of `regions`, each process listed once at its first region.
    pub fn process_order(&self, regions: &[usize]) -> Vec<usize> {
        regions
            .iter()
            .filter_map(|&region| self.region_assignment_map.get(region).copied())
            .unique()
            .collect()
    }
}
