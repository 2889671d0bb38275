//! Test the assignment of k-d tree regions to MPI ranks.

use bempp_kdtree::{
    assignment::AssignmentPolicy,
    process_group::{MpiGroup, ProcessGroup},
    tools::generate_random_points,
    KdTreeConfig, ParallelKdTree,
};
use itertools::Itertools;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

pub fn main() {
    // Initialise MPI
    let universe = mpi::initialize().unwrap();

    // Get the world communicator
    let world = universe.world();
    let comm = MpiGroup::new(&world);
    let rank = comm.rank();
    let size = comm.size();

    // Initialise a seeded Rng.
    let mut rng = ChaCha8Rng::seed_from_u64(rank as u64);

    let points = generate_random_points(2000, &mut rng);

    let config = KdTreeConfig::default().with_number_of_regions_or_more(4 * size);
    let mut kdtree = ParallelKdTree::new(&comm, config);
    kdtree.build_locator(&points).unwrap();
    kdtree.create_process_cell_count_data(&points).unwrap();

    let nregions = kdtree.number_of_regions();

    for policy in [AssignmentPolicy::Contiguous, AssignmentPolicy::RoundRobin] {
        kdtree.set_region_assignment(policy).unwrap();
        let map = kdtree.region_assignment_map().to_vec();

        // Every region is assigned exactly once.
        assert_eq!(map.len(), nregions);
        let regions = (0..size)
            .flat_map(|proc| kdtree.region_assignment_list(proc).unwrap().to_vec())
            .sorted()
            .collect_vec();
        assert_eq!(regions, (0..nregions).collect_vec());

        // A second update gives the same map.
        kdtree.update_region_assignment().unwrap();
        assert_eq!(kdtree.region_assignment_map(), map.as_slice());
    }

    // Every rank has input points in some region.
    let tables = kdtree.process_tables().unwrap();
    assert!(tables.total_regions_for_process(rank).unwrap() > 0);
    for region in tables.region_list_for_process(rank).unwrap() {
        assert!(kdtree.has_data(rank, *region).unwrap());
    }

    if rank == 0 {
        println!(
            "Assigned {} regions to {} processes: {:?}",
            nregions,
            size,
            kdtree.region_assignment_map()
        );
    }
}
