//! Build a distributed k-d tree across MPI ranks and check its invariants.

use bempp_kdtree::{
    process_group::{MpiGroup, ProcessGroup, ReduceOp},
    tools::generate_random_points,
    KdTreeConfig, ParallelKdTree,
};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

pub fn main() {
    // Initialise MPI
    let universe = mpi::initialize().unwrap();

    // Get the world communicator
    let world = universe.world();
    let comm = MpiGroup::new(&world);
    let rank = comm.rank();

    // Initialise a seeded Rng.
    let mut rng = ChaCha8Rng::seed_from_u64(rank as u64);

    // Create a different number of points on each rank.
    let npoints = 5000 + 1000 * rank;
    let points = generate_random_points(npoints, &mut rng);

    let mut kdtree = ParallelKdTree::new(&comm, KdTreeConfig::default());
    kdtree.build_locator(&points).unwrap();

    let tree = kdtree.tree().unwrap();
    let total = comm.world(1).all_reduce_value(npoints, ReduceOp::Sum);

    // Count conservation and coverage.
    let mut count = 0;
    let mut volume = 0.0;
    for region in 0..kdtree.number_of_regions() {
        count += kdtree.region_point_count(region).unwrap();
        volume += kdtree.region_bounds(region).unwrap().volume();
    }
    let root_volume = tree.node(tree.root()).bounds.volume();

    assert_eq!(count, total);
    assert!((volume - root_volume).abs() < 1e-10 * root_volume);

    // Every redistributed point lies in a region.
    for point in kdtree.points() {
        let region = kdtree
            .region_containing_point(point.map(|x| x as f64))
            .unwrap();
        assert!(region.is_some());
    }

    // The tree is identical on all ranks.
    let flat = tree.to_flat();
    let mut root_flat = flat.clone();
    comm.world(2).broadcast(&mut root_flat, 0);
    assert_eq!(flat, root_flat);

    if rank == 0 {
        println!(
            "Built a k-d tree with {} regions and depth {} over {} points.",
            kdtree.number_of_regions(),
            kdtree.actual_level(),
            total
        );
    }
}
