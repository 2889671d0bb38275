//! Test the distributed median selection across MPI ranks.

use bempp_kdtree::{
    double_buffer::DoubleBuffer,
    geometry::Point,
    index_table::GlobalIndexTable,
    process_group::{MpiGroup, ProcessGroup},
    select::DistributedSelector,
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

    // Points with many duplicate x values.
    let npoints = 1000;
    let points: Vec<Point> = (0..npoints)
        .map(|_| [rng.gen_range(0..20) as f32, rng.gen(), rng.gen()])
        .collect();

    let table = GlobalIndexTable::build(&comm, points.len(), 1);
    let mut buffer = DoubleBuffer::new(points).unwrap();

    let l = 0;
    let r = table.total() - 1;

    let k = {
        let group = comm.world(1);
        let mut selector = DistributedSelector::new(&group, &table, &mut buffer);
        selector.select(0, l, r)
    };

    // Gather all x values on root and check the partition.
    let values: Vec<f32> = buffer.active().iter().map(|point| point[0]).collect();
    let kval = {
        let owner = table.who_has(k).unwrap();
        let mut kval = [0.0f32];
        if owner == rank {
            kval[0] = values[k - table.start(rank)];
        }
        comm.world(2).broadcast(&mut kval, owner);
        kval[0]
    };

    if let Some(all_values) = comm.world(3).gather(&values, 0) {
        assert!(all_values[..k].iter().all(|&value| value < kval));
        assert!(all_values[k..].iter().all(|&value| value >= kval));

        println!(
            "Selected index {} with value {} out of {} points.",
            k,
            kval,
            all_values.len()
        );
    }
}
