//! Test the global index table across MPI ranks.

use bempp_kdtree::{
    index_table::GlobalIndexTable,
    process_group::{MpiGroup, ProcessGroup},
};

pub fn main() {
    // Initialise MPI
    let universe = mpi::initialize().unwrap();

    // Get the world communicator
    let world = universe.world();
    let comm = MpiGroup::new(&world);
    let rank = comm.rank();

    // Every third rank has no points.
    let npoints = if rank % 3 == 1 { 0 } else { 10 + rank };

    let table = GlobalIndexTable::build(&comm, npoints, 1);

    assert_eq!(table.num_cells(rank), npoints);
    assert_eq!(table.size(), comm.size());

    for pos in table.range(rank) {
        assert_eq!(table.who_has(pos), Some(rank));
    }
    assert_eq!(table.who_has(table.total()), None);

    // All ranks hold the same table.
    let counts = comm.world(2).all_gather(&[table.total()]);
    assert!(counts.iter().all(|&total| total == table.total()));

    if rank == 0 {
        println!("Global index table with {} points is consistent.", table.total());
    }
}
