//! Which processes hold input data in which regions.

use std::time::Instant;

use log::debug;

use crate::{
    constants::PROCESS_DATA_TAG,
    error::{KdTreeError, Result},
    geometry::Point,
    kdtree::KdTree,
    process_group::ProcessGroup,
    tools::all_check_for_failure,
};

/// Per region and per process point counts of the input data.
///
/// The counts refer to the points the ranks passed in, before they were
/// redistributed by the build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessDataTables {
    nprocesses: usize,
    nregions: usize,
    /// `nprocesses x nregions`, true if the process has points in the region.
    data_location_map: Vec<bool>,
    num_processes_in_region: Vec<usize>,
    /// Ascending process ids with data in each region.
    process_list: Vec<Vec<usize>>,
    num_regions_in_process: Vec<usize>,
    /// Ascending region ids in which each process has data.
    parallel_region_list: Vec<Vec<usize>>,
    /// Point counts aligned with `process_list`.
    cell_count_list: Vec<Vec<usize>>,
}

impl ProcessDataTables {
    /// Count the local `points` in the regions of `tree` and share the counts with all
    /// ranks.
    ///
    /// This is a collective operation. It fails on all ranks if any point lies outside
    /// of the tree.
    pub fn create<G: ProcessGroup>(comm: &G, tree: &KdTree, points: &[Point]) -> Result<Self> {
        let now = Instant::now();
        let world = comm.world(PROCESS_DATA_TAG);
        let nregions = tree.number_of_regions();

        let mut counts = vec![0usize; nregions];
        let mut fail = false;
        for point in points {
            match tree.region_containing_point(point.map(|x| x as f64)) {
                Some(region) => counts[region] += 1,
                None => fail = true,
            }
        }

        if all_check_for_failure(&world, fail, "process data tables") {
            return Err(KdTreeError::PointOutsideTree { local: fail });
        }

        let counts = world.all_gather(&counts);
        let tables = Self::from_cell_counts(comm.size(), nregions, &counts);

        debug!(
            "[{}] process data tables: {} ms",
            comm.rank(),
            now.elapsed().as_millis()
        );

        Ok(tables)
    }

    /// Build the tables from the point counts of all processes.
    ///
    /// `counts[p * nregions + r]` is the number of points process `p` has in region `r`.
    pub fn from_cell_counts(nprocesses: usize, nregions: usize, counts: &[usize]) -> Self {
        assert_eq!(counts.len(), nprocesses * nregions);

        let data_location_map = counts.iter().map(|&count| count > 0).collect::<Vec<_>>();

        let mut process_list = vec![Vec::new(); nregions];
        let mut cell_count_list = vec![Vec::new(); nregions];
        let mut parallel_region_list = vec![Vec::new(); nprocesses];

        for proc in 0..nprocesses {
            for region in 0..nregions {
                let count = counts[proc * nregions + region];
                if count > 0 {
                    process_list[region].push(proc);
                    cell_count_list[region].push(count);
                    parallel_region_list[proc].push(region);
                }
            }
        }

        Self {
            nprocesses,
            nregions,
            data_location_map,
            num_processes_in_region: process_list.iter().map(|list| list.len()).collect(),
            process_list,
            num_regions_in_process: parallel_region_list.iter().map(|list| list.len()).collect(),
            parallel_region_list,
            cell_count_list,
        }
    }

    fn check_process(&self, proc: usize) -> Result<()> {
        if proc < self.nprocesses {
            Ok(())
        } else {
            Err(KdTreeError::InvalidProcess(proc))
        }
    }

    fn check_region(&self, region: usize) -> Result<()> {
        if region < self.nregions {
            Ok(())
        } else {
            Err(KdTreeError::InvalidRegion(region))
        }
    }

    /// True if `proc` has input points in `region`.
    pub fn has_data(&self, proc: usize, region: usize) -> Result<bool> {
        self.check_process(proc)?;
        self.check_region(region)?;
        Ok(self.data_location_map[proc * self.nregions + region])
    }

    /// Number of processes with input points in `region`.
    pub fn total_processes_in_region(&self, region: usize) -> Result<usize> {
        self.check_region(region)?;
        Ok(self.num_processes_in_region[region])
    }

    /// The processes with input points in `region`, ascending.
    pub fn process_list_for_region(&self, region: usize) -> Result<&[usize]> {
        self.check_region(region)?;
        Ok(&self.process_list[region])
    }

    /// The point counts of the processes in [ProcessDataTables::process_list_for_region].
    pub fn processes_cell_count_for_region(&self, region: usize) -> Result<&[usize]> {
        self.check_region(region)?;
        Ok(&self.cell_count_list[region])
    }

    /// Number of input points `proc` has in `region`.
    pub fn process_cell_count_for_region(&self, proc: usize, region: usize) -> Result<usize> {
        self.check_process(proc)?;
        self.check_region(region)?;

        let count = self.process_list[region]
            .binary_search(&proc)
            .map_or(0, |position| self.cell_count_list[region][position]);

        Ok(count)
    }

    /// Number of regions in which `proc` has input points.
    pub fn total_regions_for_process(&self, proc: usize) -> Result<usize> {
        self.check_process(proc)?;
        Ok(self.num_regions_in_process[proc])
    }

    /// The regions in which `proc` has input points, ascending.
    pub fn region_list_for_process(&self, proc: usize) -> Result<&[usize]> {
        self.check_process(proc)?;
        Ok(&self.parallel_region_list[proc])
    }

    /// The point counts of `proc` in the regions of
    /// [ProcessDataTables::region_list_for_process].
    pub fn regions_cell_count_for_process(&self, proc: usize) -> Result<Vec<usize>> {
        self.region_list_for_process(proc)?
            .iter()
            .map(|&region| self.process_cell_count_for_region(proc, region))
            .collect()
    }
}
