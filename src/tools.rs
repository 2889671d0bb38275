//! Utility routines.

use log::warn;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::{
    error::{KdTreeError, Result},
    geometry::Point,
    process_group::{ProcessGroup, ReduceOp, SubGroup},
};

/// Vote on a failure across all ranks of `group`.
///
/// Returns true on every rank if `fail` is true on any rank. The failure is logged
/// with the `stage` it happened in.
pub fn all_check_for_failure<G: ProcessGroup>(group: &SubGroup<'_, G>, fail: bool, stage: &str) -> bool {
    let vote = group.all_reduce_value(fail as usize, ReduceOp::Sum);

    if vote == 0 {
        return false;
    }

    let rank = group.comm().rank();
    if fail {
        warn!("[{}] failure on this rank ({})", rank, stage);
    } else {
        warn!("[{}] failure on {} remote rank(s) ({})", rank, vote, stage);
    }

    true
}

/// Turn the local `result` into a collective one.
///
/// If any rank of `group` failed, every rank returns an error. Ranks that succeeded
/// locally report a remote allocation failure in `stage`.
pub fn all_check_result<G: ProcessGroup, T>(
    group: &SubGroup<'_, G>,
    result: Result<T>,
    stage: &'static str,
) -> Result<T> {
    if !all_check_for_failure(group, result.is_err(), stage) {
        return result;
    }

    match result {
        Err(err) => Err(err),
        Ok(_) => Err(KdTreeError::Allocation {
            local: false,
            stage,
        }),
    }
}

/// Largest `k` with `2^k <= n`.
pub fn floor_log2(n: usize) -> usize {
    assert!(n > 0);
    (usize::BITS - 1 - n.leading_zeros()) as usize
}

/// Compute displacements from a vector of counts.
///
/// For counts `[3, 4, 5]` the displacements are `[0, 3, 7]`.
pub fn displacements(counts: &[usize]) -> Vec<usize> {
    counts
        .iter()
        .scan(0, |acc, &x| {
            let tmp = *acc;
            *acc += x;
            Some(tmp)
        })
        .collect()
}

/// Generate random points in the unit cube for testing.
pub fn generate_random_points<R: Rng>(npoints: usize, rng: &mut R) -> Vec<Point> {
    (0..npoints)
        .map(|_| [rng.gen(), rng.gen(), rng.gen()])
        .collect()
}

/// Get a seeded rng
pub fn seeded_rng(seed: usize) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed as u64)
}

#[cfg(test)]
mod test {
    use super::{all_check_for_failure, all_check_result, displacements, floor_log2};
    use crate::{
        error::KdTreeError,
        process_group::{run_on_ranks, ProcessGroup},
    };

    #[test]
    fn test_floor_log2() {
        assert_eq!(floor_log2(1), 0);
        assert_eq!(floor_log2(3), 1);
        assert_eq!(floor_log2(4), 2);
        assert_eq!(floor_log2(7), 2);
    }

    #[test]
    fn test_displacements() {
        assert_eq!(displacements(&[3, 4, 5]), vec![0, 3, 7]);
    }

    #[test]
    fn test_failure_vote_reaches_all_ranks() {
        let result = run_on_ranks(4, |comm| {
            let world = comm.world(1);
            (
                all_check_for_failure(&world, comm.rank() == 2, "test"),
                all_check_for_failure(&world, false, "test"),
            )
        });

        assert!(result.iter().all(|&votes| votes == (true, false)));
    }

    #[test]
    fn test_failed_result_reaches_all_ranks() {
        let result = run_on_ranks(3, |comm| {
            let world = comm.world(1);
            let local = if comm.rank() == 0 {
                Err(KdTreeError::Allocation {
                    local: true,
                    stage: "test",
                })
            } else {
                Ok(comm.rank())
            };
            all_check_result(&world, local, "test")
        });

        assert_eq!(
            result[0],
            Err(KdTreeError::Allocation {
                local: true,
                stage: "test"
            })
        );
        for other in &result[1..] {
            assert_eq!(
                *other,
                Err(KdTreeError::Allocation {
                    local: false,
                    stage: "test"
                })
            );
        }
    }
}
