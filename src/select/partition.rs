//! Local three-way partitions of a slice of points.

use std::cmp::Ordering;

use crate::geometry::Point;

/// Rearrange `points` into values less than, equal to and greater than the
/// coordinate of `points[k]` along `dim`.
///
/// Returns the offsets of the first equal and the first greater value. Since the
/// pivot is taken from the slice the equal interval is never empty.
pub fn partition_about_my_value(points: &mut [Point], k: usize, dim: usize) -> (usize, usize) {
    let pivot = points[k][dim];
    partition_about_other_value(points, pivot, dim)
}

/// Rearrange `points` into values less than, equal to and greater than `pivot`
/// along `dim`.
///
/// Returns the offsets of the first equal and the first greater value. If no value
/// equals `pivot` both offsets coincide, if no value is greater the second offset
/// is `points.len()`. Values that do not compare with the pivot (NaN) count as
/// equal.
pub fn partition_about_other_value(points: &mut [Point], pivot: f32, dim: usize) -> (usize, usize) {
    // Invariant: [0, lt) < pivot, [lt, i) == pivot, [gt, len) > pivot.
    let mut lt = 0;
    let mut i = 0;
    let mut gt = points.len();

    while i < gt {
        match points[i][dim].partial_cmp(&pivot) {
            Some(Ordering::Less) => {
                points.swap(lt, i);
                lt += 1;
                i += 1;
            }
            Some(Ordering::Greater) => {
                gt -= 1;
                points.swap(i, gt);
            }
            _ => i += 1,
        }
    }

    (lt, gt)
}

#[cfg(test)]
mod test {
    use rand::Rng;

    use super::{partition_about_my_value, partition_about_other_value};
    use crate::{geometry::Point, tools::seeded_rng};

    fn check_partition(points: &[Point], pivot: f32, dim: usize, (first_equal, first_greater): (usize, usize)) {
        assert!(first_equal <= first_greater && first_greater <= points.len());
        assert!(points[..first_equal].iter().all(|p| p[dim] < pivot));
        assert!(points[first_equal..first_greater].iter().all(|p| p[dim] == pivot));
        assert!(points[first_greater..].iter().all(|p| p[dim] > pivot));
    }

    #[test]
    fn test_partition_with_duplicates() {
        let mut rng = seeded_rng(0);
        let mut points = (0..200)
            .map(|_| [rng.gen_range(0..5) as f32, rng.gen(), rng.gen_range(0..3) as f32])
            .collect::<Vec<Point>>();

        for k in [0, 17, 199] {
            let pivot = points[k][2];
            let result = partition_about_my_value(&mut points, k, 2);
            check_partition(&points, pivot, 2, result);
            assert!(result.1 > result.0);
        }
    }

    #[test]
    fn test_partition_about_absent_value() {
        let mut points = vec![[3.0, 0.0, 0.0], [1.0, 0.0, 0.0], [4.0, 0.0, 0.0], [0.5, 0.0, 0.0]];

        let result = partition_about_other_value(&mut points, 2.0, 0);
        assert_eq!(result, (2, 2));
        check_partition(&points, 2.0, 0, result);

        let result = partition_about_other_value(&mut points, 10.0, 0);
        assert_eq!(result, (4, 4));

        let result = partition_about_other_value(&mut [], 1.0, 0);
        assert_eq!(result, (0, 0));
    }
}
