use std::ops::Range;

use num_traits::Float;

/// Find the insertion point for `q` in the sorted `array`
pub fn binsearch<T: Float>(array: &[T], q: T) -> usize {
    array.partition_point(|x| *x < q)
}

/// Find the index of the value in the sorted `array` closest to `target_val`
pub fn nearest<T: Float>(array: &[T], target_val: T) -> Option<usize> {
    let n = array.len();
    if n == 0 {
        return None;
    }
    let i = binsearch(array, target_val);
    if i == 0 {
        Some(0)
    } else if i >= n {
        Some(n - 1)
    } else if (array[i] - target_val).abs() < (target_val - array[i - 1]).abs() {
        Some(i)
    } else {
        Some(i - 1)
    }
}

/// Find the index range of the sorted `array` whose values fall in the closed
/// interval `[lo, hi]`.
pub fn find_between<T: Float>(array: &[T], lo: T, hi: T) -> Range<usize> {
    let start = binsearch(array, lo);
    let end = array.partition_point(|x| *x <= hi);
    start..end.max(start)
}
