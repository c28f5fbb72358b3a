use num_traits::{Float, FromPrimitive};

pub fn _isclose<T>(x: T, y: T, rtol: T, atol: T) -> bool
where
    T: Float,
{
    (x - y).abs() <= (atol + rtol * y.abs())
}

pub fn isclose<T>(x: T, y: T) -> bool
where
    T: Float + FromPrimitive,
{
    let rtol = T::from_f64(1e-5).unwrap_or_else(T::epsilon);
    let atol = T::from_f64(1e-8).unwrap_or_else(T::epsilon);
    _isclose(x, y, rtol, atol)
}

pub fn aboutzero<T>(x: T) -> bool
where
    T: Float + FromPrimitive,
{
    isclose(x, T::zero())
}

/// The half-height crossing points around a peak apex
#[derive(Default, Debug, Clone, PartialEq)]
pub struct WidthFit {
    pub right_width: f64,
    pub left_width: f64,
    pub full_width_at_half_max: f64,
}

/// Walk from `data_index` in the direction of `step` until the signal drops
/// below `level`, returning the interpolated coordinate of the crossing.
fn half_height_crossing(
    x_array: &[f64],
    y_array: &[f64],
    data_index: usize,
    level: f64,
    rising: bool,
) -> f64 {
    let n = x_array.len();
    let mut index = data_index;
    loop {
        let next = if rising {
            match index.checked_sub(1) {
                Some(i) => i,
                None => return x_array[0],
            }
        } else if index + 1 < n {
            index + 1
        } else {
            return x_array[n - 1];
        };
        let y1 = y_array[next];
        if y1 < level {
            let y2 = y_array[index];
            let x1 = x_array[next];
            let x2 = x_array[index];
            if aboutzero(y2 - y1) {
                return x1;
            }
            return x1 - (x1 - x2) * ((level - y1) / (y2 - y1));
        }
        index = next;
    }
}

/// Measure the width of the peak with apex at `data_index` at half of its height.
///
/// Crossings are linearly interpolated between samples. A side that never drops
/// below half height is taken to end at the edge of the array.
pub fn full_width_at_half_max(x_array: &[f64], y_array: &[f64], data_index: usize) -> WidthFit {
    let mut fit = WidthFit::default();
    if data_index >= x_array.len() || data_index >= y_array.len() {
        return fit;
    }
    let peak = y_array[data_index];
    if aboutzero(peak) || peak < 0.0 {
        return fit;
    }
    let x = x_array[data_index];
    let half = peak / 2.0;

    let rising = half_height_crossing(x_array, y_array, data_index, half, true);
    let falling = half_height_crossing(x_array, y_array, data_index, half, false);
    fit.left_width = (x - rising).abs();
    fit.right_width = (falling - x).abs();
    fit.full_width_at_half_max = fit.left_width + fit.right_width;
    fit
}

/// Fit a parabola through the three points around `index` and return the
/// coordinate of its vertex.
pub fn quadratic_fit(x_array: &[f64], y_array: &[f64], index: usize) -> f64 {
    let n = x_array.len() - 1;
    if index < 1 {
        x_array[0]
    } else if index >= n {
        x_array[n]
    } else {
        let x1 = x_array[index - 1];
        let x2 = x_array[index];
        let x3 = x_array[index + 1];
        let y1 = y_array[index - 1];
        let y2 = y_array[index];
        let y3 = y_array[index + 1];
        let d = (y2 - y1) * (x3 - x2) - (y3 - y2) * (x2 - x1);
        if aboutzero(d) {
            x2
        } else {
            ((x1 + x2) - ((y2 - y1) * (x3 - x2) * (x1 - x3)) / d) / 2.0
        }
    }
}

/// The vertical distance between a peak and its highest surrounding valley.
///
/// Each side is searched until the signal rises above the peak or the array
/// ends, and the valley is the minimum passed on the way. Returns the prominence
/// together with the left and right base indices.
pub fn peak_prominence(y_array: &[f64], index: usize) -> (f64, usize, usize) {
    let peak = y_array[index];

    let mut left_base = index;
    let mut left_min = peak;
    for i in (0..index).rev() {
        if y_array[i] > peak {
            break;
        }
        if y_array[i] < left_min {
            left_min = y_array[i];
            left_base = i;
        }
    }

    let mut right_base = index;
    let mut right_min = peak;
    for (i, y) in y_array.iter().enumerate().skip(index + 1) {
        if *y > peak {
            break;
        }
        if *y < right_min {
            right_min = *y;
            right_base = i;
        }
    }

    (peak - left_min.max(right_min), left_base, right_base)
}

/// The width of a peak in samples, measured at `relative_height` of its
/// prominence below the apex and interpolated between samples.
pub fn peak_width(y_array: &[f64], index: usize, relative_height: f64) -> f64 {
    let (prominence, left_base, right_base) = peak_prominence(y_array, index);
    let height = y_array[index] - prominence * relative_height;

    let mut i = index;
    while left_base < i && height < y_array[i] {
        i -= 1;
    }
    let mut left = i as f64;
    if y_array[i] < height {
        left += (height - y_array[i]) / (y_array[i + 1] - y_array[i]);
    }

    let mut i = index;
    while i < right_base && height < y_array[i] {
        i += 1;
    }
    let mut right = i as f64;
    if y_array[i] < height {
        right -= (height - y_array[i]) / (y_array[i - 1] - y_array[i]);
    }

    right - left
}

#[cfg(test)]
mod test {
    use super::*;

    fn triangle() -> (Vec<f64>, Vec<f64>) {
        let x: Vec<f64> = (0..11).map(|i| i as f64 * 0.5).collect();
        let y = vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 4.0, 3.0, 2.0, 1.0, 0.0];
        (x, y)
    }

    #[test]
    fn test_isclose() {
        assert!(isclose(1.0, 1.0 + 1e-9));
        assert!(!isclose(1.0, 1.001));
        assert!(aboutzero(1e-10f32));
    }

    #[test]
    fn test_quadratic_fit() {
        let x = [1.0, 2.0, 3.0];
        let y: Vec<f64> = x.iter().map(|x: &f64| -(x - 2.25).powi(2) + 4.0).collect();
        assert!((quadratic_fit(&x, &y, 1) - 2.25).abs() < 1e-12);
        assert_eq!(quadratic_fit(&x, &y, 0), 1.0);
        assert_eq!(quadratic_fit(&x, &y, 2), 3.0);
    }

    #[test]
    fn test_full_width_at_half_max() {
        let (x, y) = triangle();
        let fit = full_width_at_half_max(&x, &y, 5);
        assert!((fit.left_width - 1.25).abs() < 1e-12, "{fit:?}");
        assert!((fit.right_width - 1.25).abs() < 1e-12, "{fit:?}");
        assert!((fit.full_width_at_half_max - 2.5).abs() < 1e-12, "{fit:?}");
    }

    #[test]
    fn test_prominence_and_width() {
        let y = vec![1.0, 2.0, 6.0, 2.0, 3.0, 9.0, 3.0, 0.0];
        let (prominence, left, right) = peak_prominence(&y, 2);
        assert_eq!(prominence, 4.0);
        assert_eq!((left, right), (0, 3));
        let (prominence, _, _) = peak_prominence(&y, 5);
        assert_eq!(prominence, 8.0);

        let (_, y) = triangle();
        assert!((peak_width(&y, 5, 0.5) - 5.0).abs() < 1e-12);
    }
}
