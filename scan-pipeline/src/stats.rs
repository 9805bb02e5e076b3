//! Statistics functions

use noisy_float::types::n64;
use serde::Serialize;

/// Scale that makes the MAD a consistent estimator of the standard deviation for normal data
pub const MAD_SCALE: f64 = 1.4826;

/// Return the median. Sorts its argument in place.
pub fn median_mut(xs: &mut [f64]) -> Option<f64> {
    if xs.is_empty() {
        return None;
    }
    xs.sort_unstable_by(|a, b| a.total_cmp(b));
    let n = xs.len();
    Some(if n % 2 == 0 {
        (xs[n / 2] + xs[n / 2 - 1]) / 2.0
    } else {
        xs[n / 2]
    })
}

/// Median of a slice, `None` when empty
pub fn median(xs: &[f64]) -> Option<f64> {
    median_mut(&mut xs.to_vec())
}

/// Median absolute deviation around `center`, scaled by [`MAD_SCALE`]
pub fn mad(xs: &[f64], center: f64) -> Option<f64> {
    let mut dev: Vec<f64> = xs.iter().map(|&x| (x - center).abs()).collect();
    median_mut(&mut dev).map(|m| m * MAD_SCALE)
}

/// Quantile with linear interpolation between order statistics (R's type 7)
pub fn quantile(xs: &[f64], q: f64) -> Option<f64> {
    if xs.is_empty() {
        return None;
    }
    let mut v = xs.to_vec();
    v.sort_unstable_by(|a, b| a.total_cmp(b));
    let h = (v.len() - 1) as f64 * q.clamp(0.0, 1.0);
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    Some(v[lo] + (h - lo as f64) * (v[hi] - v[lo]))
}

/// Min, quartiles, median and max
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct FiveNumber {
    pub min: f64,
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
    pub max: f64,
}

impl FiveNumber {
    pub fn of(xs: &[f64]) -> Option<FiveNumber> {
        Some(FiveNumber {
            min: quantile(xs, 0.0)?,
            q1: quantile(xs, 0.25)?,
            median: quantile(xs, 0.5)?,
            q3: quantile(xs, 0.75)?,
            max: quantile(xs, 1.0)?,
        })
    }
}

/// One-based ranks, ties get the average of the ranks they span
pub fn rank_average(xs: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..xs.len()).collect();
    order.sort_by_key(|&i| (n64(xs[i]), i));
    let mut ranks = vec![0.0; xs.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && xs[order[end]] == xs[order[start]] {
            end += 1;
        }
        let avg = (start + end + 1) as f64 / 2.0;
        for &i in &order[start..end] {
            ranks[i] = avg;
        }
        start = end;
    }
    ranks
}

/// Pearson correlation. Zero if either side is constant.
pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let ma = a[..n].iter().sum::<f64>() / n as f64;
    let mb = b[..n].iter().sum::<f64>() / n as f64;
    let (mut sab, mut saa, mut sbb) = (0.0, 0.0, 0.0);
    for (x, y) in a[..n].iter().zip(&b[..n]) {
        let (dx, dy) = (x - ma, y - mb);
        sab += dx * dy;
        saa += dx * dx;
        sbb += dy * dy;
    }
    if saa <= 0.0 || sbb <= 0.0 {
        0.0
    } else {
        sab / (saa * sbb).sqrt()
    }
}

/// Spearman rank correlation
pub fn spearman(a: &[f64], b: &[f64]) -> f64 {
    pearson(&rank_average(a), &rank_average(b))
}

#[cfg(test)]
mod test_stats {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_median_mut() {
        assert_eq!(median_mut(&mut []), None);
        assert_eq!(median_mut(&mut [1.0]), Some(1.0));
        assert_eq!(median_mut(&mut [1.0, 10.0]), Some(5.5));
        assert_eq!(median_mut(&mut [100.0, 1.0, 10.0]), Some(10.0));
        assert_eq!(median_mut(&mut [1000.0, 1.0, 100.0, 10.0]), Some(55.0));
    }

    #[test]
    fn test_mad_and_quantile() {
        let x = [1.0, 2.0, 3.0, 4.0, 100.0];
        assert_abs_diff_eq!(mad(&x, 3.0).unwrap(), MAD_SCALE, epsilon = 1e-12);
        assert_eq!(quantile(&x, 0.5), Some(3.0));
        assert_abs_diff_eq!(quantile(&[1.0, 2.0, 3.0, 4.0], 0.8).unwrap(), 3.4, epsilon = 1e-12);
        let s = FiveNumber::of(&[4.0, 1.0, 3.0, 2.0, 5.0]).unwrap();
        assert_eq!((s.min, s.q1, s.median, s.q3, s.max), (1.0, 2.0, 3.0, 4.0, 5.0));
    }

    #[test]
    fn test_spearman_ties() {
        assert_eq!(rank_average(&[10.0, 20.0, 10.0, 5.0]), vec![2.5, 4.0, 2.5, 1.0]);
        assert_abs_diff_eq!(spearman(&[1.0, 2.0, 3.0, 4.0], &[1.0, 4.0, 9.0, 16.0]), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(spearman(&[1.0, 2.0, 3.0], &[3.0, 2.0, 1.0]), -1.0, epsilon = 1e-12);
        assert_eq!(pearson(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]), 0.0);
    }
}
