use statrs::distribution::{ContinuousCDF, Normal};
use std::cmp::Ordering;

fn by_pvalue_desc(a: f64, b: f64) -> Ordering {
    // NaNs to the front so they are treated as the least significant
    match a.partial_cmp(&b) {
        Some(o) => o.reverse(),
        None => match (a.is_nan(), b.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            _ => Ordering::Greater,
        },
    }
}

/// Benjamini-Hochberg adjustment. Takes `(index, p)` pairs and returns `(index, q)` pairs in
/// descending order of p.
pub fn adjusted_pvalue_bh(pvalue: &[(usize, f64)]) -> Vec<(usize, f64)> {
    let mut arr = pvalue.to_vec();
    arr.sort_by(|&(_, a), &(_, b)| by_pvalue_desc(a, b));

    // q = min(1, cummin(n / rank * p)) over p in descending order
    let len = arr.len() as f64;
    let mut min = f64::MAX;
    for (idx, (_, val)) in arr.iter_mut().enumerate() {
        *val *= len / (len - idx as f64);
        if *val < min {
            min = *val
        }
        *val = min.min(1.0);
    }
    arr
}

/// BH-adjusted values in the original order
pub fn bh_in_order(pvalues: &[f64]) -> Vec<f64> {
    let indexed: Vec<(usize, f64)> = pvalues.iter().copied().enumerate().collect();
    let mut out = vec![f64::NAN; pvalues.len()];
    for (i, q) in adjusted_pvalue_bh(&indexed) {
        out[i] = q;
    }
    out
}

/// Holm step-down adjustment, returned in the original order
pub fn holm(pvalues: &[f64]) -> Vec<f64> {
    let m = pvalues.len();
    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&a, &b| by_pvalue_desc(pvalues[b], pvalues[a]));
    let mut out = vec![f64::NAN; m];
    let mut running: f64 = 0.0;
    for (rank, &i) in order.iter().enumerate() {
        let adj = ((m - rank) as f64 * pvalues[i]).min(1.0);
        running = running.max(adj);
        out[i] = running;
    }
    out
}

/// Combine one-sided p-values with the weighted Stouffer method. Each p is turned into
/// `z = -Phi^-1(p)`, and the combined p is `Phi(-sum(w z) / sqrt(sum(w^2)))`.
/// Returns NaN if there is nothing to combine.
pub fn stouffer(pvalues: &[f64], weights: &[f64]) -> f64 {
    assert_eq!(pvalues.len(), weights.len());
    if pvalues.is_empty() {
        return f64::NAN;
    }
    if pvalues.len() == 1 {
        return pvalues[0];
    }
    let norm = standard_normal();
    let mut num = 0.0;
    let mut den = 0.0;
    for (&p, &w) in pvalues.iter().zip(weights) {
        let p = p.clamp(1e-300, 1.0 - 1e-15);
        num += w * -norm.inverse_cdf(p);
        den += w * w;
    }
    norm.cdf(-num / den.sqrt())
}

pub(crate) fn standard_normal() -> Normal {
    match Normal::new(0.0, 1.0) {
        Ok(n) => n,
        Err(_) => unreachable!("unit normal parameters are valid"),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_adjusted_pvalue_bh() {
        let data = [
            0.34, 0.594, 0.212, 0.384, 0.074, 0.94, 0.275, 0.696, 0.269, 0.341, 0.06, 0.008, 0.569, 0.986, 0.042,
            0.251, 0.942, 0.222, 0.762, 0.001, 0.975, 0.216, 0.205, 0.041, 0.039,
        ];
        let expected = [
            0.5328125,
            0.781578947368421,
            0.49107142857142866,
            0.5647058823529413,
            0.2642857142857143,
            0.986,
            0.49107142857142866,
            0.8699999999999999,
            0.49107142857142866,
            0.5328125,
            0.25,
            0.1,
            0.781578947368421,
            0.986,
            0.21000000000000002,
            0.49107142857142866,
            0.986,
            0.49107142857142866,
            0.9071428571428571,
            0.025,
            0.986,
            0.49107142857142866,
            0.49107142857142866,
            0.21000000000000002,
            0.21000000000000002,
        ];
        let q = bh_in_order(&data);
        for (e, r) in expected.iter().zip(q.iter()) {
            assert_abs_diff_eq!(*e, *r, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_holm() {
        let adj = holm(&[0.01, 0.04, 0.03]);
        assert_abs_diff_eq!(adj[0], 0.03, epsilon = 1e-12);
        assert_abs_diff_eq!(adj[2], 0.06, epsilon = 1e-12);
        assert_abs_diff_eq!(adj[1], 0.06, epsilon = 1e-12);
    }

    #[test]
    fn test_stouffer() {
        // equal weights, identical p-values strengthen each other
        let p = stouffer(&[0.05, 0.05], &[1.0, 1.0]);
        assert!(p < 0.05);
        // opposite evidence cancels out
        let p = stouffer(&[0.1, 0.9], &[1.0, 1.0]);
        assert_abs_diff_eq!(p, 0.5, epsilon = 1e-9);
        assert_eq!(stouffer(&[0.2], &[3.0]), 0.2);
        assert!(stouffer(&[], &[]).is_nan());
    }
}
