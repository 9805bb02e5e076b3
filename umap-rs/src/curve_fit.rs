//! Levenberg-Marquardt fit of the low-dimensional membership curve `1 / (1 + a x^(2b))`.

use crate::Q;
use log::debug;

fn curve(a: Q, b: Q, x: Q) -> Q {
    1.0 / (1.0 + a * x.powf(2.0 * b))
}

/// Sum of squared residuals
pub fn chi2(a: Q, b: Q, x: &[Q], y: &[Q]) -> Q {
    x.iter().zip(y).map(|(&x, &y)| (y - curve(a, b, x)).powi(2)).sum()
}

/// Fit `a` and `b` so that `1 / (1 + a x^(2b))` approximates the target membership: 1 below
/// `min_dist`, `exp(-(x - min_dist) / spread)` above it, sampled on `[0, 3 * spread)`.
pub fn find_ab_params(spread: Q, min_dist: Q) -> (Q, Q) {
    let x: Vec<Q> = (0..300).map(|i| i as Q * spread / 100.0).collect();
    let y: Vec<Q> = x
        .iter()
        .map(|&x| if x < min_dist { 1.0 } else { (-(x - min_dist) / spread).exp() })
        .collect();

    let (mut a, mut b) = (1.0, 1.0);
    let mut lambda = 1e-3;
    let mut current = chi2(a, b, &x, &y);

    for iter in 0..200 {
        // J^T J and J^T r for the two parameters
        let (mut jaa, mut jab, mut jbb, mut ga, mut gb) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for (&xi, &yi) in x.iter().zip(&y) {
            if xi <= 0.0 {
                continue;
            }
            let p = xi.powf(2.0 * b);
            let f = 1.0 / (1.0 + a * p);
            let df_da = -p * f * f;
            let df_db = -2.0 * a * p * xi.ln() * f * f;
            let r = yi - f;
            jaa += df_da * df_da;
            jab += df_da * df_db;
            jbb += df_db * df_db;
            ga += df_da * r;
            gb += df_db * r;
        }

        let maa = jaa * (1.0 + lambda);
        let mbb = jbb * (1.0 + lambda);
        let det = maa * mbb - jab * jab;
        if det.abs() < 1e-300 {
            break;
        }
        let da = (mbb * ga - jab * gb) / det;
        let db = (maa * gb - jab * ga) / det;

        let (na, nb) = (a + da, b + db);
        let next = if na > 0.0 && nb > 0.0 { chi2(na, nb, &x, &y) } else { Q::INFINITY };
        if next < current {
            let improvement = current - next;
            a = na;
            b = nb;
            current = next;
            lambda /= 9.0;
            if improvement < 1e-12 * current.max(1e-12) {
                debug!("find_ab_params converged after {} iterations", iter + 1);
                break;
            }
        } else {
            lambda *= 11.0;
            if lambda > 1e12 {
                break;
            }
        }
    }
    (a, b)
}
