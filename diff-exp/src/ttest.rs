use crate::dist::stouffer;
use scan_types::ExprMatrix;
use statrs::distribution::{ContinuousCDF, StudentsT};

/// Per-gene mean and variance of one group of cells
#[derive(Debug, Clone)]
pub struct GroupStats {
    /// number of cells
    pub n: usize,
    /// per-gene mean
    pub mean: Vec<f64>,
    /// per-gene sample variance
    pub var: Vec<f64>,
}

impl GroupStats {
    /// Summarise the cells at `cells`
    pub fn compute(expr: &ExprMatrix, cells: &[usize]) -> GroupStats {
        let (mean, var) = expr.row_mean_var(cells);
        GroupStats {
            n: cells.len(),
            mean,
            var,
        }
    }

    /// A group needs two cells for a variance estimate
    pub fn testable(&self) -> bool {
        self.n >= 2
    }
}

/// Outcome of comparing group A against group B for one gene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairOutcome {
    /// mean(A) - mean(B) of log-expression
    pub logfc: f64,
    /// one-sided p-value for A being lower than B by more than the threshold
    pub left: f64,
    /// one-sided p-value for A being higher than B by more than the threshold
    pub right: f64,
}

impl PairOutcome {
    /// No evidence either way
    pub const NULL: PairOutcome = PairOutcome {
        logfc: 0.0,
        left: 1.0,
        right: 1.0,
    };

    /// The same comparison seen from group B
    pub fn flipped(self) -> PairOutcome {
        PairOutcome {
            logfc: -self.logfc,
            left: self.right,
            right: self.left,
        }
    }
}

fn t_cdf(t: f64, df: f64) -> f64 {
    if t.is_nan() {
        return 1.0;
    }
    if t.is_infinite() {
        return if t > 0.0 { 1.0 } else { 0.0 };
    }
    match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) => dist.cdf(t),
        Err(_) => 1.0,
    }
}

/// Welch t-test for one gene, with the null hypothesis shifted by `threshold` on either side.
pub fn welch(a: &GroupStats, b: &GroupStats, gene: usize, threshold: f64) -> PairOutcome {
    let diff = a.mean[gene] - b.mean[gene];
    let sa = a.var[gene] / a.n as f64;
    let sb = b.var[gene] / b.n as f64;
    let se2 = sa + sb;
    let se = se2.sqrt();
    let df = if se2 > 0.0 {
        se2 * se2 / (sa * sa / (a.n - 1) as f64 + sb * sb / (b.n - 1) as f64)
    } else {
        f64::INFINITY
    };

    let (left, right) = if se > 0.0 {
        let left = t_cdf((diff + threshold) / se, df);
        let right = t_cdf(-(diff - threshold) / se, df);
        (left, right)
    } else {
        // no variance: the sign of the shifted difference decides
        let left = if diff + threshold < 0.0 { 0.0 } else { 1.0 };
        let right = if diff - threshold > 0.0 { 0.0 } else { 1.0 };
        (left, right)
    };
    PairOutcome { logfc: diff, left, right }
}

/// Compare A and B for one gene within each block and combine the per-block results. Blocks in
/// which either group is not testable are skipped; weights are `1 / (1/nA + 1/nB)`.
pub fn blocked_welch(a: &[GroupStats], b: &[GroupStats], gene: usize, threshold: f64) -> PairOutcome {
    let mut outcomes = Vec::with_capacity(a.len());
    let mut weights = Vec::with_capacity(a.len());
    let mut lfc = Vec::with_capacity(a.len());
    let mut left = Vec::with_capacity(a.len());
    let mut right = Vec::with_capacity(a.len());
    for (sa, sb) in a.iter().zip(b) {
        if !sa.testable() || !sb.testable() {
            continue;
        }
        let o = welch(sa, sb, gene, threshold);
        outcomes.push(o);
        weights.push(1.0 / (1.0 / sa.n as f64 + 1.0 / sb.n as f64));
        lfc.push(o.logfc);
        left.push(o.left);
        right.push(o.right);
    }
    match outcomes.len() {
        0 => return PairOutcome::NULL,
        1 => return outcomes[0],
        _ => (),
    }
    let total: f64 = weights.iter().sum();
    let logfc = weights.iter().zip(&lfc).map(|(w, d)| w * d).sum::<f64>() / total;
    PairOutcome {
        logfc,
        left: stouffer(&left, &weights),
        right: stouffer(&right, &weights),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn stats(n: usize, mean: f64, var: f64) -> GroupStats {
        GroupStats {
            n,
            mean: vec![mean],
            var: vec![var],
        }
    }

    #[test]
    fn test_welch_symmetric() {
        let a = stats(10, 2.0, 1.0);
        let b = stats(12, 1.0, 0.5);
        let ab = welch(&a, &b, 0, 0.0);
        let ba = welch(&b, &a, 0, 0.0);
        assert_eq!(ab.logfc, -ba.logfc);
        assert_abs_diff_eq!(ab.right, ba.left, epsilon = 1e-12);
        assert!(ab.right < 0.05);
        assert!(ab.left > 0.95);
        assert_abs_diff_eq!(ab.left + ab.right, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_threshold_shifts_null() {
        let a = stats(20, 1.5, 0.2);
        let b = stats(20, 1.0, 0.2);
        let plain = welch(&a, &b, 0, 0.0);
        let shifted = welch(&a, &b, 0, 1.0);
        assert!(shifted.right > plain.right);
        assert!(shifted.right > 0.5);
    }

    #[test]
    fn test_zero_variance() {
        let a = stats(5, 1.0, 0.0);
        let b = stats(5, 0.0, 0.0);
        let o = welch(&a, &b, 0, 0.0);
        assert_eq!((o.left, o.right), (1.0, 0.0));
        let o = welch(&b, &b, 0, 0.0);
        assert_eq!((o.left, o.right), (1.0, 1.0));
    }

    #[test]
    fn test_blocked_skips_untestable() {
        let a = vec![stats(10, 2.0, 1.0), stats(1, 9.0, 0.0)];
        let b = vec![stats(10, 1.0, 1.0), stats(4, 0.0, 1.0)];
        let o = blocked_welch(&a, &b, 0, 0.0);
        assert_eq!(o, welch(&a[0], &b[0], 0, 0.0));
        let none = blocked_welch(&a[1..], &b[1..], 0, 0.0);
        assert_eq!(none, PairOutcome::NULL);
    }
}
