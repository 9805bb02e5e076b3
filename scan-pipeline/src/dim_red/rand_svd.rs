#![allow(non_snake_case)]

use super::{fix_signs, from_nalgebra, to_nalgebra, Svd, SvdResult};
use anyhow::{format_err, Error};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, ArrayView2};
use rand::distributions::Uniform;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;

/// Settings for Randomized SVD
#[derive(Clone, Debug)]
pub struct RandSvd {
    /// Multiple of the requested k to use in randomized projections
    pub l_multiplier: f64,

    /// Number of power iteration to perform
    pub n_iter: usize,

    pub seed: u64,
}

impl RandSvd {
    /// Create a new RandSvd with default settings.
    pub fn new() -> RandSvd {
        RandSvd {
            l_multiplier: 10.0,
            n_iter: 2,
            seed: 0,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> RandSvd {
        self.seed = seed;
        self
    }
}

impl Default for RandSvd {
    fn default() -> Self {
        Self::new()
    }
}

impl Svd for RandSvd {
    fn run_svd(&self, matrix: ArrayView2<f64>, k: usize) -> Result<SvdResult, Error> {
        let l = std::cmp::max(k + 4, ((k as f64) * self.l_multiplier) as usize);
        let (mut U, s, mut V) = svd_rand(matrix, k, l, self.n_iter, self.seed)?;
        fix_signs(&mut U, &mut V);
        Ok((U, s, V))
    }
}

/// Perform an SVD of matrix `A`, making a rank `k` approximation. Use `l` projection
/// dimensions (capped at the smaller dimension) and `n_iter` power iterations.
pub fn svd_rand(A: ArrayView2<f64>, k: usize, l: usize, n_iter: usize, seed: u64) -> Result<SvdResult, Error> {
    let (m, n) = A.dim();
    if m < 2 || n < 2 {
        return Err(format_err!("The input matrix must be at least 2x2, got {}x{}.", m, n));
    }
    if k == 0 || k > std::cmp::min(m, n) {
        return Err(format_err!("invalid k = {} for a {}x{} matrix", k, m, n));
    }
    let l = l.clamp(k, std::cmp::min(m, n));
    let mut rng = Pcg64Mcg::seed_from_u64(seed);

    // work on the tall orientation
    let (u, s, v) = if m >= n {
        svd_tall(&to_nalgebra(A), k, l, n_iter, &mut rng)?
    } else {
        let (u, s, v) = svd_tall(&to_nalgebra(A.t()), k, l, n_iter, &mut rng)?;
        (v, s, u)
    };
    Ok((from_nalgebra(&u), Array1::from(s.as_slice().to_vec()), from_nalgebra(&v)))
}

fn svd_tall(
    A: &DMatrix<f64>,
    k: usize,
    l: usize,
    n_iter: usize,
    rng: &mut impl Rng,
) -> Result<(DMatrix<f64>, DVector<f64>, DMatrix<f64>), Error> {
    let n = A.ncols();
    let unif = Uniform::new(-1.0, 1.0);
    let omega = DMatrix::from_fn(n, l, |_, _| rng.sample(unif));

    let mut Q = (A * omega).qr().q();
    for _ in 0..n_iter {
        Q = A.tr_mul(&Q).qr().q();
        Q = (A * Q).qr().q();
    }

    let B = Q.tr_mul(A);
    let svd = B.svd(true, true);
    let (Some(Ub), Some(Vt)) = (svd.u, svd.v_t) else {
        return Err(format_err!("SVD of the projected matrix did not converge"));
    };
    let U = &Q * Ub.columns(0, k);
    let V = Vt.rows(0, k).transpose();
    let s = svd.singular_values.rows(0, k).into_owned();
    Ok((U, s, V))
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::{Array2, ArrayView2};
    use rand_distr::{Distribution, Normal};

    /// Root-mean-squared value of the entries of `a`
    fn frobenius(a: &ArrayView2<f64>) -> f64 {
        let sz = (a.nrows() * a.ncols()).max(1) as f64;
        (a.iter().map(|v| v * v).sum::<f64>() / sz).sqrt()
    }

    /// rank-3 signal plus a little noise
    fn low_rank(m: usize, n: usize, seed: u64) -> Array2<f64> {
        let mut rng = Pcg64Mcg::seed_from_u64(seed);
        let norm = Normal::new(0.0, 1.0).unwrap();
        let left = Array2::from_shape_fn((m, 3), |_| norm.sample(&mut rng));
        let right = Array2::from_shape_fn((3, n), |(r, _)| norm.sample(&mut rng) * (3 - r) as f64 * 4.0);
        let noise = Array2::from_shape_fn((m, n), |_| norm.sample(&mut rng) * 0.01);
        left.dot(&right) + noise
    }

    fn check(a: &Array2<f64>, k: usize) {
        let (u, s, v) = RandSvd::new().run_svd(a.view(), k).unwrap();
        assert_eq!(u.dim(), (a.nrows(), k));
        assert_eq!(v.dim(), (a.ncols(), k));
        let diff = a.dot(&v) - &u * &s;
        assert!(frobenius(&diff.view()) < 1e-8);

        let exact = to_nalgebra(a.view()).svd(false, false).singular_values;
        for i in 0..k {
            assert!((s[i] - exact[i]).abs() / exact[i] < 1e-3, "{} vs {}", s[i], exact[i]);
        }
    }

    #[test]
    fn test_tall_and_wide() {
        check(&low_rank(200, 30, 0), 3);
        check(&low_rank(30, 200, 1), 3);
        check(&low_rank(40, 40, 2), 5);
    }

    #[test]
    fn test_seeded_and_sign_fixed() {
        let a = low_rank(60, 20, 3);
        let x = RandSvd::new().with_seed(4).run_svd(a.view(), 3).unwrap();
        let y = RandSvd::new().with_seed(4).run_svd(a.view(), 3).unwrap();
        assert_eq!(x, y);
        let z = RandSvd::new().with_seed(5).run_svd(a.view(), 3).unwrap();
        for c in 0..3 {
            let dot: f64 = x.2.column(c).dot(&z.2.column(c));
            assert!((dot - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_invalid_shapes() {
        let a = Array2::<f64>::zeros((1, 5));
        assert!(svd_rand(a.view(), 1, 5, 2, 0).is_err());
        let a = Array2::<f64>::zeros((5, 4));
        assert!(svd_rand(a.view(), 5, 5, 2, 0).is_err());
    }
}
