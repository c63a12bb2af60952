/*!
Dense linear-algebra kernels used by the evidence estimator and the mixture model.

All matrices are `nalgebra` [`DMatrix<f64>`]; the routines operate on arbitrary dimension.

# Examples

```rust
use chain_evidence::linalg::{invert, sqrt_matrix};
use nalgebra::DMatrix;

let a = DMatrix::from_row_slice(2, 2, &[4.0, 2.0, 2.0, 3.0]);
let (a_inv, det) = invert(&a).unwrap();
assert!((det - 8.0).abs() < 1e-12);
assert!(((&a * &a_inv) - DMatrix::identity(2, 2)).norm() < 1e-12);

let b = sqrt_matrix(&a);
assert!(((&b * b.transpose()) - a).norm() < 1e-10);
```
*/

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;
use tracing::warn;

use crate::error::{Error, Result};

/// Number of regularised retries after the first failed inversion.
pub const INVERT_RETRIES: usize = 5;

/// Diagonal loading added per retry.
pub const INVERT_DIAGONAL_STEP: f64 = 1e-3;

/// Inverts `a` through an LU decomposition and returns `(a⁻¹, det(a))`.
///
/// When the decomposition is singular (or produces non-finite entries) the diagonal is
/// loaded with `k · 1e-3` on retry `k`, up to [`INVERT_RETRIES`] times. The determinant
/// returned is that of the matrix actually inverted.
pub fn invert(a: &DMatrix<f64>) -> Result<(DMatrix<f64>, f64)> {
    assert!(a.is_square(), "invert requires a square matrix");
    let n = a.nrows();

    for attempt in 0..=INVERT_RETRIES {
        let mut m = a.clone();
        if attempt != 0 {
            let load = attempt as f64 * INVERT_DIAGONAL_STEP;
            for i in 0..n {
                m[(i, i)] += load;
            }
            warn!(attempt, load, "matrix inversion failed, loading diagonal");
        }
        let lu = m.lu();
        let det = lu.determinant();
        if let Some(inv) = lu.try_inverse() {
            if det.is_finite() && det != 0.0 && inv.iter().all(|v| v.is_finite()) {
                return Ok((inv, det));
            }
        }
    }

    Err(Error::SingularMatrix {
        dim: n,
        attempts: INVERT_RETRIES + 1,
    })
}

/// Returns `B` with `B · Bᵀ = A` for symmetric `A`.
///
/// `A = V D Vᵀ` is eigendecomposed; eigenvectors belonging to negative eigenvalues have their
/// sign flipped, the diagonal becomes `sqrt(|λ|)`, and `B = V · sqrt(D)`.
pub fn sqrt_matrix(a: &DMatrix<f64>) -> DMatrix<f64> {
    assert!(a.is_square(), "sqrt_matrix requires a square matrix");
    let eigen = a.clone().symmetric_eigen();
    let mut vecs = eigen.eigenvectors;
    for (i, &lambda) in eigen.eigenvalues.iter().enumerate() {
        let scale = lambda.abs().sqrt();
        let sign = if lambda < 0.0 { -1.0 } else { 1.0 };
        vecs.column_mut(i).scale_mut(sign * scale);
    }
    vecs
}

/// Squared Mahalanobis distance `(x - mu)ᵀ · inv_cov · (x - mu)`.
pub fn metric_dist2(inv_cov: &DMatrix<f64>, x: &[f64], mu: &[f64]) -> f64 {
    let n = mu.len();
    debug_assert_eq!(x.len(), n);
    let mut sum = 0.0;
    for i in 0..n {
        let di = x[i] - mu[i];
        for j in 0..n {
            sum += di * inv_cov[(i, j)] * (x[j] - mu[j]);
        }
    }
    sum
}

/// Draws a zero-mean normal variate with covariance `sqrt_cov · sqrt_covᵀ`.
pub fn draw_from_cov<R: Rng>(sqrt_cov: &DMatrix<f64>, rng: &mut R) -> DVector<f64> {
    let z = DVector::from_fn(sqrt_cov.ncols(), |_, _| rng.sample::<f64, _>(StandardNormal));
    sqrt_cov * z
}

/// `ln Γ(n/2)` for a positive integer `n`, exact for integer and half-integer arguments.
pub(crate) fn ln_gamma_half(n: usize) -> f64 {
    assert!(n > 0, "ln_gamma_half requires n > 0");
    // Γ(1) = 1, Γ(1/2) = √π, Γ(x + 1) = x Γ(x)
    let (mut acc, mut x) = if n % 2 == 0 {
        (0.0, 1.0)
    } else {
        (0.5 * std::f64::consts::PI.ln(), 0.5)
    };
    let target = n as f64 / 2.0;
    while x < target {
        acc += x.ln();
        x += 1.0;
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn invert_known_spd_3x3() {
        let a = DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.0, 1.0, 3.0, 1.0, 0.0, 1.0, 2.0]);
        // det = 4(6-1) - 1(2-0) = 18
        let expected = DMatrix::from_row_slice(
            3,
            3,
            &[5.0, -2.0, 1.0, -2.0, 8.0, -4.0, 1.0, -4.0, 11.0],
        ) / 18.0;
        let (inv, det) = invert(&a).unwrap();
        assert_relative_eq!(det, 18.0, max_relative = 1e-9);
        for (got, want) in inv.iter().zip(expected.iter()) {
            assert_relative_eq!(*got, *want, max_relative = 1e-9);
        }
    }

    #[test]
    fn invert_singular_is_regularised() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let (inv, det) = invert(&a).unwrap();
        assert!(det > 0.0);
        assert!(inv.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn invert_zero_matrix_is_recovered_by_loading() {
        let a = DMatrix::<f64>::zeros(3, 3);
        let (inv, det) = invert(&a).unwrap();
        assert_relative_eq!(det, 1e-9, max_relative = 1e-6);
        assert_relative_eq!(inv[(0, 0)], 1e3, max_relative = 1e-9);
    }

    #[test]
    fn invert_non_finite_fails_with_typed_error() {
        let a = DMatrix::from_element(2, 2, f64::NAN);
        match invert(&a) {
            Err(Error::SingularMatrix { dim, attempts }) => {
                assert_eq!(dim, 2);
                assert_eq!(attempts, INVERT_RETRIES + 1);
            }
            other => panic!("expected SingularMatrix, got {other:?}"),
        }
    }

    #[test]
    fn sqrt_matrix_reconstructs_random_spd() {
        let mut rng = SmallRng::seed_from_u64(7);
        let m = DMatrix::from_fn(4, 4, |_, _| rng.gen_range(-1.0..1.0));
        let a = &m * m.transpose() + DMatrix::identity(4, 4) * 0.5;
        let b = sqrt_matrix(&a);
        let rebuilt = &b * b.transpose();
        for (got, want) in rebuilt.iter().zip(a.iter()) {
            assert_relative_eq!(*got, *want, epsilon = 1e-10);
        }
    }

    #[test]
    fn metric_dist2_matches_identity_euclidean() {
        let eye = DMatrix::identity(3, 3);
        let d2 = metric_dist2(&eye, &[1.0, 2.0, 2.0], &[0.0, 0.0, 0.0]);
        assert_relative_eq!(d2, 9.0);
    }

    #[test]
    fn ln_gamma_half_matches_known_values() {
        // Γ(1/2) = √π, Γ(1) = 1, Γ(3/2) = √π/2, Γ(2) = 1, Γ(5/2) = 3√π/4, Γ(3) = 2
        let sqrt_pi = std::f64::consts::PI.sqrt();
        assert_relative_eq!(ln_gamma_half(1), sqrt_pi.ln(), epsilon = 1e-14);
        assert_relative_eq!(ln_gamma_half(2), 0.0, epsilon = 1e-14);
        assert_relative_eq!(ln_gamma_half(3), (sqrt_pi / 2.0).ln(), epsilon = 1e-14);
        assert_relative_eq!(ln_gamma_half(5), (0.75 * sqrt_pi).ln(), epsilon = 1e-14);
        assert_relative_eq!(ln_gamma_half(6), 2f64.ln(), epsilon = 1e-14);
    }

    #[test]
    fn draw_from_cov_has_requested_variance() {
        let cov = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 2.0]);
        let s = sqrt_matrix(&cov);
        let mut rng = SmallRng::seed_from_u64(3);
        let n = 50_000;
        let mut acc = DMatrix::<f64>::zeros(2, 2);
        for _ in 0..n {
            let x = draw_from_cov(&s, &mut rng);
            acc += &x * x.transpose();
        }
        acc /= n as f64;
        for (got, want) in acc.iter().zip(cov.iter()) {
            assert!((got - want).abs() < 0.1, "got {got}, want {want}");
        }
    }
}
