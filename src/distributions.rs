/*!
Distributions used to draw from a fitted mixture: a [`Categorical`] over component indices and a
dense [`MultivariateNormal`] component.

Both take the random number generator per call, so the owner decides how it is seeded.

# Examples

```rust
use chain_evidence::distributions::{Categorical, DiscreteDistribution, MultivariateNormal};
use nalgebra::{DMatrix, DVector};
use rand::{rngs::SmallRng, SeedableRng};

let mut rng = SmallRng::seed_from_u64(42);

let cat = Categorical::new(&[0.2, 0.3, 0.5]);
let k = cat.sample(&mut rng);
assert!(k < 3);

let cov = DMatrix::from_row_slice(2, 2, &[2.0, 0.5, 0.5, 1.0]);
let mvn = MultivariateNormal::new(DVector::from_vec(vec![1.0, -1.0]), cov).unwrap();
let x = mvn.sample(&mut rng);
assert!(mvn.ln_density(x.as_slice()).is_finite());
```
*/

use std::f64::consts::PI;

use nalgebra::{DMatrix, DVector};
use rand::Rng;

use crate::error::Result;
use crate::linalg::{draw_from_cov, invert, metric_dist2, sqrt_matrix};

/// A trait for discrete distributions whose state is represented as an index.
pub trait DiscreteDistribution {
    /// Samples an index from the distribution.
    fn sample<R: Rng>(&self, rng: &mut R) -> usize;
    /// Evaluates the log-probability of the given index.
    fn log_prob(&self, index: usize) -> f64;
}

/**
A categorical distribution over `0..probs.len()`.

The probabilities are normalised on construction. Sampling compares one uniform variate against
the cumulative probabilities and returns the first index whose cumulative probability reaches it.
*/
#[derive(Debug, Clone, PartialEq)]
pub struct Categorical {
    probs: Vec<f64>,
    cumulative: Vec<f64>,
}

impl Categorical {
    pub fn new(probs: &[f64]) -> Self {
        assert!(!probs.is_empty(), "a categorical needs at least one category");
        let sum: f64 = probs.iter().sum();
        let probs: Vec<f64> = probs.iter().map(|p| p / sum).collect();
        let cumulative = probs
            .iter()
            .scan(0.0, |acc, p| {
                *acc += p;
                Some(*acc)
            })
            .collect();
        Self { probs, cumulative }
    }

    pub fn probs(&self) -> &[f64] {
        &self.probs
    }
}

impl DiscreteDistribution for Categorical {
    fn sample<R: Rng>(&self, rng: &mut R) -> usize {
        let u: f64 = rng.gen();
        self.cumulative
            .partition_point(|&c| c < u)
            .min(self.probs.len() - 1)
    }

    fn log_prob(&self, index: usize) -> f64 {
        if index < self.probs.len() {
            self.probs[index].ln()
        } else {
            f64::NEG_INFINITY
        }
    }
}

/// A Gaussian with dense covariance, caching the inverse, determinant and square root.
#[derive(Debug, Clone, PartialEq)]
pub struct MultivariateNormal {
    mean: DVector<f64>,
    cov: DMatrix<f64>,
    inv_cov: DMatrix<f64>,
    det: f64,
    sqrt_cov: DMatrix<f64>,
}

impl MultivariateNormal {
    pub fn new(mean: DVector<f64>, cov: DMatrix<f64>) -> Result<Self> {
        assert_eq!(
            mean.len(),
            cov.nrows(),
            "mean and covariance dimensionality differ"
        );
        let (inv_cov, det) = invert(&cov)?;
        let sqrt_cov = sqrt_matrix(&cov);
        Ok(Self {
            mean,
            cov,
            inv_cov,
            det,
            sqrt_cov,
        })
    }

    /// Zero mean, identity covariance.
    pub fn standard(n_dim: usize) -> Self {
        Self {
            mean: DVector::zeros(n_dim),
            cov: DMatrix::identity(n_dim, n_dim),
            inv_cov: DMatrix::identity(n_dim, n_dim),
            det: 1.0,
            sqrt_cov: DMatrix::identity(n_dim, n_dim),
        }
    }

    pub fn ndim(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> &[f64] {
        self.mean.as_slice()
    }

    pub fn cov(&self) -> &DMatrix<f64> {
        &self.cov
    }

    pub fn inv_cov(&self) -> &DMatrix<f64> {
        &self.inv_cov
    }

    pub fn det_cov(&self) -> f64 {
        self.det
    }

    /// `B` with `B Bᵀ = cov`.
    pub fn sqrt_cov(&self) -> &DMatrix<f64> {
        &self.sqrt_cov
    }

    pub fn ln_density(&self, x: &[f64]) -> f64 {
        let d = self.ndim() as f64;
        -0.5 * (metric_dist2(&self.inv_cov, x, self.mean.as_slice())
            + d * (2.0 * PI).ln()
            + self.det.ln())
    }

    pub fn density(&self, x: &[f64]) -> f64 {
        self.ln_density(x).exp()
    }

    pub fn sample<R: Rng>(&self, rng: &mut R) -> DVector<f64> {
        &self.mean + draw_from_cov(&self.sqrt_cov, rng)
    }

    /// Replaces mean and covariance, refreshing the inverse and determinant but not the square
    /// root; call [`MultivariateNormal::refresh_sqrt`] once the moments are final.
    pub(crate) fn set_moments(&mut self, mean: DVector<f64>, cov: DMatrix<f64>) -> Result<()> {
        let (inv_cov, det) = invert(&cov)?;
        self.mean = mean;
        self.cov = cov;
        self.inv_cov = inv_cov;
        self.det = det;
        Ok(())
    }

    pub(crate) fn refresh_sqrt(&mut self) {
        self.sqrt_cov = sqrt_matrix(&self.cov);
    }
}
