/*!
# Gaussian Mixture Model

A K-component Gaussian mixture fitted to a weighted point cloud by expectation maximisation,
used to compress a chain into an analytic density that can be sampled from.

EM starts from K distinct data points as means, assigns every point to its nearest mean, and
then alternates for a fixed number of rounds:

1. responsibilities: each component's Gaussian density at each point, normalised across
   components (the mixture weights do not enter this step);
2. weights, means and covariances from the responsibility-and-weight-weighted moments, with
   every covariance diagonal regularised to `1.01 v + 0.01`.

A component that collects no responsibility mass is either reseeded on a random data point or
reported as [`Error::ComponentStarved`], see [`StarvationPolicy`].

## Example

```rust
use chain_evidence::gmm::GaussianMixture;
use ndarray::Array2;

let points = Array2::from_shape_fn((200, 1), |(i, _)| {
    let center = if i % 2 == 0 { -5.0 } else { 5.0 };
    center + (i % 7) as f64 * 0.1
});
let weights = vec![1.0; 200];

let mut gm = GaussianMixture::new(1, 2).set_seed(42);
gm.fit(points.view(), &weights, 20).unwrap();
assert!((gm.weights().iter().sum::<f64>() - 1.0).abs() < 1e-12);

let x = gm.draw();
assert_eq!(x.len(), 1);
```
*/

use nalgebra::{DMatrix, DVector};
use ndarray::{Array2, ArrayView2};
use rand::rngs::SmallRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::distributions::{Categorical, DiscreteDistribution, MultivariateNormal};
use crate::error::{Error, Result};
use crate::stats::{MomentAccumulator, WeightedMoments};

/// Diagonal regularisation applied to every fitted covariance: `v -> SCALE * v + FLOOR`.
const COV_DIAGONAL_SCALE: f64 = 1.01;
const COV_DIAGONAL_FLOOR: f64 = 0.01;

/// What EM does with a component that received no responsibility mass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StarvationPolicy {
    /// Move the component onto a random data point with the regularised global covariance.
    #[default]
    Reseed,
    /// Abort the fit with [`Error::ComponentStarved`].
    Fail,
}

/// A mixture of `n_components` Gaussians in `n_dim` dimensions.
#[derive(Debug, Clone)]
pub struct GaussianMixture {
    n_dim: usize,
    weights: Vec<f64>,
    components: Vec<MultivariateNormal>,
    selector: Categorical,
    tolerance: Option<f64>,
    starvation: StarvationPolicy,
    rng: SmallRng,
}

impl GaussianMixture {
    /// Creates an unfitted mixture: equal weights and standard normal components.
    pub fn new(n_dim: usize, n_components: usize) -> Self {
        assert!(n_dim > 0, "a mixture needs at least one dimension");
        assert!(n_components > 0, "a mixture needs at least one component");
        let weights = vec![1.0 / n_components as f64; n_components];
        Self {
            n_dim,
            selector: Categorical::new(&weights),
            weights,
            components: vec![MultivariateNormal::standard(n_dim); n_components],
            tolerance: None,
            starvation: StarvationPolicy::default(),
            rng: SmallRng::from_entropy(),
        }
    }

    /// Returns a new instance of this mixture seeded with `seed`.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    /// Stops EM early once the weighted mean log-density changes by less than `tolerance`
    /// relative to the previous round.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = Some(tolerance);
        self
    }

    pub fn with_starvation(mut self, policy: StarvationPolicy) -> Self {
        self.starvation = policy;
        self
    }

    pub fn ndim(&self) -> usize {
        self.n_dim
    }

    pub fn n_components(&self) -> usize {
        self.components.len()
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn weight(&self, k: usize) -> f64 {
        self.weights[k]
    }

    pub fn component(&self, k: usize) -> &MultivariateNormal {
        &self.components[k]
    }

    pub fn mean(&self, k: usize) -> &[f64] {
        self.components[k].mean()
    }

    pub fn cov(&self, k: usize) -> &DMatrix<f64> {
        self.components[k].cov()
    }

    pub fn inv_cov(&self, k: usize) -> &DMatrix<f64> {
        self.components[k].inv_cov()
    }

    pub fn det_cov(&self, k: usize) -> f64 {
        self.components[k].det_cov()
    }

    pub fn sqrt_cov(&self, k: usize) -> &DMatrix<f64> {
        self.components[k].sqrt_cov()
    }

    /// Mixture density `Σ_k w_k N_k(x)`.
    pub fn density(&self, x: &[f64]) -> f64 {
        self.weights
            .iter()
            .zip(&self.components)
            .map(|(w, c)| w * c.density(x))
            .sum()
    }

    /// Draws one point: a component by weight, then a correlated normal around its mean.
    pub fn draw(&mut self) -> Vec<f64> {
        let k = self.selector.sample(&mut self.rng);
        self.components[k].sample(&mut self.rng).as_slice().to_vec()
    }

    /// Fits the mixture by EM to `points` (one row per point) with the given weights.
    ///
    /// Runs `iterations + 1` rounds, the first one from the hard nearest-mean assignment,
    /// unless a tolerance was set and is met earlier. Returns the number of rounds run.
    pub fn fit(
        &mut self,
        points: ArrayView2<f64>,
        weights: &[f64],
        iterations: usize,
    ) -> Result<usize> {
        let (n, d) = points.dim();
        assert_eq!(d, self.n_dim, "points have the wrong dimensionality");
        assert_eq!(weights.len(), n, "one weight per point is required");
        let k_max = self.components.len();
        if n < k_max {
            return Err(Error::InvalidOption(format!(
                "{k_max} components need at least as many points, got {n}"
            )));
        }
        let sum_w: f64 = weights.iter().sum();
        if !(sum_w > 0.0 && sum_w.is_finite()) {
            return Err(Error::InvalidOption(format!(
                "total point weight must be positive, got {sum_w}"
            )));
        }

        let points = points.as_standard_layout();
        let rows: Vec<&[f64]> = points
            .outer_iter()
            .map(|r| r.to_slice().expect("Expected standard-layout rows"))
            .collect();
        let global_cov = regularised_global_cov(&rows, weights);

        // initial means on distinct points, then a hard nearest-mean assignment
        let means: Vec<&[f64]> = index::sample(&mut self.rng, n, k_max)
            .into_iter()
            .map(|i| rows[i])
            .collect();
        let mut resp = Array2::<f64>::zeros((n, k_max));
        for (row, x) in rows.iter().enumerate() {
            let nearest = (0..k_max)
                .map(|k| {
                    let d2: f64 = x.iter().zip(means[k]).map(|(a, b)| (a - b).powi(2)).sum();
                    (k, d2)
                })
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .map_or(0, |(k, _)| k);
            resp[[row, nearest]] = 1.0;
        }

        let mut ln_dens = Array2::<f64>::zeros((n, k_max));
        let mut prev_ll: Option<f64> = None;
        let mut rounds = 0;
        for count in 0..=iterations {
            if count != 0 {
                let ll = self.expectation(&rows, weights, &mut ln_dens, &mut resp) / sum_w;
                if let (Some(tol), Some(prev)) = (self.tolerance, prev_ll) {
                    if (ll - prev).abs() <= tol * prev.abs() {
                        debug!(round = count, ll, "EM converged");
                        break;
                    }
                }
                prev_ll = Some(ll);
            }
            self.maximization(&rows, weights, sum_w, &resp, &global_cov, count)?;
            rounds += 1;
        }

        for c in &mut self.components {
            c.refresh_sqrt();
        }
        self.selector = Categorical::new(&self.weights);
        debug!(rounds, weights = ?self.weights, "fitted gaussian mixture");
        Ok(rounds)
    }

    /// Fills the responsibilities from the current components and returns the weighted
    /// log-density of the points under the current mixture.
    fn expectation(
        &self,
        rows: &[&[f64]],
        weights: &[f64],
        ln_dens: &mut Array2<f64>,
        resp: &mut Array2<f64>,
    ) -> f64 {
        let mut ll = 0.0;
        for (n, x) in rows.iter().enumerate() {
            for (k, c) in self.components.iter().enumerate() {
                ln_dens[[n, k]] = c.ln_density(x);
            }
            let row = ln_dens.row(n);
            let m = row.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
            let norm: f64 = row.iter().map(|l| (l - m).exp()).sum();
            for k in 0..self.components.len() {
                resp[[n, k]] = (ln_dens[[n, k]] - m).exp() / norm;
            }
            if self.tolerance.is_some() {
                let mix: f64 = row
                    .iter()
                    .zip(&self.weights)
                    .map(|(l, w)| w * (l - m).exp())
                    .sum();
                ll += weights[n] * (m + mix.ln());
            }
        }
        ll
    }

    fn maximization(
        &mut self,
        rows: &[&[f64]],
        weights: &[f64],
        sum_w: f64,
        resp: &Array2<f64>,
        global_cov: &DMatrix<f64>,
        round: usize,
    ) -> Result<()> {
        let d = self.n_dim;
        for k in 0..self.components.len() {
            let mass: f64 = (0..rows.len()).map(|n| weights[n] * resp[[n, k]]).sum();
            if !(mass > 0.0 && mass.is_finite()) {
                match self.starvation {
                    StarvationPolicy::Fail => {
                        return Err(Error::ComponentStarved {
                            component: k,
                            iteration: round,
                        })
                    }
                    StarvationPolicy::Reseed => {
                        let at = rows[self.rng.gen_range(0..rows.len())];
                        warn!(component = k, round, mass, point = ?at, "reseeding starved mixture component");
                        self.components[k]
                            .set_moments(DVector::from_column_slice(at), global_cov.clone())?;
                        self.weights[k] = 0.0;
                        continue;
                    }
                }
            }

            let mut mean = DVector::<f64>::zeros(d);
            for (n, x) in rows.iter().enumerate() {
                let f = weights[n] * resp[[n, k]];
                for (m, xi) in mean.iter_mut().zip(x.iter()) {
                    *m += f * xi;
                }
            }
            mean /= mass;

            let mut cov = DMatrix::<f64>::zeros(d, d);
            for (n, x) in rows.iter().enumerate() {
                let f = weights[n] * resp[[n, k]];
                if f == 0.0 {
                    continue;
                }
                for i in 0..d {
                    let di = x[i] - mean[i];
                    for j in i..d {
                        cov[(i, j)] += f * di * (x[j] - mean[j]);
                    }
                }
            }
            for i in 0..d {
                for j in i..d {
                    let v = cov[(i, j)] / mass;
                    if i == j {
                        cov[(i, i)] = COV_DIAGONAL_SCALE * v + COV_DIAGONAL_FLOOR;
                    } else {
                        cov[(i, j)] = v;
                        cov[(j, i)] = v;
                    }
                }
            }

            self.weights[k] = mass / sum_w;
            self.components[k].set_moments(mean, cov)?;
        }

        let total: f64 = self.weights.iter().sum();
        if total > 0.0 {
            self.weights.iter_mut().for_each(|w| *w /= total);
        }
        Ok(())
    }
}

/// Weighted covariance of all points with the component diagonal regularisation applied.
fn regularised_global_cov(rows: &[&[f64]], weights: &[f64]) -> DMatrix<f64> {
    let d = rows.first().map_or(0, |r| r.len());
    let mut moments = WeightedMoments::new(d);
    for (x, &w) in rows.iter().zip(weights) {
        moments.add(x, w);
    }
    DMatrix::from_fn(d, d, |i, j| {
        let v = moments.cov(i, j);
        if i == j {
            COV_DIAGONAL_SCALE * v + COV_DIAGONAL_FLOOR
        } else {
            v
        }
    })
}
