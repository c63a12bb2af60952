/*!
# Weighted Posterior Chain

A [`Chain`] is an append-only store of `N`-dimensional posterior samples, each carrying a
log-likelihood and a non-negative importance weight. Alongside the raw points the chain keeps
the running total weight, per-dimension bounds, and a [`MomentAccumulator`] that mirrors every
append so that the weighted mean and covariance are always available without a pass over the
data.

## Example Usage

```rust
use chain_evidence::chain::Chain;

let mut chain = Chain::new(2, 16);
chain.append_point(&[0.0, 1.0], -0.5, 2.0);
chain.append_point(&[1.0, -1.0], -1.5, 1.0);

assert_eq!(chain.len(), 2);
assert_eq!(chain.total_weight(), 3.0);
assert_eq!(chain.x_min(), &[0.0, -1.0]);
assert_eq!(chain.element(1), &[1.0, -1.0]);
```
*/

use std::ops::Index;

use ndarray::ArrayView2;

use crate::error::Result;
use crate::gmm::GaussianMixture;
use crate::stats::{MomentAccumulator, WeightedMoments};

/// Growth factor applied to the capacity when an append overflows it.
pub(crate) const GROWTH: f64 = 1.5;

/// How a point's weight is handed to the chain's moment accumulator.
///
/// Stored weights and `total_weight` always keep the exact value; the policy only affects the
/// accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightPolicy {
    /// The weight is truncated towards zero and treated as an integer vote count.
    #[default]
    Truncate,
    /// The weight is passed through unchanged.
    Exact,
}

impl WeightPolicy {
    pub fn apply(self, weight: f64) -> f64 {
        match self {
            WeightPolicy::Truncate => weight.trunc(),
            WeightPolicy::Exact => weight,
        }
    }
}

/// An append-only, weighted collection of posterior samples.
///
/// Coordinates are stored point-major in one flat buffer: point `i` occupies
/// `x[i * ndim .. (i + 1) * ndim]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Chain<A: MomentAccumulator = WeightedMoments> {
    pub(crate) n_dim: usize,
    pub(crate) capacity: usize,
    pub(crate) x: Vec<f64>,
    pub(crate) ln_l: Vec<f64>,
    pub(crate) w: Vec<f64>,
    pub(crate) total_weight: f64,
    pub(crate) x_min: Vec<f64>,
    pub(crate) x_max: Vec<f64>,
    pub(crate) stats: A,
    pub(crate) weight_policy: WeightPolicy,
}

impl Chain<WeightedMoments> {
    /// Creates an empty chain of dimensionality `n_dim` with room for `capacity` points.
    pub fn new(n_dim: usize, capacity: usize) -> Self {
        Self::with_accumulator(WeightedMoments::new(n_dim), capacity)
    }
}

impl<A: MomentAccumulator> Chain<A> {
    /// Creates an empty chain around an existing (normally empty) accumulator.
    pub fn with_accumulator(stats: A, capacity: usize) -> Self {
        let n_dim = stats.ndim();
        assert!(n_dim > 0, "a chain needs at least one dimension");
        let mut chain = Self {
            n_dim,
            capacity: 0,
            x: Vec::new(),
            ln_l: Vec::new(),
            w: Vec::new(),
            total_weight: 0.0,
            x_min: vec![f64::INFINITY; n_dim],
            x_max: vec![f64::NEG_INFINITY; n_dim],
            stats,
            weight_policy: WeightPolicy::default(),
        };
        chain.set_capacity(capacity);
        chain
    }

    /// Sets how weights are forwarded to the moment accumulator.
    pub fn with_weight_policy(mut self, policy: WeightPolicy) -> Self {
        self.weight_policy = policy;
        self
    }

    /// Appends one sample. Panics if `point` does not have `ndim` coordinates.
    pub fn append_point(&mut self, point: &[f64], ln_l: f64, weight: f64) {
        assert_eq!(
            point.len(),
            self.n_dim,
            "point has {} coordinates, chain has {} dimensions",
            point.len(),
            self.n_dim
        );
        if self.len() >= self.capacity {
            let grown = (GROWTH * self.capacity as f64).ceil() as usize;
            self.set_capacity(grown.max(self.len() + 1));
        }

        self.stats.add(point, self.weight_policy.apply(weight));
        for (k, &xk) in point.iter().enumerate() {
            if xk < self.x_min[k] {
                self.x_min[k] = xk;
            }
            if xk > self.x_max[k] {
                self.x_max[k] = xk;
            }
        }
        self.x.extend_from_slice(point);
        self.ln_l.push(ln_l);
        self.w.push(weight);
        self.total_weight += weight;
    }

    /// Empties the chain, keeping the allocated storage.
    pub fn clear(&mut self) {
        self.x.clear();
        self.ln_l.clear();
        self.w.clear();
        self.stats.clear();
        self.total_weight = 0.0;
        self.reset_bounds();
    }

    /// Reserves storage for at least `capacity` points. Never shrinks.
    pub fn set_capacity(&mut self, capacity: usize) {
        if capacity <= self.capacity {
            return;
        }
        self.x
            .reserve((self.n_dim * capacity).saturating_sub(self.x.len()));
        self.ln_l.reserve(capacity.saturating_sub(self.ln_l.len()));
        self.w.reserve(capacity.saturating_sub(self.w.len()));
        self.capacity = capacity;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.w.len()
    }

    pub fn is_empty(&self) -> bool {
        self.w.is_empty()
    }

    pub fn ndim(&self) -> usize {
        self.n_dim
    }

    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    /// Coordinates of point `i`. Panics when `i >= len()`.
    pub fn element(&self, i: usize) -> &[f64] {
        &self.x[i * self.n_dim..(i + 1) * self.n_dim]
    }

    pub fn ln_likelihood(&self, i: usize) -> f64 {
        self.ln_l[i]
    }

    pub fn weight(&self, i: usize) -> f64 {
        self.w[i]
    }

    pub fn ln_likelihoods(&self) -> &[f64] {
        &self.ln_l
    }

    pub fn weights(&self) -> &[f64] {
        &self.w
    }

    /// All coordinates as a `(len, ndim)` view.
    pub fn coords(&self) -> ArrayView2<'_, f64> {
        ArrayView2::from_shape((self.len(), self.n_dim), &self.x)
            .expect("Expected chain storage to match (length, ndim)")
    }

    /// Iterates over the points in insertion order.
    pub fn points(&self) -> impl Iterator<Item = &[f64]> + '_ {
        self.x.chunks_exact(self.n_dim)
    }

    /// Per-dimension minimum over every stored point (`+inf` when empty).
    pub fn x_min(&self) -> &[f64] {
        &self.x_min
    }

    /// Per-dimension maximum over every stored point (`-inf` when empty).
    pub fn x_max(&self) -> &[f64] {
        &self.x_max
    }

    pub fn stats(&self) -> &A {
        &self.stats
    }

    pub fn weight_policy(&self) -> WeightPolicy {
        self.weight_policy
    }

    /// Fits `gm` to the chain's points and weights. Returns the number of EM rounds run.
    pub fn fit_gaussian_mixture(&self, gm: &mut GaussianMixture, iterations: usize) -> Result<usize> {
        assert_eq!(gm.ndim(), self.n_dim, "mixture and chain dimensionality differ");
        gm.fit(self.coords(), &self.w, iterations)
    }

    pub(crate) fn reset_bounds(&mut self) {
        self.x_min.fill(f64::INFINITY);
        self.x_max.fill(f64::NEG_INFINITY);
    }

    pub(crate) fn recompute_bounds(&mut self) {
        self.reset_bounds();
        for p in self.x.chunks_exact(self.n_dim) {
            for (k, &xk) in p.iter().enumerate() {
                self.x_min[k] = self.x_min[k].min(xk);
                self.x_max[k] = self.x_max[k].max(xk);
            }
        }
    }
}

impl<A: MomentAccumulator> Index<usize> for Chain<A> {
    type Output = [f64];

    fn index(&self, i: usize) -> &[f64] {
        self.element(i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn random_chain(n: usize, seed: u64) -> (Chain, Vec<[f64; 3]>, Vec<f64>) {
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut chain = Chain::new(3, 4);
        let mut pts = Vec::new();
        let mut ws = Vec::new();
        for _ in 0..n {
            let p = [
                rng.gen_range(-5.0..5.0),
                rng.gen_range(0.0..1.0),
                rng.gen_range(-100.0..-50.0),
            ];
            let w = rng.gen_range(0.0..4.0);
            chain.append_point(&p, -rng.gen::<f64>(), w);
            pts.push(p);
            ws.push(w);
        }
        (chain, pts, ws)
    }

    #[test]
    fn lengths_and_total_weight_track_appends() {
        let (chain, _, ws) = random_chain(257, 11);
        assert_eq!(chain.len(), 257);
        assert_eq!(chain.weights().len(), 257);
        assert_eq!(chain.ln_likelihoods().len(), 257);
        assert_eq!(chain.coords().shape(), &[257, 3]);
        assert_abs_diff_eq!(chain.total_weight(), ws.iter().sum::<f64>(), epsilon = 1e-9);
    }

    #[test]
    fn bounds_equal_exact_extrema() {
        let (chain, pts, _) = random_chain(500, 12);
        for k in 0..3 {
            let lo = pts.iter().map(|p| p[k]).fold(f64::INFINITY, f64::min);
            let hi = pts.iter().map(|p| p[k]).fold(f64::NEG_INFINITY, f64::max);
            assert_eq!(chain.x_min()[k], lo);
            assert_eq!(chain.x_max()[k], hi);
        }
    }

    #[test]
    fn capacity_grows_by_half_on_overflow() {
        let mut chain = Chain::new(1, 4);
        for i in 0..4 {
            chain.append_point(&[i as f64], 0.0, 1.0);
        }
        assert_eq!(chain.capacity(), 4);
        chain.append_point(&[4.0], 0.0, 1.0);
        assert_eq!(chain.capacity(), 6);
    }

    #[test]
    fn zero_capacity_chain_still_accepts_points() {
        let mut chain = Chain::new(2, 0);
        chain.append_point(&[1.0, 2.0], 0.0, 1.0);
        assert_eq!(chain.len(), 1);
        assert!(chain.capacity() >= 1);
    }

    #[test]
    fn set_capacity_never_shrinks() {
        let mut chain = Chain::new(2, 10);
        chain.set_capacity(3);
        assert_eq!(chain.capacity(), 10);
        chain.set_capacity(40);
        assert_eq!(chain.capacity(), 40);
    }

    #[test]
    fn clear_resets_everything_but_capacity() {
        let (mut chain, _, _) = random_chain(50, 13);
        let cap = chain.capacity();
        chain.clear();
        assert!(chain.is_empty());
        assert_eq!(chain.total_weight(), 0.0);
        assert_eq!(chain.capacity(), cap);
        assert!(chain.x_min().iter().all(|v| *v == f64::INFINITY));
        assert!(chain.x_max().iter().all(|v| *v == f64::NEG_INFINITY));
        assert_eq!(chain.stats().total_weight(), 0.0);
    }

    #[test]
    fn element_and_index_agree() {
        let (chain, pts, _) = random_chain(10, 14);
        for (i, p) in pts.iter().enumerate() {
            assert_eq!(chain.element(i), p.as_slice());
            assert_eq!(&chain[i], p.as_slice());
        }
        assert_eq!(chain.points().count(), 10);
    }

    #[test]
    fn truncate_policy_feeds_integer_counts_to_accumulator() {
        let mut chain = Chain::new(1, 4);
        chain.append_point(&[1.0], 0.0, 2.7);
        chain.append_point(&[3.0], 0.0, 0.9);
        assert_abs_diff_eq!(chain.total_weight(), 3.6, epsilon = 1e-12);
        // 0.9 truncates to zero votes, so only the first point reaches the moments
        assert_abs_diff_eq!(chain.stats().total_weight(), 2.0);
        assert_abs_diff_eq!(chain.stats().mean(0), 1.0);
    }

    #[test]
    fn exact_policy_feeds_raw_weights_to_accumulator() {
        let mut chain = Chain::new(1, 4).with_weight_policy(WeightPolicy::Exact);
        chain.append_point(&[1.0], 0.0, 2.7);
        chain.append_point(&[3.0], 0.0, 0.9);
        assert_abs_diff_eq!(chain.stats().total_weight(), 3.6, epsilon = 1e-12);
        assert_abs_diff_eq!(chain.stats().mean(0), (2.7 + 2.7) / 3.6, epsilon = 1e-12);
    }

    #[test]
    #[should_panic(expected = "coordinates")]
    fn wrong_point_length_panics() {
        let mut chain = Chain::new(2, 1);
        chain.append_point(&[1.0], 0.0, 1.0);
    }
}
