//! Locating the density peak of a [`Chain`].
//!
//! [`Chain::find_center`] is a flat-kernel mean shift in the Mahalanobis metric: starting from
//! a random stored point it repeatedly moves to the weighted mean of the points within the
//! current radius, shrinking the radius by 10% per round. [`Chain::density_peak`] is a cheaper
//! histogram alternative.

use std::collections::BTreeMap;

use nalgebra::DMatrix;
use rand::Rng;
use tracing::{debug, warn};

use crate::chain::Chain;
use crate::error::{Error, Result};
use crate::linalg::metric_dist2;
use crate::stats::MomentAccumulator;

/// Factor applied to the search radius after every round.
const RADIUS_SHRINK: f64 = 0.9;

impl<A: MomentAccumulator> Chain<A> {
    /// Mean-shift search for a density peak.
    ///
    /// `radius` is in units of the metric `inv_cov`, i.e. standard deviations when `inv_cov` is
    /// the chain's inverse covariance. Runs `iterations` rounds unless `tolerance` is set and the
    /// centre moves by less than that fraction of the current radius. A round that gathers no weight
    /// returns [`Error::EmptyNeighbourhood`].
    pub fn find_center<R: Rng>(
        &self,
        inv_cov: &DMatrix<f64>,
        radius: f64,
        iterations: usize,
        tolerance: Option<f64>,
        rng: &mut R,
    ) -> Result<Vec<f64>> {
        if self.is_empty() {
            return Err(Error::EmptyChain);
        }
        let mut center = self.element(rng.gen_range(0..self.len())).to_vec();
        let mut radius = radius;
        let mut sum = vec![0.0; self.n_dim];

        for iteration in 0..iterations {
            sum.fill(0.0);
            let mut weight = 0.0;
            for (p, &w) in self.points().zip(&self.w) {
                if metric_dist2(inv_cov, p, &center) < radius * radius {
                    for (s, &xk) in sum.iter_mut().zip(p) {
                        *s += w * xk;
                    }
                    weight += w;
                }
            }
            if !(weight > 0.0) {
                warn!(iteration, radius, ?center, "no weight within peak search radius");
                return Err(Error::EmptyNeighbourhood { iteration, radius });
            }

            let next: Vec<f64> = sum.iter().map(|s| s / weight).collect();
            let step = metric_dist2(inv_cov, &next, &center).sqrt();
            center = next;

            // step and radius are both in units of the metric
            if tolerance.is_some_and(|tol| step <= tol * radius) {
                debug!(iteration, step, radius, "peak search converged");
                break;
            }
            radius *= RADIUS_SHRINK;
        }
        Ok(center)
    }

    /// Centre of the heaviest cell of a histogram whose bins are `nsigma` standard deviations
    /// wide along each axis, spanning the chain bounds.
    pub fn density_peak(&self, nsigma: f64) -> Result<Vec<f64>> {
        if !(nsigma > 0.0) {
            return Err(Error::InvalidOption(format!(
                "nsigma must be positive, got {nsigma}"
            )));
        }
        if self.is_empty() {
            return Err(Error::EmptyChain);
        }

        let mut n_bins = Vec::with_capacity(self.n_dim);
        let mut width = Vec::with_capacity(self.n_dim);
        for k in 0..self.n_dim {
            let span = self.x_max[k] - self.x_min[k];
            let sigma = self.stats.cov(k, k).sqrt();
            let n = ((span / (nsigma * sigma)).ceil() as usize).max(1);
            n_bins.push(n);
            width.push(if span > 0.0 { span / n as f64 } else { 1.0 });
        }

        let mut bins: BTreeMap<Vec<usize>, f64> = BTreeMap::new();
        for (p, &w) in self.points().zip(&self.w) {
            let cell: Vec<usize> = p
                .iter()
                .enumerate()
                .map(|(k, &xk)| {
                    (((xk - self.x_min[k]) / width[k]).floor() as usize).min(n_bins[k] - 1)
                })
                .collect();
            *bins.entry(cell).or_insert(0.0) += w;
        }

        let mut best: Option<(&Vec<usize>, f64)> = None;
        for (cell, &w) in &bins {
            if best.map_or(true, |(_, w_max)| w > w_max) {
                best = Some((cell, w));
            }
        }
        let (cell, _) = best.ok_or(Error::EmptyChain)?;
        Ok(cell
            .iter()
            .enumerate()
            .map(|(k, &c)| self.x_min[k] + (c as f64 + 0.5) * width[k])
            .collect())
    }
}
