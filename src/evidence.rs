/*!
# Bounded Harmonic-Mean Evidence

Estimates the Bayesian evidence `ln Z` of a [`Chain`] with the harmonic-mean estimator
regularised by an ellipsoid (Gelfand & Dey 1994; Robert & Wraith 2009). The regulator is
uniform inside the ellipsoid `(x - μ)ᵀ Σ⁻¹ (x - μ) ≤ nsigma²` and zero outside, which gives the
estimator finite variance:

\[
Z \approx \frac{V \, \sum_i w_i}{\sum_{i \in E} w_i / L_i},
\qquad
V = \sqrt{\det \Sigma}\; \frac{2 (\sqrt{\pi}\, n_\sigma)^N}{N \, \Gamma(N/2)}
\]

Only the `chain_frac` nearest points with finite log-likelihood are considered; the
ellipsoid radius is the distance of the farthest one, clamped to `nsigma_max`.

## Example

```rust
use chain_evidence::chain::Chain;
use chain_evidence::evidence::EvidenceOptions;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

let mut rng = SmallRng::seed_from_u64(42);
let mut chain = Chain::new(2, 5_000);
for _ in 0..5_000 {
    let x: [f64; 2] = [rng.sample(StandardNormal), rng.sample(StandardNormal)];
    // ln L = ln N(x; 0, I), so ln Z = 0 under a unit flat prior
    let ln_l = -0.5 * (x[0] * x[0] + x[1] * x[1]) - (2.0 * std::f64::consts::PI).ln();
    chain.append_point(&x, ln_l, 1.0);
}
let opts = EvidenceOptions::default().with_use_peak(false).with_chain_frac(0.5);
let evidence = chain.ln_z_harmonic(&opts, &mut rng).unwrap();
assert!(evidence.ln_z.abs() < 0.1);
```
*/

use std::fmt;

use rand::Rng;
use tracing::{debug, warn};

use crate::chain::Chain;
use crate::error::{Error, Result};
use crate::linalg::{ln_gamma_half, metric_dist2};
use crate::stats::MomentAccumulator;

/// Running sum of `w / L` above which accumulation stops.
const SUM_INV_L_MAX: f64 = 1e100;

/// Number of nearest points reported in [`EvidenceDiagnostics`].
const DIAGNOSTIC_POINTS: usize = 10;

/// Tuning of [`Chain::ln_z_harmonic`].
#[derive(Debug, Clone, PartialEq)]
pub struct EvidenceOptions {
    /// Centre the ellipsoid on a density peak instead of the weighted mean.
    pub use_peak: bool,
    /// Upper bound on the ellipsoid radius, in standard deviations.
    pub nsigma_max: f64,
    /// Initial search radius of the peak locator, in standard deviations.
    pub nsigma_peak: f64,
    /// Fraction of the finite-likelihood points, nearest first, that may enter the ellipsoid.
    pub chain_frac: f64,
    pub peak_iterations: usize,
    /// Optional early stop for the peak locator on relative centre movement.
    pub peak_tolerance: Option<f64>,
}

impl Default for EvidenceOptions {
    fn default() -> Self {
        Self {
            use_peak: true,
            nsigma_max: 1.0,
            nsigma_peak: 0.1,
            chain_frac: 0.05,
            peak_iterations: 5,
            peak_tolerance: None,
        }
    }
}

impl EvidenceOptions {
    pub fn with_use_peak(mut self, use_peak: bool) -> Self {
        self.use_peak = use_peak;
        self
    }

    pub fn with_nsigma_max(mut self, nsigma_max: f64) -> Self {
        self.nsigma_max = nsigma_max;
        self
    }

    pub fn with_nsigma_peak(mut self, nsigma_peak: f64) -> Self {
        self.nsigma_peak = nsigma_peak;
        self
    }

    pub fn with_chain_frac(mut self, chain_frac: f64) -> Self {
        self.chain_frac = chain_frac;
        self
    }

    pub fn with_peak_iterations(mut self, iterations: usize) -> Self {
        self.peak_iterations = iterations;
        self
    }

    pub fn with_peak_tolerance(mut self, tolerance: f64) -> Self {
        self.peak_tolerance = Some(tolerance);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.chain_frac > 0.0 && self.chain_frac <= 1.0) {
            return Err(Error::InvalidOption(format!(
                "chain_frac must lie in (0, 1], got {}",
                self.chain_frac
            )));
        }
        if !(self.nsigma_max > 0.0) {
            return Err(Error::InvalidOption(format!(
                "nsigma_max must be positive, got {}",
                self.nsigma_max
            )));
        }
        if self.use_peak && !(self.nsigma_peak > 0.0) {
            return Err(Error::InvalidOption(format!(
                "nsigma_peak must be positive, got {}",
                self.nsigma_peak
            )));
        }
        Ok(())
    }
}

/// A finite evidence estimate and how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct Evidence {
    pub ln_z: f64,
    /// Centre of the regulating ellipsoid.
    pub center: Vec<f64>,
    /// Radius of the ellipsoid actually used, in standard deviations.
    pub nsigma: f64,
    /// Points with a finite log-likelihood.
    pub n_finite: usize,
    /// Points that contributed to the harmonic sum.
    pub n_used: usize,
    /// Log-likelihood of the nearest point, used as the stabilising offset.
    pub ln_l_0: f64,
}

/// Context reported when the estimate is NaN or infinite.
#[derive(Debug, Clone, PartialEq)]
pub struct EvidenceDiagnostics {
    pub ln_z: f64,
    /// Harmonic sum relative to `exp(-ln_l_0)`.
    pub sum_inv_l: f64,
    pub ln_l_0: f64,
    pub ln_volume: f64,
    pub total_weight: f64,
    pub nsigma: f64,
    pub center: Vec<f64>,
    /// `(index, squared distance)` of the nearest points.
    pub nearest: Vec<(usize, f64)>,
}

impl fmt::Display for EvidenceDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ln Z = {} (sum_invL = e^({}) * {}, ln V = {}, total_weight = {}, nsigma = {}, center = {:?}, nearest = {:?})",
            self.ln_z,
            -self.ln_l_0,
            self.sum_inv_l,
            self.ln_volume,
            self.total_weight,
            self.nsigma,
            self.center,
            self.nearest
        )
    }
}

/// `ln` of the volume of the ellipsoid of radius `nsigma` under a covariance with
/// determinant `det_cov`, in `n` dimensions.
pub fn ln_ellipsoid_volume(det_cov: f64, nsigma: f64, n: usize) -> f64 {
    let n_f = n as f64;
    0.5 * det_cov.ln() + 2f64.ln() + n_f * (std::f64::consts::PI.sqrt() * nsigma).ln()
        - n_f.ln()
        - ln_gamma_half(n)
}

impl<A: MomentAccumulator> Chain<A> {
    /// Estimates `ln Z` with the bounded harmonic mean.
    ///
    /// `rng` is only drawn from when `opts.use_peak` is set. A NaN or infinite estimate is
    /// returned as [`Error::DegenerateEvidence`] carrying diagnostics.
    pub fn ln_z_harmonic<R: Rng>(&self, opts: &EvidenceOptions, rng: &mut R) -> Result<Evidence> {
        opts.validate()?;
        if self.is_empty() {
            return Err(Error::EmptyChain);
        }

        let cov = self.stats.covariance()?;
        let center = if opts.use_peak {
            self.find_center(
                &cov.inv_cov,
                opts.nsigma_peak,
                opts.peak_iterations,
                opts.peak_tolerance,
                rng,
            )?
        } else {
            self.stats.mean_vector()
        };

        let mut sorted: Vec<(usize, f64)> = (0..self.len())
            .filter(|&i| self.ln_l[i].is_finite())
            .map(|i| (i, metric_dist2(&cov.inv_cov, self.element(i), &center)))
            .collect();
        let n_finite = sorted.len();
        if n_finite == 0 {
            return Err(Error::EmptyChain);
        }
        let npoints = ((opts.chain_frac * n_finite as f64) as usize).clamp(1, n_finite);
        sorted.select_nth_unstable_by(npoints - 1, |a, b| a.1.total_cmp(&b.1));
        sorted[..npoints].sort_unstable_by(|a, b| a.1.total_cmp(&b.1));

        let ln_l_0 = self.ln_l[sorted[0].0];
        let mut nsigma = sorted[npoints - 1].1.sqrt();
        let mut sum_inv_l = 0.0;
        let mut n_used = 0;
        for (k, &(i, dist2)) in sorted[..npoints].iter().enumerate() {
            if dist2 > opts.nsigma_max * opts.nsigma_max {
                nsigma = opts.nsigma_max;
                break;
            }
            let inv_l = self.w[i] * (-(self.ln_l[i] - ln_l_0)).exp();
            if k != 0 && inv_l + sum_inv_l > SUM_INV_L_MAX {
                nsigma = sorted[k - 1].1.sqrt();
                break;
            }
            sum_inv_l += inv_l;
            n_used += 1;
        }

        let ln_volume = ln_ellipsoid_volume(cov.det, nsigma, self.n_dim);
        let ln_z = ln_volume - sum_inv_l.ln() + self.total_weight.ln() + ln_l_0;

        if !ln_z.is_finite() {
            // only the first npoints are ordered so far
            let n_report = DIAGNOSTIC_POINTS.min(n_finite);
            if n_report > npoints {
                sorted.select_nth_unstable_by(n_report - 1, |a, b| a.1.total_cmp(&b.1));
                sorted[..n_report].sort_unstable_by(|a, b| a.1.total_cmp(&b.1));
            }
            let diagnostics = EvidenceDiagnostics {
                ln_z,
                sum_inv_l,
                ln_l_0,
                ln_volume,
                total_weight: self.total_weight,
                nsigma,
                center,
                nearest: sorted[..n_report].to_vec(),
            };
            warn!(%diagnostics, "degenerate evidence estimate");
            return Err(Error::DegenerateEvidence(Box::new(diagnostics)));
        }

        debug!(ln_z, nsigma, n_used, n_finite, "estimated evidence");
        Ok(Evidence {
            ln_z,
            center,
            nsigma,
            n_finite,
            n_used,
            ln_l_0,
        })
    }
}
