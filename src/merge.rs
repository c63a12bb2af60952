/*!
# Evidence-Weighted Chain Merging

Independent runs over the same posterior generally come with unknown relative normalisation.
[`Chain::merge`] combines two chains either by plain concatenation or, with
[`MergeOptions::reweight`], by first estimating each chain's evidence and scaling the
lower-evidence chain's weights by

\[
f = e^{\ln Z_{\text{low}} - \ln Z_{\text{high}}} \; \frac{W_{\text{high}}}{W_{\text{low}}}
\]

so that the two runs contribute in proportion to their evidence. A chain whose factor drops
below [`MergeOptions::threshold`] is discarded instead of diluting the pool.

## Example

```rust
use chain_evidence::chain::Chain;
use chain_evidence::merge::MergeOptions;
use rand::{rngs::SmallRng, SeedableRng};

let mut a = Chain::new(1, 4);
a.append_point(&[0.0], -1.0, 1.0);
let mut b = Chain::new(1, 4);
b.append_point(&[2.0], -2.0, 3.0);

let mut rng = SmallRng::seed_from_u64(0);
let outcome = a.merge(&b, &MergeOptions::default(), &mut rng).unwrap();
assert_eq!(outcome.ln_z, None);
assert_eq!(a.len(), 2);
assert_eq!(a.total_weight(), 4.0);
assert_eq!(a.x_max(), &[2.0]);
```
*/

use rand::Rng;
use tracing::{debug, info, warn};

use crate::chain::{Chain, GROWTH};
use crate::error::{Error, Result};
use crate::evidence::EvidenceOptions;
use crate::stats::MomentAccumulator;

/// Tuning of [`Chain::merge`] and [`merge_all`].
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOptions {
    /// Scale the chains by their estimated evidence before combining them.
    pub reweight: bool,
    /// Factor below which a chain is dropped rather than merged. Only used when reweighting.
    pub threshold: f64,
    pub evidence: EvidenceOptions,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            reweight: false,
            threshold: 1e-5,
            evidence: EvidenceOptions::default(),
        }
    }
}

impl MergeOptions {
    pub fn with_reweight(mut self, reweight: bool) -> Self {
        self.reweight = reweight;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_evidence(mut self, evidence: EvidenceOptions) -> Self {
        self.evidence = evidence;
        self
    }
}

/// What happened to the receiving chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAction {
    /// The incoming points were appended.
    Appended,
    /// The receiving chain fell below the threshold and was replaced by the incoming one.
    Replaced,
    /// The incoming chain fell below the threshold and was ignored.
    Dropped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// Combined `ln Z`; `None` without reweighting.
    pub ln_z: Option<f64>,
    pub ln_z_self: Option<f64>,
    pub ln_z_other: Option<f64>,
    /// Scale applied to the receiving chain's weights.
    pub factor_self: f64,
    /// Scale applied to the incoming chain's weights.
    pub factor_other: f64,
    pub action: MergeAction,
}

/// `ln(e^a + e^b)` without overflow.
fn ln_add_exp(a: f64, b: f64) -> f64 {
    let m = a.max(b);
    if m == f64::NEG_INFINITY {
        return m;
    }
    m + ((a - m).exp() + (b - m).exp()).ln()
}

impl<A: MomentAccumulator> Chain<A> {
    /// Merges `other` into `self`.
    ///
    /// Without reweighting this is concatenation: weights, accumulators and total weights add.
    /// With reweighting both evidences are estimated first; if either is degenerate the error is
    /// returned and `self` is left untouched. Panics if the dimensionalities differ.
    pub fn merge<R: Rng>(
        &mut self,
        other: &Chain<A>,
        opts: &MergeOptions,
        rng: &mut R,
    ) -> Result<MergeOutcome> {
        assert_eq!(
            self.n_dim, other.n_dim,
            "cannot merge chains of different dimensionality"
        );
        if !opts.reweight {
            self.absorb(other, 1.0, 1.0);
            return Ok(MergeOutcome {
                ln_z: None,
                ln_z_self: None,
                ln_z_other: None,
                factor_self: 1.0,
                factor_other: 1.0,
                action: MergeAction::Appended,
            });
        }

        let ln_z_other = other.ln_z_harmonic(&opts.evidence, rng)?.ln_z;
        let ln_z_self = self.ln_z_harmonic(&opts.evidence, rng)?.ln_z;
        Ok(self.merge_weighted(other, ln_z_self, ln_z_other, opts.threshold))
    }

    /// Evidence-weighted merge with both evidences already known.
    fn merge_weighted(
        &mut self,
        other: &Chain<A>,
        ln_z_self: f64,
        ln_z_other: f64,
        threshold: f64,
    ) -> MergeOutcome {
        let (factor_self, factor_other) = if ln_z_self > ln_z_other {
            (
                1.0,
                (ln_z_other - ln_z_self).exp() * self.total_weight / other.total_weight,
            )
        } else {
            (
                (ln_z_self - ln_z_other).exp() * other.total_weight / self.total_weight,
                1.0,
            )
        };
        let ln_z = ln_add_exp(factor_self.ln() + ln_z_self, factor_other.ln() + ln_z_other)
            - (factor_self + factor_other).ln();
        debug!(ln_z_self, ln_z_other, factor_self, factor_other, ln_z, "merge factors");

        let action = if factor_self < threshold {
            *self = other.clone();
            MergeAction::Replaced
        } else if factor_other < threshold {
            MergeAction::Dropped
        } else {
            self.absorb(other, factor_self, factor_other);
            MergeAction::Appended
        };

        MergeOutcome {
            ln_z: Some(ln_z),
            ln_z_self: Some(ln_z_self),
            ln_z_other: Some(ln_z_other),
            factor_self,
            factor_other,
            action,
        }
    }

    /// Appends `other`, scaling existing weights by `factor_self` and incoming ones by
    /// `factor_other`.
    fn absorb(&mut self, other: &Chain<A>, factor_self: f64, factor_other: f64) {
        let combined = self.len() + other.len();
        if self.capacity < combined {
            self.set_capacity((GROWTH * combined as f64) as usize);
        }
        let old_len = self.len();
        self.x.extend_from_slice(&other.x);
        self.ln_l.extend_from_slice(&other.ln_l);
        self.w.extend_from_slice(&other.w);
        if factor_self != 1.0 {
            self.w[..old_len].iter_mut().for_each(|w| *w *= factor_self);
        }
        if factor_other != 1.0 {
            self.w[old_len..].iter_mut().for_each(|w| *w *= factor_other);
        }

        self.stats.scale(factor_self);
        self.stats.merge_add(&other.stats, factor_other);
        self.total_weight = factor_self * self.total_weight + factor_other * other.total_weight;
        for k in 0..self.n_dim {
            self.x_min[k] = self.x_min[k].min(other.x_min[k]);
            self.x_max[k] = self.x_max[k].max(other.x_max[k]);
        }
    }
}

/// Result of folding several runs with [`merge_all`].
#[derive(Debug, Clone, PartialEq)]
pub struct MergedRuns<A: MomentAccumulator> {
    pub chain: Chain<A>,
    /// Combined `ln Z` of the kept runs when reweighting; a single kept run reports its own
    /// estimate. `None` without reweighting.
    pub ln_z: Option<f64>,
    /// Indices of runs left out because their evidence could not be estimated.
    pub skipped: Vec<usize>,
}

/// Folds independent runs into a single chain, in order.
///
/// With reweighting, each run's evidence is estimated before it is merged; runs whose estimate
/// is degenerate (see [`Error::is_degenerate`]) are skipped with a warning. Returns
/// [`Error::EmptyChain`] if no run survives.
pub fn merge_all<A, R, I>(runs: I, opts: &MergeOptions, rng: &mut R) -> Result<MergedRuns<A>>
where
    A: MomentAccumulator,
    R: Rng,
    I: IntoIterator<Item = Chain<A>>,
{
    let mut merged: Option<Chain<A>> = None;
    let mut ln_z = None;
    let mut skipped = Vec::new();

    for (index, run) in runs.into_iter().enumerate() {
        let ln_z_run = if opts.reweight {
            match run.ln_z_harmonic(&opts.evidence, rng) {
                Ok(ev) => Some(ev.ln_z),
                Err(e) if e.is_degenerate() => {
                    warn!(index, error = %e, "skipping run with unusable evidence");
                    skipped.push(index);
                    continue;
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        let Some(chain) = merged.as_mut() else {
            merged = Some(run);
            ln_z = ln_z_run;
            continue;
        };
        match ln_z_run {
            Some(ln_z_other) => {
                let ln_z_self = chain.ln_z_harmonic(&opts.evidence, rng)?.ln_z;
                let outcome = chain.merge_weighted(&run, ln_z_self, ln_z_other, opts.threshold);
                ln_z = outcome.ln_z;
            }
            None => chain.absorb(&run, 1.0, 1.0),
        }
    }

    let chain = merged.ok_or(Error::EmptyChain)?;
    info!(
        length = chain.len(),
        skipped = skipped.len(),
        ?ln_z,
        "merged runs"
    );
    Ok(MergedRuns {
        chain,
        ln_z,
        skipped,
    })
}
