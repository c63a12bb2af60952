//! A small pipeline demo: for a handful of independent synthetic "pixels", generate several
//! posterior runs, merge them with evidence weighting, compress the result into a Gaussian
//! mixture and persist it.
//!
//! Set `RUST_LOG=debug` to see merge factors and EM progress.

use std::error::Error;
use std::f64::consts::PI;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chain_evidence::chain::Chain;
use chain_evidence::evidence::EvidenceOptions;
use chain_evidence::gmm::GaussianMixture;
use chain_evidence::merge::{merge_all, MergeOptions};

const N_PIXELS: usize = 8;
const RUNS_PER_PIXEL: usize = 4;
const SAMPLES_PER_RUN: usize = 20_000;
const N_DIM: usize = 3;
const N_COMPONENTS: usize = 3;
const EM_ITERATIONS: usize = 50;
const SEED: u64 = 42;

/// One run: draws from an axis-aligned Gaussian posterior whose likelihood is normalised to
/// `ln_z`, with an occasional NaN likelihood as emitted by failed model evaluations.
fn synthetic_run(center: &[f64], scale: &[f64], ln_z: f64, rng: &mut SmallRng) -> Chain {
    let mut chain = Chain::new(center.len(), SAMPLES_PER_RUN);
    let log_norm: f64 = scale.iter().map(|s| -0.5 * (2.0 * PI).ln() - s.ln()).sum();
    for _ in 0..SAMPLES_PER_RUN {
        let z: Vec<f64> = (0..center.len())
            .map(|_| rng.sample::<f64, _>(StandardNormal))
            .collect();
        let x: Vec<f64> = z
            .iter()
            .zip(center)
            .zip(scale)
            .map(|((zi, c), s)| c + s * zi)
            .collect();
        let chi2: f64 = z.iter().map(|zi| zi * zi).sum();
        let ln_l = if rng.gen::<f64>() < 1e-3 {
            f64::NAN
        } else {
            ln_z + log_norm - 0.5 * chi2
        };
        chain.append_point(&x, ln_l, 1.0);
    }
    chain
}

struct PixelSummary {
    pixel: usize,
    length: usize,
    ln_z: Option<f64>,
    skipped: usize,
    mixture_weights: Vec<f64>,
}

fn process_pixel(pixel: usize, pb: &ProgressBar) -> Result<PixelSummary, chain_evidence::error::Error> {
    let mut rng = SmallRng::seed_from_u64(SEED + pixel as u64);
    let center: Vec<f64> = (0..N_DIM).map(|_| rng.gen_range(-2.0..2.0)).collect();
    let scale: Vec<f64> = (0..N_DIM).map(|_| rng.gen_range(0.1..1.0)).collect();

    let mut runs = Vec::with_capacity(RUNS_PER_PIXEL);
    for _ in 0..RUNS_PER_PIXEL {
        // reruns disagree on normalisation by a few nats
        let ln_z = -10.0 + rng.gen_range(-3.0..3.0);
        runs.push(synthetic_run(&center, &scale, ln_z, &mut rng));
        pb.inc(1);
    }

    let opts = MergeOptions::default()
        .with_reweight(true)
        .with_evidence(EvidenceOptions::default().with_chain_frac(0.1));
    let merged = merge_all(runs, &opts, &mut rng)?;
    pb.inc(1);

    let mut gm = GaussianMixture::new(N_DIM, N_COMPONENTS).set_seed(SEED + pixel as u64);
    merged.chain.fit_gaussian_mixture(&mut gm, EM_ITERATIONS)?;
    pb.inc(1);

    let path = std::env::temp_dir().join(format!("chain-evidence-demo-{pixel}.bin"));
    merged.chain.save(&path)?;
    pb.finish_with_message("done");

    Ok(PixelSummary {
        pixel,
        length: merged.chain.len(),
        ln_z: merged.ln_z,
        skipped: merged.skipped.len(),
        mixture_weights: gm.weights().to_vec(),
    })
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let multi = MultiProgress::new();
    let pb_style = ProgressStyle::default_bar()
        .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?
        .progress_chars("##-");

    let results: Vec<_> = (0..N_PIXELS)
        .into_par_iter()
        .map(|pixel| {
            let pb = multi.add(ProgressBar::new((RUNS_PER_PIXEL + 2) as u64));
            pb.set_prefix(format!("Pixel {pixel}"));
            pb.set_style(pb_style.clone());
            (pixel, process_pixel(pixel, &pb))
        })
        .collect();

    for (pixel, result) in results {
        match result {
            Ok(s) => info!(
                pixel = s.pixel,
                length = s.length,
                ln_z = ?s.ln_z,
                skipped = s.skipped,
                weights = ?s.mixture_weights,
                "pixel finished"
            ),
            // a degenerate pixel is reported and the remaining pixels carry on
            Err(e) if e.is_degenerate() => warn!(pixel, error = %e, "pixel skipped"),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
