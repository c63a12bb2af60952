//! Incremental weighted moments attached to every [`Chain`](crate::chain::Chain).
//!
//! [`MomentAccumulator`] is the capability a chain needs from its moment tracker; any
//! implementation can be plugged into a chain. [`WeightedMoments`] is the default, keeping
//! raw weighted sums of `x` and `x xᵀ`.

use std::io::{Read, Write};

use nalgebra::DMatrix;
use ndarray::prelude::*;

use crate::error::{Error, Result};
use crate::io::binary::{checked_count, read_f64, read_f64_vec, read_u32, write_f64, write_f64_slice, write_u32};
use crate::linalg::invert;

/// Dense covariance together with its inverse and determinant.
#[derive(Debug, Clone, PartialEq)]
pub struct Covariance {
    pub cov: DMatrix<f64>,
    pub inv_cov: DMatrix<f64>,
    pub det: f64,
}

/// Tracks the weighted mean and covariance of a stream of points.
pub trait MomentAccumulator: Clone {
    /// Dimensionality of the tracked points.
    fn ndim(&self) -> usize;

    /// Adds `x` with the given weight.
    fn add(&mut self, x: &[f64], weight: f64);

    /// Multiplies every accumulated weight by `factor`.
    fn scale(&mut self, factor: f64);

    /// Adds `factor × other` into `self`.
    fn merge_add(&mut self, other: &Self, factor: f64);

    fn clear(&mut self);

    /// Sum of the weights seen so far.
    fn total_weight(&self) -> f64;

    fn mean(&self, i: usize) -> f64;

    fn cov(&self, i: usize, j: usize) -> f64;

    /// Serializes the accumulator to `w`.
    fn write_binary<W: Write>(&self, w: &mut W) -> Result<()>;

    /// Restores an accumulator previously written by [`MomentAccumulator::write_binary`].
    fn read_binary<R: Read>(r: &mut R) -> Result<Self>;

    fn mean_vector(&self) -> Vec<f64> {
        (0..self.ndim()).map(|i| self.mean(i)).collect()
    }

    /// Dense covariance, its inverse and determinant.
    fn covariance(&self) -> Result<Covariance> {
        let n = self.ndim();
        let cov = DMatrix::from_fn(n, n, |i, j| self.cov(i, j));
        let (inv_cov, det) = invert(&cov)?;
        Ok(Covariance { cov, inv_cov, det })
    }
}

/// Raw-sum weighted moments: `Σw`, `Σw x` and `Σw x xᵀ`.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedMoments {
    n_params: usize,
    weight: f64,
    sum: Array1<f64>,    // n_params
    sum_sq: Array2<f64>, // n_params x n_params
}

impl WeightedMoments {
    pub fn new(n_params: usize) -> Self {
        Self {
            n_params,
            weight: 0.0,
            sum: Array1::zeros(n_params),
            sum_sq: Array2::zeros((n_params, n_params)),
        }
    }

    fn check_index(&self, i: usize) {
        assert!(
            i < self.n_params,
            "dimension index {i} out of range for {} parameters",
            self.n_params
        );
    }
}

impl MomentAccumulator for WeightedMoments {
    fn ndim(&self) -> usize {
        self.n_params
    }

    fn add(&mut self, x: &[f64], weight: f64) {
        assert_eq!(x.len(), self.n_params, "point has wrong dimensionality");
        let x = ArrayView1::from(x);
        self.weight += weight;
        self.sum.scaled_add(weight, &x);
        for i in 0..self.n_params {
            let wx = weight * x[i];
            for j in i..self.n_params {
                self.sum_sq[[i, j]] += wx * x[j];
            }
        }
    }

    fn scale(&mut self, factor: f64) {
        self.weight *= factor;
        self.sum *= factor;
        self.sum_sq *= factor;
    }

    fn merge_add(&mut self, other: &Self, factor: f64) {
        assert_eq!(other.n_params, self.n_params, "accumulator dimensionality differs");
        self.weight += factor * other.weight;
        self.sum.scaled_add(factor, &other.sum);
        self.sum_sq.scaled_add(factor, &other.sum_sq);
    }

    fn clear(&mut self) {
        self.weight = 0.0;
        self.sum.fill(0.0);
        self.sum_sq.fill(0.0);
    }

    fn total_weight(&self) -> f64 {
        self.weight
    }

    fn mean(&self, i: usize) -> f64 {
        self.check_index(i);
        self.sum[i] / self.weight
    }

    fn cov(&self, i: usize, j: usize) -> f64 {
        self.check_index(i);
        self.check_index(j);
        // only the upper triangle of sum_sq is populated
        let (a, b) = if i <= j { (i, j) } else { (j, i) };
        (self.sum_sq[[a, b]] - self.sum[a] * self.sum[b] / self.weight) / self.weight
    }

    fn write_binary<W: Write>(&self, w: &mut W) -> Result<()> {
        write_u32(w, self.n_params as u32)?;
        write_f64(w, self.weight)?;
        write_f64_slice(w, &self.sum.to_vec())?;
        let sum_sq: Vec<f64> = self.sum_sq.iter().copied().collect();
        write_f64_slice(w, &sum_sq)
    }

    fn read_binary<R: Read>(r: &mut R) -> Result<Self> {
        let n_params = read_u32(r)? as usize;
        let weight = read_f64(r)?;
        let sum = Array1::from(read_f64_vec(r, n_params)?);
        let sum_sq = read_f64_vec(r, checked_count(n_params, n_params)?)?;
        let sum_sq = Array2::from_shape_vec((n_params, n_params), sum_sq)
            .map_err(|e| Error::InvalidOption(format!("moment block shape: {e}")))?;
        Ok(Self {
            n_params,
            weight,
            sum,
            sum_sq,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray_stats::CorrelationExt;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn random_points(n: usize, d: usize, seed: u64) -> Array2<f64> {
        let mut rng = SmallRng::seed_from_u64(seed);
        Array2::from_shape_fn((n, d), |(_, j)| rng.gen_range(-1.0..1.0) * (j + 1) as f64)
    }

    #[test]
    fn unit_weights_match_population_covariance() {
        let pts = random_points(500, 3, 1);
        let mut acc = WeightedMoments::new(3);
        for row in pts.rows() {
            acc.add(row.as_slice().unwrap(), 1.0);
        }
        let expected_mean = pts.mean_axis(Axis(0)).unwrap();
        let expected_cov = pts.t().cov(0.0).unwrap();
        assert_abs_diff_eq!(arr1(&acc.mean_vector()), expected_mean, epsilon = 1e-12);
        for i in 0..3 {
            for j in 0..3 {
                assert_abs_diff_eq!(acc.cov(i, j), expected_cov[[i, j]], epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn integer_weight_equals_repetition() {
        let mut weighted = WeightedMoments::new(2);
        let mut repeated = WeightedMoments::new(2);
        let pts = [[0.5, 1.0], [2.0, -1.0], [1.5, 0.0]];
        for (k, p) in pts.iter().enumerate() {
            weighted.add(p, (k + 1) as f64);
            for _ in 0..=k {
                repeated.add(p, 1.0);
            }
        }
        assert_abs_diff_eq!(weighted.total_weight(), repeated.total_weight());
        for i in 0..2 {
            assert_abs_diff_eq!(weighted.mean(i), repeated.mean(i), epsilon = 1e-12);
            for j in 0..2 {
                assert_abs_diff_eq!(weighted.cov(i, j), repeated.cov(i, j), epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn scale_preserves_moments_and_merge_adds_mass() {
        let pts = random_points(100, 2, 2);
        let mut a = WeightedMoments::new(2);
        for row in pts.rows() {
            a.add(row.as_slice().unwrap(), 1.0);
        }
        let mean_before = a.mean_vector();
        let cov_before = a.cov(0, 1);
        a.scale(0.25);
        assert_abs_diff_eq!(a.total_weight(), 25.0, epsilon = 1e-12);
        assert_abs_diff_eq!(a.mean(0), mean_before[0], epsilon = 1e-12);
        assert_abs_diff_eq!(a.cov(0, 1), cov_before, epsilon = 1e-12);

        let b = a.clone();
        a.merge_add(&b, 3.0);
        assert_abs_diff_eq!(a.total_weight(), 100.0, epsilon = 1e-12);
        assert_abs_diff_eq!(a.mean(1), mean_before[1], epsilon = 1e-12);
    }

    #[test]
    fn covariance_returns_inverse_and_determinant() {
        let mut acc = WeightedMoments::new(2);
        for p in [[1.0, 0.0], [-1.0, 0.0], [0.0, 2.0], [0.0, -2.0]] {
            acc.add(&p, 1.0);
        }
        let c = acc.covariance().unwrap();
        assert_abs_diff_eq!(c.cov[(0, 0)], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(c.cov[(1, 1)], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(c.det, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(c.inv_cov[(0, 0)], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn binary_round_trip_is_exact() {
        let pts = random_points(20, 3, 3);
        let mut acc = WeightedMoments::new(3);
        for row in pts.rows() {
            acc.add(row.as_slice().unwrap(), 2.5);
        }
        let mut buf = Vec::new();
        acc.write_binary(&mut buf).unwrap();
        let restored = WeightedMoments::read_binary(&mut buf.as_slice()).unwrap();
        assert_eq!(restored, acc);
    }

    #[test]
    fn truncated_binary_is_rejected() {
        let mut acc = WeightedMoments::new(2);
        acc.add(&[1.0, 2.0], 1.0);
        let mut buf = Vec::new();
        acc.write_binary(&mut buf).unwrap();
        buf.truncate(buf.len() - 3);
        assert!(matches!(
            WeightedMoments::read_binary(&mut buf.as_slice()),
            Err(Error::Truncated { .. })
        ));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_index_panics() {
        let acc = WeightedMoments::new(2);
        acc.mean(2);
    }
}
