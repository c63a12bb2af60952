//! Error type shared by every module of the crate.

use thiserror::Error;

use crate::evidence::EvidenceDiagnostics;

/// Failures surfaced by chain aggregation, evidence estimation, mixture fitting and I/O.
///
/// Contract violations (merging chains of different dimensionality, appending a point of the
/// wrong length) are not represented here; they panic, as the caller is expected to validate
/// shapes up front.
#[derive(Debug, Error)]
pub enum Error {
    /// LU inversion failed even after loading the diagonal.
    #[error("singular {dim}x{dim} matrix: inversion failed after {attempts} attempts")]
    SingularMatrix { dim: usize, attempts: usize },

    #[error("dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    /// The chain holds no usable points (empty, or every log-likelihood non-finite).
    #[error("chain contains no usable points")]
    EmptyChain,

    /// The mean-shift iteration gathered no points inside the search radius.
    #[error("no chain points within radius {radius} on peak iteration {iteration}")]
    EmptyNeighbourhood { iteration: usize, radius: f64 },

    /// ln(Z) came out NaN or infinite. Callers should skip the chain rather than use it.
    #[error("degenerate evidence estimate: {0}")]
    DegenerateEvidence(Box<EvidenceDiagnostics>),

    /// An EM component received zero responsibility mass.
    #[error("mixture component {component} starved of responsibility on round {iteration}")]
    ComponentStarved { component: usize, iteration: usize },

    #[error("invalid compression level {0}, expected 0..=9")]
    InvalidCompression(u32),

    #[error("invalid option: {0}")]
    InvalidOption(String),

    /// The persisted byte stream ended before the declared payload was read.
    #[error("truncated chain data: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[cfg(feature = "parquet")]
    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),

    #[cfg(feature = "parquet")]
    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),
}

impl Error {
    /// Whether the error marks a numerically unusable chain or fit, as opposed to bad input or
    /// I/O. Drivers skip such units of work and carry on.
    pub fn is_degenerate(&self) -> bool {
        matches!(
            self,
            Error::SingularMatrix { .. }
                | Error::EmptyChain
                | Error::EmptyNeighbourhood { .. }
                | Error::DegenerateEvidence(_)
                | Error::ComponentStarved { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
