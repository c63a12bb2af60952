//! Chain persistence: exact native binary snapshots and (feature `parquet`) a compressed,
//! single-precision archive export for downstream consumers.

pub mod binary;

#[cfg(feature = "parquet")]
pub mod archive;
