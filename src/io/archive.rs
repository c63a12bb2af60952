/*!
# Archive Export

Writes a finished chain as three GZIP-compressed Parquet tables under `root/group/`:

- `coords.parquet`: one `Float32` column per dimension, named after the axis,
- `weights.parquet`: a single `weight` column (`Float32`),
- `ln_p.parquet`: a single `ln_p` column aligned with the coordinates.

Every table's Arrow schema carries the chain record as metadata: `dim_names` (comma
separated), `total_weight` (printed as `f32`), `ndim` and `length`.

With `subsample = Some(n)`, `n` rows are drawn with replacement in proportion to each point's
integer weight (`trunc(w)`), and the exported weights are all `1.0`. Single precision is lossy
by design; use [`Chain::save`](crate::chain::Chain::save) for exact snapshots.

# Example

```rust
use chain_evidence::chain::Chain;
use chain_evidence::io::archive::{export_archive, ArchiveOptions};
use rand::{rngs::SmallRng, SeedableRng};

let mut chain = Chain::new(2, 4);
chain.append_point(&[1.0, 2.0], -0.5, 3.0);
chain.append_point(&[0.5, 1.0], -1.0, 1.0);

let dir = std::env::temp_dir().join("chain_evidence_doc_archive");
let opts = ArchiveOptions::new(vec!["DM".into(), "EBV".into()]).with_compression(5);
let summary = export_archive(&chain, &dir, "star 0", &opts, &mut SmallRng::seed_from_u64(1))?;
assert_eq!(summary.rows, 2);
# Ok::<(), chain_evidence::error::Error>(())
```
*/

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::{
    array::{ArrayRef, Float32Builder},
    datatypes::{DataType, Field, Schema},
    record_batch::RecordBatch,
};
use parquet::{
    arrow::ArrowWriter,
    basic::{Compression, GzipLevel},
    file::properties::WriterProperties,
};
use rand::Rng;
use tracing::debug;

use crate::chain::Chain;
use crate::error::{Error, Result};
use crate::stats::MomentAccumulator;

/// Options for [`export_archive`].
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveOptions {
    /// Axis names, one per dimension. Empty means `dim_0`, `dim_1`, ...
    pub dim_names: Vec<String>,
    /// GZIP level, `0..=9`.
    pub compression: u32,
    /// Number of weighted draws to export instead of the full chain.
    pub subsample: Option<usize>,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            dim_names: Vec::new(),
            compression: 9,
            subsample: None,
        }
    }
}

impl ArchiveOptions {
    pub fn new(dim_names: Vec<String>) -> Self {
        Self {
            dim_names,
            ..Self::default()
        }
    }

    pub fn with_compression(mut self, level: u32) -> Self {
        self.compression = level;
        self
    }

    pub fn with_subsample(mut self, n: usize) -> Self {
        self.subsample = Some(n);
        self
    }
}

/// What [`export_archive`] wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveSummary {
    pub group_dir: PathBuf,
    pub rows: usize,
}

/// Exports `chain` under `root/group`. Invalid options are rejected before anything is written.
pub fn export_archive<A, R>(
    chain: &Chain<A>,
    root: &Path,
    group: &str,
    opts: &ArchiveOptions,
    rng: &mut R,
) -> Result<ArchiveSummary>
where
    A: MomentAccumulator,
    R: Rng,
{
    if opts.compression > 9 {
        return Err(Error::InvalidCompression(opts.compression));
    }
    let level = GzipLevel::try_new(opts.compression)?;
    let n_dim = chain.ndim();
    let dim_names: Vec<String> = if opts.dim_names.is_empty() {
        (0..n_dim).map(|i| format!("dim_{i}")).collect()
    } else if opts.dim_names.len() == n_dim {
        opts.dim_names.clone()
    } else {
        return Err(Error::DimensionMismatch {
            expected: n_dim,
            found: opts.dim_names.len(),
        });
    };

    let rows: Vec<usize> = match opts.subsample {
        Some(n) => weighted_draws(chain.weights(), n, rng)?,
        None => (0..chain.len()).collect(),
    };

    let mut metadata = HashMap::new();
    metadata.insert("dim_names".to_string(), dim_names.join(","));
    metadata.insert(
        "total_weight".to_string(),
        (chain.total_weight() as f32).to_string(),
    );
    metadata.insert("ndim".to_string(), n_dim.to_string());
    metadata.insert("length".to_string(), chain.len().to_string());

    let group_dir = root.join(group);
    fs::create_dir_all(&group_dir)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::GZIP(level))
        .build();

    // Coordinates
    let mut dim_builders: Vec<Float32Builder> =
        (0..n_dim).map(|_| Float32Builder::with_capacity(rows.len())).collect();
    for &i in &rows {
        for (builder, &v) in dim_builders.iter_mut().zip(chain.element(i)) {
            builder.append_value(v as f32);
        }
    }
    let columns: Vec<ArrayRef> = dim_builders
        .into_iter()
        .map(|mut b| Arc::new(b.finish()) as ArrayRef)
        .collect();
    write_table(
        &group_dir.join("coords.parquet"),
        &dim_names,
        columns,
        &metadata,
        &props,
    )?;

    // Weights
    let mut w_builder = Float32Builder::with_capacity(rows.len());
    for &i in &rows {
        let w = if opts.subsample.is_some() {
            1.0
        } else {
            chain.weight(i) as f32
        };
        w_builder.append_value(w);
    }
    write_table(
        &group_dir.join("weights.parquet"),
        &["weight".to_string()],
        vec![Arc::new(w_builder.finish()) as ArrayRef],
        &metadata,
        &props,
    )?;

    // Log-likelihoods
    let mut l_builder = Float32Builder::with_capacity(rows.len());
    for &i in &rows {
        l_builder.append_value(chain.ln_likelihood(i) as f32);
    }
    write_table(
        &group_dir.join("ln_p.parquet"),
        &["ln_p".to_string()],
        vec![Arc::new(l_builder.finish()) as ArrayRef],
        &metadata,
        &props,
    )?;

    debug!(group, rows = rows.len(), level = opts.compression, "exported chain archive");
    Ok(ArchiveSummary {
        group_dir,
        rows: rows.len(),
    })
}

/// Draws `n` indices with replacement, proportional to `trunc(w)`.
fn weighted_draws<R: Rng>(weights: &[f64], n: usize, rng: &mut R) -> Result<Vec<usize>> {
    let mut cumulative = Vec::with_capacity(weights.len());
    let mut total: u64 = 0;
    for &w in weights {
        total += w.max(0.0).trunc() as u64;
        cumulative.push(total);
    }
    if total == 0 {
        return Err(Error::EmptyChain);
    }
    Ok((0..n)
        .map(|_| {
            let u = rng.gen_range(0..total);
            cumulative.partition_point(|&c| c <= u)
        })
        .collect())
}

fn write_table(
    path: &Path,
    names: &[String],
    columns: Vec<ArrayRef>,
    metadata: &HashMap<String, String>,
    props: &WriterProperties,
) -> Result<()> {
    let fields: Vec<Field> = names
        .iter()
        .map(|name| Field::new(name, DataType::Float32, false))
        .collect();
    let schema = Arc::new(Schema::new_with_metadata(fields, metadata.clone()));
    let batch = RecordBatch::try_new(schema.clone(), columns)?;

    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, schema, Some(props.clone()))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Float32Array;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;
    use tempfile::tempdir;

    fn read_column(path: &Path, col: usize) -> (Vec<f32>, HashMap<String, String>) {
        let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path).unwrap()).unwrap();
        let metadata = builder.schema().metadata().clone();
        let mut values = Vec::new();
        for batch in builder.build().unwrap() {
            let batch = batch.unwrap();
            let arr = batch
                .column(col)
                .as_any()
                .downcast_ref::<Float32Array>()
                .expect("Expected Float32 column");
            values.extend(arr.values().iter().copied());
        }
        (values, metadata)
    }

    fn small_chain() -> Chain {
        let mut chain = Chain::new(2, 4);
        chain.append_point(&[1.0, 10.0], -1.0, 2.0);
        chain.append_point(&[2.0, 20.0], -2.0, 0.5);
        chain.append_point(&[3.0, 30.0], -3.0, 3.0);
        chain
    }

    #[test]
    fn full_export_round_trips_in_single_precision() {
        let dir = tempdir().unwrap();
        let chain = small_chain();
        let opts = ArchiveOptions::new(vec!["a".into(), "b".into()]).with_compression(3);
        let mut rng = SmallRng::seed_from_u64(0);
        let summary = export_archive(&chain, dir.path(), "pixel 1", &opts, &mut rng).unwrap();
        assert_eq!(summary.rows, 3);

        let (xs, meta) = read_column(&summary.group_dir.join("coords.parquet"), 0);
        let (ys, _) = read_column(&summary.group_dir.join("coords.parquet"), 1);
        assert_eq!(xs, vec![1.0, 2.0, 3.0]);
        assert_eq!(ys, vec![10.0, 20.0, 30.0]);
        assert_eq!(meta["dim_names"], "a,b");
        assert_eq!(meta["ndim"], "2");
        assert_eq!(meta["length"], "3");
        assert_eq!(meta["total_weight"], "5.5");

        let (ws, _) = read_column(&summary.group_dir.join("weights.parquet"), 0);
        assert_eq!(ws, vec![2.0, 0.5, 3.0]);
        let (lp, _) = read_column(&summary.group_dir.join("ln_p.parquet"), 0);
        assert_eq!(lp, vec![-1.0, -2.0, -3.0]);
    }

    #[test]
    fn subsample_uses_unit_weights_and_skips_fractional_points() {
        let dir = tempdir().unwrap();
        let chain = small_chain();
        let opts = ArchiveOptions::default().with_subsample(200);
        let mut rng = SmallRng::seed_from_u64(9);
        let summary = export_archive(&chain, dir.path(), "g", &opts, &mut rng).unwrap();
        assert_eq!(summary.rows, 200);

        let (ws, _) = read_column(&summary.group_dir.join("weights.parquet"), 0);
        assert!(ws.iter().all(|w| *w == 1.0));
        let (xs, _) = read_column(&summary.group_dir.join("coords.parquet"), 0);
        let (lp, _) = read_column(&summary.group_dir.join("ln_p.parquet"), 0);
        // trunc(0.5) = 0, so the middle point never appears
        assert!(xs.iter().all(|x| *x == 1.0 || *x == 3.0));
        for (x, l) in xs.iter().zip(&lp) {
            assert_eq!(*l, -*x);
        }
        let threes = xs.iter().filter(|x| **x == 3.0).count();
        assert!(threes > 80 && threes < 160, "got {threes} draws of the heavier point");
    }

    #[test]
    fn out_of_range_compression_writes_nothing() {
        let dir = tempdir().unwrap();
        let chain = small_chain();
        let opts = ArchiveOptions::default().with_compression(10);
        let mut rng = SmallRng::seed_from_u64(0);
        let err = export_archive(&chain, dir.path(), "g", &opts, &mut rng);
        assert!(matches!(err, Err(Error::InvalidCompression(10))));
        assert!(!dir.path().join("g").exists());
    }

    #[test]
    fn wrong_number_of_axis_names_is_rejected() {
        let dir = tempdir().unwrap();
        let chain = small_chain();
        let opts = ArchiveOptions::new(vec!["only one".into()]);
        let mut rng = SmallRng::seed_from_u64(0);
        let err = export_archive(&chain, dir.path(), "g", &opts, &mut rng);
        assert!(matches!(err, Err(Error::DimensionMismatch { .. })));
    }
}
