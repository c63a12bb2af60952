/*!
Native binary persistence for [`Chain`].

Layout, fixed-width and in native byte order:

| field          | type                     |
|----------------|--------------------------|
| `ndim`         | `u32`                    |
| `length`       | `u32`                    |
| `capacity`     | `u32`                    |
| `total_weight` | `f64`                    |
| coordinates    | `f64[ndim * length]`, point-major |
| log-likelihood | `f64[length]`            |
| weights        | `f64[length]`            |
| accumulator    | the accumulator's own block, see [`MomentAccumulator::write_binary`] |

# Examples

```rust
use chain_evidence::chain::Chain;

let mut chain = Chain::new(2, 4);
chain.append_point(&[1.0, 2.0], -0.5, 3.0);

let mut buf = Vec::new();
chain.write_binary(&mut buf)?;
let restored: Chain = Chain::read_binary(&mut buf.as_slice(), false)?;
assert_eq!(restored.len(), 1);
assert_eq!(restored.element(0), &[1.0, 2.0]);
# Ok::<(), chain_evidence::error::Error>(())
```
*/

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use tracing::debug;

use crate::chain::{Chain, WeightPolicy};
use crate::error::{Error, Result};
use crate::stats::MomentAccumulator;

/// Reads exactly `buf.len()` bytes, reporting how far a short stream got.
fn fill<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(Error::Truncated {
                    expected: buf.len(),
                    found: filled,
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

pub(crate) fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut b = [0u8; 4];
    fill(r, &mut b)?;
    Ok(u32::from_ne_bytes(b))
}

pub(crate) fn read_f64<R: Read>(r: &mut R) -> Result<f64> {
    let mut b = [0u8; 8];
    fill(r, &mut b)?;
    Ok(f64::from_ne_bytes(b))
}

/// Reads `n` values. The buffer grows with the bytes actually present, so a corrupt count
/// fails as [`Error::Truncated`] instead of allocating the claimed size up front.
pub(crate) fn read_f64_vec<R: Read>(r: &mut R, n: usize) -> Result<Vec<f64>> {
    let expected = checked_count(n, 8)?;
    let mut bytes = Vec::new();
    r.by_ref().take(expected as u64).read_to_end(&mut bytes)?;
    if bytes.len() < expected {
        return Err(Error::Truncated {
            expected,
            found: bytes.len(),
        });
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|c| f64::from_ne_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect())
}

/// `a * b` for element counts read from an untrusted header.
pub(crate) fn checked_count(a: usize, b: usize) -> Result<usize> {
    a.checked_mul(b)
        .ok_or_else(|| Error::InvalidOption(format!("stored size {a} x {b} overflows")))
}

pub(crate) fn write_u32<W: Write>(w: &mut W, v: u32) -> Result<()> {
    w.write_all(&v.to_ne_bytes())?;
    Ok(())
}

pub(crate) fn write_f64<W: Write>(w: &mut W, v: f64) -> Result<()> {
    w.write_all(&v.to_ne_bytes())?;
    Ok(())
}

pub(crate) fn write_f64_slice<W: Write>(w: &mut W, vs: &[f64]) -> Result<()> {
    for v in vs {
        w.write_all(&v.to_ne_bytes())?;
    }
    Ok(())
}

fn to_u32(v: usize, what: &str) -> Result<u32> {
    u32::try_from(v).map_err(|_| Error::InvalidOption(format!("{what} {v} does not fit in u32")))
}

impl<A: MomentAccumulator> Chain<A> {
    /// Serializes the chain followed by its accumulator block.
    pub fn write_binary<W: Write>(&self, w: &mut W) -> Result<()> {
        write_u32(w, to_u32(self.n_dim, "dimension")?)?;
        write_u32(w, to_u32(self.len(), "length")?)?;
        write_u32(w, to_u32(self.capacity, "capacity")?)?;
        write_f64(w, self.total_weight)?;
        write_f64_slice(w, &self.x)?;
        write_f64_slice(w, &self.ln_l)?;
        write_f64_slice(w, &self.w)?;
        self.stats.write_binary(w)
    }

    /// Restores a chain written by [`Chain::write_binary`].
    ///
    /// With `reserve_extra` the stored capacity is reserved; otherwise capacity equals length.
    /// Any short read or accumulator failure returns an error and no chain. Bounds are rebuilt
    /// from the coordinates; the weight policy is reset to the default.
    pub fn read_binary<R: Read>(r: &mut R, reserve_extra: bool) -> Result<Self> {
        let n_dim = read_u32(r)? as usize;
        let length = read_u32(r)? as usize;
        let stored_capacity = read_u32(r)? as usize;
        let total_weight = read_f64(r)?;
        let x = read_f64_vec(r, checked_count(n_dim, length)?)?;
        let ln_l = read_f64_vec(r, length)?;
        let w = read_f64_vec(r, length)?;
        let stats = A::read_binary(r)?;
        if stats.ndim() != n_dim {
            return Err(Error::DimensionMismatch {
                expected: n_dim,
                found: stats.ndim(),
            });
        }
        if n_dim == 0 {
            return Err(Error::InvalidOption("stored chain has zero dimensions".into()));
        }

        let mut chain = Self {
            n_dim,
            capacity: length,
            x,
            ln_l,
            w,
            total_weight,
            x_min: vec![f64::INFINITY; n_dim],
            x_max: vec![f64::NEG_INFINITY; n_dim],
            stats,
            weight_policy: WeightPolicy::default(),
        };
        if reserve_extra {
            chain.set_capacity(stored_capacity);
        }
        chain.recompute_bounds();
        Ok(chain)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut out = BufWriter::new(File::create(path.as_ref())?);
        self.write_binary(&mut out)?;
        out.flush()?;
        debug!(path = %path.as_ref().display(), length = self.len(), "saved chain");
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P, reserve_extra: bool) -> Result<Self> {
        let mut input = BufReader::new(File::open(path.as_ref())?);
        let chain = Self::read_binary(&mut input, reserve_extra)?;
        debug!(path = %path.as_ref().display(), length = chain.len(), "loaded chain");
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::WeightedMoments;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use tempfile::NamedTempFile;

    fn sample_chain() -> Chain {
        let mut rng = SmallRng::seed_from_u64(5);
        let mut chain = Chain::new(3, 10);
        for _ in 0..37 {
            let p = [rng.gen::<f64>(), rng.gen_range(-3.0..3.0), 1e6 * rng.gen::<f64>()];
            chain.append_point(&p, -rng.gen_range(0.0..50.0), rng.gen_range(0.5..3.0));
        }
        chain
    }

    #[test]
    fn save_then_load_is_exact() {
        let chain = sample_chain();
        let file = NamedTempFile::new().unwrap();
        chain.save(file.path()).unwrap();
        let restored = Chain::<WeightedMoments>::load(file.path(), true).unwrap();

        assert_eq!(restored.len(), chain.len());
        assert_eq!(restored.ndim(), chain.ndim());
        assert_eq!(restored.capacity(), chain.capacity());
        assert_eq!(restored.total_weight(), chain.total_weight());
        assert_eq!(restored.coords(), chain.coords());
        assert_eq!(restored.ln_likelihoods(), chain.ln_likelihoods());
        assert_eq!(restored.weights(), chain.weights());
        assert_eq!(restored.x_min(), chain.x_min());
        assert_eq!(restored.x_max(), chain.x_max());
        assert_eq!(restored.stats(), chain.stats());
    }

    #[test]
    fn load_without_reserve_shrinks_capacity_to_length() {
        let chain = sample_chain();
        let mut buf = Vec::new();
        chain.write_binary(&mut buf).unwrap();
        let restored = Chain::<WeightedMoments>::read_binary(&mut buf.as_slice(), false).unwrap();
        assert_eq!(restored.capacity(), restored.len());
    }

    #[test]
    fn truncated_payload_fails_cleanly() {
        let chain = sample_chain();
        let mut buf = Vec::new();
        chain.write_binary(&mut buf).unwrap();
        for cut in [2, 10, 20 + 8 * 5, buf.len() - 1] {
            let short = &buf[..cut];
            assert!(
                Chain::<WeightedMoments>::read_binary(&mut &short[..], false).is_err(),
                "cut at {cut} should fail"
            );
        }
    }

    #[test]
    fn oversized_header_fails_without_allocating() {
        for (n_dim, length) in [(u32::MAX, u32::MAX), (1, u32::MAX), (u32::MAX, 1)] {
            let mut header = Vec::new();
            write_u32(&mut header, n_dim).unwrap();
            write_u32(&mut header, length).unwrap();
            write_u32(&mut header, length).unwrap();
            write_f64(&mut header, 1.0).unwrap();
            assert_eq!(header.len(), 20);
            let err = Chain::<WeightedMoments>::read_binary(&mut header.as_slice(), true);
            assert!(
                matches!(err, Err(Error::Truncated { .. } | Error::InvalidOption(_))),
                "{n_dim} x {length}: {err:?}"
            );
        }
    }

    #[test]
    fn oversized_accumulator_block_fails_without_allocating() {
        let mut block = Vec::new();
        write_u32(&mut block, u32::MAX).unwrap();
        write_f64(&mut block, 2.0).unwrap();
        let err = WeightedMoments::read_binary(&mut block.as_slice());
        assert!(matches!(err, Err(Error::Truncated { found: 0, .. })));
    }

    #[test]
    fn mismatched_accumulator_dimension_fails() {
        let chain = sample_chain();
        let mut buf = Vec::new();
        chain.write_binary(&mut buf).unwrap();
        // the accumulator block begins right after the chain payload
        let acc_offset = 4 * 3 + 8 + 8 * (3 * chain.len() + 2 * chain.len());
        buf[acc_offset..acc_offset + 4].copy_from_slice(&2u32.to_ne_bytes());
        let err = Chain::<WeightedMoments>::read_binary(&mut buf.as_slice(), false);
        assert!(err.is_err());
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = Chain::<WeightedMoments>::load("/nonexistent/definitely/not/here.bin", false);
        assert!(matches!(err, Err(Error::Io(_))));
    }
}
