//! Distinct-k-mer estimation.
//!
//! A pluggable observer on the stage-1 traversal: every k-window of the
//! decoded parts is hashed with a rolling ntHash, a fixed fraction of
//! hash space is sampled into a shared table, and the sample is scaled
//! back up into a count histogram. The pipeline only consumes one number
//! from it (the expected distinct-k-mer count, which sizes the LUT
//! prefix); the histogram itself can be written out for `-e`/`-E` runs.

use std::fs::File;
use std::hash::BuildHasherDefault;
use std::io::{BufWriter, Write};
use std::path::Path;

use dashmap::DashMap;
use rustc_hash::FxHasher;
use tracing::info;

use crate::error::{KmerBinError, Result};
use crate::input::INVALID_SYMBOL;

/// ntHash base seeds for A, C, G, T.
const NT_SEEDS: [u64; 4] = [
    0x3c8b_fbb3_95c6_0474,
    0x3193_c185_62a0_2b4c,
    0x2032_3ed0_8257_2324,
    0x2955_49f5_4be2_4456,
];

/// Sample 1 in 2^SAMPLE_BITS of hash space.
const SAMPLE_BITS: u32 = 6;

type DashFx = DashMap<u64, u64, BuildHasherDefault<FxHasher>>;

/// Shared rolling-hash sampler.
pub struct NtHashEstimator {
    sampled: DashFx,
    both_strands: bool,
}

/// Scaled estimation results.
#[derive(Debug, Clone)]
pub struct Estimate {
    /// Expected number of distinct k-mers.
    pub n_unique: u64,
    /// `histogram[c]` estimates how many distinct k-mers occur exactly
    /// `c` times; index 0 is unused.
    pub histogram: Vec<u64>,
}

impl Estimate {
    /// Distinct k-mers expected to survive the cutoff filter.
    #[must_use]
    pub fn n_unique_in_range(&self, cutoff_min: u32, cutoff_max: u64) -> u64 {
        let start = (cutoff_min as usize).max(1);
        let end = usize::try_from(cutoff_max.saturating_add(1))
            .unwrap_or(usize::MAX)
            .min(self.histogram.len());
        if start >= end {
            return 0;
        }
        self.histogram[start..end].iter().sum()
    }
}

impl NtHashEstimator {
    /// Creates an estimator; `both_strands` folds each window with its
    /// reverse complement before hashing.
    #[must_use]
    pub fn new(both_strands: bool) -> Self {
        Self {
            sampled: DashMap::with_hasher(BuildHasherDefault::<FxHasher>::default()),
            both_strands,
        }
    }

    /// Hashes every k-window of a decoded part, sampling into the table.
    pub fn process(&self, codes: &[u8], k: usize) {
        if k == 0 {
            return;
        }
        let mask = (1u64 << SAMPLE_BITS) - 1;
        let mut fwd = 0u64;
        let mut rev = 0u64;
        let mut run = 0usize;
        for (i, &code) in codes.iter().enumerate() {
            if code == INVALID_SYMBOL {
                run = 0;
                fwd = 0;
                rev = 0;
                continue;
            }
            if run >= k {
                let out = codes[i - k];
                fwd = fwd.rotate_left(1)
                    ^ NT_SEEDS[out as usize].rotate_left(k as u32 % 64)
                    ^ NT_SEEDS[code as usize];
                rev = rev.rotate_right(1)
                    ^ NT_SEEDS[(3 - out) as usize].rotate_right(1)
                    ^ NT_SEEDS[(3 - code) as usize].rotate_left(k as u32 - 1);
            } else {
                fwd = fwd.rotate_left(1) ^ NT_SEEDS[code as usize];
                rev ^= NT_SEEDS[(3 - code) as usize].rotate_left(run as u32);
                run += 1;
            }
            if run >= k {
                let hash = if self.both_strands { fwd.min(rev) } else { fwd };
                if hash & mask == 0 {
                    *self.sampled.entry(hash).or_insert(0) += 1;
                }
            }
        }
    }

    /// Scales the sample back to a full-space estimate.
    #[must_use]
    pub fn estimate(&self) -> Estimate {
        let scale = 1u64 << SAMPLE_BITS;
        let mut histogram = vec![0u64; 256];
        let mut n_unique = 0u64;
        for entry in self.sampled.iter() {
            n_unique += scale;
            let count = usize::try_from(*entry.value()).unwrap_or(usize::MAX);
            let slot = count.min(histogram.len() - 1);
            histogram[slot] += scale;
        }
        Estimate {
            n_unique,
            histogram,
        }
    }

    /// Writes the histogram as `count<TAB>frequency` lines.
    pub fn write_histogram(&self, path: &Path) -> Result<()> {
        let estimate = self.estimate();
        let file = File::create(path).map_err(|e| KmerBinError::io(e, path))?;
        let mut out = BufWriter::new(file);
        for (count, &freq) in estimate.histogram.iter().enumerate().skip(1) {
            if freq > 0 {
                writeln!(out, "{count}\t{freq}").map_err(|e| KmerBinError::io(e, path))?;
            }
        }
        out.flush().map_err(|e| KmerBinError::io(e, path))?;
        info!(
            path = %path.display(),
            n_unique = estimate.n_unique,
            "estimated k-mer histogram written"
        );
        Ok(())
    }
}
