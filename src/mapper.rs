//! Signature-to-bin mapping.
//!
//! Routes every normalised signature to a bin in O(1). The map is built
//! once before stage 1 from signature-occurrence statistics (greedy bin
//! packing), from the min-hash rule `signature % num_bins`, or loaded
//! from a mapping file, and is read-only afterwards.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::{KmerBinError, Result};
use crate::signature::{is_allowed, SignatureLength};

/// How signatures were assigned to bins; stored in the database header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    /// Greedy bin packing over a sampled statistics pass.
    KmcStats,
    /// `signature % num_bins`.
    MinHash,
}

impl SignatureScheme {
    /// Header byte for the database.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        match self {
            Self::KmcStats => 0,
            Self::MinHash => 1,
        }
    }

    /// The min-hash scheme needs no stored map to recompute bin ids.
    #[must_use]
    pub fn stores_map(self) -> bool {
        matches!(self, Self::KmcStats)
    }
}

/// The signature→bin map: `4^p + 1` slots, one per normalised signature
/// plus the special sentinel.
#[derive(Debug)]
pub struct SignatureMapper {
    signature_len: SignatureLength,
    n_bins: usize,
    scheme: SignatureScheme,
    map: Vec<i32>,
}

impl SignatureMapper {
    /// Builds the map with the greedy KMC packing scheme.
    ///
    /// `stats[s]` is the number of k-mers observed with signature `s`
    /// during the training pass. Allowed signatures are sorted by
    /// decreasing count, each count biased by 1000 to smooth rare
    /// signatures, and packed into `n_bins - 1` bins; anything whose
    /// count exceeds the running mean gets a bin of its own. The special
    /// signature lands in the last assigned bin + 1.
    #[must_use]
    pub fn from_stats(signature_len: SignatureLength, n_bins: usize, stats: &[u64]) -> Self {
        let special = signature_len.special() as usize;
        let mut map = vec![-1i32; signature_len.map_size()];

        let mut sorted: Vec<u32> = (0..special as u32).collect();
        sorted.sort_by(|&a, &b| stats[b as usize].cmp(&stats[a as usize]));

        let p = signature_len.get();
        let mut remaining: Vec<(u32, u64)> = sorted
            .into_iter()
            .filter(|&s| is_allowed(s, p))
            .map(|s| (s, stats[s as usize] + 1000))
            .collect();

        let mut sum: f64 = remaining.iter().map(|&(_, c)| c as f64).sum();
        let mut mean = sum / n_bins as f64;
        let mut max_bin_size = 1.1 * mean;

        let max_bins = n_bins - 1;
        let mut n = n_bins - 1;
        let mut bin_no: i32 = 0;

        while remaining.len() > n {
            if remaining[0].1 as f64 > mean {
                let (sig, count) = remaining.remove(0);
                map[sig as usize] = bin_no;
                bin_no += 1;
                sum -= count as f64;
                mean = sum / max_bins.saturating_sub(bin_no as usize).max(1) as f64;
                max_bin_size = 1.1 * mean;
                n = n.saturating_sub(1);
            } else {
                let mut group_sum = 0.0;
                let mut kept = Vec::with_capacity(remaining.len());
                for (sig, count) in remaining.drain(..) {
                    if group_sum + (count as f64) < max_bin_size {
                        group_sum += count as f64;
                        map[sig as usize] = bin_no;
                    } else {
                        kept.push((sig, count));
                    }
                }
                remaining = kept;
                n = n.saturating_sub(1);
                bin_no += 1;
                sum -= group_sum;
                mean = sum / max_bins.saturating_sub(bin_no as usize).max(1) as f64;
                max_bin_size = 1.1 * mean;
            }
        }
        // Small signature spaces can exhaust the bins one signature at a
        // time; keep every assignment in range, spilling into the last
        // bin alongside the special sentinel.
        let last_bin = (n_bins - 1) as i32;
        for slot in map.iter_mut().filter(|slot| **slot > last_bin) {
            *slot = last_bin;
        }
        for (sig, _) in remaining {
            map[sig as usize] = bin_no.min(last_bin);
            bin_no += 1;
        }
        map[special] = bin_no.min(last_bin);

        Self {
            signature_len,
            n_bins,
            scheme: SignatureScheme::KmcStats,
            map,
        }
    }

    /// Builds the min-hash map: `map[s] = s % n_bins`.
    #[must_use]
    pub fn min_hash(signature_len: SignatureLength, n_bins: usize) -> Self {
        let map = (0..signature_len.map_size())
            .map(|s| (s % n_bins) as i32)
            .collect();
        Self {
            signature_len,
            n_bins,
            scheme: SignatureScheme::MinHash,
            map,
        }
    }

    /// Loads a serialized mapping whose header must match `signature_len`
    /// and `n_bins`.
    pub fn from_file(
        path: &Path,
        signature_len: SignatureLength,
        n_bins: usize,
    ) -> Result<Self> {
        let file = File::open(path).map_err(|e| KmerBinError::io(e, path))?;
        let mut reader = BufReader::new(file);
        let mut header = [0u8; 8];
        reader
            .read_exact(&mut header)
            .map_err(|e| KmerBinError::io(e, path))?;
        let file_p = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let file_bins = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if file_p != signature_len.get() || file_bins != n_bins {
            return Err(KmerBinError::Config(format!(
                "mapping file '{}' was built for p={file_p}, {file_bins} bins; \
                 requested p={}, {n_bins} bins",
                path.display(),
                signature_len.get(),
            )));
        }
        let mut map = vec![0i32; signature_len.map_size()];
        let mut raw = [0u8; 4];
        for slot in &mut map {
            reader
                .read_exact(&mut raw)
                .map_err(|e| KmerBinError::io(e, path))?;
            *slot = i32::from_le_bytes(raw);
        }
        Ok(Self {
            signature_len,
            n_bins,
            scheme: SignatureScheme::KmcStats,
            map,
        })
    }

    /// Serializes the map in the format [`Self::from_file`] reads.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| KmerBinError::io(e, path))?;
        let mut writer = BufWriter::new(file);
        let io = |e| KmerBinError::io(e, path);
        writer
            .write_all(&(self.signature_len.get() as u32).to_le_bytes())
            .map_err(io)?;
        writer
            .write_all(&(self.n_bins as u32).to_le_bytes())
            .map_err(io)?;
        for &slot in &self.map {
            writer.write_all(&slot.to_le_bytes()).map_err(io)?;
        }
        writer.flush().map_err(io)
    }

    /// Bin id for a normalised signature.
    #[must_use]
    pub fn bin_id(&self, signature: u32) -> usize {
        debug_assert!(
            self.map[signature as usize] >= 0,
            "signature {signature} was never assigned a bin"
        );
        self.map[signature as usize] as usize
    }

    /// Raw slot values, for storage in the database.
    #[must_use]
    pub fn raw_map(&self) -> &[i32] {
        &self.map
    }

    /// The scheme the map was built with.
    #[must_use]
    pub fn scheme(&self) -> SignatureScheme {
        self.scheme
    }

    /// Signature length the map was built for.
    #[must_use]
    pub fn signature_len(&self) -> SignatureLength {
        self.signature_len
    }

    /// Number of bins the map routes into.
    #[must_use]
    pub fn n_bins(&self) -> usize {
        self.n_bins
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::SignatureNorm;

    fn sig_len() -> SignatureLength {
        SignatureLength::new(5).unwrap()
    }

    #[test]
    fn min_hash_routes_by_modulo() {
        let mapper = SignatureMapper::min_hash(sig_len(), 64);
        assert_eq!(mapper.bin_id(0), 0);
        assert_eq!(mapper.bin_id(65), 1);
        assert_eq!(mapper.bin_id(sig_len().special()), (1024 % 64) as usize);
        assert!(!mapper.scheme().stores_map());
    }

    #[test]
    fn stats_build_assigns_every_allowed_signature() {
        let len = sig_len();
        let stats = vec![7u64; len.special() as usize];
        let mapper = SignatureMapper::from_stats(len, 64, &stats);
        let norm = SignatureNorm::new(len);
        for raw in 0..len.special() {
            let bin = mapper.bin_id(norm.norm(raw));
            assert!(bin < 64, "signature {raw} routed to out-of-range bin {bin}");
        }
    }

    #[test]
    fn stats_build_gives_heavy_signature_its_own_bin() {
        let len = sig_len();
        let mut stats = vec![1u64; len.special() as usize];
        // CGCGC-style heavy hitter, allowed on its own strand.
        let heavy = 0b01_10_01_10_01u32;
        assert!(is_allowed(heavy, 5));
        stats[heavy as usize] = 1_000_000;
        let mapper = SignatureMapper::from_stats(len, 64, &stats);

        let heavy_bin = mapper.bin_id(heavy);
        let sharing = mapper
            .raw_map()
            .iter()
            .filter(|&&b| b == heavy_bin as i32)
            .count();
        assert_eq!(sharing, 1, "heavy signature should not share its bin");
    }

    #[test]
    fn special_signature_gets_a_bin() {
        let len = sig_len();
        let stats = vec![3u64; len.special() as usize];
        let mapper = SignatureMapper::from_stats(len, 128, &stats);
        assert!(mapper.bin_id(len.special()) < 128);
    }

    #[test]
    fn mapping_file_round_trip() {
        let len = sig_len();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sig.map");
        let stats = vec![5u64; len.special() as usize];
        let mapper = SignatureMapper::from_stats(len, 64, &stats);
        mapper.write_to_file(&path).unwrap();

        let loaded = SignatureMapper::from_file(&path, len, 64).unwrap();
        assert_eq!(loaded.raw_map(), mapper.raw_map());

        let mismatch = SignatureMapper::from_file(&path, len, 128);
        assert!(mismatch.is_err());
    }
}
