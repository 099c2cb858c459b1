//! Super-k-mer extraction.
//!
//! The splitter slides a k-window over every maximal valid-symbol run of
//! a decoded part, tracking the minimum allowed signature within the
//! window. A signature change closes the current super-k-mer and routes
//! it, through the per-bin collector, to the bin the signature maps to.
//! The same traversal, with a counting sink instead of collectors, feeds
//! the signature-statistics pass that trains the bin map.

use std::sync::Arc;

use crate::error::Result;
use crate::estimator::NtHashEstimator;
use crate::input::INVALID_SYMBOL;
use crate::kmer::MAX_X;
use crate::mapper::SignatureMapper;
use crate::pool::{MemoryPool, PoolBuffer};
use crate::queues::WorkQueue;
use crate::reader::DecodedPart;
use crate::signature::{Mmer, SignatureNorm};

/// Counter deltas a flushed bin part carries to the descriptor table.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinStatsDelta {
    /// K-mers contained in the part's super-k-mers.
    pub n_kmers: u64,
    /// (k+x)-mer records expansion will produce (upper bound in
    /// canonical mode).
    pub n_plus_x_recs: u64,
    /// Super-k-mer records in the part.
    pub n_super_kmers: u64,
}

impl BinStatsDelta {
    fn add_super_kmer(&mut self, len: usize, k: usize, both_strands: bool) {
        let n_kmers = (len - k + 1) as u64;
        self.n_kmers += n_kmers;
        self.n_super_kmers += 1;
        self.n_plus_x_recs += if both_strands {
            // Direction flips fragment records unpredictably; size for
            // the worst case.
            n_kmers
        } else {
            let additional = len - k;
            let tmp = additional.min(MAX_X);
            let rest = additional - tmp;
            (1 + rest / (MAX_X + 1) + usize::from(rest % (MAX_X + 1) != 0)) as u64
        };
    }
}

/// A filled per-bin buffer of super-k-mer records.
#[derive(Debug)]
pub struct BinPart {
    /// Destination bin.
    pub bin_id: usize,
    /// Concatenated super-k-mer records.
    pub data: PoolBuffer,
    /// Descriptor deltas for the records in `data`.
    pub stats: BinStatsDelta,
}

/// Per-bin record buffer owned by one splitter.
struct BinCollector {
    bin_id: usize,
    buffer: Option<PoolBuffer>,
    stats: BinStatsDelta,
}

impl BinCollector {
    fn put_super_kmer(
        &mut self,
        symbols: &[u8],
        k: usize,
        both_strands: bool,
        pool: &Arc<MemoryPool>,
        queue: &Arc<WorkQueue<BinPart>>,
    ) -> Result<()> {
        let needed = 1 + symbols.len().div_ceil(4);
        if self
            .buffer
            .as_ref()
            .is_some_and(|b| b.remaining() < needed)
        {
            self.flush(queue)?;
        }
        if self.buffer.is_none() {
            self.buffer = Some(pool.reserve()?);
        }
        let buffer = self
            .buffer
            .as_mut()
            .unwrap_or_else(|| unreachable!("buffer reserved above"));

        buffer.push((symbols.len() - k) as u8);
        for chunk in symbols.chunks(4) {
            let mut byte = 0u8;
            for (idx, &s) in chunk.iter().enumerate() {
                byte |= s << (6 - 2 * idx);
            }
            buffer.push(byte);
        }
        self.stats.add_super_kmer(symbols.len(), k, both_strands);
        Ok(())
    }

    fn flush(&mut self, queue: &Arc<WorkQueue<BinPart>>) -> Result<()> {
        if let Some(data) = self.buffer.take() {
            if !data.is_empty() {
                queue.push(BinPart {
                    bin_id: self.bin_id,
                    data,
                    stats: std::mem::take(&mut self.stats),
                })?;
            }
        }
        Ok(())
    }
}

/// Collapses runs of identical symbols in place.
pub fn homopolymer_compress(seq: &mut Vec<u8>) {
    if seq.len() <= 1 {
        return;
    }
    let mut write = 0;
    for read in 1..seq.len() {
        if seq[read] != seq[write] {
            write += 1;
            seq[write] = seq[read];
        }
    }
    seq.truncate(write + 1);
}

/// Walks the minimizer window over `seq`, invoking `on_run` with each
/// closed super-k-mer (the normalised signature and its symbol slice).
///
/// A run closes when a smaller signature appears, when the active
/// signature slides out of the k-window, on an invalid symbol, and at
/// the `k + 255` length cap imposed by the record's length byte.
pub fn traverse(
    seq: &[u8],
    k: usize,
    norm: &SignatureNorm,
    mut on_run: impl FnMut(u32, &[u8]) -> Result<()>,
) -> Result<()> {
    let p = norm.signature_len().get();
    debug_assert!(p <= k, "signature length must be clamped to k");
    if seq.len() < k {
        return Ok(());
    }

    let mut current_signature = Mmer::new(norm);
    let mut end_mmer = Mmer::new(norm);

    let mut i = 0usize;
    let mut len = 0usize;
    let mut signature_start_pos = 0usize;

    while i + k - 1 < seq.len() {
        // Build the first signature after an invalid symbol or at the
        // start of the part.
        let mut contains_invalid = false;
        for _ in 0..p {
            if seq[i] == INVALID_SYMBOL {
                contains_invalid = true;
                break;
            }
            i += 1;
        }
        if contains_invalid {
            i += 1;
            len = 0;
            continue;
        }
        len = p;
        signature_start_pos = i - p;
        current_signature.insert_seq(&seq[signature_start_pos..signature_start_pos + p]);
        end_mmer = current_signature;

        while i < seq.len() {
            if seq[i] == INVALID_SYMBOL {
                if len >= k {
                    on_run(current_signature.get(), &seq[i - len..i])?;
                }
                len = 0;
                i += 1;
                break;
            }
            end_mmer.insert(seq[i]);
            if end_mmer.get() < current_signature.get() {
                // A smaller signature enters the window.
                if len >= k {
                    on_run(current_signature.get(), &seq[i - len..i])?;
                    len = k - 1;
                }
                current_signature = end_mmer;
                signature_start_pos = i - p + 1;
            } else if end_mmer.get() == current_signature.get() {
                current_signature = end_mmer;
                signature_start_pos = i - p + 1;
            } else if signature_start_pos + k - 1 < i {
                // The active signature slid out of the window; rescan
                // the window for the new minimum.
                on_run(current_signature.get(), &seq[i - len..i])?;
                len = k - 1;
                signature_start_pos += 1;
                end_mmer.insert_seq(&seq[signature_start_pos..signature_start_pos + p]);
                current_signature = end_mmer;
                for j in signature_start_pos + p..=i {
                    end_mmer.insert(seq[j]);
                    if end_mmer.get() <= current_signature.get() {
                        current_signature = end_mmer;
                        signature_start_pos = j - p + 1;
                    }
                }
            }
            len += 1;
            if len == k + 255 {
                on_run(current_signature.get(), &seq[i + 1 - len..=i])?;
                i = i + 2 - k;
                len = 0;
                break;
            }
            i += 1;
        }
    }
    if len >= k {
        on_run(current_signature.get(), &seq[i - len..i])?;
    }
    Ok(())
}

/// Stage-1 splitter worker: decoded parts in, bin parts out.
#[allow(clippy::too_many_arguments)]
pub fn splitter_worker(
    parts_in: &Arc<WorkQueue<DecodedPart>>,
    bin_parts: &Arc<WorkQueue<BinPart>>,
    bin_pool: &Arc<MemoryPool>,
    mapper: &Arc<SignatureMapper>,
    norm: &Arc<SignatureNorm>,
    k: usize,
    both_strands: bool,
    homopolymer_compressed: bool,
    estimator: Option<&Arc<NtHashEstimator>>,
) -> Result<()> {
    let mut collectors: Vec<BinCollector> = (0..mapper.n_bins())
        .map(|bin_id| BinCollector {
            bin_id,
            buffer: None,
            stats: BinStatsDelta::default(),
        })
        .collect();

    let mut scratch = Vec::new();
    while let Some(part) = parts_in.pop()? {
        if let Some(estimator) = estimator {
            estimator.process(&part.data, k);
        }
        let seq: &[u8] = if homopolymer_compressed {
            scratch.clear();
            scratch.extend_from_slice(&part.data);
            homopolymer_compress(&mut scratch);
            &scratch
        } else {
            &part.data
        };
        traverse(seq, k, norm, |signature, run| {
            let bin_id = mapper.bin_id(signature);
            collectors[bin_id].put_super_kmer(run, k, both_strands, bin_pool, bin_parts)
        })?;
    }
    for collector in &mut collectors {
        collector.flush(bin_parts)?;
    }
    Ok(())
}

/// Statistics pass: accumulates per-signature k-mer counts for the bin
/// map training, without emitting anything.
pub fn stats_worker(
    parts_in: &Arc<WorkQueue<DecodedPart>>,
    norm: &Arc<SignatureNorm>,
    k: usize,
    homopolymer_compressed: bool,
    stats: &mut [u64],
) -> Result<()> {
    let mut scratch = Vec::new();
    while let Some(part) = parts_in.pop()? {
        let seq: &[u8] = if homopolymer_compressed {
            scratch.clear();
            scratch.extend_from_slice(&part.data);
            homopolymer_compress(&mut scratch);
            &scratch
        } else {
            &part.data
        };
        traverse(seq, k, norm, |signature, run| {
            stats[signature as usize] += (run.len() - k + 1) as u64;
            Ok(())
        })?;
    }
    Ok(())
}
