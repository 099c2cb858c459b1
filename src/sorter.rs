//! Stage-2 bin sorting.
//!
//! Sorter workers pull bin ids (largest first), reserve arena space,
//! load the bin's temp file, expand super-k-mers to (k+x)-mer records,
//! radix-sort, compact, and emit the bin's LUT counts and suffix bytes
//! to the completer. A bin that cannot fit the arena in strict-memory
//! mode is deferred to the strict engine; the completer still receives
//! a placeholder so bin-id ordering never stalls.

use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::arena::{BinArena, BinRegionRequest};
use crate::bins::{BinCounters, BinDescriptorTable};
use crate::dispatch_kmer_width;
use crate::error::{KmerBinError, Result};
use crate::kmer::PackedKmer;
use crate::kxmer::{
    expand_all, expand_canonical, merge_sorted_kxmers, pre_compact, KxmerShape, SuperKmerIter,
};
use crate::queues::{SequencedQueue, WorkQueue};
use crate::radix::{radix_sort, sorting_phases};

/// Cutoff, clamp, and layout parameters shared by stage 2 and the
/// strict engine.
#[derive(Debug, Clone, Copy)]
pub struct SortParams {
    /// K-mer length.
    pub k: usize,
    /// Stage-2 word width, `ceil((k + MAX_X + 1)/32)`.
    pub kxmer_words: usize,
    /// Canonical counting.
    pub both_strands: bool,
    /// Records with fewer occurrences are dropped.
    pub cutoff_min: u32,
    /// Records with more occurrences are dropped.
    pub cutoff_max: u64,
    /// Stored counts are clamped here.
    pub counter_max: u64,
    /// Bytes per stored counter.
    pub counter_size: usize,
    /// Symbols resolved through the prefix LUT.
    pub lut_prefix_len: usize,
}

impl SortParams {
    /// Bytes of packed suffix per record.
    #[must_use]
    pub fn suffix_bytes(&self) -> usize {
        if self.lut_prefix_len == 0 {
            // KFF path: the whole k-mer, top byte left-padded.
            self.k.div_ceil(4)
        } else {
            (self.k - self.lut_prefix_len) / 4
        }
    }

    /// LUT entries per bin.
    #[must_use]
    pub fn lut_entries(&self) -> usize {
        1 << (2 * self.lut_prefix_len)
    }
}

/// Per-bin filter counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputStats {
    /// Distinct k-mers seen (kept or dropped).
    pub n_unique: u64,
    /// Distinct k-mers dropped for count < cutoff_min.
    pub n_cutoff_min: u64,
    /// Distinct k-mers dropped for count > cutoff_max.
    pub n_cutoff_max: u64,
    /// Total k-mer occurrences.
    pub n_total: u64,
}

/// One bin's sorted, filtered output.
#[derive(Debug)]
pub struct SortedBin {
    /// Suffix + counter records, in k-mer order.
    pub suffix_data: Vec<u8>,
    /// Per-prefix record counts (not yet prefix-summed).
    pub lut: Vec<u64>,
    /// Filter accounting.
    pub stats: OutputStats,
}

/// What the completer receives per bin.
#[derive(Debug)]
pub enum BinOutput {
    /// Sorted in the arena.
    Sorted(SortedBin),
    /// Rerouted to the strict-memory engine; output follows in stage 2.
    Deferred,
}

/// Applies cutoffs and clamping while appending suffix records.
pub struct SuffixWriter {
    params: SortParams,
    lut: Vec<u64>,
    data: Vec<u8>,
    stats: OutputStats,
}

impl SuffixWriter {
    /// An empty writer for one bin.
    #[must_use]
    pub fn new(params: SortParams) -> Self {
        Self {
            params,
            lut: vec![0; params.lut_entries()],
            data: Vec::new(),
            stats: OutputStats::default(),
        }
    }

    /// Pre-sizes the record buffer.
    pub fn reserve(&mut self, n_records: usize) {
        let rec = self.params.suffix_bytes() + self.params.counter_size;
        self.data.reserve(n_records * rec);
    }

    /// Accounts one distinct k-mer and stores it if it survives the
    /// cutoff filter.
    pub fn push<const W: usize>(&mut self, kmer: PackedKmer<W>, count: u64) {
        let p = &self.params;
        self.stats.n_total += count;
        self.stats.n_unique += 1;
        if count < u64::from(p.cutoff_min) {
            self.stats.n_cutoff_min += 1;
            return;
        }
        if count > p.cutoff_max {
            self.stats.n_cutoff_max += 1;
            return;
        }
        let count = count.min(p.counter_max);

        let suffix_bytes = p.suffix_bytes();
        if p.lut_prefix_len > 0 {
            let prefix = kmer.remove_suffix(2 * (p.k - p.lut_prefix_len));
            self.lut[prefix] += 1;
        } else {
            self.lut[0] += 1;
        }
        for j in (0..suffix_bytes).rev() {
            self.data.push(kmer.get_byte(j));
        }
        for j in 0..p.counter_size {
            self.data.push(((count >> (8 * j)) & 0xff) as u8);
        }
    }

    /// Finishes the bin.
    #[must_use]
    pub fn into_sorted_bin(self) -> SortedBin {
        SortedBin {
            suffix_data: self.data,
            lut: self.lut,
            stats: self.stats,
        }
    }
}

/// Sorter worker: one bin at a time, width-dispatched.
pub fn sorter_worker(
    bin_queue: &Arc<WorkQueue<usize>>,
    table: &Arc<BinDescriptorTable>,
    arena: &Arc<BinArena>,
    output: &Arc<SequencedQueue<BinOutput>>,
    deferred: &Arc<Mutex<Vec<usize>>>,
    params: SortParams,
) -> Result<()> {
    while let Some(bin_id) = bin_queue.pop()? {
        let counters = table.counters(bin_id)?;
        dispatch_kmer_width!(params.kxmer_words, |W| sort_bin::<W>(
            bin_id, counters, table, arena, output, deferred, params
        ))?;
    }
    Ok(())
}

fn sort_bin<const W: usize>(
    bin_id: usize,
    counters: BinCounters,
    table: &Arc<BinDescriptorTable>,
    arena: &Arc<BinArena>,
    output: &Arc<SequencedQueue<BinOutput>>,
    deferred: &Arc<Mutex<Vec<usize>>>,
    params: SortParams,
) -> Result<()> {
    let shape: KxmerShape<W> = KxmerShape::new(params.k);
    let record_bytes = (W * 8) as u64;
    let request = BinRegionRequest {
        input_file: counters.size,
        kxmers: counters.n_plus_x_recs * record_bytes,
        sort_tmp: counters.n_plus_x_recs * record_bytes,
        suffix_out: counters.n_kmers
            * (params.suffix_bytes() + params.counter_size) as u64,
        lut: (params.lut_entries() * 8) as u64,
        kxmer_counters: counters.n_plus_x_recs * 4,
        sorting_phases: sorting_phases(shape.significant_bits()),
    };

    let Some(regions) = arena.init(bin_id, &request)? else {
        trace!(bin_id, "bin exceeds the arena, deferring to strict engine");
        deferred
            .lock()
            .map_err(|_| KmerBinError::InternalInvariant("deferred list poisoned".into()))?
            .push(bin_id);
        return output.push(bin_id, BinOutput::Deferred);
    };
    trace!(bin_id, bytes = request.total(), "bin admitted to arena");

    let data = table.read_all(bin_id)?;
    table.release(bin_id)?;

    let mut records: Vec<PackedKmer<W>> =
        Vec::with_capacity(usize::try_from(counters.n_plus_x_recs).unwrap_or(0));
    let mut iter = SuperKmerIter::new(&data, params.k);
    while let Some(symbols) = iter.next_record() {
        if params.both_strands {
            expand_canonical(&shape, symbols, &mut records);
        } else {
            expand_all(&shape, symbols, &mut records);
        }
    }
    drop(data);
    if records.len() as u64 > counters.n_plus_x_recs {
        return Err(KmerBinError::InternalInvariant(format!(
            "bin {bin_id} expanded to {} records, descriptor promised at most {}",
            records.len(),
            counters.n_plus_x_recs
        )));
    }

    let mut tmp = Vec::new();
    radix_sort(&mut records, &mut tmp, shape.significant_bits());
    drop(tmp);

    let mut multiplicities = Vec::new();
    let compacted = pre_compact(&mut records, &mut multiplicities);

    let mut writer = SuffixWriter::new(params);
    writer.reserve(compacted);
    merge_sorted_kxmers(&shape, &records, &multiplicities, |kmer, count| {
        writer.push(kmer, count);
        Ok(())
    })?;
    let sorted = writer.into_sorted_bin();
    debug!(
        bin_id,
        n_unique = sorted.stats.n_unique,
        n_records = compacted,
        "bin sorted"
    );
    output.push(bin_id, BinOutput::Sorted(sorted))?;
    drop(regions);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kmer::MAX_X;
    use crate::queues::ErrorBroker;

    fn params(k: usize, lut_prefix_len: usize) -> SortParams {
        SortParams {
            k,
            kxmer_words: (k + MAX_X + 1).div_ceil(32),
            both_strands: false,
            cutoff_min: 1,
            cutoff_max: 1_000_000_000,
            counter_max: 255,
            counter_size: 1,
            lut_prefix_len,
        }
    }

    fn pack<const W: usize>(text: &str) -> PackedKmer<W> {
        let symbols: Vec<u8> = text
            .bytes()
            .map(|b| match b {
                b'A' => 0,
                b'C' => 1,
                b'G' => 2,
                _ => 3,
            })
            .collect();
        PackedKmer::from_symbols(&symbols)
    }

    #[test]
    fn suffix_writer_filters_and_clamps() {
        let mut p = params(6, 2);
        p.cutoff_min = 2;
        p.cutoff_max = 10;
        p.counter_max = 4;
        let mut writer = SuffixWriter::new(p);

        writer.push::<1>(pack("AAAACG"), 1); // below min
        writer.push::<1>(pack("AAAAGG"), 3); // kept
        writer.push::<1>(pack("CCAAGG"), 7); // kept, clamped to 4
        writer.push::<1>(pack("GGAAGG"), 11); // above max

        let bin = writer.into_sorted_bin();
        assert_eq!(bin.stats.n_unique, 4);
        assert_eq!(bin.stats.n_cutoff_min, 1);
        assert_eq!(bin.stats.n_cutoff_max, 1);
        assert_eq!(bin.stats.n_total, 22);

        // Two records of (6-2)/4 = 1 suffix byte + 1 counter byte.
        assert_eq!(bin.suffix_data.len(), 4);
        assert_eq!(bin.suffix_data[1], 3);
        assert_eq!(bin.suffix_data[3], 4);
        // LUT counts by 2-symbol prefix: AA once, CC once.
        assert_eq!(bin.lut[0b0000], 1);
        assert_eq!(bin.lut[0b0101], 1);
        let total_kept: u64 = bin.lut.iter().sum();
        assert_eq!(total_kept, 2);
    }

    #[test]
    fn suffix_bytes_for_kff_cover_whole_kmer() {
        let p = params(10, 0);
        assert_eq!(p.suffix_bytes(), 3);
        assert_eq!(p.lut_entries(), 1);
    }

    #[test]
    fn sort_bin_end_to_end_single_bin() {
        use crate::bins::BinCounters;

        let dir = tempfile::tempdir().unwrap();
        let broker = ErrorBroker::new();
        let table = Arc::new(crate::bins::BinDescriptorTable::new(1, dir.path(), true));

        // Super-k-mer ACGTACG with k=5: 3 k-mers.
        let symbols: Vec<u8> = "ACGTACG"
            .bytes()
            .map(|b| match b {
                b'A' => 0,
                b'C' => 1,
                b'G' => 2,
                _ => 3,
            })
            .collect();
        let mut record = vec![2u8]; // additional = 2
        for chunk in symbols.chunks(4) {
            let mut byte = 0u8;
            for (i, &s) in chunk.iter().enumerate() {
                byte |= s << (6 - 2 * i);
            }
            record.push(byte);
        }
        table
            .write_segment(
                0,
                &record,
                BinCounters {
                    size: record.len() as u64,
                    n_kmers: 3,
                    n_plus_x_recs: 1,
                    n_super_kmers: 1,
                },
            )
            .unwrap();

        let arena = BinArena::new(1 << 20, false, Arc::clone(&broker));
        let output = SequencedQueue::new(1, Arc::clone(&broker));
        let deferred = Arc::new(Mutex::new(Vec::new()));
        let bin_queue = WorkQueue::new(1, 4, Arc::clone(&broker));
        bin_queue.push(0).unwrap();
        bin_queue.mark_completed();

        let p = SortParams {
            lut_prefix_len: 1,
            ..params(5, 1)
        };
        sorter_worker(&bin_queue, &table, &arena, &output, &deferred, p).unwrap();
        output.mark_completed();

        let (bin_id, out) = output.pop().unwrap().unwrap();
        assert_eq!(bin_id, 0);
        let BinOutput::Sorted(sorted) = out else {
            panic!("expected sorted output");
        };
        assert_eq!(sorted.stats.n_unique, 3);
        assert_eq!(sorted.stats.n_total, 3);
        // (5-1)/4 = 1 suffix byte + 1 counter byte per record.
        assert_eq!(sorted.suffix_data.len(), 6);
        assert!(deferred.lock().unwrap().is_empty());
        assert_eq!(arena.in_use(), 0);
    }

    #[test]
    fn strict_arena_defers_oversized_bin() {
        use crate::bins::BinCounters;

        let dir = tempfile::tempdir().unwrap();
        let broker = ErrorBroker::new();
        let table = Arc::new(crate::bins::BinDescriptorTable::new(1, dir.path(), true));
        table
            .write_segment(
                0,
                &[0u8, 0b00011011, 0, 0], // one tiny record, padded
                BinCounters {
                    size: 4,
                    n_kmers: 1,
                    n_plus_x_recs: 1_000_000, // inflated so the request exceeds the arena
                    n_super_kmers: 1,
                },
            )
            .unwrap();

        let arena = BinArena::new(1024, true, Arc::clone(&broker));
        let output = SequencedQueue::new(1, Arc::clone(&broker));
        let deferred = Arc::new(Mutex::new(Vec::new()));
        let bin_queue = WorkQueue::new(1, 4, Arc::clone(&broker));
        bin_queue.push(0).unwrap();
        bin_queue.mark_completed();

        sorter_worker(&bin_queue, &table, &arena, &output, &deferred, params(4, 1)).unwrap();
        output.mark_completed();

        let (_, out) = output.pop().unwrap().unwrap();
        assert!(matches!(out, BinOutput::Deferred));
        assert_eq!(deferred.lock().unwrap().as_slice(), &[0]);
    }
}
