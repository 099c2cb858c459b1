//! Strict-memory fallback engine.
//!
//! Bins too large for the arena are processed in bounded chunks: the
//! reader streams the bin's temp file pack by pack (packs align to the
//! storer's write segments, so records never straddle a pack), the
//! uncompactor expands each pack into (k+x)-mer chunks of fixed
//! capacity, sorter threads sort and locally merge each chunk, and a
//! writer persists every chunk as one sub-bin — a sorted run on disk —
//! in chunk order through an ordered-push queue. A k-way merger then
//! streams the sub-bins, summing equal k-mers, and hands the result to
//! the completer's stage-2 entry point.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::bins::BinDescriptorTable;
use crate::dispatch_kmer_width;
use crate::error::{KmerBinError, Result};
use crate::kmer::PackedKmer;
use crate::kxmer::{
    expand_all, expand_canonical, merge_sorted_kxmers, pre_compact, KxmerShape, SuperKmerIter,
};
use crate::queues::{ErrorBroker, OrderedPushQueue, WorkQueue};
use crate::radix::{radix_sort, sorting_phases};
use crate::sorter::{SortParams, SortedBin, SuffixWriter};

/// Strict-engine sizing.
#[derive(Debug, Clone, Copy)]
pub struct StrictBudget {
    /// (k+x)-mer records held in memory per chunk.
    pub chunk_records: usize,
    /// Chunk-sorting worker threads.
    pub n_sorting_threads: usize,
}

/// Processes one oversized bin within the strict budget.
pub fn process_bin(
    bin_id: usize,
    table: &Arc<BinDescriptorTable>,
    params: SortParams,
    tmp_dir: &Path,
    budget: StrictBudget,
    broker: &Arc<ErrorBroker>,
) -> Result<SortedBin> {
    dispatch_kmer_width!(params.kxmer_words, |W| process_bin_impl::<W>(
        bin_id, table, params, tmp_dir, budget, broker
    ))
}

fn record_bytes<const W: usize>() -> usize {
    W * 8 + 8
}

fn serialize_run<const W: usize>(
    sorted: &[PackedKmer<W>],
    counters: &[u32],
    shape: &KxmerShape<W>,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    merge_sorted_kxmers(shape, sorted, counters, |kmer, count| {
        for i in 0..W * 8 {
            out.push(kmer.get_byte(i));
        }
        out.extend_from_slice(&count.to_le_bytes());
        Ok(())
    })?;
    Ok(out)
}

fn process_bin_impl<const W: usize>(
    bin_id: usize,
    table: &Arc<BinDescriptorTable>,
    params: SortParams,
    tmp_dir: &Path,
    budget: StrictBudget,
    broker: &Arc<ErrorBroker>,
) -> Result<SortedBin> {
    if budget.chunk_records < 512 {
        let counters = table.counters(bin_id)?;
        return Err(KmerBinError::Capacity {
            bin_id,
            required: counters.n_plus_x_recs * (W as u64) * 8,
            available: (budget.chunk_records * W * 8) as u64,
        });
    }
    let shape: KxmerShape<W> = KxmerShape::new(params.k);
    let segments = table.segments(bin_id)?;

    type Chunk<const W: usize> = (u64, Vec<PackedKmer<W>>);
    let chunks: Arc<WorkQueue<Chunk<W>>> = WorkQueue::new(
        1,
        budget.n_sorting_threads.max(1) * 2,
        Arc::clone(broker),
    );
    let runs: Arc<OrderedPushQueue<Vec<u8>>> =
        OrderedPushQueue::new(budget.n_sorting_threads.max(1), Arc::clone(broker));

    let sub_bin_paths = std::thread::scope(|scope| -> Result<Vec<PathBuf>> {
        let mut sorter_handles = Vec::new();
        for _ in 0..budget.n_sorting_threads.max(1) {
            let chunks = Arc::clone(&chunks);
            let runs = Arc::clone(&runs);
            sorter_handles.push(scope.spawn(move || -> Result<()> {
                let shape: KxmerShape<W> = KxmerShape::new(params.k);
                let result = (|| {
                    while let Some((turn, mut records)) = chunks.pop()? {
                        let mut tmp = Vec::new();
                        radix_sort(&mut records, &mut tmp, shape.significant_bits());
                        let mut counters = Vec::new();
                        let _ = pre_compact(&mut records, &mut counters);
                        let run = serialize_run(&records, &counters, &shape)?;
                        runs.push(turn, run)?;
                    }
                    Ok(())
                })();
                runs.mark_completed();
                result
            }));
        }

        let writer = scope.spawn(|| -> Result<Vec<PathBuf>> {
            let mut paths = Vec::new();
            while let Some(run) = runs.pop()? {
                let path = tmp_dir.join(format!("kmc_sub_{bin_id:05}_{:04}.bin", paths.len()));
                let file = File::create(&path).map_err(|e| KmerBinError::io(e, &path))?;
                let mut out = BufWriter::new(file);
                out.write_all(&run).map_err(|e| KmerBinError::io(e, &path))?;
                out.flush().map_err(|e| KmerBinError::io(e, &path))?;
                paths.push(path);
            }
            Ok(paths)
        });

        // Reader + uncompactor: packs are whole write segments, so
        // every pack is a clean record sequence.
        let feed = || -> Result<()> {
            let mut chunk: Vec<PackedKmer<W>> = Vec::with_capacity(budget.chunk_records);
            let mut turn = 0u64;
            for &(start, end) in &segments {
                let pack = table.read_span(bin_id, start, end)?;
                let mut iter = SuperKmerIter::new(&pack, params.k);
                while let Some(symbols) = iter.next_record() {
                    if params.both_strands {
                        expand_canonical(&shape, symbols, &mut chunk);
                    } else {
                        expand_all(&shape, symbols, &mut chunk);
                    }
                    if chunk.len() >= budget.chunk_records {
                        chunks.push((
                            turn,
                            std::mem::replace(
                                &mut chunk,
                                Vec::with_capacity(budget.chunk_records),
                            ),
                        ))?;
                        turn += 1;
                    }
                }
            }
            if !chunk.is_empty() {
                chunks.push((turn, chunk))?;
            }
            Ok(())
        };
        let fed = feed();
        chunks.mark_completed();

        let mut first_err = match fed {
            Ok(()) => None,
            Err(err) => {
                broker.report(KmerBinError::InternalInvariant(format!(
                    "strict reader failed for bin {bin_id}"
                )));
                Some(err)
            }
        };
        for handle in sorter_handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) if first_err.is_none() => first_err = Some(err),
                Ok(Err(_)) => {}
                Err(_) if first_err.is_none() => {
                    first_err = Some(KmerBinError::InternalInvariant(
                        "strict sorter panicked".into(),
                    ));
                }
                Err(_) => {}
            }
        }
        let paths = writer
            .join()
            .map_err(|_| KmerBinError::InternalInvariant("strict writer panicked".into()))?;
        match first_err {
            Some(err) => Err(err),
            None => paths,
        }
    })?;

    table.release(bin_id)?;
    debug!(bin_id, sub_bins = sub_bin_paths.len(), "strict sub-bins written");

    let sorted = merge_sub_bins::<W>(&sub_bin_paths, params)?;
    for path in &sub_bin_paths {
        std::fs::remove_file(path).map_err(|e| KmerBinError::io(e, path))?;
    }
    info!(
        bin_id,
        n_unique = sorted.stats.n_unique,
        "strict-memory bin merged"
    );
    Ok(sorted)
}

struct SubBinStream<const W: usize> {
    reader: BufReader<File>,
    path: PathBuf,
}

impl<const W: usize> SubBinStream<W> {
    fn next(&mut self) -> Result<Option<(PackedKmer<W>, u64)>> {
        let mut buf = vec![0u8; record_bytes::<W>()];
        match self.reader.read_exact(&mut buf) {
            Ok(()) => {
                let mut kmer = PackedKmer::zero();
                for (i, &byte) in buf[..W * 8].iter().enumerate() {
                    kmer.set_byte(i, byte);
                }
                let count = u64::from_le_bytes(
                    buf[W * 8..].try_into().unwrap_or([0; 8]),
                );
                Ok(Some((kmer, count)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(KmerBinError::io(e, &self.path)),
        }
    }
}

/// K-way merge over the sorted sub-bin runs, summing equal k-mers,
/// stable in sub-bin order.
fn merge_sub_bins<const W: usize>(paths: &[PathBuf], params: SortParams) -> Result<SortedBin> {
    use std::cmp::Reverse;
    use std::collections::BinaryHeap;

    let mut streams: Vec<SubBinStream<W>> = Vec::with_capacity(paths.len());
    for path in paths {
        let file = File::open(path).map_err(|e| KmerBinError::io(e, path))?;
        streams.push(SubBinStream {
            reader: BufReader::with_capacity(1 << 16, file),
            path: path.clone(),
        });
    }

    let mut heap: BinaryHeap<Reverse<(PackedKmer<W>, usize, u64)>> = BinaryHeap::new();
    for (id, stream) in streams.iter_mut().enumerate() {
        if let Some((kmer, count)) = stream.next()? {
            heap.push(Reverse((kmer, id, count)));
        }
    }

    let mut writer = SuffixWriter::new(params);
    let mut current: Option<(PackedKmer<W>, u64)> = None;
    while let Some(Reverse((kmer, id, count))) = heap.pop() {
        match current {
            Some((value, total)) if value == kmer => current = Some((value, total + count)),
            Some((value, total)) => {
                writer.push(value, total);
                current = Some((kmer, count));
            }
            None => current = Some((kmer, count)),
        }
        if let Some((next, next_count)) = streams[id].next()? {
            heap.push(Reverse((next, id, next_count)));
        }
    }
    if let Some((value, total)) = current {
        writer.push(value, total);
    }
    Ok(writer.into_sorted_bin())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bins::BinCounters;
    use crate::kmer::MAX_X;
    use std::collections::BTreeMap;

    fn codes(text: &str) -> Vec<u8> {
        text.bytes()
            .map(|b| match b {
                b'A' => 0,
                b'C' => 1,
                b'G' => 2,
                _ => 3,
            })
            .collect()
    }

    fn pack_record(symbols: &[u8], k: usize) -> Vec<u8> {
        let mut rec = vec![(symbols.len() - k) as u8];
        for chunk in symbols.chunks(4) {
            let mut byte = 0u8;
            for (i, &s) in chunk.iter().enumerate() {
                byte |= s << (6 - 2 * i);
            }
            rec.push(byte);
        }
        rec
    }

    fn params(k: usize) -> SortParams {
        SortParams {
            k,
            kxmer_words: (k + MAX_X + 1).div_ceil(32),
            both_strands: false,
            cutoff_min: 1,
            cutoff_max: 1_000_000_000,
            counter_max: 255,
            counter_size: 2,
            lut_prefix_len: 1,
        }
    }

    #[test]
    fn strict_bin_matches_naive_counts() {
        let dir = tempfile::tempdir().unwrap();
        let broker = ErrorBroker::new();
        let table = Arc::new(BinDescriptorTable::new(1, dir.path(), false));
        let k = 5;

        // Several super-k-mers written across two segments so the pack
        // reader exercises the segment alignment.
        let texts = ["GATCGCGATTAC", "ACGTACGTTACGT", "GATCGCGATTAC", "CCCCCCCC"];
        let mut naive: BTreeMap<String, u64> = BTreeMap::new();
        for text in &texts {
            let rec = pack_record(&codes(text), k);
            table
                .write_segment(
                    0,
                    &rec,
                    BinCounters {
                        size: rec.len() as u64,
                        n_kmers: (text.len() - k + 1) as u64,
                        n_plus_x_recs: (text.len() - k + 1) as u64,
                        n_super_kmers: 1,
                    },
                )
                .unwrap();
            for i in 0..=text.len() - k {
                *naive.entry(text[i..i + k].to_string()).or_insert(0) += 1;
            }
        }
        let budget = StrictBudget {
            chunk_records: 512,
            n_sorting_threads: 2,
        };
        let sorted = process_bin(0, &table, params(k), dir.path(), budget, &broker).unwrap();

        assert_eq!(sorted.stats.n_unique, naive.len() as u64);
        let naive_total: u64 = naive.values().sum();
        assert_eq!(sorted.stats.n_total, naive_total);

        // Decode the suffix stream back to (kmer, count) pairs.
        let p = params(k);
        let rec = p.suffix_bytes() + p.counter_size;
        let mut decoded = BTreeMap::new();
        let mut lut_walk = Vec::new();
        for (prefix, &count) in sorted.lut.iter().enumerate() {
            for _ in 0..count {
                lut_walk.push(prefix);
            }
        }
        for (i, chunk) in sorted.suffix_data.chunks(rec).enumerate() {
            let prefix = lut_walk[i];
            let mut text = String::new();
            text.push(['A', 'C', 'G', 'T'][prefix]);
            for &byte in &chunk[..p.suffix_bytes()] {
                for j in 0..4 {
                    text.push(['A', 'C', 'G', 'T'][((byte >> (6 - 2 * j)) & 3) as usize]);
                }
            }
            let count = u64::from(chunk[p.suffix_bytes()])
                | (u64::from(chunk[p.suffix_bytes() + 1]) << 8);
            decoded.insert(text, count);
        }
        assert_eq!(decoded, naive);

        // Sub-bin files cleaned up.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("kmc_sub"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn tiny_budget_is_a_capacity_error() {
        let dir = tempfile::tempdir().unwrap();
        let broker = ErrorBroker::new();
        let table = Arc::new(BinDescriptorTable::new(1, dir.path(), true));
        let rec = pack_record(&codes("ACGTACG"), 5);
        table
            .write_segment(
                0,
                &rec,
                BinCounters {
                    size: rec.len() as u64,
                    n_kmers: 3,
                    n_plus_x_recs: 1,
                    n_super_kmers: 1,
                },
            )
            .unwrap();
        let budget = StrictBudget {
            chunk_records: 16,
            n_sorting_threads: 1,
        };
        let err = process_bin(0, &table, params(5), dir.path(), budget, &broker).unwrap_err();
        assert!(matches!(err, KmerBinError::Capacity { .. }));
    }
}
