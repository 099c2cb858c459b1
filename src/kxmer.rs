//! (k+x)-mer expansion and compaction.
//!
//! Stage 2 does not sort k-mers one by one: a super-k-mer of length
//! `k + a` expands into a handful of (k+x)-mer records, each packing up
//! to `MAX_X` extra symbols low-aligned plus a 2-bit marker (the extra
//! count) above symbol `k + MAX_X - 1`. Sorting the records groups the
//! marker partitions contiguously; each (partition, shift) pair is then
//! a sorted stream of plain k-mers (right-shifting preserves order), and
//! a binary heap over those streams emits globally sorted per-k-mer
//! counts.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::error::Result;
use crate::kmer::{PackedKmer, MAX_X};

/// Geometry shared by expansion and compaction for one k.
#[derive(Debug, Clone, Copy)]
pub struct KxmerShape<const W: usize> {
    /// K-mer length.
    pub k: usize,
    /// Low `2k` bits.
    pub kmer_mask: PackedKmer<W>,
    /// Low `2(k + MAX_X)` bits.
    pub kxmer_mask: PackedKmer<W>,
    /// Bit offset of the 2-bit extra-symbol marker.
    pub marker_offset: usize,
}

impl<const W: usize> KxmerShape<W> {
    /// Builds masks and offsets for `k`.
    #[must_use]
    pub fn new(k: usize) -> Self {
        debug_assert!((k + MAX_X + 1).div_ceil(32) <= W);
        Self {
            k,
            kmer_mask: PackedKmer::n_ones(2 * k),
            kxmer_mask: PackedKmer::n_ones(2 * (k + MAX_X)),
            marker_offset: 2 * (k + MAX_X),
        }
    }

    /// Bits that participate in sorting (symbols plus marker).
    #[must_use]
    pub fn significant_bits(&self) -> usize {
        self.marker_offset + 2
    }
}

/// Parses the length-byte-prefixed records of a bin's temp data,
/// yielding each super-k-mer's symbols (decoded to one symbol per
/// byte).
pub struct SuperKmerIter<'a> {
    data: &'a [u8],
    pos: usize,
    k: usize,
    symbols: Vec<u8>,
}

impl<'a> SuperKmerIter<'a> {
    /// Iterates records of `data` for k-mer length `k`.
    #[must_use]
    pub fn new(data: &'a [u8], k: usize) -> Self {
        Self {
            data,
            pos: 0,
            k,
            symbols: Vec::with_capacity(k + 255),
        }
    }

    /// The next super-k-mer's symbols, or `None` at the end.
    pub fn next_record(&mut self) -> Option<&[u8]> {
        if self.pos >= self.data.len() {
            return None;
        }
        let additional = self.data[self.pos] as usize;
        self.pos += 1;
        let len = self.k + additional;
        let n_bytes = len.div_ceil(4);
        let packed = &self.data[self.pos..self.pos + n_bytes];
        self.pos += n_bytes;

        self.symbols.clear();
        for i in 0..len {
            let byte = packed[i / 4];
            self.symbols.push((byte >> (6 - 2 * (i % 4))) & 3);
        }
        Some(&self.symbols)
    }
}

/// Expands one super-k-mer into records, both k-mer strands ignored.
pub fn expand_all<const W: usize>(
    shape: &KxmerShape<W>,
    symbols: &[u8],
    out: &mut Vec<PackedKmer<W>>,
) {
    let k = shape.k;
    let additional = symbols.len() - k;

    let mut kxmer: PackedKmer<W> = PackedKmer::from_symbols(&symbols[..k]);
    let take = additional.min(MAX_X);
    for &s in &symbols[k..k + take] {
        kxmer.shl_insert_2bits(u64::from(s));
    }
    push_record(kxmer, take, shape, out);

    let mut consumed = k + take;
    let rest_total = additional - take;
    let full_records = rest_total / (MAX_X + 1);
    let tail = rest_total % (MAX_X + 1);

    for _ in 0..full_records {
        for _ in 0..=MAX_X {
            kxmer.shl_insert_2bits(u64::from(symbols[consumed]));
            consumed += 1;
        }
        kxmer.mask(&shape.kxmer_mask);
        push_record(kxmer, MAX_X, shape, out);
    }
    if tail > 0 {
        kxmer.shl_insert_2bits(u64::from(symbols[consumed]));
        consumed += 1;
        kxmer.mask(&shape.kmer_mask);
        for _ in 0..tail - 1 {
            kxmer.shl_insert_2bits(u64::from(symbols[consumed]));
            consumed += 1;
        }
        push_record(kxmer, tail - 1, shape, out);
    }
}

/// Expands one super-k-mer canonically: maximal same-direction runs of
/// canonical k-mers become single records; reverse runs assemble the
/// record on the reverse-complement strand, top-down.
pub fn expand_canonical<const W: usize>(
    shape: &KxmerShape<W>,
    symbols: &[u8],
    out: &mut Vec<PackedKmer<W>>,
) {
    let k = shape.k;
    let rev_top = 2 * k - 2;

    let mut kmer: PackedKmer<W> = PackedKmer::from_symbols(&symbols[..k]);
    let mut rev = kmer.reverse_complement(k);
    let mut kmer_lower = kmer < rev;
    let mut record = if kmer_lower { kmer } else { rev };
    let mut x = 0usize;

    let mut idx = k;
    while idx < symbols.len() {
        let s = symbols[idx];
        idx += 1;
        kmer.shl_insert_2bits(u64::from(s));
        kmer.mask(&shape.kmer_mask);
        rev.shr_insert_2bits(u64::from(3 - s), rev_top);

        let still_lower = kmer < rev;
        if kmer_lower == still_lower {
            // Same direction: extend the record.
            if kmer_lower {
                record.shl_insert_2bits(u64::from(s));
            } else {
                record.set_2bits(u64::from(3 - s), 2 * k + 2 * x);
            }
            x += 1;
            if x == MAX_X {
                if idx >= symbols.len() {
                    break;
                }
                push_record(record, x, shape, out);
                x = 0;
                let s = symbols[idx];
                idx += 1;
                kmer.shl_insert_2bits(u64::from(s));
                kmer.mask(&shape.kmer_mask);
                rev.shr_insert_2bits(u64::from(3 - s), rev_top);
                kmer_lower = kmer < rev;
                record = if kmer_lower { kmer } else { rev };
            }
        } else {
            // Direction flip: close the record, start a fresh one.
            push_record(record, x, shape, out);
            x = 0;
            kmer_lower = still_lower;
            record = if kmer_lower { kmer } else { rev };
        }
    }
    push_record(record, x, shape, out);
}

fn push_record<const W: usize>(
    mut record: PackedKmer<W>,
    x: usize,
    shape: &KxmerShape<W>,
    out: &mut Vec<PackedKmer<W>>,
) {
    record.set_2bits(x as u64, shape.marker_offset);
    out.push(record);
}

/// Collapses runs of equal records in sorted order.
///
/// Returns the compacted length; `counters[i]` holds the multiplicity
/// of `sorted[i]` afterwards.
#[must_use]
pub fn pre_compact<const W: usize>(
    sorted: &mut Vec<PackedKmer<W>>,
    counters: &mut Vec<u32>,
) -> usize {
    counters.clear();
    if sorted.is_empty() {
        return 0;
    }
    let mut write = 0usize;
    counters.push(1);
    for read in 1..sorted.len() {
        if sorted[read] == sorted[write] {
            counters[write] = counters[write].saturating_add(1);
        } else {
            write += 1;
            sorted[write] = sorted[read];
            counters.push(1);
        }
    }
    sorted.truncate(write + 1);
    write + 1
}

struct Stream {
    pos: usize,
    end: usize,
    shr: usize,
}

/// Merges the sorted, compacted record array into per-k-mer counts.
///
/// Partition starts are binary-searched on the marker field; partition
/// `m` contributes `m + 1` sorted streams (one per shift). `emit`
/// receives each distinct k-mer once, in ascending order, with its
/// total occurrence count.
pub fn merge_sorted_kxmers<const W: usize>(
    shape: &KxmerShape<W>,
    sorted: &[PackedKmer<W>],
    counters: &[u32],
    mut emit: impl FnMut(PackedKmer<W>, u64) -> Result<()>,
) -> Result<()> {
    if sorted.is_empty() {
        return Ok(());
    }

    let marker_of =
        |record: &PackedKmer<W>| -> usize { record.get_2bits(shape.marker_offset) as usize };

    // Partition bounds: bounds[m] = first index with marker >= m.
    let mut bounds = [0usize; MAX_X + 2];
    bounds[MAX_X + 1] = sorted.len();
    for m in 1..=MAX_X {
        bounds[m] = sorted.partition_point(|r| marker_of(r) < m);
    }

    let mut streams = Vec::new();
    for m in 0..=MAX_X {
        let (start, end) = (bounds[m], bounds[m + 1]);
        if start == end {
            continue;
        }
        for shift in 0..=m {
            streams.push(Stream {
                pos: start,
                end,
                shr: m - shift,
            });
        }
    }

    let mut heap: BinaryHeap<Reverse<(PackedKmer<W>, usize)>> = BinaryHeap::new();
    for (id, stream) in streams.iter().enumerate() {
        let kmer = sorted[stream.pos].from_kxmer(stream.shr, &shape.kmer_mask);
        heap.push(Reverse((kmer, id)));
    }

    let mut current: Option<(PackedKmer<W>, u64)> = None;
    while let Some(Reverse((kmer, id))) = heap.pop() {
        let stream = &mut streams[id];
        let count = u64::from(counters[stream.pos]);
        match current {
            Some((value, total)) if value == kmer => {
                current = Some((value, total + count));
            }
            Some((value, total)) => {
                emit(value, total)?;
                current = Some((kmer, count));
            }
            None => current = Some((kmer, count)),
        }
        stream.pos += 1;
        if stream.pos < stream.end {
            let next = sorted[stream.pos].from_kxmer(stream.shr, &shape.kmer_mask);
            heap.push(Reverse((next, id)));
        }
    }
    if let Some((value, total)) = current {
        emit(value, total)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radix::radix_sort;
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

    fn text_of<const W: usize>(kmer: &PackedKmer<W>, k: usize) -> String {
        kmer.to_text(k)
    }

    fn count_via_pipeline(
        super_kmers: &[&str],
        k: usize,
        canonical: bool,
    ) -> BTreeMap<String, u64> {
        let shape: KxmerShape<1> = KxmerShape::new(k);
        let mut records = Vec::new();
        for sk in super_kmers {
            let symbols = codes(sk);
            if canonical {
                expand_canonical(&shape, &symbols, &mut records);
            } else {
                expand_all(&shape, &symbols, &mut records);
            }
        }
        let mut tmp = Vec::new();
        radix_sort(&mut records, &mut tmp, shape.significant_bits());
        let mut counters = Vec::new();
        let n = pre_compact(&mut records, &mut counters);
        assert_eq!(n, records.len());

        let mut out = BTreeMap::new();
        merge_sorted_kxmers(&shape, &records, &counters, |kmer, count| {
            *out.entry(text_of(&kmer, k)).or_insert(0) += count;
            Ok(())
        })
        .unwrap();
        out
    }

    fn naive_counts(super_kmers: &[&str], k: usize, canonical: bool) -> BTreeMap<String, u64> {
        let mut out = BTreeMap::new();
        for sk in super_kmers {
            for i in 0..=sk.len() - k {
                let kmer = &sk[i..i + k];
                let canonical_kmer = if canonical {
                    let rc: String = kmer
                        .chars()
                        .rev()
                        .map(|c| match c {
                            'A' => 'T',
                            'C' => 'G',
                            'G' => 'C',
                            _ => 'A',
                        })
                        .collect();
                    kmer.to_string().min(rc)
                } else {
                    kmer.to_string()
                };
                *out.entry(canonical_kmer).or_insert(0) += 1;
            }
        }
        out
    }

    #[test]
    fn expansion_preserves_kmer_count() {
        let shape: KxmerShape<1> = KxmerShape::new(5);
        for text in ["ACGTACG", "ACGTA", "ACGTACGTACGTACGTACGT"] {
            let mut records = Vec::new();
            expand_all(&shape, &codes(text), &mut records);
            let total: usize = records
                .iter()
                .map(|r| r.get_2bits(shape.marker_offset) as usize + 1)
                .sum();
            assert_eq!(total, text.len() - 5 + 1, "{text}");
        }
    }

    #[test]
    fn canonical_expansion_preserves_kmer_count() {
        let shape: KxmerShape<1> = KxmerShape::new(5);
        for text in ["ACGTACG", "TTTTTTTTT", "GATTACAGATTACA"] {
            let mut records = Vec::new();
            expand_canonical(&shape, &codes(text), &mut records);
            let total: usize = records
                .iter()
                .map(|r| r.get_2bits(shape.marker_offset) as usize + 1)
                .sum();
            assert_eq!(total, text.len() - 5 + 1, "{text}");
        }
    }

    #[test]
    fn pipeline_matches_naive_counting() {
        let super_kmers = ["GATCGCGATTAC", "ACGTACGTT", "GATCGCGA"];
        for k in [3usize, 5, 7] {
            assert_eq!(
                count_via_pipeline(&super_kmers, k, false),
                naive_counts(&super_kmers, k, false),
                "k = {k}"
            );
        }
    }

    #[test]
    fn canonical_pipeline_matches_naive_counting() {
        let super_kmers = ["GATCGCGATTAC", "ACGTACGTT", "TTTTTAAAAATTTTT"];
        for k in [3usize, 5, 7] {
            assert_eq!(
                count_via_pipeline(&super_kmers, k, true),
                naive_counts(&super_kmers, k, true),
                "k = {k}"
            );
        }
    }

    #[test]
    fn merge_emits_in_ascending_order() {
        let shape: KxmerShape<1> = KxmerShape::new(4);
        let mut records = Vec::new();
        expand_all(&shape, &codes("CCCGTAGTAGG"), &mut records);
        let mut tmp = Vec::new();
        radix_sort(&mut records, &mut tmp, shape.significant_bits());
        let mut counters = Vec::new();
        let _ = pre_compact(&mut records, &mut counters);

        let mut last: Option<PackedKmer<1>> = None;
        merge_sorted_kxmers(&shape, &records, &counters, |kmer, _| {
            if let Some(prev) = last {
                assert!(prev < kmer, "merge output must be strictly ascending");
            }
            last = Some(kmer);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn super_kmer_iter_round_trip() {
        let k = 4;
        // Record: additional=3, symbols ACGTCGA packed 4-per-byte.
        let mut data = vec![3u8];
        data.push(0b00_01_10_11); // ACGT
        data.push(0b01_10_00_00); // CGA + pad
        let mut iter = SuperKmerIter::new(&data, k);
        assert_eq!(iter.next_record(), Some(&codes("ACGTCGA")[..]));
        assert_eq!(iter.next_record(), None);
    }

    #[test]
    fn pre_compact_collapses_duplicates() {
        let mut values: Vec<PackedKmer<1>> = [1u64, 1, 2, 5, 5, 5]
            .iter()
            .map(|&v| {
                let mut k = PackedKmer::zero();
                k.set_byte(0, v as u8);
                k
            })
            .collect();
        let mut counters = Vec::new();
        let n = pre_compact(&mut values, &mut counters);
        assert_eq!(n, 3);
        assert_eq!(counters, vec![2, 1, 3]);
    }
}
