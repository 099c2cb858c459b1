//! Run configuration and derived sizing.
//!
//! All user-facing validation and clamping happens here, as do the
//! derived knobs the pipeline stages share: pool part sizes and counts,
//! storer thresholds, arena capacity, and thread-per-role counts.
//! Out-of-range values that can be repaired are clamped with a warning;
//! contradictory ones are configuration errors.

use std::path::PathBuf;

use tracing::warn;

use crate::error::{KmerBinError, Result};
use crate::input::SequenceFormat;
use crate::kmer::KmerLength;
use crate::signature::SignatureLength;

/// Bin-count bounds.
pub const MIN_BINS: usize = 64;
/// Bin-count bounds.
pub const MAX_BINS: usize = 2000;

/// Final database flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// `.kmc_pre` + `.kmc_suf` pair.
    #[default]
    Kmc,
    /// Single `.kff` container.
    Kff,
}

/// How the signature→bin map is built.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MappingScheme {
    /// Training pass plus greedy packing.
    #[default]
    Stats,
    /// `signature % num_bins`.
    MinHash,
    /// Load a serialized map.
    FromFile(PathBuf),
}

/// Validated run configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Input files (already expanded from `@listfile`).
    pub inputs: Vec<PathBuf>,
    /// Input format; `Auto` resolves per file.
    pub input_format: SequenceFormat,
    /// Database path without extension.
    pub output_path: PathBuf,
    /// Directory for temp bin files.
    pub tmp_dir: PathBuf,
    /// K-mer length.
    pub k: KmerLength,
    /// Requested signature length (clamped to k internally).
    pub signature_len: SignatureLength,
    /// Total memory budget in bytes.
    pub max_mem_bytes: u64,
    /// Never exceed the budget, spilling oversized bins to disk.
    pub strict_memory: bool,
    /// Canonical counting (disabled by `-b`).
    pub both_strands: bool,
    /// Keep temp bins in RAM.
    pub ram_only: bool,
    /// Number of bins.
    pub n_bins: usize,
    /// Drop k-mers with fewer occurrences.
    pub cutoff_min: u32,
    /// Drop k-mers with more occurrences.
    pub cutoff_max: u64,
    /// Clamp stored counters here.
    pub counter_max: u64,
    /// Reader threads.
    pub n_readers: usize,
    /// Splitter threads.
    pub n_splitters: usize,
    /// Sorter threads.
    pub n_sorters: usize,
    /// Database flavor.
    pub output_format: OutputFormat,
    /// Statistics only, no database files.
    pub without_output: bool,
    /// Suppress the progress display.
    pub hide_progress: bool,
    /// Collapse homopolymer runs before counting.
    pub homopolymer_compressed: bool,
    /// Write a JSON run summary here.
    pub json_summary: Option<PathBuf>,
    /// Write the estimated histogram here.
    pub estimate_histogram: Option<PathBuf>,
    /// Stop after estimation.
    pub estimate_only: bool,
    /// Signature→bin mapping scheme.
    pub mapping_scheme: MappingScheme,
}

/// Builder input with raw (unclamped) values.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    pub input: String,
    pub output_path: PathBuf,
    pub tmp_dir: PathBuf,
    pub k: usize,
    pub signature_len: usize,
    pub memory_gb: u64,
    pub strict_memory: bool,
    pub no_canonical: bool,
    pub ram_only: bool,
    pub n_bins: usize,
    pub cutoff_min: u32,
    pub cutoff_max: u64,
    pub counter_max: u64,
    pub threads: usize,
    pub n_readers: Option<usize>,
    pub n_splitters: Option<usize>,
    pub n_sorters: Option<usize>,
    pub input_format: SequenceFormat,
    pub output_format: OutputFormat,
    pub without_output: bool,
    pub hide_progress: bool,
    pub homopolymer_compressed: bool,
    pub json_summary: Option<PathBuf>,
    pub estimate_histogram: Option<PathBuf>,
    pub estimate_only: bool,
    pub mapping_scheme: MappingScheme,
}

impl ConfigBuilder {
    /// Validates, clamps, and expands into a runnable [`Config`].
    pub fn build(self) -> Result<Config> {
        let k = KmerLength::new(self.k)?;
        let signature_len = SignatureLength::new(self.signature_len)?;

        if self.cutoff_min == 0 {
            return Err(KmerBinError::Config(
                "cutoff-min must be at least 1".into(),
            ));
        }
        if u64::from(self.cutoff_min) > self.cutoff_max {
            return Err(KmerBinError::Config(format!(
                "cutoff-min {} exceeds cutoff-max {}",
                self.cutoff_min, self.cutoff_max
            )));
        }
        if self.counter_max == 0 {
            return Err(KmerBinError::Config(
                "counter-max must be at least 1".into(),
            ));
        }
        if self.estimate_only && self.estimate_histogram.is_none() {
            return Err(KmerBinError::Config(
                "estimate-only requires a histogram output path".into(),
            ));
        }

        let n_bins = if (MIN_BINS..=MAX_BINS).contains(&self.n_bins) {
            self.n_bins
        } else {
            let clamped = self.n_bins.clamp(MIN_BINS, MAX_BINS);
            warn!(
                requested = self.n_bins,
                used = clamped,
                "bin count out of range, clamped"
            );
            clamped
        };

        let max_mem_bytes = if self.memory_gb == 0 {
            warn!("memory budget of 0 GB raised to the 256 MiB floor");
            256 << 20
        } else {
            self.memory_gb << 30
        };

        let threads = self.threads.max(1);
        let n_readers = self
            .n_readers
            .unwrap_or_else(|| (threads / 4).clamp(1, 4))
            .max(1);
        let n_splitters = self
            .n_splitters
            .unwrap_or_else(|| threads.saturating_sub(n_readers).max(1))
            .max(1);
        let n_sorters = self.n_sorters.unwrap_or(threads).max(1);

        if !self.tmp_dir.is_dir() {
            return Err(KmerBinError::Config(format!(
                "temp directory does not exist: {}",
                self.tmp_dir.display()
            )));
        }

        let inputs = crate::input::expand_input(&self.input)?;

        Ok(Config {
            inputs,
            input_format: self.input_format,
            output_path: self.output_path,
            tmp_dir: self.tmp_dir,
            k,
            signature_len,
            max_mem_bytes,
            strict_memory: self.strict_memory,
            both_strands: !self.no_canonical,
            ram_only: self.ram_only,
            n_bins,
            cutoff_min: self.cutoff_min,
            cutoff_max: self.cutoff_max,
            counter_max: self.counter_max,
            n_readers,
            n_splitters,
            n_sorters,
            output_format: self.output_format,
            without_output: self.without_output,
            hide_progress: self.hide_progress,
            homopolymer_compressed: self.homopolymer_compressed,
            json_summary: self.json_summary,
            estimate_histogram: self.estimate_histogram,
            estimate_only: self.estimate_only,
            mapping_scheme: self.mapping_scheme,
        })
    }
}

/// Pool, queue, and budget sizes derived from a [`Config`].
#[derive(Debug, Clone, Copy)]
pub struct MemoryLayout {
    /// Raw file pack size.
    pub pack_size: usize,
    /// Raw pack pool depth.
    pub pack_parts: usize,
    /// Decoded part size.
    pub part_size: usize,
    /// Decoded part pool depth.
    pub part_parts: usize,
    /// Splitter per-bin buffer size.
    pub bin_part_size: usize,
    /// Splitter bin buffer pool depth.
    pub bin_parts: usize,
    /// Bin-part queue capacity.
    pub bin_queue_capacity: usize,
    /// Decoded part queue capacity.
    pub part_queue_capacity: usize,
    /// Storer flush threshold over all bins.
    pub max_mem_storer: u64,
    /// Storer flush threshold for a single bin.
    pub max_mem_storer_pkg: u64,
    /// Arena capacity for stage 2.
    pub arena_bytes: u64,
    /// Strict-engine chunk capacity in records.
    pub strict_chunk_records: usize,
}

impl MemoryLayout {
    /// Splits the budget across the pipeline stages.
    #[must_use]
    pub fn derive(config: &Config) -> Self {
        let mem = config.max_mem_bytes;
        let pack_size = 1 << 16;
        let pack_parts = config.n_readers * 2 + 4;
        let part_size = 1 << 20;
        let part_parts = config.n_readers + config.n_splitters * 3 + 8;

        // Every splitter can hold one buffer per bin, and the storer
        // accumulates until its threshold; the pool must cover both or
        // stage 1 deadlocks on reserve.
        let storer_parts = 256usize;
        let holders = config.n_splitters * config.n_bins + storer_parts + 160;
        let mut bin_part_size = 1usize << 16;
        while bin_part_size > 1 << 12
            && (holders * bin_part_size) as u64 > mem / 2
        {
            bin_part_size >>= 1;
        }
        let max_mem_storer = (storer_parts * bin_part_size) as u64;
        let max_mem_storer_pkg = max_mem_storer / 8;

        let arena_bytes = (mem / 4 * 3).max(64 << 20);
        let kxmer_record = (config.k.kxmer_words() * 8) as u64;
        let strict_chunk_records =
            usize::try_from((mem / 8 / (2 * kxmer_record)).max(512)).unwrap_or(512);

        Self {
            pack_size,
            pack_parts,
            part_size,
            part_parts,
            bin_part_size,
            bin_parts: holders + 16,
            bin_queue_capacity: 128,
            part_queue_capacity: config.n_splitters * 2 + 4,
            max_mem_storer,
            max_mem_storer_pkg,
            arena_bytes,
            strict_chunk_records,
        }
    }
}

/// Minimal bytes to represent `value`.
#[must_use]
pub fn byte_log(value: u64) -> usize {
    (((64 - value.leading_zeros()) + 7) / 8).max(1) as usize
}

/// Stored-counter width: zero when every count is implicitly 1.
#[must_use]
pub fn counter_size(cutoff_max: u64, counter_max: u64) -> usize {
    if counter_max == 1 {
        0
    } else {
        byte_log(cutoff_max).min(byte_log(counter_max))
    }
}

/// Picks the LUT prefix length minimising estimated database size.
///
/// Candidates keep the suffix a whole number of bytes; the cost weighs
/// the per-record suffix bytes against `n_bins` LUT chunks of
/// `4^l` 8-byte entries.
#[must_use]
pub fn choose_lut_prefix_len(k: usize, n_bins: usize, n_est_unique: u64) -> usize {
    let mut best = 0usize;
    let mut best_cost = u64::MAX;
    for l in 2..16usize.min(k + 1) {
        let suffix_len = k - l;
        if suffix_len % 4 != 0 {
            continue;
        }
        let suf_mem = n_est_unique * (suffix_len / 4) as u64;
        let lut_mem = (n_bins as u64) * (1u64 << (2 * l)) * 8;
        if suf_mem + lut_mem < best_cost {
            best_cost = suf_mem + lut_mem;
            best = l;
        }
    }
    if best == 0 && k < 16 {
        // Short k: index the whole k-mer, empty suffix.
        best = k;
    }
    best
}
