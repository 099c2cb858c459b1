//! Command-line interface definition.

use clap::Parser;
use std::path::PathBuf;

use crate::config::{ConfigBuilder, MappingScheme, OutputFormat};
use crate::input::SequenceFormat;

/// A disk-based k-mer counter.
///
/// Stage 1 splits reads into minimizer-signed super-k-mers and
/// distributes them over temp bins; stage 2 sorts each bin and emits a
/// sorted, de-duplicated k-mer database in KMC or KFF format.
///
/// # Examples
///
/// ```bash
/// # Count 27-mers from a FASTQ file
/// kmerbin -k 27 reads.fq out /tmp
///
/// # Multiple inputs via a list file, strict 8 GB budget
/// kmerbin -k 21 -m 8 --sm @inputs.txt out /tmp
///
/// # Non-canonical counting with a JSON summary
/// kmerbin -k 25 -b -j run.json genome.fa out /tmp
/// ```
#[derive(Parser, Debug)]
#[command(name = "kmerbin")]
#[command(version, author, about, long_about = None)]
pub struct Args {
    /// Input file path, or @listfile with one path per line
    pub input: String,

    /// Output database path (without extension)
    pub output: PathBuf,

    /// Working directory for temporary bin files
    pub tmpdir: PathBuf,

    /// K-mer length (1-256)
    #[arg(short, default_value = "25")]
    pub k: usize,

    /// Memory budget in GB
    #[arg(short, default_value = "4")]
    pub memory: u64,

    /// Strict memory mode: never exceed the budget
    #[arg(long = "sm")]
    pub strict_memory: bool,

    /// Signature (minimizer) length (5-11)
    #[arg(short = 'p', default_value = "9")]
    pub signature_len: usize,

    /// Input format
    #[arg(short = 'f', value_enum, default_value = "auto")]
    pub input_format: SequenceFormat,

    /// Exclude k-mers occurring fewer than this many times
    #[arg(long = "ci", default_value = "2")]
    pub cutoff_min: u32,

    /// Exclude k-mers occurring more than this many times
    #[arg(long = "cx", default_value = "1000000000")]
    pub cutoff_max: u64,

    /// Maximal value of a stored counter
    #[arg(long = "cs", default_value = "255")]
    pub counter_max: u64,

    /// Count all k-mers as-is instead of canonical forms
    #[arg(short = 'b')]
    pub no_canonical: bool,

    /// Keep temporary bins in RAM instead of disk
    #[arg(short = 'r')]
    pub ram_only: bool,

    /// Number of bins (64-2000)
    #[arg(short = 'n', default_value = "512")]
    pub n_bins: usize,

    /// Total number of threads
    #[arg(short = 't', default_value_t = default_threads())]
    pub threads: usize,

    /// Reader threads (overrides the split derived from -t)
    #[arg(long = "sf")]
    pub n_readers: Option<usize>,

    /// Splitter threads (overrides the split derived from -t)
    #[arg(long = "sp")]
    pub n_splitters: Option<usize>,

    /// Sorter threads (overrides the split derived from -t)
    #[arg(long = "sr")]
    pub n_sorters: Option<usize>,

    /// Output database format
    #[arg(short = 'o', value_enum, default_value = "kmc")]
    pub output_format: OutputFormat,

    /// Run the pipeline without producing output files
    #[arg(short = 'w')]
    pub without_output: bool,

    /// Hide the progress display
    #[arg(long = "hp")]
    pub hide_progress: bool,

    /// Input is homopolymer-compressed before counting
    #[arg(long = "hc")]
    pub homopolymer_compressed: bool,

    /// Write a JSON run summary to this file
    #[arg(short = 'j')]
    pub json_summary: Option<PathBuf>,

    /// Estimate the k-mer count histogram into this file and continue
    #[arg(short = 'e', conflicts_with = "estimate_exit")]
    pub estimate: Option<PathBuf>,

    /// Estimate the k-mer count histogram into this file and exit
    #[arg(short = 'E')]
    pub estimate_exit: Option<PathBuf>,

    /// Load the signature-to-bin mapping from a file
    #[arg(long = "sig-map")]
    pub sig_map: Option<PathBuf>,

    /// Assign signatures to bins by modulo instead of the trained map
    #[arg(long = "min-hash", conflicts_with = "sig_map")]
    pub min_hash: bool,
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

impl Args {
    /// Lowers the parsed arguments into a config builder.
    #[must_use]
    pub fn into_builder(self) -> ConfigBuilder {
        let mapping_scheme = if let Some(path) = self.sig_map {
            MappingScheme::FromFile(path)
        } else if self.min_hash {
            MappingScheme::MinHash
        } else {
            MappingScheme::Stats
        };
        let estimate_only = self.estimate_exit.is_some();
        ConfigBuilder {
            input: self.input,
            output_path: self.output,
            tmp_dir: self.tmpdir,
            k: self.k,
            signature_len: self.signature_len,
            memory_gb: self.memory,
            strict_memory: self.strict_memory,
            no_canonical: self.no_canonical,
            ram_only: self.ram_only,
            n_bins: self.n_bins,
            cutoff_min: self.cutoff_min,
            cutoff_max: self.cutoff_max,
            counter_max: self.counter_max,
            threads: self.threads,
            n_readers: self.n_readers,
            n_splitters: self.n_splitters,
            n_sorters: self.n_sorters,
            input_format: self.input_format,
            output_format: self.output_format,
            without_output: self.without_output,
            hide_progress: self.hide_progress,
            homopolymer_compressed: self.homopolymer_compressed,
            json_summary: self.json_summary,
            estimate_histogram: self.estimate.or(self.estimate_exit),
            estimate_only,
            mapping_scheme,
        }
    }
}
