//! # kmerbin
//!
//! A disk-based k-mer counter. Reads FASTA/FASTQ/BAM datasets (or an
//! existing database) and produces, on disk, a sorted, de-duplicated
//! table mapping each distinct length-k DNA substring to its number of
//! occurrences — even when the distinct k-mer count vastly exceeds RAM.
//!
//! The pipeline runs in two stages. Stage 1 decodes the input in
//! parallel, extracts minimizer-signed super-k-mers, and distributes
//! them over on-disk bins so that identical k-mers always land in the
//! same bin. Stage 2 loads one bin at a time, expands super-k-mers into
//! packed (k+x)-mer records, radix-sorts them, merges the overlap
//! streams into per-k-mer counts, and streams the result into a KMC- or
//! KFF-format database. Bins that cannot fit the memory budget fall
//! back to a strict-memory engine that sorts in bounded chunks and
//! k-way-merges sorted runs from disk.
//!
//! ```no_run
//! use kmerbin::cli::Args;
//! use clap::Parser;
//!
//! let args = Args::parse_from(["kmerbin", "-k", "27", "reads.fq", "out", "/tmp"]);
//! let config = args.into_builder().build()?;
//! let summary = kmerbin::runner::run(&config)?;
//! println!("{} distinct k-mers", summary.stats.unique_counted_kmers);
//! # Ok::<(), kmerbin::error::KmerBinError>(())
//! ```

pub mod arena;
pub mod bam;
pub mod bins;
pub mod cli;
pub mod completer;
pub mod config;
pub mod error;
pub mod estimator;
pub mod input;
pub mod kff;
pub mod kmcdb;
pub mod kmer;
pub mod kxmer;
pub mod mapper;
pub mod pool;
pub mod progress;
pub mod queues;
pub mod radix;
pub mod reader;
pub mod runner;
pub mod signature;
pub mod sorter;
pub mod splitter;
pub mod storer;
pub mod strict;
pub mod summary;
