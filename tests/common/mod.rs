//! Shared fixtures: FASTA/FASTQ writers, a naive reference counter,
//! and a database decoder for checking pipeline output.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kmerbin::config::{Config, ConfigBuilder, MappingScheme, OutputFormat};
use kmerbin::input::SequenceFormat;
use kmerbin::kmcdb;
use kmerbin::summary::Summary;

/// Writes records as a FASTA file and returns its path.
pub fn write_fasta(dir: &Path, name: &str, sequences: &[&str]) -> PathBuf {
    let path = dir.join(name);
    let mut text = String::new();
    for (i, seq) in sequences.iter().enumerate() {
        text.push_str(&format!(">read{i}\n{seq}\n"));
    }
    std::fs::write(&path, text).unwrap();
    path
}

/// Writes records as a FASTQ file with uniform quality.
pub fn write_fastq(dir: &Path, name: &str, sequences: &[&str]) -> PathBuf {
    let path = dir.join(name);
    let mut text = String::new();
    for (i, seq) in sequences.iter().enumerate() {
        let qual = "I".repeat(seq.len());
        text.push_str(&format!("@read{i}\n{seq}\n+\n{qual}\n"));
    }
    std::fs::write(&path, text).unwrap();
    path
}

/// A ready-to-tweak builder over one input file.
pub fn builder(dir: &Path, input: &Path, k: usize) -> ConfigBuilder {
    ConfigBuilder {
        input: input.display().to_string(),
        output_path: dir.join("db"),
        tmp_dir: dir.to_path_buf(),
        k,
        signature_len: 9,
        memory_gb: 1,
        strict_memory: false,
        no_canonical: false,
        ram_only: false,
        n_bins: 64,
        cutoff_min: 1,
        cutoff_max: 1_000_000_000,
        counter_max: 255,
        threads: 2,
        n_readers: None,
        n_splitters: None,
        n_sorters: None,
        input_format: SequenceFormat::Auto,
        output_format: OutputFormat::Kmc,
        without_output: false,
        hide_progress: true,
        homopolymer_compressed: false,
        json_summary: None,
        estimate_histogram: None,
        estimate_only: false,
        mapping_scheme: MappingScheme::Stats,
    }
}

/// Runs the pipeline and decodes the database it produced.
pub fn run_and_decode(config: &Config) -> (Summary, BTreeMap<String, u64>) {
    let summary = kmerbin::runner::run(config).unwrap();
    let counts = decode_database(&config.output_path);
    (summary, counts)
}

/// Reads a `.kmc_pre`/`.kmc_suf` pair back into (k-mer, count) pairs.
pub fn decode_database(base: &Path) -> BTreeMap<String, u64> {
    let mut out = BTreeMap::new();
    kmcdb::for_each_record(base, |symbols, count| {
        let text: String = symbols
            .iter()
            .map(|&s| ['A', 'C', 'G', 'T'][s as usize])
            .collect();
        assert!(out.insert(text, count).is_none(), "duplicate k-mer record");
        Ok(())
    })
    .unwrap();
    out
}

/// Reference counter: sliding window, skipping windows with non-ACGT
/// symbols, canonicalising with rust-bio's reverse complement.
pub fn naive_counts(
    sequences: &[&str],
    k: usize,
    canonical: bool,
    homopolymer_compress: bool,
) -> BTreeMap<String, u64> {
    let mut out = BTreeMap::new();
    for seq in sequences {
        let seq = if homopolymer_compress {
            let mut compressed = String::new();
            for c in seq.chars() {
                if compressed.chars().last() != Some(c) {
                    compressed.push(c);
                }
            }
            compressed
        } else {
            (*seq).to_string()
        };
        let bytes = seq.as_bytes();
        if bytes.len() < k {
            continue;
        }
        for window in bytes.windows(k) {
            if !window.iter().all(|b| matches!(b, b'A' | b'C' | b'G' | b'T')) {
                continue;
            }
            let forward = String::from_utf8(window.to_vec()).unwrap();
            let kmer = if canonical {
                let rc = String::from_utf8(bio::alphabets::dna::revcomp(window)).unwrap();
                forward.min(rc)
            } else {
                forward
            };
            *out.entry(kmer).or_insert(0) += 1;
        }
    }
    out
}

/// Applies cutoff filtering and counter clamping to reference counts.
pub fn apply_cutoffs(
    counts: &BTreeMap<String, u64>,
    cutoff_min: u64,
    cutoff_max: u64,
    counter_max: u64,
) -> BTreeMap<String, u64> {
    counts
        .iter()
        .filter(|&(_, &c)| c >= cutoff_min && c <= cutoff_max)
        .map(|(kmer, &c)| (kmer.clone(), c.min(counter_max)))
        .collect()
}
