//! Input selection: file lists and sequence formats.
//!
//! Inputs are given as a single path or as `@listfile`, a text file with
//! one input path per line. The sequence format is either forced on the
//! command line or detected from the file extension (gzip suffixes are
//! transparent).

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use clap::ValueEnum;

use crate::error::{KmerBinError, Result};

/// Symbol code for anything that is not A/C/G/T, and for record
/// boundaries inside a decoded part.
pub const INVALID_SYMBOL: u8 = u8::MAX;

/// Maps an input byte to its 2-bit code, or [`INVALID_SYMBOL`].
#[must_use]
pub fn symbol_code(byte: u8) -> u8 {
    match byte {
        b'A' | b'a' => 0,
        b'C' | b'c' => 1,
        b'G' | b'g' => 2,
        b'T' | b't' => 3,
        _ => INVALID_SYMBOL,
    }
}

/// Input sequence format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum SequenceFormat {
    /// Detect from the file extension.
    #[default]
    Auto,
    /// FASTA (`.fa`, `.fasta`, `.fna`), single- or multi-line.
    #[value(alias = "a")]
    Fasta,
    /// FASTQ (`.fq`, `.fastq`).
    #[value(alias = "q")]
    Fastq,
    /// Multi-line FASTA (accepted alias of `fasta`).
    #[value(alias = "m")]
    MultilineFasta,
    /// BAM (BGZF-compressed binary alignments).
    Bam,
    /// An existing KMC database (re-counting).
    Kmc,
}

impl SequenceFormat {
    /// Detects the format from a file extension, stripping `.gz`.
    #[must_use]
    pub fn from_extension(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(OsStr::to_str)
            .map(str::to_lowercase);
        let effective = match ext.as_deref() {
            Some("gz") => path
                .file_stem()
                .and_then(|stem| Path::new(stem).extension())
                .and_then(OsStr::to_str)
                .map(str::to_lowercase),
            other => other.map(String::from),
        };
        match effective.as_deref() {
            Some("fq" | "fastq") => Self::Fastq,
            Some("bam") => Self::Bam,
            Some("kmc_pre" | "kmc_suf") => Self::Kmc,
            _ => Self::Fasta,
        }
    }

    /// Resolves `Auto` against a concrete path.
    #[must_use]
    pub fn resolve(self, path: &Path) -> Self {
        match self {
            Self::Auto => Self::from_extension(path),
            other => other,
        }
    }
}

impl std::fmt::Display for SequenceFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Auto => "auto",
            Self::Fasta => "fasta",
            Self::Fastq => "fastq",
            Self::MultilineFasta => "multiline-fasta",
            Self::Bam => "bam",
            Self::Kmc => "kmc",
        };
        write!(f, "{name}")
    }
}

/// Expands an input argument into the list of files to read.
///
/// `@list` paths name a file containing one input path per line; blank
/// lines are skipped. Every listed file must exist.
pub fn expand_input(input: &str) -> Result<Vec<PathBuf>> {
    let paths: Vec<PathBuf> = if let Some(list) = input.strip_prefix('@') {
        let text = fs::read_to_string(list).map_err(|e| KmerBinError::io(e, list))?;
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(PathBuf::from)
            .collect()
    } else {
        vec![PathBuf::from(input)]
    };

    if paths.is_empty() {
        return Err(KmerBinError::Config(format!(
            "input list '{input}' names no files"
        )));
    }
    for path in &paths {
        if !path.exists() {
            return Err(KmerBinError::Config(format!(
                "input file not found: {}",
                path.display()
            )));
        }
    }
    Ok(paths)
}
