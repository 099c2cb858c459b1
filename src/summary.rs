//! JSON run summary.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;

use crate::error::{KmerBinError, Result};

/// Per-stage wall-clock times in seconds.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StageTimes {
    /// Distribution stage (read, split, store).
    pub stage1_sec: f64,
    /// Sort/merge stage (including strict fallback).
    pub stage2_sec: f64,
    /// Whole run.
    pub total_sec: f64,
}

/// Global counters of a finished run.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SummaryStats {
    /// Reads decoded from all inputs.
    pub total_reads: u64,
    /// Super-k-mers distributed to bins.
    pub total_super_kmers: u64,
    /// Distinct k-mers, including filtered ones.
    pub unique_kmers: u64,
    /// Distinct k-mers dropped for count < cutoff-min.
    pub below_cutoff_min: u64,
    /// Distinct k-mers dropped for count > cutoff-max.
    pub above_cutoff_max: u64,
    /// Distinct k-mers stored in the database.
    pub unique_counted_kmers: u64,
    /// Total k-mer occurrences.
    pub total_kmers: u64,
}

/// The `-j` document.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    /// K-mer length of the run.
    pub k: usize,
    /// Canonical counting flag.
    pub both_strands: bool,
    /// Number of bins.
    pub n_bins: usize,
    /// Chosen LUT prefix length.
    pub lut_prefix_len: usize,
    /// Stored counter width in bytes.
    pub counter_size: usize,
    /// Global counters.
    pub stats: SummaryStats,
    /// Stage timings.
    pub times: StageTimes,
}

impl Summary {
    /// Serializes the summary as pretty JSON.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| KmerBinError::io(e, path))?;
        let mut out = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut out, self)?;
        writeln!(out).map_err(|e| KmerBinError::io(e, path))?;
        out.flush().map_err(|e| KmerBinError::io(e, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_round_trips_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        let summary = Summary {
            k: 27,
            both_strands: true,
            n_bins: 512,
            lut_prefix_len: 7,
            counter_size: 1,
            stats: SummaryStats {
                total_reads: 1000,
                total_super_kmers: 4000,
                unique_kmers: 900,
                below_cutoff_min: 100,
                above_cutoff_max: 1,
                unique_counted_kmers: 799,
                total_kmers: 20_000,
            },
            times: StageTimes {
                stage1_sec: 1.5,
                stage2_sec: 0.5,
                total_sec: 2.0,
            },
        };
        summary.write_json(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["k"], 27);
        assert_eq!(value["stats"]["unique_counted_kmers"], 799);
        assert_eq!(value["stats"]["total_kmers"], 20_000);
        assert_eq!(value["times"]["total_sec"], 2.0);
    }
}
