//! Completer: streams sorted bins into the final database.
//!
//! Consumes bin outputs in bin-id order, appending each bin's filtered
//! suffix records to `.kmc_suf` and its LUT chunk — rewritten as a
//! global exclusive prefix sum — to `.kmc_pre`. Bins deferred to the
//! strict engine are completed through [`Completer::add_bin`] once the
//! engine merges them. `finish` writes the bin order, the signature
//! map, and the fixed header.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{KmerBinError, Result};
use crate::kff::KffWriter;
use crate::mapper::SignatureMapper;
use crate::queues::SequencedQueue;
use crate::sorter::{BinOutput, OutputStats, SortedBin};
use std::sync::Arc;

const PRE_MARKER: &[u8; 4] = b"KMCP";
const SUF_MARKER: &[u8; 4] = b"KMCS";

/// Everything the completer needs to lay out the database.
#[derive(Debug, Clone)]
pub struct CompleterParams {
    /// Output path without extension.
    pub output_path: PathBuf,
    /// K-mer length.
    pub k: usize,
    /// Bytes per stored counter.
    pub counter_size: usize,
    /// Symbols resolved through the prefix LUT.
    pub lut_prefix_len: usize,
    /// Signature length the run used.
    pub signature_len: usize,
    /// Lower cutoff, echoed in the header.
    pub cutoff_min: u32,
    /// Upper cutoff, truncated to 32 bits in the header.
    pub cutoff_max: u64,
    /// Canonical counting flag.
    pub both_strands: bool,
    /// Total bin count.
    pub n_bins: usize,
    /// Produce statistics only, no files.
    pub without_output: bool,
    /// Emit KFF instead of the KMC pair.
    pub kff: bool,
}

enum Sink {
    Kmc {
        pre: BufWriter<File>,
        suf: BufWriter<File>,
    },
    Kff(KffWriter),
    Null,
}

/// The database writer and global accounting.
pub struct Completer {
    params: CompleterParams,
    sink: Sink,
    totals: OutputStats,
    n_recs: u64,
    bins_order: Vec<u32>,
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    Ok(BufWriter::new(
        File::create(path).map_err(|e| KmerBinError::io(e, path))?,
    ))
}

impl Completer {
    /// Opens the output files and writes the leading markers.
    pub fn new(params: CompleterParams) -> Result<Self> {
        let sink = if params.without_output {
            Sink::Null
        } else if params.kff {
            let mut path = params.output_path.as_os_str().to_owned();
            path.push(".kff");
            Sink::Kff(KffWriter::create(
                Path::new(&path),
                params.k,
                params.counter_size,
                params.both_strands,
            )?)
        } else {
            let base = params.output_path.as_os_str();
            let mut pre_path = base.to_owned();
            pre_path.push(".kmc_pre");
            let mut suf_path = base.to_owned();
            suf_path.push(".kmc_suf");
            let mut pre = create(Path::new(&pre_path))?;
            let mut suf = create(Path::new(&suf_path))?;
            let io = |e, p: &std::ffi::OsString| KmerBinError::io(e, PathBuf::from(p));
            pre.write_all(PRE_MARKER).map_err(|e| io(e, &pre_path))?;
            suf.write_all(SUF_MARKER).map_err(|e| io(e, &suf_path))?;
            Sink::Kmc { pre, suf }
        };
        Ok(Self {
            params,
            sink,
            totals: OutputStats::default(),
            n_recs: 0,
            bins_order: Vec::new(),
        })
    }

    /// Stage-1 loop: drains the sorter output queue in bin-id order.
    ///
    /// Returns the bins deferred to the strict-memory engine, in the
    /// order the strict engine must complete them.
    pub fn drain(&mut self, queue: &Arc<SequencedQueue<BinOutput>>) -> Result<Vec<usize>> {
        let mut deferred = Vec::new();
        while let Some((bin_id, output)) = queue.pop()? {
            match output {
                BinOutput::Sorted(bin) => self.add_bin(bin_id, bin)?,
                BinOutput::Deferred => deferred.push(bin_id),
            }
        }
        Ok(deferred)
    }

    /// Appends one completed bin (the strict engine's stage-2 entry
    /// point).
    pub fn add_bin(&mut self, bin_id: usize, bin: SortedBin) -> Result<()> {
        let path = &self.params.output_path;
        match &mut self.sink {
            Sink::Kmc { pre, suf } => {
                suf.write_all(&bin.suffix_data)
                    .map_err(|e| KmerBinError::io(e, path))?;
                for &count in &bin.lut {
                    pre.write_all(&self.n_recs.to_le_bytes())
                        .map_err(|e| KmerBinError::io(e, path))?;
                    self.n_recs += count;
                }
            }
            Sink::Kff(writer) => {
                writer.write_section(&bin.suffix_data)?;
                self.n_recs += bin.lut.iter().sum::<u64>();
            }
            Sink::Null => {
                self.n_recs += bin.lut.iter().sum::<u64>();
            }
        }
        self.totals.n_unique += bin.stats.n_unique;
        self.totals.n_cutoff_min += bin.stats.n_cutoff_min;
        self.totals.n_cutoff_max += bin.stats.n_cutoff_max;
        self.totals.n_total += bin.stats.n_total;
        self.bins_order.push(bin_id as u32);
        debug!(bin_id, n_recs = self.n_recs, "bin completed");
        Ok(())
    }

    /// Writes trailer, header, and markers; returns the global totals.
    pub fn finish(self, mapper: &SignatureMapper) -> Result<(OutputStats, u64)> {
        let params = self.params;
        if self.bins_order.len() != params.n_bins {
            return Err(KmerBinError::InternalInvariant(format!(
                "{} of {} bins reached the completer",
                self.bins_order.len(),
                params.n_bins
            )));
        }
        let totals = self.totals;
        let n_recs = self.n_recs;

        match self.sink {
            Sink::Null => {}
            Sink::Kff(writer) => writer.finish()?,
            Sink::Kmc { mut pre, mut suf } => {
                let path = &params.output_path;
                let io = |e| KmerBinError::io(e, path);

                suf.write_all(SUF_MARKER).map_err(io)?;
                suf.flush().map_err(io)?;

                pre.write_all(&n_recs.to_le_bytes()).map_err(io)?;
                for &bin in &self.bins_order {
                    pre.write_all(&bin.to_le_bytes()).map_err(io)?;
                }

                if mapper.scheme().stores_map() {
                    // Signatures map to the position of their bin in
                    // the write order, not to the raw bin id.
                    let mut order_pos = vec![0u32; params.n_bins];
                    for (pos, &bin) in self.bins_order.iter().enumerate() {
                        order_pos[bin as usize] = pos as u32;
                    }
                    for &slot in mapper.raw_map() {
                        let value = if slot < 0 {
                            0
                        } else {
                            order_pos[slot as usize]
                        };
                        pre.write_all(&value.to_le_bytes()).map_err(io)?;
                    }
                }

                let mut offset = 0u32;
                let mut store =
                    |pre: &mut BufWriter<File>, value: u64, bytes: u32| -> Result<()> {
                        for i in 0..bytes {
                            pre.write_all(&[((value >> (8 * i)) & 0xff) as u8])
                                .map_err(io)?;
                        }
                        offset += bytes;
                        Ok(())
                    };

                store(&mut pre, params.k as u64, 4)?;
                store(&mut pre, 0, 4)?; // mode: plain counting
                store(&mut pre, params.counter_size as u64, 4)?;
                store(&mut pre, params.lut_prefix_len as u64, 4)?;
                store(&mut pre, params.signature_len as u64, 4)?;
                store(&mut pre, u64::from(params.cutoff_min), 4)?;
                store(&mut pre, params.cutoff_max & 0xffff_ffff, 4)?;
                store(
                    &mut pre,
                    totals.n_unique - totals.n_cutoff_min - totals.n_cutoff_max,
                    8,
                )?;
                store(&mut pre, u64::from(!params.both_strands), 1)?;
                store(&mut pre, u64::from(mapper.scheme().to_u8()), 1)?;
                store(&mut pre, params.n_bins as u64, 4)?;
                for _ in 0..27 {
                    store(&mut pre, 0, 1)?;
                }
                store(&mut pre, 0x201, 4)?;

                pre.write_all(&offset.to_le_bytes()).map_err(io)?;
                pre.write_all(PRE_MARKER).map_err(io)?;
                pre.flush().map_err(io)?;
            }
        }

        info!(
            n_unique = totals.n_unique,
            n_kept = totals.n_unique - totals.n_cutoff_min - totals.n_cutoff_max,
            n_total = totals.n_total,
            "database complete"
        );
        Ok((totals, n_recs))
    }
}
