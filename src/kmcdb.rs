//! Re-counting input: streaming an existing KMC database.
//!
//! Walks the `.kmc_pre` LUT and the `.kmc_suf` record stream in written
//! order, reconstructs every stored k-mer, and replays it through the
//! normal part decoder once per counted occurrence. This is an input
//! path, not a query API: records are only ever visited front to back.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{KmerBinError, Result};
use crate::reader::PartAssembler;

const PRE_MARKER: &[u8; 4] = b"KMCP";
const SUF_MARKER: &[u8; 4] = b"KMCS";

/// Fixed header fields of a `.kmc_pre` file.
#[derive(Debug, Clone, Copy)]
pub struct DbHeader {
    pub kmer_len: usize,
    pub counter_size: usize,
    pub lut_prefix_len: usize,
    pub signature_len: usize,
    pub cutoff_min: u32,
    pub cutoff_max: u32,
    pub n_unique_counted: u64,
    pub both_strands: bool,
    pub signature_scheme: u8,
    pub n_bins: usize,
}

fn corrupt(path: &Path, details: impl Into<String>) -> KmerBinError {
    KmerBinError::InputFormat {
        format: "KMC database",
        path: path.to_path_buf(),
        details: details.into(),
    }
}

/// Strips a `.kmc_pre` / `.kmc_suf` extension if the user pointed at one
/// of the two files directly.
#[must_use]
pub fn database_base(path: &Path) -> PathBuf {
    match path.extension().and_then(|e| e.to_str()) {
        Some("kmc_pre" | "kmc_suf") => path.with_extension(""),
        _ => path.to_path_buf(),
    }
}

fn pre_path(base: &Path) -> PathBuf {
    let mut os = base.as_os_str().to_owned();
    os.push(".kmc_pre");
    PathBuf::from(os)
}

fn suf_path(base: &Path) -> PathBuf {
    let mut os = base.as_os_str().to_owned();
    os.push(".kmc_suf");
    PathBuf::from(os)
}

/// Parses the header block at the tail of a `.kmc_pre` file.
pub fn read_header(pre: &[u8], path: &Path) -> Result<DbHeader> {
    if pre.len() < 8 + 4 || &pre[..4] != PRE_MARKER || &pre[pre.len() - 4..] != PRE_MARKER {
        return Err(corrupt(path, "missing KMCP markers"));
    }
    let offset_pos = pre.len() - 8;
    let header_len = u32::from_le_bytes([
        pre[offset_pos],
        pre[offset_pos + 1],
        pre[offset_pos + 2],
        pre[offset_pos + 3],
    ]) as usize;
    let start = offset_pos
        .checked_sub(header_len)
        .ok_or_else(|| corrupt(path, "header offset past start of file"))?;
    let h = &pre[start..offset_pos];
    if h.len() < 73 {
        return Err(corrupt(path, "header block too short"));
    }
    let u32_at =
        |p: usize| u32::from_le_bytes([h[p], h[p + 1], h[p + 2], h[p + 3]]);
    let header = DbHeader {
        kmer_len: u32_at(0) as usize,
        counter_size: u32_at(8) as usize,
        lut_prefix_len: u32_at(12) as usize,
        signature_len: u32_at(16) as usize,
        cutoff_min: u32_at(20),
        cutoff_max: u32_at(24),
        n_unique_counted: u64::from_le_bytes([
            h[28], h[29], h[30], h[31], h[32], h[33], h[34], h[35],
        ]),
        both_strands: h[36] == 0,
        signature_scheme: h[37],
        n_bins: u32_at(38) as usize,
    };
    if u32_at(4) != 0 {
        return Err(corrupt(path, "unsupported counting mode"));
    }
    Ok(header)
}

/// Streams every (k-mer, count) pair into `visit`, in record order.
pub fn for_each_record(
    base: &Path,
    mut visit: impl FnMut(&[u8], u64) -> Result<()>,
) -> Result<(DbHeader, u64)> {
    let pre_file = pre_path(base);
    let pre = std::fs::read(&pre_file).map_err(|e| KmerBinError::io(e, &pre_file))?;
    let header = read_header(&pre, &pre_file)?;

    let k = header.kmer_len;
    let l = header.lut_prefix_len;
    let suffix_symbols = k - l;
    let suffix_bytes = suffix_symbols / 4;
    let lut_entries = header.n_bins << (2 * l);
    let lut_end = 4 + lut_entries * 8;
    if pre.len() < lut_end + 8 {
        return Err(corrupt(&pre_file, "LUT area larger than file"));
    }
    let n_recs = u64::from_le_bytes(
        pre[lut_end..lut_end + 8]
            .try_into()
            .unwrap_or([0; 8]),
    );

    let lut_at = |i: usize| -> u64 {
        let p = 4 + i * 8;
        u64::from_le_bytes(pre[p..p + 8].try_into().unwrap_or([0; 8]))
    };

    let suf_file = suf_path(base);
    let file = File::open(&suf_file).map_err(|e| KmerBinError::io(e, &suf_file))?;
    let mut suf = BufReader::with_capacity(1 << 16, file);
    let mut marker = [0u8; 4];
    suf.read_exact(&mut marker)
        .map_err(|e| KmerBinError::io(e, &suf_file))?;
    if &marker != SUF_MARKER {
        return Err(corrupt(&suf_file, "missing KMCS marker"));
    }

    let mut symbols = vec![0u8; k];
    let mut record = vec![0u8; suffix_bytes + header.counter_size];
    let prefix_mask = (1usize << (2 * l)) - 1;

    for group in 0..lut_entries {
        let start = lut_at(group);
        let end = if group + 1 < lut_entries {
            lut_at(group + 1)
        } else {
            n_recs
        };
        if start > end {
            return Err(corrupt(&pre_file, "LUT is not non-decreasing"));
        }
        let prefix = group & prefix_mask;
        for s in 0..l {
            symbols[s] = ((prefix >> (2 * (l - 1 - s))) & 3) as u8;
        }
        for _ in start..end {
            suf.read_exact(&mut record)
                .map_err(|e| KmerBinError::io(e, &suf_file))?;
            for (i, chunk) in record[..suffix_bytes].iter().enumerate() {
                for j in 0..4 {
                    let idx = l + i * 4 + j;
                    if idx < k {
                        symbols[idx] = (chunk >> (2 * (3 - j))) & 3;
                    }
                }
            }
            let mut count = 0u64;
            for (i, &byte) in record[suffix_bytes..].iter().enumerate() {
                count |= u64::from(byte) << (8 * i);
            }
            if header.counter_size == 0 {
                count = 1;
            }
            visit(&symbols, count)?;
        }
    }
    Ok((header, n_recs))
}

/// Replays a database through the part assembler, one record per
/// counted occurrence.
pub fn replay_database(path: &Path, assembler: &mut PartAssembler) -> Result<()> {
    let base = database_base(path);
    let (header, n_recs) = for_each_record(&base, |symbols, count| {
        for _ in 0..count {
            for &s in symbols {
                assembler.push_symbol(s)?;
            }
            assembler.end_record()?;
        }
        Ok(())
    })?;
    debug!(
        base = %base.display(),
        k = header.kmer_len,
        records = n_recs,
        "replayed KMC database"
    );
    Ok(())
}
