//! BAM input: BGZF block inflation and alignment-record decoding.
//!
//! BGZF files are a series of independent gzip members, each carrying a
//! `BC` extra subfield with the compressed block size. Blocks are read
//! sequentially, inflated in parallel batches (order restored on
//! collect), and the concatenated stream is parsed as BAM: header, then
//! length-prefixed alignment records whose 4-bit-packed sequences decode
//! straight to symbol codes. Secondary and supplementary alignments are
//! skipped; with canonical counting disabled, reverse-flagged reads are
//! decoded as their reverse complement to recover the original strand.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use bytes::Bytes;
use flate2::bufread::GzDecoder;
use rayon::prelude::*;
use tracing::debug;

use crate::error::{KmerBinError, Result};
use crate::input::INVALID_SYMBOL;
use crate::reader::PartAssembler;

const FLAG_REVERSE: u32 = 1 << 4;
const FLAG_SECONDARY: u32 = 1 << 8;
const FLAG_SUPPLEMENTARY: u32 = 1 << 11;

/// 4-bit nibble code → symbol code ("=ACMGRSVTWYHKDBN").
const NIBBLE_MAP: [u8; 16] = [
    INVALID_SYMBOL,
    0,
    1,
    INVALID_SYMBOL,
    2,
    INVALID_SYMBOL,
    INVALID_SYMBOL,
    INVALID_SYMBOL,
    3,
    INVALID_SYMBOL,
    INVALID_SYMBOL,
    INVALID_SYMBOL,
    INVALID_SYMBOL,
    INVALID_SYMBOL,
    INVALID_SYMBOL,
    INVALID_SYMBOL,
];

/// Complemented nibble map for reverse-flagged reads.
const NIBBLE_MAP_REV: [u8; 16] = [
    INVALID_SYMBOL,
    3,
    2,
    INVALID_SYMBOL,
    1,
    INVALID_SYMBOL,
    INVALID_SYMBOL,
    INVALID_SYMBOL,
    0,
    INVALID_SYMBOL,
    INVALID_SYMBOL,
    INVALID_SYMBOL,
    INVALID_SYMBOL,
    INVALID_SYMBOL,
    INVALID_SYMBOL,
    INVALID_SYMBOL,
];

/// How many BGZF blocks to inflate per parallel batch.
const BLOCK_BATCH: usize = 256;

fn malformed(path: &Path, details: impl Into<String>) -> KmerBinError {
    KmerBinError::InputFormat {
        format: "BAM",
        path: path.to_path_buf(),
        details: details.into(),
    }
}

/// Reads one raw BGZF member (header through ISIZE) from `reader`.
///
/// Returns `None` at end of file.
fn read_bgzf_member(reader: &mut impl Read, path: &Path) -> Result<Option<Vec<u8>>> {
    let mut fixed = [0u8; 12];
    let mut got = 0;
    while got < fixed.len() {
        let n = reader
            .read(&mut fixed[got..])
            .map_err(|e| KmerBinError::io(e, path))?;
        if n == 0 {
            if got == 0 {
                return Ok(None);
            }
            return Err(malformed(path, "truncated BGZF block header"));
        }
        got += n;
    }
    if fixed[0] != 0x1f || fixed[1] != 0x8b {
        return Err(malformed(path, "BGZF magic mismatch"));
    }
    if fixed[3] & 0x04 == 0 {
        return Err(malformed(path, "gzip member without BGZF extra field"));
    }
    let xlen = usize::from(u16::from_le_bytes([fixed[10], fixed[11]]));
    let mut extra = vec![0u8; xlen];
    reader
        .read_exact(&mut extra)
        .map_err(|e| KmerBinError::io(e, path))?;

    let mut bsize = None;
    let mut pos = 0;
    while pos + 4 <= extra.len() {
        let slen = usize::from(u16::from_le_bytes([extra[pos + 2], extra[pos + 3]]));
        if extra[pos] == b'B' && extra[pos + 1] == b'C' && slen == 2 {
            bsize = Some(usize::from(u16::from_le_bytes([
                extra[pos + 4],
                extra[pos + 5],
            ])));
        }
        pos += 4 + slen;
    }
    let Some(bsize) = bsize else {
        return Err(malformed(path, "BGZF extra field lacks the BC subfield"));
    };

    let total = bsize + 1;
    let rest_len = total
        .checked_sub(12 + xlen)
        .ok_or_else(|| malformed(path, "BGZF block size smaller than its header"))?;
    let mut member = Vec::with_capacity(total);
    member.extend_from_slice(&fixed);
    member.extend_from_slice(&extra);
    let start = member.len();
    member.resize(start + rest_len, 0);
    reader
        .read_exact(&mut member[start..])
        .map_err(|_| malformed(path, "truncated BGZF block payload"))?;
    Ok(Some(member))
}

fn inflate_member(member: &[u8], path: &Path) -> Result<Bytes> {
    let mut decoder = GzDecoder::new(member);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| malformed(path, format!("BGZF inflation failed: {e}")))?;
    Ok(Bytes::from(out))
}

fn read_i32(buf: &[u8], pos: usize) -> i32 {
    i32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]])
}

fn read_u32(buf: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]])
}

/// Incremental BAM stream parser over inflated BGZF data.
struct BamParser {
    pending: Vec<u8>,
    header_done: bool,
}

impl BamParser {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
            header_done: false,
        }
    }

    fn feed(
        &mut self,
        chunk: &[u8],
        out: &mut PartAssembler,
        both_strands: bool,
        path: &Path,
    ) -> Result<()> {
        self.pending.extend_from_slice(chunk);
        let consumed = self.parse_available(out, both_strands, path)?;
        self.pending.drain(..consumed);
        Ok(())
    }

    fn finish(&self, path: &Path) -> Result<()> {
        if self.pending.is_empty() {
            Ok(())
        } else {
            Err(malformed(path, "file ends inside an alignment record"))
        }
    }

    fn parse_available(
        &mut self,
        out: &mut PartAssembler,
        both_strands: bool,
        path: &Path,
    ) -> Result<usize> {
        let buf = &self.pending;
        let mut pos = 0;

        if !self.header_done {
            // magic, l_text, text, n_ref, then per-reference entries.
            if buf.len() < 12 {
                return Ok(0);
            }
            if &buf[..4] != b"BAM\x01" {
                return Err(malformed(path, "BAM magic mismatch"));
            }
            let l_text = read_i32(buf, 4).max(0) as usize;
            let mut p = 8 + l_text;
            if buf.len() < p + 4 {
                return Ok(0);
            }
            let n_ref = read_i32(buf, p).max(0) as usize;
            p += 4;
            for _ in 0..n_ref {
                if buf.len() < p + 4 {
                    return Ok(0);
                }
                let l_name = read_i32(buf, p).max(0) as usize;
                p += 4 + l_name + 4;
                if buf.len() < p {
                    return Ok(0);
                }
            }
            self.header_done = true;
            pos = p;
        }

        loop {
            if buf.len() < pos + 4 {
                return Ok(pos);
            }
            let block_size = read_i32(buf, pos).max(0) as usize;
            if buf.len() < pos + 4 + block_size {
                return Ok(pos);
            }
            let record = &buf[pos + 4..pos + 4 + block_size];
            Self::decode_record(record, out, both_strands, path)?;
            pos += 4 + block_size;
        }
    }

    fn decode_record(
        record: &[u8],
        out: &mut PartAssembler,
        both_strands: bool,
        path: &Path,
    ) -> Result<()> {
        if record.len() < 32 {
            return Err(malformed(path, "alignment record shorter than fixed fields"));
        }
        let bin_mq_nl = read_u32(record, 8);
        let l_read_name = (bin_mq_nl & 0xff) as usize;
        let flag_nc = read_u32(record, 12);
        let n_cigar_op = (flag_nc & 0xffff) as usize;
        let l_seq = read_i32(record, 16).max(0) as usize;
        let flags = flag_nc >> 16;

        if flags & (FLAG_SECONDARY | FLAG_SUPPLEMENTARY) != 0 {
            return Ok(());
        }

        let seq_start = 32 + l_read_name + 4 * n_cigar_op;
        let n_bytes = l_seq.div_ceil(2);
        if record.len() < seq_start + n_bytes {
            return Err(malformed(path, "alignment record truncates its sequence"));
        }
        let seq = &record[seq_start..seq_start + n_bytes];

        let reverse_back = !both_strands && flags & FLAG_REVERSE != 0;
        if reverse_back {
            for i in (0..l_seq).rev() {
                let byte = seq[i / 2];
                let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0xf };
                out.push_symbol(NIBBLE_MAP_REV[nibble as usize])?;
            }
        } else {
            for i in 0..l_seq {
                let byte = seq[i / 2];
                let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0xf };
                out.push_symbol(NIBBLE_MAP[nibble as usize])?;
            }
        }
        out.end_record()
    }
}

/// Decodes a whole BAM file into the assembler.
pub fn decode_bam_file(
    path: &Path,
    assembler: &mut PartAssembler,
    both_strands: bool,
) -> Result<()> {
    let file = File::open(path).map_err(|e| KmerBinError::io(e, path))?;
    let mut reader = BufReader::with_capacity(1 << 16, file);
    let mut parser = BamParser::new();
    let mut n_blocks = 0u64;

    loop {
        let mut batch = Vec::with_capacity(BLOCK_BATCH);
        while batch.len() < BLOCK_BATCH {
            match read_bgzf_member(&mut reader, path)? {
                Some(member) => batch.push(member),
                None => break,
            }
        }
        if batch.is_empty() {
            break;
        }
        n_blocks += batch.len() as u64;
        let inflated: Vec<Result<Bytes>> = batch
            .par_iter()
            .map(|member| inflate_member(member, path))
            .collect();
        for chunk in inflated {
            let chunk = chunk?;
            parser.feed(&chunk, assembler, both_strands, path)?;
        }
    }
    parser.finish(path)?;
    debug!(path = %path.display(), blocks = n_blocks, "BAM input decoded");
    Ok(())
}
