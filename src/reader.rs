//! Sequence reading and decoding.
//!
//! Reader workers pull input files off a queue, inflate gzip where
//! needed, parse FASTA/FASTQ records, and emit decoded parts: pooled
//! buffers of symbol codes (A=0, C=1, G=2, T=3, anything else
//! [`INVALID_SYMBOL`]) with records separated by an invalid code. A part
//! ends at a record boundary unless the read is longer than the part, in
//! which case the next part starts with the previous k−1 codes so no
//! window is lost at the seam.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flate2::bufread::GzDecoder;
use tracing::{debug, warn};

use crate::bam;
use crate::error::{KmerBinError, Result};
use crate::input::{symbol_code, SequenceFormat, INVALID_SYMBOL};
use crate::kmcdb;
use crate::pool::{MemoryPool, PoolBuffer};
use crate::progress::ProgressTracker;
use crate::queues::WorkQueue;

/// A buffer of decoded symbol codes ready for the splitter.
#[derive(Debug)]
pub struct DecodedPart {
    /// Symbol codes with [`INVALID_SYMBOL`] at record boundaries.
    pub data: PoolBuffer,
}

/// Counters shared by all reader workers.
#[derive(Debug, Default)]
pub struct ReaderStats {
    /// Records decoded across all inputs.
    pub n_reads: AtomicU64,
    /// Files that ended without a trailing newline.
    pub missing_newlines: AtomicU64,
}

/// One unit of reader work.
#[derive(Debug, Clone)]
pub struct FileTask {
    /// Path of the input file.
    pub path: PathBuf,
    /// Resolved (never `Auto`) format.
    pub format: SequenceFormat,
}

/// Reader behavior switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReaderOptions {
    /// Stop after this many raw bytes per file (sampling passes).
    pub byte_limit: Option<u64>,
    /// Tolerate truncated streams and records (sampling passes).
    pub lenient: bool,
}

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Gzip reader that accepts concatenated members and silently drops
/// trailing garbage after a complete stream.
struct TolerantGzReader {
    decoder: Option<GzDecoder<BufReader<File>>>,
    allow_truncated: bool,
    path: PathBuf,
}

impl TolerantGzReader {
    fn new(file: BufReader<File>, allow_truncated: bool, path: PathBuf) -> Self {
        Self {
            decoder: Some(GzDecoder::new(file)),
            allow_truncated,
            path,
        }
    }
}

impl Read for TolerantGzReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let Some(decoder) = self.decoder.as_mut() else {
                return Ok(0);
            };
            match decoder.read(buf) {
                Ok(0) if !buf.is_empty() => {
                    // Member finished; look for another one.
                    let Some(finished) = self.decoder.take() else {
                        return Ok(0);
                    };
                    let mut inner = finished.into_inner();
                    let rest = inner.fill_buf()?;
                    if rest.len() >= 2 && rest[..2] == GZIP_MAGIC {
                        self.decoder = Some(GzDecoder::new(inner));
                        continue;
                    }
                    if !rest.is_empty() {
                        debug!(
                            path = %self.path.display(),
                            "dropping trailing bytes after final gzip stream"
                        );
                    }
                    return Ok(0);
                }
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && self.allow_truncated => {
                    self.decoder = None;
                    return Ok(0);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Opens a text input, transparently inflating gzip (detected by magic).
pub fn open_text_input(path: &Path, allow_truncated: bool) -> Result<Box<dyn Read + Send>> {
    let file = File::open(path).map_err(|e| KmerBinError::io(e, path))?;
    let mut reader = BufReader::with_capacity(1 << 16, file);
    let head = reader.fill_buf().map_err(|e| KmerBinError::io(e, path))?;
    if head.len() >= 2 && head[..2] == GZIP_MAGIC {
        Ok(Box::new(TolerantGzReader::new(
            reader,
            allow_truncated,
            path.to_path_buf(),
        )))
    } else {
        Ok(Box::new(reader))
    }
}

/// Builds decoded parts out of a stream of symbol codes.
///
/// Owns the current output buffer; emits it when full (carrying the last
/// k−1 codes of an unfinished read into the next part) or when
/// [`PartAssembler::finish`] flushes the tail.
pub struct PartAssembler {
    pool: Arc<MemoryPool>,
    queue: Arc<WorkQueue<DecodedPart>>,
    current: Option<PoolBuffer>,
    /// Codes pushed since the last record separator.
    run_len: usize,
    overlap: usize,
    n_reads: u64,
}

impl PartAssembler {
    /// Creates an assembler emitting into `queue`, with `k`-dependent
    /// overlap at part seams.
    #[must_use]
    pub fn new(pool: Arc<MemoryPool>, queue: Arc<WorkQueue<DecodedPart>>, k: usize) -> Self {
        Self {
            pool,
            queue,
            current: None,
            run_len: 0,
            overlap: k - 1,
            n_reads: 0,
        }
    }

    fn buffer(&mut self) -> Result<&mut PoolBuffer> {
        if self.current.is_none() {
            self.current = Some(self.pool.reserve()?);
        }
        Ok(self
            .current
            .as_mut()
            .unwrap_or_else(|| unreachable!("buffer reserved above")))
    }

    /// Appends one symbol code (valid or invalid) to the current part.
    pub fn push_symbol(&mut self, code: u8) -> Result<()> {
        let overlap = self.overlap;
        let run_len = self.run_len;
        let buf = self.buffer()?;
        if buf.remaining() == 0 {
            // Part is full inside a read: emit it and seed the next part
            // with the last k−1 codes so boundary windows survive.
            let tail_len = overlap.min(run_len);
            let tail: Vec<u8> = buf[buf.len() - tail_len..].to_vec();
            self.emit()?;
            let buf = self.buffer()?;
            buf.extend_from_slice(&tail);
            self.run_len = tail_len;
        }
        let buf = self.buffer()?;
        buf.push(code);
        if code == INVALID_SYMBOL {
            self.run_len = 0;
        } else {
            self.run_len += 1;
        }
        Ok(())
    }

    /// Marks the end of a record.
    pub fn end_record(&mut self) -> Result<()> {
        self.n_reads += 1;
        if self.run_len > 0 {
            self.push_symbol(INVALID_SYMBOL)?;
        }
        self.run_len = 0;
        Ok(())
    }

    fn emit(&mut self) -> Result<()> {
        if let Some(data) = self.current.take() {
            if !data.is_empty() {
                self.queue.push(DecodedPart { data })?;
            }
        }
        Ok(())
    }

    /// Flushes the trailing part; returns the number of records seen.
    pub fn finish(&mut self) -> Result<u64> {
        self.emit()?;
        Ok(self.n_reads)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FastaState {
    Begin,
    Header,
    Sequence { at_line_start: bool },
}

/// Incremental FASTA decoder (single- and multi-line records).
struct FastaDecoder {
    state: FastaState,
    last_byte: u8,
}

impl FastaDecoder {
    fn new() -> Self {
        Self {
            state: FastaState::Begin,
            last_byte: b'\n',
        }
    }

    fn feed(&mut self, chunk: &[u8], out: &mut PartAssembler, path: &Path) -> Result<()> {
        for &byte in chunk {
            self.last_byte = byte;
            match self.state {
                FastaState::Begin => match byte {
                    b'>' => self.state = FastaState::Header,
                    b'\n' | b'\r' | b' ' | b'\t' => {}
                    other => {
                        return Err(KmerBinError::InputFormat {
                            format: "FASTA",
                            path: path.to_path_buf(),
                            details: format!(
                                "expected '>' at record start, found byte 0x{other:02x}"
                            ),
                        })
                    }
                },
                FastaState::Header => {
                    if byte == b'\n' {
                        self.state = FastaState::Sequence {
                            at_line_start: true,
                        };
                    }
                }
                FastaState::Sequence { at_line_start } => match byte {
                    b'>' if at_line_start => {
                        out.end_record()?;
                        self.state = FastaState::Header;
                    }
                    b'\n' => {
                        self.state = FastaState::Sequence {
                            at_line_start: true,
                        };
                    }
                    b'\r' => {}
                    other => {
                        out.push_symbol(symbol_code(other))?;
                        self.state = FastaState::Sequence {
                            at_line_start: false,
                        };
                    }
                },
            }
        }
        Ok(())
    }

    fn finish(&mut self, out: &mut PartAssembler, stats: &ReaderStats) -> Result<()> {
        match self.state {
            FastaState::Begin => Ok(()),
            FastaState::Header => Ok(()),
            FastaState::Sequence { .. } => {
                if self.last_byte != b'\n' {
                    stats.missing_newlines.fetch_add(1, Ordering::Relaxed);
                }
                out.end_record()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FastqState {
    Begin,
    Header,
    Sequence,
    PlusMarker,
    PlusLine,
    Quality { left: usize },
    AfterQuality,
}

/// Incremental FASTQ decoder. Quality lines are skipped byte-for-byte
/// against the sequence length, so '@' inside quality never confuses the
/// parser.
struct FastqDecoder {
    state: FastqState,
    seq_len: usize,
}

impl FastqDecoder {
    fn new() -> Self {
        Self {
            state: FastqState::Begin,
            seq_len: 0,
        }
    }

    fn malformed(path: &Path, details: impl Into<String>) -> KmerBinError {
        KmerBinError::InputFormat {
            format: "FASTQ",
            path: path.to_path_buf(),
            details: details.into(),
        }
    }

    fn feed(&mut self, chunk: &[u8], out: &mut PartAssembler, path: &Path) -> Result<()> {
        for &byte in chunk {
            match self.state {
                FastqState::Begin | FastqState::AfterQuality => match byte {
                    b'@' => {
                        self.state = FastqState::Header;
                    }
                    b'\n' | b'\r' => {}
                    other => {
                        return Err(Self::malformed(
                            path,
                            format!("expected '@' at record start, found byte 0x{other:02x}"),
                        ))
                    }
                },
                FastqState::Header => {
                    if byte == b'\n' {
                        self.state = FastqState::Sequence;
                        self.seq_len = 0;
                    }
                }
                FastqState::Sequence => match byte {
                    b'\n' => self.state = FastqState::PlusMarker,
                    b'\r' => {}
                    other => {
                        out.push_symbol(symbol_code(other))?;
                        self.seq_len += 1;
                    }
                },
                FastqState::PlusMarker => match byte {
                    b'+' => self.state = FastqState::PlusLine,
                    other => {
                        return Err(Self::malformed(
                            path,
                            format!("expected '+' line, found byte 0x{other:02x}"),
                        ))
                    }
                },
                FastqState::PlusLine => {
                    if byte == b'\n' {
                        self.state = FastqState::Quality {
                            left: self.seq_len,
                        };
                    }
                }
                FastqState::Quality { left } => match byte {
                    b'\r' => {}
                    b'\n' => {
                        if left != 0 {
                            return Err(Self::malformed(
                                path,
                                format!("quality line shorter than sequence by {left} bytes"),
                            ));
                        }
                        out.end_record()?;
                        self.state = FastqState::AfterQuality;
                    }
                    _ => {
                        if left == 0 {
                            return Err(Self::malformed(
                                path,
                                "quality line longer than sequence",
                            ));
                        }
                        self.state = FastqState::Quality { left: left - 1 };
                    }
                },
            }
        }
        Ok(())
    }

    fn finish(&mut self, out: &mut PartAssembler, stats: &ReaderStats, path: &Path) -> Result<()> {
        match self.state {
            FastqState::Begin | FastqState::AfterQuality => Ok(()),
            FastqState::Quality { left: 0 } => {
                stats.missing_newlines.fetch_add(1, Ordering::Relaxed);
                out.end_record()
            }
            _ => Err(Self::malformed(path, "file ends inside a record")),
        }
    }
}

/// Reader worker: drains the file queue, decoding each file into parts.
#[allow(clippy::too_many_arguments)]
pub fn reader_worker(
    files: &Arc<WorkQueue<FileTask>>,
    parts: &Arc<WorkQueue<DecodedPart>>,
    pack_pool: &Arc<MemoryPool>,
    part_pool: &Arc<MemoryPool>,
    k: usize,
    both_strands: bool,
    options: ReaderOptions,
    stats: &Arc<ReaderStats>,
    tracker: &Arc<ProgressTracker>,
) -> Result<()> {
    while let Some(task) = files.pop()? {
        let mut assembler = PartAssembler::new(Arc::clone(part_pool), Arc::clone(parts), k);
        match task.format {
            SequenceFormat::Fasta | SequenceFormat::MultilineFasta => {
                decode_text_file(
                    &task.path,
                    &mut FastaDecoder::new(),
                    FastaDecoder::feed,
                    |d, out| d.finish(out, stats),
                    &mut assembler,
                    pack_pool,
                    options,
                )?;
            }
            SequenceFormat::Fastq => {
                decode_text_file(
                    &task.path,
                    &mut FastqDecoder::new(),
                    FastqDecoder::feed,
                    |d, out| match d.finish(out, stats, &task.path) {
                        Err(_) if options.lenient => Ok(()),
                        other => other,
                    },
                    &mut assembler,
                    pack_pool,
                    options,
                )?;
            }
            SequenceFormat::Bam => {
                bam::decode_bam_file(&task.path, &mut assembler, both_strands)?;
            }
            SequenceFormat::Kmc => {
                kmcdb::replay_database(&task.path, &mut assembler)?;
            }
            SequenceFormat::Auto => {
                return Err(KmerBinError::InternalInvariant(
                    "unresolved Auto format reached the reader".into(),
                ))
            }
        }
        let n = assembler.finish()?;
        stats.n_reads.fetch_add(n, Ordering::Relaxed);
        if let Ok(meta) = std::fs::metadata(&task.path) {
            tracker.add_bytes(meta.len());
        }
        debug!(path = %task.path.display(), reads = n, "input file decoded");
    }
    if stats.missing_newlines.load(Ordering::Relaxed) > 0 {
        warn!(
            files = stats.missing_newlines.load(Ordering::Relaxed),
            "input ended without a trailing newline"
        );
    }
    Ok(())
}

fn decode_text_file<D>(
    path: &Path,
    decoder: &mut D,
    feed: impl Fn(&mut D, &[u8], &mut PartAssembler, &Path) -> Result<()>,
    finish: impl Fn(&mut D, &mut PartAssembler) -> Result<()>,
    assembler: &mut PartAssembler,
    pack_pool: &Arc<MemoryPool>,
    options: ReaderOptions,
) -> Result<()> {
    let reader = open_text_input(path, options.lenient)?;
    let mut reader: Box<dyn Read + Send> = match options.byte_limit {
        Some(limit) => Box::new(reader.take(limit)),
        None => reader,
    };
    let mut pack = pack_pool.reserve()?;
    pack.resize(pack_pool.part_size(), 0);
    loop {
        let n = reader
            .read(&mut pack)
            .map_err(|e| KmerBinError::Decompress {
                path: path.to_path_buf(),
                details: e.to_string(),
            })?;
        if n == 0 {
            break;
        }
        feed(decoder, &pack[..n], assembler, path)?;
    }
    finish(decoder, assembler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queues::ErrorBroker;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn collect_parts(
        content: &[u8],
        format: SequenceFormat,
        k: usize,
        part_size: usize,
    ) -> Result<(Vec<Vec<u8>>, u64)> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input");
        std::fs::write(&path, content).unwrap();

        let broker = ErrorBroker::new();
        let files = WorkQueue::new(1, 4, Arc::clone(&broker));
        let parts = WorkQueue::new(1, 1024, Arc::clone(&broker));
        let pack_pool = MemoryPool::new(2, 1 << 14, Arc::clone(&broker));
        let part_pool = MemoryPool::new(64, part_size, Arc::clone(&broker));
        let stats = Arc::new(ReaderStats::default());

        files
            .push(FileTask {
                path,
                format,
            })
            .unwrap();
        files.mark_completed();
        let tracker = Arc::new(ProgressTracker::new(false));
        reader_worker(
            &files,
            &parts,
            &pack_pool,
            &part_pool,
            k,
            true,
            ReaderOptions::default(),
            &stats,
            &tracker,
        )?;
        parts.mark_completed();

        let mut out = Vec::new();
        while let Some(part) = parts.pop().unwrap() {
            out.push(part.data.to_vec());
        }
        Ok((out, stats.n_reads.load(Ordering::Relaxed)))
    }

    #[test]
    fn fasta_single_record() {
        let (parts, n_reads) =
            collect_parts(b">r1\nACGT\n", SequenceFormat::Fasta, 3, 256).unwrap();
        assert_eq!(n_reads, 1);
        assert_eq!(parts, vec![vec![0, 1, 2, 3, INVALID_SYMBOL]]);
    }

    #[test]
    fn multiline_fasta_joins_lines() {
        let (parts, _) = collect_parts(
            b">r1\nAC\nGT\n>r2\nTT\n",
            SequenceFormat::Fasta,
            2,
            256,
        )
        .unwrap();
        assert_eq!(
            parts,
            vec![vec![0, 1, 2, 3, INVALID_SYMBOL, 3, 3, INVALID_SYMBOL]]
        );
    }

    #[test]
    fn fasta_ns_become_invalid_codes() {
        let (parts, _) = collect_parts(b">r\nANNA\n", SequenceFormat::Fasta, 2, 256).unwrap();
        assert_eq!(
            parts,
            vec![vec![0, INVALID_SYMBOL, INVALID_SYMBOL, 0, INVALID_SYMBOL]]
        );
    }

    #[test]
    fn fastq_record_with_tricky_quality() {
        let (parts, n_reads) = collect_parts(
            b"@r1\nACGT\n+\n@>!+\n@r2\nGG\n+\nII\n",
            SequenceFormat::Fastq,
            2,
            256,
        )
        .unwrap();
        assert_eq!(n_reads, 2);
        assert_eq!(
            parts,
            vec![vec![0, 1, 2, 3, INVALID_SYMBOL, 2, 2, INVALID_SYMBOL]]
        );
    }

    #[test]
    fn fastq_short_quality_is_rejected() {
        let err = collect_parts(b"@r\nACGT\n+\nII\n", SequenceFormat::Fastq, 2, 256);
        assert!(err.is_err());
    }

    #[test]
    fn long_read_spills_with_overlap() {
        // Part size 8, k=4: a 12-symbol read spans two parts with a
        // 3-code overlap.
        let (parts, _) =
            collect_parts(b">r\nACGTACGTACGT\n", SequenceFormat::Fasta, 4, 8).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].len(), 8);
        assert_eq!(&parts[1][..3], &parts[0][5..]);
        // Every 4-window appears exactly once across parts.
        let n_windows =
            (parts[0].len() - 3) + (parts[1].iter().filter(|&&c| c != INVALID_SYMBOL).count() - 3);
        assert_eq!(n_windows, 12 - 4 + 1);
    }

    #[test]
    fn gzip_input_is_inflated() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b">r\nACGT\n").unwrap();
        let gz = enc.finish().unwrap();
        let (parts, _) = collect_parts(&gz, SequenceFormat::Fasta, 2, 256).unwrap();
        assert_eq!(parts, vec![vec![0, 1, 2, 3, INVALID_SYMBOL]]);
    }

    #[test]
    fn multistream_gzip_with_trailing_garbage() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b">a\nAC\n").unwrap();
        let mut data = enc.finish().unwrap();
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b">b\nGT\n").unwrap();
        data.extend_from_slice(&enc.finish().unwrap());
        data.extend_from_slice(b"\0\0junk");

        let (parts, n_reads) = collect_parts(&data, SequenceFormat::Fasta, 2, 256).unwrap();
        assert_eq!(n_reads, 2);
        assert_eq!(
            parts,
            vec![vec![0, 1, INVALID_SYMBOL, 2, 3, INVALID_SYMBOL]]
        );
    }

    #[test]
    fn malformed_fasta_header_aborts() {
        assert!(collect_parts(b"ACGT\n", SequenceFormat::Fasta, 2, 256).is_err());
    }
}
