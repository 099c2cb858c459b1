//! Bin descriptor table and temp files.
//!
//! Every bin owns an append-only temp file of super-k-mer records (on
//! disk under the working directory, or a RAM buffer with `-r`) plus its
//! running counters. Stage 1's storer is the only writer; stage 2 reads
//! each bin once, in size-descending order, and releases it afterwards.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{KmerBinError, Result};

enum TempStore {
    Unopened,
    Disk { file: File, path: PathBuf },
    Ram(Vec<u8>),
    Released,
}

/// One bin's temp storage and counters.
struct BinDescriptor {
    store: TempStore,
    size: u64,
    n_kmers: u64,
    n_plus_x_recs: u64,
    n_super_kmers: u64,
    /// Byte spans of the contiguous writes, so strict-memory reads can
    /// stay aligned to whole super-k-mer packs.
    segments: Vec<(u64, u64)>,
}

/// Counter snapshot for one bin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BinCounters {
    /// Total bytes written.
    pub size: u64,
    /// K-mers across all super-k-mers.
    pub n_kmers: u64,
    /// Expansion records stage 2 will produce.
    pub n_plus_x_recs: u64,
    /// Super-k-mer records.
    pub n_super_kmers: u64,
}

/// The lock-protected table of all bins.
pub struct BinDescriptorTable {
    bins: Mutex<Vec<BinDescriptor>>,
    tmp_dir: PathBuf,
    ram_only: bool,
}

impl BinDescriptorTable {
    /// Creates descriptors for `n_bins` bins under `tmp_dir`.
    #[must_use]
    pub fn new(n_bins: usize, tmp_dir: &Path, ram_only: bool) -> Self {
        let bins = (0..n_bins)
            .map(|_| BinDescriptor {
                store: TempStore::Unopened,
                size: 0,
                n_kmers: 0,
                n_plus_x_recs: 0,
                n_super_kmers: 0,
                segments: Vec::new(),
            })
            .collect();
        Self {
            bins: Mutex::new(bins),
            tmp_dir: tmp_dir.to_path_buf(),
            ram_only,
        }
    }

    fn temp_path(&self, bin_id: usize) -> PathBuf {
        self.tmp_dir.join(format!("kmc_{bin_id:05}.bin"))
    }

    /// Number of bins.
    #[must_use]
    pub fn n_bins(&self) -> usize {
        self.bins.lock().map(|b| b.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<BinDescriptor>>> {
        self.bins
            .lock()
            .map_err(|_| KmerBinError::InternalInvariant("bin table mutex poisoned".into()))
    }

    /// Appends one contiguous pack of records and accounts its counters.
    pub fn write_segment(&self, bin_id: usize, data: &[u8], counters: BinCounters) -> Result<()> {
        let path = self.temp_path(bin_id);
        let mut bins = self.lock()?;
        let bin = &mut bins[bin_id];
        let start = bin.size;

        match &mut bin.store {
            TempStore::Unopened => {
                if self.ram_only {
                    bin.store = TempStore::Ram(data.to_vec());
                } else {
                    let mut file = OpenOptions::new()
                        .create(true)
                        .truncate(true)
                        .read(true)
                        .write(true)
                        .open(&path)
                        .map_err(|e| KmerBinError::io(e, &path))?;
                    file.write_all(data).map_err(|e| KmerBinError::io(e, &path))?;
                    bin.store = TempStore::Disk { file, path };
                }
            }
            TempStore::Ram(buf) => buf.extend_from_slice(data),
            TempStore::Disk { file, path } => {
                file.write_all(data).map_err(|e| KmerBinError::io(e, path.as_path()))?;
            }
            TempStore::Released => {
                return Err(KmerBinError::InternalInvariant(format!(
                    "write to released bin {bin_id}"
                )))
            }
        }

        bin.size += data.len() as u64;
        bin.n_kmers += counters.n_kmers;
        bin.n_plus_x_recs += counters.n_plus_x_recs;
        bin.n_super_kmers += counters.n_super_kmers;
        bin.segments.push((start, start + data.len() as u64));
        Ok(())
    }

    /// Counter snapshot for one bin.
    pub fn counters(&self, bin_id: usize) -> Result<BinCounters> {
        let bins = self.lock()?;
        let bin = &bins[bin_id];
        Ok(BinCounters {
            size: bin.size,
            n_kmers: bin.n_kmers,
            n_plus_x_recs: bin.n_plus_x_recs,
            n_super_kmers: bin.n_super_kmers,
        })
    }

    /// Sum of counters over all bins.
    pub fn totals(&self) -> Result<BinCounters> {
        let bins = self.lock()?;
        let mut total = BinCounters::default();
        for bin in bins.iter() {
            total.size += bin.size;
            total.n_kmers += bin.n_kmers;
            total.n_plus_x_recs += bin.n_plus_x_recs;
            total.n_super_kmers += bin.n_super_kmers;
        }
        Ok(total)
    }

    /// Bin ids ordered by decreasing expansion-record count, the order
    /// stage 2 schedules sorting in.
    pub fn ids_by_descending_size(&self) -> Result<Vec<usize>> {
        let bins = self.lock()?;
        let mut ids: Vec<usize> = (0..bins.len()).collect();
        ids.sort_by_key(|&id| std::cmp::Reverse((bins[id].n_plus_x_recs, bins[id].size)));
        Ok(ids)
    }

    /// Byte spans of the contiguous writes for one bin.
    pub fn segments(&self, bin_id: usize) -> Result<Vec<(u64, u64)>> {
        Ok(self.lock()?[bin_id].segments.clone())
    }

    /// Reads the whole bin back, rewinding the temp file.
    pub fn read_all(&self, bin_id: usize) -> Result<Vec<u8>> {
        let mut bins = self.lock()?;
        let bin = &mut bins[bin_id];
        match &mut bin.store {
            TempStore::Unopened => Ok(Vec::new()),
            TempStore::Ram(buf) => Ok(buf.clone()),
            TempStore::Disk { file, path } => {
                file.seek(SeekFrom::Start(0))
                    .map_err(|e| KmerBinError::io(e, path.as_path()))?;
                let mut data = Vec::with_capacity(usize::try_from(bin.size).unwrap_or(0));
                file.read_to_end(&mut data)
                    .map_err(|e| KmerBinError::io(e, path.as_path()))?;
                if data.len() as u64 != bin.size {
                    return Err(KmerBinError::InternalInvariant(format!(
                        "bin {bin_id} temp file holds {} bytes, descriptor says {}",
                        data.len(),
                        bin.size
                    )));
                }
                Ok(data)
            }
            TempStore::Released => Err(KmerBinError::InternalInvariant(format!(
                "read from released bin {bin_id}"
            ))),
        }
    }

    /// Reads one byte span of a bin's temp storage.
    pub fn read_span(&self, bin_id: usize, start: u64, end: u64) -> Result<Vec<u8>> {
        let mut bins = self.lock()?;
        let bin = &mut bins[bin_id];
        let len = usize::try_from(end - start).unwrap_or(0);
        match &mut bin.store {
            TempStore::Ram(buf) => {
                let s = usize::try_from(start).unwrap_or(0);
                Ok(buf[s..s + len].to_vec())
            }
            TempStore::Disk { file, path } => {
                file.seek(SeekFrom::Start(start))
                    .map_err(|e| KmerBinError::io(e, path.as_path()))?;
                let mut data = vec![0u8; len];
                file.read_exact(&mut data)
                    .map_err(|e| KmerBinError::io(e, path.as_path()))?;
                Ok(data)
            }
            _ => Err(KmerBinError::InternalInvariant(format!(
                "span read from empty or released bin {bin_id}"
            ))),
        }
    }

    /// Drops the bin's temp storage, deleting the file from disk.
    pub fn release(&self, bin_id: usize) -> Result<()> {
        let mut bins = self.lock()?;
        let bin = &mut bins[bin_id];
        let store = std::mem::replace(&mut bin.store, TempStore::Released);
        if let TempStore::Disk { file, path } = store {
            drop(file);
            std::fs::remove_file(&path).map_err(|e| KmerBinError::io(e, &path))?;
        }
        Ok(())
    }
}
