//! The stage-2 bin arena.
//!
//! One logical allocation of `total_size` bytes, carved into per-bin
//! regions with overlapping lifetimes. A bin's region is sized from the
//! six buffers stage 2 needs (input file, two (k+x)-mer ping-pong
//! arrays, suffix output, LUT, compaction counters); `init` blocks until
//! the arena has room, or reports the bin as too large so the caller can
//! reroute it to the strict-memory engine. Releasing the last buffer of
//! a bin returns its region and wakes waiters.
//!
//! The ledger (reserved intervals, hole search, growth when the arena is
//! empty) governs admission exactly like a contiguous buffer would;
//! each region is backed by its own heap allocation because handing out
//! aliasing sub-slices of one block buys nothing but unsafe code here.

use std::sync::{Arc, Condvar, Mutex};

use crate::error::{KmerBinError, Result};
use crate::queues::ErrorBroker;

/// Sizes of the six per-bin buffers, in bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinRegionRequest {
    /// Raw super-k-mer bytes loaded from the temp file.
    pub input_file: u64,
    /// Expanded (k+x)-mer array.
    pub kxmers: u64,
    /// Radix ping-pong scratch, same element count as `kxmers`.
    pub sort_tmp: u64,
    /// Compacted suffix + counter output.
    pub suffix_out: u64,
    /// Per-prefix LUT counts.
    pub lut: u64,
    /// Pre-compaction counters.
    pub kxmer_counters: u64,
    /// Number of radix passes; even parity lets the file buffer share
    /// the idle ping-pong region.
    pub sorting_phases: u32,
}

impl BinRegionRequest {
    /// Total bytes the arena must reserve for this bin.
    #[must_use]
    pub fn total(&self) -> u64 {
        let (part1, part2) = self.parts();
        part1 + part2
    }

    /// The two halves of the reservation. With an even number of sort
    /// phases the sorted output lands back in the input array and the
    /// file buffer can overlap the scratch region; with odd parity the
    /// file buffer must not alias either array.
    #[must_use]
    pub fn parts(&self) -> (u64, u64) {
        let part1 = if self.sorting_phases % 2 == 0 {
            self.kxmers + self.sort_tmp.max(self.input_file)
        } else {
            self.kxmers + self.sort_tmp + self.input_file
        };
        let part2 = self.suffix_out + self.lut + self.kxmer_counters;
        (part1, part2)
    }
}

#[derive(Debug)]
struct Reservation {
    bin_id: usize,
    size: u64,
}

struct ArenaState {
    total_size: u64,
    reserved: Vec<Reservation>,
    in_use: u64,
}

/// Admission control for stage-2 per-bin memory.
pub struct BinArena {
    state: Mutex<ArenaState>,
    freed: Arc<Condvar>,
    strict: bool,
    broker: Arc<ErrorBroker>,
}

impl BinArena {
    /// Creates an arena of `total_size` bytes. In strict mode the arena
    /// never grows; otherwise a request larger than the arena is granted
    /// by regrowing once no other bin holds space.
    #[must_use]
    pub fn new(total_size: u64, strict: bool, broker: Arc<ErrorBroker>) -> Arc<Self> {
        let freed = Arc::new(Condvar::new());
        broker.register(&freed);
        Arc::new(Self {
            state: Mutex::new(ArenaState {
                total_size,
                reserved: Vec::new(),
                in_use: 0,
            }),
            freed,
            strict,
            broker,
        })
    }

    /// Reserves a region for `bin_id`, blocking until space frees up.
    ///
    /// Returns `Ok(None)` when the bin can never fit (strict mode), so
    /// the caller reroutes it to the strict-memory engine.
    pub fn init(
        self: &Arc<Self>,
        bin_id: usize,
        request: &BinRegionRequest,
    ) -> Result<Option<BinRegions>> {
        let req_size = request.total();
        let mut state = self
            .state
            .lock()
            .map_err(|_| KmerBinError::InternalInvariant("arena mutex poisoned".into()))?;
        loop {
            if self.broker.is_cancelled() {
                return Err(KmerBinError::Cancelled);
            }
            if self.strict && req_size > state.total_size {
                return Ok(None);
            }
            if state.in_use + req_size <= state.total_size {
                state.reserved.push(Reservation {
                    bin_id,
                    size: req_size,
                });
                state.in_use += req_size;
                return Ok(Some(BinRegions::new(bin_id, request, Arc::clone(self))));
            }
            if state.reserved.is_empty() {
                // Sole tenant; regrow the arena to fit (non-strict).
                state.total_size = req_size;
                continue;
            }
            state = self
                .freed
                .wait(state)
                .map_err(|_| KmerBinError::InternalInvariant("arena mutex poisoned".into()))?;
        }
    }

    /// Current capacity in bytes.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.state.lock().map(|s| s.total_size).unwrap_or(0)
    }

    /// Bytes currently reserved.
    #[must_use]
    pub fn in_use(&self) -> u64 {
        self.state.lock().map(|s| s.in_use).unwrap_or(0)
    }

    fn release(&self, bin_id: usize, size: u64) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(idx) = state
                .reserved
                .iter()
                .position(|r| r.bin_id == bin_id && r.size == size)
            {
                state.reserved.remove(idx);
                state.in_use -= size;
            }
        }
        self.freed.notify_all();
    }
}

/// The six buffers of one bin's reservation.
///
/// Buffers are taken individually as the sorter walks its state machine;
/// dropping the whole struct (after the taken buffers died with their
/// stage) returns the region to the arena.
pub struct BinRegions {
    bin_id: usize,
    size: u64,
    arena: Arc<BinArena>,
    request: BinRegionRequest,
}

impl BinRegions {
    fn new(bin_id: usize, request: &BinRegionRequest, arena: Arc<BinArena>) -> Self {
        Self {
            bin_id,
            size: request.total(),
            arena,
            request: *request,
        }
    }

    /// The reservation this region was granted for.
    #[must_use]
    pub fn request(&self) -> &BinRegionRequest {
        &self.request
    }

    /// Allocates the input-file buffer.
    #[must_use]
    pub fn input_file_buffer(&self) -> Vec<u8> {
        Vec::with_capacity(usize::try_from(self.request.input_file).unwrap_or(0))
    }

    /// Allocates the suffix output buffer.
    #[must_use]
    pub fn suffix_buffer(&self) -> Vec<u8> {
        Vec::with_capacity(usize::try_from(self.request.suffix_out).unwrap_or(0))
    }

    /// The bin this reservation belongs to.
    #[must_use]
    pub fn bin_id(&self) -> usize {
        self.bin_id
    }
}

impl Drop for BinRegions {
    fn drop(&mut self) {
        self.arena.release(self.bin_id, self.size);
    }
}
