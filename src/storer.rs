//! Bin storer.
//!
//! Drains the bin-part queue into per-bin pending lists within a global
//! memory budget. Whenever pending bytes exceed `max_total` or the
//! largest single bin exceeds `max_per_bin`, that bin's buffers are
//! concatenated into one contiguous write and returned to the pool. On
//! completion every non-empty bin is flushed, so stage 2 always sees
//! fully materialised temp files.

use std::sync::Arc;

use tracing::debug;

use crate::bins::{BinCounters, BinDescriptorTable};
use crate::error::Result;
use crate::pool::PoolBuffer;
use crate::queues::WorkQueue;
use crate::splitter::BinPart;

struct PendingBin {
    buffers: Vec<PoolBuffer>,
    bytes: u64,
    counters: BinCounters,
}

/// Storer worker: the single writer of the bin descriptor table.
pub fn storer_worker(
    queue: &Arc<WorkQueue<BinPart>>,
    table: &Arc<BinDescriptorTable>,
    max_total: u64,
    max_per_bin: u64,
) -> Result<()> {
    let n_bins = table.n_bins();
    let mut pending: Vec<PendingBin> = (0..n_bins)
        .map(|_| PendingBin {
            buffers: Vec::new(),
            bytes: 0,
            counters: BinCounters::default(),
        })
        .collect();
    let mut total_bytes = 0u64;
    let mut max_bin = 0usize;
    let mut flushes = 0u64;

    while let Some(part) = queue.pop()? {
        let bin_id = part.bin_id;
        total_bytes += part.data.len() as u64;
        let bin = &mut pending[bin_id];
        bin.bytes += part.data.len() as u64;
        bin.counters.n_kmers += part.stats.n_kmers;
        bin.counters.n_plus_x_recs += part.stats.n_plus_x_recs;
        bin.counters.n_super_kmers += part.stats.n_super_kmers;
        bin.buffers.push(part.data);
        let bin_bytes = bin.bytes;

        if bin_bytes > pending[max_bin].bytes {
            max_bin = bin_id;
        }

        if total_bytes >= max_total || pending[max_bin].bytes >= max_per_bin {
            total_bytes -= flush_bin(table, max_bin, &mut pending[max_bin])?;
            flushes += 1;
            max_bin = (0..n_bins)
                .max_by_key(|&i| pending[i].bytes)
                .unwrap_or(0);
        }
    }

    for (bin_id, bin) in pending.iter_mut().enumerate() {
        if bin.bytes > 0 {
            flush_bin(table, bin_id, bin)?;
            flushes += 1;
        }
    }
    debug!(flushes, "bin storer finished");
    Ok(())
}

/// Concatenates a bin's pending buffers into one write and resets it.
fn flush_bin(
    table: &Arc<BinDescriptorTable>,
    bin_id: usize,
    bin: &mut PendingBin,
) -> Result<u64> {
    if bin.bytes == 0 {
        return Ok(0);
    }
    let mut contiguous = Vec::with_capacity(usize::try_from(bin.bytes).unwrap_or(0));
    for buffer in bin.buffers.drain(..) {
        contiguous.extend_from_slice(&buffer);
        // Buffer returns to its pool here.
    }
    table.write_segment(bin_id, &contiguous, bin.counters)?;
    let flushed = bin.bytes;
    bin.bytes = 0;
    bin.counters = BinCounters::default();
    Ok(flushed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MemoryPool;
    use crate::queues::ErrorBroker;
    use crate::splitter::BinStatsDelta;

    fn part(pool: &Arc<MemoryPool>, bin_id: usize, payload: &[u8], n_kmers: u64) -> BinPart {
        let mut data = pool.reserve().unwrap();
        data.extend_from_slice(payload);
        BinPart {
            bin_id,
            data,
            stats: BinStatsDelta {
                n_kmers,
                n_plus_x_recs: n_kmers,
                n_super_kmers: 1,
            },
        }
    }

    #[test]
    fn drains_queue_and_flushes_all_bins() {
        let dir = tempfile::tempdir().unwrap();
        let broker = ErrorBroker::new();
        let queue = WorkQueue::new(1, 64, Arc::clone(&broker));
        let pool = MemoryPool::new(8, 64, broker);
        let table = Arc::new(BinDescriptorTable::new(4, dir.path(), false));

        queue.push(part(&pool, 0, b"aa", 2)).unwrap();
        queue.push(part(&pool, 3, b"bbb", 3)).unwrap();
        queue.push(part(&pool, 0, b"c", 1)).unwrap();
        queue.mark_completed();

        storer_worker(&queue, &table, 1 << 20, 1 << 20).unwrap();

        assert_eq!(table.read_all(0).unwrap(), b"aac");
        assert_eq!(table.read_all(3).unwrap(), b"bbb");
        let c0 = table.counters(0).unwrap();
        assert_eq!(c0.n_kmers, 3);
        assert_eq!(c0.n_super_kmers, 2);
    }

    #[test]
    fn pending_buffers_concatenate_into_single_segment() {
        let dir = tempfile::tempdir().unwrap();
        let broker = ErrorBroker::new();
        let queue = WorkQueue::new(1, 64, Arc::clone(&broker));
        let pool = MemoryPool::new(8, 64, broker);
        let table = Arc::new(BinDescriptorTable::new(2, dir.path(), false));

        queue.push(part(&pool, 1, b"aa", 2)).unwrap();
        queue.push(part(&pool, 1, b"bb", 2)).unwrap();
        queue.mark_completed();
        storer_worker(&queue, &table, 1 << 20, 1 << 20).unwrap();

        // Both parts flushed together as one contiguous write.
        assert_eq!(table.segments(1).unwrap(), vec![(0, 4)]);
    }

    #[test]
    fn per_bin_threshold_forces_early_flush() {
        let dir = tempfile::tempdir().unwrap();
        let broker = ErrorBroker::new();
        let queue = WorkQueue::new(1, 64, Arc::clone(&broker));
        let pool = MemoryPool::new(8, 64, broker);
        let table = Arc::new(BinDescriptorTable::new(2, dir.path(), false));

        queue.push(part(&pool, 0, b"aaaa", 4)).unwrap();
        queue.push(part(&pool, 0, b"bbbb", 4)).unwrap();
        queue.mark_completed();
        // max_per_bin = 4 forces a flush after the first part.
        storer_worker(&queue, &table, 1 << 20, 4).unwrap();

        assert_eq!(table.segments(0).unwrap(), vec![(0, 4), (4, 8)]);
        assert_eq!(table.read_all(0).unwrap(), b"aaaabbbb");
    }
}
