//! Pipeline orchestration.
//!
//! Wires the stages together: an optional estimation pass, the
//! signature-map training pass, stage 1 (read → split → store), the
//! between-stage sizing decisions (counter width, LUT prefix length),
//! stage 2 (sort → complete), and the strict-memory stage for deferred
//! bins. Worker threads report their first error to the broker; the
//! runner re-raises it after every thread has unwound.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, info};

use crate::arena::BinArena;
use crate::bins::BinDescriptorTable;
use crate::completer::{Completer, CompleterParams};
use crate::config::{
    choose_lut_prefix_len, counter_size, Config, MappingScheme, MemoryLayout, OutputFormat,
};
use crate::error::{KmerBinError, Result};
use crate::estimator::NtHashEstimator;
use crate::mapper::SignatureMapper;
use crate::pool::MemoryPool;
use crate::progress::ProgressTracker;
use crate::queues::{ErrorBroker, SequencedQueue, WorkQueue};
use crate::reader::{reader_worker, DecodedPart, FileTask, ReaderOptions, ReaderStats};
use crate::signature::SignatureNorm;
use crate::sorter::{sorter_worker, SortParams};
use crate::splitter::{splitter_worker, stats_worker};
use crate::storer::storer_worker;
use crate::strict::{self, StrictBudget};
use crate::summary::{StageTimes, Summary, SummaryStats};

/// Bytes sampled per file by the signature-training pass.
const STATS_SAMPLE_BYTES: u64 = 1 << 25;

fn report_on_err(broker: &Arc<ErrorBroker>, result: Result<()>) {
    if let Err(err) = result {
        broker.report(err);
    }
}

fn raise_broker_error(broker: &Arc<ErrorBroker>) -> Result<()> {
    match broker.take_error() {
        Some(err) => Err(err),
        None if broker.is_cancelled() => Err(KmerBinError::InternalInvariant(
            "pipeline cancelled without a recorded error".into(),
        )),
        None => Ok(()),
    }
}

fn file_tasks(config: &Config) -> Vec<FileTask> {
    config
        .inputs
        .iter()
        .map(|path| FileTask {
            path: path.clone(),
            format: config.input_format.resolve(path),
        })
        .collect()
}

fn total_input_bytes(config: &Config) -> u64 {
    config
        .inputs
        .iter()
        .filter_map(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .sum()
}

/// Runs one reading pass, fanning decoded parts into `consume` workers.
fn reading_pass<F>(
    config: &Config,
    layout: &MemoryLayout,
    options: ReaderOptions,
    tracker: &Arc<ProgressTracker>,
    stats: &Arc<ReaderStats>,
    n_consumers: usize,
    consume: F,
) -> Result<()>
where
    F: Fn(usize, &Arc<WorkQueue<DecodedPart>>) -> Result<()> + Sync,
{
    let broker = ErrorBroker::new();
    let files: Arc<WorkQueue<FileTask>> =
        WorkQueue::new(1, config.inputs.len().max(1), Arc::clone(&broker));
    let parts: Arc<WorkQueue<DecodedPart>> =
        WorkQueue::new(config.n_readers, layout.part_queue_capacity, Arc::clone(&broker));
    let pack_pool = MemoryPool::new(layout.pack_parts, layout.pack_size, Arc::clone(&broker));
    let part_pool = MemoryPool::new(layout.part_parts, layout.part_size, Arc::clone(&broker));

    for task in file_tasks(config) {
        files.push(task)?;
    }
    files.mark_completed();

    std::thread::scope(|scope| {
        for _ in 0..config.n_readers {
            let files = Arc::clone(&files);
            let parts = Arc::clone(&parts);
            let pack_pool = Arc::clone(&pack_pool);
            let part_pool = Arc::clone(&part_pool);
            let broker = Arc::clone(&broker);
            let stats = Arc::clone(stats);
            let tracker = Arc::clone(tracker);
            let k = config.k.get();
            let both_strands = config.both_strands;
            scope.spawn(move || {
                let result = reader_worker(
                    &files,
                    &parts,
                    &pack_pool,
                    &part_pool,
                    k,
                    both_strands,
                    options,
                    &stats,
                    &tracker,
                );
                parts.mark_completed();
                report_on_err(&broker, result);
            });
        }
        for consumer_id in 0..n_consumers {
            let parts = Arc::clone(&parts);
            let broker = Arc::clone(&broker);
            let consume = &consume;
            scope.spawn(move || {
                report_on_err(&broker, consume(consumer_id, &parts));
            });
        }
    });
    raise_broker_error(&broker)
}

fn build_mapper(
    config: &Config,
    layout: &MemoryLayout,
    norm: &Arc<SignatureNorm>,
) -> Result<SignatureMapper> {
    let effective = norm.signature_len();
    match &config.mapping_scheme {
        MappingScheme::MinHash => Ok(SignatureMapper::min_hash(effective, config.n_bins)),
        MappingScheme::FromFile(path) => {
            SignatureMapper::from_file(path, effective, config.n_bins)
        }
        MappingScheme::Stats => {
            let per_worker: Vec<Mutex<Vec<u64>>> = (0..config.n_splitters)
                .map(|_| Mutex::new(vec![0u64; effective.map_size()]))
                .collect();
            let tracker = Arc::new(ProgressTracker::new(false));
            let stats = Arc::new(ReaderStats::default());
            let options = ReaderOptions {
                byte_limit: Some(STATS_SAMPLE_BYTES),
                lenient: true,
            };
            let k = config.k.get();
            let hc = config.homopolymer_compressed;
            reading_pass(
                config,
                layout,
                options,
                &tracker,
                &stats,
                config.n_splitters,
                |id, parts| {
                    let mut local = per_worker[id]
                        .lock()
                        .map_err(|_| {
                            KmerBinError::InternalInvariant("stats vector poisoned".into())
                        })?;
                    stats_worker(parts, norm, k, hc, &mut local)
                },
            )?;

            let mut merged = vec![0u64; effective.map_size()];
            for slot in &per_worker {
                let local = slot
                    .lock()
                    .map_err(|_| KmerBinError::InternalInvariant("stats vector poisoned".into()))?;
                for (total, &value) in merged.iter_mut().zip(local.iter()) {
                    *total += value;
                }
            }
            debug!(
                sampled_kmers = merged.iter().sum::<u64>(),
                "signature statistics collected"
            );
            Ok(SignatureMapper::from_stats(
                effective,
                config.n_bins,
                &merged,
            ))
        }
    }
}

/// Runs the whole pipeline and returns the run summary.
pub fn run(config: &Config) -> Result<Summary> {
    let t_start = Instant::now();
    let layout = MemoryLayout::derive(config);
    let k = config.k.get();
    let effective_p = config.signature_len.effective(k);
    if effective_p.get() != config.signature_len.get() {
        tracing::warn!(
            requested = config.signature_len.get(),
            used = effective_p.get(),
            "signature length clamped to the k-mer length"
        );
    }
    let norm = Arc::new(SignatureNorm::new(effective_p));
    let tracker = Arc::new(ProgressTracker::new(!config.hide_progress));
    tracker.set_total(total_input_bytes(config));

    let estimator = config
        .estimate_histogram
        .as_ref()
        .map(|_| Arc::new(NtHashEstimator::new(config.both_strands)));

    if config.estimate_only {
        let stats = Arc::new(ReaderStats::default());
        let est = estimator
            .as_ref()
            .ok_or_else(|| KmerBinError::Config("estimation requires an output path".into()))?;
        reading_pass(
            config,
            &layout,
            ReaderOptions::default(),
            &tracker,
            &stats,
            config.n_splitters,
            |_, parts| {
                while let Some(part) = parts.pop()? {
                    est.process(&part.data, k);
                }
                Ok(())
            },
        )?;
        if let Some(path) = &config.estimate_histogram {
            est.write_histogram(path)?;
        }
        tracker.finish();
        let elapsed = t_start.elapsed().as_secs_f64();
        return Ok(Summary {
            k,
            both_strands: config.both_strands,
            n_bins: config.n_bins,
            lut_prefix_len: 0,
            counter_size: 0,
            stats: SummaryStats {
                total_reads: stats.n_reads.load(Ordering::Relaxed),
                ..SummaryStats::default()
            },
            times: StageTimes {
                stage1_sec: elapsed,
                stage2_sec: 0.0,
                total_sec: elapsed,
            },
        });
    }

    // Signature→bin map, built before stage 1 and read-only afterwards.
    let mapper = Arc::new(build_mapper(config, &layout, &norm)?);
    info!(
        n_bins = config.n_bins,
        signature_len = effective_p.get(),
        "signature map ready"
    );

    // Stage 1: distribute super-k-mers over bins.
    let table = Arc::new(BinDescriptorTable::new(
        config.n_bins,
        &config.tmp_dir,
        config.ram_only,
    ));
    let reader_stats = Arc::new(ReaderStats::default());
    {
        let broker = ErrorBroker::new();
        let files: Arc<WorkQueue<FileTask>> =
            WorkQueue::new(1, config.inputs.len().max(1), Arc::clone(&broker));
        let parts: Arc<WorkQueue<DecodedPart>> = WorkQueue::new(
            config.n_readers,
            layout.part_queue_capacity,
            Arc::clone(&broker),
        );
        let bin_parts = WorkQueue::new(
            config.n_splitters,
            layout.bin_queue_capacity,
            Arc::clone(&broker),
        );
        let pack_pool = MemoryPool::new(layout.pack_parts, layout.pack_size, Arc::clone(&broker));
        let part_pool = MemoryPool::new(layout.part_parts, layout.part_size, Arc::clone(&broker));
        let bin_pool =
            MemoryPool::new(layout.bin_parts, layout.bin_part_size, Arc::clone(&broker));

        for task in file_tasks(config) {
            files.push(task)?;
        }
        files.mark_completed();

        std::thread::scope(|scope| {
            for _ in 0..config.n_readers {
                let files = Arc::clone(&files);
                let parts = Arc::clone(&parts);
                let pack_pool = Arc::clone(&pack_pool);
                let part_pool = Arc::clone(&part_pool);
                let broker = Arc::clone(&broker);
                let stats = Arc::clone(&reader_stats);
                let tracker = Arc::clone(&tracker);
                let both_strands = config.both_strands;
                scope.spawn(move || {
                    let result = reader_worker(
                        &files,
                        &parts,
                        &pack_pool,
                        &part_pool,
                        k,
                        both_strands,
                        ReaderOptions::default(),
                        &stats,
                        &tracker,
                    );
                    parts.mark_completed();
                    report_on_err(&broker, result);
                });
            }
            for _ in 0..config.n_splitters {
                let parts = Arc::clone(&parts);
                let bin_parts = Arc::clone(&bin_parts);
                let bin_pool = Arc::clone(&bin_pool);
                let mapper = Arc::clone(&mapper);
                let norm = Arc::clone(&norm);
                let broker = Arc::clone(&broker);
                let estimator = estimator.clone();
                let both_strands = config.both_strands;
                let hc = config.homopolymer_compressed;
                scope.spawn(move || {
                    let result = splitter_worker(
                        &parts,
                        &bin_parts,
                        &bin_pool,
                        &mapper,
                        &norm,
                        k,
                        both_strands,
                        hc,
                        estimator.as_ref(),
                    );
                    bin_parts.mark_completed();
                    report_on_err(&broker, result);
                });
            }
            {
                let bin_parts = Arc::clone(&bin_parts);
                let table = Arc::clone(&table);
                let broker = Arc::clone(&broker);
                let max_total = layout.max_mem_storer;
                let max_pkg = layout.max_mem_storer_pkg;
                scope.spawn(move || {
                    report_on_err(
                        &broker,
                        storer_worker(&bin_parts, &table, max_total, max_pkg),
                    );
                });
            }
        });
        raise_broker_error(&broker)?;
    }
    tracker.finish();
    let stage1_sec = t_start.elapsed().as_secs_f64();
    let bin_totals = table.totals()?;
    let n_reads = reader_stats.n_reads.load(Ordering::Relaxed);
    info!(
        n_reads,
        super_kmers = bin_totals.n_super_kmers,
        kmers = bin_totals.n_kmers,
        temp_bytes = bin_totals.size,
        "stage 1 complete"
    );

    if let (Some(est), Some(path)) = (&estimator, &config.estimate_histogram) {
        est.write_histogram(path)?;
    }

    // Between-stage sizing.
    let counter_bytes = counter_size(config.cutoff_max, config.counter_max);
    let n_est_unique = estimator
        .as_ref()
        .map_or(4 * n_reads, |est| {
            est.estimate()
                .n_unique_in_range(config.cutoff_min, config.cutoff_max)
        });
    let lut_prefix_len = match config.output_format {
        OutputFormat::Kmc => choose_lut_prefix_len(k, config.n_bins, n_est_unique),
        OutputFormat::Kff => 0,
    };
    debug!(lut_prefix_len, counter_bytes, n_est_unique, "stage 2 sizing");

    let sort_params = SortParams {
        k,
        kxmer_words: config.k.kxmer_words(),
        both_strands: config.both_strands,
        cutoff_min: config.cutoff_min,
        cutoff_max: config.cutoff_max,
        counter_max: config.counter_max,
        counter_size: counter_bytes,
        lut_prefix_len,
    };
    let mut completer = Completer::new(CompleterParams {
        output_path: config.output_path.clone(),
        k,
        counter_size: counter_bytes,
        lut_prefix_len,
        signature_len: effective_p.get(),
        cutoff_min: config.cutoff_min,
        cutoff_max: config.cutoff_max,
        both_strands: config.both_strands,
        n_bins: config.n_bins,
        without_output: config.without_output,
        kff: config.output_format == OutputFormat::Kff,
    })?;

    // Stage 2: sort bins largest-first, complete in bin-id order.
    let broker = ErrorBroker::new();
    let arena = BinArena::new(layout.arena_bytes, config.strict_memory, Arc::clone(&broker));
    let bin_queue: Arc<WorkQueue<usize>> =
        WorkQueue::new(1, config.n_bins.max(1), Arc::clone(&broker));
    let output = SequencedQueue::new(config.n_sorters, Arc::clone(&broker));
    let deferred = Arc::new(Mutex::new(Vec::new()));

    for bin_id in table.ids_by_descending_size()? {
        bin_queue.push(bin_id)?;
    }
    bin_queue.mark_completed();

    let drained = std::thread::scope(|scope| {
        for _ in 0..config.n_sorters {
            let bin_queue = Arc::clone(&bin_queue);
            let table = Arc::clone(&table);
            let arena = Arc::clone(&arena);
            let output = Arc::clone(&output);
            let deferred = Arc::clone(&deferred);
            let broker = Arc::clone(&broker);
            scope.spawn(move || {
                let result =
                    sorter_worker(&bin_queue, &table, &arena, &output, &deferred, sort_params);
                output.mark_completed();
                report_on_err(&broker, result);
            });
        }
        completer.drain(&output)
    });
    let deferred_bins = match drained {
        Ok(bins) => bins,
        Err(err) => {
            broker.report(err);
            raise_broker_error(&broker)?;
            unreachable!("broker held no error after cancellation")
        }
    };
    raise_broker_error(&broker)?;

    // Strict-memory stage for the bins the arena refused.
    if !deferred_bins.is_empty() {
        info!(
            bins = deferred_bins.len(),
            "running strict-memory fallback"
        );
        let budget = StrictBudget {
            chunk_records: layout.strict_chunk_records,
            n_sorting_threads: config.n_sorters,
        };
        for bin_id in deferred_bins {
            let sorted = strict::process_bin(
                bin_id,
                &table,
                sort_params,
                &config.tmp_dir,
                budget,
                &broker,
            )?;
            completer.add_bin(bin_id, sorted)?;
        }
    }

    let (totals, n_recs) = completer.finish(&mapper)?;
    let total_sec = t_start.elapsed().as_secs_f64();
    let summary = Summary {
        k,
        both_strands: config.both_strands,
        n_bins: config.n_bins,
        lut_prefix_len,
        counter_size: counter_bytes,
        stats: SummaryStats {
            total_reads: n_reads,
            total_super_kmers: bin_totals.n_super_kmers,
            unique_kmers: totals.n_unique,
            below_cutoff_min: totals.n_cutoff_min,
            above_cutoff_max: totals.n_cutoff_max,
            unique_counted_kmers: totals.n_unique - totals.n_cutoff_min - totals.n_cutoff_max,
            total_kmers: totals.n_total,
        },
        times: StageTimes {
            stage1_sec,
            stage2_sec: total_sec - stage1_sec,
            total_sec,
        },
    };
    debug_assert_eq!(summary.stats.unique_counted_kmers, n_recs);

    if let Some(path) = &config.json_summary {
        summary.write_json(path)?;
    }
    Ok(summary)
}
