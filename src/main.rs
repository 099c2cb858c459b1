#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::process;

use clap::Parser;
use colored::Colorize;
use kmerbin::cli::Args;
use kmerbin::runner;

/// Set `RUST_LOG=kmerbin=debug` to see pipeline internals.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    init_tracing();
    let args = Args::parse();

    let config = match args.into_builder().build() {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "{}\n {}",
                "Problem with arguments:".blue().bold(),
                e.to_string().blue()
            );
            process::exit(1);
        }
    };

    match runner::run(&config) {
        Ok(summary) => {
            if !config.hide_progress {
                eprintln!(
                    "{}: {}",
                    "reads".bold(),
                    summary.stats.total_reads.to_string().blue().bold()
                );
                eprintln!(
                    "{}: {}",
                    "unique k-mers".bold(),
                    summary.stats.unique_kmers.to_string().blue().bold()
                );
                eprintln!(
                    "{}: {}",
                    "unique counted k-mers".bold(),
                    summary
                        .stats
                        .unique_counted_kmers
                        .to_string()
                        .blue()
                        .bold()
                );
                eprintln!(
                    "{}: {}",
                    "total k-mers".bold(),
                    summary.stats.total_kmers.to_string().blue().bold()
                );
                eprintln!(
                    "{}: {:.2}s + {:.2}s = {:.2}s",
                    "time".bold(),
                    summary.times.stage1_sec,
                    summary.times.stage2_sec,
                    summary.times.total_sec
                );
            }
        }
        Err(e) => {
            eprintln!(
                "{}\n {}",
                "Application error:".blue().bold(),
                e.to_string().blue()
            );
            process::exit(1);
        }
    }
}
