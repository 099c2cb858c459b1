//! End-to-end runs over BAM input.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{builder, naive_counts, run_and_decode};
use kmerbin::input::SequenceFormat;
use std::path::{Path, PathBuf};

fn nibble(base: u8) -> u8 {
    match base {
        b'A' => 1,
        b'C' => 2,
        b'G' => 4,
        b'T' => 8,
        _ => 15,
    }
}

fn bam_record(seq: &str, flags: u16) -> Vec<u8> {
    let name = b"r\0";
    let mut rec = Vec::new();
    rec.extend_from_slice(&(-1i32).to_le_bytes());
    rec.extend_from_slice(&(-1i32).to_le_bytes());
    rec.extend_from_slice(&(name.len() as u32).to_le_bytes());
    rec.extend_from_slice(&(u32::from(flags) << 16).to_le_bytes());
    rec.extend_from_slice(&(seq.len() as i32).to_le_bytes());
    rec.extend_from_slice(&(-1i32).to_le_bytes());
    rec.extend_from_slice(&(-1i32).to_le_bytes());
    rec.extend_from_slice(&0i32.to_le_bytes());
    rec.extend_from_slice(name);
    for pair in seq.as_bytes().chunks(2) {
        let hi = nibble(pair[0]);
        let lo = if pair.len() == 2 { nibble(pair[1]) } else { 0 };
        rec.push((hi << 4) | lo);
    }
    rec.extend(std::iter::repeat(0xffu8).take(seq.len()));
    rec
}

fn bgzf_block(payload: &[u8]) -> Vec<u8> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(payload).unwrap();
    let body = gz.finish().unwrap();

    let mut out = Vec::new();
    out.extend_from_slice(&[0x1f, 0x8b, 0x08, 0x04, 0, 0, 0, 0, 0, 0xff]);
    out.extend_from_slice(&6u16.to_le_bytes());
    out.extend_from_slice(b"BC");
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(&body[10..]);
    let bsize = u16::try_from(out.len() - 1).unwrap();
    out[16..18].copy_from_slice(&bsize.to_le_bytes());
    out
}

fn write_bam(dir: &Path, name: &str, records: &[(&str, u16)]) -> PathBuf {
    let mut payload = Vec::new();
    payload.extend_from_slice(b"BAM\x01");
    payload.extend_from_slice(&0i32.to_le_bytes());
    payload.extend_from_slice(&0i32.to_le_bytes());
    for &(seq, flags) in records {
        let rec = bam_record(seq, flags);
        payload.extend_from_slice(&(rec.len() as i32).to_le_bytes());
        payload.extend_from_slice(&rec);
    }
    let path = dir.join(name);
    std::fs::write(&path, bgzf_block(&payload)).unwrap();
    path
}

#[test]
fn bam_counts_match_fasta_counts() {
    let sequences = ["GATCGCGATTACACGTACGTT", "ACGTACGTACGT"];
    let dir = tempfile::tempdir().unwrap();
    let records: Vec<(&str, u16)> = sequences.iter().map(|&s| (s, 0)).collect();
    let input = write_bam(dir.path(), "in.bam", &records);

    let mut b = builder(dir.path(), &input, 7);
    b.input_format = SequenceFormat::Bam;
    let (summary, counts) = run_and_decode(&b.build().unwrap());

    assert_eq!(counts, naive_counts(&sequences, 7, true, false));
    assert_eq!(summary.stats.total_reads, 2);
}

#[test]
fn secondary_alignments_are_not_counted() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_bam(
        dir.path(),
        "in.bam",
        &[("GATCGCGATTAC", 0), ("GATCGCGATTAC", 0x100)],
    );

    let mut b = builder(dir.path(), &input, 7);
    b.input_format = SequenceFormat::Bam;
    let (summary, counts) = run_and_decode(&b.build().unwrap());

    assert_eq!(counts, naive_counts(&["GATCGCGATTAC"], 7, true, false));
    assert_eq!(summary.stats.total_reads, 1);
}

#[test]
fn reverse_flagged_reads_count_the_same_canonical_kmers() {
    // A read and its stored reverse complement with the reverse flag
    // describe the same molecule; canonical counts must agree.
    let forward = "GATCGCGATTACACGTA";
    let revcomp: String = forward
        .chars()
        .rev()
        .map(|c| match c {
            'A' => 'T',
            'C' => 'G',
            'G' => 'C',
            _ => 'A',
        })
        .collect();

    let dir = tempfile::tempdir().unwrap();
    let fwd_bam = write_bam(dir.path(), "fwd.bam", &[(forward, 0)]);
    let rev_bam = write_bam(dir.path(), "rev.bam", &[(&revcomp, 0x10)]);

    let mut b = builder(dir.path(), &fwd_bam, 7);
    b.input_format = SequenceFormat::Bam;
    b.output_path = dir.path().join("db_fwd");
    let (_, fwd_counts) = run_and_decode(&b.build().unwrap());

    let mut b = builder(dir.path(), &rev_bam, 7);
    b.input_format = SequenceFormat::Bam;
    b.output_path = dir.path().join("db_rev");
    let (_, rev_counts) = run_and_decode(&b.build().unwrap());

    assert_eq!(fwd_counts, rev_counts);
}
