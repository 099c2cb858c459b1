//! Every k-mer of every valid run must land in exactly one super-k-mer.

#![no_main]

use kmerbin::input::INVALID_SYMBOL;
use kmerbin::signature::{SignatureLength, SignatureNorm};
use kmerbin::splitter::traverse;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() < 8 || data.len() > 4096 {
        return;
    }
    let k = 5 + (data[0] as usize) % 20;
    let seq: Vec<u8> = data[1..]
        .iter()
        .map(|&b| if b % 17 == 0 { INVALID_SYMBOL } else { b & 3 })
        .collect();

    let len = SignatureLength::new(5).unwrap().effective(k);
    let norm = SignatureNorm::new(len);

    let mut covered = 0usize;
    traverse(&seq, k, &norm, |_, run| {
        assert!(run.len() >= k);
        assert!(run.len() <= k + 255);
        assert!(run.iter().all(|&s| s != INVALID_SYMBOL));
        covered += run.len() - k + 1;
        Ok(())
    })
    .unwrap();

    // Count valid windows directly.
    let mut expected = 0usize;
    let mut run_len = 0usize;
    for &s in &seq {
        if s == INVALID_SYMBOL {
            run_len = 0;
        } else {
            run_len += 1;
            if run_len >= k {
                expected += 1;
            }
        }
    }
    assert_eq!(covered, expected);
});
