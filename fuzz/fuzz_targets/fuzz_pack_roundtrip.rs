//! Packing, rendering, and reverse complement must round-trip for any
//! symbol sequence up to the width limit.

#![no_main]

use kmerbin::kmer::PackedKmer;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.is_empty() || data.len() > 128 {
        return;
    }
    let symbols: Vec<u8> = data.iter().map(|b| b & 3).collect();
    let k = symbols.len();

    let packed: PackedKmer<9> = PackedKmer::from_symbols(&symbols);
    let text = packed.to_text(k);
    let expected: String = symbols
        .iter()
        .map(|&s| ['A', 'C', 'G', 'T'][s as usize])
        .collect();
    assert_eq!(text, expected);

    // Reverse complement is an involution.
    let back = packed.reverse_complement(k).reverse_complement(k);
    assert_eq!(back, packed);
});
