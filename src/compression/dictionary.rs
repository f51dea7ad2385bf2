//! N-gram dictionary management for the [`super::Codec::Dictionary`] codec.
//!
//! Dictionaries are built offline (or supplied by a blockchain client that
//! has observed traffic for a region) and installed into the pipeline per
//! region; they are versioned so a stale dictionary on one side of a link
//! doesn't silently corrupt a decode.

use std::collections::HashMap;

/// A ranked set of byte-string n-grams for one region, substituted for
/// their dictionary index during [`super::Codec::Dictionary`] compression.
#[derive(Debug, Clone, PartialEq)]
pub struct Dictionary {
    pub region: String,
    pub version: u32,
    /// Entries ordered by substitution index; index 0 is tried first, so
    /// the most frequent n-grams should come first for the greedy matcher
    /// in [`super::codecs::dictionary_compress`].
    pub entries: Vec<Vec<u8>>,
}

/// Maximum number of top-ranked n-grams kept in a built dictionary.
const MAX_ENTRIES: usize = 1000;

const MIN_NGRAM_LEN: usize = 3;
const MAX_NGRAM_LEN: usize = 16;

/// Build a dictionary from a corpus of sample payloads by counting
/// substring frequency over a sliding window of n-gram lengths and keeping
/// the most frequent, non-overlapping-in-rank entries.
pub fn build_dictionary(region: &str, version: u32, corpus: &[Vec<u8>]) -> Dictionary {
    let mut counts: HashMap<Vec<u8>, u32> = HashMap::new();
    for sample in corpus {
        for len in MIN_NGRAM_LEN..=MAX_NGRAM_LEN.min(sample.len()) {
            for window in sample.windows(len) {
                *counts.entry(window.to_vec()).or_insert(0) += 1;
            }
        }
    }

    let mut ranked: Vec<(Vec<u8>, u32)> = counts.into_iter().filter(|(_, count)| *count > 1).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.len().cmp(&a.0.len())));

    let mut entries = Vec::new();
    for (candidate, _) in ranked {
        if entries.len() >= MAX_ENTRIES.min(254) {
            break;
        }
        // Skip candidates that are a substring of an already-chosen, higher
        // ranked entry: they would never win the greedy longest-first match
        // in practice and just waste an index slot.
        if entries.iter().any(|existing: &Vec<u8>| is_subslice(existing, &candidate)) {
            continue;
        }
        entries.push(candidate);
    }

    Dictionary { region: region.to_string(), version, entries }
}

fn is_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len().max(1)).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_dictionary_picks_frequent_repeated_runs() {
        let corpus = vec![
            b"coinbase reward coinbase reward coinbase reward".to_vec(),
            b"coinbase reward paid to miner".to_vec(),
        ];
        let dictionary = build_dictionary("EU", 1, &corpus);
        assert!(dictionary.entries.iter().any(|e| e == b"coinbase"));
    }

    #[test]
    fn build_dictionary_caps_entry_count() {
        let mut sample = Vec::new();
        for i in 0..2000u32 {
            sample.extend_from_slice(format!("xq{i}zz").as_bytes());
        }
        let dictionary = build_dictionary("EU", 1, &[sample]);
        assert!(dictionary.entries.len() <= 254);
    }

    #[test]
    fn empty_corpus_yields_empty_dictionary() {
        let dictionary = build_dictionary("EU", 1, &[]);
        assert!(dictionary.entries.is_empty());
    }
}
