//! The compression pipeline.
//!
//! Selects and applies a codec per payload class, with duty-cycle awareness
//! and a bounded recency cache for the selection decision itself. Codec
//! implementations live in [`codecs`]; n-gram dictionary management lives in
//! [`dictionary`].

pub mod codecs;
pub mod dictionary;

use std::collections::VecDeque;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::envelope::MessageClass;
use crate::error::{MeshError, MeshResult};
use dictionary::Dictionary;

/// Pluggable compression codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Codec {
    None = 0,
    Lz4 = 1,
    Gzip = 2,
    Dictionary = 3,
    UtxoCustom = 4,
}

impl Codec {
    pub fn from_tag(tag: u8) -> MeshResult<Self> {
        match tag {
            0 => Ok(Codec::None),
            1 => Ok(Codec::Lz4),
            2 => Ok(Codec::Gzip),
            3 => Ok(Codec::Dictionary),
            4 => Ok(Codec::UtxoCustom),
            other => Err(MeshError::UnknownCodec { tag: other }),
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// Metadata carried alongside a compressed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub version: u8,
    pub message_type: u8,
    pub dictionary_id: Option<String>,
    pub compression_level: u8,
}

/// A compressed blob, wire-formatted as
/// `[algorithm u8][flags u8][original_size u32][metadata_len u16][metadata …][payload …]`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedBlob {
    pub algorithm: Codec,
    pub original_size: u32,
    pub payload: Vec<u8>,
    pub metadata: BlobMetadata,
}

impl CompressedBlob {
    pub fn encode(&self) -> Vec<u8> {
        let metadata_bytes = serde_json::to_vec(&self.metadata).unwrap_or_default();
        let mut out = Vec::with_capacity(8 + metadata_bytes.len() + self.payload.len());
        out.push(self.algorithm.tag());
        out.push(0); // flags, reserved
        out.write_u32::<BigEndian>(self.original_size).unwrap();
        out.write_u16::<BigEndian>(metadata_bytes.len() as u16).unwrap();
        out.extend_from_slice(&metadata_bytes);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> MeshResult<Self> {
        if bytes.len() < 8 {
            return Err(MeshError::MalformedEnvelope { reason: "compressed blob header truncated".into() });
        }
        let algorithm = Codec::from_tag(bytes[0])?;
        // byte 1 is the reserved flags byte; original_size occupies 2..6,
        // metadata_len occupies 6..8.
        let mut rest = &bytes[2..8];
        let original_size = rest.read_u32::<BigEndian>().unwrap();
        let metadata_len = rest.read_u16::<BigEndian>().unwrap() as usize;
        let metadata_start = 8;
        let metadata_end = metadata_start + metadata_len;
        if bytes.len() < metadata_end {
            return Err(MeshError::MalformedEnvelope { reason: "compressed blob metadata truncated".into() });
        }
        let metadata: BlobMetadata = serde_json::from_slice(&bytes[metadata_start..metadata_end])
            .map_err(|e| MeshError::MalformedEnvelope { reason: format!("bad metadata: {e}") })?;
        let payload = bytes[metadata_end..].to_vec();
        Ok(CompressedBlob { algorithm, original_size, payload, metadata })
    }
}

/// Shannon entropy over the byte histogram, in bits per byte (0..=8).
fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut histogram = [0u32; 256];
    for &b in data {
        histogram[b as usize] += 1;
    }
    let len = data.len() as f64;
    histogram
        .iter()
        .filter(|&&count| count > 0)
        .map(|&count| {
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// Ratio of the most frequent byte's occurrences to total length, a cheap
/// proxy for "repetition" used by the algorithm-selection heuristic.
fn repetition_ratio(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut histogram = [0u32; 256];
    for &b in data {
        histogram[b as usize] += 1;
    }
    let max = *histogram.iter().max().unwrap_or(&0) as f64;
    max / data.len() as f64
}

fn looks_structured(data: &[u8]) -> bool {
    data.contains(&b'{') && data.contains(&b'}')
}

/// Size bucket used as part of the selection-cache key, so near-identical
/// payload sizes share a cache entry.
fn size_bucket(size: usize) -> u32 {
    (size / 32) as u32
}

/// Cache key for memoized algorithm selection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SelectionKey {
    size_bucket: u32,
    class: u8,
    battery_optimized: bool,
}

fn class_tag(class: MessageClass) -> u8 {
    match class {
        MessageClass::Block => 0,
        MessageClass::UtxoTransaction { .. } => 1,
        MessageClass::MerkleProof => 2,
        MessageClass::Beacon => 3,
        MessageClass::Ack => 4,
        MessageClass::Nack => 5,
        MessageClass::RouteRequest => 6,
        MessageClass::RouteReply => 7,
        MessageClass::RouteError => 8,
    }
}

const SELECTION_CACHE_CAPACITY: usize = 500;

/// Bounded recency cache: a `VecDeque` used as a simple LRU-ish ring —
/// newest entries pushed to the back, oldest evicted from the front once
/// over capacity. Lookups are linear but the cache is small by design.
struct SelectionCache {
    entries: VecDeque<(SelectionKey, Codec)>,
}

impl SelectionCache {
    fn new() -> Self {
        SelectionCache { entries: VecDeque::new() }
    }

    fn get(&self, key: &SelectionKey) -> Option<Codec> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, c)| *c)
    }

    fn insert(&mut self, key: SelectionKey, codec: Codec) {
        if self.entries.len() >= SELECTION_CACHE_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back((key, codec));
    }
}

/// Constraints affecting codec selection: an explicit algorithm override,
/// or a battery-optimized mode that always prefers the cheapest codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompressionConstraints {
    pub battery_optimized: bool,
    pub explicit_algorithm: Option<Codec>,
}

/// The compression pipeline: codec selection, application, and integrity
/// checking.
pub struct CompressionPipeline {
    pub compression_threshold: usize,
    pub max_expansion_ratio: u32,
    cache: SelectionCache,
    dictionaries: Vec<Dictionary>,
}

impl CompressionPipeline {
    pub fn new(compression_threshold: usize, max_expansion_ratio: u32) -> Self {
        CompressionPipeline {
            compression_threshold,
            max_expansion_ratio,
            cache: SelectionCache::new(),
            dictionaries: Vec::new(),
        }
    }

    pub fn install_dictionary(&mut self, dictionary: Dictionary) {
        self.dictionaries.retain(|d| d.region != dictionary.region);
        self.dictionaries.push(dictionary);
    }

    fn dictionary_for_region(&self, region: &str) -> Option<&Dictionary> {
        self.dictionaries.iter().find(|d| d.region == region)
    }

    /// Select an algorithm by entropy, repetition, and message class, in
    /// that order, memoized in the bounded recency cache.
    pub fn select_algorithm(
        &mut self,
        payload: &[u8],
        class: MessageClass,
        region: &str,
        constraints: CompressionConstraints,
    ) -> Codec {
        if payload.len() < self.compression_threshold {
            return Codec::None;
        }
        if let Some(explicit) = constraints.explicit_algorithm {
            return explicit;
        }
        if constraints.battery_optimized {
            return Codec::Lz4;
        }

        let key = SelectionKey {
            size_bucket: size_bucket(payload.len()),
            class: class_tag(class),
            battery_optimized: constraints.battery_optimized,
        };
        if let Some(cached) = self.cache.get(&key) {
            return cached;
        }

        let entropy = shannon_entropy(payload);
        let chosen = if entropy > 7.5 {
            Codec::None
        } else if repetition_ratio(payload) > 0.3 {
            Codec::Lz4
        } else if looks_structured(payload) {
            Codec::Gzip
        } else {
            match class {
                MessageClass::Block => Codec::UtxoCustom,
                MessageClass::UtxoTransaction { .. } => {
                    if self.dictionary_for_region(region).is_some() {
                        Codec::UtxoCustom
                    } else {
                        Codec::Gzip
                    }
                }
                MessageClass::Beacon => Codec::None,
                _ => Codec::Gzip,
            }
        };

        self.cache.insert(key, chosen);
        chosen
    }

    /// Compress `payload`, honoring the governor's remaining airtime: if
    /// the estimated compression time would blow the transmission past the
    /// window, fall back to the cheaper LZ4 codec.
    pub fn compress(
        &mut self,
        payload: &[u8],
        class: MessageClass,
        region: &str,
        constraints: CompressionConstraints,
        remaining_airtime_ms: Option<u64>,
    ) -> MeshResult<CompressedBlob> {
        let mut algorithm = self.select_algorithm(payload, class, region, constraints);

        if let Some(remaining) = remaining_airtime_ms {
            let estimated_compression_cost_ms = estimate_compression_cost_ms(algorithm, payload.len());
            if estimated_compression_cost_ms > remaining {
                algorithm = Codec::Lz4;
            }
        }

        let compressed_payload = match algorithm {
            Codec::None => payload.to_vec(),
            Codec::Lz4 => codecs::lz4_compress(payload),
            Codec::Gzip => codecs::gzip_compress(payload),
            Codec::Dictionary => {
                let dictionary = self.dictionary_for_region(region);
                codecs::dictionary_compress(payload, dictionary)
            }
            Codec::UtxoCustom => codecs::utxo_custom_compress(payload),
        };

        Ok(CompressedBlob {
            algorithm,
            original_size: payload.len() as u32,
            payload: compressed_payload,
            metadata: BlobMetadata {
                version: 1,
                message_type: class_tag(class),
                dictionary_id: (algorithm == Codec::Dictionary)
                    .then(|| self.dictionary_for_region(region).map(|d| d.region.clone()))
                    .flatten(),
                compression_level: 0,
            },
        })
    }

    /// Decompress a blob, enforcing the expansion-ratio guard before any
    /// allocation and the size-mismatch guard afterward.
    pub fn decompress(&self, blob: &CompressedBlob) -> MeshResult<Vec<u8>> {
        let compressed_len = blob.payload.len().max(1);
        let expansion = blob.original_size as f64 / compressed_len as f64;
        if expansion > self.max_expansion_ratio as f64 {
            return Err(MeshError::DecompressionExpansionExceeded {
                compressed: blob.payload.len(),
                original: blob.original_size,
                limit: self.max_expansion_ratio,
            });
        }

        let dictionary = blob
            .metadata
            .dictionary_id
            .as_deref()
            .and_then(|id| self.dictionaries.iter().find(|d| d.region == id));

        let output = match blob.algorithm {
            Codec::None => blob.payload.clone(),
            Codec::Lz4 => codecs::lz4_decompress(&blob.payload, blob.original_size as usize)?,
            Codec::Gzip => codecs::gzip_decompress(&blob.payload)?,
            Codec::Dictionary => codecs::dictionary_decompress(&blob.payload, dictionary)?,
            Codec::UtxoCustom => codecs::utxo_custom_decompress(&blob.payload)?,
        };

        if output.len() as u32 != blob.original_size {
            return Err(MeshError::DecompressionSizeMismatch {
                expected: blob.original_size,
                actual: output.len() as u32,
            });
        }
        Ok(output)
    }
}

/// Coarse estimate of compression wall-clock cost, used only to decide
/// whether to fall back to the cheaper LZ4 path under duty-cycle pressure.
fn estimate_compression_cost_ms(algorithm: Codec, payload_len: usize) -> u64 {
    let per_kb_ms = match algorithm {
        Codec::None => 0,
        Codec::Lz4 => 1,
        Codec::Gzip => 4,
        Codec::Dictionary => 2,
        Codec::UtxoCustom => 2,
    };
    ((payload_len as u64 / 1024) + 1) * per_kb_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_threshold_uses_none() {
        let mut pipeline = CompressionPipeline::new(100, 100);
        let payload = vec![1u8; 50];
        let codec = pipeline.select_algorithm(&payload, MessageClass::Beacon, "EU", CompressionConstraints::default());
        assert_eq!(codec, Codec::None);
    }

    #[test]
    fn explicit_algorithm_wins() {
        let mut pipeline = CompressionPipeline::new(10, 100);
        let payload = vec![1u8; 200];
        let constraints = CompressionConstraints { explicit_algorithm: Some(Codec::Gzip), ..Default::default() };
        let codec = pipeline.select_algorithm(&payload, MessageClass::Block, "EU", constraints);
        assert_eq!(codec, Codec::Gzip);
    }

    #[test]
    fn battery_optimized_forces_lz4() {
        let mut pipeline = CompressionPipeline::new(10, 100);
        let payload = vec![7u8; 200];
        let constraints = CompressionConstraints { battery_optimized: true, ..Default::default() };
        let codec = pipeline.select_algorithm(&payload, MessageClass::Block, "EU", constraints);
        assert_eq!(codec, Codec::Lz4);
    }

    #[test]
    fn high_entropy_payload_selects_none() {
        let mut pipeline = CompressionPipeline::new(10, 100);
        // Pseudo-random bytes via a simple LCG, high entropy by construction.
        let mut state: u32 = 12345;
        let payload: Vec<u8> = (0..512)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 16) as u8
            })
            .collect();
        let codec = pipeline.select_algorithm(&payload, MessageClass::Block, "EU", CompressionConstraints::default());
        assert_eq!(codec, Codec::None);
    }

    #[test]
    fn repetitive_payload_selects_lz4() {
        let mut pipeline = CompressionPipeline::new(10, 100);
        let payload = vec![9u8; 300];
        let codec = pipeline.select_algorithm(&payload, MessageClass::MerkleProof, "EU", CompressionConstraints::default());
        assert_eq!(codec, Codec::Lz4);
    }

    #[test]
    fn structured_json_like_payload_selects_gzip() {
        let mut pipeline = CompressionPipeline::new(10, 100);
        let mut payload = Vec::new();
        for i in 0..40 {
            payload.extend_from_slice(format!("{{\"field{i}\":\"value_{i}\"}},").as_bytes());
        }
        let codec = pipeline.select_algorithm(&payload, MessageClass::RouteRequest, "EU", CompressionConstraints::default());
        assert_eq!(codec, Codec::Gzip);
    }

    #[test]
    fn round_trip_none() {
        let mut pipeline = CompressionPipeline::new(1000, 100);
        let payload = b"short".to_vec();
        let blob = pipeline
            .compress(&payload, MessageClass::Beacon, "EU", CompressionConstraints::default(), None)
            .unwrap();
        assert_eq!(blob.algorithm, Codec::None);
        let out = pipeline.decompress(&blob).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn round_trip_lz4() {
        let mut pipeline = CompressionPipeline::new(10, 100);
        let payload: Vec<u8> = (0..2000).map(|i| (i % 7) as u8).collect();
        let constraints = CompressionConstraints { explicit_algorithm: Some(Codec::Lz4), ..Default::default() };
        let blob = pipeline.compress(&payload, MessageClass::Block, "EU", constraints, None).unwrap();
        let out = pipeline.decompress(&blob).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn round_trip_gzip() {
        let mut pipeline = CompressionPipeline::new(10, 100);
        let payload: Vec<u8> = (0..3000).map(|i| ((i * 31) % 251) as u8).collect();
        let constraints = CompressionConstraints { explicit_algorithm: Some(Codec::Gzip), ..Default::default() };
        let blob = pipeline.compress(&payload, MessageClass::Block, "EU", constraints, None).unwrap();
        let out = pipeline.decompress(&blob).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn duty_cycle_fallback_to_lz4_when_airtime_scarce() {
        let mut pipeline = CompressionPipeline::new(10, 100);
        let payload: Vec<u8> = (0..50_000).map(|i| (i % 13) as u8).collect();
        let constraints = CompressionConstraints { explicit_algorithm: Some(Codec::Gzip), ..Default::default() };
        let blob = pipeline.compress(&payload, MessageClass::Block, "EU", constraints, Some(1)).unwrap();
        assert_eq!(blob.algorithm, Codec::Lz4);
    }

    #[test]
    fn expansion_ratio_guard_rejects_before_allocating() {
        let pipeline = CompressionPipeline::new(10, 4);
        let blob = CompressedBlob {
            algorithm: Codec::Lz4,
            original_size: 1000,
            payload: vec![0u8; 10], // 100x expansion, over the limit of 4x
            metadata: BlobMetadata { version: 1, message_type: 0, dictionary_id: None, compression_level: 0 },
        };
        let result = pipeline.decompress(&blob);
        assert!(matches!(result, Err(MeshError::DecompressionExpansionExceeded { .. })));
    }

    #[test]
    fn blob_wire_round_trip() {
        let blob = CompressedBlob {
            algorithm: Codec::Gzip,
            original_size: 42,
            payload: vec![1, 2, 3, 4],
            metadata: BlobMetadata { version: 1, message_type: 2, dictionary_id: None, compression_level: 6 },
        };
        let bytes = blob.encode();
        let decoded = CompressedBlob::decode(&bytes).unwrap();
        assert_eq!(decoded, blob);
    }
}
