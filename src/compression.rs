/// Compression engine with algorithm selection and a decompression cache.
///
/// Values at or above the configured threshold are compressed. The engine
/// tries the fast algorithm first and only falls back to the high-ratio one
/// when the fast result does not shrink the payload by the configured margin.
/// If neither helps, the payload is stored raw.
///
/// ## Frame format
///
/// Compressed payloads are framed so truncation and corruption are always
/// detected instead of yielding partial bytes:
///
/// ```text
/// "TW" | algorithm tag (u8) | original length (u32 LE) | crc32 of original (u32 LE) | body
/// ```
use crate::config::CompressionConfig;
use crate::error::{WeaveError, WeaveResult};
use crate::types::{Namespace, RecordKey};
use dashmap::DashMap;
use flate2::Compression;
use flate2::read::{DeflateDecoder, ZlibDecoder};
use flate2::write::{DeflateEncoder, ZlibEncoder};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

const FRAME_MAGIC: [u8; 2] = *b"TW";
const FRAME_HEADER_LEN: usize = 2 + 1 + 4 + 4;

/// Compression algorithm recorded alongside each stored revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Stored as-is
    Raw,
    /// Raw deflate at a fast level
    DeflateFast,
    /// Zlib at a high-ratio level
    ZlibMax,
}

impl Algorithm {
    fn tag(self) -> u8 {
        match self {
            Algorithm::Raw => 0,
            Algorithm::DeflateFast => 1,
            Algorithm::ZlibMax => 2,
        }
    }
}

/// Compression statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompressionStats {
    pub compressed: u64,
    pub stored_raw: u64,
    pub fallbacks: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
}

/// Pluggable compress/decompress with a bounded decompression cache.
pub struct CompressionEngine {
    config: CompressionConfig,
    cache: DashMap<(RecordKey, u64), Arc<Vec<u8>>>,
    /// LRU order for the cache (front = most recent)
    cache_order: Mutex<VecDeque<(RecordKey, u64)>>,
    compressed: AtomicU64,
    stored_raw: AtomicU64,
    fallbacks: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CompressionEngine {
    pub fn new(config: CompressionConfig) -> Self {
        let entries = config.cache_entries;
        Self {
            config,
            cache: DashMap::with_capacity(entries),
            cache_order: Mutex::new(VecDeque::with_capacity(entries)),
            compressed: AtomicU64::new(0),
            stored_raw: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn threshold(&self) -> usize {
        self.config.threshold_bytes
    }

    /// Compress `bytes`, choosing the algorithm by size and achieved ratio.
    ///
    /// `hint_size` is the logical size of the value; below the threshold the
    /// bytes are returned unchanged with [`Algorithm::Raw`].
    pub fn compress(&self, bytes: &[u8], hint_size: usize) -> WeaveResult<(Algorithm, Vec<u8>)> {
        if hint_size.max(bytes.len()) < self.config.threshold_bytes {
            self.stored_raw.fetch_add(1, Ordering::Relaxed);
            return Ok((Algorithm::Raw, bytes.to_vec()));
        }

        if frame_len(bytes.len()).is_err() {
            trace!(size = bytes.len(), "payload too large to frame, storing raw");
            self.stored_raw.fetch_add(1, Ordering::Relaxed);
            return Ok((Algorithm::Raw, bytes.to_vec()));
        }

        let limit = self.size_limit(bytes.len());

        let fast = self.encode(Algorithm::DeflateFast, bytes)?;
        if fast.len() <= limit {
            self.compressed.fetch_add(1, Ordering::Relaxed);
            return Ok((Algorithm::DeflateFast, fast));
        }

        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        let best = self.encode(Algorithm::ZlibMax, bytes)?;
        if best.len() <= limit {
            self.compressed.fetch_add(1, Ordering::Relaxed);
            return Ok((Algorithm::ZlibMax, best));
        }

        trace!(size = bytes.len(), "compression did not pay off, storing raw");
        self.stored_raw.fetch_add(1, Ordering::Relaxed);
        Ok((Algorithm::Raw, bytes.to_vec()))
    }

    /// Decompress a payload produced by [`CompressionEngine::compress`].
    ///
    /// Corrupt or truncated input fails with `CorruptData`.
    pub fn decompress(&self, algorithm: Algorithm, bytes: &[u8]) -> WeaveResult<Vec<u8>> {
        if algorithm == Algorithm::Raw {
            return Ok(bytes.to_vec());
        }

        if bytes.len() < FRAME_HEADER_LEN || bytes[..2] != FRAME_MAGIC {
            return Err(WeaveError::corrupt("missing compression frame header"));
        }
        if bytes[2] != algorithm.tag() {
            return Err(WeaveError::corrupt(format!(
                "frame tag {} does not match {:?}",
                bytes[2], algorithm
            )));
        }
        let expected_len = u32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]) as usize;
        let expected_crc = u32::from_le_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]);
        let body = &bytes[FRAME_HEADER_LEN..];

        // The header length is untrusted until the checksum passes.
        let mut out = Vec::with_capacity(expected_len.min(body.len().saturating_mul(16)));
        let read = match algorithm {
            Algorithm::DeflateFast => DeflateDecoder::new(body).read_to_end(&mut out),
            Algorithm::ZlibMax => ZlibDecoder::new(body).read_to_end(&mut out),
            Algorithm::Raw => unreachable!("raw payloads return early"),
        };
        read.map_err(|e| WeaveError::corrupt(format!("{:?} stream: {}", algorithm, e)))?;

        if out.len() != expected_len {
            return Err(WeaveError::corrupt(format!(
                "decompressed {} bytes, expected {}",
                out.len(),
                expected_len
            )));
        }
        if crc32fast::hash(&out) != expected_crc {
            return Err(WeaveError::corrupt("decompressed checksum mismatch"));
        }
        Ok(out)
    }

    /// Decompress through the cache keyed by `(record, revision)`.
    pub fn decompress_cached(
        &self,
        record: &RecordKey,
        revision: u64,
        algorithm: Algorithm,
        bytes: &[u8],
    ) -> WeaveResult<Arc<Vec<u8>>> {
        if algorithm == Algorithm::Raw {
            return Ok(Arc::new(bytes.to_vec()));
        }

        let cache_key = (record.clone(), revision);
        if let Some(hit) = self.cache.get(&cache_key).map(|v| Arc::clone(&v)) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.touch(cache_key);
            return Ok(hit);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let decoded = Arc::new(self.decompress(algorithm, bytes)?);
        if self.config.cache_entries > 0 {
            while self.cache.len() >= self.config.cache_entries {
                if !self.evict_lru() {
                    break;
                }
            }
            self.cache.insert(cache_key.clone(), Arc::clone(&decoded));
            self.touch(cache_key);
        }
        Ok(decoded)
    }

    /// Drop every cached revision of a record.
    pub fn invalidate(&self, record: &RecordKey) {
        self.cache.retain(|(key, _), _| key != record);
        if let Ok(mut order) = self.cache_order.lock() {
            order.retain(|(key, _)| key != record);
        }
    }

    /// Drop every cached revision belonging to a namespace.
    pub fn invalidate_namespace(&self, namespace: &Namespace) {
        self.cache.retain(|(key, _), _| &key.namespace != namespace);
        if let Ok(mut order) = self.cache_order.lock() {
            order.retain(|(key, _)| &key.namespace != namespace);
        }
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    pub fn stats(&self) -> CompressionStats {
        CompressionStats {
            compressed: self.compressed.load(Ordering::Relaxed),
            stored_raw: self.stored_raw.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            cache_hits: self.hits.load(Ordering::Relaxed),
            cache_misses: self.misses.load(Ordering::Relaxed),
            cache_evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Largest compressed size that still counts as an improvement.
    fn size_limit(&self, original: usize) -> usize {
        let ratio = (1.0 - self.config.min_improvement).clamp(0.0, 1.0);
        (original as f64 * ratio) as usize
    }

    fn encode(&self, algorithm: Algorithm, bytes: &[u8]) -> WeaveResult<Vec<u8>> {
        let mut framed = Vec::with_capacity(FRAME_HEADER_LEN + bytes.len() / 2);
        framed.extend_from_slice(&FRAME_MAGIC);
        framed.push(algorithm.tag());
        framed.extend_from_slice(&frame_len(bytes.len())?.to_le_bytes());
        framed.extend_from_slice(&crc32fast::hash(bytes).to_le_bytes());

        let io_err = |e: std::io::Error| WeaveError::Storage(format!("compression failed: {}", e));
        match algorithm {
            Algorithm::DeflateFast => {
                let mut encoder =
                    DeflateEncoder::new(framed, Compression::new(self.config.fast_level));
                encoder.write_all(bytes).map_err(io_err)?;
                encoder.finish().map_err(io_err)
            }
            Algorithm::ZlibMax => {
                let mut encoder = ZlibEncoder::new(framed, Compression::new(self.config.max_level));
                encoder.write_all(bytes).map_err(io_err)?;
                encoder.finish().map_err(io_err)
            }
            Algorithm::Raw => Ok(bytes.to_vec()),
        }
    }

    fn touch(&self, key: (RecordKey, u64)) {
        if let Ok(mut order) = self.cache_order.lock() {
            order.retain(|x| x != &key);
            order.push_front(key);
        }
    }

    fn evict_lru(&self) -> bool {
        let victim = match self.cache_order.lock() {
            Ok(mut order) => order.pop_back(),
            Err(_) => None,
        };
        match victim {
            Some(victim) => {
                self.cache.remove(&victim);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => {
                // Order list out of sync with the map; drop an arbitrary entry.
                let any = self.cache.iter().next().map(|e| e.key().clone());
                match any {
                    Some(key) => {
                        self.cache.remove(&key);
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                        true
                    }
                    None => false,
                }
            }
        }
    }
}

impl Default for CompressionEngine {
    fn default() -> Self {
        Self::new(CompressionConfig::default())
    }
}

/// Original length as stored in the frame header.
fn frame_len(len: usize) -> WeaveResult<u32> {
    u32::try_from(len)
        .map_err(|_| WeaveError::Storage(format!("{} bytes exceed the compression frame limit", len)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tier;

    fn engine(threshold: usize, cache_entries: usize) -> CompressionEngine {
        CompressionEngine::new(CompressionConfig {
            threshold_bytes: threshold,
            cache_entries,
            ..Default::default()
        })
    }

    fn record(key: &str) -> RecordKey {
        RecordKey::new("p/c/m".parse().unwrap(), Tier::LongTerm, key)
    }

    #[test]
    fn test_small_payload_stored_raw() {
        let engine = engine(1024, 4);
        let (alg, out) = engine.compress(b"tiny", 4).unwrap();
        assert_eq!(alg, Algorithm::Raw);
        assert_eq!(out, b"tiny");
        assert_eq!(engine.stats().stored_raw, 1);
    }

    #[test]
    fn test_compressible_payload_uses_fast_algorithm() {
        let engine = engine(64, 4);
        let data = "interview transcript ".repeat(200).into_bytes();
        let (alg, out) = engine.compress(&data, data.len()).unwrap();
        assert_eq!(alg, Algorithm::DeflateFast);
        assert!(out.len() < data.len());
        assert_eq!(engine.decompress(alg, &out).unwrap(), data);
    }

    #[test]
    fn test_incompressible_payload_falls_back_to_raw() {
        use rand::RngCore;
        let engine = engine(64, 4);
        let mut data = vec![0u8; 4096];
        rand::thread_rng().fill_bytes(&mut data);
        let (alg, out) = engine.compress(&data, data.len()).unwrap();
        assert_eq!(alg, Algorithm::Raw);
        assert_eq!(out, data);
        assert_eq!(engine.stats().fallbacks, 1);
    }

    #[test]
    fn test_truncated_payload_is_corrupt() {
        let engine = engine(64, 4);
        let data = "pattern ".repeat(500).into_bytes();
        let (alg, out) = engine.compress(&data, data.len()).unwrap();
        let truncated = &out[..out.len() / 2];
        let err = engine.decompress(alg, truncated).unwrap_err();
        assert!(matches!(err, WeaveError::CorruptData { .. }));
    }

    #[test]
    fn test_flipped_byte_is_corrupt() {
        let engine = engine(64, 4);
        let data = "pattern ".repeat(500).into_bytes();
        let (alg, mut out) = engine.compress(&data, data.len()).unwrap();
        let last = out.len() - 1;
        out[last] ^= 0xFF;
        assert!(engine.decompress(alg, &out).is_err());
    }

    #[test]
    fn test_wrong_algorithm_tag_is_corrupt() {
        let engine = engine(64, 4);
        let data = "pattern ".repeat(500).into_bytes();
        let (_, out) = engine.compress(&data, data.len()).unwrap();
        assert!(engine.decompress(Algorithm::ZlibMax, &out).is_err());
    }

    #[test]
    fn test_decompression_cache_hits_and_bound() {
        let engine = engine(64, 2);
        let data = "cached ".repeat(300).into_bytes();
        let (alg, out) = engine.compress(&data, data.len()).unwrap();

        let a = record("a");
        engine.decompress_cached(&a, 1, alg, &out).unwrap();
        engine.decompress_cached(&a, 1, alg, &out).unwrap();
        assert_eq!(engine.stats().cache_hits, 1);
        assert_eq!(engine.stats().cache_misses, 1);

        engine.decompress_cached(&record("b"), 1, alg, &out).unwrap();
        engine.decompress_cached(&record("c"), 1, alg, &out).unwrap();
        assert_eq!(engine.cached_entries(), 2);
        assert_eq!(engine.stats().cache_evictions, 1);
    }

    #[test]
    fn test_invalidate_namespace() {
        let engine = engine(64, 8);
        let data = "cached ".repeat(300).into_bytes();
        let (alg, out) = engine.compress(&data, data.len()).unwrap();
        engine.decompress_cached(&record("a"), 1, alg, &out).unwrap();
        engine.decompress_cached(&record("a"), 2, alg, &out).unwrap();
        engine.invalidate_namespace(&"p/c/m".parse().unwrap());
        assert_eq!(engine.cached_entries(), 0);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_frame_len_rejects_oversized() {
        assert_eq!(frame_len(1024).unwrap(), 1024);
        assert_eq!(frame_len(u32::MAX as usize).unwrap(), u32::MAX);
        assert!(matches!(frame_len(u32::MAX as usize + 1), Err(WeaveError::Storage(_))));
    }
}
