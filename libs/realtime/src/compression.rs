//! Payload Compression
//!
//! Best-effort lz4 compression for wire frames. Compression failures never
//! propagate to the caller: the frame goes out uncompressed and a fallback
//! counter records the event, keeping the degradation observable.

use crate::{RealtimeError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use crate::config::CompressionConfig;

/// First byte of every compressed frame. Plain JSON frames always begin
/// with `{`, and the raw lz4 size prefix could too (any payload whose
/// length is 0x7b mod 256), so compressed frames carry this marker to keep
/// the first-byte discrimination unambiguous.
pub const COMPRESSED_MARKER: u8 = 0x00;

/// Best-effort frame compressor
#[derive(Debug, Clone)]
pub struct Compressor {
    config: CompressionConfig,
    fallbacks: Arc<AtomicU64>,
}

impl Compressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self {
            config,
            fallbacks: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Compress a frame if it is large enough and compression helps;
    /// otherwise return the input unchanged. Never fails.
    pub fn maybe_compress(&self, data: Vec<u8>) -> Vec<u8> {
        if !self.config.enabled || data.len() < self.config.threshold_bytes {
            return data;
        }

        let compressed = lz4_flex::compress_prepend_size(&data);
        if compressed.len() + 1 < data.len() {
            let mut framed = Vec::with_capacity(compressed.len() + 1);
            framed.push(COMPRESSED_MARKER);
            framed.extend_from_slice(&compressed);
            framed
        } else {
            // Incompressible payload; sending it as-is is not a failure
            data
        }
    }

    /// Decompress a marker-prefixed lz4 frame produced by `maybe_compress`
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let body = match data.split_first() {
            Some((&COMPRESSED_MARKER, body)) => body,
            _ => {
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                return Err(RealtimeError::compression(
                    "Missing compressed-frame marker",
                ));
            }
        };
        lz4_flex::decompress_size_prepended(body).map_err(|e| {
            self.fallbacks.fetch_add(1, Ordering::Relaxed);
            RealtimeError::compression(format!("lz4 decompression failed: {}", e))
        })
    }

    /// Number of times compression or decompression had to fall back
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    /// Size threshold below which frames are never compressed
    pub fn threshold_bytes(&self) -> usize {
        self.config.threshold_bytes
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(CompressionConfig::default())
    }
}
