//! Byte-level compression behind a stable binary envelope.

mod block;

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::sync;

pub use block::{
    is_compressed_block, BlockHeader, CompressedBlock, BLOCK_FORMAT_VERSION, BLOCK_HEADER_LEN,
    BLOCK_MAGIC,
};

/// Compressed output must be below this fraction of the input to be kept.
const MIN_SAVINGS_RATIO: f64 = 0.95;
const ENTROPY_SAMPLE_LEN: usize = 1024;
const HIGH_ENTROPY_THRESHOLD: f64 = 7.5;
const LOW_ENTROPY_THRESHOLD: f64 = 4.0;
const MIN_COMPRESSIBLE_LEN: usize = 1024;

pub const DEFAULT_LEVEL: i32 = 6;
/// Levels outside `1..=MAX_LEVEL` are clamped before reaching a codec.
pub const MAX_LEVEL: i32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CompressionAlgorithm {
    None,
    Fast,
    HighRatio,
}

impl CompressionAlgorithm {
    pub const ALL: [CompressionAlgorithm; 3] = [Self::None, Self::Fast, Self::HighRatio];

    pub fn id(self) -> u16 {
        match self {
            Self::None => 0,
            Self::Fast => 1,
            Self::HighRatio => 2,
        }
    }

    /// Reserved ids fall back to the fast algorithm.
    pub fn from_id(id: u16) -> Self {
        match id {
            0 => Self::None,
            2 => Self::HighRatio,
            _ => Self::Fast,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Fast => "lz4",
            Self::HighRatio => "zstd",
        }
    }
}

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("expected decompressed size must be non-zero")]
    ZeroExpectedSize,
    #[error("expected size {expected} does not match block original size {declared}")]
    ExpectedSizeMismatch { expected: usize, declared: u64 },
    #[error("decompressed length {actual} does not match expected {expected}")]
    OutputLengthMismatch { expected: usize, actual: usize },
    #[error("block payload length {actual} does not match declared {declared}")]
    PayloadLength { declared: u64, actual: u64 },
    #[error("block truncated: needed {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("invalid block magic 0x{found:08X}")]
    BadMagic { found: u32 },
    #[error("unsupported block format version {found}")]
    UnsupportedFormatVersion { found: u16 },
    #[error("crc32 mismatch (header 0x{expected:08X}, data 0x{actual:08X})")]
    CrcMismatch { expected: u32, actual: u32 },
    #[error("{algorithm} codec error: {message}")]
    Codec {
        algorithm: &'static str,
        message: String,
    },
}

/// Compresses `data`, choosing the fast or high-ratio algorithm.
///
/// Falls back to storing the input verbatim when compression does not save
/// at least 5%.
pub fn compress(
    data: &[u8],
    level: i32,
    favor_speed: bool,
) -> Result<CompressedBlock, CompressionError> {
    let algorithm = if favor_speed {
        CompressionAlgorithm::Fast
    } else {
        CompressionAlgorithm::HighRatio
    };
    compress_with(data, algorithm, level)
}

pub fn compress_with(
    data: &[u8],
    algorithm: CompressionAlgorithm,
    level: i32,
) -> Result<CompressedBlock, CompressionError> {
    let crc = crc32fast::hash(data);
    if data.is_empty() {
        return Ok(stored_block(data, crc));
    }

    let compressed = match algorithm {
        CompressionAlgorithm::None => return Ok(stored_block(data, crc)),
        CompressionAlgorithm::Fast => lz4_flex::block::compress(data),
        CompressionAlgorithm::HighRatio => {
            zstd::bulk::compress(data, clamp_high_ratio_level(level)).map_err(|error| {
                CompressionError::Codec {
                    algorithm: CompressionAlgorithm::HighRatio.name(),
                    message: error.to_string(),
                }
            })?
        }
    };

    if (compressed.len() as f64) >= (data.len() as f64) * MIN_SAVINGS_RATIO {
        debug!(
            algorithm = algorithm.name(),
            original = data.len(),
            compressed = compressed.len(),
            "compression_ineffective_storing_raw"
        );
        return Ok(stored_block(data, crc));
    }

    Ok(CompressedBlock {
        header: BlockHeader::new(algorithm, data.len(), compressed.len(), crc),
        payload: compressed,
    })
}

/// Decompresses `block`, requiring the output to be exactly `expected_size`
/// bytes with a matching crc.
pub fn decompress(
    block: &CompressedBlock,
    expected_size: usize,
) -> Result<Vec<u8>, CompressionError> {
    if expected_size == 0 {
        return Err(CompressionError::ZeroExpectedSize);
    }
    if block.header.original_size != expected_size as u64 {
        return Err(CompressionError::ExpectedSizeMismatch {
            expected: expected_size,
            declared: block.header.original_size,
        });
    }
    if block.payload.len() as u64 != block.header.compressed_size {
        return Err(CompressionError::PayloadLength {
            declared: block.header.compressed_size,
            actual: block.payload.len() as u64,
        });
    }

    let output = match block.algorithm() {
        CompressionAlgorithm::None => block.payload.clone(),
        CompressionAlgorithm::Fast => lz4_flex::block::decompress(&block.payload, expected_size)
            .map_err(|error| CompressionError::Codec {
                algorithm: CompressionAlgorithm::Fast.name(),
                message: error.to_string(),
            })?,
        CompressionAlgorithm::HighRatio => zstd::bulk::decompress(&block.payload, expected_size)
            .map_err(|error| CompressionError::Codec {
                algorithm: CompressionAlgorithm::HighRatio.name(),
                message: error.to_string(),
            })?,
    };

    if output.len() != expected_size {
        return Err(CompressionError::OutputLengthMismatch {
            expected: expected_size,
            actual: output.len(),
        });
    }

    let actual_crc = crc32fast::hash(&output);
    if actual_crc != block.header.crc32 {
        return Err(CompressionError::CrcMismatch {
            expected: block.header.crc32,
            actual: actual_crc,
        });
    }
    Ok(output)
}

/// Parses an envelope and decompresses it to its declared original size.
pub fn unpack(bytes: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let block = CompressedBlock::from_bytes(bytes)?;
    if block.header.original_size == 0 {
        return Ok(Vec::new());
    }
    let expected = usize::try_from(block.header.original_size).map_err(|_| {
        CompressionError::ExpectedSizeMismatch {
            expected: usize::MAX,
            declared: block.header.original_size,
        }
    })?;
    decompress(&block, expected)
}

fn stored_block(data: &[u8], crc: u32) -> CompressedBlock {
    CompressedBlock {
        header: BlockHeader::new(CompressionAlgorithm::None, data.len(), data.len(), crc),
        payload: data.to_vec(),
    }
}

pub fn clamp_level(level: i32) -> i32 {
    level.clamp(1, MAX_LEVEL)
}

fn clamp_high_ratio_level(level: i32) -> i32 {
    let max = *zstd::compression_level_range().end();
    clamp_level(level).min(max)
}

/// Shannon entropy in bits per byte over at most the first 1KB of `data`.
pub fn analyze_entropy(data: &[u8]) -> f64 {
    let sample = &data[..data.len().min(ENTROPY_SAMPLE_LEN)];
    if sample.is_empty() {
        return 0.0;
    }
    let mut counts = [0usize; 256];
    for byte in sample {
        counts[*byte as usize] += 1;
    }
    let total = sample.len() as f64;
    counts
        .iter()
        .filter(|count| **count > 0)
        .map(|count| {
            let p = *count as f64 / total;
            -p * p.log2()
        })
        .sum()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompressionRecommendation {
    pub algorithm: CompressionAlgorithm,
    pub level: i32,
    pub entropy: f64,
    pub reason: &'static str,
}

pub fn recommend_algorithm(data: &[u8]) -> CompressionRecommendation {
    let entropy = analyze_entropy(data);
    let (algorithm, level, reason) = if data.len() < MIN_COMPRESSIBLE_LEN {
        (CompressionAlgorithm::None, 0, "payload too small to benefit")
    } else if entropy > HIGH_ENTROPY_THRESHOLD {
        (CompressionAlgorithm::None, 0, "data looks already compressed")
    } else if entropy < LOW_ENTROPY_THRESHOLD {
        (CompressionAlgorithm::HighRatio, 9, "highly compressible data")
    } else {
        (CompressionAlgorithm::Fast, 1, "balanced speed and ratio")
    };
    CompressionRecommendation {
        algorithm,
        level,
        entropy,
        reason,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CompressionStats {
    pub total_compressions: u64,
    pub total_decompressions: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub fallbacks_to_raw: u64,
    pub compress_time: Duration,
    pub decompress_time: Duration,
}

impl CompressionStats {
    pub fn compression_ratio(&self) -> f64 {
        if self.bytes_in == 0 {
            1.0
        } else {
            self.bytes_out as f64 / self.bytes_in as f64
        }
    }
}

/// Codec front end that records throughput statistics.
#[derive(Debug, Default)]
pub struct Compressor {
    stats: Mutex<CompressionStats>,
}

impl Compressor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compress(
        &self,
        data: &[u8],
        level: i32,
        favor_speed: bool,
    ) -> Result<CompressedBlock, CompressionError> {
        let started = Instant::now();
        let block = compress(data, level, favor_speed)?;
        let elapsed = started.elapsed();

        let mut stats = sync::lock(&self.stats, "compression_stats_compress");
        stats.total_compressions += 1;
        stats.bytes_in += data.len() as u64;
        stats.bytes_out += block.payload.len() as u64;
        if block.algorithm() == CompressionAlgorithm::None && !data.is_empty() {
            stats.fallbacks_to_raw += 1;
        }
        stats.compress_time += elapsed;
        Ok(block)
    }

    pub fn decompress(
        &self,
        block: &CompressedBlock,
        expected_size: usize,
    ) -> Result<Vec<u8>, CompressionError> {
        let started = Instant::now();
        let output = decompress(block, expected_size)?;
        let mut stats = sync::lock(&self.stats, "compression_stats_decompress");
        stats.total_decompressions += 1;
        stats.decompress_time += started.elapsed();
        Ok(output)
    }

    pub fn stats(&self) -> CompressionStats {
        *sync::lock(&self.stats, "compression_stats_read")
    }

    pub fn reset_stats(&self) {
        *sync::lock(&self.stats, "compression_stats_reset") = CompressionStats::default();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkEntry {
    pub algorithm: CompressionAlgorithm,
    pub stored_as: CompressionAlgorithm,
    pub original_size: usize,
    pub compressed_size: usize,
    pub ratio: f64,
    pub compress_micros: u128,
    pub decompress_micros: u128,
    pub round_trip_ok: bool,
}

/// Runs every algorithm over `data` and reports size and timing.
pub fn benchmark(data: &[u8], level: i32) -> Vec<BenchmarkEntry> {
    CompressionAlgorithm::ALL
        .iter()
        .filter_map(|algorithm| {
            let started = Instant::now();
            let block = compress_with(data, *algorithm, level).ok()?;
            let compress_micros = started.elapsed().as_micros();

            let started = Instant::now();
            let round_trip_ok = if data.is_empty() {
                block.payload.is_empty()
            } else {
                decompress(&block, data.len()).is_ok_and(|output| output == data)
            };
            let decompress_micros = started.elapsed().as_micros();

            Some(BenchmarkEntry {
                algorithm: *algorithm,
                stored_as: block.algorithm(),
                original_size: data.len(),
                compressed_size: block.compressed_size(),
                ratio: block.compression_ratio(),
                compress_micros,
                decompress_micros,
                round_trip_ok,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repetitive(len: usize) -> Vec<u8> {
        b"province:grain=120;iron=40;"
            .iter()
            .copied()
            .cycle()
            .take(len)
            .collect()
    }

    fn noisy(len: usize) -> Vec<u8> {
        let mut state = 0x2545_F491_4F6C_DD1Du64;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 24) as u8
            })
            .collect()
    }

    #[test]
    fn round_trips_every_algorithm() {
        let inputs = [repetitive(5000), noisy(3000), b"x".to_vec()];
        for input in &inputs {
            for algorithm in CompressionAlgorithm::ALL {
                let block = compress_with(input, algorithm, DEFAULT_LEVEL).expect("compress");
                let output = decompress(&block, input.len()).expect("decompress");
                assert_eq!(&output, input, "{algorithm:?} round trip");
            }
        }
    }

    #[test]
    fn fast_mode_shrinks_structured_payload() {
        let mut payload = br#"{"systems":{"tiny":"0123456789","#.to_vec();
        payload.extend_from_slice(br#""bulk":""#);
        payload.extend_from_slice(&repetitive(5000));
        payload.extend_from_slice(br#""}}"#);

        let block = compress(&payload, DEFAULT_LEVEL, true).expect("compress");
        assert_eq!(block.algorithm(), CompressionAlgorithm::Fast);
        assert!(block.compressed_size() < block.original_size());
        assert_eq!(decompress(&block, payload.len()).expect("decompress"), payload);
    }

    #[test]
    fn incompressible_input_is_stored_raw() {
        let data = noisy(4096);
        let block = compress(&data, DEFAULT_LEVEL, false).expect("compress");
        assert_eq!(block.algorithm(), CompressionAlgorithm::None);
        assert_eq!(block.original_size(), block.compressed_size());
        assert_eq!(block.payload, data);
    }

    #[test]
    fn decompress_rejects_zero_and_mismatched_sizes() {
        let data = repetitive(2048);
        let block = compress(&data, 3, true).expect("compress");

        assert!(matches!(
            decompress(&block, 0),
            Err(CompressionError::ZeroExpectedSize)
        ));
        assert!(matches!(
            decompress(&block, data.len() - 1),
            Err(CompressionError::ExpectedSizeMismatch { .. })
        ));

        let mut lying = block.clone();
        lying.header.original_size += 10;
        assert!(decompress(&lying, data.len() + 10).is_err());
    }

    #[test]
    fn corrupted_payload_is_detected() {
        let data = repetitive(4096);
        let mut block = compress(&data, 3, false).expect("compress");
        let middle = block.payload.len() / 2;
        block.payload[middle] ^= 0xFF;
        assert!(decompress(&block, data.len()).is_err());

        let mut raw = compress_with(&data, CompressionAlgorithm::None, 0).expect("raw");
        raw.payload[0] ^= 0x01;
        assert!(matches!(
            decompress(&raw, data.len()),
            Err(CompressionError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn unknown_algorithm_ids_fall_back_to_fast() {
        assert_eq!(CompressionAlgorithm::from_id(7), CompressionAlgorithm::Fast);
        assert_eq!(CompressionAlgorithm::from_id(2), CompressionAlgorithm::HighRatio);
        assert_eq!(CompressionAlgorithm::from_id(0), CompressionAlgorithm::None);
    }

    #[test]
    fn entropy_drives_recommendation() {
        assert_eq!(analyze_entropy(&[]), 0.0);
        assert_eq!(analyze_entropy(&[7u8; 2000]), 0.0);

        let all_bytes = (0..=255u8).cycle().take(1024).collect::<Vec<_>>();
        assert!((analyze_entropy(&all_bytes) - 8.0).abs() < 1e-9);
        assert_eq!(
            recommend_algorithm(&all_bytes).algorithm,
            CompressionAlgorithm::None
        );

        assert_eq!(
            recommend_algorithm(&[1u8; 100]).algorithm,
            CompressionAlgorithm::None
        );
        assert_eq!(
            recommend_algorithm(&[b'a'; 4096]).algorithm,
            CompressionAlgorithm::HighRatio
        );

        let alphabet = b"abcdefghijklmnopqrstuvwxyz0123456789";
        let text = (0..4096usize)
            .map(|i| alphabet[(i * 7) % alphabet.len()])
            .collect::<Vec<_>>();
        let entropy = analyze_entropy(&text);
        assert!(entropy > 4.0 && entropy < 7.5, "entropy {entropy}");
        assert_eq!(recommend_algorithm(&text).algorithm, CompressionAlgorithm::Fast);
    }

    #[test]
    fn envelope_bytes_unpack_to_original() {
        let data = repetitive(3000);
        let bytes = compress(&data, 5, false).expect("compress").to_bytes();
        assert!(is_compressed_block(&bytes));
        assert_eq!(unpack(&bytes).expect("unpack"), data);
    }

    #[test]
    fn compressor_tracks_stats() {
        let compressor = Compressor::new();
        let data = repetitive(4000);
        let block = compressor.compress(&data, 3, true).expect("compress");
        compressor
            .compress(&noisy(2000), 3, true)
            .expect("compress noisy");
        compressor
            .decompress(&block, data.len())
            .expect("decompress");

        let stats = compressor.stats();
        assert_eq!(stats.total_compressions, 2);
        assert_eq!(stats.total_decompressions, 1);
        assert_eq!(stats.fallbacks_to_raw, 1);
        assert!(stats.compression_ratio() < 1.0);

        compressor.reset_stats();
        assert_eq!(compressor.stats(), CompressionStats::default());
    }

    #[test]
    fn out_of_range_levels_are_clamped() {
        assert_eq!(clamp_level(0), 1);
        assert_eq!(clamp_level(-7), 1);
        assert_eq!(clamp_level(50), MAX_LEVEL);
        assert_eq!(clamp_level(DEFAULT_LEVEL), DEFAULT_LEVEL);

        let input = repetitive(4096);
        let block = compress(&input, 50, false).expect("compress");
        assert_eq!(block.algorithm(), CompressionAlgorithm::HighRatio);
        assert_eq!(unpack(&block.to_bytes()).expect("unpack"), input);
    }

    #[test]
    fn benchmark_reports_each_algorithm() {
        let entries = benchmark(&repetitive(8192), DEFAULT_LEVEL);
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|entry| entry.round_trip_ok));
        let high = entries
            .iter()
            .find(|entry| entry.algorithm == CompressionAlgorithm::HighRatio)
            .expect("zstd entry");
        assert!(high.ratio < 0.5);
    }
}
