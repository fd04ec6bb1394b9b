use super::{CompressionAlgorithm, CompressionError};

pub const BLOCK_MAGIC: u32 = 0x4D43_5053;
pub const BLOCK_FORMAT_VERSION: u16 = 1;
pub const BLOCK_HEADER_LEN: usize = 32;

/// Fixed 32-byte envelope header. Every field is little-endian on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub magic: u32,
    pub format_version: u16,
    pub algorithm_id: u16,
    pub original_size: u64,
    pub compressed_size: u64,
    pub crc32: u32,
    pub reserved: u32,
}

impl BlockHeader {
    pub(crate) fn new(
        algorithm: CompressionAlgorithm,
        original_size: usize,
        compressed_size: usize,
        crc32: u32,
    ) -> Self {
        Self {
            magic: BLOCK_MAGIC,
            format_version: BLOCK_FORMAT_VERSION,
            algorithm_id: algorithm.id(),
            original_size: original_size as u64,
            compressed_size: compressed_size as u64,
            crc32,
            reserved: 0,
        }
    }

    pub fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::from_id(self.algorithm_id)
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.magic.to_le_bytes());
        out.extend_from_slice(&self.format_version.to_le_bytes());
        out.extend_from_slice(&self.algorithm_id.to_le_bytes());
        out.extend_from_slice(&self.original_size.to_le_bytes());
        out.extend_from_slice(&self.compressed_size.to_le_bytes());
        out.extend_from_slice(&self.crc32.to_le_bytes());
        out.extend_from_slice(&self.reserved.to_le_bytes());
    }

    fn read_from(bytes: &[u8], cursor: &mut usize) -> Result<Self, CompressionError> {
        let magic = read_u32(bytes, cursor)?;
        if magic != BLOCK_MAGIC {
            return Err(CompressionError::BadMagic { found: magic });
        }
        let format_version = read_u16(bytes, cursor)?;
        if format_version != BLOCK_FORMAT_VERSION {
            return Err(CompressionError::UnsupportedFormatVersion {
                found: format_version,
            });
        }
        Ok(Self {
            magic,
            format_version,
            algorithm_id: read_u16(bytes, cursor)?,
            original_size: read_u64(bytes, cursor)?,
            compressed_size: read_u64(bytes, cursor)?,
            crc32: read_u32(bytes, cursor)?,
            reserved: read_u32(bytes, cursor)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedBlock {
    pub header: BlockHeader,
    pub payload: Vec<u8>,
}

impl CompressedBlock {
    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.header.algorithm()
    }

    pub fn original_size(&self) -> usize {
        self.header.original_size as usize
    }

    pub fn compressed_size(&self) -> usize {
        self.header.compressed_size as usize
    }

    pub fn compression_ratio(&self) -> f64 {
        if self.header.original_size == 0 {
            1.0
        } else {
            self.header.compressed_size as f64 / self.header.original_size as f64
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BLOCK_HEADER_LEN + self.payload.len());
        self.header.write_to(&mut out);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CompressionError> {
        let mut cursor = 0usize;
        let header = BlockHeader::read_from(bytes, &mut cursor)?;
        let declared = usize::try_from(header.compressed_size).map_err(|_| {
            CompressionError::PayloadLength {
                declared: header.compressed_size,
                actual: bytes.len().saturating_sub(BLOCK_HEADER_LEN) as u64,
            }
        })?;
        let remaining = bytes.len() - cursor;
        if remaining != declared {
            return Err(CompressionError::PayloadLength {
                declared: header.compressed_size,
                actual: remaining as u64,
            });
        }
        let payload = read_exact(bytes, &mut cursor, declared)?.to_vec();
        Ok(Self { header, payload })
    }
}

/// True when `bytes` starts with the envelope magic.
pub fn is_compressed_block(bytes: &[u8]) -> bool {
    bytes.len() >= BLOCK_HEADER_LEN
        && bytes
            .get(..4)
            .and_then(|magic| <[u8; 4]>::try_from(magic).ok())
            .is_some_and(|magic| u32::from_le_bytes(magic) == BLOCK_MAGIC)
}

fn read_u16(bytes: &[u8], cursor: &mut usize) -> Result<u16, CompressionError> {
    let raw = read_exact(bytes, cursor, 2)?;
    Ok(u16::from_le_bytes([raw[0], raw[1]]))
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32, CompressionError> {
    let raw = read_exact(bytes, cursor, 4)?;
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn read_u64(bytes: &[u8], cursor: &mut usize) -> Result<u64, CompressionError> {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(read_exact(bytes, cursor, 8)?);
    Ok(u64::from_le_bytes(raw))
}

fn read_exact<'a>(
    bytes: &'a [u8],
    cursor: &mut usize,
    len: usize,
) -> Result<&'a [u8], CompressionError> {
    let end = cursor.saturating_add(len);
    if end > bytes.len() {
        return Err(CompressionError::Truncated {
            needed: end,
            available: bytes.len(),
        });
    }
    let out = &bytes[*cursor..end];
    *cursor = end;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> CompressedBlock {
        CompressedBlock {
            header: BlockHeader::new(CompressionAlgorithm::None, 3, 3, 0xDEAD_BEEF),
            payload: vec![1, 2, 3],
        }
    }

    #[test]
    fn header_layout_is_little_endian_and_fixed_width() {
        let bytes = sample_block().to_bytes();
        assert_eq!(bytes.len(), BLOCK_HEADER_LEN + 3);
        assert_eq!(&bytes[0..4], &[0x53, 0x50, 0x43, 0x4D]);
        assert_eq!(&bytes[4..6], &[1, 0]);
        assert_eq!(&bytes[6..8], &[0, 0]);
        assert_eq!(&bytes[8..16], &3u64.to_le_bytes());
        assert_eq!(&bytes[16..24], &3u64.to_le_bytes());
        assert_eq!(&bytes[24..28], &[0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(&bytes[28..32], &[0, 0, 0, 0]);
        assert!(is_compressed_block(&bytes));
    }

    #[test]
    fn parse_rejects_bad_magic_version_and_length() {
        let good = sample_block().to_bytes();

        let mut bad_magic = good.clone();
        bad_magic[0] = 0;
        assert!(matches!(
            CompressedBlock::from_bytes(&bad_magic),
            Err(CompressionError::BadMagic { .. })
        ));

        let mut bad_version = good.clone();
        bad_version[4] = 9;
        assert!(matches!(
            CompressedBlock::from_bytes(&bad_version),
            Err(CompressionError::UnsupportedFormatVersion { found: 9 })
        ));

        let truncated = &good[..good.len() - 1];
        assert!(matches!(
            CompressedBlock::from_bytes(truncated),
            Err(CompressionError::PayloadLength { .. })
        ));

        assert!(matches!(
            CompressedBlock::from_bytes(&good[..10]),
            Err(CompressionError::Truncated { .. })
        ));

        let parsed = CompressedBlock::from_bytes(&good).expect("parse");
        assert_eq!(parsed, sample_block());
    }

    #[test]
    fn plain_json_is_not_mistaken_for_a_block() {
        assert!(!is_compressed_block(br#"{"header":{},"systems":{},"checksum":"00"}"#));
        assert!(!is_compressed_block(&[]));
    }
}
