use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::SaveResult;

use super::CanonicalEncoder;

pub const CHECKSUM_FIELD: &str = "checksum";

/// Canonical text of a sealed document and the digest embedded in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedDocument {
    pub text: String,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksumStatus {
    Valid,
    Missing,
    Mismatch { expected: String, actual: String },
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    to_hex_lower(&hasher.finalize())
}

/// Digest of the document's canonical form with the checksum field left out.
pub fn document_checksum(encoder: &CanonicalEncoder, document: &Value) -> SaveResult<String> {
    let canonical = encoder.encode(document, true)?;
    Ok(sha256_hex(canonical.as_bytes()))
}

/// Two-pass seal: digest the document without its checksum, store the digest,
/// then produce the final canonical text with the checksum included.
pub fn seal_document(
    encoder: &CanonicalEncoder,
    document: &mut Value,
) -> SaveResult<SealedDocument> {
    let checksum = document_checksum(encoder, document)?;
    if let Value::Object(map) = document {
        map.insert(CHECKSUM_FIELD.to_string(), Value::String(checksum.clone()));
    }
    let text = encoder.encode(document, false)?;
    Ok(SealedDocument { text, checksum })
}

pub fn check_document_checksum(
    encoder: &CanonicalEncoder,
    document: &Value,
) -> SaveResult<ChecksumStatus> {
    if document.get(CHECKSUM_FIELD).and_then(Value::as_str).is_none() {
        return Ok(ChecksumStatus::Missing);
    }
    let actual = document_checksum(encoder, document)?;
    Ok(checksum_status(document, actual))
}

/// Compares the stored checksum against an already computed digest.
pub fn checksum_status(document: &Value, actual: String) -> ChecksumStatus {
    match document.get(CHECKSUM_FIELD).and_then(Value::as_str) {
        None => ChecksumStatus::Missing,
        Some(stored) if stored == actual => ChecksumStatus::Valid,
        Some(stored) => ChecksumStatus::Mismatch {
            expected: stored.to_string(),
            actual,
        },
    }
}

pub fn verify_document_checksum(encoder: &CanonicalEncoder, document: &Value) -> SaveResult<bool> {
    Ok(check_document_checksum(encoder, document)? == ChecksumStatus::Valid)
}

pub(crate) fn to_hex_lower(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        use std::fmt::Write as _;
        let _ = write!(&mut output, "{byte:02x}");
    }
    output
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Incremental 64-bit FNV-1a, used for cache keys and change detection.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Fnv1a(u64);

impl Default for Fnv1a {
    fn default() -> Self {
        Self(FNV_OFFSET_BASIS)
    }
}

impl Fnv1a {
    pub(crate) fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.0 ^= u64::from(*byte);
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    pub(crate) fn write_u8(&mut self, byte: u8) {
        self.write(&[byte]);
    }

    pub(crate) fn finish(self) -> u64 {
        self.0
    }
}
