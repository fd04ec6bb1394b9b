//! On-disk layout of a save file: `{header, systems, checksum}` as canonical
//! JSON, optionally wrapped in a compression envelope.

use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::compression::{self, is_compressed_block, CompressionAlgorithm, DEFAULT_LEVEL};
use crate::config::SaveCompression;
use crate::error::{SaveError, SaveResult};
use crate::version::SaveVersion;

pub const FORMAT_NAME: &str = "json_canonical";
pub const CREATED_BY: &str = "SaveManager";

pub fn build_header(version: &SaveVersion, product: &str) -> Value {
    json!({
        "version": version.to_string(),
        "timestamp": Utc::now().timestamp(),
        "product": product,
        "format": FORMAT_NAME,
        "created_by": CREATED_BY,
    })
}

pub fn new_document(version: &SaveVersion, product: &str, systems: Map<String, Value>) -> Value {
    json!({
        "header": build_header(version, product),
        "systems": Value::Object(systems),
    })
}

/// Parses raw file bytes, unwrapping a compression envelope if present.
pub fn decode_save_bytes(bytes: &[u8]) -> SaveResult<Value> {
    if bytes.is_empty() {
        return Err(SaveError::corruption("save file is empty"));
    }
    let unpacked;
    let text = if is_compressed_block(bytes) {
        unpacked = compression::unpack(bytes)?;
        unpacked.as_slice()
    } else {
        bytes
    };
    serde_json::from_slice(text)
        .map_err(|error| SaveError::corruption(format!("cannot parse save JSON: {error}")))
}

pub fn encode_save_bytes(canonical_text: &str, compression: SaveCompression) -> SaveResult<Vec<u8>> {
    let algorithm = match compression {
        SaveCompression::Off => return Ok(canonical_text.as_bytes().to_vec()),
        SaveCompression::Fast => CompressionAlgorithm::Fast,
        SaveCompression::High => CompressionAlgorithm::HighRatio,
    };
    let block = compression::compress_with(canonical_text.as_bytes(), algorithm, DEFAULT_LEVEL)?;
    Ok(block.to_bytes())
}

pub fn document_version(document: &Value) -> SaveResult<SaveVersion> {
    let text = document
        .get("header")
        .and_then(|header| header.get("version"))
        .and_then(Value::as_str)
        .ok_or_else(|| SaveError::VersionError {
            message: "save header has no version".to_string(),
        })?;
    Ok(SaveVersion::parse(text)?)
}

pub fn document_timestamp(document: &Value) -> Option<i64> {
    document
        .get("header")
        .and_then(|header| header.get("timestamp"))
        .and_then(Value::as_i64)
}

pub fn document_systems(document: &Value) -> Option<&Map<String, Value>> {
    document.get("systems").and_then(Value::as_object)
}

/// Checks the fields recovery treats as mandatory.
pub fn check_required_fields(document: &Value) -> Result<(), String> {
    let header = document
        .get("header")
        .and_then(Value::as_object)
        .ok_or("missing header object")?;
    let version = header
        .get("version")
        .and_then(Value::as_str)
        .ok_or("header has no version")?;
    SaveVersion::parse(version).map_err(|error| format!("header version: {error}"))?;
    if !header.get("product").is_some_and(Value::is_string) {
        return Err("header has no product".to_string());
    }
    if !header.get("timestamp").is_some_and(Value::is_number) {
        return Err("header has no timestamp".to_string());
    }
    if document_systems(document).is_none() {
        return Err("missing systems object".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_carries_format_identity() {
        let document = new_document(&SaveVersion::new(1, 2, 0), "demo", Map::new());
        assert_eq!(document["header"]["format"], json!(FORMAT_NAME));
        assert_eq!(document["header"]["created_by"], json!(CREATED_BY));
        assert_eq!(document_version(&document).expect("version"), SaveVersion::new(1, 2, 0));
        assert!(document_timestamp(&document).is_some());
        assert!(check_required_fields(&document).is_ok());
    }

    #[test]
    fn compressed_and_plain_bytes_decode_alike() {
        let text = r#"{"header":{"version":"1.0.0"},"systems":{"a":[1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1]}}"#;
        let plain = encode_save_bytes(text, SaveCompression::Off).expect("plain");
        let fast = encode_save_bytes(text, SaveCompression::Fast).expect("fast");
        let high = encode_save_bytes(text, SaveCompression::High).expect("high");
        assert!(!is_compressed_block(&plain));
        assert!(is_compressed_block(&fast));
        let expected = decode_save_bytes(&plain).expect("decode plain");
        assert_eq!(decode_save_bytes(&fast).expect("decode fast"), expected);
        assert_eq!(decode_save_bytes(&high).expect("decode high"), expected);
    }

    #[test]
    fn garbage_and_empty_files_are_corruption() {
        assert!(matches!(
            decode_save_bytes(b""),
            Err(SaveError::CorruptionDetected { .. })
        ));
        assert!(matches!(
            decode_save_bytes(b"{\"header\": "),
            Err(SaveError::CorruptionDetected { .. })
        ));
    }

    #[test]
    fn required_fields_name_the_gap() {
        let missing_product = json!({"header": {"version": "1.0.0", "timestamp": 5}, "systems": {}});
        assert_eq!(
            check_required_fields(&missing_product),
            Err("header has no product".to_string())
        );
        let missing_systems = json!({"header": {"version": "1.0.0", "timestamp": 5, "product": "p"}});
        assert_eq!(
            check_required_fields(&missing_systems),
            Err("missing systems object".to_string())
        );
    }
}
