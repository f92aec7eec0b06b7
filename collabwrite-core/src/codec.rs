//! Compact binary encoding for stored records.
//!
//! Records are bincode-encoded (standard config) and LZ4-compressed with the
//! uncompressed size prepended.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("serialization error: {0}")]
    Encode(String),
    #[error("deserialization error: {0}")]
    Decode(String),
    #[error("decompression error: {0}")]
    Decompress(String),
}

/// bincode without compression (wire frames).
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| CodecError::Encode(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| CodecError::Decode(e.to_string()))?;
    Ok(value)
}

/// bincode followed by LZ4 (stored checkpoints and log entries).
pub fn encode_compressed<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let raw = encode(value)?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

pub fn decode_compressed<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| CodecError::Decompress(e.to_string()))?;
    decode(&raw)
}
