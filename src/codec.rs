//! The wire codec: JSON, then gzip.
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

/// Codec error.
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("Failed to encode the message body")]
    Compression(#[source] anyhow::Error),
    #[error("Failed to decode the message body")]
    Decompression(#[source] anyhow::Error),
}

/// Serialize `value` to JSON and gzip the result.
pub fn zip<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(value).map_err(|e| CodecError::Compression(e.into()))?;
    let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 2), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| CodecError::Compression(e.into()))?;
    encoder
        .finish()
        .map_err(|e| CodecError::Compression(e.into()))
}

/// Gunzip `bytes` and deserialize the JSON document they contain.
pub fn unzip<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let mut json = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut json)
        .map_err(|e| CodecError::Decompression(e.into()))?;
    serde_json::from_slice(&json).map_err(|e| CodecError::Decompression(e.into()))
}
