//! Envelope codec.
//!
//! Values are serialized to JSON. Payloads larger than the compression
//! threshold are gzipped, base64 encoded and prefixed with `GZIP:` so a reader
//! can tell the encoding from the stored bytes alone:
//!
//! ```text
//! [optional "GZIP:"][raw JSON | base64(gzip(JSON))]
//! ```
//!
//! The threshold and level only affect the writer. Any reader decodes any
//! envelope regardless of how it was configured.

use std::io::{Read, Write};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{CacheError, CodecError};

/// Marker prefixed to compressed envelopes.
pub const GZIP_MARKER: &[u8] = b"GZIP:";

/// Default compression threshold in bytes.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// Default gzip level.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Serializes values into self-describing envelopes.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    threshold: usize,
    level: Compression,
}

impl Default for Codec {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_COMPRESSION_THRESHOLD,
            level: Compression::new(DEFAULT_COMPRESSION_LEVEL),
        }
    }
}

impl Codec {
    /// Create a codec that compresses serialized payloads larger than `threshold` bytes.
    ///
    /// `level` is the gzip level (0-9).
    pub fn new(threshold: usize, level: u32) -> Result<Self, CacheError> {
        if level > 9 {
            return Err(CacheError::configuration(format!(
                "codec.compression_level must be in 0..=9, got {level}"
            )));
        }
        Ok(Self {
            threshold,
            level: Compression::new(level),
        })
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Serialize `value`, compressing when the JSON exceeds the threshold.
    pub fn encode<T>(&self, value: &T) -> Result<Vec<u8>, CodecError>
    where
        T: Serialize + ?Sized,
    {
        let json = serde_json::to_vec(value).map_err(CodecError::Serialize)?;
        if json.len() <= self.threshold {
            return Ok(json);
        }

        let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 2), self.level);
        encoder.write_all(&json)?;
        let compressed = encoder.finish()?;

        let mut envelope = Vec::with_capacity(GZIP_MARKER.len() + compressed.len() * 4 / 3 + 4);
        envelope.extend_from_slice(GZIP_MARKER);
        envelope.extend_from_slice(BASE64.encode(compressed).as_bytes());
        Ok(envelope)
    }

    /// Decode an envelope produced by any codec configuration.
    pub fn decode<T>(&self, bytes: &[u8]) -> Result<T, CodecError>
    where
        T: DeserializeOwned,
    {
        match bytes.strip_prefix(GZIP_MARKER) {
            Some(encoded) => {
                let compressed = BASE64.decode(encoded)?;
                let mut json = Vec::with_capacity(compressed.len() * 2);
                GzDecoder::new(compressed.as_slice()).read_to_end(&mut json)?;
                serde_json::from_slice(&json).map_err(CodecError::Deserialize)
            }
            None => serde_json::from_slice(bytes).map_err(CodecError::Deserialize),
        }
    }

    /// Whether the stored bytes carry the compressed marker.
    pub fn is_compressed(bytes: &[u8]) -> bool {
        bytes.starts_with(GZIP_MARKER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        tags: Vec<String>,
    }

    #[test]
    fn small_values_are_stored_as_plain_json() {
        let codec = Codec::default();
        let profile = Profile {
            name: "Ada".into(),
            tags: vec!["admin".into()],
        };

        let bytes = codec.encode(&profile).unwrap();
        assert!(!Codec::is_compressed(&bytes));
        assert_eq!(bytes, br#"{"name":"Ada","tags":["admin"]}"#);
        assert_eq!(codec.decode::<Profile>(&bytes).unwrap(), profile);
    }

    #[test]
    fn large_string_is_compressed_and_restored() {
        let codec = Codec::default();
        let original = "x".repeat(2000);

        let bytes = codec.encode(&original).unwrap();
        assert!(bytes.starts_with(b"GZIP:"));
        assert!(bytes.len() < original.len());

        let decoded: String = codec.decode(&bytes).unwrap();
        assert_eq!(decoded.len(), 2000);
        assert_eq!(decoded, original);
    }

    #[test]
    fn threshold_is_exclusive() {
        let codec = Codec::new(8, 6).unwrap();
        // "abcdef" serializes to 8 bytes including quotes
        assert!(!Codec::is_compressed(&codec.encode("abcdef").unwrap()));
        assert!(Codec::is_compressed(&codec.encode("abcdefg").unwrap()));
    }

    #[test]
    fn decoding_ignores_reader_threshold() {
        let writer = Codec::new(0, 9).unwrap();
        let reader = Codec::new(1_000_000, 1).unwrap();
        let value = vec![1u32, 2, 3];

        let bytes = writer.encode(&value).unwrap();
        assert!(Codec::is_compressed(&bytes));
        assert_eq!(reader.decode::<Vec<u32>>(&bytes).unwrap(), value);
    }

    #[test]
    fn corrupted_envelopes_are_codec_errors() {
        let codec = Codec::default();
        assert!(matches!(
            codec.decode::<String>(b"GZIP:!!not-base64!!"),
            Err(CodecError::Base64(_))
        ));
        assert!(matches!(
            codec.decode::<String>(b"GZIP:aGVsbG8="),
            Err(CodecError::Decompress(_))
        ));
        assert!(matches!(
            codec.decode::<String>(b"{not json"),
            Err(CodecError::Deserialize(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_level() {
        assert!(matches!(
            Codec::new(1024, 10),
            Err(CacheError::Configuration(_))
        ));
    }
}
