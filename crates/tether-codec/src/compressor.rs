//! Compression codecs.
//!
//! Gzip and zlib are backed by `flate2`. Each call is independent: no
//! dictionary or stream state is carried between payloads, so a payload can be
//! decompressed by any peer holding the same algorithm.

use bytes::Bytes;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Write};
use thiserror::Error;

/// Highest compression level accepted by the deflate based codecs.
pub const MAX_LEVEL: u32 = 9;

/// Level used when a config omits one.
pub const DEFAULT_LEVEL: u32 = 6;

/// Decompressed size cap applied by [`Codec::decompress`].
pub const DEFAULT_MAX_DECOMPRESSED_SIZE: usize = 16 * 1024 * 1024;

/// Codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Compressing a payload failed.
    #[error("Compression failed: {0}")]
    Compress(#[source] io::Error),

    /// Decompressing a payload failed (truncated or foreign data).
    #[error("Decompression failed: {0}")]
    Decompress(#[source] io::Error),

    /// The decompressed payload exceeds the size cap.
    #[error("Decompressed payload exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

/// A payload compression capability.
///
/// Implementations must satisfy `decompress(compress(x)) == x` for every byte
/// sequence `x`.
pub trait Codec: Send + Sync + fmt::Debug {
    /// Compress a payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the encoder fails.
    fn compress(&self, input: &[u8]) -> Result<Bytes, CodecError>;

    /// Decompress a payload, capped at [`DEFAULT_MAX_DECOMPRESSED_SIZE`].
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid for this codec or inflates
    /// past the cap.
    fn decompress(&self, input: &[u8]) -> Result<Bytes, CodecError> {
        self.decompress_limited(input, DEFAULT_MAX_DECOMPRESSED_SIZE)
    }

    /// Decompress a payload, failing once the output grows past `limit` bytes.
    ///
    /// Decoding stops at `limit + 1` bytes, so a small hostile input never
    /// allocates more than that.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TooLarge`] past the cap, or
    /// [`CodecError::Decompress`] if the input is not valid for this codec.
    fn decompress_limited(&self, input: &[u8], limit: usize) -> Result<Bytes, CodecError>;

    /// Short algorithm name, used in logs.
    fn name(&self) -> &'static str;
}

/// Built-in compressors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "lowercase")]
pub enum Compressor {
    /// Payloads pass through untouched.
    #[default]
    None,
    /// RFC 1952 gzip.
    Gzip {
        #[serde(default = "default_level")]
        level: u32,
    },
    /// RFC 1950 zlib.
    Zlib {
        #[serde(default = "default_level")]
        level: u32,
    },
}

fn default_level() -> u32 {
    DEFAULT_LEVEL
}

impl Compressor {
    /// Gzip with the given level (clamped to `0..=9`).
    #[must_use]
    pub fn gzip(level: u32) -> Self {
        Self::Gzip {
            level: level.min(MAX_LEVEL),
        }
    }

    /// Zlib with the given level (clamped to `0..=9`).
    #[must_use]
    pub fn zlib(level: u32) -> Self {
        Self::Zlib {
            level: level.min(MAX_LEVEL),
        }
    }

    /// Whether this compressor leaves payloads untouched.
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl Codec for Compressor {
    fn compress(&self, input: &[u8]) -> Result<Bytes, CodecError> {
        match *self {
            Self::None => Ok(Bytes::copy_from_slice(input)),
            Self::Gzip { level } => {
                let mut encoder =
                    GzEncoder::new(Vec::with_capacity(input.len() / 2), level_of(level));
                encoder.write_all(input).map_err(CodecError::Compress)?;
                encoder.finish().map(Bytes::from).map_err(CodecError::Compress)
            }
            Self::Zlib { level } => {
                let mut encoder =
                    ZlibEncoder::new(Vec::with_capacity(input.len() / 2), level_of(level));
                encoder.write_all(input).map_err(CodecError::Compress)?;
                encoder.finish().map(Bytes::from).map_err(CodecError::Compress)
            }
        }
    }

    fn decompress_limited(&self, input: &[u8], limit: usize) -> Result<Bytes, CodecError> {
        let cap = (limit as u64).saturating_add(1);
        let mut out = Vec::with_capacity(input.len().saturating_mul(2).min(limit));
        match self {
            Self::None => out.extend_from_slice(input),
            Self::Gzip { .. } => {
                GzDecoder::new(input)
                    .take(cap)
                    .read_to_end(&mut out)
                    .map_err(CodecError::Decompress)?;
            }
            Self::Zlib { .. } => {
                ZlibDecoder::new(input)
                    .take(cap)
                    .read_to_end(&mut out)
                    .map_err(CodecError::Decompress)?;
            }
        }
        if out.len() > limit {
            return Err(CodecError::TooLarge { limit });
        }
        Ok(Bytes::from(out))
    }

    fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip { .. } => "gzip",
            Self::Zlib { .. } => "zlib",
        }
    }
}

fn level_of(level: u32) -> Compression {
    Compression::new(level.min(MAX_LEVEL))
}
