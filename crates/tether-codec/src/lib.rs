//! # tether-codec
//!
//! Payload compression for tether connections.
//!
//! A connection pump compresses every outbound payload right before the
//! transport write and decompresses every inbound payload right after the
//! transport read. Anything implementing [`Codec`] can be plugged in; the
//! built-in [`Compressor`] covers the common cases.
//!
//! ## Example
//!
//! ```rust
//! use tether_codec::{Codec, Compressor};
//!
//! let codec = Compressor::zlib(5);
//! let packed = codec.compress(b"hello, hello, hello").unwrap();
//! let unpacked = codec.decompress(&packed).unwrap();
//! assert_eq!(&unpacked[..], b"hello, hello, hello");
//! ```

pub mod compressor;

pub use compressor::{
    Codec, CodecError, Compressor, DEFAULT_LEVEL, DEFAULT_MAX_DECOMPRESSED_SIZE, MAX_LEVEL,
};
