//! Compression codec registry (component C4).
//!
//! # Identity rules
//! Every codec is identified by its canonical name, stored on disk as a
//! 16-byte NUL-padded ASCII string in the header (see [`crate::header`]).
//! There is no UUID indirection and no runtime codec negotiation: a reader
//! that does not recognize the header's codec name fails immediately.
//!
//! `none`, `deflate`, `bz2`, and `lzma2;dsize=2^20` are the only codec names
//! ZS readers and writers ever need to understand; the user-facing CLI
//! accepts the shorter aliases `none`/`deflate`/`bz2`/`lzma` and maps `lzma`
//! onto the canonical `lzma2;dsize=2^20` string.

use crate::error::CodecError;
use std::io::{self, Read, Write};
use xz2::stream::{Filters, LzmaOptions, Stream};

/// 1 MiB — the fixed LZMA2 dictionary size this format uses.
const LZMA2_DICT_SIZE: u32 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecId {
    None,
    Deflate,
    Bz2,
    Lzma2,
}

impl CodecId {
    /// The exact string stored (NUL-padded to 16 bytes) in the header.
    pub fn canonical_name(self) -> &'static str {
        match self {
            CodecId::None => "none",
            CodecId::Deflate => "deflate",
            CodecId::Bz2 => "bz2",
            CodecId::Lzma2 => "lzma2;dsize=2^20",
        }
    }

    pub fn from_canonical_name(s: &str) -> Option<Self> {
        match s {
            "none" => Some(CodecId::None),
            "deflate" => Some(CodecId::Deflate),
            "bz2" => Some(CodecId::Bz2),
            "lzma2;dsize=2^20" => Some(CodecId::Lzma2),
            _ => None,
        }
    }

    /// Parse a CLI-facing shorthand (`none`/`deflate`/`bz2`/`lzma`) into a
    /// codec, mapping `lzma` onto the canonical `lzma2;dsize=2^20` string.
    pub fn from_shorthand(s: &str) -> Option<Self> {
        match s {
            "none" => Some(CodecId::None),
            "deflate" => Some(CodecId::Deflate),
            "bz2" => Some(CodecId::Bz2),
            "lzma" => Some(CodecId::Lzma2),
            other => Self::from_canonical_name(other),
        }
    }
}

/// Compress/decompress trait; `level` is the codec-specific "compress
/// level" passed through from [`crate::writer::WriterOptions`] and is
/// ignored by codecs (like `none`) for which it has no meaning.
pub trait Codec: Send + Sync {
    fn codec_id(&self) -> CodecId;
    fn compress(&self, data: &[u8], level: u32, extreme: bool) -> Result<Vec<u8>, CodecError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
}

pub struct NoneCodec;
impl Codec for NoneCodec {
    fn codec_id(&self) -> CodecId {
        CodecId::None
    }
    fn compress(&self, data: &[u8], _level: u32, _extreme: bool) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }
}

/// Raw DEFLATE — no zlib or gzip framing.
pub struct DeflateCodec;
impl Codec for DeflateCodec {
    fn codec_id(&self) -> CodecId {
        CodecId::Deflate
    }
    fn compress(&self, data: &[u8], level: u32, _extreme: bool) -> Result<Vec<u8>, CodecError> {
        use flate2::write::DeflateEncoder;
        use flate2::Compression;
        let mut enc = DeflateEncoder::new(Vec::new(), Compression::new(level.clamp(0, 9)));
        enc.write_all(data)?;
        Ok(enc.finish()?)
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        use flate2::read::DeflateDecoder;
        let mut out = Vec::new();
        DeflateDecoder::new(data).read_to_end(&mut out)?;
        Ok(out)
    }
}

pub struct Bz2Codec;
impl Codec for Bz2Codec {
    fn codec_id(&self) -> CodecId {
        CodecId::Bz2
    }
    fn compress(&self, data: &[u8], level: u32, _extreme: bool) -> Result<Vec<u8>, CodecError> {
        use bzip2::write::BzEncoder;
        use bzip2::Compression;
        let clamped = if level == 0 { 9 } else { level.clamp(1, 9) };
        let mut enc = BzEncoder::new(Vec::new(), Compression::new(clamped));
        enc.write_all(data)?;
        Ok(enc.finish()?)
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        use bzip2::read::BzDecoder;
        let mut out = Vec::new();
        BzDecoder::new(data).read_to_end(&mut out)?;
        Ok(out)
    }
}

/// Raw LZMA2, dictionary fixed at 1 MiB, matching
/// `lzma.compress(..., format=FORMAT_RAW, filters=[{"id": FILTER_LZMA2,
/// "preset": level, "dict_size": 2**20}])` in the reference implementation.
pub struct Lzma2Codec;
impl Lzma2Codec {
    fn filters(level: u32, extreme: bool) -> Result<Filters, CodecError> {
        let preset = if extreme { level | xz2::stream::PRESET_EXTREME } else { level };
        let mut opts = LzmaOptions::new_preset(preset)
            .map_err(|e| CodecError::Io(io::Error::new(io::ErrorKind::Other, e)))?;
        opts.dict_size(LZMA2_DICT_SIZE);
        let mut filters = Filters::new();
        filters.lzma2(&opts);
        Ok(filters)
    }
}
impl Codec for Lzma2Codec {
    fn codec_id(&self) -> CodecId {
        CodecId::Lzma2
    }
    fn compress(&self, data: &[u8], level: u32, extreme: bool) -> Result<Vec<u8>, CodecError> {
        let filters = Self::filters(level, extreme)?;
        let stream = Stream::new_raw_encoder(&filters)
            .map_err(|e| CodecError::Io(io::Error::new(io::ErrorKind::Other, e)))?;
        let mut encoder = xz2::write::XzEncoder::new_stream(Vec::new(), stream);
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut opts = LzmaOptions::new_preset(6)
            .map_err(|e| CodecError::Io(io::Error::new(io::ErrorKind::Other, e)))?;
        opts.dict_size(LZMA2_DICT_SIZE);
        let mut filters = Filters::new();
        filters.lzma2(&opts);
        let stream = Stream::new_raw_decoder(&filters)
            .map_err(|e| CodecError::Io(io::Error::new(io::ErrorKind::Other, e)))?;
        let mut decoder = xz2::read::XzDecoder::new_stream(data, stream);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(out)
    }
}

pub fn get_codec(id: CodecId) -> Box<dyn Codec> {
    match id {
        CodecId::None => Box::new(NoneCodec),
        CodecId::Deflate => Box::new(DeflateCodec),
        CodecId::Bz2 => Box::new(Bz2Codec),
        CodecId::Lzma2 => Box::new(Lzma2Codec),
    }
}

pub fn get_codec_by_name(name: &str) -> Result<Box<dyn Codec>, CodecError> {
    CodecId::from_canonical_name(name)
        .map(get_codec)
        .ok_or_else(|| CodecError::Unknown(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_roundtrip() {
        let c = get_codec(CodecId::None);
        let data = b"hello world";
        assert_eq!(c.decompress(&c.compress(data, 0, false).unwrap()).unwrap(), data);
    }

    #[test]
    fn deflate_roundtrip() {
        let c = get_codec(CodecId::Deflate);
        let data = b"the quick brown fox jumps over the lazy dog".repeat(20);
        let z = c.compress(&data, 6, false).unwrap();
        assert_eq!(c.decompress(&z).unwrap(), data);
    }

    #[test]
    fn bz2_roundtrip() {
        let c = get_codec(CodecId::Bz2);
        let data = b"the quick brown fox jumps over the lazy dog".repeat(20);
        let z = c.compress(&data, 9, false).unwrap();
        assert_eq!(c.decompress(&z).unwrap(), data);
    }

    #[test]
    fn lzma2_roundtrip() {
        let c = get_codec(CodecId::Lzma2);
        let data = b"the quick brown fox jumps over the lazy dog".repeat(20);
        let z = c.compress(&data, 1, false).unwrap();
        assert_eq!(c.decompress(&z).unwrap(), data);
    }

    #[test]
    fn canonical_names_round_trip() {
        for id in [CodecId::None, CodecId::Deflate, CodecId::Bz2, CodecId::Lzma2] {
            assert_eq!(CodecId::from_canonical_name(id.canonical_name()), Some(id));
        }
    }
}
