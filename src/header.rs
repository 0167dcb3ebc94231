//! Header codec (component C5): magic, fixed fields, and a length-prefixed
//! JSON metadata blob.
//!
//! ```text
//! magic                   : 8 bytes
//! header_data_length      : u64 LE
//! header_data             : header_data_length bytes
//!   root_index_offset     : u64 LE
//!   root_index_length     : u64 LE
//!   total_file_length     : u64 LE
//!   data_sha256           : 32 bytes
//!   codec                 : 16 bytes, NUL-padded ASCII
//!   metadata_json_length  : u64 LE
//!   metadata_json         : UTF-8 JSON object
//!   [optional extension bytes: ignored by reader]
//! header_crc64xz          : 8 bytes
//! ```

use crate::checksum::encoded_crc64xz;
use crate::error::HeaderError;
use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use serde_json::Value;
use std::io::{self, Read, Write};

pub const MAGIC: [u8; 8] = *b"\xabZSfiLe\x01";
pub const INCOMPLETE_MAGIC: [u8; 8] = *b"\xabZStoBe\x01";
pub const CODEC_FIELD_LEN: usize = 16;
pub const CRC_LENGTH: usize = 8;

/// Placeholder root offset written before the writer knows the real one.
/// Chosen to be an implausible value so a reader that somehow saw it under
/// the (never-valid) incomplete magic would not mistake it for real data.
pub const PLACEHOLDER_ROOT_OFFSET: u64 = u64::MAX;

#[derive(Debug, Clone)]
pub struct Header {
    pub root_index_offset: u64,
    pub root_index_length: u64,
    pub total_file_length: u64,
    pub data_sha256: [u8; 32],
    pub codec: String,
    pub metadata: Value,
}

impl Header {
    pub fn placeholder(codec: &str, metadata: Value) -> Self {
        Header {
            root_index_offset: PLACEHOLDER_ROOT_OFFSET,
            root_index_length: 0,
            total_file_length: 0,
            data_sha256: [0u8; 32],
            codec: codec.to_string(),
            metadata,
        }
    }

    /// Encodes the fixed fields + codec tag + length-prefixed metadata JSON.
    /// This is `header_data` — everything between `header_data_length` and
    /// `header_crc64xz`.
    pub fn encode(&self) -> Result<Vec<u8>, HeaderError> {
        if !self.metadata.is_object() {
            return Err(HeaderError::MetadataNotObject);
        }
        let mut out = Vec::new();
        out.write_u64::<LE>(self.root_index_offset)?;
        out.write_u64::<LE>(self.root_index_length)?;
        out.write_u64::<LE>(self.total_file_length)?;
        out.write_all(&self.data_sha256)?;

        let mut codec_field = [0u8; CODEC_FIELD_LEN];
        let codec_bytes = self.codec.as_bytes();
        if codec_bytes.len() > CODEC_FIELD_LEN {
            return Err(HeaderError::UnknownCodec(self.codec.clone()));
        }
        codec_field[..codec_bytes.len()].copy_from_slice(codec_bytes);
        out.write_all(&codec_field)?;

        let metadata_json = serde_json::to_vec(&self.metadata)?;
        out.write_u64::<LE>(metadata_json.len() as u64)?;
        out.write_all(&metadata_json)?;
        Ok(out)
    }

    /// Decodes `header_data` (the bytes between the length prefix and the
    /// checksum). Unrecognized trailing bytes after the metadata JSON are
    /// ignored (they are reserved extension space for future fields).
    pub fn decode(data: &[u8]) -> Result<Self, HeaderError> {
        let mut r = io::Cursor::new(data);
        let root_index_offset = r.read_u64::<LE>()?;
        let root_index_length = r.read_u64::<LE>()?;
        let total_file_length = r.read_u64::<LE>()?;
        let mut data_sha256 = [0u8; 32];
        r.read_exact(&mut data_sha256)?;

        let mut codec_field = [0u8; CODEC_FIELD_LEN];
        r.read_exact(&mut codec_field)?;
        let codec_end = codec_field
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(CODEC_FIELD_LEN);
        let codec = std::str::from_utf8(&codec_field[..codec_end])
            .map_err(|_| HeaderError::UnknownCodec(format!("{:?}", &codec_field[..])))?
            .to_string();

        let metadata_len = r.read_u64::<LE>()? as usize;
        let mut metadata_json = vec![0u8; metadata_len];
        r.read_exact(&mut metadata_json)?;
        let metadata: Value = serde_json::from_slice(&metadata_json)?;
        if !metadata.is_object() {
            return Err(HeaderError::MetadataNotObject);
        }

        Ok(Header {
            root_index_offset,
            root_index_length,
            total_file_length,
            data_sha256,
            codec,
            metadata,
        })
    }
}

/// The full framed header: `magic || len(header_data) || header_data ||
/// crc64xz(header_data)`.
pub fn write_header<W: Write>(w: &mut W, header: &Header, complete: bool) -> Result<(), HeaderError> {
    let magic = if complete { MAGIC } else { INCOMPLETE_MAGIC };
    let encoded = header.encode()?;
    let crc = encoded_crc64xz(&encoded);

    w.write_all(&magic)?;
    w.write_u64::<LE>(encoded.len() as u64)?;
    w.write_all(&encoded)?;
    w.write_all(&crc)?;
    Ok(())
}

/// Writes a deliberately-invalid placeholder header: the incomplete magic,
/// the real (fixed-length) encoded header, but an all-zero checksum so that
/// a reader that somehow ignored the incomplete magic would still reject
/// the file on checksum grounds.
pub fn write_placeholder_header<W: Write>(w: &mut W, header: &Header) -> Result<usize, HeaderError> {
    let encoded = header.encode()?;
    w.write_all(&INCOMPLETE_MAGIC)?;
    w.write_u64::<LE>(encoded.len() as u64)?;
    w.write_all(&encoded)?;
    w.write_all(&[0u8; CRC_LENGTH])?;
    Ok(INCOMPLETE_MAGIC.len() + 8 + encoded.len() + CRC_LENGTH)
}

/// Result of parsing the initial header buffer: either the header decoded
/// entirely from the bytes on hand, or the buffer was short and a second
/// read (for `more_needed` additional bytes starting at `resume_at`) is
/// required.
pub enum HeaderParse {
    Complete(Header),
    NeedMore { resume_at: u64, more_needed: u64 },
}

/// Parses as much of the header as `buf` (read starting at file offset 0)
/// allows. `buf` must be at least 16 bytes (magic + length prefix) or this
/// returns an I/O-shaped error, since a file that short cannot be valid
/// regardless of this buffer's actual total length.
pub fn parse_header_prefix(buf: &[u8]) -> Result<HeaderParse, HeaderError> {
    if buf.len() < 16 {
        return Err(HeaderError::BadMagic);
    }
    let magic: [u8; 8] = buf[0..8].try_into().unwrap();
    if magic == INCOMPLETE_MAGIC {
        return Err(HeaderError::IncompleteMagic);
    }
    if magic != MAGIC {
        return Err(HeaderError::BadMagic);
    }
    let header_data_length = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    let needed = header_data_length + CRC_LENGTH as u64;
    let have = buf.len() as u64 - 16;
    if have < needed {
        return Ok(HeaderParse::NeedMore {
            resume_at: 16 + have,
            more_needed: needed - have,
        });
    }
    finish_header_parse(buf, header_data_length)
}

/// Completes parsing once the full header region (`16..16+header_data_length+CRC_LENGTH`)
/// is available in `buf`.
pub fn finish_header_parse(buf: &[u8], header_data_length: u64) -> Result<HeaderParse, HeaderError> {
    let start = 16usize;
    let end = start + header_data_length as usize;
    let encoded = &buf[start..end];
    let mut checksum = [0u8; CRC_LENGTH];
    checksum.copy_from_slice(&buf[end..end + CRC_LENGTH]);
    if encoded_crc64xz(encoded) != checksum {
        return Err(HeaderError::ChecksumMismatch);
    }
    Ok(HeaderParse::Complete(Header::decode(encoded)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_decode_roundtrip() {
        let header = Header {
            root_index_offset: 123,
            root_index_length: 456,
            total_file_length: 789,
            data_sha256: [7u8; 32],
            codec: "bz2".to_string(),
            metadata: json!({"a": 1}),
        };
        let encoded = header.encode().unwrap();
        let decoded = Header::decode(&encoded).unwrap();
        assert_eq!(decoded.root_index_offset, 123);
        assert_eq!(decoded.codec, "bz2");
        assert_eq!(decoded.metadata, json!({"a": 1}));
    }

    #[test]
    fn codec_field_nul_padding() {
        let header = Header::placeholder("none", json!({}));
        let encoded = header.encode().unwrap();
        // root(8) + root_len(8) + total(8) + sha256(32) = 56 bytes before codec field
        let codec_field = &encoded[56..56 + CODEC_FIELD_LEN];
        assert_eq!(&codec_field[..4], b"none");
        assert!(codec_field[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn full_framed_roundtrip() {
        let header = Header {
            root_index_offset: 1,
            root_index_length: 2,
            total_file_length: 3,
            data_sha256: [0u8; 32],
            codec: "none".to_string(),
            metadata: json!({}),
        };
        let mut buf = Vec::new();
        write_header(&mut buf, &header, true).unwrap();
        assert_eq!(&buf[0..8], &MAGIC);
        match parse_header_prefix(&buf).unwrap() {
            HeaderParse::Complete(h) => assert_eq!(h.root_index_offset, 1),
            HeaderParse::NeedMore { .. } => panic!("expected complete parse"),
        }
    }

    #[test]
    fn incomplete_magic_rejected() {
        let header = Header::placeholder("none", json!({}));
        let mut buf = Vec::new();
        write_placeholder_header(&mut buf, &header).unwrap();
        assert!(matches!(
            parse_header_prefix(&buf),
            Err(HeaderError::IncompleteMagic)
        ));
    }
}
