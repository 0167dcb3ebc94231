//! Block payload codec and block framing (component C2).
//!
//! A **data block** payload is a concatenation of `(uleb128 len, len bytes)`
//! per record. An **index block** payload is a concatenation of
//! `(uleb128 keylen, key, uleb128 offset, uleb128 length)` triples. Framing
//! wraps a block's (already compressed) payload as
//! `uleb128(1 + len(zpayload)) || level_byte || zpayload || crc64xz`.

use crate::checksum::encoded_crc64xz;
use crate::error::BlockError;
use crate::varint::{decode_uleb128, encode_uleb128, read_uleb128, write_uleb128};
use std::io::{self, Read, Write};

/// Level bytes `>= FIRST_EXTENSION_LEVEL` mark reserved/extension blocks
/// that readers skip.
pub const FIRST_EXTENSION_LEVEL: u16 = 64;

// ---------------------------------------------------------------------
// Data record payload
// ---------------------------------------------------------------------

/// Packs a sorted, non-decreasing list of records into a data-block
/// payload. Fails if the records are not non-decreasing by unsigned-byte
/// order — sort violations are caught at encode time.
pub fn pack_data_records(records: &[Vec<u8>]) -> Result<Vec<u8>, BlockError> {
    pack_data_records_hint(records, 0)
}

pub fn pack_data_records_hint(records: &[Vec<u8>], alloc_hint: usize) -> Result<Vec<u8>, BlockError> {
    for w in records.windows(2) {
        if w[0] > w[1] {
            return Err(BlockError::UnsortedRecords);
        }
    }
    let mut out = Vec::with_capacity(alloc_hint.max(16));
    for r in records {
        write_uleb128(r.len() as u64, &mut out).expect("writing to Vec cannot fail");
        out.extend_from_slice(r);
    }
    Ok(out)
}

/// Unpacks a data-block payload into its constituent records.
pub fn unpack_data_records(payload: &[u8]) -> Result<Vec<Vec<u8>>, BlockError> {
    let mut records = Vec::new();
    let mut pos = 0usize;
    while pos < payload.len() {
        let (len, consumed) = decode_uleb128(&payload[pos..])?;
        pos += consumed;
        let len = len as usize;
        if pos + len > payload.len() {
            return Err(BlockError::RecordTruncated);
        }
        records.push(payload[pos..pos + len].to_vec());
        pos += len;
    }
    Ok(records)
}

// ---------------------------------------------------------------------
// Index record payload
// ---------------------------------------------------------------------

/// Packs index entries `(key, child_offset, child_length)`. Keys must be
/// non-decreasing and offsets must strictly increase; both are checked at
/// encode time.
pub fn pack_index_records(
    keys: &[Vec<u8>],
    offsets: &[u64],
    lengths: &[u64],
) -> Result<Vec<u8>, BlockError> {
    pack_index_records_hint(keys, offsets, lengths, 0)
}

pub fn pack_index_records_hint(
    keys: &[Vec<u8>],
    offsets: &[u64],
    lengths: &[u64],
    alloc_hint: usize,
) -> Result<Vec<u8>, BlockError> {
    assert_eq!(keys.len(), offsets.len());
    assert_eq!(keys.len(), lengths.len());
    for w in keys.windows(2) {
        if w[0] > w[1] {
            return Err(BlockError::UnsortedRecords);
        }
    }
    for w in offsets.windows(2) {
        if w[0] >= w[1] {
            return Err(BlockError::UnsortedOffsets);
        }
    }
    let mut out = Vec::with_capacity(alloc_hint.max(16));
    for i in 0..keys.len() {
        write_uleb128(keys[i].len() as u64, &mut out).expect("Vec write cannot fail");
        out.extend_from_slice(&keys[i]);
        write_uleb128(offsets[i], &mut out).expect("Vec write cannot fail");
        write_uleb128(lengths[i], &mut out).expect("Vec write cannot fail");
    }
    Ok(out)
}

/// Unpacks an index-block payload into parallel `(keys, offsets, lengths)`
/// vectors.
pub fn unpack_index_records(
    payload: &[u8],
) -> Result<(Vec<Vec<u8>>, Vec<u64>, Vec<u64>), BlockError> {
    let mut keys = Vec::new();
    let mut offsets = Vec::new();
    let mut lengths = Vec::new();
    let mut pos = 0usize;
    while pos < payload.len() {
        let (keylen, consumed) = decode_uleb128(&payload[pos..])?;
        pos += consumed;
        let keylen = keylen as usize;
        if pos + keylen > payload.len() {
            return Err(BlockError::RecordTruncated);
        }
        let key = payload[pos..pos + keylen].to_vec();
        pos += keylen;

        let (offset, consumed) = decode_uleb128(&payload[pos..])?;
        pos += consumed;

        let (length, consumed) = decode_uleb128(&payload[pos..])?;
        pos += consumed;

        keys.push(key);
        offsets.push(offset);
        lengths.push(length);
    }
    Ok((keys, offsets, lengths))
}

// ---------------------------------------------------------------------
// Block framing
// ---------------------------------------------------------------------

/// A raw (still-compressed) block as read off the wire, with the level
/// byte already stripped off and the checksum already verified.
pub struct RawBlock {
    pub level: u16,
    pub zpayload: Vec<u8>,
}

/// Writes one framed block: `uleb128(1+len) || level_byte || zpayload ||
/// crc64xz(level_byte || zpayload)`. `level` must fit in one byte (`< 256`);
/// levels are never that large in practice (the format only defines
/// meaning up to `FIRST_EXTENSION_LEVEL`), so this function panics rather
/// than erroring on an out-of-range level.
pub fn write_framed_block<W: Write>(w: &mut W, level: u16, zpayload: &[u8]) -> io::Result<u64> {
    assert!(level < 256, "block level does not fit in one byte");
    let mut contents = Vec::with_capacity(1 + zpayload.len());
    contents.push(level as u8);
    contents.extend_from_slice(zpayload);
    let crc = encoded_crc64xz(&contents);

    let len_prefix = encode_uleb128(1 + contents.len() as u64);
    w.write_all(&len_prefix)?;
    w.write_all(&contents)?;
    w.write_all(&crc)?;
    Ok((len_prefix.len() + contents.len() + crc.len()) as u64)
}

/// Reads one raw framed block from a stream positioned at its start.
/// Returns `Ok(None)` at a clean end-of-stream (no bytes at all consumed
/// before the length prefix). Any EOF after that point is a corruption
/// error.
pub fn read_raw_block<R: Read>(r: &mut R) -> Result<Option<RawBlock>, BlockError> {
    let framed_len = match read_uleb128(r).map_err(|_| BlockError::UnexpectedEof)? {
        None => return Ok(None),
        Some(0) => return Err(BlockError::UnexpectedEof),
        Some(n) => n,
    };
    let mut contents = vec![0u8; framed_len as usize];
    r.read_exact(&mut contents)
        .map_err(|_| BlockError::UnexpectedEof)?;
    let mut checksum = [0u8; 8];
    r.read_exact(&mut checksum)
        .map_err(|_| BlockError::UnexpectedEof)?;

    let expected = encoded_crc64xz(&contents);
    if expected != checksum {
        return Err(BlockError::ChecksumMismatch(0));
    }

    let level = contents[0] as u16;
    let zpayload = contents[1..].to_vec();
    Ok(Some(RawBlock { level, zpayload }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_record_vectors() {
        let records: Vec<Vec<u8>> = vec![vec![], vec![0u8; 16], b"a".to_vec(), b"b".to_vec()];
        let mut expected = vec![0x00u8, 0x10];
        expected.extend(std::iter::repeat(0u8).take(16));
        expected.extend_from_slice(&[0x01, b'a', 0x01, b'b']);

        for hint in [0, 1, 5, 100] {
            assert_eq!(pack_data_records_hint(&records, hint).unwrap(), expected);
        }
        assert_eq!(unpack_data_records(&expected).unwrap(), records);
    }

    #[test]
    fn data_record_truncation() {
        assert!(unpack_data_records(b"\x03aaa\x04aaa").is_err());
        assert!(unpack_data_records(b"\x03aaa\x80").is_err());
    }

    #[test]
    fn data_record_sort_violation() {
        assert!(pack_data_records(&[b"z".to_vec(), b"a".to_vec()]).is_err());
        assert!(pack_data_records(&[b"a\x00".to_vec(), b"a".to_vec()]).is_err());
    }

    #[test]
    fn index_record_vectors() {
        let keys: Vec<Vec<u8>> = vec![vec![], vec![0u8; 16], b"a".to_vec(), b"b".to_vec()];
        let offsets = vec![0u64, 10, 12345, 10u64.pow(12)];
        let lengths = vec![2u64, 3, 4, 2u64.pow(13)];
        let expected: Vec<u8> = {
            let mut v = vec![0x00u8, 0x00, 0x02];
            v.push(0x10);
            v.extend(std::iter::repeat(0u8).take(16));
            v.push(0x0a);
            v.push(0x03);
            v.extend_from_slice(&[0x01, b'a', 0xb9, 0x60, 0x04]);
            v.extend_from_slice(&[0x01, b'b', 0x80, 0xa0, 0x94, 0xa5, 0x8d, 0x1d, 0x80, 0x40]);
            v
        };
        for hint in [0, 1, 5, 100] {
            assert_eq!(
                pack_index_records_hint(&keys, &offsets, &lengths, hint).unwrap(),
                expected
            );
        }
        assert_eq!(unpack_index_records(&expected).unwrap(), (keys, offsets, lengths));
    }

    #[test]
    fn index_record_sort_violations() {
        assert!(pack_index_records(
            &[b"z".to_vec(), b"a".to_vec()],
            &[1, 2],
            &[10, 10]
        )
        .is_err());
        assert!(pack_index_records(
            &[b"a".to_vec(), b"z".to_vec()],
            &[2, 1],
            &[10, 10]
        )
        .is_err());
    }

    #[test]
    fn framed_roundtrip() {
        let mut buf = Vec::new();
        write_framed_block(&mut buf, 0, b"hello").unwrap();
        let mut cursor = io::Cursor::new(buf);
        let block = read_raw_block(&mut cursor).unwrap().unwrap();
        assert_eq!(block.level, 0);
        assert_eq!(block.zpayload, b"hello");
        assert!(read_raw_block(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn framed_checksum_mismatch() {
        let mut buf = Vec::new();
        write_framed_block(&mut buf, 0, b"hello").unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        let mut cursor = io::Cursor::new(buf);
        assert!(matches!(
            read_raw_block(&mut cursor),
            Err(BlockError::ChecksumMismatch(_))
        ));
    }
}
