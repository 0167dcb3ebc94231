//! CRC-64/XZ checksum (component C3).
//!
//! Polynomial 0x42F0E1EBA9EA3693, reflected, init/xorout all-ones — the same
//! parameters libarchive and liblzma call "CRC-64/XZ". Used to checksum both
//! block framing (`level_byte || compressed_payload`) and the raw header
//! payload.

use crc::{Crc, CRC_64_XZ};

const CRC64_XZ: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

pub fn crc64xz(data: &[u8]) -> u64 {
    CRC64_XZ.checksum(data)
}

/// CRC-64/XZ of `data`, little-endian encoded — the on-disk representation
/// used for both block trailers and the header checksum.
pub fn encoded_crc64xz(data: &[u8]) -> [u8; 8] {
    crc64xz(data).to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_check_value() {
        assert_eq!(crc64xz(b"123456789"), 0x995dc9bbdf1939fa);
    }
}
