//! # zs — a read-optimized, immutable, sorted record container
//!
//! Format guarantees:
//! - All numeric fields are little-endian; never negotiated
//! - Every block is self-describing: a uleb128 length, a level byte, the
//!   (possibly compressed) payload, and a CRC-64/XZ trailer
//! - Blocks form a B+-tree-like index: level 0 holds records, levels above
//!   hold `(key, child_offset, child_length)` entries pointing down
//! - Codec identity is a 16-byte NUL-padded ASCII name in the header; a
//!   reader that does not recognize it fails immediately, no partial decode
//! - The header carries a whole-file SHA-256 over every data block's
//!   decompressed payload, checked by [`reader::Reader::validate`]
//! - A file is only valid once its magic reads as complete; every writer
//!   begins with an incomplete magic and swaps it in last, after the header
//!   has been rewritten with the real root offset and final length

pub mod cache;
pub mod checksum;
pub mod concurrency;
pub mod error;
pub mod header;
pub mod reader;
pub mod transport;
pub mod varint;
pub mod writer;

pub mod block;
pub mod codec;

pub use codec::{get_codec, get_codec_by_name, Codec, CodecId};
pub use error::{BlockError, CodecError, ErrorKind, HeaderError, Result, TransportError, ZsError};
pub use reader::{LengthPrefixMode, Reader, ReaderOptions};
pub use writer::{Writer, WriterOptions};
