//! Reader core (component C8): header loading, index descent, the
//! parallel block-decompression pipeline, and the public query/validate
//! surface built on top of it.

use crate::block::{
    read_raw_block, unpack_data_records, unpack_index_records, FIRST_EXTENSION_LEVEL,
};
use crate::cache::Lru;
use crate::codec::{get_codec, CodecId};
use crate::concurrency::{resolve_parallelism, Executor, SerialExecutor, ThreadPoolExecutor};
use crate::error::{BlockError, HeaderError, Result, ZsError};
use crate::header::{self, Header};
use crate::transport::{FileTransport, HttpTransport, Transport};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// `None` = "guess" (all available cores). `Some(0)` = serial.
    pub parallelism: Option<usize>,
    pub index_block_cache: usize,
    pub header_size_guess: u64,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        ReaderOptions {
            parallelism: None,
            index_block_cache: 32,
            header_size_guess: 8192,
        }
    }
}

type DecompressResult = Result<Vec<u8>>;

struct IndexBlockData {
    level: u16,
    keys: Vec<Vec<u8>>,
    offsets: Vec<u64>,
    lengths: Vec<u64>,
}

pub struct Reader {
    transport: Arc<dyn Transport>,
    header: Header,
    codec_id: CodecId,
    header_end: u64,
    executor: Arc<dyn Executor<DecompressResult>>,
    parallelism_cap: usize,
    index_cache: Mutex<Lru<(u64, u64), Arc<IndexBlockData>>>,
}

impl Reader {
    pub fn open(path: impl AsRef<Path>, options: ReaderOptions) -> Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(FileTransport::open(path)?);
        Self::from_transport(transport, options)
    }

    pub fn open_url(url: impl Into<String>, options: ReaderOptions) -> Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(url));
        Self::from_transport(transport, options)
    }

    fn from_transport(transport: Arc<dyn Transport>, options: ReaderOptions) -> Result<Self> {
        let (header, header_end) = load_header(transport.as_ref(), options.header_size_guess)?;
        let codec_id = CodecId::from_canonical_name(&header.codec)
            .ok_or_else(|| HeaderError::UnknownCodec(header.codec.clone()))?;

        let actual_length = transport.length()?;
        if actual_length != header.total_file_length {
            return Err(ZsError::from(HeaderError::LengthMismatch {
                header: header.total_file_length,
                actual: actual_length,
            }));
        }

        let parallelism = resolve_parallelism(options.parallelism);
        let executor: Arc<dyn Executor<DecompressResult>> = match parallelism {
            None => Arc::new(SerialExecutor),
            Some(n) => Arc::new(ThreadPoolExecutor::new(n)),
        };

        log::debug!(
            "opened {} ({} bytes), codec={}, parallelism={:?}",
            transport.name(),
            actual_length,
            header.codec,
            parallelism
        );

        Ok(Reader {
            transport,
            header,
            codec_id,
            header_end,
            executor,
            parallelism_cap: parallelism.unwrap_or(1),
            index_cache: Mutex::new(Lru::new(options.index_block_cache)),
        })
    }

    pub fn metadata(&self) -> &Value {
        &self.header.metadata
    }

    pub fn codec(&self) -> CodecId {
        self.codec_id
    }

    pub fn data_sha256(&self) -> [u8; 32] {
        self.header.data_sha256
    }

    pub fn root_index_offset(&self) -> u64 {
        self.header.root_index_offset
    }

    pub fn root_index_length(&self) -> u64 {
        self.header.root_index_length
    }

    pub fn total_file_length(&self) -> u64 {
        self.header.total_file_length
    }

    pub fn root_index_level(&self) -> Result<u16> {
        Ok(self
            .get_index_block(self.header.root_index_offset, self.header.root_index_length)?
            .level)
    }

    // -----------------------------------------------------------------
    // Index descent
    // -----------------------------------------------------------------

    fn get_index_block(&self, offset: u64, length: u64) -> Result<Arc<IndexBlockData>> {
        let key = (offset, length);
        let transport = Arc::clone(&self.transport);
        let codec_id = self.codec_id;
        let mut cache = self.index_cache.lock().unwrap();
        cache.get_or_compute(key, move || -> Result<Arc<IndexBlockData>> {
            let raw = transport.chunk_read(offset, length)?;
            if raw.len() as u64 != length {
                return Err(ZsError::corrupt("unexpected EOF reading index block"));
            }
            let mut cursor = std::io::Cursor::new(raw);
            let raw_block = read_raw_block(&mut cursor)?
                .ok_or_else(|| ZsError::corrupt("unexpected EOF reading index block"))?;
            if raw_block.level == 0 {
                return Err(BlockError::ExpectedIndexBlock.into());
            }
            if raw_block.level >= FIRST_EXTENSION_LEVEL {
                return Err(ZsError::corrupt("index offset points at an extension block"));
            }
            let payload = get_codec(codec_id).decompress(&raw_block.zpayload)?;
            let (keys, offsets, lengths) = unpack_index_records(&payload)?;
            Ok(Arc::new(IndexBlockData {
                level: raw_block.level,
                keys,
                offsets,
                lengths,
            }))
        })
    }

    /// Descends from the root to find the first data block whose contents
    /// might contain `needle`. `round_down`: if the position found within
    /// an index block is not the first entry, step one slot left (records
    /// `>= needle` may live in that earlier sibling too).
    fn find_ge_block(&self, needle: &[u8], round_down: bool) -> Result<Option<(u64, u64)>> {
        let mut offset = self.header.root_index_offset;
        let mut length = self.header.root_index_length;
        loop {
            let block = self.get_index_block(offset, length)?;
            let mut idx = block.keys.partition_point(|k| k.as_slice() < needle);
            if round_down && idx != 0 {
                idx -= 1;
            }
            if idx >= block.offsets.len() {
                return Ok(None);
            }
            if block.level - 1 == 0 {
                return Ok(Some((block.offsets[idx], block.lengths[idx])));
            }
            offset = block.offsets[idx];
            length = block.lengths[idx];
        }
    }

    // -----------------------------------------------------------------
    // Query normalization and streaming span
    // -----------------------------------------------------------------

    fn span_stream(
        &self,
        norm_start: &[u8],
        norm_stop: Option<&[u8]>,
    ) -> Result<(u64, Box<dyn crate::transport::Stream>)> {
        let start_offset = if norm_start.is_empty() {
            self.header_end
        } else {
            match self.find_ge_block(norm_start, true)? {
                Some((off, _)) => off,
                None => self.header.total_file_length,
            }
        };
        let stop_offset = if self.transport.remote() {
            match norm_stop {
                Some(stop) => self.find_ge_block(stop, false)?.map(|(o, _)| o),
                None => None,
            }
        } else {
            None
        };
        let stream = self.transport.stream_read(start_offset, stop_offset)?;
        Ok((start_offset, stream))
    }

    // -----------------------------------------------------------------
    // Parallel pipeline
    // -----------------------------------------------------------------

    fn decoded_blocks(
        &self,
        norm_start: &[u8],
        norm_stop: Option<&[u8]>,
        skip_index: bool,
    ) -> Result<DecodedBlockIter> {
        let (start_offset, stream) = self.span_stream(norm_start, norm_stop)?;

        let (tx, rx) = std::sync::mpsc::channel::<Result<DecodedBlock>>();
        let quit = Arc::new(AtomicBool::new(false));
        let executor = Arc::clone(&self.executor);
        let codec_id = self.codec_id;
        let cap = self.parallelism_cap.max(1);
        let quit_clone = Arc::clone(&quit);

        let handle = thread::spawn(move || {
            readahead_loop(stream, start_offset, skip_index, executor, codec_id, cap, tx, quit_clone);
        });

        Ok(DecodedBlockIter {
            receiver: rx,
            quit,
            handle: Some(handle),
        })
    }

    // -----------------------------------------------------------------
    // Public query API
    // -----------------------------------------------------------------

    pub fn search(
        &self,
        start: Option<&[u8]>,
        stop: Option<&[u8]>,
        prefix: Option<&[u8]>,
    ) -> Result<SearchIter> {
        let (norm_start, norm_stop) = norm_search_args(start, stop, prefix);
        let inner = self.decoded_blocks(&norm_start, norm_stop.as_deref(), true)?;
        Ok(SearchIter {
            inner,
            norm_start,
            norm_stop,
            pending: VecDeque::new(),
            done: false,
        })
    }

    /// Runs `f` against the unpacked records of each data block in the
    /// span, in file order, yielding one output item per block.
    pub fn block_map<T, F>(
        &self,
        start: Option<&[u8]>,
        stop: Option<&[u8]>,
        prefix: Option<&[u8]>,
        f: F,
    ) -> Result<BlockMapIter<T, F>>
    where
        F: FnMut(&[Vec<u8>]) -> T,
    {
        let (norm_start, norm_stop) = norm_search_args(start, stop, prefix);
        let inner = self.decoded_blocks(&norm_start, norm_stop.as_deref(), true)?;
        Ok(BlockMapIter {
            inner,
            norm_stop,
            f,
            done: false,
        })
    }

    pub fn block_exec<F>(
        &self,
        start: Option<&[u8]>,
        stop: Option<&[u8]>,
        prefix: Option<&[u8]>,
        mut f: impl FnMut(&[Vec<u8>]),
    ) -> Result<()> {
        for item in self.block_map(start, stop, prefix, |recs| {
            f(recs);
        })? {
            item?;
        }
        Ok(())
    }

    /// Writes every matching record to `sink`, either terminator-joined or
    /// length-prefixed.
    pub fn dump<W: std::io::Write>(
        &self,
        sink: &mut W,
        start: Option<&[u8]>,
        stop: Option<&[u8]>,
        prefix: Option<&[u8]>,
        terminator: Option<&[u8]>,
        length_prefixed: Option<LengthPrefixMode>,
    ) -> Result<()> {
        let iter = self.search(start, stop, prefix)?;
        for record in iter {
            let record = record?;
            match length_prefixed {
                None => {
                    sink.write_all(&record)?;
                    sink.write_all(terminator.unwrap_or(b"\n"))?;
                }
                Some(LengthPrefixMode::Uleb128) => {
                    crate::varint::write_uleb128(record.len() as u64, sink)?;
                    sink.write_all(&record)?;
                }
                Some(LengthPrefixMode::U64Le) => {
                    use byteorder::{WriteBytesExt, LE};
                    sink.write_u64::<LE>(record.len() as u64)?;
                    sink.write_all(&record)?;
                }
            }
        }
        Ok(())
    }

    /// Full structural and cryptographic integrity check.
    pub fn validate(&self) -> Result<()> {
        let mut failures = Vec::new();
        let mut unref: HashMap<u64, UnrefBlock> = HashMap::new();
        let mut hasher = Sha256::new();

        let iter = self.decoded_blocks(&[], None, false)?;
        for item in iter {
            let decoded = item?;
            if decoded.level == 0 {
                hasher.update(&decoded.payload);
                let records = unpack_data_records(&decoded.payload)?;
                if !is_sorted(&records) {
                    failures.push(format!("unsorted records within block at {}", decoded.offset));
                }
                let first = records.first().cloned().unwrap_or_default();
                let last = records.last().cloned().unwrap_or_default();
                unref.insert(
                    decoded.offset,
                    UnrefBlock {
                        level: 0,
                        first_record: first,
                        last_record: last,
                        block_length: decoded.framed_length,
                    },
                );
            } else {
                let (keys, offsets, lengths) = unpack_index_records(&decoded.payload)?;
                if !is_sorted(&keys) {
                    failures.push(format!("unsorted records within block at {}", decoded.offset));
                }
                if !offsets.windows(2).all(|w| w[0] < w[1]) {
                    failures.push(format!("unsorted offsets in index block at {}", decoded.offset));
                }
                let mut prev_last_record: Option<Vec<u8>> = None;
                for i in 0..offsets.len() {
                    match unref.remove(&offsets[i]) {
                        None => failures.push(format!(
                            "dangling or multiple refs to {}",
                            offsets[i]
                        )),
                        Some(child) => {
                            if child.level != decoded.level - 1 {
                                failures.push(format!(
                                    "bad index ref from level {} to level {}",
                                    decoded.level, child.level
                                ));
                            }
                            if keys[i] > child.first_record {
                                failures.push(format!(
                                    "key {:?} is too large for block at {}",
                                    keys[i], offsets[i]
                                ));
                            }
                            if let Some(prev) = &prev_last_record {
                                if *prev > keys[i] {
                                    failures.push(format!(
                                        "key {:?} is too small for block at {}",
                                        keys[i], offsets[i]
                                    ));
                                }
                            }
                            if lengths[i] != child.block_length {
                                failures.push(format!(
                                    "index length {} != actual length {} for block at {}",
                                    lengths[i], child.block_length, offsets[i]
                                ));
                            }
                            prev_last_record = Some(child.last_record.clone());
                        }
                    }
                }
                let first = keys.first().cloned().unwrap_or_default();
                let last = keys.last().cloned().unwrap_or_default();
                unref.insert(
                    decoded.offset,
                    UnrefBlock {
                        level: decoded.level,
                        first_record: first,
                        last_record: last,
                        block_length: decoded.framed_length,
                    },
                );
            }
        }

        match unref.remove(&self.header.root_index_offset) {
            None => failures.push("root block missing or doubly-referenced".to_string()),
            Some(root) => {
                if !(root.level > 0 && root.level < FIRST_EXTENSION_LEVEL) {
                    failures.push(format!("root index has bad level {}", root.level));
                }
                if root.block_length != self.header.root_index_length {
                    failures.push("wrong root index length in header".to_string());
                }
            }
        }
        for offset in unref.keys() {
            failures.push(format!("unreferenced block at {}", offset));
        }

        let digest: [u8; 32] = hasher.finalize().into();
        if digest != self.header.data_sha256 {
            failures.push(format!(
                "data hash mismatch: header says {}, but I found {}",
                hex::encode(self.header.data_sha256),
                hex::encode(digest)
            ));
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ZsError::corrupt(failures.join("; ")))
        }
    }
}

fn is_sorted(records: &[Vec<u8>]) -> bool {
    records.windows(2).all(|w| w[0] <= w[1])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthPrefixMode {
    Uleb128,
    U64Le,
}

struct UnrefBlock {
    level: u16,
    first_record: Vec<u8>,
    last_record: Vec<u8>,
    block_length: u64,
}

// -----------------------------------------------------------------------
// Header loading
// -----------------------------------------------------------------------

fn load_header(transport: &dyn Transport, header_size_guess: u64) -> Result<(Header, u64)> {
    let initial = transport.chunk_read(0, header_size_guess)?;
    match header::parse_header_prefix(&initial)? {
        header::HeaderParse::Complete(h) => {
            let header_data_length = u64::from_le_bytes(initial[8..16].try_into().unwrap());
            let header_end = 16 + header_data_length + header::CRC_LENGTH as u64;
            Ok((h, header_end))
        }
        header::HeaderParse::NeedMore {
            resume_at,
            more_needed,
        } => {
            let more = transport.chunk_read(resume_at, more_needed)?;
            let mut full = initial;
            full.extend_from_slice(&more);
            let header_data_length = u64::from_le_bytes(full[8..16].try_into().unwrap());
            match header::finish_header_parse(&full, header_data_length)? {
                header::HeaderParse::Complete(h) => {
                    let header_end = 16 + header_data_length + header::CRC_LENGTH as u64;
                    Ok((h, header_end))
                }
                header::HeaderParse::NeedMore { .. } => unreachable!(),
            }
        }
    }
}

// -----------------------------------------------------------------------
// Query normalization
// -----------------------------------------------------------------------

pub fn norm_search_args(
    start: Option<&[u8]>,
    stop: Option<&[u8]>,
    prefix: Option<&[u8]>,
) -> (Vec<u8>, Option<Vec<u8>>) {
    let prefix = prefix.unwrap_or(b"");
    let start = start.unwrap_or(b"");
    let norm_start = std::cmp::max(prefix, start).to_vec();

    let prefix_stop: Option<Vec<u8>> = if prefix.is_empty() {
        None
    } else {
        let last = *prefix.last().unwrap();
        if last == 0xFF {
            None
        } else {
            let mut p = prefix[..prefix.len() - 1].to_vec();
            p.push(last + 1);
            Some(p)
        }
    };

    let norm_stop = match (stop, prefix_stop) {
        (Some(s), Some(ps)) => Some(std::cmp::min(s.to_vec(), ps)),
        (Some(s), None) => Some(s.to_vec()),
        (None, Some(ps)) => Some(ps),
        (None, None) => None,
    };

    (norm_start, norm_stop)
}

fn trim_records(records: Vec<Vec<u8>>, start: &[u8], stop: Option<&[u8]>) -> Vec<Vec<u8>> {
    let lo = records.partition_point(|r| r.as_slice() < start);
    let hi = match stop {
        Some(s) => records.partition_point(|r| r.as_slice() < s),
        None => records.len(),
    };
    records[lo..hi].to_vec()
}

// -----------------------------------------------------------------------
// Pipeline machinery
// -----------------------------------------------------------------------

struct DecodedBlock {
    offset: u64,
    level: u16,
    framed_length: u64,
    payload: Vec<u8>,
}

/// Wraps a `Read` and counts the bytes consumed, so the readahead loop can
/// recover each block's absolute file offset without the transport
/// exposing `tell()`.
struct CountingReader<R> {
    inner: R,
    count: u64,
}
impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

fn readahead_loop(
    stream: Box<dyn crate::transport::Stream>,
    start_offset: u64,
    skip_index: bool,
    executor: Arc<dyn Executor<DecompressResult>>,
    codec_id: CodecId,
    cap: usize,
    tx: std::sync::mpsc::Sender<Result<DecodedBlock>>,
    quit: Arc<AtomicBool>,
) {
    let mut reader = CountingReader { inner: stream, count: 0 };
    let mut in_flight: VecDeque<(u64, u16, u64, Box<dyn crate::concurrency::Future<DecompressResult>>)> =
        VecDeque::new();
    let mut eof = false;

    loop {
        if quit.load(Ordering::SeqCst) {
            return;
        }
        while !eof && in_flight.len() < cap.max(1) {
            let offset_before = start_offset + reader.count;
            match read_raw_block(&mut reader) {
                Ok(None) => {
                    eof = true;
                    break;
                }
                Ok(Some(raw)) => {
                    let framed_len = start_offset + reader.count - offset_before;
                    if raw.level >= FIRST_EXTENSION_LEVEL {
                        continue;
                    }
                    if skip_index && raw.level != 0 {
                        continue;
                    }
                    let codec = get_codec(codec_id);
                    let zpayload = raw.zpayload;
                    let fut = executor.submit(Box::new(move || {
                        codec.decompress(&zpayload).map_err(ZsError::from)
                    }));
                    in_flight.push_back((offset_before, raw.level, framed_len, fut));
                }
                Err(e) => {
                    let _ = tx.send(Err(e.into()));
                    return;
                }
            }
        }
        if let Some((offset, level, framed_length, fut)) = in_flight.pop_front() {
            let result = fut.result().map(|payload| DecodedBlock {
                offset,
                level,
                framed_length,
                payload,
            });
            if tx.send(result).is_err() {
                return;
            }
        } else if eof {
            return;
        }
    }
}

struct DecodedBlockIter {
    receiver: std::sync::mpsc::Receiver<Result<DecodedBlock>>,
    quit: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}
impl Iterator for DecodedBlockIter {
    type Item = Result<DecodedBlock>;
    fn next(&mut self) -> Option<Result<DecodedBlock>> {
        self.receiver.recv().ok()
    }
}
impl Drop for DecodedBlockIter {
    fn drop(&mut self) {
        self.quit.store(true, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

pub struct SearchIter {
    inner: DecodedBlockIter,
    norm_start: Vec<u8>,
    norm_stop: Option<Vec<u8>>,
    pending: VecDeque<Vec<u8>>,
    done: bool,
}
impl Iterator for SearchIter {
    type Item = Result<Vec<u8>>;
    fn next(&mut self) -> Option<Result<Vec<u8>>> {
        loop {
            if let Some(r) = self.pending.pop_front() {
                return Some(Ok(r));
            }
            if self.done {
                return None;
            }
            match self.inner.next() {
                None => {
                    self.done = true;
                    return None;
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                Some(Ok(block)) => {
                    let records = match unpack_data_records(&block.payload) {
                        Ok(r) => r,
                        Err(e) => {
                            self.done = true;
                            return Some(Err(e.into()));
                        }
                    };
                    if let (Some(stop), Some(first)) = (&self.norm_stop, records.first()) {
                        if first >= stop {
                            self.done = true;
                            continue;
                        }
                    }
                    let trimmed = trim_records(records, &self.norm_start, self.norm_stop.as_deref());
                    self.pending.extend(trimmed);
                }
            }
        }
    }
}

pub struct BlockMapIter<T, F: FnMut(&[Vec<u8>]) -> T> {
    inner: DecodedBlockIter,
    norm_stop: Option<Vec<u8>>,
    f: F,
    done: bool,
}
impl<T, F: FnMut(&[Vec<u8>]) -> T> Iterator for BlockMapIter<T, F> {
    type Item = Result<T>;
    fn next(&mut self) -> Option<Result<T>> {
        if self.done {
            return None;
        }
        loop {
            match self.inner.next() {
                None => {
                    self.done = true;
                    return None;
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                Some(Ok(block)) => {
                    let records = match unpack_data_records(&block.payload) {
                        Ok(r) => r,
                        Err(e) => {
                            self.done = true;
                            return Some(Err(e.into()));
                        }
                    };
                    if records.is_empty() {
                        continue;
                    }
                    if let (Some(stop), Some(first)) = (&self.norm_stop, records.first()) {
                        if first >= stop {
                            self.done = true;
                            return None;
                        }
                    }
                    return Some(Ok((self.f)(&records)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn norm_search_args_defaults() {
        let (start, stop) = norm_search_args(None, None, None);
        assert_eq!(start, b"".to_vec());
        assert_eq!(stop, None);
    }

    #[test]
    fn norm_search_args_prefix() {
        let (start, stop) = norm_search_args(None, None, Some(b"n"));
        assert_eq!(start, b"n".to_vec());
        assert_eq!(stop, Some(b"o".to_vec()));
    }

    #[test]
    fn norm_search_args_prefix_0xff_degenerates() {
        let (_, stop) = norm_search_args(None, Some(b"z"), Some(&[0xFF]));
        assert_eq!(stop, Some(b"z".to_vec()));
    }

    #[test]
    fn trim_records_bounds() {
        let records: Vec<Vec<u8>> = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()];
        let trimmed = trim_records(records, b"b", Some(b"d"));
        assert_eq!(trimmed, vec![b"b".to_vec(), b"c".to_vec()]);
    }
}
