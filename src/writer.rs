//! Writer core (component C9): sorted-record ingest, a bounded window of
//! parallel compression jobs drained in submission order, bottom-up index
//! construction, and atomic finalization via a magic swap.

use crate::block::{pack_data_records, pack_index_records, write_framed_block};
use crate::checksum::encoded_crc64xz;
use crate::codec::{get_codec, CodecId};
use crate::concurrency::{resolve_parallelism, Executor, Future, SerialExecutor, ThreadPoolExecutor};
use crate::error::{HeaderError, Result, ZsError};
use crate::header::{self, Header};
use crate::reader::LengthPrefixMode;
use byteorder::{ReadBytesExt, LE};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct WriterOptions {
    pub branching_factor: usize,
    /// `None` = "guess" (all available cores), `Some(0)` = serial.
    pub parallelism: Option<usize>,
    pub codec: CodecId,
    pub codec_level: u32,
    pub codec_extreme: bool,
    pub approx_block_size: usize,
    pub include_default_metadata: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        WriterOptions {
            branching_factor: 1024,
            parallelism: None,
            codec: CodecId::Bz2,
            codec_level: 9,
            codec_extreme: false,
            approx_block_size: 128 * 1024,
            include_default_metadata: true,
        }
    }
}

/// One compressed block still waiting to be written out, in submission
/// order. `first_record`/`last_record` are known synchronously at
/// submission time, so only the `(payload, zpayload)` pair needs to cross
/// the worker boundary.
struct PendingBlock {
    first_record: Vec<u8>,
    last_record: Vec<u8>,
    future: Box<dyn Future<Result<(Vec<u8>, Vec<u8>)>>>,
}

struct LevelEntry {
    first_record: Vec<u8>,
    last_record: Vec<u8>,
    offset: u64,
    length: u64,
}

pub struct Writer {
    path: PathBuf,
    metadata: Value,
    options: WriterOptions,

    executor: Arc<dyn Executor<Result<(Vec<u8>, Vec<u8>)>>>,
    cap: usize,
    in_flight: VecDeque<PendingBlock>,

    file: BufWriter<File>,
    offset: u64,
    levels: Vec<Vec<LevelEntry>>,
    hasher: Sha256,
    any_blocks: bool,
    last_record_overall: Option<Vec<u8>>,

    finished: bool,
}

impl Writer {
    /// Creates a brand-new ZS file at `path`. Refuses to overwrite an
    /// existing file, matching the reference writer's exclusive-create
    /// open.
    pub fn create(path: impl AsRef<Path>, metadata: Value, options: WriterOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut metadata = if metadata.is_object() {
            metadata
        } else {
            return Err(ZsError::usage("metadata must be a JSON object"));
        };
        if options.include_default_metadata {
            if let Value::Object(ref mut map) = metadata {
                map.entry("build-info").or_insert_with(default_build_info);
            }
        }

        let placeholder = Header::placeholder(options.codec.canonical_name(), metadata.clone());
        let mut raw = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        let written = header::write_placeholder_header(&mut raw, &placeholder)?;
        raw.flush()?;
        raw.sync_all()?;

        let parallelism = resolve_parallelism(options.parallelism);
        let executor: Arc<dyn Executor<Result<(Vec<u8>, Vec<u8>)>>> = match parallelism {
            None => Arc::new(SerialExecutor),
            Some(n) => Arc::new(ThreadPoolExecutor::new(n)),
        };
        let cap = match parallelism {
            None => 1,
            Some(n) => (n * 2).max(2),
        };

        log::debug!(
            "creating ZS file {} with codec {}",
            path.display(),
            options.codec.canonical_name()
        );

        Ok(Writer {
            path,
            metadata,
            options,
            executor,
            cap,
            in_flight: VecDeque::new(),
            file: BufWriter::new(raw),
            offset: written as u64,
            levels: vec![Vec::new()],
            hasher: Sha256::new(),
            any_blocks: false,
            last_record_overall: None,
            finished: false,
        })
    }

    /// Submits one pre-formed, already-sorted data block. Empty blocks are
    /// silently dropped. Records must be non-decreasing both within the
    /// block and relative to every previously added block.
    pub fn add_data_block(&mut self, records: Vec<Vec<u8>>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        for w in records.windows(2) {
            if w[0] > w[1] {
                return Err(ZsError::usage("records within a block must be non-decreasing"));
            }
        }
        if let Some(last) = &self.last_record_overall {
            if &records[0] < last {
                return Err(ZsError::usage("records are not sorted across blocks"));
            }
        }
        self.last_record_overall = Some(records.last().unwrap().clone());

        let first_record = records[0].clone();
        let last_record = records.last().unwrap().clone();
        let codec_id = self.options.codec;
        let level = self.options.codec_level;
        let extreme = self.options.codec_extreme;
        let future = self.executor.submit(Box::new(move || {
            let payload = pack_data_records(&records)?;
            let zpayload = get_codec(codec_id).compress(&payload, level, extreme)?;
            Ok((payload, zpayload))
        }));
        self.in_flight.push_back(PendingBlock {
            first_record,
            last_record,
            future,
        });
        if self.in_flight.len() > self.cap {
            self.drain_one()?;
        }
        Ok(())
    }

    /// Reads records separated by `terminator` from `handle`, chunking
    /// them into blocks of approximately `approx_block_size` bytes. The
    /// stream must end with a trailing terminator.
    pub fn add_file_contents_terminated(
        &mut self,
        mut handle: impl Read,
        approx_block_size: usize,
        terminator: u8,
    ) -> Result<()> {
        let mut partial: Vec<u8> = Vec::new();
        let mut buf = vec![0u8; approx_block_size.max(4096)];
        loop {
            let n = handle.read(&mut buf)?;
            if n == 0 {
                if !partial.is_empty() {
                    return Err(ZsError::usage("input did not end with terminator"));
                }
                return Ok(());
            }
            let mut chunk = std::mem::take(&mut partial);
            chunk.extend_from_slice(&buf[..n]);
            match chunk.iter().rposition(|&b| b == terminator) {
                Some(pos) => {
                    let (whole, rest) = chunk.split_at(pos + 1);
                    partial = rest.to_vec();
                    let mut records: Vec<Vec<u8>> =
                        whole.split(|&b| b == terminator).map(|s| s.to_vec()).collect();
                    // splitting a terminator-ending slice leaves one
                    // trailing empty element
                    records.pop();
                    self.add_data_block(records)?;
                }
                None => partial = chunk,
            }
        }
    }

    /// Reads length-prefixed records from `handle`, accumulating into
    /// blocks of at least `approx_block_size` bytes.
    pub fn add_file_contents_length_prefixed(
        &mut self,
        mut handle: impl Read,
        approx_block_size: usize,
        mode: LengthPrefixMode,
    ) -> Result<()> {
        let mut accumulated: Vec<Vec<u8>> = Vec::new();
        let mut accumulated_size = 0usize;
        loop {
            let record = match mode {
                LengthPrefixMode::Uleb128 => match crate::varint::read_uleb128(&mut handle)? {
                    None => None,
                    Some(len) => {
                        let mut buf = vec![0u8; len as usize];
                        handle.read_exact(&mut buf)?;
                        Some(buf)
                    }
                },
                LengthPrefixMode::U64Le => match handle.read_u64::<LE>() {
                    Ok(len) => {
                        let mut buf = vec![0u8; len as usize];
                        handle.read_exact(&mut buf)?;
                        Some(buf)
                    }
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => None,
                    Err(e) => return Err(e.into()),
                },
            };
            match record {
                None => {
                    if !accumulated.is_empty() {
                        self.add_data_block(std::mem::take(&mut accumulated))?;
                    }
                    return Ok(());
                }
                Some(r) => {
                    accumulated_size += r.len();
                    accumulated.push(r);
                    if accumulated_size >= approx_block_size {
                        self.add_data_block(std::mem::take(&mut accumulated))?;
                        accumulated_size = 0;
                    }
                }
            }
        }
    }

    fn drain_one(&mut self) -> Result<()> {
        let pending = self.in_flight.pop_front().expect("drain_one called on empty queue");
        let (payload, zpayload) = pending.future.result()?;
        self.hasher.update(&payload);
        let block_offset = self.offset;
        let written = write_framed_block(&mut self.file, 0, &zpayload)?;
        self.offset += written;
        self.any_blocks = true;
        push_level_entry(
            &mut self.file,
            &mut self.levels,
            0,
            LevelEntry {
                first_record: pending.first_record,
                last_record: pending.last_record,
                offset: block_offset,
                length: written,
            },
            self.options.branching_factor,
            self.options.codec,
            self.options.codec_level,
            self.options.codec_extreme,
            &mut self.offset,
        )
    }

    fn drain_all(&mut self) -> Result<()> {
        while !self.in_flight.is_empty() {
            self.drain_one()?;
        }
        Ok(())
    }

    /// Flushes all pending blocks, builds the index bottom-up until a
    /// single root remains, rewrites the header in place, and swaps in the
    /// complete magic. Consumes `self`; on any error the file is left with
    /// its incomplete magic.
    pub fn finish(mut self) -> Result<()> {
        self.drain_all()?;
        if !self.any_blocks {
            self.finished = true;
            return Err(ZsError::usage("cannot create an empty ZS file"));
        }

        while !have_root(&self.levels) {
            let level_to_flush = self
                .levels
                .iter()
                .position(|entries| !entries.is_empty())
                .expect("at least one level is non-empty while !have_root");
            flush_index_level(
                &mut self.file,
                &mut self.levels,
                level_to_flush,
                self.options.branching_factor,
                self.options.codec,
                self.options.codec_level,
                self.options.codec_extreme,
                &mut self.offset,
            )?;
        }
        self.file.flush()?;
        self.file.get_ref().sync_all()?;

        let root = self.levels.last().unwrap().first().unwrap();
        let root_offset = root.offset;
        let root_length = root.length;
        let sha256: [u8; 32] = self.hasher.clone().finalize().into();

        self.finished = true;
        let path = self.path.clone();
        let codec = self.options.codec;
        let metadata = self.metadata.clone();
        drop(self);

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let total_file_length = file.seek(SeekFrom::End(0))?;

        let final_header = Header {
            root_index_offset: root_offset,
            root_index_length: root_length,
            total_file_length,
            data_sha256: sha256,
            codec: codec.canonical_name().to_string(),
            metadata,
        };
        let new_encoded = final_header.encode()?;

        file.seek(SeekFrom::Start(8))?;
        let old_length = file.read_u64::<LE>()?;
        if old_length != new_encoded.len() as u64 {
            return Err(ZsError::from(HeaderError::LengthChanged));
        }

        file.seek(SeekFrom::Start(16))?;
        file.write_all(&new_encoded)?;
        file.write_all(&encoded_crc64xz(&new_encoded))?;
        file.flush()?;
        file.sync_all()?;

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header::MAGIC)?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }
}

impl Drop for Writer {
    /// Aborting a writer without calling `finish()` leaves the incomplete
    /// magic in place; there is nothing to roll back, since only a
    /// successful `finish()` ever rewrites the header.
    fn drop(&mut self) {
        if !self.finished {
            log::warn!(
                "ZS writer for {} dropped without finish(): file left incomplete",
                self.path.display()
            );
        }
    }
}

fn default_build_info() -> Value {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let time = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string();
    json!({
        "user": user,
        "host": host,
        "time": time,
        "version": env!("CARGO_PKG_VERSION"),
    })
}

fn have_root(levels: &[Vec<LevelEntry>]) -> bool {
    if levels.len() < 2 {
        return false;
    }
    let top = levels.len() - 1;
    if levels[top].len() != 1 {
        return false;
    }
    levels[..top].iter().all(|entries| entries.is_empty())
}

#[allow(clippy::too_many_arguments)]
fn push_level_entry<W: Write>(
    file: &mut W,
    levels: &mut Vec<Vec<LevelEntry>>,
    level: usize,
    entry: LevelEntry,
    branching_factor: usize,
    codec_id: CodecId,
    codec_level: u32,
    codec_extreme: bool,
    offset: &mut u64,
) -> Result<()> {
    levels[level].push(entry);
    if levels[level].len() >= branching_factor {
        flush_index_level(file, levels, level, branching_factor, codec_id, codec_level, codec_extreme, offset)?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn flush_index_level<W: Write>(
    file: &mut W,
    levels: &mut Vec<Vec<LevelEntry>>,
    level: usize,
    branching_factor: usize,
    codec_id: CodecId,
    codec_level: u32,
    codec_extreme: bool,
    offset: &mut u64,
) -> Result<()> {
    let entries = std::mem::take(&mut levels[level]);
    if entries.is_empty() {
        return Ok(());
    }
    let keys: Vec<Vec<u8>> = entries.iter().map(|e| e.first_record.clone()).collect();
    let offsets: Vec<u64> = entries.iter().map(|e| e.offset).collect();
    let lengths: Vec<u64> = entries.iter().map(|e| e.length).collect();
    let first_record = entries.first().unwrap().first_record.clone();
    let last_record = entries.last().unwrap().last_record.clone();

    let payload = pack_index_records(&keys, &offsets, &lengths)?;
    let zpayload = get_codec(codec_id).compress(&payload, codec_level, codec_extreme)?;
    let block_offset = *offset;
    let written = write_framed_block(file, (level + 1) as u16, &zpayload)?;
    *offset += written;

    if levels.len() == level + 1 {
        levels.push(Vec::new());
    }
    push_level_entry(
        file,
        levels,
        level + 1,
        LevelEntry {
            first_record,
            last_record,
            offset: block_offset,
            length: written,
        },
        branching_factor,
        codec_id,
        codec_level,
        codec_extreme,
        offset,
    )
}
