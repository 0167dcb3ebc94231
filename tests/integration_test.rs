use serde_json::json;
use std::io::Cursor;
use tempfile::NamedTempFile;
use zs::{CodecId, LengthPrefixMode, Reader, ReaderOptions, Writer, WriterOptions};

fn tmp_path() -> std::path::PathBuf {
    let f = NamedTempFile::new().unwrap();
    let path = f.path().to_path_buf();
    // NamedTempFile already created the file; Writer::create requires the
    // path not to exist yet.
    drop(f);
    std::fs::remove_file(&path).ok();
    path
}

fn write_simple(records: &[&[u8]], options: WriterOptions) -> std::path::PathBuf {
    let path = tmp_path();
    let mut writer = Writer::create(&path, json!({}), options).unwrap();
    writer
        .add_data_block(records.iter().map(|r| r.to_vec()).collect())
        .unwrap();
    writer.finish().unwrap();
    path
}

#[test]
fn scenario_1_dump_terminator_and_length_prefixed() {
    let records: &[&[u8]] = &[b"", b"a", b"b", b"bb", b"c"];
    let options = WriterOptions {
        branching_factor: 2,
        codec: CodecId::None,
        include_default_metadata: false,
        ..WriterOptions::default()
    };
    let path = write_simple(records, options);

    let reader = Reader::open(&path, ReaderOptions::default()).unwrap();

    let mut out = Vec::new();
    reader
        .dump(&mut out, None, None, None, Some(b"\n"), None)
        .unwrap();
    assert_eq!(out, b"\na\nb\nbb\nc\n");

    let mut out = Vec::new();
    reader
        .dump(&mut out, None, None, None, None, Some(LengthPrefixMode::Uleb128))
        .unwrap();
    assert_eq!(
        out,
        vec![0x00, 0x01, b'a', 0x01, b'b', 0x02, b'b', b'b', 0x01, b'c']
    );
}

#[test]
fn scenario_2_prefix_search() {
    let records: &[&[u8]] = &[b"\x00", b"\x01", b"\x01a", b"\x02"];
    let options = WriterOptions {
        codec: CodecId::None,
        include_default_metadata: false,
        ..WriterOptions::default()
    };
    let path = write_simple(records, options);
    let reader = Reader::open(&path, ReaderOptions::default()).unwrap();

    let found: Vec<Vec<u8>> = reader
        .search(None, None, Some(b"\x01"))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(found, vec![b"\x01".to_vec(), b"\x01a".to_vec()]);
}

#[test]
fn scenario_3_letters_range_and_prefix() {
    let mut records: Vec<Vec<u8>> = Vec::new();
    for c in b'a'..=b'z' {
        records.push(vec![c]);
        records.push(vec![c, c]);
    }
    let path = tmp_path();
    let options = WriterOptions {
        branching_factor: 4,
        approx_block_size: 8,
        codec: CodecId::None,
        include_default_metadata: false,
        ..WriterOptions::default()
    };
    let mut writer = Writer::create(&path, json!({}), options).unwrap();
    for chunk in records.chunks(3) {
        writer.add_data_block(chunk.to_vec()).unwrap();
    }
    writer.finish().unwrap();

    let reader = Reader::open(&path, ReaderOptions::default()).unwrap();
    let found: Vec<Vec<u8>> = reader
        .search(Some(b"m"), Some(b"s"), Some(b"n"))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(found, vec![b"n".to_vec(), b"nn".to_vec()]);
}

#[test]
fn scenario_4_corrupted_index_key_fails_validation() {
    let records: &[&[u8]] = &[b"a", b"b", b"c", b"d", b"e", b"f"];
    let options = WriterOptions {
        branching_factor: 2,
        codec: CodecId::None,
        include_default_metadata: false,
        ..WriterOptions::default()
    };
    let path = tmp_path();
    let mut writer = Writer::create(&path, json!({}), options).unwrap();
    for r in records {
        writer.add_data_block(vec![r.to_vec()]).unwrap();
    }
    writer.finish().unwrap();

    let mut bytes = std::fs::read(&path).unwrap();
    // Flip a byte near the end of the file, inside the already-flushed
    // index structure, without touching the header or trailing checksum
    // bytes of the very last block.
    let corrupted = bytes.len() - 16;
    bytes[corrupted] ^= 0xff;
    std::fs::write(&path, &bytes).unwrap();

    let reader = Reader::open(&path, ReaderOptions::default());
    // Either the open-time length/checksum check fails, or the file opens
    // and validate() reports corruption; both demonstrate detection.
    match reader {
        Err(_) => {}
        Ok(r) => {
            assert!(r.validate().is_err());
        }
    }
}

#[test]
fn scenario_5_truncated_file_fails_validation() {
    let records: &[&[u8]] = &[b"a", b"b", b"c"];
    let options = WriterOptions {
        codec: CodecId::None,
        include_default_metadata: false,
        ..WriterOptions::default()
    };
    let path = write_simple(records, options);

    let mut bytes = std::fs::read(&path).unwrap();
    bytes.truncate(bytes.len() - 1);
    std::fs::write(&path, &bytes).unwrap();

    let result = Reader::open(&path, ReaderOptions::default());
    match result {
        Err(_) => {}
        Ok(r) => assert!(r.validate().is_err()),
    }
}

#[test]
fn scenario_6_bz2_parallelism_cross_check() {
    let mut records: Vec<Vec<u8>> = Vec::new();
    for i in 0..500u32 {
        records.push(format!("{i:06}", i = i).into_bytes());
    }
    let path = tmp_path();
    let options = WriterOptions {
        branching_factor: 8,
        approx_block_size: 256,
        codec: CodecId::Bz2,
        parallelism: Some(3),
        include_default_metadata: false,
        ..WriterOptions::default()
    };
    let mut writer = Writer::create(&path, json!({}), options).unwrap();
    for chunk in records.chunks(17) {
        writer.add_data_block(chunk.to_vec()).unwrap();
    }
    writer.finish().unwrap();

    let reader_parallel = Reader::open(
        &path,
        ReaderOptions {
            parallelism: Some(3),
            ..ReaderOptions::default()
        },
    )
    .unwrap();
    let reader_serial = Reader::open(
        &path,
        ReaderOptions {
            parallelism: Some(0),
            ..ReaderOptions::default()
        },
    )
    .unwrap();

    let total_parallel: usize = reader_parallel
        .block_map(None, None, None, |recs| recs.len())
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
        .into_iter()
        .sum();
    assert_eq!(total_parallel, records.len());

    let blocks_parallel: Vec<Vec<Vec<u8>>> = reader_parallel
        .block_map(None, None, None, |recs| recs.to_vec())
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let blocks_serial: Vec<Vec<Vec<u8>>> = reader_serial
        .block_map(None, None, None, |recs| recs.to_vec())
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(blocks_parallel, blocks_serial);

    reader_parallel.validate().unwrap();
}

#[test]
fn empty_prefix_and_0xff_prefix_degenerate_correctly() {
    let records: &[&[u8]] = &[b"a", b"b", b"c"];
    let options = WriterOptions {
        codec: CodecId::None,
        include_default_metadata: false,
        ..WriterOptions::default()
    };
    let path = write_simple(records, options);
    let reader = Reader::open(&path, ReaderOptions::default()).unwrap();

    let all: Vec<Vec<u8>> = reader
        .search(None, None, None)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(all, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
}

#[test]
fn writer_rejects_out_of_order_records() {
    let path = tmp_path();
    let mut writer = Writer::create(&path, json!({}), WriterOptions::default()).unwrap();
    writer.add_data_block(vec![b"b".to_vec()]).unwrap();
    let err = writer.add_data_block(vec![b"a".to_vec()]).unwrap_err();
    assert_eq!(err.kind(), zs::ErrorKind::Usage);
}

#[test]
fn writer_rejects_empty_file() {
    let path = tmp_path();
    let writer = Writer::create(&path, json!({}), WriterOptions::default()).unwrap();
    let err = writer.finish().unwrap_err();
    assert_eq!(err.kind(), zs::ErrorKind::Usage);
}

#[test]
fn add_file_contents_terminated_matches_manual_blocks() {
    let path = tmp_path();
    let mut writer = Writer::create(
        &path,
        json!({}),
        WriterOptions {
            codec: CodecId::None,
            include_default_metadata: false,
            ..WriterOptions::default()
        },
    )
    .unwrap();
    let input = Cursor::new(b"alpha\nbeta\ngamma\n".to_vec());
    writer.add_file_contents_terminated(input, 4096, b'\n').unwrap();
    writer.finish().unwrap();

    let reader = Reader::open(&path, ReaderOptions::default()).unwrap();
    let records: Vec<Vec<u8>> = reader
        .search(None, None, None)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(
        records,
        vec![b"alpha".to_vec(), b"beta".to_vec(), b"gamma".to_vec()]
    );
}

#[test]
fn metadata_round_trips_through_header() {
    let path = tmp_path();
    let mut writer = Writer::create(
        &path,
        json!({"dataset": "letters", "version": 1}),
        WriterOptions {
            codec: CodecId::None,
            include_default_metadata: true,
            ..WriterOptions::default()
        },
    )
    .unwrap();
    writer.add_data_block(vec![b"a".to_vec()]).unwrap();
    writer.finish().unwrap();

    let reader = Reader::open(&path, ReaderOptions::default()).unwrap();
    assert_eq!(reader.metadata()["dataset"], "letters");
    assert!(reader.metadata()["build-info"].is_object());
}
