use criterion::{black_box, criterion_group, criterion_main, Criterion};
use zs::{get_codec, CodecId};

fn bench_compression(c: &mut Criterion) {
    let data = b"the quick brown fox jumps over the lazy dog ".repeat(1024 * 24);

    let none = get_codec(CodecId::None);
    c.bench_function("none_compress_1mb", |b| b.iter(|| none.compress(black_box(&data), 0, false)));

    let deflate = get_codec(CodecId::Deflate);
    c.bench_function("deflate_compress_1mb", |b| b.iter(|| deflate.compress(black_box(&data), 6, false)));

    let bz2 = get_codec(CodecId::Bz2);
    c.bench_function("bz2_compress_1mb", |b| b.iter(|| bz2.compress(black_box(&data), 9, false)));

    let lzma2 = get_codec(CodecId::Lzma2);
    c.bench_function("lzma2_compress_1mb", |b| b.iter(|| lzma2.compress(black_box(&data), 1, false)));
}

criterion_group!(benches, bench_compression);
criterion_main!(benches);
