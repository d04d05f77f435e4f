//! Codec benchmarks for spjall-protocol.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use spjall_protocol::{codec, Frame};

const KEY: [u8; 4] = [0x12, 0x34, 0x56, 0x78];

fn bench_encode(c: &mut Criterion) {
    let small = Frame::text(vec![b'a'; 64]);
    let large = Frame::text(vec![b'a'; 64 * 1024]);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("small_64B", |b| b.iter(|| codec::encode(black_box(&small))));
    group.throughput(Throughput::Bytes(64 * 1024));
    group.bench_function("large_64KiB", |b| b.iter(|| codec::encode(black_box(&large))));
    group.finish();
}

fn bench_decode_masked(c: &mut Criterion) {
    let small = codec::encode_masked(&Frame::text(vec![b'a'; 64]), KEY);
    let large = codec::encode_masked(&Frame::text(vec![b'a'; 64 * 1024]), KEY);

    let mut group = c.benchmark_group("decode_masked");
    group.throughput(Throughput::Bytes(small.len() as u64));
    group.bench_function("small_64B", |b| b.iter(|| codec::decode(black_box(&small))));
    group.throughput(Throughput::Bytes(large.len() as u64));
    group.bench_function("large_64KiB", |b| b.iter(|| codec::decode(black_box(&large))));
    group.finish();
}

fn bench_stream(c: &mut Criterion) {
    let mut stream = BytesMut::new();
    for _ in 0..100 {
        stream.extend_from_slice(&codec::encode_masked(&Frame::text(vec![b'a'; 256]), KEY));
    }
    let stream = stream.freeze();

    c.bench_function("decode_from_100x256B", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(&stream[..]);
            let mut count = 0;
            while let Ok(Some(frame)) = codec::decode_from(&mut buf) {
                count += frame.payload.len();
            }
            black_box(count)
        })
    });
}

criterion_group!(benches, bench_encode, bench_decode_masked, bench_stream);
criterion_main!(benches);
