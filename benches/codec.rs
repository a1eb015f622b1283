//! Benchmarks for request encoding and the server-side decode chain.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use femtorelay::{
    CodecKind, FemtoEvent, FemtoLevel,
    wire::{CodecChain, Request, encode_frame},
};
use serde_json::json;

fn sample_request() -> Request {
    let event = FemtoEvent::builder()
        .prefix("bench")
        .sub("codec")
        .level(FemtoLevel::Warn)
        .message("upstream latency above threshold")
        .field("latency_ms", 412)
        .field("route", json!({"method": "GET", "path": "/v1/items", "tags": ["a", "b"]}))
        .build()
        .unwrap();
    Request::new("0123456789abcdef0123456789abcdef", &event)
}

fn bench_encode(c: &mut Criterion) {
    let request = sample_request();
    let mut group = c.benchmark_group("encode_request");
    for codec in [CodecKind::MessagePack, CodecKind::Json] {
        group.bench_with_input(BenchmarkId::from_parameter(codec), &codec, |b, codec| {
            b.iter(|| {
                let payload = codec.encode(black_box(&request)).unwrap();
                encode_frame(&payload, 1 << 20).unwrap()
            });
        });
    }
    group.finish();
}

fn bench_decode_chain(c: &mut Criterion) {
    let request = sample_request();
    let chain = CodecChain::default();
    let mut group = c.benchmark_group("decode_request");
    for codec in [CodecKind::MessagePack, CodecKind::Json] {
        let payload = codec.encode(&request).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(codec), &payload, |b, payload| {
            b.iter(|| chain.decode::<Request>(black_box(payload)).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode_chain);
criterion_main!(benches);
