//! Benchmarks for the frame header codec
//!
//! The header is written once per sent frame and parsed once per received
//! frame, so both directions sit on the hot path of every stream.

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use framerelay::codec::CodecParams;
use framerelay::test_utils::{encode_frame, ramp_frame, u16_shape};
use framerelay::wire::header::HEADER_SIZE;
use framerelay::{FrameHeader, StreamDescriptor, Timestamp, WireFrame};
use std::hint::black_box;

fn sample_header() -> FrameHeader {
    let shape = u16_shape();
    FrameHeader::new(
        StreamDescriptor {
            name: "science_camera_0".to_string(),
            width: shape.width,
            height: shape.height,
            element_type: shape.element_type,
            frame_counter: 123_456,
            timestamp: Timestamp::new(1_700_000_000, 250_000_000),
        },
        CodecParams::default(),
        4096,
    )
}

fn bench_header_encode(c: &mut Criterion) {
    let header = sample_header();

    let mut group = c.benchmark_group("header_encode");
    group.throughput(Throughput::Bytes(HEADER_SIZE as u64));

    group.bench_function("to_array", |b| b.iter(|| black_box(black_box(&header).encode())));

    let mut buf = vec![0u8; HEADER_SIZE];
    group.bench_function("into_buffer", |b| {
        b.iter(|| {
            black_box(&header).encode_into(&mut buf);
            black_box(&buf);
        })
    });

    group.finish();
}

fn bench_header_decode(c: &mut Criterion) {
    let encoded = sample_header().encode();

    let mut group = c.benchmark_group("header_decode");
    group.throughput(Throughput::Bytes(HEADER_SIZE as u64));

    group.bench_function("decode", |b| {
        b.iter(|| black_box(FrameHeader::decode(black_box(&encoded[..])).unwrap()))
    });

    group.finish();
}

fn bench_wire_frame_parse(c: &mut Criterion) {
    let shape = u16_shape();
    let raw = ramp_frame(shape, 1);
    let message = encode_frame("cam0", shape, 1, CodecParams::default(), &raw).unwrap();

    c.bench_function("wire_frame_parse", |b| {
        b.iter(|| black_box(WireFrame::parse(black_box(message.clone())).unwrap()))
    });
}

criterion_group!(benches, bench_header_encode, bench_header_decode, bench_wire_frame_parse);
criterion_main!(benches);
