//! Performance benchmarks for the frame layer.
//!
//! These benchmarks measure the hot paths under every HTTP exchange:
//! - Frame encoding and decoding
//! - Reassembly of fragmented channel messages
//! - Frame round trips over an in-memory pipe

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use peernet::frame::FrameDuplex;
use peernet::io::pipe;
use protocol::{FrameDecoder, FrameEncoder};

const SIZES: &[(&str, usize)] = &[("small_16B", 16), ("medium_4KB", 4096), ("large_64KB", 65536)];

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_codec");

    for &(name, size) in SIZES {
        let payload = vec![0xabu8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_function(format!("encode_{}", name), |b| {
            let encoder = FrameEncoder::new();
            b.iter(|| encoder.encode(black_box(&payload)))
        });

        let wire = FrameEncoder::new().encode(&payload).unwrap_or_default();
        group.bench_function(format!("decode_{}", name), |b| {
            b.iter(|| {
                let mut decoder = FrameDecoder::new();
                decoder.push(black_box(&wire));
                decoder.next_frame()
            })
        });
    }

    group.finish();
}

fn bench_reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_reassembly");

    let payload = vec![0u8; 65536];
    let wire = FrameEncoder::new().encode(&payload).unwrap_or_default();
    group.throughput(Throughput::Bytes(wire.len() as u64));

    // 16 KiB matches the WebRTC transport chunking.
    for chunk in [1024usize, 16 * 1024] {
        group.bench_function(format!("chunks_{}B", chunk), |b| {
            b.iter(|| {
                let mut decoder = FrameDecoder::new();
                for piece in wire.chunks(chunk) {
                    decoder.push(piece);
                }
                black_box(decoder.next_frame())
            })
        });
    }

    group.finish();
}

fn bench_pipe_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipe_roundtrip");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    for &(name, size) in SIZES {
        let payload = vec![7u8; size];
        group.throughput(Throughput::Bytes(size as u64 * 100));
        group.bench_function(format!("100_frames_{}", name), |b| {
            b.iter(|| {
                runtime.block_on(async {
                    let (a, z) = pipe(None);
                    let writer = FrameDuplex::new(Arc::new(a));
                    let reader = FrameDuplex::new(Arc::new(z));
                    for _ in 0..100 {
                        writer.write(&payload).await.unwrap();
                    }
                    writer.close().await.unwrap();
                    let mut total = 0;
                    while let Some(frame) = reader.read().await.unwrap() {
                        total += frame.len();
                    }
                    black_box(total)
                })
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_codec, bench_reassembly, bench_pipe_roundtrip);
criterion_main!(benches);
