//! Buffer append/retrieve throughput.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use muxr_core::Buffer;

fn bench_append_retrieve(c: &mut Criterion) {
    let chunk = vec![0u8; 4096];

    c.bench_function("append_4k_fresh", |b| {
        b.iter(|| {
            let mut buf = Buffer::new();
            buf.append(black_box(&chunk));
            black_box(buf.readable_bytes())
        })
    });

    c.bench_function("append_retrieve_steady_state", |b| {
        let mut buf = Buffer::new();
        b.iter(|| {
            buf.append(black_box(&chunk));
            buf.retrieve(chunk.len());
        })
    });

    c.bench_function("append_compacting", |b| {
        let mut buf = Buffer::new();
        b.iter(|| {
            buf.append(black_box(&chunk));
            buf.retrieve(4000); // leave a readable tail to slide down
            buf.retrieve(96);
        })
    });
}

criterion_group!(benches, bench_append_retrieve);
criterion_main!(benches);
