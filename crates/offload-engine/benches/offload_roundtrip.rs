use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use offload_engine::{BackendKind, OffloadConfig, Offloader};
use offload_module::host_buffer::HostBuffer;
use std::sync::Arc;

fn bench_roundtrip(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut group = c.benchmark_group("offload_roundtrip");

    for backend in [BackendKind::Aio, BackendKind::Uring] {
        let off = match Offloader::new(OffloadConfig::new(dir.path()).backend(backend).n_entries(32)) {
            Ok(off) => off,
            Err(e) => {
                eprintln!("skipping {} backend: {}", backend, e);
                continue;
            }
        };

        for size in [4usize << 10, 1 << 20] {
            let buf = Arc::new(HostBuffer::from_bytes(vec![0x5A; size]));
            let key = buf.key();
            group.throughput(Throughput::Bytes(2 * size as u64));
            group.bench_with_input(BenchmarkId::new(backend.as_str(), size), &size, |b, _| {
                b.iter(|| {
                    off.sync_write(buf.clone(), black_box(key)).unwrap();
                    off.sync_read(buf.clone(), black_box(key)).unwrap();
                    // Hand the range back so the file does not grow per iteration.
                    off.release_region(key).unwrap();
                })
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_roundtrip);
criterion_main!(benches);
