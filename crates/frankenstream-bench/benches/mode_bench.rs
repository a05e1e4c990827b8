//! Mode-switch and buffered I/O benchmarks over the in-memory descriptor table.

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use frankenstream_core::memio::MemIo;
use frankenstream_core::{Capabilities, Engine, EngineConfig, LowLevelIo, Wanted};

fn engine(io: &Arc<MemIo>, buffer_size: usize) -> Arc<Engine> {
    Engine::builder()
        .io(Arc::clone(io) as Arc<dyn LowLevelIo>)
        .config(EngineConfig {
            buffer_size,
            ..EngineConfig::default()
        })
        .build()
}

fn bench_direction_switch(c: &mut Criterion) {
    let mut group = c.benchmark_group("direction_switch");

    let io = Arc::new(MemIo::new());
    let fd = io.create_file(&[0u8; 4096]);
    let e = engine(&io, 1024);
    let s = e.open_fd(fd, Capabilities::read_write());
    let mut byte = [0u8; 1];
    group.bench_function("file_read_write", |b| {
        b.iter(|| {
            s.request_mode(Wanted::READ).unwrap();
            s.read(&mut byte).unwrap();
            s.write(black_box(b"x")).unwrap();
            s.lock().sync_local().unwrap();
        });
    });

    let string = Engine::new().open_string(vec![0; 256], 0, Capabilities::read_write());
    group.bench_function("string_read_write", |b| {
        b.iter(|| {
            string.request_mode(Wanted::WRITE).unwrap();
            string.request_mode(Wanted::READ).unwrap();
        });
    });

    group.bench_function("same_direction", |b| {
        b.iter(|| string.request_mode(black_box(Wanted::READ)).unwrap());
    });
    group.finish();
}

fn bench_buffered_write(c: &mut Criterion) {
    let sizes: &[usize] = &[64, 1024, 8192];
    let mut group = c.benchmark_group("buffered_write");

    for &size in sizes {
        let chunk = vec![0xABu8; 512];
        group.throughput(Throughput::Bytes(chunk.len() as u64));
        group.bench_with_input(BenchmarkId::new("buffer", size), &size, |b, &sz| {
            let io = Arc::new(MemIo::new());
            let (_r, w) = io.pipe();
            let s = engine(&io, sz).open_fd(w, Capabilities::write_only());
            b.iter(|| {
                s.write(black_box(&chunk)).unwrap();
                io.drain_pipe(w);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_direction_switch, bench_buffered_write);
criterion_main!(benches);
