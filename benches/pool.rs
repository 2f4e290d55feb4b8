//! Buffer pool and record path benchmarks
//!
//! Run with: cargo bench --bench pool

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use quiver_db::buffer::{Buffer, HeapBuffer};
use quiver_db::index::VectorIndex;
use quiver_db::object::{ObjectReader, ObjectWriter};
use quiver_db::pool::BufferPool;
use rand::Rng;
use uuid::Uuid;

fn random_vector(dim: usize) -> Vec<f32> {
    let mut rng = rand::thread_rng();
    (0..dim).map(|_| rng.gen::<f32>() - 0.5).collect()
}

fn bench_pool_get_release(c: &mut Criterion) {
    let pool = BufferPool::new();
    let mut group = c.benchmark_group("pool_get_release");

    for size in [512, 3000, 100_000] {
        group.bench_with_input(BenchmarkId::new("pooled", size), &size, |b, &size| {
            b.iter(|| pool.get(black_box(size)).release())
        });
        group.bench_with_input(BenchmarkId::new("fresh", size), &size, |b, &size| {
            b.iter(|| HeapBuffer::new(black_box(size)).release())
        });
    }

    group.finish();
}

fn bench_record_roundtrip(c: &mut Criterion) {
    let pool = BufferPool::new();
    let mut group = c.benchmark_group("record");

    for dim in [128, 768, 1536] {
        let vector = random_vector(dim);
        group.throughput(Throughput::Bytes((dim * 4) as u64));

        group.bench_function(format!("encode_{}", dim), |b| {
            let mut writer = ObjectWriter::new(dim * 4 + 64);
            b.iter(|| {
                writer.write_header(1);
                writer.write_string("name");
                writer.write_vector(black_box(&vector));
                writer.to_pooled(&pool).release();
            })
        });

        let mut writer = ObjectWriter::new(dim * 4 + 64);
        writer.write_header(1);
        writer.write_string("name");
        writer.write_vector(&vector);
        let record = writer.to_pooled(&pool);

        group.bench_function(format!("read_vector_{}", dim), |b| {
            b.iter(|| {
                let reader = ObjectReader::new(record.retain()).unwrap();
                black_box(reader.vector().unwrap().map(|v| v[0]))
            })
        });
    }

    group.finish();
}

fn bench_index_search(c: &mut Criterion) {
    let dim = 128;
    let index = VectorIndex::new(dim);
    for _ in 0..10_000 {
        index.add_vector(Uuid::new_v4(), &random_vector(dim)).unwrap();
    }
    let query = random_vector(dim);

    c.bench_function("index_search_10k_top10", |b| {
        b.iter(|| index.search(black_box(&query), 10).unwrap())
    });
}

criterion_group!(
    benches,
    bench_pool_get_release,
    bench_record_roundtrip,
    bench_index_search
);
criterion_main!(benches);
