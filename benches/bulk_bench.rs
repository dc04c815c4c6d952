//! Benchmarks for bulk-engine
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn benchmark_bucket_building(c: &mut Criterion) {
    use bulk_engine::bulk::BucketBuilder;

    let ids: Vec<String> = (0..10_000).map(|i| format!("doc-{:05}", i)).collect();

    c.bench_function("bucket_build_10k", |b| {
        b.iter(|| {
            let mut builder = BucketBuilder::new("bench", 100, 8);
            let mut buckets = 0usize;
            for id in &ids {
                if builder.push(id.clone()).is_some() {
                    buckets += 1;
                }
            }
            let (last, count) = builder.finish();
            black_box((buckets, last, count));
        })
    });
}

fn benchmark_query_matching(c: &mut Criterion) {
    use bulk_engine::selection::{Document, Query};

    let query = Query::parse("type = 'File' AND status != 'done' AND title = 'Content to migrate'")
        .unwrap();
    let mut doc = Document::new("doc-1", "File", "Content to migrate");
    doc.properties.insert("status".into(), "pending".into());

    c.bench_function("query_parse", |b| {
        b.iter(|| {
            black_box(Query::parse(black_box("type = 'File' AND owner = 'o''brien'")).unwrap());
        })
    });

    c.bench_function("query_match", |b| {
        b.iter(|| black_box(query.matches(black_box(&doc))))
    });
}

criterion_group!(benches, benchmark_bucket_building, benchmark_query_matching);
criterion_main!(benches);
