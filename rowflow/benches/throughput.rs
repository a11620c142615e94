//! Throughput of a linear source -> transform -> destination graph.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rowflow::prelude::*;

fn run_linear_graph(rows: i64) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime.block_on(async {
        let ctx = ExecutionContext::new();
        let source = MemorySource::new("src", (0..rows).collect::<Vec<_>>());
        let double = RowTransform::new("double", |v: i64| v * 2);
        let dest: MemoryDestination<i64> = MemoryDestination::new("dest");
        source.link_to(&double);
        double.link_to(&dest);

        Pipeline::new("bench")
            .add(source)
            .add(double)
            .add(dest)
            .run(&ctx)
            .await
            .unwrap();
    });
}

fn throughput_benchmark(c: &mut Criterion) {
    c.bench_function("linear_10k_rows", |b| {
        b.iter(|| run_linear_graph(black_box(10_000)));
    });
}

criterion_group!(benches, throughput_benchmark);
criterion_main!(benches);
