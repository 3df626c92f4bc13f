//! Session Run Benchmark
//!
//! Measures end-to-end `Session::run` latency:
//! - An elementwise chain on the CPU provider across tensor sizes
//! - The same chain with arena pooling disabled
//! - A graph split between the stream and CPU providers
//!
//! Run with: cargo bench --bench session_run

use std::collections::HashMap;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tessera_core::{Artifact, DataType, Graph, GraphBuilder, Shape, Tensor};
use tessera_providers::{CpuProviderOptions, StreamProviderOptions};
use tessera_runtime::{Session, SessionOptions};

/// `y = relu((a + b) * a) - b` over `[len]` f32 values.
fn chain_graph(len: usize) -> Graph {
    let mut b = GraphBuilder::new();
    b.add_input("a", DataType::F32, Shape::fixed([len])).unwrap();
    b.add_input("b", DataType::F32, Shape::fixed([len])).unwrap();
    for name in ["s", "m", "r", "y"] {
        b.add_value(name, DataType::F32, Shape::fixed([len])).unwrap();
    }
    b.add_node("add", "Add", &["a", "b"], &["s"]).unwrap();
    b.add_node("mul", "Mul", &["s", "a"], &["m"]).unwrap();
    b.add_node("relu", "Relu", &["m"], &["r"]).unwrap();
    b.add_node("sub", "Sub", &["r", "b"], &["y"]).unwrap();
    b.add_output("y").unwrap();
    b.build().unwrap()
}

fn chain_inputs(len: usize) -> HashMap<String, Tensor> {
    let a: Vec<f32> = (0..len).map(|i| (i % 17) as f32 - 8.0).collect();
    let b: Vec<f32> = (0..len).map(|i| (i % 5) as f32 * 0.25).collect();
    HashMap::from([
        ("a".to_string(), Tensor::from_f32(a, vec![len]).unwrap()),
        ("b".to_string(), Tensor::from_f32(b, vec![len]).unwrap()),
    ])
}

fn loaded(options: SessionOptions, graph: Graph) -> Session {
    let session = Session::new(options);
    session.load(Artifact::new(graph)).unwrap();
    session
}

/// Benchmark the CPU chain across sizes
fn bench_cpu_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("cpu_chain");
    group.measurement_time(Duration::from_secs(5));

    let sizes = vec![(256, "small"), (16 * 1024, "medium"), (1024 * 1024, "large")];

    for (len, name) in sizes {
        group.throughput(Throughput::Elements(len as u64));
        let session = loaded(
            SessionOptions::new().with_provider(CpuProviderOptions::default(), 0),
            chain_graph(len),
        );
        let inputs = chain_inputs(len);

        group.bench_with_input(BenchmarkId::new("pooled", name), &inputs, |b, inputs| {
            b.iter(|| session.run(black_box(inputs.clone())).unwrap());
        });
        session.close().unwrap();
    }

    group.finish();
}

/// Benchmark the cost of allocating arenas on every run
fn bench_arena_pooling(c: &mut Criterion) {
    let mut group = c.benchmark_group("arena_pooling");
    let len = 64 * 1024;
    let inputs = chain_inputs(len);

    for pooled in [true, false] {
        let session = loaded(
            SessionOptions::new()
                .with_provider(CpuProviderOptions::default(), 0)
                .with_arena_pool(pooled),
            chain_graph(len),
        );
        let id = if pooled { "pooled" } else { "unpooled" };
        group.bench_function(id, |b| {
            b.iter(|| session.run(black_box(inputs.clone())).unwrap());
        });
        session.close().unwrap();
    }

    group.finish();
}

/// Benchmark a run split across the stream and CPU providers
fn bench_mixed_providers(c: &mut Criterion) {
    let mut group = c.benchmark_group("mixed_providers");
    let len = 16 * 1024;
    let session = loaded(
        SessionOptions::new()
            .with_provider(CpuProviderOptions::default(), 0)
            .with_provider(StreamProviderOptions::default().with_stream_count(4), 10),
        chain_graph(len),
    );
    let inputs = chain_inputs(len);

    group.throughput(Throughput::Elements(len as u64));
    group.bench_function("stream_then_cpu", |b| {
        b.iter(|| session.run(black_box(inputs.clone())).unwrap());
    });
    session.close().unwrap();

    group.finish();
}

criterion_group!(
    benches,
    bench_cpu_chain,
    bench_arena_pooling,
    bench_mixed_providers
);
criterion_main!(benches);
