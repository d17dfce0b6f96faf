//! Benchmarks for pipeline execution
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dagserve::accelerator::mock::{MockAcceleratorManager, MockModelConfig};
use dagserve::config::SchedulerSettings;
use dagserve::pipeline::{
    connect, Connections, NodeInfo, NodeLibraryRegistry, NodeSessionMetadata, PipelineDefinition,
    ENTRY_NODE_NAME, EXIT_NODE_NAME,
};
use dagserve::types::{InferenceRequest, Tensor};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

const MODEL_SIZE: usize = 16;

fn dummy_definition(demultiply: Option<i64>) -> PipelineDefinition {
    let mut entry = NodeInfo::entry(ENTRY_NODE_NAME, &["in"]);
    if let Some(count) = demultiply {
        entry = entry.with_demultiply(count);
    }
    let nodes = vec![
        entry,
        NodeInfo::dl("dummy_node", "dummy", None).with_output_alias("a", "a"),
        NodeInfo::exit(EXIT_NODE_NAME),
    ];
    let mut connections = Connections::new();
    connect(&mut connections, ENTRY_NODE_NAME, "dummy_node", &[("in", "b")]);
    connect(&mut connections, "dummy_node", EXIT_NODE_NAME, &[("a", "out")]);
    let settings = SchedulerSettings::default().with_event_poll_timeout(Duration::from_micros(200));
    PipelineDefinition::new("bench", nodes, connections, settings)
}

fn request(shape: Vec<usize>) -> InferenceRequest {
    let count: usize = shape.iter().product();
    let values: Vec<f32> = (0..count).map(|v| v as f32).collect();
    let tensor = Tensor::from_f32(shape, &values).expect("valid bench tensor");
    InferenceRequest::new().with_input("in", tensor)
}

fn bench_single_request(c: &mut Criterion) {
    let manager = Arc::new(MockAcceleratorManager::new().expect("mock runtime"));
    manager.load(MockModelConfig::dummy("dummy", MODEL_SIZE).with_nireq(4));
    let libraries = NodeLibraryRegistry::new();
    let definition = dummy_definition(None);
    definition
        .validate(manager.as_ref(), &libraries)
        .expect("valid definition");

    c.bench_function("single_dl_request", |b| {
        b.iter(|| {
            let mut pipeline = definition
                .create(request(vec![1, MODEL_SIZE]), manager.clone(), &libraries)
                .expect("pipeline");
            black_box(pipeline.execute().expect("response"))
        });
    });
}

fn bench_demultiplexed_request(c: &mut Criterion) {
    let mut group = c.benchmark_group("demultiplexed_request");
    let manager = Arc::new(MockAcceleratorManager::new().expect("mock runtime"));
    manager.load(MockModelConfig::dummy("dummy", MODEL_SIZE).with_nireq(4));
    let libraries = NodeLibraryRegistry::new();
    let definition = dummy_definition(Some(-1));
    definition
        .validate(manager.as_ref(), &libraries)
        .expect("valid definition");

    for shards in [1usize, 8, 64].iter() {
        group.throughput(Throughput::Elements(*shards as u64));
        group.bench_with_input(BenchmarkId::new("shards", shards), shards, |b, &shards| {
            b.iter(|| {
                let mut pipeline = definition
                    .create(request(vec![shards, 1, MODEL_SIZE]), manager.clone(), &libraries)
                    .expect("pipeline");
                black_box(pipeline.execute().expect("response"))
            });
        });
    }

    group.finish();
}

fn bench_session_keys(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_metadata");

    let outer = NodeSessionMetadata::new().generate_subsessions("outer", 4);
    let inner = outer[3].generate_subsessions("inner", 16);
    let leaf = &inner[15];
    let collapsed: BTreeSet<String> = ["inner".to_string()].into_iter().collect();

    group.bench_function("session_key", |b| {
        b.iter(|| black_box(leaf.session_key()));
    });

    group.bench_function("collapsed_metadata", |b| {
        b.iter(|| black_box(leaf.collapsed_metadata(&collapsed)));
    });

    group.bench_function("shard_id", |b| {
        b.iter(|| black_box(leaf.shard_id(&collapsed)));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_single_request,
    bench_demultiplexed_request,
    bench_session_keys,
);

criterion_main!(benches);
