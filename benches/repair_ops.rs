//! Benchmarks for the repair pass.

use std::collections::BTreeMap;
use std::sync::Arc;

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use rand::{Rng, SeedableRng};

use akh_batchgraph::concept::{DataType, TypeLabel};
use akh_batchgraph::config::GraphConfig;
use akh_batchgraph::repair::{RepairDriver, RepairQueue};
use akh_batchgraph::session::Session;

/// A batch session holding `resources` names drawn from `distinct` values.
fn loaded(resources: usize, distinct: u32) -> (Session, Arc<RepairQueue>) {
    let queue = Arc::new(RepairQueue::new());
    let session =
        Session::open(GraphConfig::in_memory("bench").with_batch(true), queue.clone()).unwrap();
    let mut graph = session.graph().unwrap();
    graph.put_resource_type("name", DataType::String).unwrap();
    graph.commit().unwrap();

    let mut rng = rand::rngs::StdRng::seed_from_u64(0);
    let name = TypeLabel::new("name");
    for _ in 0..resources / 100 {
        let mut graph = session.graph().unwrap();
        for _ in 0..100 {
            let value = format!("name-{}", rng.gen_range(0..distinct));
            graph.put_resource(&name, value).unwrap();
        }
        graph.commit().unwrap();
    }
    (session, queue)
}

fn bench_merge(c: &mut Criterion) {
    c.bench_function("repair_1k_resources_100_values", |bench| {
        bench.iter_batched(
            || loaded(1_000, 100),
            |(session, queue)| black_box(RepairDriver::new(session, queue).run_once().unwrap()),
            BatchSize::LargeInput,
        )
    });

    c.bench_function("repair_parallel_1k_resources_100_values", |bench| {
        bench.iter_batched(
            || loaded(1_000, 100),
            |(session, queue)| {
                black_box(RepairDriver::new(session, queue).run_parallel().unwrap())
            },
            BatchSize::LargeInput,
        )
    });
}

fn bench_counts(c: &mut Criterion) {
    let (session, _queue) = loaded(0, 1);
    let name = session
        .registry()
        .get(&TypeLabel::new("name"))
        .unwrap()
        .concept_id();
    let sharding = session.sharding();
    let deltas = BTreeMap::from([(name, 1)]);

    c.bench_function("update_concept_counts", |bench| {
        bench.iter(|| black_box(sharding.update_concept_counts(&deltas).unwrap()))
    });
}

criterion_group!(benches, bench_merge, bench_counts);
criterion_main!(benches);
