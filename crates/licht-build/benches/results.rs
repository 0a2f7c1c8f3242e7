//! Throughput of the result collection path: unordered pushes in, one
//! ascending-id batch out.

use std::time::Duration;

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use licht_build::ResultList;
use licht_export::MappingLightData;
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use uuid::Uuid;

fn shuffled_payloads(count: usize) -> Vec<MappingLightData> {
    let mut ids: Vec<Uuid> = (0..count as u128).map(Uuid::from_u128).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(17);
    ids.shuffle(&mut rng);
    ids.into_iter()
        .map(|id| MappingLightData {
            id,
            width: 4,
            height: 4,
            texels: vec![[0.25; 3]; 16],
        })
        .collect()
}

fn bench_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("result_list_push");
    let payloads = shuffled_payloads(4096);
    group.bench_function("push_4096", |b| {
        b.iter(|| {
            let list = ResultList::new();
            for (worker, p) in payloads.iter().enumerate() {
                list.push(p.clone(), worker % 8);
            }
            black_box(list.len());
        })
    });
    group.finish();
}

fn bench_drain_sorted(c: &mut Criterion) {
    let mut group = c.benchmark_group("result_list_drain");
    let payloads = shuffled_payloads(4096);
    group.bench_function("drain_4096_shuffled", |b| {
        b.iter(|| {
            let list = ResultList::new();
            for (worker, p) in payloads.iter().enumerate() {
                list.push(p.clone(), worker % 8);
            }
            black_box(list.drain_sorted().len());
        })
    });
    group.finish();
}

fn quick_config() -> Criterion {
    Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(60)
}

criterion_group! {
    name = benches;
    config = quick_config();
    targets = bench_push, bench_drain_sorted
}
criterion_main!(benches);
