use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use simrun::config::PartitionRule;
use simrun::execution::{SlicePlan, WorkerPartition};
use simrun::table::Datasets;
use simrun::{Column, Table};

fn population(households: i64) -> Datasets {
    let ids: Vec<i64> = (1..=households).collect();
    let mut person_ids = Vec::new();
    let mut person_households = Vec::new();
    for &hh in &ids {
        for k in 0..(hh % 4 + 1) {
            person_ids.push(hh * 10 + k);
            person_households.push(hh);
        }
    }
    let households = Table::new(Some("household_id"), ids).unwrap();
    let persons = Table::new(Some("person_id"), person_ids)
        .unwrap()
        .with_column("household_id", Column::Int(person_households))
        .unwrap();
    [("households", households), ("persons", persons)]
        .into_iter()
        .map(|(name, table)| (name.to_string(), table))
        .collect()
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("partition");
    for size in [10_000i64, 100_000] {
        let ids: Vec<i64> = (1..=size).rev().collect();
        for rule in [PartitionRule::Slice, PartitionRule::Hash] {
            group.bench_with_input(BenchmarkId::new(format!("{rule:?}"), size), &ids, |b, ids| {
                b.iter(|| WorkerPartition::compute(ids, 8, rule));
            });
        }
    }
    group.finish();

    let mut group = c.benchmark_group("slice");
    for size in [10_000i64, 100_000] {
        let datasets = population(size);
        let plan = SlicePlan::new(&datasets, "households").unwrap();
        let ids: Vec<i64> = datasets["households"].index().to_vec();
        let partitions = WorkerPartition::compute(&ids, 8, PartitionRule::Slice);
        group.bench_with_input(BenchmarkId::new("households+persons", size), &datasets, |b, datasets| {
            b.iter(|| plan.slice(datasets, &partitions[3]).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
