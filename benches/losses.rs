//! Criterion benchmarks for the triplet and quadruplet losses at
//! place-recognition batch sizes (2 positives, 18 negatives, 256-d descriptors).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{rngs::StdRng, SeedableRng};

use anvil_metric::{
    evaluate, quadruplet_loss, select_positive, triplet_loss, BatchLayout, EmbeddingBatch,
    LossPolicy, QuadrupletLoss, TripletLoss,
};

fn layout(batch_size: usize, with_other_neg: bool) -> BatchLayout {
    BatchLayout {
        batch_size,
        num_pos: 2,
        num_neg: 18,
        dim: 256,
        with_other_neg,
    }
}

fn bench_select_positive(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_positive");
    for batch_size in [1, 8, 32] {
        let batch = EmbeddingBatch::<f32>::random(layout(batch_size, false), &mut StdRng::seed_from_u64(1));
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), &batch, |b, batch| {
            b.iter(|| select_positive(black_box(&batch.query), black_box(&batch.positives)).unwrap())
        });
    }
    group.finish();
}

fn bench_triplet(c: &mut Criterion) {
    let mut group = c.benchmark_group("triplet_loss");
    let lazy = LossPolicy::new().with_lazy(true);
    for batch_size in [1, 8, 32] {
        let batch = EmbeddingBatch::<f32>::random(layout(batch_size, false), &mut StdRng::seed_from_u64(2));

        group.bench_with_input(BenchmarkId::new("forward", batch_size), &batch, |b, batch| {
            b.iter(|| {
                triplet_loss(
                    black_box(&batch.query),
                    black_box(&batch.positives),
                    black_box(&batch.negatives),
                    0.3,
                    lazy,
                )
                .unwrap()
            })
        });

        let loss = TripletLoss::new(0.3, lazy).unwrap();
        group.bench_with_input(BenchmarkId::new("forward_backward", batch_size), &batch, |b, batch| {
            b.iter(|| evaluate(&loss, black_box(batch)).unwrap())
        });
    }
    group.finish();
}

fn bench_quadruplet(c: &mut Criterion) {
    let mut group = c.benchmark_group("quadruplet_loss");
    let policy = LossPolicy::new().with_lazy(true).with_ignore_zero_loss(true);
    for batch_size in [1, 8, 32] {
        let batch = EmbeddingBatch::<f32>::random(layout(batch_size, true), &mut StdRng::seed_from_u64(3));
        let Some(other_neg) = batch.other_neg.clone() else {
            continue;
        };

        group.bench_with_input(BenchmarkId::new("forward", batch_size), &batch, |b, batch| {
            b.iter(|| {
                quadruplet_loss(
                    black_box(&batch.query),
                    black_box(&batch.positives),
                    black_box(&batch.negatives),
                    black_box(&other_neg),
                    0.5,
                    0.2,
                    policy,
                )
                .unwrap()
            })
        });

        let loss = QuadrupletLoss::new(0.5, 0.2, policy).unwrap();
        group.bench_with_input(BenchmarkId::new("forward_backward", batch_size), &batch, |b, batch| {
            b.iter(|| evaluate(&loss, black_box(batch)).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_select_positive, bench_triplet, bench_quadruplet);
criterion_main!(benches);
