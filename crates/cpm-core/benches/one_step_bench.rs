use cpm_core::Cpm;
use cpm_dataset::Instance;
use cpm_sparse::SparseVector;
use criterion::{criterion_group, criterion_main, Criterion};

fn bench_one_step(c: &mut Criterion) {
    let dims = 1024;
    let k = 8;
    let mut cpm = Cpm::new(1, dims, k, 0.001, 0.0, 0.5, 0.5, 2, 0).unwrap();

    let values: Vec<f32> = (0..dims).map(|i| if i % 3 == 0 { 1.0 } else { 0.0 }).collect();
    let pos = Instance {
        label: 1,
        x: SparseVector::from_dense(&values),
        pos_id: 0,
    };

    c.bench_function("cpm_one_step_1024x8", |b| {
        b.iter(|| cpm.one_step(&pos).unwrap());
    });
}

criterion_group!(benches, bench_one_step);
criterion_main!(benches);
