use criterion::{criterion_group, criterion_main, Criterion};
use cpm_matrix::DenseMatrix;
use cpm_sparse::SparseVector;

fn bench_inner(c: &mut Criterion) {
    let dims = 4096;
    let k = 16;
    let mut w = DenseMatrix::new(dims, k);
    let values: Vec<f32> = (0..dims).map(|i| (i % 7) as f32 * 0.1).collect();
    let s = SparseVector::from_dense(&values);
    w.add_inplace_all(&s, &vec![0.5; k as usize]);

    c.bench_function("dense_matrix_inner_4096x16", |b| {
        b.iter(|| w.inner(&s, None));
    });
}

criterion_group!(benches, bench_inner);
criterion_main!(benches);
