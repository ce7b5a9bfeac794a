#![allow(dead_code)]

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use variant_assoc_rust::GroupData;

/// Rare-variant group with `n` samples and `m` sites. Every site has at least
/// one carrier. The noise depends only on `seed`, so the same seed with a
/// different `effect` changes nothing but the signal.
pub fn synthetic_group(key: &str, n: usize, m: usize, effect: f64, seed: u64) -> GroupData {
    assert!(n >= m);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut genotypes = Array2::from_shape_fn((n, m), |_| if rng.gen_bool(0.08) { 1.0 } else { 0.0 });
    for j in 0..m {
        genotypes[[j, j]] = 1.0;
    }
    let noise: Vec<f64> = (0..n)
        .map(|_| (0..4).map(|_| rng.gen::<f64>()).sum::<f64>() - 2.0)
        .collect();
    let phenotype = Array1::from_shape_fn(n, |i| effect * genotypes.row(i).sum() + noise[i]);
    GroupData {
        group_key: key.to_string(),
        sample_ids: (0..n).map(|i| format!("S{}", i + 1)).collect(),
        genotypes,
        phenotype,
        covariates: Array2::zeros((n, 0)),
    }
}

/// Same layout with a 0/1 phenotype (liability threshold at zero).
pub fn synthetic_binary_group(key: &str, n: usize, m: usize, effect: f64, seed: u64) -> GroupData {
    let mut group = synthetic_group(key, n, m, effect, seed);
    group.phenotype.mapv_inplace(|y| if y > 0.0 { 1.0 } else { 0.0 });
    group
}

/// Removes the linear association between phenotype and the raw allele-count burden.
pub fn orthogonalize_phenotype(group: &mut GroupData) {
    let burden = group.genotypes.sum_axis(ndarray::Axis(1));
    let b_mean = burden.mean().unwrap_or(0.0);
    let y_mean = group.phenotype.mean().unwrap_or(0.0);
    let centered = burden.mapv(|b| b - b_mean);
    let slope = centered.dot(&group.phenotype.mapv(|y| y - y_mean)) / centered.dot(&centered);
    group.phenotype = &group.phenotype - &(&centered * slope);
}
