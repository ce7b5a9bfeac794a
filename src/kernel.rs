//! Module for sample kernel matrices and the kernel (variance-component) score test.
use crate::regression::NullModel;
use ndarray::{Array1, Array2, Axis};
use rayon::prelude::*;
use statrs::distribution::{ChiSquared, ContinuousCDF};
use statrs::function::gamma::ln_gamma;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KernelError {
    #[error("Degenerate kernel: {0}")]
    Degenerate(String),
    #[error("Invalid dimensions: {0}")]
    Dimensions(String),
}

/// Sample-by-sample similarity used by the kernel test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelKind {
    Linear,
    LinearWeighted,
    Ibs,
    IbsWeighted,
    Quadratic,
}

impl std::str::FromStr for KernelKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linear" => Ok(KernelKind::Linear),
            "linear.weighted" => Ok(KernelKind::LinearWeighted),
            "ibs" => Ok(KernelKind::Ibs),
            "ibs.weighted" => Ok(KernelKind::IbsWeighted),
            "quadratic" => Ok(KernelKind::Quadratic),
            _ => Err(format!(
                "unknown kernel '{}'. Use linear, linear.weighted, IBS, IBS.weighted or quadratic",
                s
            )),
        }
    }
}

impl KernelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KernelKind::Linear => "linear",
            KernelKind::LinearWeighted => "linear.weighted",
            KernelKind::Ibs => "IBS",
            KernelKind::IbsWeighted => "IBS.weighted",
            KernelKind::Quadratic => "quadratic",
        }
    }

    fn is_weighted(&self) -> bool {
        matches!(self, KernelKind::LinearWeighted | KernelKind::IbsWeighted)
    }

    fn is_linear(&self) -> bool {
        matches!(self, KernelKind::Linear | KernelKind::LinearWeighted)
    }
}

fn effective_weights(kind: KernelKind, weights: &Array1<f64>) -> Array1<f64> {
    if kind.is_weighted() {
        weights.clone()
    } else {
        Array1::ones(weights.len())
    }
}

/// `Z = G diag(w)`, the factor of a linear kernel `K = Z Z'`.
fn linear_factor(genotypes: &Array2<f64>, weights: &Array1<f64>) -> Array2<f64> {
    let mut z = genotypes.clone();
    for (mut col, &w) in z.axis_iter_mut(Axis(1)).zip(weights.iter()) {
        col.mapv_inplace(|g| g * w);
    }
    z
}

/// Builds the n x n kernel matrix. Rows are computed in parallel.
pub fn kernel_matrix(
    genotypes: &Array2<f64>,
    weights: &Array1<f64>,
    kind: KernelKind,
) -> Result<Array2<f64>, KernelError> {
    let n = genotypes.nrows();
    let m = genotypes.ncols();
    if weights.len() != m {
        return Err(KernelError::Dimensions(format!(
            "{} weights supplied for {} sites",
            weights.len(),
            m
        )));
    }
    let w = effective_weights(kind, weights);

    if kind.is_linear() {
        let z = linear_factor(genotypes, &w);
        return Ok(z.dot(&z.t()));
    }

    let weight_total: f64 = w.sum();
    if weight_total <= 0.0 {
        return Err(KernelError::Degenerate("kernel weights sum to zero".to_string()));
    }

    let rows: Vec<Vec<f64>> = (0..n)
        .into_par_iter()
        .map(|i| {
            let gi = genotypes.row(i);
            (0..n)
                .map(|j| {
                    let gj = genotypes.row(j);
                    match kind {
                        KernelKind::Ibs | KernelKind::IbsWeighted => {
                            let shared: f64 = gi
                                .iter()
                                .zip(gj.iter())
                                .zip(w.iter())
                                .map(|((a, b), wk)| wk * (2.0 - (a - b).abs()))
                                .sum();
                            shared / (2.0 * weight_total)
                        }
                        _ => {
                            let dot: f64 = gi.iter().zip(gj.iter()).map(|(a, b)| a * b).sum();
                            (1.0 + dot).powi(2)
                        }
                    }
                })
                .collect()
        })
        .collect();

    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    Array2::from_shape_vec((n, n), flat)
        .map_err(|e| KernelError::Dimensions(format!("failed to assemble kernel: {}", e)))
}

/// Kernel score statistic `Q = r' K r / scale` for null-model residuals `r`.
pub fn kernel_score(
    null: &NullModel,
    genotypes: &Array2<f64>,
    weights: &Array1<f64>,
    kind: KernelKind,
) -> Result<f64, KernelError> {
    if null.residuals.len() != genotypes.nrows() {
        return Err(KernelError::Dimensions(format!(
            "null model has {} residuals for {} genotype rows",
            null.residuals.len(),
            genotypes.nrows()
        )));
    }
    let r = &null.residuals;
    let q = if kind.is_linear() {
        let z = linear_factor(genotypes, &effective_weights(kind, weights));
        let s = z.t().dot(r);
        s.dot(&s)
    } else {
        let k = kernel_matrix(genotypes, weights, kind)?;
        r.dot(&k.dot(r))
    };
    Ok(q / null.scale)
}

/// Traces `tr(A^k)`, k = 1..4, of the null-projected kernel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelMoments {
    pub traces: [f64; 4],
}

fn power_traces(m: &Array2<f64>) -> [f64; 4] {
    let m2 = m.dot(m);
    let c1 = m.diag().sum();
    let c2 = m2.diag().sum();
    let c3: f64 = m2
        .indexed_iter()
        .map(|((i, j), v)| v * m[[j, i]])
        .sum();
    let c4: f64 = m2
        .indexed_iter()
        .map(|((i, j), v)| v * m2[[j, i]])
        .sum();
    [c1, c2, c3, c4]
}

/// Moments of the null distribution of `Q`.
///
/// For linear kernels the m x m matrix `Z' P0 Z` has the same non-zero
/// spectrum as `P0 K` and is built in O(n m (m + p)) without the n x n
/// projection. Other kernels need the dense `P0 K`.
pub fn kernel_moments(
    null: &NullModel,
    genotypes: &Array2<f64>,
    weights: &Array1<f64>,
    kind: KernelKind,
) -> Result<KernelMoments, KernelError> {
    let traces = if kind.is_linear() {
        let z = linear_factor(genotypes, &effective_weights(kind, weights));
        let a = null
            .projected_gram(&z)
            .map_err(|e| KernelError::Dimensions(e.to_string()))?;
        power_traces(&a)
    } else {
        let k = kernel_matrix(genotypes, weights, kind)?;
        power_traces(&null.projection().dot(&k))
    };
    log::trace!("Kernel moments: {:?}", traces);
    if !(traces[1] > 0.0) || traces.iter().any(|t| !t.is_finite()) {
        return Err(KernelError::Degenerate(
            "projected kernel has no variance under the null".to_string(),
        ));
    }
    Ok(KernelMoments { traces })
}

/// Upper tail of a (possibly non-central) chi-square as a Poisson mixture of central ones.
fn noncentral_chi_square_sf(x: f64, df: f64, ncp: f64) -> f64 {
    if x <= 0.0 {
        return 1.0;
    }
    let central = |k: f64| ChiSquared::new(k).map(|d| d.sf(x)).unwrap_or(f64::NAN);
    if ncp <= 1e-12 {
        return central(df);
    }
    let half = ncp / 2.0;
    let mut total = 0.0;
    let mut mass = 0.0;
    for j in 0..2000u32 {
        let jf = j as f64;
        let log_w = -half + jf * half.ln() - ln_gamma(jf + 1.0);
        let w = log_w.exp();
        total += w * central(df + 2.0 * jf);
        mass += w;
        if jf > half && 1.0 - mass < 1e-14 {
            break;
        }
    }
    total
}

/// Liu, Tang & Zhang (2009) moment-matching approximation for a mixture of chi-squares.
pub fn liu_pvalue(q: f64, moments: &KernelMoments) -> Result<f64, KernelError> {
    let [c1, c2, c3, c4] = moments.traces;
    if !(c2 > 0.0) || !(c3 > 0.0) {
        return Err(KernelError::Degenerate(
            "kernel moments are not positive".to_string(),
        ));
    }
    let mu_q = c1;
    let sigma_q = (2.0 * c2).sqrt();
    let s1 = c3 / c2.powf(1.5);
    let s2 = c4 / (c2 * c2);

    let (a, delta, l) = if s1 * s1 > s2 {
        let a = 1.0 / (s1 - (s1 * s1 - s2).sqrt());
        let delta = s1 * a.powi(3) - a * a;
        (a, delta, a * a - 2.0 * delta)
    } else {
        let a = 1.0 / s1;
        (a, 0.0, a * a)
    };

    let mu_x = l + delta;
    let sigma_x = std::f64::consts::SQRT_2 * a;
    let q_norm = (q - mu_q) / sigma_q * sigma_x + mu_x;
    let p = noncentral_chi_square_sf(q_norm, l, delta);
    if !p.is_finite() {
        return Err(KernelError::Degenerate(format!(
            "non-finite p-value (df={:.3}, ncp={:.3})",
            l, delta
        )));
    }
    Ok(p.clamp(0.0, 1.0))
}
