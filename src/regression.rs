//! Module for fitting linear (OLS/WLS) and logistic (IRLS) regression models.
use crate::TraitType;
use ndarray::{Array1, Array2};
use statrs::distribution::{ContinuousCDF, Normal, StudentsT};
use thiserror::Error;

/// Convergence tolerance on the maximum absolute coefficient change.
pub const DEFAULT_TOLERANCE: f64 = 1e-6;
/// Iteration budget for the logistic fit.
pub const DEFAULT_MAX_ITER: usize = 100;

// Relative pivot below which a design column is treated as collinear.
const PIVOT_TOLERANCE: f64 = 1e-10;
const PROB_CLAMP: f64 = 1e-10;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegressionError {
    #[error("Degenerate input: {0}")]
    DegenerateInput(String),
    #[error("Fit did not converge after {iterations} iterations (max coefficient change {max_change:.3e})")]
    NonConvergence { iterations: usize, max_change: f64 },
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Invalid dimensions: {0}")]
    Dimensions(String),
}

/// Direction of the alternative hypothesis for the burden coefficient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alternative {
    /// One-sided, effect greater than zero (`--alternative 1`).
    Greater,
    /// Two-sided (`--alternative 2`).
    TwoSided,
}

impl Alternative {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Alternative::Greater),
            2 => Some(Alternative::TwoSided),
            _ => None,
        }
    }
}

/// Lower-triangular Cholesky factor of a symmetric positive-definite matrix.
#[derive(Debug, Clone)]
pub struct Cholesky {
    lower: Array2<f64>,
}

impl Cholesky {
    /// Factorises `a`; fails with `DegenerateInput` when `a` is (numerically) rank deficient.
    pub fn new(a: &Array2<f64>) -> Result<Self, RegressionError> {
        let p = a.nrows();
        if a.ncols() != p {
            return Err(RegressionError::Dimensions(format!(
                "cannot factorise a {} x {} matrix",
                p,
                a.ncols()
            )));
        }
        let mut lower = Array2::<f64>::zeros((p, p));
        for j in 0..p {
            let mut pivot = a[[j, j]];
            for k in 0..j {
                pivot -= lower[[j, k]] * lower[[j, k]];
            }
            if !pivot.is_finite() || pivot <= PIVOT_TOLERANCE * a[[j, j]].abs() || pivot <= 0.0 {
                return Err(RegressionError::DegenerateInput(format!(
                    "design matrix is rank deficient (column {} is collinear with earlier columns)",
                    j
                )));
            }
            let d = pivot.sqrt();
            lower[[j, j]] = d;
            for i in (j + 1)..p {
                let mut s = a[[i, j]];
                for k in 0..j {
                    s -= lower[[i, k]] * lower[[j, k]];
                }
                lower[[i, j]] = s / d;
            }
        }
        Ok(Cholesky { lower })
    }

    /// Solves `A x = b` by forward then backward substitution.
    pub fn solve(&self, b: &Array1<f64>) -> Array1<f64> {
        let p = self.lower.nrows();
        let mut z = Array1::<f64>::zeros(p);
        for i in 0..p {
            let mut s = b[i];
            for k in 0..i {
                s -= self.lower[[i, k]] * z[k];
            }
            z[i] = s / self.lower[[i, i]];
        }
        let mut x = Array1::<f64>::zeros(p);
        for i in (0..p).rev() {
            let mut s = z[i];
            for k in (i + 1)..p {
                s -= self.lower[[k, i]] * x[k];
            }
            x[i] = s / self.lower[[i, i]];
        }
        x
    }

    pub fn inverse(&self) -> Array2<f64> {
        let p = self.lower.nrows();
        let mut inv = Array2::zeros((p, p));
        for j in 0..p {
            let mut e = Array1::zeros(p);
            e[j] = 1.0;
            inv.column_mut(j).assign(&self.solve(&e));
        }
        inv
    }
}

/// Result of an ordinary or weighted least-squares fit.
#[derive(Debug, Clone)]
pub struct LinearFit {
    pub coefficients: Array1<f64>,
    pub coefficient_variances: Array1<f64>,
    /// `(X'WX)^-1`, not scaled by the residual variance.
    pub unscaled_covariance: Array2<f64>,
    pub fitted: Array1<f64>,
    pub residuals: Array1<f64>,
    pub residual_variance: f64,
    pub rss: f64,
    pub df: usize,
}

/// Result of a logistic fit by iteratively reweighted least squares.
#[derive(Debug, Clone)]
pub struct LogisticFit {
    pub coefficients: Array1<f64>,
    pub coefficient_variances: Array1<f64>,
    pub covariance: Array2<f64>,
    pub fitted: Array1<f64>,
    pub log_likelihood: f64,
    pub iterations: usize,
}

fn check_dimensions(x: &Array2<f64>, y: &Array1<f64>) -> Result<(), RegressionError> {
    if x.nrows() != y.len() {
        return Err(RegressionError::Dimensions(format!(
            "design has {} rows but response has {} values",
            x.nrows(),
            y.len()
        )));
    }
    if x.nrows() <= x.ncols() {
        return Err(RegressionError::DegenerateInput(format!(
            "{} samples are not enough to fit {} parameters",
            x.nrows(),
            x.ncols()
        )));
    }
    Ok(())
}

fn response_variance(y: &Array1<f64>) -> f64 {
    let mean = y.mean().unwrap_or(0.0);
    y.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / y.len() as f64
}

/// Fits `y = X beta` by least squares, weighted when `weights` is given.
pub fn fit_linear(
    x: &Array2<f64>,
    y: &Array1<f64>,
    weights: Option<&Array1<f64>>,
) -> Result<LinearFit, RegressionError> {
    check_dimensions(x, y)?;
    // relative to the raw second moment so small-scale responses stay usable
    let second_moment = y.iter().map(|v| v * v).sum::<f64>() / y.len() as f64;
    if response_variance(y) <= 1e3 * f64::EPSILON * second_moment {
        return Err(RegressionError::DegenerateInput(
            "response has zero variance".to_string(),
        ));
    }

    let n = x.nrows();
    let p = x.ncols();
    let sqrt_w = match weights {
        Some(w) => {
            if w.len() != n {
                return Err(RegressionError::Dimensions(format!(
                    "{} weights supplied for {} samples",
                    w.len(),
                    n
                )));
            }
            if w.iter().any(|&v| !v.is_finite() || v <= 0.0) {
                return Err(RegressionError::DegenerateInput(
                    "regression weights must be positive and finite".to_string(),
                ));
            }
            w.mapv(f64::sqrt)
        }
        None => Array1::ones(n),
    };

    let mut xw = x.clone();
    for (mut row, &s) in xw.rows_mut().into_iter().zip(sqrt_w.iter()) {
        row.mapv_inplace(|v| v * s);
    }
    let yw = y * &sqrt_w;

    let xtx = xw.t().dot(&xw);
    let xty = xw.t().dot(&yw);
    let chol = Cholesky::new(&xtx)?;
    let coefficients = chol.solve(&xty);
    let unscaled_covariance = chol.inverse();

    let fitted = x.dot(&coefficients);
    let residuals = y - &fitted;
    let weighted_resid = &residuals * &sqrt_w;
    let rss = weighted_resid.dot(&weighted_resid);
    let df = n - p;
    let residual_variance = rss / df as f64;

    if residual_variance <= f64::EPSILON * response_variance(y) {
        return Err(RegressionError::DegenerateInput(
            "model fits the response exactly (zero residual variance)".to_string(),
        ));
    }

    let coefficient_variances = unscaled_covariance.diag().mapv(|v| v * residual_variance);

    log::trace!(
        "Linear fit: n={}, p={}, rss={:.4e}, sigma2={:.4e}",
        n,
        p,
        rss,
        residual_variance
    );

    Ok(LinearFit {
        coefficients,
        coefficient_variances,
        unscaled_covariance,
        fitted,
        residuals,
        residual_variance,
        rss,
        df,
    })
}

fn sigmoid(eta: f64) -> f64 {
    (1.0 / (1.0 + (-eta).exp())).clamp(PROB_CLAMP, 1.0 - PROB_CLAMP)
}

/// Fits a logistic regression by Newton-Raphson / IRLS.
///
/// Iterates until the maximum absolute coefficient change falls below `tolerance`
/// or `max_iter` iterations are spent, in which case `NonConvergence` is returned.
pub fn fit_logistic(
    x: &Array2<f64>,
    y: &Array1<f64>,
    tolerance: f64,
    max_iter: usize,
) -> Result<LogisticFit, RegressionError> {
    check_dimensions(x, y)?;
    if let Some(bad) = y.iter().find(|&&v| v != 0.0 && v != 1.0) {
        return Err(RegressionError::InvalidResponse(format!(
            "logistic regression requires a 0/1 response, found {}",
            bad
        )));
    }
    let cases = y.sum();
    if cases == 0.0 || cases == y.len() as f64 {
        return Err(RegressionError::DegenerateInput(
            "binary response has a single class".to_string(),
        ));
    }

    let p = x.ncols();
    let mut beta = Array1::<f64>::zeros(p);
    let mut max_change = f64::INFINITY;

    for iteration in 1..=max_iter {
        let eta = x.dot(&beta);
        let mu = eta.mapv(sigmoid);
        let w = mu.mapv(|m| m * (1.0 - m));

        // Working response z = eta + (y - mu) / w
        let z = &eta + &((y - &mu) / &w);

        let mut xw = x.clone();
        for (mut row, &wi) in xw.rows_mut().into_iter().zip(w.iter()) {
            row.mapv_inplace(|v| v * wi);
        }
        let xtwx = x.t().dot(&xw);
        let xtwz = xw.t().dot(&z);

        let chol = Cholesky::new(&xtwx)?;
        let next = chol.solve(&xtwz);
        if next.iter().any(|v| !v.is_finite()) {
            return Err(RegressionError::NonConvergence {
                iterations: iteration,
                max_change: f64::INFINITY,
            });
        }

        max_change = next
            .iter()
            .zip(beta.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        beta = next;

        log::trace!("IRLS iteration {}: max change {:.3e}", iteration, max_change);

        if max_change < tolerance {
            let fitted = x.dot(&beta).mapv(sigmoid);
            let w = fitted.mapv(|m| m * (1.0 - m));
            let mut xw = x.clone();
            for (mut row, &wi) in xw.rows_mut().into_iter().zip(w.iter()) {
                row.mapv_inplace(|v| v * wi);
            }
            let covariance = Cholesky::new(&x.t().dot(&xw))?.inverse();
            let log_likelihood = y
                .iter()
                .zip(fitted.iter())
                .map(|(&yi, &mi)| yi * mi.ln() + (1.0 - yi) * (1.0 - mi).ln())
                .sum();
            return Ok(LogisticFit {
                coefficient_variances: covariance.diag().to_owned(),
                coefficients: beta,
                covariance,
                fitted,
                log_likelihood,
                iterations: iteration,
            });
        }
    }

    Err(RegressionError::NonConvergence {
        iterations: max_iter,
        max_change,
    })
}

/// Covariate-only fit used by the kernel statistics and residual permutation.
#[derive(Debug, Clone)]
pub struct NullModel {
    pub trait_type: TraitType,
    pub design: Array2<f64>,
    pub fitted: Array1<f64>,
    pub residuals: Array1<f64>,
    /// Per-sample working variance: 1 for quantitative, mu(1-mu) for binary.
    pub variance: Array1<f64>,
    /// Residual variance for quantitative traits, 1 for binary.
    pub scale: f64,
    /// `(X'VX)^-1`
    pub covariance: Array2<f64>,
}

pub fn fit_null(
    design: &Array2<f64>,
    y: &Array1<f64>,
    trait_type: TraitType,
) -> Result<NullModel, RegressionError> {
    match trait_type {
        TraitType::Quantitative => {
            let fit = fit_linear(design, y, None)?;
            Ok(NullModel {
                trait_type,
                design: design.clone(),
                variance: Array1::ones(y.len()),
                scale: fit.residual_variance,
                covariance: fit.unscaled_covariance,
                fitted: fit.fitted,
                residuals: fit.residuals,
            })
        }
        TraitType::Binary => {
            let fit = fit_logistic(design, y, DEFAULT_TOLERANCE, DEFAULT_MAX_ITER)?;
            let residuals = y - &fit.fitted;
            Ok(NullModel {
                trait_type,
                design: design.clone(),
                variance: fit.fitted.mapv(|m| m * (1.0 - m)),
                scale: 1.0,
                covariance: fit.covariance,
                fitted: fit.fitted,
                residuals,
            })
        }
    }
}

impl NullModel {
    /// Projection `P0 = V - V X (X'VX)^-1 X' V`, the null covariance of the residuals.
    pub fn projection(&self) -> Array2<f64> {
        let n = self.variance.len();
        let mut vx = self.design.clone();
        for (mut row, &v) in vx.rows_mut().into_iter().zip(self.variance.iter()) {
            row.mapv_inplace(|x| x * v);
        }
        let mut p0 = -vx.dot(&self.covariance).dot(&vx.t());
        for i in 0..n {
            p0[[i, i]] += self.variance[i];
        }
        p0
    }

    /// `Z' P0 Z` without forming the n x n projection:
    /// `Z'VZ - (Z'VX) (X'VX)^-1 (X'VZ)`.
    pub fn projected_gram(&self, z: &Array2<f64>) -> Result<Array2<f64>, RegressionError> {
        if z.nrows() != self.variance.len() {
            return Err(RegressionError::Dimensions(format!(
                "{} rows supplied for a null model of {} samples",
                z.nrows(),
                self.variance.len()
            )));
        }
        let mut vz = z.clone();
        for (mut row, &v) in vz.rows_mut().into_iter().zip(self.variance.iter()) {
            row.mapv_inplace(|x| x * v);
        }
        let xt_vz = self.design.t().dot(&vz);
        Ok(z.t().dot(&vz) - xt_vz.t().dot(&self.covariance).dot(&xt_vz))
    }

    /// Score `U = g'r / scale` and its null variance `V = g'P0 g / scale` for one predictor.
    pub fn score(&self, g: &Array1<f64>) -> Result<(f64, f64), RegressionError> {
        if g.len() != self.residuals.len() {
            return Err(RegressionError::Dimensions(format!(
                "predictor has {} values for {} samples",
                g.len(),
                self.residuals.len()
            )));
        }
        let column = g.view().insert_axis(ndarray::Axis(1)).to_owned();
        let v = self.projected_gram(&column)?[[0, 0]];
        Ok((g.dot(&self.residuals) / self.scale, v / self.scale))
    }
}

/// P-value of a t statistic with `df` degrees of freedom.
pub fn student_t_pvalue(t: f64, df: f64, alternative: Alternative) -> Result<f64, RegressionError> {
    let dist = StudentsT::new(0.0, 1.0, df)
        .map_err(|e| RegressionError::DegenerateInput(format!("invalid t distribution: {}", e)))?;
    Ok(match alternative {
        Alternative::Greater => dist.sf(t),
        Alternative::TwoSided => (2.0 * dist.sf(t.abs())).min(1.0),
    })
}

/// P-value of a standard normal (Wald) statistic.
pub fn gaussian_pvalue(z: f64, alternative: Alternative) -> Result<f64, RegressionError> {
    let normal = Normal::new(0.0, 1.0)
        .map_err(|e| RegressionError::DegenerateInput(format!("invalid normal distribution: {}", e)))?;
    Ok(match alternative {
        Alternative::Greater => normal.sf(z),
        Alternative::TwoSided => (2.0 * normal.sf(z.abs())).min(1.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{array, Array2};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn with_intercept(x: &[f64]) -> Array2<f64> {
        let mut d = Array2::ones((x.len(), 2));
        for (i, v) in x.iter().enumerate() {
            d[[i, 1]] = *v;
        }
        d
    }

    #[test]
    fn ols_recovers_known_line() {
        let x = with_intercept(&[0.0, 1.0, 2.0, 3.0, 4.0]);
        let y = array![1.1, 2.9, 5.2, 6.8, 9.1];
        let fit = fit_linear(&x, &y, None).unwrap();
        // Closed form: slope = Sxy / Sxx
        assert_relative_eq!(fit.coefficients[1], 19.9 / 10.0, epsilon = 1e-10);
        assert_relative_eq!(fit.coefficients[0], 5.02 - 2.0 * 1.99, epsilon = 1e-10);
        assert_eq!(fit.df, 3);
        let expected_var = fit.residual_variance / 10.0;
        assert_relative_eq!(fit.coefficient_variances[1], expected_var, epsilon = 1e-12);
    }

    #[test]
    fn unit_weights_match_ordinary_least_squares() {
        let x = with_intercept(&[0.5, 1.5, 2.0, 3.5, 4.0, 6.0]);
        let y = array![1.0, 2.5, 2.0, 4.5, 5.0, 6.5];
        let ols = fit_linear(&x, &y, None).unwrap();
        let wls = fit_linear(&x, &y, Some(&Array1::ones(6))).unwrap();
        assert_relative_eq!(ols.coefficients[1], wls.coefficients[1], epsilon = 1e-12);
        assert_relative_eq!(ols.rss, wls.rss, epsilon = 1e-12);
    }

    #[test]
    fn collinear_design_is_degenerate() {
        let mut x = with_intercept(&[1.0, 2.0, 3.0, 4.0]);
        x.column_mut(1).fill(3.0);
        let y = array![1.0, 2.0, 3.0, 5.0];
        let err = fit_linear(&x, &y, None).unwrap_err();
        assert!(matches!(err, RegressionError::DegenerateInput(_)));
    }

    #[test]
    fn constant_response_is_degenerate() {
        let x = with_intercept(&[1.0, 2.0, 3.0, 4.0]);
        let y = array![2.0, 2.0, 2.0, 2.0];
        assert!(matches!(
            fit_linear(&x, &y, None),
            Err(RegressionError::DegenerateInput(_))
        ));
    }

    #[test]
    fn logistic_fit_converges_and_finds_positive_effect() {
        let mut rng = StdRng::seed_from_u64(11);
        let n = 400;
        let xs: Vec<f64> = (0..n).map(|_| rng.gen_range(-2.0..2.0)).collect();
        let y = Array1::from_iter(xs.iter().map(|&v| {
            let p = 1.0 / (1.0 + (-(0.3 + 1.2 * v)).exp());
            if rng.gen::<f64>() < p { 1.0 } else { 0.0 }
        }));
        let x = with_intercept(&xs);
        let fit = fit_logistic(&x, &y, DEFAULT_TOLERANCE, DEFAULT_MAX_ITER).unwrap();
        assert!(fit.iterations < 20);
        assert!(fit.coefficients[1] > 0.6 && fit.coefficients[1] < 1.8);
        assert!(fit.log_likelihood < 0.0);
        assert!(fit.coefficient_variances.iter().all(|&v| v > 0.0));
    }

    #[test]
    fn perfect_separation_does_not_converge() {
        let x = with_intercept(&[-3.0, -2.0, -1.0, 1.0, 2.0, 3.0]);
        let y = array![0.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let err = fit_logistic(&x, &y, DEFAULT_TOLERANCE, DEFAULT_MAX_ITER).unwrap_err();
        assert!(matches!(err, RegressionError::NonConvergence { .. }), "{:?}", err);
    }

    #[test]
    fn logistic_rejects_non_binary_response() {
        let x = with_intercept(&[1.0, 2.0, 3.0, 4.0]);
        let y = array![0.0, 1.0, 2.0, 1.0];
        assert!(matches!(
            fit_logistic(&x, &y, DEFAULT_TOLERANCE, DEFAULT_MAX_ITER),
            Err(RegressionError::InvalidResponse(_))
        ));
    }

    #[test]
    fn pvalues_respect_alternative() {
        let two = gaussian_pvalue(1.959964, Alternative::TwoSided).unwrap();
        assert_relative_eq!(two, 0.05, epsilon = 1e-5);
        let one = gaussian_pvalue(1.644854, Alternative::Greater).unwrap();
        assert_relative_eq!(one, 0.05, epsilon = 1e-5);
        let neg = student_t_pvalue(-3.0, 10.0, Alternative::Greater).unwrap();
        assert!(neg > 0.99);
        let t2 = student_t_pvalue(2.228139, 10.0, Alternative::TwoSided).unwrap();
        assert_relative_eq!(t2, 0.05, epsilon = 1e-5);
    }

    #[test]
    fn null_projection_annihilates_design() {
        let x = with_intercept(&[0.2, 1.0, 1.7, 2.4, 3.3, 4.1]);
        let y = array![1.0, 1.4, 2.2, 2.1, 3.9, 4.0];
        let null = fit_null(&x, &y, TraitType::Quantitative).unwrap();
        let p0 = null.projection();
        let px = p0.dot(&x);
        assert!(px.iter().all(|v| v.abs() < 1e-10));
    }

    #[test]
    fn projected_gram_matches_dense_projection() {
        let x = with_intercept(&[0.2, 1.0, 1.7, 2.4, 3.3, 4.1, 0.9]);
        let y = array![0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0];
        let z = array![[1.0, 0.0], [0.0, 2.0], [1.0, 1.0], [0.0, 0.0], [2.0, 0.0], [0.0, 1.0], [1.0, 0.0]];
        for trait_type in [TraitType::Quantitative, TraitType::Binary] {
            let null = fit_null(&x, &y, trait_type).unwrap();
            let dense = z.t().dot(&null.projection()).dot(&z);
            let fast = null.projected_gram(&z).unwrap();
            for (a, b) in fast.iter().zip(dense.iter()) {
                assert_relative_eq!(*a, *b, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn score_is_defined_for_a_separating_predictor() {
        let x = Array2::ones((8, 1));
        let y = array![1.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0];
        // carriers are all cases, so a Wald fit would diverge
        let g = array![1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let null = fit_null(&x, &y, TraitType::Binary).unwrap();
        let (u, v) = null.score(&g).unwrap();
        assert_relative_eq!(u, 2.0 - 2.0 * 3.0 / 8.0, epsilon = 1e-8);
        assert!(v > 0.0);
        assert!(matches!(
            fit_logistic(&with_intercept(g.as_slice().unwrap()), &y, DEFAULT_TOLERANCE, DEFAULT_MAX_ITER),
            Err(RegressionError::NonConvergence { .. })
        ));
    }

    #[test]
    fn small_scale_response_is_not_degenerate() {
        let x = with_intercept(&[0.0, 1.0, 2.0, 3.0, 4.0]);
        let y = array![1.1, 2.9, 5.2, 6.8, 9.1].mapv(|v: f64| v * 1e-12);
        let fit = fit_linear(&x, &y, None).unwrap();
        assert_relative_eq!(fit.coefficients[1], 1.99e-12, max_relative = 1e-8);
    }
}
