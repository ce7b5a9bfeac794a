//! Module defining the actions a test method strings together.
//!
//! Built-in actions are a closed set of variants; user extensions enter
//! through `Callback` (an in-process closure over a read-only context) or
//! `External` (a program fed the context as TSV on stdin).
use crate::data::DataContext;
use crate::kernel::{kernel_moments, kernel_score, liu_pvalue, KernelKind};
use crate::pipeline::ActionFailure;
use crate::regression::{
    fit_linear, fit_logistic, fit_null, gaussian_pvalue, student_t_pvalue, Alternative, NullModel,
    DEFAULT_MAX_ITER, DEFAULT_TOLERANCE,
};
use crate::{Statistic, TraitType};
use ndarray::{Array1, Array2, Axis};
use statrs::distribution::{Beta, Continuous};
use std::fmt;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Arc;

/// Names of the statistics recorded by built-in actions and the permutation engine.
pub mod keys {
    pub const SAMPLE_SIZE: &str = "sample_size";
    pub const NUM_VARIANTS: &str = "num_variants";
    pub const TOTAL_MAC: &str = "total_mac";
    pub const BETA_X: &str = "beta_x";
    pub const STD_ERROR: &str = "std_error";
    pub const STATISTIC: &str = "statistic";
    pub const DF: &str = "df";
    pub const PVALUE: &str = "pvalue";
    pub const MAF_THRESHOLD: &str = "maf_threshold";
    pub const NUM_PERMUTATIONS: &str = "num_permutations";
    pub const EXCEED_COUNT: &str = "exceed_count";
    pub const PERMUTATION_STATE: &str = "permutation_state";
}

// Slack when comparing computed frequencies against user thresholds
const MAF_EPSILON: f64 = 1e-12;

pub type CallbackFn = dyn Fn(&DataContext) -> Result<Vec<(String, Statistic)>, String> + Send + Sync;

/// An in-process extension action over a read-only snapshot of the context.
#[derive(Clone)]
pub struct CallbackAction {
    name: String,
    func: Arc<CallbackFn>,
}

impl CallbackAction {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&DataContext) -> Result<Vec<(String, Statistic)>, String> + Send + Sync + 'static,
    {
        CallbackAction {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for CallbackAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackAction").field("name", &self.name).finish()
    }
}

/// Delegates a statistic to an external program.
///
/// The program receives a header line (`y`, `c1..ck`, `g1..gm`) followed by
/// one tab-separated row per sample on stdin (`NA` for missing genotypes) and
/// must print `name<TAB>value [value ...]` lines on stdout.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalCommand {
    label: String,
    program: String,
    args: Vec<String>,
}

impl ExternalCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        let program = program.into();
        ExternalCommand {
            label: format!("External({})", program),
            program,
            args,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn render_input(ctx: &DataContext) -> String {
        let k = ctx.covariates.ncols();
        let m = ctx.n_sites();
        let mut header = vec!["y".to_string()];
        header.extend((1..=k).map(|j| format!("c{}", j)));
        header.extend((1..=m).map(|j| format!("g{}", j)));

        let mut out = header.join("\t");
        out.push('\n');
        for i in 0..ctx.n_samples() {
            let mut fields = vec![ctx.phenotype[i].to_string()];
            fields.extend(ctx.covariates.row(i).iter().map(|v| v.to_string()));
            fields.extend(ctx.genotypes.row(i).iter().zip(ctx.missing_mask.row(i).iter()).map(
                |(g, &missing)| if missing { "NA".to_string() } else { g.to_string() },
            ));
            out.push_str(&fields.join("\t"));
            out.push('\n');
        }
        out
    }

    fn parse_output(stdout: &str) -> Result<Vec<(String, Statistic)>, ActionFailure> {
        let mut results = Vec::new();
        for line in stdout.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let name = parts.next().unwrap_or_default().to_string();
            let values: Vec<f64> = parts
                .map(|v| v.parse::<f64>())
                .collect::<Result<_, _>>()
                .map_err(|e| ActionFailure::External(format!("unparseable output line '{}': {}", line, e)))?;
            let stat = match values.len() {
                0 => {
                    return Err(ActionFailure::External(format!(
                        "output line '{}' has no value",
                        line
                    )))
                }
                1 => Statistic::Scalar(values[0]),
                _ => Statistic::Vector(values),
            };
            results.push((name, stat));
        }
        Ok(results)
    }

    fn run(&self, ctx: &DataContext) -> Result<Vec<(String, Statistic)>, ActionFailure> {
        log::debug!("[{}] running external program {} {:?}", ctx.group_key, self.program, self.args);
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ActionFailure::External(format!("cannot start '{}': {}", self.program, e)))?;

        let input = Self::render_input(ctx);
        let stdin = child.stdin.take();
        // stdin is written on its own thread while stdout is drained
        let writer = std::thread::spawn(move || -> std::io::Result<()> {
            if let Some(mut stdin) = stdin {
                stdin.write_all(input.as_bytes())?;
            }
            Ok(())
        });

        let output = child
            .wait_with_output()
            .map_err(|e| ActionFailure::External(format!("'{}' did not finish: {}", self.program, e)))?;
        if let Ok(Err(e)) = writer.join() {
            log::trace!("external program closed stdin early: {}", e);
        }

        if !output.status.success() {
            return Err(ActionFailure::External(format!(
                "'{}' exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Self::parse_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// One unit of computation over a data context.
#[derive(Debug, Clone)]
pub enum Action {
    /// Computes per-site minor allele frequencies, recoding sites so the counted allele is the minor one.
    SetMaf,
    /// Keeps sites with `lower < maf <= upper`.
    FilterSites { lower: f64, upper: f64 },
    /// Replaces missing genotypes with the expected dosage `2 * maf`.
    ImputeMissing,
    /// Madsen-Browning weights, from controls only or from all samples.
    WeightBrowning { controls_only: bool },
    /// Beta density weights on MAF.
    WeightBeta { a: f64, b: f64 },
    /// Weighted sum of minor allele counts per sample.
    CollapseSum,
    /// Carrier indicator: 1 if the sample carries any minor allele.
    CollapseIndicator,
    /// Records sample size, site count and total minor allele count.
    Summarize,
    /// Regresses the phenotype on covariates plus the collapsed burden.
    Regress { trait_type: TraitType },
    /// Score statistic `U / sqrt(V)` of the burden under the covariate-only model.
    /// Stays defined when carriers fall entirely in one class.
    ScoreTest { trait_type: TraitType },
    /// Scans every observed MAF as a threshold and keeps the most extreme statistic.
    VariableThresholds { trait_type: TraitType, alternative: Alternative },
    /// Student-t (quantitative) or Gaussian (binary) p-value for the recorded statistic.
    AnalyticPvalue { trait_type: TraitType, alternative: Alternative },
    FitNullModel { trait_type: TraitType },
    KernelScore { kernel: KernelKind },
    KernelPvalue { kernel: KernelKind },
    External(ExternalCommand),
    Callback(CallbackAction),
}

impl Action {
    pub fn name(&self) -> &str {
        match self {
            Action::SetMaf => "SetMaf",
            Action::FilterSites { .. } => "FilterSites",
            Action::ImputeMissing => "ImputeMissing",
            Action::WeightBrowning { .. } => "WeightBrowning",
            Action::WeightBeta { .. } => "WeightBeta",
            Action::CollapseSum => "CollapseSum",
            Action::CollapseIndicator => "CollapseIndicator",
            Action::Summarize => "Summarize",
            Action::Regress { trait_type: TraitType::Quantitative } => "LinearRegression",
            Action::Regress { trait_type: TraitType::Binary } => "LogisticRegression",
            Action::ScoreTest { .. } => "ScoreTest",
            Action::VariableThresholds { .. } => "VariableThresholds",
            Action::AnalyticPvalue { trait_type: TraitType::Quantitative, .. } => "StudentPvalue",
            Action::AnalyticPvalue { trait_type: TraitType::Binary, .. } => "GaussianPvalue",
            Action::FitNullModel { .. } => "FitNullModel",
            Action::KernelScore { .. } => "KernelScore",
            Action::KernelPvalue { .. } => "KernelPvalue",
            Action::External(cmd) => cmd.label(),
            Action::Callback(cb) => cb.name(),
        }
    }

    pub fn apply(&self, ctx: &mut DataContext) -> Result<(), ActionFailure> {
        match self {
            Action::SetMaf => set_maf(ctx),
            Action::FilterSites { lower, upper } => filter_sites(ctx, *lower, *upper),
            Action::ImputeMissing => impute_missing(ctx),
            Action::WeightBrowning { controls_only } => weight_browning(ctx, *controls_only),
            Action::WeightBeta { a, b } => weight_beta(ctx, *a, *b),
            Action::CollapseSum => collapse_sum(ctx),
            Action::CollapseIndicator => collapse_indicator(ctx),
            Action::Summarize => summarize(ctx),
            Action::Regress { trait_type } => regress(ctx, *trait_type),
            Action::ScoreTest { trait_type } => score_test(ctx, *trait_type),
            Action::VariableThresholds { trait_type, alternative } => {
                variable_thresholds(ctx, *trait_type, *alternative)
            }
            Action::AnalyticPvalue { trait_type, alternative } => {
                analytic_pvalue(ctx, *trait_type, *alternative)
            }
            Action::FitNullModel { trait_type } => {
                let design = ctx.design_matrix(false);
                let null = fit_null(&design, &ctx.phenotype, *trait_type)?;
                ctx.null_model = Some(null);
                Ok(())
            }
            Action::KernelScore { kernel } => {
                require_imputed(ctx)?;
                let null = ctx.null_model.as_ref().ok_or_else(|| {
                    ActionFailure::Computation("no null model; FitNullModel must run first".to_string())
                })?;
                let q = kernel_score(null, &ctx.genotypes, &ctx.weights, *kernel)?;
                ctx.record(keys::STATISTIC, q)?;
                Ok(())
            }
            Action::KernelPvalue { kernel } => {
                let q = required_scalar(ctx, keys::STATISTIC)?;
                let null = ctx.null_model.as_ref().ok_or_else(|| {
                    ActionFailure::Computation("no null model; FitNullModel must run first".to_string())
                })?;
                let moments = kernel_moments(null, &ctx.genotypes, &ctx.weights, *kernel)?;
                let p = liu_pvalue(q, &moments)?;
                ctx.record(keys::PVALUE, p)?;
                Ok(())
            }
            Action::External(cmd) => {
                let results = cmd.run(ctx)?;
                record_all(ctx, results)
            }
            Action::Callback(cb) => {
                let results = (cb.func)(&*ctx).map_err(ActionFailure::Computation)?;
                record_all(ctx, results)
            }
        }
    }
}

fn record_all(ctx: &mut DataContext, results: Vec<(String, Statistic)>) -> Result<(), ActionFailure> {
    for (name, value) in results {
        ctx.record(&name, value)?;
    }
    Ok(())
}

fn required_scalar(ctx: &DataContext, name: &str) -> Result<f64, ActionFailure> {
    ctx.statistics
        .scalar(name)
        .ok_or_else(|| ActionFailure::Computation(format!("statistic '{}' has not been computed", name)))
}

fn required_maf(ctx: &DataContext) -> Result<&Array1<f64>, ActionFailure> {
    ctx.maf
        .as_ref()
        .ok_or_else(|| ActionFailure::Computation("MAF not set; SetMaf must run first".to_string()))
}

fn require_imputed(ctx: &DataContext) -> Result<(), ActionFailure> {
    if ctx.genotypes.iter().any(|g| g.is_nan()) {
        return Err(ActionFailure::Computation(
            "missing genotypes must be imputed first".to_string(),
        ));
    }
    Ok(())
}

fn set_maf(ctx: &mut DataContext) -> Result<(), ActionFailure> {
    let n_sites = ctx.n_sites();
    if n_sites == 0 {
        return Err(ActionFailure::DegenerateInput("group has no variant sites".to_string()));
    }

    let mut maf = Array1::<f64>::zeros(n_sites);
    let mut n_flipped = 0;
    for j in 0..n_sites {
        let mask = ctx.missing_mask.column(j);
        let mut column = ctx.genotypes.column_mut(j);
        let (sum, count) = column
            .iter()
            .zip(mask.iter())
            .filter(|(_, &missing)| !missing)
            .fold((0.0, 0usize), |(s, c), (g, _)| (s + g, c + 1));
        if count == 0 {
            continue;
        }
        let freq = sum / (2.0 * count as f64);
        if freq > 0.5 {
            for (g, &missing) in column.iter_mut().zip(mask.iter()) {
                if !missing {
                    *g = 2.0 - *g;
                }
            }
            maf[j] = 1.0 - freq;
            n_flipped += 1;
        } else {
            maf[j] = freq;
        }
    }

    if maf.iter().all(|&f| f <= 0.0) {
        return Err(ActionFailure::DegenerateInput(format!(
            "all {} sites are monomorphic",
            n_sites
        )));
    }
    log::trace!(
        "[{}] MAF set for {} sites ({} recoded to minor allele)",
        ctx.group_key,
        n_sites,
        n_flipped
    );
    ctx.maf = Some(maf);
    Ok(())
}

fn filter_sites(ctx: &mut DataContext, lower: f64, upper: f64) -> Result<(), ActionFailure> {
    let maf = required_maf(ctx)?;
    let keep: Vec<bool> = maf
        .iter()
        .map(|&f| f > lower && f <= upper + MAF_EPSILON)
        .collect();
    let n_kept = keep.iter().filter(|&&k| k).count();
    log::debug!(
        "[{}] {} / {} sites pass {} < MAF <= {}",
        ctx.group_key,
        n_kept,
        keep.len(),
        lower,
        upper
    );
    if n_kept == 0 {
        return Err(ActionFailure::DegenerateInput(format!(
            "no sites with {} < MAF <= {}",
            lower, upper
        )));
    }
    ctx.retain_sites(&keep);
    Ok(())
}

fn impute_missing(ctx: &mut DataContext) -> Result<(), ActionFailure> {
    for j in 0..ctx.n_sites() {
        let mask = ctx.missing_mask.column(j);
        if !mask.iter().any(|&m| m) {
            continue;
        }
        let fill = match ctx.maf.as_ref() {
            Some(maf) => 2.0 * maf[j],
            None => {
                let (sum, count) = ctx
                    .genotypes
                    .column(j)
                    .iter()
                    .zip(mask.iter())
                    .filter(|(_, &missing)| !missing)
                    .fold((0.0, 0usize), |(s, c), (g, _)| (s + g, c + 1));
                if count == 0 { 0.0 } else { sum / count as f64 }
            }
        };
        for (g, &missing) in ctx.genotypes.column_mut(j).iter_mut().zip(mask.iter()) {
            if missing {
                *g = fill;
            }
        }
    }
    Ok(())
}

fn is_binary(values: &Array1<f64>) -> bool {
    values.iter().all(|&v| v == 0.0 || v == 1.0)
}

fn weight_browning(ctx: &mut DataContext, controls_only: bool) -> Result<(), ActionFailure> {
    if controls_only && !is_binary(&ctx.phenotype) {
        return Err(ActionFailure::Computation(
            "Browning weights from controls require a 0/1 phenotype".to_string(),
        ));
    }
    let rows: Vec<usize> = (0..ctx.n_samples())
        .filter(|&i| !controls_only || ctx.phenotype[i] == 0.0)
        .collect();

    let mut weights = Array1::<f64>::zeros(ctx.n_sites());
    for j in 0..ctx.n_sites() {
        let (minor, genotyped) = rows
            .iter()
            .filter(|&&i| !ctx.missing_mask[[i, j]])
            .fold((0.0, 0usize), |(s, c), &i| (s + ctx.genotypes[[i, j]], c + 1));
        if genotyped == 0 {
            return Err(ActionFailure::DegenerateInput(format!(
                "no reference samples genotyped at site {}",
                j
            )));
        }
        let n = genotyped as f64;
        let q = (minor + 1.0) / (2.0 * n + 2.0);
        weights[j] = 1.0 / (n * q * (1.0 - q)).sqrt();
    }
    ctx.set_weights(weights)?;
    Ok(())
}

fn weight_beta(ctx: &mut DataContext, a: f64, b: f64) -> Result<(), ActionFailure> {
    let beta = Beta::new(a, b)
        .map_err(|e| ActionFailure::Computation(format!("invalid Beta({}, {}) weights: {}", a, b, e)))?;
    let weights = required_maf(ctx)?.mapv(|f| beta.pdf(f));
    ctx.set_weights(weights)?;
    Ok(())
}

fn collapse_sum(ctx: &mut DataContext) -> Result<(), ActionFailure> {
    require_imputed(ctx)?;
    let burden = ctx.genotypes.dot(&ctx.weights);
    ctx.set_predictors(burden.insert_axis(Axis(1)))?;
    Ok(())
}

fn collapse_indicator(ctx: &mut DataContext) -> Result<(), ActionFailure> {
    let carriers = Array1::from_iter(
        ctx.genotypes
            .rows()
            .into_iter()
            .zip(ctx.missing_mask.rows())
            .map(|(g, mask)| {
                let carrier = g.iter().zip(mask.iter()).any(|(&v, &missing)| !missing && v > 0.0);
                if carrier { 1.0 } else { 0.0 }
            }),
    );
    ctx.set_predictors(carriers.insert_axis(Axis(1)))?;
    Ok(())
}

fn summarize(ctx: &mut DataContext) -> Result<(), ActionFailure> {
    let total_mac: f64 = ctx
        .genotypes
        .iter()
        .zip(ctx.missing_mask.iter())
        .filter(|(_, &missing)| !missing)
        .map(|(g, _)| g)
        .sum();
    let n_samples = ctx.n_samples() as f64;
    let n_sites = ctx.n_sites() as f64;
    ctx.record(keys::SAMPLE_SIZE, n_samples)?;
    ctx.record(keys::NUM_VARIANTS, n_sites)?;
    ctx.record(keys::TOTAL_MAC, total_mac)?;
    Ok(())
}

struct BurdenFit {
    beta: f64,
    std_error: f64,
    statistic: f64,
    df: Option<f64>,
}

fn burden_fit(ctx: &DataContext, burden: &Array2<f64>, trait_type: TraitType) -> Result<BurdenFit, ActionFailure> {
    let base = ctx.design_matrix(false);
    let p = base.ncols();
    let mut x = Array2::zeros((ctx.n_samples(), p + burden.ncols()));
    x.slice_mut(ndarray::s![.., ..p]).assign(&base);
    x.slice_mut(ndarray::s![.., p..]).assign(burden);
    let col = x.ncols() - 1;

    let (beta, variance, df) = match trait_type {
        TraitType::Quantitative => {
            let fit = fit_linear(&x, &ctx.phenotype, None)?;
            (fit.coefficients[col], fit.coefficient_variances[col], Some(fit.df as f64))
        }
        TraitType::Binary => {
            let fit = fit_logistic(&x, &ctx.phenotype, DEFAULT_TOLERANCE, DEFAULT_MAX_ITER)?;
            (fit.coefficients[col], fit.coefficient_variances[col], None)
        }
    };
    let std_error = variance.sqrt();
    if !(std_error > 0.0) || !std_error.is_finite() || !beta.is_finite() {
        return Err(ActionFailure::DegenerateInput(format!(
            "burden coefficient is not estimable (beta={}, se={})",
            beta, std_error
        )));
    }
    Ok(BurdenFit {
        beta,
        std_error,
        statistic: beta / std_error,
        df,
    })
}

fn score_fit(null: &NullModel, burden: &Array1<f64>) -> Result<BurdenFit, ActionFailure> {
    let (u, v) = null.score(burden)?;
    let unadjusted = burden
        .iter()
        .zip(null.variance.iter())
        .map(|(b, w)| w * b * b)
        .sum::<f64>()
        / null.scale;
    if !v.is_finite() || v <= 1e-10 * unadjusted || !u.is_finite() {
        return Err(ActionFailure::DegenerateInput(
            "burden has no variance beyond the covariates".to_string(),
        ));
    }
    Ok(BurdenFit {
        beta: u / v,
        std_error: 1.0 / v.sqrt(),
        statistic: u / v.sqrt(),
        df: None,
    })
}

fn score_test(ctx: &mut DataContext, trait_type: TraitType) -> Result<(), ActionFailure> {
    let burden = ctx
        .predictors
        .as_ref()
        .ok_or_else(|| {
            ActionFailure::Computation("no burden predictor; a collapsing action must run first".to_string())
        })?
        .column(0)
        .to_owned();
    let null = fit_null(&ctx.design_matrix(false), &ctx.phenotype, trait_type)?;
    let fit = score_fit(&null, &burden)?;
    log::trace!(
        "[{}] burden score: U/V={:.4}, stat={:.4}",
        ctx.group_key,
        fit.beta,
        fit.statistic
    );
    ctx.record(keys::BETA_X, fit.beta)?;
    ctx.record(keys::STD_ERROR, fit.std_error)?;
    ctx.record(keys::STATISTIC, fit.statistic)?;
    Ok(())
}

fn regress(ctx: &mut DataContext, trait_type: TraitType) -> Result<(), ActionFailure> {
    let burden = ctx.predictors.as_ref().ok_or_else(|| {
        ActionFailure::Computation("no burden predictor; a collapsing action must run first".to_string())
    })?;
    let fit = burden_fit(ctx, burden, trait_type)?;
    log::trace!(
        "[{}] burden fit: beta={:.4}, se={:.4}, stat={:.4}",
        ctx.group_key,
        fit.beta,
        fit.std_error,
        fit.statistic
    );
    ctx.record(keys::BETA_X, fit.beta)?;
    ctx.record(keys::STD_ERROR, fit.std_error)?;
    ctx.record(keys::STATISTIC, fit.statistic)?;
    if let Some(df) = fit.df {
        ctx.record(keys::DF, df)?;
    }
    Ok(())
}

fn variable_thresholds(
    ctx: &mut DataContext,
    trait_type: TraitType,
    alternative: Alternative,
) -> Result<(), ActionFailure> {
    require_imputed(ctx)?;
    let maf = required_maf(ctx)?.clone();
    let mut thresholds: Vec<f64> = maf.iter().copied().filter(|&f| f > 0.0).collect();
    thresholds.sort_by(|a, b| a.total_cmp(b));
    thresholds.dedup_by(|a, b| (*a - *b).abs() <= MAF_EPSILON);

    // binary scans use the score statistic, which separation cannot break
    let null = match trait_type {
        TraitType::Binary => Some(fit_null(&ctx.design_matrix(false), &ctx.phenotype, trait_type)?),
        TraitType::Quantitative => None,
    };

    let mut best: Option<(f64, BurdenFit, f64)> = None;
    for &threshold in &thresholds {
        let site_weights = Array1::from_iter(
            maf.iter()
                .zip(ctx.weights.iter())
                .map(|(&f, &w)| if f <= threshold + MAF_EPSILON { w } else { 0.0 }),
        );
        let burden = ctx.genotypes.dot(&site_weights);
        let fit = match &null {
            Some(null) => score_fit(null, &burden),
            None => burden_fit(ctx, &burden.insert_axis(Axis(1)), trait_type),
        };
        match fit {
            Ok(fit) => {
                let score = match alternative {
                    Alternative::Greater => fit.statistic,
                    Alternative::TwoSided => fit.statistic.abs(),
                };
                if best.as_ref().map_or(true, |(s, _, _)| score > *s) {
                    best = Some((score, fit, threshold));
                }
            }
            Err(ActionFailure::DegenerateInput(reason)) => {
                log::trace!("[{}] threshold {} skipped: {}", ctx.group_key, threshold, reason);
            }
            Err(other) => return Err(other),
        }
    }

    let (score, fit, threshold) = best.ok_or_else(|| {
        ActionFailure::DegenerateInput("no MAF threshold produced a testable burden".to_string())
    })?;
    ctx.record(keys::BETA_X, fit.beta)?;
    ctx.record(keys::STD_ERROR, fit.std_error)?;
    ctx.record(keys::STATISTIC, score)?;
    ctx.record(keys::MAF_THRESHOLD, threshold)?;
    Ok(())
}

fn analytic_pvalue(
    ctx: &mut DataContext,
    trait_type: TraitType,
    alternative: Alternative,
) -> Result<(), ActionFailure> {
    let statistic = required_scalar(ctx, keys::STATISTIC)?;
    let p = match trait_type {
        TraitType::Quantitative => {
            let df = required_scalar(ctx, keys::DF)?;
            student_t_pvalue(statistic, df, alternative)?
        }
        TraitType::Binary => gaussian_pvalue(statistic, alternative)?,
    };
    ctx.record(keys::PVALUE, p)?;
    Ok(())
}
