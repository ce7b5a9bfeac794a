//! Module holding the per-group data context that actions mutate in place.
use crate::regression::NullModel;
use crate::Statistic;
use ndarray::{Array1, Array2, Axis};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("Invalid dimensions: {0}")]
    Dimensions(String),
    #[error("Non-finite {what} value for sample {row}")]
    NonFinite { what: &'static str, row: usize },
    #[error("Statistic '{0}' was already recorded in this run")]
    DuplicateStatistic(String),
}

/// Append-only map of named results for one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct Statistics {
    entries: BTreeMap<String, Statistic>,
}

impl Statistics {
    pub fn get(&self, name: &str) -> Option<&Statistic> {
        self.entries.get(name)
    }

    pub fn scalar(&self, name: &str) -> Option<f64> {
        self.entries.get(name).and_then(Statistic::as_scalar)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Statistic)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub(crate) fn insert(&mut self, name: &str, value: Statistic) -> Result<(), DataError> {
        if self.entries.contains_key(name) {
            return Err(DataError::DuplicateStatistic(name.to_string()));
        }
        self.entries.insert(name.to_string(), value);
        Ok(())
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// The mutable unit of work for one variant group.
///
/// Rows of `genotypes`, `missing_mask`, `covariates` and the length of
/// `phenotype` always equal the sample count; `weights` (and `maf`, once set)
/// always match the number of genotype columns.
#[derive(Debug, Clone)]
pub struct DataContext {
    pub(crate) group_key: String,
    pub(crate) sample_ids: Vec<String>,
    pub(crate) genotypes: Array2<f64>,
    pub(crate) missing_mask: Array2<bool>,
    pub(crate) phenotype: Array1<f64>,
    pub(crate) covariates: Array2<f64>,
    pub(crate) weights: Array1<f64>,
    pub(crate) maf: Option<Array1<f64>>,
    pub(crate) predictors: Option<Array2<f64>>,
    pub(crate) null_model: Option<NullModel>,
    pub(crate) statistics: Statistics,
}

impl DataContext {
    /// Builds a context from externally supplied matrices.
    /// Missing genotypes are encoded as NaN; phenotype and covariates must be finite.
    pub fn new(
        group_key: impl Into<String>,
        genotypes: Array2<f64>,
        phenotype: Array1<f64>,
        covariates: Array2<f64>,
    ) -> Result<Self, DataError> {
        let n_samples = phenotype.len();
        if genotypes.nrows() != n_samples {
            return Err(DataError::Dimensions(format!(
                "genotype matrix has {} rows but phenotype has {} samples",
                genotypes.nrows(),
                n_samples
            )));
        }
        // A covariate matrix with zero columns may still carry zero rows
        let covariates = if covariates.ncols() == 0 {
            Array2::zeros((n_samples, 0))
        } else {
            covariates
        };
        if covariates.nrows() != n_samples {
            return Err(DataError::Dimensions(format!(
                "covariate matrix has {} rows but phenotype has {} samples",
                covariates.nrows(),
                n_samples
            )));
        }
        if let Some(row) = phenotype.iter().position(|v| !v.is_finite()) {
            return Err(DataError::NonFinite { what: "phenotype", row });
        }
        for (row, values) in covariates.axis_iter(Axis(0)).enumerate() {
            if values.iter().any(|v| !v.is_finite()) {
                return Err(DataError::NonFinite { what: "covariate", row });
            }
        }

        let missing_mask = genotypes.mapv(f64::is_nan);
        let n_sites = genotypes.ncols();

        Ok(DataContext {
            group_key: group_key.into(),
            sample_ids: (0..n_samples).map(|i| format!("sample_{}", i + 1)).collect(),
            genotypes,
            missing_mask,
            phenotype,
            covariates,
            weights: Array1::ones(n_sites),
            maf: None,
            predictors: None,
            null_model: None,
            statistics: Statistics::default(),
        })
    }

    /// Attaches sample identifiers, used for diagnostics only.
    pub fn with_sample_ids(mut self, sample_ids: Vec<String>) -> Result<Self, DataError> {
        if sample_ids.len() != self.n_samples() {
            return Err(DataError::Dimensions(format!(
                "{} sample ids supplied for {} samples",
                sample_ids.len(),
                self.n_samples()
            )));
        }
        self.sample_ids = sample_ids;
        Ok(self)
    }

    pub fn group_key(&self) -> &str {
        &self.group_key
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn genotypes(&self) -> &Array2<f64> {
        &self.genotypes
    }

    pub fn missing_mask(&self) -> &Array2<bool> {
        &self.missing_mask
    }

    pub fn phenotype(&self) -> &Array1<f64> {
        &self.phenotype
    }

    pub fn covariates(&self) -> &Array2<f64> {
        &self.covariates
    }

    pub fn weights(&self) -> &Array1<f64> {
        &self.weights
    }

    pub fn maf(&self) -> Option<&Array1<f64>> {
        self.maf.as_ref()
    }

    pub fn predictors(&self) -> Option<&Array2<f64>> {
        self.predictors.as_ref()
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    pub fn n_samples(&self) -> usize {
        self.phenotype.len()
    }

    pub fn n_sites(&self) -> usize {
        self.genotypes.ncols()
    }

    /// Clears per-run results. Called at the start of every pipeline run.
    pub(crate) fn begin_run(&mut self) {
        self.statistics.clear();
    }

    pub(crate) fn record(&mut self, name: &str, value: impl Into<Statistic>) -> Result<(), DataError> {
        self.statistics.insert(name, value.into())
    }

    pub(crate) fn set_weights(&mut self, weights: Array1<f64>) -> Result<(), DataError> {
        if weights.len() != self.n_sites() {
            return Err(DataError::Dimensions(format!(
                "{} weights supplied for {} sites",
                weights.len(),
                self.n_sites()
            )));
        }
        self.weights = weights;
        Ok(())
    }

    pub(crate) fn set_predictors(&mut self, predictors: Array2<f64>) -> Result<(), DataError> {
        if predictors.nrows() != self.n_samples() {
            return Err(DataError::Dimensions(format!(
                "predictor matrix has {} rows for {} samples",
                predictors.nrows(),
                self.n_samples()
            )));
        }
        self.predictors = Some(predictors);
        Ok(())
    }

    /// Keeps only the genotype columns flagged in `keep`.
    pub(crate) fn retain_sites(&mut self, keep: &[bool]) {
        let indices: Vec<usize> = keep
            .iter()
            .enumerate()
            .filter(|(_, &k)| k)
            .map(|(i, _)| i)
            .collect();
        self.genotypes = self.genotypes.select(Axis(1), &indices);
        self.missing_mask = self.missing_mask.select(Axis(1), &indices);
        self.weights = self.weights.select(Axis(0), &indices);
        if let Some(maf) = self.maf.take() {
            self.maf = Some(maf.select(Axis(0), &indices));
        }
    }

    /// Reorders phenotype values by `order`; sample i receives the value of sample `order[i]`.
    pub(crate) fn permute_phenotype(&mut self, order: &[usize]) {
        self.phenotype = Array1::from_iter(order.iter().map(|&i| self.phenotype[i]));
    }

    /// Reorders the genotype-side rows (raw genotypes, mask and collapsed predictors).
    pub(crate) fn permute_genotype_rows(&mut self, order: &[usize]) {
        self.genotypes = self.genotypes.select(Axis(0), order);
        self.missing_mask = self.missing_mask.select(Axis(0), order);
        if let Some(predictors) = self.predictors.take() {
            self.predictors = Some(predictors.select(Axis(0), order));
        }
    }

    /// Design matrix `[1 | covariates]`, optionally followed by the predictor columns.
    pub fn design_matrix(&self, with_predictors: bool) -> Array2<f64> {
        let n = self.n_samples();
        let k = self.covariates.ncols();
        let m = if with_predictors {
            self.predictors.as_ref().map_or(0, |p| p.ncols())
        } else {
            0
        };
        let mut x = Array2::zeros((n, 1 + k + m));
        x.column_mut(0).fill(1.0);
        for j in 0..k {
            x.column_mut(1 + j).assign(&self.covariates.column(j));
        }
        if m > 0 {
            if let Some(predictors) = self.predictors.as_ref() {
                for j in 0..m {
                    x.column_mut(1 + k + j).assign(&predictors.column(j));
                }
            }
        }
        x
    }
}
