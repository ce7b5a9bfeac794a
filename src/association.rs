//! Module for running a test method over many variant groups.
//!
//! Groups are independent: each gets its own data context and its own
//! seeded random stream, so results do not depend on worker scheduling.
//! Per-group errors become a status in that group's result record.
use crate::data::{DataContext, DataError};
use crate::methods::TestMethod;
use crate::permutation::PermutationEngine;
use crate::pipeline::ActionError;
use crate::Statistic;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Materialized inputs of one variant group.
#[derive(Debug, Clone)]
pub struct GroupData {
    pub group_key: String,
    pub sample_ids: Vec<String>,
    /// Samples x sites; NaN marks a missing genotype.
    pub genotypes: Array2<f64>,
    pub phenotype: Array1<f64>,
    pub covariates: Array2<f64>,
}

impl GroupData {
    pub fn into_context(self) -> Result<DataContext, DataError> {
        let ctx = DataContext::new(self.group_key, self.genotypes, self.phenotype, self.covariates)?;
        if self.sample_ids.is_empty() {
            Ok(ctx)
        } else {
            ctx.with_sample_ids(self.sample_ids)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GroupStatus {
    Ok,
    /// The test does not apply to this group (e.g. every site monomorphic).
    NotApplicable(String),
    Failed { action: String, message: String },
}

impl GroupStatus {
    pub fn label(&self) -> &'static str {
        match self {
            GroupStatus::Ok => "ok",
            GroupStatus::NotApplicable(_) => "not_applicable",
            GroupStatus::Failed { .. } => "failed",
        }
    }

    pub fn message(&self) -> Option<String> {
        match self {
            GroupStatus::Ok => None,
            GroupStatus::NotApplicable(reason) => Some(reason.clone()),
            GroupStatus::Failed { action, message } => Some(format!("{}: {}", action, message)),
        }
    }

    fn from_error(err: &ActionError) -> Self {
        if err.is_degenerate() {
            GroupStatus::NotApplicable(err.failure.to_string())
        } else {
            GroupStatus::Failed {
                action: err.action.clone(),
                message: err.failure.to_string(),
            }
        }
    }
}

/// One output record: values are aligned with the method's fields.
#[derive(Debug, Clone)]
pub struct GroupResult {
    pub group_key: String,
    pub status: GroupStatus,
    pub values: Vec<Option<Statistic>>,
}

impl GroupResult {
    pub fn value(&self, method: &TestMethod, statistic: &str) -> Option<&Statistic> {
        method
            .fields()
            .iter()
            .position(|f| f.statistic == statistic)
            .and_then(|i| self.values.get(i))
            .and_then(Option::as_ref)
    }
}

#[derive(serde::Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: usize,
    pub not_applicable: usize,
    pub failed: usize,
    pub not_dispatched: usize,
}

impl RunSummary {
    fn tally(&mut self, status: &GroupStatus) {
        match status {
            GroupStatus::Ok => self.succeeded += 1,
            GroupStatus::NotApplicable(_) => self.not_applicable += 1,
            GroupStatus::Failed { .. } => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.not_applicable + self.failed + self.not_dispatched
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub seed: u64,
    /// Set to stop dispatching new groups; groups already running finish.
    pub cancel: Arc<AtomicBool>,
    /// Wall-clock budget checked before each group is dispatched.
    pub time_budget: Option<Duration>,
}

impl RunOptions {
    pub fn new(seed: u64) -> Self {
        RunOptions {
            seed,
            cancel: Arc::new(AtomicBool::new(false)),
            time_budget: None,
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions::new(0)
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    /// Results of dispatched groups, in input order.
    pub results: Vec<GroupResult>,
    /// Keys of groups skipped by cancellation or the time budget.
    pub skipped: Vec<String>,
    pub summary: RunSummary,
}

/// Seed for group `index`: the SplitMix64 finaliser applied to the global seed and index.
pub fn group_seed(global_seed: u64, index: usize) -> u64 {
    let mut z = global_seed.wrapping_add((index as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Runs a method on one group, converting any failure into the result status.
pub fn run_group(method: &TestMethod, group: GroupData, rng: &mut StdRng) -> GroupResult {
    let group_key = group.group_key.clone();
    let mut ctx = match group.into_context() {
        Ok(ctx) => ctx,
        Err(e) => {
            log::warn!("[{}] cannot build data context: {}", group_key, e);
            return GroupResult {
                group_key,
                status: GroupStatus::Failed {
                    action: "DataContext".to_string(),
                    message: e.to_string(),
                },
                values: vec![None; method.fields().len()],
            };
        }
    };

    let status = match method.permutation() {
        Some(config) => match PermutationEngine::new(method.pipeline(), config).run(&mut ctx, rng) {
            Ok(outcome) => match outcome.error {
                None => GroupStatus::Ok,
                Some(err) => GroupStatus::Failed {
                    action: err.action,
                    message: format!("{} (after {} permutations)", err.failure, outcome.performed),
                },
            },
            Err(err) => GroupStatus::from_error(&err),
        },
        None => match method.pipeline().apply(&mut ctx) {
            Ok(()) => GroupStatus::Ok,
            Err(err) => GroupStatus::from_error(&err),
        },
    };

    match &status {
        GroupStatus::Ok => log::debug!("[{}] test completed", group_key),
        GroupStatus::NotApplicable(reason) => log::debug!("[{}] not applicable: {}", group_key, reason),
        GroupStatus::Failed { action, message } => {
            log::warn!("[{}] failed in {}: {}", group_key, action, message)
        }
    }

    let values = method
        .fields()
        .iter()
        .map(|field| ctx.statistics().get(&field.statistic).cloned())
        .collect();
    GroupResult {
        group_key,
        status,
        values,
    }
}

/// Runs a method over all groups in parallel on the current rayon pool.
pub fn run_grouped_tests(method: &TestMethod, groups: Vec<GroupData>, options: &RunOptions) -> RunReport {
    let n_groups = groups.len();
    log::info!("Testing {} groups with method {}", n_groups, method.name());
    if n_groups == 0 {
        log::warn!("No groups to test!");
    }

    let start = Instant::now();
    let outcomes: Vec<Result<GroupResult, String>> = groups
        .into_par_iter()
        .enumerate()
        .map(|(index, group)| {
            if options.cancel.load(Ordering::Relaxed) {
                return Err(group.group_key);
            }
            if let Some(budget) = options.time_budget {
                if start.elapsed() >= budget {
                    if !options.cancel.swap(true, Ordering::Relaxed) {
                        log::warn!("Time budget of {:?} exhausted; no further groups will be dispatched", budget);
                    }
                    return Err(group.group_key);
                }
            }
            let mut rng = StdRng::seed_from_u64(group_seed(options.seed, index));
            Ok(run_group(method, group, &mut rng))
        })
        .collect();

    let mut summary = RunSummary::default();
    let mut results = Vec::with_capacity(n_groups);
    let mut skipped = Vec::new();
    for outcome in outcomes {
        match outcome {
            Ok(result) => {
                summary.tally(&result.status);
                results.push(result);
            }
            Err(group_key) => {
                summary.not_dispatched += 1;
                skipped.push(group_key);
            }
        }
    }

    log::info!("Association testing complete in {:.2?}:", start.elapsed());
    log::info!("  Groups succeeded: {}", summary.succeeded);
    log::info!("  Groups not applicable: {}", summary.not_applicable);
    log::info!("  Groups failed: {}", summary.failed);
    if summary.not_dispatched > 0 {
        log::warn!("  Groups not dispatched: {}", summary.not_dispatched);
    }
    if n_groups > 0 && summary.succeeded == 0 {
        log::warn!("WARNING: No group produced a test result!");
        log::warn!("  This could be due to:");
        log::warn!("  1. No sites within the MAF limits of the method (-q1/-q2)");
        log::warn!("  2. Monomorphic or constant input in every group");
        log::warn!("  3. Misaligned sample IDs between phenotype and genotype files");
        log::warn!("  Enable RUST_LOG=debug to see per-group reasons");
    }

    RunReport {
        results,
        skipped,
        summary,
    }
}
