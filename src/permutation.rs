//! Module implementing the permutation engine.
//!
//! The observed statistic is computed once on the unpermuted context; the
//! variable part of the pipeline is then re-applied to permuted copies until
//! the requested count is exhausted or the adaptive rule decides the
//! empirical p-value is definitively above the requested threshold.
use crate::actions::keys;
use crate::data::{DataContext, DataError};
use crate::pipeline::{ActionError, ActionFailure, Pipeline};
use crate::regression::fit_linear;
use crate::Statistic;
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

/// One-sided 99.9% normal quantile used for the adaptive lower bound.
const ADAPTIVE_Z: f64 = 3.090232;
pub const DEFAULT_CHECKPOINT: usize = 100;

/// What gets shuffled between permutations.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermuteBy {
    /// Genotype rows (and anything collapsed from them).
    X,
    /// Phenotype labels.
    Y,
    /// Residuals of the covariate-only fit, added back to its fitted values.
    R,
}

/// When a permuted statistic counts as at least as extreme as the observed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Greater,
    AbsGreater,
}

impl Comparison {
    pub fn exceeds(&self, permuted: f64, observed: f64) -> bool {
        match self {
            Comparison::Greater => permuted >= observed,
            Comparison::AbsGreater => permuted.abs() >= observed.abs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PermutationConfig {
    pub max_permutations: usize,
    pub permute_by: PermuteBy,
    pub adaptive: Option<f64>,
    pub checkpoint: usize,
    pub comparison: Comparison,
    /// Name of the statistic compared across permutations.
    pub statistic: String,
}

impl PermutationConfig {
    pub fn new(max_permutations: usize, permute_by: PermuteBy, comparison: Comparison) -> Self {
        PermutationConfig {
            max_permutations,
            permute_by,
            adaptive: None,
            checkpoint: DEFAULT_CHECKPOINT,
            comparison,
            statistic: keys::STATISTIC.to_string(),
        }
    }

    fn adaptive_stop(&self) -> Option<AdaptiveStop> {
        self.adaptive.map(|threshold| AdaptiveStop {
            threshold,
            checkpoint: self.checkpoint,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermutationState {
    Idle,
    Running,
    Converged,
    Exhausted,
    Failed,
}

impl PermutationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermutationState::Idle => "idle",
            PermutationState::Running => "running",
            PermutationState::Converged => "converged",
            PermutationState::Exhausted => "exhausted",
            PermutationState::Failed => "failed",
        }
    }
}

/// Add-one empirical p-value for `exceed_count` exceedances in `performed` permutations.
pub fn empirical_pvalue(exceed_count: usize, performed: usize) -> f64 {
    (exceed_count as f64 + 1.0) / (performed as f64 + 1.0)
}

/// Stops once the lower confidence bound of the running p-value estimate
/// lies above `threshold`, evaluated only every `checkpoint` permutations.
///
/// The bound is a one-sided 99.9% Wald (normal approximation) interval
/// around the add-one estimate `p = (k+1)/(n+1)`:
/// `p - 3.090232 * sqrt(p (1 - p) / (n + 1))`. Only the "p-value is
/// definitively above the threshold" direction ends a run early.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveStop {
    pub threshold: f64,
    pub checkpoint: usize,
}

impl AdaptiveStop {
    pub fn is_checkpoint(&self, performed: usize) -> bool {
        self.checkpoint > 0 && performed > 0 && performed % self.checkpoint == 0
    }

    pub fn lower_bound(exceed_count: usize, performed: usize) -> f64 {
        let p = empirical_pvalue(exceed_count, performed);
        let sd = (p * (1.0 - p) / (performed as f64 + 1.0)).sqrt();
        p - ADAPTIVE_Z * sd
    }

    pub fn should_stop(&self, exceed_count: usize, performed: usize) -> bool {
        performed > 0 && Self::lower_bound(exceed_count, performed) > self.threshold
    }
}

/// The counting state machine behind a permutation run.
#[derive(Debug, Clone)]
pub struct PermutationTracker {
    state: PermutationState,
    observed: f64,
    performed: usize,
    exceed_count: usize,
    max_permutations: usize,
    comparison: Comparison,
    adaptive: Option<AdaptiveStop>,
}

impl PermutationTracker {
    pub fn new(max_permutations: usize, comparison: Comparison, adaptive: Option<AdaptiveStop>) -> Self {
        PermutationTracker {
            state: PermutationState::Idle,
            observed: f64::NAN,
            performed: 0,
            exceed_count: 0,
            max_permutations,
            comparison,
            adaptive,
        }
    }

    /// Idle -> Running with the observed statistic as the comparison threshold.
    pub fn start(&mut self, observed: f64) {
        if self.state != PermutationState::Idle {
            return;
        }
        self.observed = observed;
        self.state = if self.max_permutations == 0 {
            PermutationState::Exhausted
        } else {
            PermutationState::Running
        };
    }

    /// Counts one permuted statistic and returns the resulting state.
    pub fn record(&mut self, permuted: f64) -> PermutationState {
        if self.state != PermutationState::Running {
            return self.state;
        }
        self.performed += 1;
        if self.comparison.exceeds(permuted, self.observed) {
            self.exceed_count += 1;
        }
        if let Some(stop) = self.adaptive {
            if stop.is_checkpoint(self.performed) && stop.should_stop(self.exceed_count, self.performed) {
                self.state = PermutationState::Converged;
                return self.state;
            }
        }
        if self.performed >= self.max_permutations {
            self.state = PermutationState::Exhausted;
        }
        self.state
    }

    pub fn fail(&mut self) {
        self.state = PermutationState::Failed;
    }

    pub fn state(&self) -> PermutationState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == PermutationState::Running
    }

    pub fn observed(&self) -> f64 {
        self.observed
    }

    pub fn performed(&self) -> usize {
        self.performed
    }

    pub fn exceed_count(&self) -> usize {
        self.exceed_count
    }

    pub fn pvalue(&self) -> f64 {
        empirical_pvalue(self.exceed_count, self.performed)
    }
}

#[derive(Debug, Clone)]
pub struct PermutationOutcome {
    pub state: PermutationState,
    pub observed: f64,
    pub performed: usize,
    pub exceed_count: usize,
    pub pvalue: f64,
    /// The failure that stopped the run early, if any. Counts up to that point are kept.
    pub error: Option<ActionError>,
}

pub struct PermutationEngine<'a> {
    pipeline: &'a Pipeline,
    config: &'a PermutationConfig,
}

fn record_outcome(ctx: &mut DataContext, tracker: &PermutationTracker) -> Result<(), DataError> {
    ctx.record(keys::PVALUE, tracker.pvalue())?;
    ctx.record(keys::NUM_PERMUTATIONS, tracker.performed() as f64)?;
    ctx.record(keys::EXCEED_COUNT, tracker.exceed_count() as f64)?;
    ctx.record(
        keys::PERMUTATION_STATE,
        Statistic::Label(tracker.state().as_str().to_string()),
    )
}

fn engine_error(action: &str, failure: ActionFailure) -> ActionError {
    ActionError {
        action: action.to_string(),
        failure,
    }
}

impl<'a> PermutationEngine<'a> {
    pub fn new(pipeline: &'a Pipeline, config: &'a PermutationConfig) -> Self {
        PermutationEngine { pipeline, config }
    }

    fn statistic_of(&self, ctx: &DataContext) -> Result<f64, ActionError> {
        ctx.statistics().scalar(&self.config.statistic).ok_or_else(|| {
            engine_error(
                "Permutation",
                ActionFailure::Computation(format!(
                    "pipeline did not produce statistic '{}'",
                    self.config.statistic
                )),
            )
        })
    }

    /// Runs the pipeline on `ctx` and its permutations.
    ///
    /// A failure while computing the observed statistic is returned as an
    /// error. A failure inside a permutation step ends the run in the `Failed`
    /// state and is reported in the outcome alongside the partial counts.
    /// On return `ctx` holds the observed statistics plus the empirical
    /// p-value, permutation count and final state.
    pub fn run(&self, ctx: &mut DataContext, rng: &mut StdRng) -> Result<PermutationOutcome, ActionError> {
        self.pipeline.apply_invariant(ctx)?;

        let mut observed_ctx = ctx.clone();
        self.pipeline.apply_variable(&mut observed_ctx)?;
        let observed = self.statistic_of(&observed_ctx)?;
        if !observed.is_finite() {
            return Err(engine_error(
                "Permutation",
                ActionFailure::DegenerateInput(format!("observed statistic is {}", observed)),
            ));
        }

        // Freedman-Lane: permute residuals of the covariate-only model
        let residual_model = match self.config.permute_by {
            PermuteBy::R => {
                let fit = fit_linear(&ctx.design_matrix(false), ctx.phenotype(), None)
                    .map_err(|e| engine_error("PermuteResiduals", e.into()))?;
                Some((fit.fitted, fit.residuals))
            }
            _ => None,
        };

        let mut tracker = PermutationTracker::new(
            self.config.max_permutations,
            self.config.comparison,
            self.config.adaptive_stop(),
        );
        tracker.start(observed);
        log::debug!(
            "[{}] observed {} = {:.6}; up to {} permutations by {:?}",
            ctx.group_key(),
            self.config.statistic,
            observed,
            self.config.max_permutations,
            self.config.permute_by
        );

        let mut order: Vec<usize> = (0..ctx.n_samples()).collect();
        let mut error = None;
        while tracker.is_running() {
            order.shuffle(rng);
            let mut permuted = ctx.clone();
            match (&self.config.permute_by, &residual_model) {
                (PermuteBy::X, _) => permuted.permute_genotype_rows(&order),
                (PermuteBy::R, Some((fitted, residuals))) => {
                    permuted.phenotype = fitted + &Array1::from_iter(order.iter().map(|&i| residuals[i]));
                }
                _ => permuted.permute_phenotype(&order),
            }

            let step = self
                .pipeline
                .apply_variable(&mut permuted)
                .and_then(|_| self.statistic_of(&permuted));
            match step {
                Ok(statistic) => {
                    log::trace!(
                        "[{}] permutation {}: {:.6}",
                        ctx.group_key(),
                        tracker.performed() + 1,
                        statistic
                    );
                    tracker.record(statistic);
                }
                Err(e) => {
                    log::warn!(
                        "[{}] permutation {} failed: {}",
                        ctx.group_key(),
                        tracker.performed() + 1,
                        e
                    );
                    tracker.fail();
                    error = Some(e);
                }
            }
        }

        log::debug!(
            "[{}] permutation {} after {} permutations ({} exceedances)",
            ctx.group_key(),
            tracker.state().as_str(),
            tracker.performed(),
            tracker.exceed_count()
        );

        *ctx = observed_ctx;
        record_outcome(ctx, &tracker).map_err(|e| engine_error("Permutation", e.into()))?;

        Ok(PermutationOutcome {
            state: tracker.state(),
            observed,
            performed: tracker.performed(),
            exceed_count: tracker.exceed_count(),
            pvalue: tracker.pvalue(),
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{Action, CallbackAction};
    use crate::TraitType;
    use approx::assert_relative_eq;
    use ndarray::Array2;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn burden_context(effect: f64) -> DataContext {
        let n = 60;
        let genotypes = Array2::from_shape_fn((n, 3), |(i, j)| if (i + j) % 4 == 0 { 1.0 } else { 0.0 });
        let phenotype = Array1::from_shape_fn(n, |i| {
            let burden: f64 = genotypes.row(i).sum();
            effect * burden + (i as f64 * 0.731).sin()
        });
        DataContext::new("GENE", genotypes, phenotype, Array2::zeros((n, 0))).unwrap()
    }

    fn burden_pipeline() -> Pipeline {
        Pipeline::with_invariant(
            vec![Action::SetMaf, Action::ImputeMissing, Action::CollapseSum],
            vec![Action::Regress { trait_type: TraitType::Quantitative }],
        )
    }

    #[test]
    fn empirical_pvalue_is_add_one() {
        assert_relative_eq!(empirical_pvalue(3, 9), 0.4);
        assert_eq!(empirical_pvalue(0, 0), 1.0);
        assert!(empirical_pvalue(0, 1000) > 0.0);
    }

    #[test]
    fn tracker_exhausts_requested_count() {
        let mut tracker = PermutationTracker::new(5, Comparison::Greater, None);
        assert_eq!(tracker.state(), PermutationState::Idle);
        tracker.start(1.0);
        for _ in 0..5 {
            tracker.record(2.0);
        }
        assert_eq!(tracker.state(), PermutationState::Exhausted);
        assert_eq!(tracker.record(2.0), PermutationState::Exhausted);
        assert_eq!(tracker.performed(), 5);
        assert_eq!(tracker.pvalue(), 1.0);
    }

    #[test]
    fn absolute_comparison_counts_both_tails() {
        assert!(Comparison::AbsGreater.exceeds(-3.0, 2.0));
        assert!(!Comparison::Greater.exceeds(-3.0, 2.0));
        assert!(Comparison::Greater.exceeds(2.0, 2.0));
    }

    #[test]
    fn adaptive_stop_only_at_checkpoints() {
        let stop = AdaptiveStop { threshold: 0.05, checkpoint: 10 };
        let mut tracker = PermutationTracker::new(1000, Comparison::Greater, Some(stop));
        tracker.start(0.0);
        for i in 1..=10 {
            let state = tracker.record(1.0);
            if i < 10 {
                assert_eq!(state, PermutationState::Running);
            }
        }
        assert_eq!(tracker.state(), PermutationState::Converged);
        assert_eq!(tracker.performed(), 10);
        assert!(stop.should_stop(tracker.exceed_count(), tracker.performed()));
    }

    #[test]
    fn adaptive_bound_is_wald_interval_on_add_one_estimate() {
        let p: f64 = 21.0 / 101.0;
        let expected = p - 3.090232 * (p * (1.0 - p) / 101.0).sqrt();
        assert_relative_eq!(AdaptiveStop::lower_bound(20, 100), expected, epsilon = 1e-15);
        let stop = AdaptiveStop { threshold: 0.05, checkpoint: 100 };
        assert!(stop.should_stop(20, 100));
        assert!(!stop.should_stop(4, 100));
    }

    #[test]
    fn adaptive_keeps_going_for_small_pvalues() {
        let stop = AdaptiveStop { threshold: 0.05, checkpoint: 10 };
        let mut tracker = PermutationTracker::new(50, Comparison::Greater, Some(stop));
        tracker.start(10.0);
        while tracker.is_running() {
            tracker.record(0.0);
        }
        assert_eq!(tracker.state(), PermutationState::Exhausted);
        assert_eq!(tracker.performed(), 50);
    }

    #[test]
    fn strong_effect_gives_minimal_pvalue() {
        let pipeline = burden_pipeline();
        let config = PermutationConfig::new(200, PermuteBy::Y, Comparison::AbsGreater);
        let mut ctx = burden_context(5.0);
        let mut rng = StdRng::seed_from_u64(7);
        let outcome = PermutationEngine::new(&pipeline, &config).run(&mut ctx, &mut rng).unwrap();
        assert_eq!(outcome.state, PermutationState::Exhausted);
        assert_eq!(outcome.performed, 200);
        assert_eq!(outcome.exceed_count, 0);
        assert_relative_eq!(outcome.pvalue, 1.0 / 201.0);
        assert_eq!(ctx.statistics().scalar(keys::NUM_PERMUTATIONS), Some(200.0));
        assert!(ctx.statistics().contains(keys::BETA_X));
    }

    #[test]
    fn same_seed_reproduces_counts_for_every_scheme() {
        let pipeline = burden_pipeline();
        for scheme in [PermuteBy::X, PermuteBy::Y, PermuteBy::R] {
            let config = PermutationConfig::new(150, scheme, Comparison::AbsGreater);
            let run = |seed: u64| {
                let mut ctx = burden_context(0.3);
                let mut rng = StdRng::seed_from_u64(seed);
                PermutationEngine::new(&pipeline, &config).run(&mut ctx, &mut rng).unwrap()
            };
            let (a, b) = (run(11), run(11));
            assert_eq!(a.exceed_count, b.exceed_count);
            assert_eq!(a.pvalue, b.pvalue);
        }
    }

    #[test]
    fn failure_mid_run_keeps_partial_counts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let pipeline = Pipeline::new(vec![Action::Callback(CallbackAction::new("flaky", move |_| {
            let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if call == 6 {
                Err("numerical trouble".to_string())
            } else {
                Ok(vec![(keys::STATISTIC.to_string(), Statistic::Scalar(call as f64))])
            }
        }))]);
        let config = PermutationConfig::new(100, PermuteBy::Y, Comparison::Greater);
        let mut ctx = burden_context(0.0);
        let mut rng = StdRng::seed_from_u64(1);
        let outcome = PermutationEngine::new(&pipeline, &config).run(&mut ctx, &mut rng).unwrap();
        assert_eq!(outcome.state, PermutationState::Failed);
        assert_eq!(outcome.performed, 4);
        assert_eq!(outcome.exceed_count, 4);
        assert_eq!(outcome.error.unwrap().action, "flaky");
        assert_eq!(
            ctx.statistics().get(keys::PERMUTATION_STATE),
            Some(&Statistic::Label("failed".to_string()))
        );
    }
}
