mod common;

use common::{orthogonalize_phenotype, synthetic_binary_group, synthetic_group};
use rand::rngs::StdRng;
use rand::SeedableRng;
use variant_assoc_rust::actions::keys;
use variant_assoc_rust::permutation::{empirical_pvalue, AdaptiveStop, PermutationEngine, PermutationState};
use variant_assoc_rust::{run_group, run_grouped_tests, GroupStatus, Registry, RunOptions, Statistic};

fn scalar(value: Option<&Statistic>) -> f64 {
    value.and_then(Statistic::as_scalar).unwrap_or(f64::NAN)
}

#[test]
fn burden_regression_with_adaptive_permutation() {
    let method = Registry::builtin()
        .build("LinRegBurden --alternative 2 -q1 0.5 -p 1000 --adaptive 0.05")
        .unwrap();
    let groups = vec![synthetic_group("GENE1", 50, 5, 1.0, 17)];

    let first = run_grouped_tests(&method, groups.clone(), &RunOptions::new(2024));
    let second = run_grouped_tests(&method, groups, &RunOptions::new(2024));

    let result = &first.results[0];
    assert_eq!(result.status, GroupStatus::Ok);
    let performed = scalar(result.value(&method, keys::NUM_PERMUTATIONS));
    let pvalue = scalar(result.value(&method, keys::PVALUE));
    assert!(performed >= 1.0 && performed <= 1000.0);
    assert!(pvalue > 0.0 && pvalue <= 1.0);
    assert_eq!(scalar(result.value(&method, keys::SAMPLE_SIZE)), 50.0);
    assert_eq!(scalar(result.value(&method, keys::NUM_VARIANTS)), 5.0);

    let again = &second.results[0];
    assert_eq!(scalar(again.value(&method, keys::PVALUE)), pvalue);
    assert_eq!(scalar(again.value(&method, keys::NUM_PERMUTATIONS)), performed);
}

#[test]
fn empirical_pvalue_matches_recorded_counts() {
    let method = Registry::builtin()
        .build("LinRegBurden --alternative 2 -q1 0.5 -p 300")
        .unwrap();
    let mut ctx = synthetic_group("GENE1", 50, 5, 0.2, 3).into_context().unwrap();
    let mut rng = StdRng::seed_from_u64(5);
    let outcome = PermutationEngine::new(method.pipeline(), method.permutation().unwrap())
        .run(&mut ctx, &mut rng)
        .unwrap();
    assert_eq!(outcome.state, PermutationState::Exhausted);
    assert_eq!(outcome.performed, 300);
    assert_eq!(outcome.pvalue, empirical_pvalue(outcome.exceed_count, outcome.performed));
    assert_eq!(ctx.statistics().scalar(keys::EXCEED_COUNT), Some(outcome.exceed_count as f64));
}

#[test]
fn adaptive_stopping_ends_early_under_the_null() {
    let method = Registry::builtin()
        .build("LinRegBurden --alternative 2 -q1 0.5 -p 5000 --adaptive 0.05 --checkpoint 100")
        .unwrap();
    let mut group = synthetic_group("NULL", 60, 5, 0.0, 11);
    orthogonalize_phenotype(&mut group);
    let mut ctx = group.into_context().unwrap();
    let mut rng = StdRng::seed_from_u64(1);
    let outcome = PermutationEngine::new(method.pipeline(), method.permutation().unwrap())
        .run(&mut ctx, &mut rng)
        .unwrap();

    assert_eq!(outcome.state, PermutationState::Converged);
    assert!(outcome.performed < 5000);
    assert_eq!(outcome.performed % 100, 0);
    // the stop decision can be re-derived from the recorded counts
    let stop = AdaptiveStop { threshold: 0.05, checkpoint: 100 };
    assert!(stop.should_stop(outcome.exceed_count, outcome.performed));
}

#[test]
fn permutation_pvalue_does_not_increase_with_effect_size() {
    let method = Registry::builtin()
        .build("LinRegBurden --alternative 2 -q1 0.5 -p 400")
        .unwrap();
    let pvalues: Vec<f64> = [0.0, 2.0, 8.0]
        .iter()
        .map(|&effect| {
            let group = synthetic_group("GENE", 50, 5, effect, 29);
            let result = run_group(&method, group, &mut StdRng::seed_from_u64(99));
            scalar(result.value(&method, keys::PVALUE))
        })
        .collect();
    assert!(pvalues.windows(2).all(|w| w[1] <= w[0]), "{:?}", pvalues);
    assert_eq!(pvalues[2], 1.0 / 401.0);
}

#[test]
fn analytic_runs_are_deterministic() {
    let method = Registry::builtin().build("LinRegBurden -q1 0.5").unwrap();
    let a = run_group(&method, synthetic_group("G", 50, 5, 0.7, 8), &mut StdRng::seed_from_u64(1));
    let b = run_group(&method, synthetic_group("G", 50, 5, 0.7, 8), &mut StdRng::seed_from_u64(2));
    assert_eq!(a.status, GroupStatus::Ok);
    assert_eq!(a.values, b.values);
    let pvalue = scalar(a.value(&method, keys::PVALUE));
    assert!(pvalue > 0.0 && pvalue <= 1.0);
}

#[test]
fn monomorphic_group_is_reported_not_applicable() {
    let method = Registry::builtin().build("LinRegBurden -q1 0.5 -p 100").unwrap();
    let mut group = synthetic_group("FLAT", 30, 4, 1.0, 2);
    group.genotypes.fill(0.0);
    let result = run_group(&method, group, &mut StdRng::seed_from_u64(1));
    match &result.status {
        GroupStatus::NotApplicable(reason) => assert!(reason.contains("monomorphic")),
        other => panic!("unexpected status {:?}", other),
    }
    assert!(result.value(&method, keys::STATISTIC).is_none());
}

#[test]
fn logistic_and_weighted_burden_methods_run() {
    for method_string in [
        "LogitRegBurden -q1 0.5",
        "LogitRegBurden -q1 0.5 --use_indicator --alternative 2",
        "WeightedBurdenBt -q1 0.5 --weight Browning -p 50",
        "WeightedBurdenBt -q1 0.5 --weight Browning_all",
    ] {
        let method = Registry::builtin().build(method_string).unwrap();
        let result = run_group(
            &method,
            synthetic_binary_group("CASES", 80, 5, 0.5, 21),
            &mut StdRng::seed_from_u64(4),
        );
        assert_eq!(result.status, GroupStatus::Ok, "{}", method_string);
        let pvalue = scalar(result.value(&method, keys::PVALUE));
        assert!(pvalue > 0.0 && pvalue <= 1.0, "{}: {}", method_string, pvalue);
    }
}

#[test]
fn permuted_binary_burden_handles_singleton_groups() {
    let n = 200;
    let groups: Vec<_> = (0..10u64)
        .map(|seed| {
            let mut group = synthetic_binary_group(&format!("SINGLE{}", seed), n, 4, 0.0, seed);
            // one carrier per site, so many permutations put every carrier on one side
            group.genotypes.fill(0.0);
            for j in 0..4 {
                group.genotypes[[(seed as usize * 7 + j * 13) % n, j]] = 1.0;
            }
            group.phenotype = ndarray::Array1::from_shape_fn(n, |i| (i % 2) as f64);
            group
        })
        .collect();

    for method_string in ["LogitRegBurden -p 200 --alternative 2", "WeightedBurdenBt --weight Browning -p 100"] {
        let method = Registry::builtin().build(method_string).unwrap();
        let report = run_grouped_tests(&method, groups.clone(), &RunOptions::new(77));
        assert_eq!(report.summary.succeeded, groups.len(), "{}", method_string);
        for result in &report.results {
            assert_eq!(result.status, GroupStatus::Ok, "{} {}", method_string, result.group_key);
            let pvalue = scalar(result.value(&method, keys::PVALUE));
            assert!(pvalue > 0.0 && pvalue <= 1.0, "{}: {}", method_string, pvalue);
        }
    }
}

#[test]
fn quantitative_weighted_and_variable_threshold_methods_run() {
    for method_string in [
        "WeightedBurdenQt -q1 0.5 --weight Browning_all",
        "WeightedBurdenQt -q1 0.5 -p 50 --permute_by R",
        "LinRegBurden -q1 0.5 --variable_thresholds -p 50 --alternative 2",
        "LinRegBurden -q1 0.5 -p 50 --permute_by X",
    ] {
        let method = Registry::builtin().build(method_string).unwrap();
        let result = run_group(
            &method,
            synthetic_group("QT", 60, 5, 1.0, 13),
            &mut StdRng::seed_from_u64(4),
        );
        assert_eq!(result.status, GroupStatus::Ok, "{}", method_string);
        let pvalue = scalar(result.value(&method, keys::PVALUE));
        assert!(pvalue > 0.0 && pvalue <= 1.0, "{}: {}", method_string, pvalue);
    }
}

#[test]
fn kernel_test_detects_strong_signal() {
    let method = Registry::builtin().build("SKAT quantitative -q1 0.5 -k linear").unwrap();
    let strong = run_group(&method, synthetic_group("K", 60, 5, 3.0, 6), &mut StdRng::seed_from_u64(1));
    assert_eq!(strong.status, GroupStatus::Ok);
    let p_strong = scalar(strong.value(&method, keys::PVALUE));
    assert!(p_strong > 0.0 && p_strong < 0.05, "{}", p_strong);
    assert!(scalar(strong.value(&method, keys::STATISTIC)) > 0.0);

    let ibs = Registry::builtin().build("SKAT --name SKAT disease -q1 0.5 -k IBS").unwrap();
    let result = run_group(&ibs, synthetic_binary_group("K", 80, 5, 0.5, 6), &mut StdRng::seed_from_u64(1));
    assert_eq!(result.status, GroupStatus::Ok);
    let pvalue = scalar(result.value(&ibs, keys::PVALUE));
    assert!(pvalue > 0.0 && pvalue <= 1.0);
}

#[test]
fn kernel_test_with_permutation() {
    let method = Registry::builtin()
        .build("SKAT quantitative -q1 0.5 -p 200 --adaptive 0.01")
        .unwrap();
    let result = run_group(&method, synthetic_group("K", 60, 5, 0.0, 9), &mut StdRng::seed_from_u64(1));
    assert_eq!(result.status, GroupStatus::Ok);
    let performed = scalar(result.value(&method, keys::NUM_PERMUTATIONS));
    assert!(performed <= 200.0);
}
