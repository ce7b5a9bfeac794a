//! Grouped association testing
//!
//! Loads a phenotype table and a wide genotype table, groups variants by the
//! chosen column and runs one test method (for example
//! `"LinRegBurden --alternative 2 -p 1000 --adaptive 0.05"`) on every group.

use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use variant_assoc_rust::{
    association::{run_grouped_tests, RunOptions},
    io::{build_groups, check_overwrite, load_genotypes, load_phenotypes, write_results, write_summary},
    MethodError, Registry,
};

#[derive(Parser, Debug)]
#[command(
    name = "associate",
    version,
    about = "Runs grouped genotype-phenotype association tests"
)]
struct Cli {
    /// Path to the tab-separated phenotype file
    #[arg(long, required = true)]
    pheno_file: PathBuf,

    /// Column name in the phenotype file for sample IDs
    #[arg(long, default_value = "sample_name")]
    sample_id_col: String,

    /// Column name in the phenotype file for the trait
    #[arg(long, required = true)]
    trait_name: String,

    /// Covariate columns, comma-separated
    #[arg(long, value_delimiter = ',')]
    covariates: Vec<String>,

    /// Path to the wide genotype table (one row per variant, one column per sample)
    #[arg(long, required = true)]
    geno_file: PathBuf,

    /// Column name in the genotype file for variant IDs
    #[arg(long, default_value = "variant_id")]
    variant_id_col: String,

    /// Column in the genotype file defining variant groups (e.g. gene name)
    #[arg(long, required = true)]
    group_by: String,

    /// Test method and its arguments, e.g. "LinRegBurden -q1 0.05 -p 1000"
    #[arg(long, required = true, allow_hyphen_values = true)]
    method: String,

    /// Global random seed; each group derives its own stream from it
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Number of threads to use (0 = all cores)
    #[arg(long, default_value_t = 0)]
    n_threads: usize,

    /// Path for the output results file (gzipped when it ends with .gz)
    #[arg(long, default_value = "associate.results.txt.gz")]
    output_file: PathBuf,

    /// Overwrite existing output files
    #[arg(long)]
    force: bool,

    /// Optional one-row TSV with succeeded / not applicable / failed counts
    #[arg(long)]
    summary_file: Option<PathBuf>,

    /// Stop dispatching new groups after this many seconds
    #[arg(long)]
    time_budget_secs: Option<u64>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    // Resolve the method before touching any data
    let method = match Registry::builtin().build(&cli.method) {
        Ok(method) => method,
        Err(MethodError::HelpRequested(help)) => {
            println!("{}", help);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    // Refuse to clobber outputs before any group is computed
    check_overwrite(&cli.output_file, cli.force)?;
    if let Some(path) = &cli.summary_file {
        check_overwrite(path, cli.force)?;
    }

    log::info!("Starting association tests for trait {}", cli.trait_name);
    log::info!("Method: {}", cli.method);

    // Set thread pool
    rayon::ThreadPoolBuilder::new()
        .num_threads(cli.n_threads)
        .build_global()?;
    log::info!("Using {} threads", rayon::current_num_threads());

    let phenotypes = load_phenotypes(&cli.pheno_file, &cli.sample_id_col, &cli.trait_name, &cli.covariates)?;
    let genotypes = load_genotypes(&cli.geno_file, &cli.variant_id_col, &cli.group_by)?;
    let groups = build_groups(&phenotypes, &genotypes)?;

    let cancel = Arc::new(AtomicBool::new(false));
    let options = RunOptions {
        seed: cli.seed,
        cancel: Arc::clone(&cancel),
        time_budget: cli.time_budget_secs.map(Duration::from_secs),
    };
    let report = run_grouped_tests(&method, groups, &options);
    if cancel.load(Ordering::Relaxed) {
        log::warn!(
            "Run stopped early; first undispatched groups: {:?}",
            report.skipped.iter().take(5).collect::<Vec<_>>()
        );
    }

    write_results(&cli.output_file, cli.force, &method, &report.results)?;
    if let Some(path) = &cli.summary_file {
        write_summary(path, cli.force, &report.summary)?;
        log::info!("Run summary written to {:?}", path);
    }

    log::info!(
        "Done: {} succeeded, {} not applicable, {} failed, {} not dispatched",
        report.summary.succeeded,
        report.summary.not_applicable,
        report.summary.failed,
        report.summary.not_dispatched
    );
    Ok(())
}
