//! Module for the test method registry.
//!
//! A method string such as `"LinRegBurden --alternative 2 -p 1000"` is split
//! into a name and its own argument list. The name selects a constructor from
//! a read-only registry built once per process; the constructor parses the
//! arguments with a method-specific `clap` grammar and assembles the action
//! pipeline, the output fields and the optional permutation settings.
use crate::actions::{keys, Action, ExternalCommand};
use crate::kernel::KernelKind;
use crate::permutation::{Comparison, PermutationConfig, PermuteBy, DEFAULT_CHECKPOINT};
use crate::pipeline::Pipeline;
use crate::regression::Alternative;
use crate::TraitType;
use clap::error::ErrorKind;
use clap::{Args, Parser, ValueEnum};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MethodError {
    #[error("Unknown association test method '{0}'")]
    UnknownMethod(String),
    #[error("Failed to construct method '{name}': {reason}")]
    MethodConstruction { name: String, reason: String },
    #[error("Invalid argument for method {method}: {message}")]
    InvalidArgument { method: String, message: String },
    #[error("{0}")]
    HelpRequested(String),
}

/// Value type of an output field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Integer,
    Float,
    Text,
}

/// One output column: its header name and the statistic it is read from.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub column: String,
    pub statistic: String,
    pub kind: FieldType,
}

impl FieldSpec {
    pub fn new(statistic: &str, kind: FieldType, suffix: Option<&str>) -> Self {
        let column = match suffix {
            Some(suffix) if !suffix.is_empty() => format!("{}_{}", statistic, suffix),
            _ => statistic.to_string(),
        };
        FieldSpec {
            column,
            statistic: statistic.to_string(),
            kind,
        }
    }
}

/// A constructed test: pipeline, output schema and permutation settings.
#[derive(Debug, Clone)]
pub struct TestMethod {
    name: String,
    trait_type: Option<TraitType>,
    pipeline: Pipeline,
    fields: Vec<FieldSpec>,
    permutation: Option<PermutationConfig>,
}

impl TestMethod {
    pub fn new(name: impl Into<String>, pipeline: Pipeline, fields: Vec<FieldSpec>) -> Self {
        TestMethod {
            name: name.into(),
            trait_type: None,
            pipeline,
            fields,
            permutation: None,
        }
    }

    pub fn with_trait_type(mut self, trait_type: TraitType) -> Self {
        self.trait_type = Some(trait_type);
        self
    }

    pub fn with_permutation(mut self, config: PermutationConfig) -> Self {
        self.permutation = Some(config);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trait_type(&self) -> Option<TraitType> {
        self.trait_type
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn permutation(&self) -> Option<&PermutationConfig> {
        self.permutation.as_ref()
    }

    pub fn columns(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.column.as_str()).collect()
    }
}

/// Builds a method from its name and argument tokens.
pub type Constructor = Arc<dyn Fn(&str, &[String]) -> Result<TestMethod, MethodError> + Send + Sync>;

/// Read-only map from method name to constructor.
#[derive(Clone)]
pub struct Registry {
    constructors: BTreeMap<String, Constructor>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("methods", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub struct RegistryBuilder {
    constructors: BTreeMap<String, Constructor>,
}

impl RegistryBuilder {
    /// Registers a user method under a fully qualified dotted name (`module.Name`).
    /// A constructor error is reported as `MethodConstruction`.
    pub fn register_custom<F>(mut self, qualified_name: &str, constructor: F) -> Result<Self, MethodError>
    where
        F: Fn(&[String]) -> Result<TestMethod, String> + Send + Sync + 'static,
    {
        let valid = qualified_name.contains('.')
            && qualified_name.split('.').all(|part| {
                !part.is_empty() && part.chars().all(|c| c.is_alphanumeric() || c == '_')
            });
        if !valid {
            return Err(MethodError::MethodConstruction {
                name: qualified_name.to_string(),
                reason: "custom methods must use a fully qualified dotted name such as 'module.Name'".to_string(),
            });
        }
        if self.constructors.contains_key(qualified_name) {
            return Err(MethodError::MethodConstruction {
                name: qualified_name.to_string(),
                reason: "a method with this name is already registered".to_string(),
            });
        }
        let name = qualified_name.to_string();
        let wrapped: Constructor = Arc::new(move |_method: &str, args: &[String]| {
            constructor(args).map_err(|reason| MethodError::MethodConstruction {
                name: name.clone(),
                reason,
            })
        });
        self.constructors.insert(qualified_name.to_string(), wrapped);
        Ok(self)
    }

    pub fn build(self) -> Registry {
        Registry {
            constructors: self.constructors,
        }
    }
}

fn builtin_constructor(
    f: fn(&str, &[String]) -> Result<TestMethod, MethodError>,
) -> Constructor {
    Arc::new(f)
}

impl Registry {
    /// The process-wide registry of built-in methods.
    pub fn builtin() -> &'static Registry {
        static BUILTIN: OnceLock<Registry> = OnceLock::new();
        BUILTIN.get_or_init(|| Registry::builder().build())
    }

    /// A builder pre-populated with the built-in methods.
    pub fn builder() -> RegistryBuilder {
        let mut constructors: BTreeMap<String, Constructor> = BTreeMap::new();
        constructors.insert("LinRegBurden".into(), builtin_constructor(lin_reg_burden));
        constructors.insert("LogitRegBurden".into(), builtin_constructor(logit_reg_burden));
        constructors.insert("WeightedBurdenQt".into(), builtin_constructor(weighted_burden_qt));
        constructors.insert("WeightedBurdenBt".into(), builtin_constructor(weighted_burden_bt));
        constructors.insert("SKAT".into(), builtin_constructor(skat));
        RegistryBuilder { constructors }
    }

    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    /// Splits a method string into its unquoted name, constructor and argument tokens.
    pub fn resolve(&self, method_string: &str) -> Result<(String, Constructor, Vec<String>), MethodError> {
        let mut tokens = split_method_string(method_string).map_err(|message| MethodError::InvalidArgument {
            method: method_string.to_string(),
            message,
        })?;
        if tokens.is_empty() {
            return Err(MethodError::UnknownMethod(String::new()));
        }
        let name = tokens.remove(0);
        let constructor = self
            .constructors
            .get(&name)
            .cloned()
            .ok_or_else(|| MethodError::UnknownMethod(name.clone()))?;
        Ok((name, constructor, tokens))
    }

    /// Resolves and constructs a method.
    pub fn build(&self, method_string: &str) -> Result<TestMethod, MethodError> {
        let (name, constructor, args) = self.resolve(method_string)?;
        let method = constructor(&name, &args)?;
        log::debug!(
            "Constructed method {} with actions {:?}",
            method.name(),
            method.pipeline().action_names()
        );
        Ok(method)
    }
}

/// Splits a method string on whitespace, honouring single and double quotes
/// and backslash escapes.
pub fn split_method_string(input: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some('"') if c == '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_token = true;
                }
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                        in_token = true;
                    }
                }
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                c => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }
    if let Some(q) = quote {
        return Err(format!("unterminated {} quote in '{}'", q, input));
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

// `-q1`/`-q2` are multi-character short options, which clap cannot express
fn normalize_legacy_flags(args: &[String]) -> Vec<String> {
    args.iter()
        .map(|arg| {
            for (legacy, long) in [("-q1", "--mafupper"), ("-q2", "--maflower")] {
                if arg == legacy {
                    return long.to_string();
                }
                if let Some(value) = arg.strip_prefix(legacy).and_then(|rest| rest.strip_prefix('=')) {
                    return format!("{}={}", long, value);
                }
            }
            arg.clone()
        })
        .collect()
}

fn clap_error(method: &str, err: clap::Error) -> MethodError {
    match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
            MethodError::HelpRequested(err.render().to_string())
        }
        _ => MethodError::InvalidArgument {
            method: method.to_string(),
            message: err.render().to_string().trim().to_string(),
        },
    }
}

fn parse_args<T: Parser>(method: &str, args: &[String]) -> Result<T, MethodError> {
    let argv = std::iter::once(method.to_string()).chain(normalize_legacy_flags(args));
    let matches = T::command()
        .bin_name(method.to_string())
        .try_get_matches_from(argv)
        .map_err(|e| clap_error(method, e))?;
    T::from_arg_matches(&matches).map_err(|e| clap_error(method, e))
}

fn invalid(method: &str, message: impl Into<String>) -> MethodError {
    MethodError::InvalidArgument {
        method: method.to_string(),
        message: message.into(),
    }
}

fn parse_fraction(s: &str) -> Result<f64, String> {
    let value: f64 = s.parse().map_err(|_| format!("'{}' is not a number", s))?;
    if !(0.0..=1.0).contains(&value) {
        return Err(format!("{} is not in [0, 1]", value));
    }
    Ok(value)
}

fn parse_open_fraction(s: &str) -> Result<f64, String> {
    let value: f64 = s.parse().map_err(|_| format!("'{}' is not a number", s))?;
    if !(value > 0.0 && value < 1.0) {
        return Err(format!("{} is not in (0, 1)", value));
    }
    Ok(value)
}

#[derive(Args, Debug, Clone)]
struct MafArgs {
    /// Upper MAF limit; sites with MAF above it are excluded (also -q1)
    #[arg(long = "mafupper", default_value_t = 0.01, value_parser = parse_fraction)]
    maf_upper: f64,

    /// Lower MAF limit; sites with MAF at or below it are excluded (also -q2)
    #[arg(long = "maflower", default_value_t = 0.0, value_parser = parse_fraction)]
    maf_lower: f64,
}

impl MafArgs {
    fn validate(&self, method: &str) -> Result<(), MethodError> {
        if self.maf_lower >= self.maf_upper {
            return Err(invalid(
                method,
                format!(
                    "lower MAF limit ({}) must be smaller than upper limit ({})",
                    self.maf_lower, self.maf_upper
                ),
            ));
        }
        Ok(())
    }
}

#[derive(Args, Debug, Clone)]
struct PermutationArgs {
    /// Number of permutations; enables permutation-based p-values
    #[arg(short = 'p', long = "permutations", value_parser = clap::value_parser!(u64).range(1..))]
    permutations: Option<u64>,

    /// What to permute: X (genotypes), Y (phenotype) or R (covariate-adjusted residuals)
    #[arg(long = "permute_by", alias = "permute-by", value_enum, ignore_case = true, default_value = "y")]
    permute_by: PermuteBy,

    /// Stop permuting once the p-value is confidently above this threshold
    #[arg(long, value_parser = parse_open_fraction)]
    adaptive: Option<f64>,

    /// Interval (in permutations) at which the adaptive rule is evaluated
    #[arg(long, default_value_t = DEFAULT_CHECKPOINT as u64, value_parser = clap::value_parser!(u64).range(1..))]
    checkpoint: u64,
}

impl PermutationArgs {
    fn config(
        &self,
        method: &str,
        trait_type: TraitType,
        comparison: Comparison,
    ) -> Result<Option<PermutationConfig>, MethodError> {
        let Some(count) = self.permutations else {
            if self.adaptive.is_some() {
                log::warn!("{}: --adaptive has no effect without -p", method);
            }
            return Ok(None);
        };
        if self.permute_by == PermuteBy::R && trait_type == TraitType::Binary {
            return Err(invalid(
                method,
                "--permute_by R permutes regression residuals and requires a quantitative trait",
            ));
        }
        let mut config = PermutationConfig::new(count as usize, self.permute_by, comparison);
        config.adaptive = self.adaptive;
        config.checkpoint = self.checkpoint as usize;
        Ok(Some(config))
    }
}

/// Arguments shared by the burden regression methods.
#[derive(Parser, Debug, Clone)]
#[command(about = "Burden test: collapse rare variants and regress the phenotype on the burden")]
struct BurdenArgs {
    /// Suffix appended to every output field
    #[arg(long)]
    name: Option<String>,

    #[command(flatten)]
    maf: MafArgs,

    /// Alternative hypothesis: 1 (one-sided, effect > 0) or 2 (two-sided)
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=2))]
    alternative: u8,

    /// Collapse to a carrier indicator instead of the minor allele count
    #[arg(long = "use_indicator", alias = "use-indicator")]
    use_indicator: bool,

    /// Scan every observed MAF as a threshold and keep the most significant burden (needs -p)
    #[arg(long = "variable_thresholds", alias = "variable-thresholds")]
    variable_thresholds: bool,

    #[command(flatten)]
    permutation: PermutationArgs,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum WeightScheme {
    /// Madsen-Browning weights from all samples
    #[value(name = "Browning_all")]
    BrowningAll,
    /// Madsen-Browning weights from controls only (binary traits)
    #[value(name = "Browning")]
    Browning,
}

#[derive(Parser, Debug, Clone)]
#[command(about = "Weighted burden test with Madsen-Browning variant weights")]
struct WeightedArgs {
    #[command(flatten)]
    burden: BurdenArgs,

    /// Variant weighting scheme
    #[arg(long, value_enum, ignore_case = true, default_value = "Browning_all")]
    weight: WeightScheme,
}

#[derive(Parser, Debug, Clone)]
#[command(about = "Kernel (SKAT-style) variance component test")]
struct SkatArgs {
    /// Trait type: quantitative or disease
    trait_type: TraitType,

    /// Suffix appended to every output field
    #[arg(long)]
    name: Option<String>,

    #[command(flatten)]
    maf: MafArgs,

    /// Kernel: linear, linear.weighted, IBS, IBS.weighted or quadratic
    #[arg(short = 'k', long = "kernel", default_value = "linear.weighted")]
    kernel: KernelKind,

    /// Parameters of the Beta density used to weight variants by MAF
    #[arg(long = "beta_param", num_args = 2, value_names = ["A", "B"], default_values_t = [1.0, 25.0])]
    beta_param: Vec<f64>,

    /// Delegate the statistic to an external program (receives the data as TSV on stdin)
    #[arg(long)]
    command: Option<String>,

    #[command(flatten)]
    permutation: PermutationArgs,
}

fn lin_reg_burden(method: &str, args: &[String]) -> Result<TestMethod, MethodError> {
    let args: BurdenArgs = parse_args(method, args)?;
    burden_method(method, &args, TraitType::Quantitative, None)
}

fn logit_reg_burden(method: &str, args: &[String]) -> Result<TestMethod, MethodError> {
    let args: BurdenArgs = parse_args(method, args)?;
    burden_method(method, &args, TraitType::Binary, None)
}

fn weighted_burden_qt(method: &str, args: &[String]) -> Result<TestMethod, MethodError> {
    let args: WeightedArgs = parse_args(method, args)?;
    if args.weight == WeightScheme::Browning {
        return Err(invalid(
            method,
            "Browning weights are computed from controls and need a binary trait; use Browning_all",
        ));
    }
    burden_method(method, &args.burden, TraitType::Quantitative, Some(args.weight))
}

fn weighted_burden_bt(method: &str, args: &[String]) -> Result<TestMethod, MethodError> {
    let args: WeightedArgs = parse_args(method, args)?;
    burden_method(method, &args.burden, TraitType::Binary, Some(args.weight))
}

fn summary_fields(suffix: Option<&str>) -> Vec<FieldSpec> {
    vec![
        FieldSpec::new(keys::SAMPLE_SIZE, FieldType::Integer, suffix),
        FieldSpec::new(keys::NUM_VARIANTS, FieldType::Integer, suffix),
        FieldSpec::new(keys::TOTAL_MAC, FieldType::Integer, suffix),
    ]
}

fn permutation_fields(suffix: Option<&str>) -> Vec<FieldSpec> {
    vec![
        FieldSpec::new(keys::NUM_PERMUTATIONS, FieldType::Integer, suffix),
        FieldSpec::new(keys::PERMUTATION_STATE, FieldType::Text, suffix),
    ]
}

fn burden_method(
    method: &str,
    args: &BurdenArgs,
    trait_type: TraitType,
    weight: Option<WeightScheme>,
) -> Result<TestMethod, MethodError> {
    args.maf.validate(method)?;
    let alternative = Alternative::from_code(args.alternative)
        .ok_or_else(|| invalid(method, format!("alternative must be 1 or 2, got {}", args.alternative)))?;
    if args.variable_thresholds && args.permutation.permutations.is_none() {
        return Err(invalid(
            method,
            "--variable_thresholds has no analytic p-value and requires -p",
        ));
    }

    let comparison = match (alternative, args.variable_thresholds) {
        // the variable-threshold statistic is already folded for two-sided tests
        (Alternative::TwoSided, false) => Comparison::AbsGreater,
        _ => Comparison::Greater,
    };
    let permutation = args.permutation.config(method, trait_type, comparison)?;

    let prepare = vec![
        Action::SetMaf,
        Action::FilterSites {
            lower: args.maf.maf_lower,
            upper: args.maf.maf_upper,
        },
        Action::ImputeMissing,
        Action::Summarize,
    ];
    let mut burden = match weight {
        None => vec![],
        Some(WeightScheme::BrowningAll) => vec![Action::WeightBrowning { controls_only: false }],
        Some(WeightScheme::Browning) => vec![Action::WeightBrowning { controls_only: true }],
    };
    if !args.variable_thresholds {
        burden.push(if args.use_indicator {
            Action::CollapseIndicator
        } else {
            Action::CollapseSum
        });
    }
    let test = if args.variable_thresholds {
        Action::VariableThresholds { trait_type, alternative }
    } else if permutation.is_some() && trait_type == TraitType::Binary {
        // permuted rare-variant groups routinely separate, which leaves no Wald estimate
        Action::ScoreTest { trait_type }
    } else {
        Action::Regress { trait_type }
    };
    let phenotype_dependent_weights = weight == Some(WeightScheme::Browning);

    let suffix = args.name.as_deref();
    let mut fields = summary_fields(suffix);
    fields.extend([
        FieldSpec::new(keys::BETA_X, FieldType::Float, suffix),
        FieldSpec::new(keys::STD_ERROR, FieldType::Float, suffix),
        FieldSpec::new(keys::STATISTIC, FieldType::Float, suffix),
        FieldSpec::new(keys::PVALUE, FieldType::Float, suffix),
    ]);
    if args.variable_thresholds {
        fields.push(FieldSpec::new(keys::MAF_THRESHOLD, FieldType::Float, suffix));
    }

    let method_def = match permutation {
        Some(config) => {
            fields.extend(permutation_fields(suffix));
            let (mut invariant, mut variable) = (prepare, Vec::new());
            if phenotype_dependent_weights {
                variable.extend(burden);
            } else {
                invariant.extend(burden);
            }
            variable.push(test);
            TestMethod::new(method, Pipeline::with_invariant(invariant, variable), fields)
                .with_permutation(config)
        }
        None => {
            let mut actions = prepare;
            actions.extend(burden);
            actions.push(test);
            actions.push(Action::AnalyticPvalue { trait_type, alternative });
            TestMethod::new(method, Pipeline::new(actions), fields)
        }
    };
    Ok(method_def.with_trait_type(trait_type))
}

fn skat(method: &str, args: &[String]) -> Result<TestMethod, MethodError> {
    let args: SkatArgs = parse_args(method, args)?;
    args.maf.validate(method)?;
    let (a, b) = match args.beta_param.as_slice() {
        [a, b] if *a > 0.0 && *b > 0.0 => (*a, *b),
        _ => return Err(invalid(method, "--beta_param needs two positive values")),
    };
    let trait_type = args.trait_type;
    let suffix = args.name.as_deref();
    let mut fields = summary_fields(suffix);
    fields.extend([
        FieldSpec::new(keys::STATISTIC, FieldType::Float, suffix),
        FieldSpec::new(keys::PVALUE, FieldType::Float, suffix),
    ]);

    let mut prepare = vec![
        Action::SetMaf,
        Action::FilterSites {
            lower: args.maf.maf_lower,
            upper: args.maf.maf_upper,
        },
    ];

    if let Some(command) = &args.command {
        if args.permutation.permutations.is_some() {
            return Err(invalid(method, "-p cannot be combined with --command"));
        }
        let mut tokens = split_method_string(command).map_err(|message| invalid(method, message))?;
        if tokens.is_empty() {
            return Err(invalid(method, "--command is empty"));
        }
        let program = tokens.remove(0);
        prepare.push(Action::Summarize);
        prepare.push(Action::External(ExternalCommand::new(program, tokens)));
        return Ok(TestMethod::new(method, Pipeline::new(prepare), fields).with_trait_type(trait_type));
    }

    prepare.extend([
        Action::ImputeMissing,
        Action::WeightBeta { a, b },
        Action::Summarize,
    ]);
    let kernel = args.kernel;
    let permutation = args.permutation.config(method, trait_type, Comparison::Greater)?;
    let method_def = match permutation {
        Some(config) => {
            fields.extend(permutation_fields(suffix));
            let variable = vec![Action::FitNullModel { trait_type }, Action::KernelScore { kernel }];
            TestMethod::new(method, Pipeline::with_invariant(prepare, variable), fields).with_permutation(config)
        }
        None => {
            prepare.extend([
                Action::FitNullModel { trait_type },
                Action::KernelScore { kernel },
                Action::KernelPvalue { kernel },
            ]);
            TestMethod::new(method, Pipeline::new(prepare), fields)
        }
    };
    Ok(method_def.with_trait_type(trait_type))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::CallbackAction;
    use crate::Statistic;

    fn build(method: &str) -> Result<TestMethod, MethodError> {
        Registry::builtin().build(method)
    }

    #[test]
    fn tokenizer_honours_quotes_and_escapes() {
        let tokens = split_method_string(r#"SKAT disease --command "Rscript -e 'cat(1)'" a\ b"#).unwrap();
        assert_eq!(tokens, vec!["SKAT", "disease", "--command", "Rscript -e 'cat(1)'", "a b"]);
        assert!(split_method_string("SKAT 'open").is_err());
    }

    #[test]
    fn legacy_maf_flags_are_normalized() {
        let args: Vec<String> = ["-q1", "0.05", "-q2=0.001", "-p", "5"].iter().map(|s| s.to_string()).collect();
        assert_eq!(
            normalize_legacy_flags(&args),
            vec!["--mafupper", "0.05", "--maflower=0.001", "-p", "5"]
        );
    }

    #[test]
    fn accepts_documented_burden_arguments() {
        for method in [
            "LinRegBurden --alternative 2",
            "LinRegBurden -q1 0.05 -q2 0.001",
            "LinRegBurden --use_indicator",
            "LinRegBurden -p 100 --permute_by x",
            "LinRegBurden -p 100 --adaptive 0.000001",
            "LinRegBurden --variable_thresholds -p 100",
            "LogitRegBurden --alternative 2 -p 10 --permute_by Y",
            "WeightedBurdenQt --weight Browning_all",
            "WeightedBurdenBt --weight Browning -p 100",
        ] {
            assert!(build(method).is_ok(), "{} should construct", method);
        }
    }

    #[test]
    fn rejects_out_of_range_arguments() {
        for method in [
            "LinRegBurden -q1 5",
            "LinRegBurden --alternative 8",
            "LinRegBurden -p 100 --permute_by M",
            "LinRegBurden -p 100 --adaptive 24",
            "LinRegBurden -p 0",
            "LinRegBurden -q1 0.01 -q2 0.05",
            "LinRegBurden --variable_thresholds",
            "LogitRegBurden -p 10 --permute_by R",
            "WeightedBurdenQt --weight Browning",
            "SKAT quantitative -k gaussian",
        ] {
            assert!(
                matches!(build(method), Err(MethodError::InvalidArgument { .. })),
                "{} should be rejected",
                method
            );
        }
    }

    #[test]
    fn unknown_method_fails_before_parsing() {
        assert_eq!(
            build("NoSuchTest -p 10").unwrap_err(),
            MethodError::UnknownMethod("NoSuchTest".into())
        );
    }

    #[test]
    fn quoted_method_name_is_unquoted() {
        let method = build("'LinRegBurden' -q1 0.5").unwrap();
        assert_eq!(method.name(), "LinRegBurden");
        let (name, _, args) = Registry::builtin().resolve(r#""LinRegBurden" --alternative 2"#).unwrap();
        assert_eq!(name, "LinRegBurden");
        assert_eq!(args, vec!["--alternative", "2"]);
    }

    #[test]
    fn help_is_reported_separately() {
        assert!(matches!(build("LinRegBurden -h"), Err(MethodError::HelpRequested(_))));
    }

    #[test]
    fn field_schema_is_stable_and_suffixed() {
        let method = build("LinRegBurden --name Burden -p 100 --alternative 2").unwrap();
        assert_eq!(
            method.columns(),
            vec![
                "sample_size_Burden",
                "num_variants_Burden",
                "total_mac_Burden",
                "beta_x_Burden",
                "std_error_Burden",
                "statistic_Burden",
                "pvalue_Burden",
                "num_permutations_Burden",
                "permutation_state_Burden",
            ]
        );
        let permutation = method.permutation().unwrap();
        assert_eq!(permutation.max_permutations, 100);
        assert_eq!(permutation.comparison, Comparison::AbsGreater);
    }

    #[test]
    fn analytic_and_permutation_pipelines_differ() {
        let analytic = build("LinRegBurden").unwrap();
        assert!(analytic.permutation().is_none());
        assert_eq!(analytic.pipeline().action_names().last(), Some(&"StudentPvalue"));

        let permuted = build("WeightedBurdenBt --weight Browning -p 50").unwrap();
        assert_eq!(
            permuted.pipeline().variable().iter().map(Action::name).collect::<Vec<_>>(),
            vec!["WeightBrowning", "CollapseSum", "ScoreTest"]
        );
    }

    #[test]
    fn skat_parses_positional_trait_and_kernel() {
        let method = build("SKAT --name SKAT disease -k IBS").unwrap();
        assert_eq!(method.trait_type(), Some(TraitType::Binary));
        assert!(method.columns().contains(&"pvalue_SKAT"));
        assert!(matches!(
            method.pipeline().actions().last(),
            Some(Action::KernelPvalue { kernel: KernelKind::Ibs })
        ));

        let external = build(r#"SKAT quantitative --command "sh -c 'echo statistic 1'""#).unwrap();
        assert!(method_last_external(&external).is_some());
    }

    fn method_last_external(method: &TestMethod) -> Option<&ExternalCommand> {
        match method.pipeline().actions().last() {
            Some(Action::External(cmd)) => Some(cmd),
            _ => None,
        }
    }

    #[test]
    fn custom_methods_need_qualified_names() {
        let constructor = |_: &[String]| -> Result<TestMethod, String> {
            let pipeline = Pipeline::new(vec![Action::Callback(CallbackAction::new("constant", |_| {
                Ok(vec![("statistic".to_string(), Statistic::Scalar(1.0))])
            }))]);
            Ok(TestMethod::new(
                "mytests.Constant",
                pipeline,
                vec![FieldSpec::new("statistic", FieldType::Float, None)],
            ))
        };
        assert!(matches!(
            Registry::builder().register_custom("Constant", constructor),
            Err(MethodError::MethodConstruction { .. })
        ));

        let registry = Registry::builder()
            .register_custom("mytests.Constant", constructor)
            .unwrap()
            .register_custom("mytests.Broken", |_: &[String]| Err("missing dependency".to_string()))
            .unwrap()
            .build();
        assert!(registry.build("mytests.Constant").is_ok());
        assert_eq!(
            registry.build("mytests.Broken").unwrap_err(),
            MethodError::MethodConstruction {
                name: "mytests.Broken".into(),
                reason: "missing dependency".into()
            }
        );
        assert!(registry.names().contains(&"LinRegBurden"));
    }
}
