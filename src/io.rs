//! Module for handling I/O: phenotype and genotype tables, sample alignment,
//! and the tab-separated result sink.
use crate::association::{GroupData, GroupResult, RunSummary};
use crate::methods::{FieldType, TestMethod};
use crate::Statistic;
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::{Array1, Array2};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

const MISSING_CODES: [&str; 3] = ["NA", ".", ""];

#[derive(Error, Debug)]
pub enum IoError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Data alignment error: {0}")]
    Alignment(String),
    #[error("Column '{column}' not found in {file}")]
    MissingColumn { column: String, file: String },
    #[error("Cannot parse '{value}' in column '{column}' of {file}")]
    Parse { value: String, column: String, file: String },
    #[error("Output file {0} already exists; use --force to overwrite it")]
    OutputExists(String),
}

/// Phenotype and covariates for the samples with complete data.
#[derive(Debug, Clone)]
pub struct PhenotypeTable {
    pub sample_ids: Vec<String>,
    pub phenotype: Array1<f64>,
    pub covariates: Array2<f64>,
    pub covariate_names: Vec<String>,
}

/// One variant: its identifier, the groups it belongs to and one dosage per genotype sample.
#[derive(Debug, Clone)]
pub struct VariantRow {
    pub variant_id: String,
    pub groups: Vec<String>,
    pub dosages: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct GenotypeTable {
    pub sample_ids: Vec<String>,
    pub variants: Vec<VariantRow>,
}

fn is_gz(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "gz")
}

fn open_table(path: &Path) -> Result<csv::Reader<Box<dyn Read>>, IoError> {
    if !path.exists() {
        return Err(IoError::NotFound(path.to_string_lossy().into()));
    }
    let file = File::open(path)?;
    let input: Box<dyn Read> = if is_gz(path) {
        Box::new(MultiGzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    Ok(ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .comment(Some(b'#'))
        .from_reader(input))
}

fn column_index(headers: &StringRecord, column: &str, path: &Path) -> Result<usize, IoError> {
    headers
        .iter()
        .position(|h| h == column)
        .ok_or_else(|| IoError::MissingColumn {
            column: column.to_string(),
            file: path.to_string_lossy().into(),
        })
}

/// Parses a numeric cell; `None` for the missing codes `NA`, `.` and the empty string.
fn parse_value(value: &str, column: &str, path: &Path) -> Result<Option<f64>, IoError> {
    let value = value.trim();
    if MISSING_CODES.contains(&value) {
        return Ok(None);
    }
    value.parse::<f64>().map(Some).map_err(|_| IoError::Parse {
        value: value.to_string(),
        column: column.to_string(),
        file: path.to_string_lossy().into(),
    })
}

/// Loads a tab-separated phenotype file. Rows with a missing trait or
/// covariate value are dropped.
pub fn load_phenotypes(
    path: &Path,
    sample_id_col: &str,
    trait_name: &str,
    covariate_cols: &[String],
) -> Result<PhenotypeTable, IoError> {
    log::info!("Loading phenotype file: {:?}", path);
    let mut reader = open_table(path)?;
    let headers = reader.headers()?.clone();
    let id_idx = column_index(&headers, sample_id_col, path)?;
    let trait_idx = column_index(&headers, trait_name, path)?;
    let covar_idx = covariate_cols
        .iter()
        .map(|c| column_index(&headers, c, path))
        .collect::<Result<Vec<_>, _>>()?;

    let mut sample_ids = Vec::new();
    let mut phenotype = Vec::new();
    let mut covariates = Vec::new();
    let mut seen = HashSet::new();
    let mut n_dropped = 0;

    for record in reader.records() {
        let record = record?;
        let sample_id = record.get(id_idx).unwrap_or_default().to_string();
        if !seen.insert(sample_id.clone()) {
            return Err(IoError::Alignment(format!(
                "Sample '{}' appears more than once in {:?}",
                sample_id, path
            )));
        }
        let y = parse_value(record.get(trait_idx).unwrap_or_default(), trait_name, path)?;
        let mut row = Vec::with_capacity(covar_idx.len());
        for (&idx, name) in covar_idx.iter().zip(covariate_cols) {
            row.push(parse_value(record.get(idx).unwrap_or_default(), name, path)?);
        }
        match (y, row.iter().copied().collect::<Option<Vec<f64>>>()) {
            (Some(y), Some(row)) => {
                sample_ids.push(sample_id);
                phenotype.push(y);
                covariates.extend(row);
            }
            _ => {
                log::trace!("Sample '{}' dropped: missing trait or covariate value", sample_id);
                n_dropped += 1;
            }
        }
    }

    if n_dropped > 0 {
        log::warn!("{} samples dropped because of missing phenotype or covariate values", n_dropped);
    }
    let n_samples = sample_ids.len();
    let covariates = Array2::from_shape_vec((n_samples, covariate_cols.len()), covariates)
        .map_err(|e| IoError::Alignment(e.to_string()))?;
    log::info!(
        "Loaded trait '{}' for {} samples with {} covariates",
        trait_name,
        n_samples,
        covariate_cols.len()
    );

    Ok(PhenotypeTable {
        sample_ids,
        phenotype: Array1::from_vec(phenotype),
        covariates,
        covariate_names: covariate_cols.to_vec(),
    })
}

/// Loads a wide genotype table: one row per variant, an identifier column,
/// a group column (comma-separated when a variant belongs to several groups)
/// and one dosage column per sample.
pub fn load_genotypes(path: &Path, variant_id_col: &str, group_col: &str) -> Result<GenotypeTable, IoError> {
    log::info!("Loading genotype file: {:?}", path);
    let mut reader = open_table(path)?;
    let headers = reader.headers()?.clone();
    let id_idx = column_index(&headers, variant_id_col, path)?;
    let group_idx = column_index(&headers, group_col, path)?;
    let sample_cols: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != id_idx && *i != group_idx)
        .map(|(i, h)| (i, h.to_string()))
        .collect();

    let mut variants = Vec::new();
    for record in reader.records() {
        let record = record?;
        let variant_id = record.get(id_idx).unwrap_or_default().to_string();
        let groups: Vec<String> = record
            .get(group_idx)
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(String::from)
            .collect();
        if groups.is_empty() {
            log::trace!("Variant '{}' has no group and is skipped", variant_id);
            continue;
        }
        let dosages = sample_cols
            .iter()
            .map(|(idx, name)| {
                parse_value(record.get(*idx).unwrap_or_default(), name, path).map(|v| v.unwrap_or(f64::NAN))
            })
            .collect::<Result<Vec<f64>, _>>()?;
        variants.push(VariantRow {
            variant_id,
            groups,
            dosages,
        });
        if variants.len() % 10000 == 0 {
            log::debug!("Read {} variants so far...", variants.len());
        }
    }

    log::info!("Read {} variants for {} samples", variants.len(), sample_cols.len());
    if variants.is_empty() {
        log::warn!("No variants found in genotype file!");
    }
    Ok(GenotypeTable {
        sample_ids: sample_cols.into_iter().map(|(_, name)| name).collect(),
        variants,
    })
}

/// Aligns phenotype samples to genotype columns.
/// Returns, for each kept phenotype row, its row index and genotype column.
fn align_samples(pheno_samples: &[String], geno_samples: &[String]) -> Vec<(usize, usize)> {
    let geno_map: HashMap<&str, usize> = geno_samples
        .iter()
        .enumerate()
        .map(|(i, s)| (s.as_str(), i))
        .collect();

    log::debug!("Aligning phenotype samples to genotype samples...");
    let mut pairs = Vec::new();
    for (i, sample) in pheno_samples.iter().enumerate() {
        match geno_map.get(sample.as_str()) {
            Some(&g) => pairs.push((i, g)),
            None => log::trace!("  Sample '{}' has no genotypes", sample),
        }
    }
    pairs
}

/// Builds one `GroupData` per group, in order of first appearance in the genotype table.
pub fn build_groups(phenotypes: &PhenotypeTable, genotypes: &GenotypeTable) -> Result<Vec<GroupData>, IoError> {
    let pairs = align_samples(&phenotypes.sample_ids, &genotypes.sample_ids);
    log::info!("Sample alignment: {} overlapping samples", pairs.len());
    if pairs.is_empty() {
        log::error!(
            "Phenotype samples (first 5): {:?}",
            phenotypes.sample_ids.iter().take(5).collect::<Vec<_>>()
        );
        log::error!(
            "Genotype samples (first 5): {:?}",
            genotypes.sample_ids.iter().take(5).collect::<Vec<_>>()
        );
        return Err(IoError::Alignment(
            "No samples overlap between phenotype and genotype files".to_string(),
        ));
    }

    let mut order: Vec<String> = Vec::new();
    let mut members: HashMap<String, Vec<usize>> = HashMap::new();
    for (v, variant) in genotypes.variants.iter().enumerate() {
        for group in &variant.groups {
            let entry = members.entry(group.clone()).or_insert_with(|| {
                order.push(group.clone());
                Vec::new()
            });
            entry.push(v);
        }
    }

    let pheno_rows: Vec<usize> = pairs.iter().map(|&(p, _)| p).collect();
    let geno_cols: Vec<usize> = pairs.iter().map(|&(_, g)| g).collect();
    let sample_ids: Vec<String> = pheno_rows.iter().map(|&p| phenotypes.sample_ids[p].clone()).collect();
    let phenotype = Array1::from_iter(pheno_rows.iter().map(|&p| phenotypes.phenotype[p]));
    let covariates = phenotypes.covariates.select(ndarray::Axis(0), &pheno_rows);

    let groups = order
        .into_iter()
        .map(|key| {
            let sites = members.remove(&key).unwrap_or_default();
            let genotype_matrix = Array2::from_shape_fn((geno_cols.len(), sites.len()), |(i, j)| {
                genotypes.variants[sites[j]].dosages[geno_cols[i]]
            });
            log::trace!("Group '{}' has {} sites", key, sites.len());
            GroupData {
                group_key: key,
                sample_ids: sample_ids.clone(),
                genotypes: genotype_matrix,
                phenotype: phenotype.clone(),
                covariates: covariates.clone(),
            }
        })
        .collect::<Vec<_>>();

    log::info!("Built {} variant groups", groups.len());
    Ok(groups)
}

fn format_value(value: Option<&Statistic>, kind: FieldType) -> String {
    match value {
        Some(Statistic::Scalar(v)) if v.is_finite() => match kind {
            FieldType::Integer => format!("{}", v.round() as i64),
            _ => format!("{}", v),
        },
        Some(Statistic::Vector(values)) => values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(","),
        Some(Statistic::Label(label)) => label.clone(),
        _ => "NA".to_string(),
    }
}

/// Writes the result table (header `group`, method columns, `status`, `message`).
pub fn write_result_table<W: Write>(writer: W, method: &TestMethod, results: &[GroupResult]) -> Result<W, IoError> {
    let mut csv_writer = WriterBuilder::new().delimiter(b'\t').from_writer(writer);

    let mut header = vec!["group"];
    header.extend(method.columns());
    header.extend(["status", "message"]);
    csv_writer.write_record(&header)?;

    for result in results {
        let mut row = vec![result.group_key.clone()];
        for (field, value) in method.fields().iter().zip(&result.values) {
            row.push(format_value(value.as_ref(), field.kind));
        }
        row.push(result.status.label().to_string());
        row.push(result.status.message().unwrap_or_else(|| "NA".to_string()));
        csv_writer.write_record(&row)?;
    }
    csv_writer.flush()?;
    csv_writer.into_inner().map_err(|e| IoError::Io(e.into_error()))
}

/// Refuses an existing output path unless `force` is set.
pub fn check_overwrite(path: &Path, force: bool) -> Result<(), IoError> {
    if path.exists() {
        if !force {
            return Err(IoError::OutputExists(path.to_string_lossy().into()));
        }
        log::warn!("Overwriting existing output file {:?}", path);
    }
    Ok(())
}

/// Writes results to `path`, gzip-compressed when it ends with `.gz`.
pub fn write_results(path: &Path, force: bool, method: &TestMethod, results: &[GroupResult]) -> Result<(), IoError> {
    check_overwrite(path, force)?;
    let file = File::create(path)?;
    if is_gz(path) {
        let encoder = write_result_table(GzEncoder::new(file, Compression::default()), method, results)?;
        encoder.finish()?;
    } else {
        let mut writer = write_result_table(BufWriter::new(file), method, results)?;
        writer.flush()?;
    }
    log::info!("Wrote {} result rows to {:?}", results.len(), path);
    Ok(())
}

/// Writes the run summary as a one-row table.
pub fn write_summary(path: &Path, force: bool, summary: &RunSummary) -> Result<(), IoError> {
    check_overwrite(path, force)?;
    let mut csv_writer = WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    csv_writer.serialize(summary)?;
    csv_writer.flush()?;
    Ok(())
}
