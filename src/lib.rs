//! # VARIANT-ASSOC-RUST Crate
//!
//! This library contains the association testing engine: a per-group data
//! context, composable actions assembled into pipelines by named test
//! methods, regression and kernel statistics, and a permutation engine with
//! adaptive stopping. The `associate` binary drives it over grouped TSV input.

// Re-export key modules
pub mod actions;
pub mod association;
pub mod data;
pub mod io;
pub mod kernel;
pub mod methods;
pub mod permutation;
pub mod pipeline;
pub mod regression;

pub use actions::Action;
pub use association::{run_group, run_grouped_tests, GroupData, GroupResult, GroupStatus, RunOptions, RunReport, RunSummary};
pub use data::DataContext;
pub use methods::{MethodError, Registry, TestMethod};
pub use pipeline::{ActionError, ActionFailure, Pipeline};

/// Response type of a test. Selects linear versus logistic fitting.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraitType {
    Quantitative,
    Binary,
}

impl std::str::FromStr for TraitType {
    type Err = &'static str;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "quantitative" | "q" => Ok(TraitType::Quantitative),
            "binary" | "disease" | "b" => Ok(TraitType::Binary),
            _ => Err("Unknown trait type. Use 'quantitative' or 'disease'."),
        }
    }
}

/// A named result produced by an action and stored in the context's statistics.
#[derive(serde::Serialize, Debug, Clone, PartialEq)]
pub enum Statistic {
    Scalar(f64),
    Vector(Vec<f64>),
    Label(String),
}

impl Statistic {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Statistic::Scalar(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<f64> for Statistic {
    fn from(value: f64) -> Self {
        Statistic::Scalar(value)
    }
}

impl From<Vec<f64>> for Statistic {
    fn from(value: Vec<f64>) -> Self {
        Statistic::Vector(value)
    }
}
