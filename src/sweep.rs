//! Sensitivity of the validation result to `r_nn` and `dt_nn`.
//!
//! Every grid combination reruns the full pipeline on its own copy of the
//! base configuration. All combinations share one Monte Carlo seed so their
//! curves differ only through the search parameters.

use chrono::{DateTime, Utc};
use log::{error, info};
use rand::Rng;
use rayon::prelude::*;
use serde::Serialize;

use crate::catalog::CatalogStore;
use crate::config::PipelineConfig;
use crate::focal::FocalCatalog;
use crate::pipeline::{run_pipeline, PipelineOutput};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepGrid {
    pub r_nn_values: Vec<f64>,
    pub dt_nn_values: Vec<f64>,
}

impl SweepGrid {
    pub fn new(r_nn_values: Vec<f64>, dt_nn_values: Vec<f64>) -> Self {
        Self {
            r_nn_values,
            dt_nn_values,
        }
    }

    /// Grid from `r_nn_list` and `dt_nn_list`, each falling back to the
    /// single configured value.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            r_nn_values: config.r_nn_list.clone().unwrap_or_else(|| vec![config.r_nn]),
            dt_nn_values: config.dt_nn_list.clone().unwrap_or_else(|| vec![config.dt_nn]),
        }
    }

    /// `(r_nn, dt_nn)` pairs, r-major.
    pub fn combinations(&self) -> Vec<(f64, f64)> {
        self.r_nn_values
            .iter()
            .flat_map(|&r_nn| self.dt_nn_values.iter().map(move |&dt_nn| (r_nn, dt_nn)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.r_nn_values.len() * self.dt_nn_values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn run_label(r_nn: f64, dt_nn: f64) -> String {
    format!("{r_nn}/{dt_nn}")
}

#[derive(Debug, Clone)]
pub struct SweepRun {
    pub r_nn: f64,
    pub dt_nn: f64,
    pub started_at: DateTime<Utc>,
    /// Pipeline output, or the error message of a failed combination.
    pub outcome: Result<PipelineOutput, String>,
}

impl SweepRun {
    pub fn label(&self) -> String {
        run_label(self.r_nn, self.dt_nn)
    }

    pub fn output(&self) -> Option<&PipelineOutput> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&str> {
        self.outcome.as_ref().err().map(String::as_str)
    }

    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Cumulative epsilon curve of one successful combination.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepCurve {
    pub r_nn: f64,
    pub dt_nn: f64,
    pub label: String,
    /// Ascending epsilon [deg] and cumulative count.
    pub points: Vec<(f64, usize)>,
}

#[derive(Debug, Clone)]
pub struct SweepReport {
    pub seed: u64,
    pub runs: Vec<SweepRun>,
}

impl SweepReport {
    pub fn runs(&self) -> &[SweepRun] {
        &self.runs
    }

    pub fn succeeded_count(&self) -> usize {
        self.runs.iter().filter(|run| run.succeeded()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.runs.len() - self.succeeded_count()
    }

    /// One curve per successful combination, grid order.
    pub fn curves(&self) -> Vec<SweepCurve> {
        self.runs
            .iter()
            .filter_map(|run| {
                run.output().map(|output| SweepCurve {
                    r_nn: run.r_nn,
                    dt_nn: run.dt_nn,
                    label: run.label(),
                    points: output.validation.cumulative_distribution(),
                })
            })
            .collect()
    }
}

/// Runs the pipeline for every grid combination.
///
/// Combinations run in parallel and the report keeps grid order. A failing
/// combination is logged with its parameters and recorded; the rest still
/// run. `base` is only read.
pub fn run_sensitivity_sweep(
    base: &PipelineConfig,
    grid: &SweepGrid,
    catalog: &CatalogStore,
    mechanisms: Option<&FocalCatalog>,
) -> SweepReport {
    let seed = base.seed.unwrap_or_else(|| rand::thread_rng().gen());
    let shared = base.with_seed(seed);
    let combinations = grid.combinations();
    info!(
        "sensitivity sweep: {} r_nn x {} dt_nn = {} runs, seed {seed}",
        grid.r_nn_values.len(),
        grid.dt_nn_values.len(),
        combinations.len()
    );

    let runs = combinations
        .par_iter()
        .map(|&(r_nn, dt_nn)| {
            let started_at = Utc::now();
            info!(
                "start {} r_nn={r_nn} dt_nn={dt_nn}",
                started_at.format("%H:%M:%S")
            );
            let config = shared.with_search(r_nn, dt_nn);
            let outcome = run_pipeline(&config, catalog, mechanisms).map_err(|err| {
                error!("run r_nn={r_nn} dt_nn={dt_nn} failed: {err}");
                err.to_string()
            });
            SweepRun {
                r_nn,
                dt_nn,
                started_at,
                outcome,
            }
        })
        .collect();

    SweepReport { seed, runs }
}
