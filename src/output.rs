use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use csv::Writer;
use serde::Serialize;

use crate::catalog::CatalogStore;
use crate::config::PipelineConfig;
use crate::patch::{PatchSet, RejectReason, MIN_PATCH_MEMBERS};
use crate::pipeline::{GraphStats, PipelineOutput};
use crate::sweep::{SweepGrid, SweepReport};
use crate::validation::{EpsilonSummary, ValidationTable};
use crate::FaultNetError;

pub const OUTPUT_SCHEMA_VERSION: &str = "1.0.0";

/// Creates `<base>/<UTC timestamp>`, suffixed with a counter if it exists.
pub fn create_timestamped_output_dir(base: &Path) -> Result<PathBuf, FaultNetError> {
    fs::create_dir_all(base)?;

    let timestamp = Utc::now().format("%Y-%m-%dT%H-%M-%SZ").to_string();
    let mut output_dir = base.join(&timestamp);
    let mut counter = 1_u32;

    while output_dir.exists() {
        output_dir = base.join(format!("{timestamp}-{counter:02}"));
        counter += 1;
    }

    fs::create_dir_all(&output_dir)?;
    Ok(output_dir)
}

fn ensure_len(context: &'static str, expected: usize, actual: usize) -> Result<(), FaultNetError> {
    if expected == actual {
        return Ok(());
    }

    Err(FaultNetError::LengthMismatch {
        context,
        expected,
        got: actual,
    })
}

fn fmt_f64(value: f64) -> String {
    format!("{value:.10}")
}

fn fmt_epsilon(value: Option<f64>) -> String {
    value.map(fmt_f64).unwrap_or_else(|| "NaN".to_string())
}

fn fmt_option<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

pub fn write_validation_csv(path: &Path, table: &ValidationTable) -> Result<(), FaultNetError> {
    let mut writer = Writer::from_path(path)?;
    writer.write_record(["hypocenter_id", "cluster_id", "epsilon", "matched_plane", "status"])?;

    for record in table.records() {
        writer.write_record([
            record.hypocenter_id.to_string(),
            fmt_option(record.cluster_id),
            fmt_epsilon(record.epsilon_deg),
            fmt_option(record.matched_plane.map(|plane| plane.number())),
            record.status.to_string(),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

pub fn write_patches_csv(path: &Path, patches: &PatchSet) -> Result<(), FaultNetError> {
    let mut writer = Writer::from_path(path)?;
    writer.write_record([
        "cluster_id",
        "n_events",
        "normal_x",
        "normal_y",
        "normal_z",
        "strike",
        "dip",
        "dispersion_deg",
        "concentration",
        "centroid_x",
        "centroid_y",
        "centroid_z",
        "length",
        "width",
        "thickness",
        "valid_draws",
        "degenerate_draws",
        "low_confidence",
    ])?;

    for patch in patches.iter() {
        writer.write_record([
            patch.cluster_id.to_string(),
            patch.member_count().to_string(),
            fmt_f64(patch.mean_normal.x),
            fmt_f64(patch.mean_normal.y),
            fmt_f64(patch.mean_normal.z),
            fmt_f64(patch.strike_deg),
            fmt_f64(patch.dip_deg),
            fmt_f64(patch.normal_dispersion_deg),
            fmt_f64(patch.axial_concentration),
            fmt_f64(patch.centroid.x),
            fmt_f64(patch.centroid.y),
            fmt_f64(patch.centroid.z),
            fmt_f64(patch.extent.length),
            fmt_f64(patch.extent.width),
            fmt_f64(patch.extent.thickness),
            patch.valid_draws.to_string(),
            patch.degenerate_draws.to_string(),
            patch.low_confidence.to_string(),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

/// Rejected clusters; singletons and pairs are folded into one count per size.
pub fn write_rejected_clusters_csv(path: &Path, patches: &PatchSet) -> Result<(), FaultNetError> {
    let mut writer = Writer::from_path(path)?;
    writer.write_record(["cluster_id", "n_events", "reason", "detail"])?;

    for rejected in &patches.rejected {
        let (reason, detail) = match &rejected.reason {
            RejectReason::TooFewMembers { .. } => continue,
            RejectReason::DegenerateGeometry { detail } => ("degenerate_geometry", detail.as_str()),
        };
        writer.write_record([
            rejected.cluster_id.to_string(),
            rejected.member_ids.len().to_string(),
            reason.to_string(),
            detail.to_string(),
        ])?;
    }

    for size in 1..MIN_PATCH_MEMBERS {
        let count = patches
            .rejected
            .iter()
            .filter(|r| r.reason == RejectReason::TooFewMembers { count: size })
            .count();
        if count > 0 {
            writer.write_record([
                String::new(),
                size.to_string(),
                "too_few_members".to_string(),
                format!("{count} clusters"),
            ])?;
        }
    }

    writer.flush()?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct RunManifest<'a> {
    pub schema_version: &'static str,
    pub crate_version: &'static str,
    pub created_at: String,
    pub config: &'a PipelineConfig,
    pub seed: u64,
    pub events: usize,
    pub graph: Option<GraphStats>,
    pub patches: Option<usize>,
    pub low_confidence_patches: Option<usize>,
    pub rejected_degenerate: Option<usize>,
    pub orphan_mechanisms: Option<usize>,
    pub epsilon: Option<EpsilonSummary>,
    pub sweep: Option<&'a SweepGrid>,
    pub sweep_failures: Option<usize>,
}

impl<'a> RunManifest<'a> {
    fn base(config: &'a PipelineConfig, seed: u64, events: usize) -> Self {
        Self {
            schema_version: OUTPUT_SCHEMA_VERSION,
            crate_version: env!("CARGO_PKG_VERSION"),
            created_at: Utc::now().to_rfc3339(),
            config,
            seed,
            events,
            graph: None,
            patches: None,
            low_confidence_patches: None,
            rejected_degenerate: None,
            orphan_mechanisms: None,
            epsilon: None,
            sweep: None,
            sweep_failures: None,
        }
    }

    pub fn for_pipeline(
        config: &'a PipelineConfig,
        events: usize,
        output: &PipelineOutput,
    ) -> Self {
        Self {
            graph: Some(output.graph),
            patches: Some(output.patches.len()),
            low_confidence_patches: Some(output.patches.low_confidence_count()),
            rejected_degenerate: Some(output.patches.degenerate_count()),
            orphan_mechanisms: Some(output.validation.orphan_mechanisms()),
            epsilon: Some(output.validation.summary()),
            ..Self::base(config, output.seed, events)
        }
    }

    pub fn for_sweep(
        config: &'a PipelineConfig,
        events: usize,
        grid: &'a SweepGrid,
        report: &SweepReport,
    ) -> Self {
        Self {
            sweep: Some(grid),
            sweep_failures: Some(report.failed_count()),
            ..Self::base(config, report.seed, events)
        }
    }
}

pub fn write_manifest_json(path: &Path, manifest: &RunManifest<'_>) -> Result<(), FaultNetError> {
    let json = serde_json::to_string_pretty(manifest)?;
    fs::write(path, json)?;
    Ok(())
}

/// Writes `validation.csv`, `patches.csv`, `rejected_clusters.csv` and
/// `manifest.json` into `dir`.
pub fn write_pipeline_outputs(
    dir: &Path,
    config: &PipelineConfig,
    catalog: &CatalogStore,
    output: &PipelineOutput,
) -> Result<(), FaultNetError> {
    ensure_len("validation table", catalog.len(), output.validation.len())?;

    write_validation_csv(&dir.join("validation.csv"), &output.validation)?;
    write_patches_csv(&dir.join("patches.csv"), &output.patches)?;
    write_rejected_clusters_csv(&dir.join("rejected_clusters.csv"), &output.patches)?;
    write_manifest_json(
        &dir.join("manifest.json"),
        &RunManifest::for_pipeline(config, catalog.len(), output),
    )
}

/// One row per epsilon of every successful run: the cumulative curves.
pub fn write_sensitivity_cdf_csv(path: &Path, report: &SweepReport) -> Result<(), FaultNetError> {
    let mut writer = Writer::from_path(path)?;
    writer.write_record(["r_nn", "dt_nn", "label", "epsilon", "cumulative_count"])?;

    for curve in report.curves() {
        for (epsilon, count) in &curve.points {
            writer.write_record([
                curve.r_nn.to_string(),
                curve.dt_nn.to_string(),
                curve.label.clone(),
                fmt_f64(*epsilon),
                count.to_string(),
            ])?;
        }
    }

    writer.flush()?;
    Ok(())
}

pub fn write_sensitivity_runs_csv(path: &Path, report: &SweepReport) -> Result<(), FaultNetError> {
    let mut writer = Writer::from_path(path)?;
    writer.write_record([
        "r_nn",
        "dt_nn",
        "label",
        "started_at",
        "status",
        "edges",
        "clusters",
        "patches",
        "matched",
        "epsilon_median",
        "error",
    ])?;

    for run in report.runs() {
        let mut row = vec![
            run.r_nn.to_string(),
            run.dt_nn.to_string(),
            run.label(),
            run.started_at.to_rfc3339(),
        ];
        match &run.outcome {
            Ok(output) => row.extend([
                "ok".to_string(),
                output.graph.edges.to_string(),
                output.graph.clusters.to_string(),
                output.patches.len().to_string(),
                output.validation.matched_count().to_string(),
                output
                    .validation
                    .summary()
                    .median
                    .map(fmt_f64)
                    .unwrap_or_else(|| "NaN".to_string()),
                String::new(),
            ]),
            Err(err) => row.extend([
                "failed".to_string(),
                String::new(),
                String::new(),
                String::new(),
                String::new(),
                String::new(),
                err.clone(),
            ]),
        }
        writer.write_record(&row)?;
    }

    writer.flush()?;
    Ok(())
}

/// Writes the sweep tables and manifest into `dir`.
pub fn write_sweep_outputs(
    dir: &Path,
    config: &PipelineConfig,
    catalog: &CatalogStore,
    grid: &SweepGrid,
    report: &SweepReport,
) -> Result<(), FaultNetError> {
    ensure_len("sweep runs", grid.len(), report.runs().len())?;

    write_sensitivity_cdf_csv(&dir.join("sensitivity_cdf.csv"), report)?;
    write_sensitivity_runs_csv(&dir.join("sensitivity_runs.csv"), report)?;
    write_manifest_json(
        &dir.join("manifest.json"),
        &RunManifest::for_sweep(config, catalog.len(), grid, report),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::hypo;
    use crate::pipeline::run_pipeline;

    fn store() -> CatalogStore {
        CatalogStore::new(vec![
            hypo(1, 0.0, 0.0, -1000.0, 0),
            hypo(2, 40.0, 0.0, -1000.0, 1),
            hypo(3, 0.0, 40.0, -1000.0, 2),
            hypo(4, 40.0, 40.0, -1010.0, 3),
            hypo(5, 5000.0, 0.0, -1000.0, 4),
            hypo(6, 5020.0, 0.0, -1000.0, 4),
        ])
        .unwrap()
    }

    #[test]
    fn timestamped_dirs_do_not_collide() {
        let base = tempfile::tempdir().unwrap();
        let first = create_timestamped_output_dir(base.path()).unwrap();
        let second = create_timestamped_output_dir(base.path()).unwrap();
        assert_ne!(first, second);
        assert!(first.is_dir() && second.is_dir());
    }

    #[test]
    fn pipeline_tables_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            n_mc: 3,
            seed: Some(2),
            ..PipelineConfig::default()
        };
        let catalog = store();
        let output = run_pipeline(&config, &catalog, None).unwrap();
        write_pipeline_outputs(dir.path(), &config, &catalog, &output).unwrap();

        let validation = fs::read_to_string(dir.path().join("validation.csv")).unwrap();
        let lines: Vec<&str> = validation.lines().collect();
        assert_eq!(lines[0], "hypocenter_id,cluster_id,epsilon,matched_plane,status");
        assert_eq!(lines.len(), 7);
        assert_eq!(lines[1], "1,0,NaN,,not_validated");
        assert_eq!(lines[5], "5,,NaN,,no_patch");

        let patches = fs::read_to_string(dir.path().join("patches.csv")).unwrap();
        assert_eq!(patches.lines().count(), 2);
        let rejected = fs::read_to_string(dir.path().join("rejected_clusters.csv")).unwrap();
        assert!(rejected.lines().any(|line| line == ",2,too_few_members,1 clusters"));

        let raw = fs::read_to_string(dir.path().join("manifest.json")).unwrap();
        let manifest: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(manifest["seed"], 2);
        assert_eq!(manifest["patches"], 1);
        assert_eq!(manifest["graph"]["edges"], 7);
    }
}
