use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};

use faultnet::output::{write_pipeline_outputs, write_sweep_outputs};
use faultnet::{
    create_timestamped_output_dir, run_pipeline, run_sensitivity_sweep, CatalogStore, FocalCatalog,
    PipelineConfig, SweepGrid,
};

#[derive(Debug, Parser)]
#[command(name = "faultnet")]
#[command(
    about = "Fault network reconstruction from hypocenters, validated against focal mechanisms"
)]
struct Cli {
    /// TOML run configuration; defaults to configs/default.toml.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Base directory for run outputs, overriding `out_dir`.
    #[arg(long)]
    outdir: Option<PathBuf>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    n_mc: Option<usize>,

    /// Sweep `r_nn_list` x `dt_nn_list` instead of a single run.
    #[arg(long, default_value_t = false)]
    sweep: bool,
}

fn resolve_default_config_path() -> PathBuf {
    let local = PathBuf::from("configs").join("default.toml");
    if local.exists() {
        return local;
    }

    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("configs")
        .join("default.toml")
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_toml_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => {
            let path = resolve_default_config_path();
            if path.exists() {
                PipelineConfig::from_toml_file(&path)
                    .with_context(|| format!("failed to load config {}", path.display()))?
            } else {
                warn!("no config file found, using built-in defaults");
                PipelineConfig::default()
            }
        }
    };

    if let Some(outdir) = &cli.outdir {
        config.out_dir = outdir.clone();
    }
    if let Some(seed) = cli.seed {
        config.seed = Some(seed);
    }
    if let Some(n_mc) = cli.n_mc {
        config.n_mc = n_mc;
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let Some(hypo_file) = config.hypo_file.as_deref() else {
        bail!("hypo_file is not set in the configuration");
    };
    let (catalog, load_report) =
        CatalogStore::from_delimited(hypo_file, config.hypo_delimiter()?, config.mag_type)
            .with_context(|| format!("failed to load catalog {}", hypo_file.display()))?;
    info!(
        "catalog {}: {} of {} rows accepted",
        hypo_file.display(),
        load_report.accepted,
        load_report.rows_read
    );
    if catalog.is_empty() {
        bail!("catalog {} has no usable events", hypo_file.display());
    }

    let mechanisms = match config.foc_file.as_deref() {
        Some(path) if config.validation => {
            let (mechanisms, report) =
                FocalCatalog::from_delimited(
                    path,
                    config.foc_delimiter()?,
                    config.mag_type,
                    catalog.origin(),
                )
                .with_context(|| format!("failed to load focal mechanisms {}", path.display()))?;
            info!(
                "focal mechanisms {}: {} of {} rows accepted",
                path.display(),
                report.accepted,
                report.rows_read
            );
            Some(mechanisms)
        }
        Some(_) => None,
        None => {
            if config.validation {
                warn!("validation is enabled but foc_file is not set");
            }
            None
        }
    };

    let run_dir = create_timestamped_output_dir(&config.out_dir).with_context(|| {
        format!(
            "failed to create output directory under {}",
            config.out_dir.display()
        )
    })?;

    if cli.sweep {
        let grid = SweepGrid::from_config(&config);
        let report = run_sensitivity_sweep(&config, &grid, &catalog, mechanisms.as_ref());
        write_sweep_outputs(&run_dir, &config, &catalog, &grid, &report)
            .context("failed to write sweep outputs")?;
        if report.succeeded_count() == 0 {
            bail!("all {} sweep runs failed", report.runs().len());
        }
        info!(
            "sweep finished: {} ok, {} failed",
            report.succeeded_count(),
            report.failed_count()
        );
    } else {
        let output = run_pipeline(&config, &catalog, mechanisms.as_ref())?;
        write_pipeline_outputs(&run_dir, &config, &catalog, &output)
            .context("failed to write run outputs")?;
        let summary = output.validation.summary();
        if let Some(median) = summary.median {
            info!("{} epsilons, median {median:.1} deg", summary.count);
        }
    }

    info!("outputs written to {}", run_dir.display());
    Ok(())
}
