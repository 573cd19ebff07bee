//! One reconstruction-and-validation run for a single `(r_nn, dt_nn)`.

use log::{debug, info};
use serde::Serialize;

use crate::catalog::CatalogStore;
use crate::config::{PipelineConfig, SearchParams};
use crate::focal::FocalCatalog;
use crate::patch::{FaultPatchEstimator, PatchSet, MIN_PATCH_MEMBERS};
use crate::proximity::ProximityGraph;
use crate::resample::Resampler;
use crate::validation::{FocalMechanismValidator, ValidationTable};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    pub events: usize,
    pub edges: usize,
    pub clusters: usize,
    /// Clusters large enough to define a plane.
    pub patch_candidates: usize,
}

impl GraphStats {
    fn of(graph: &ProximityGraph) -> Self {
        let clusters = graph.clusters();
        Self {
            events: graph.node_count(),
            edges: graph.edge_count(),
            clusters: clusters.len(),
            patch_candidates: clusters
                .iter()
                .filter(|c| c.len() >= MIN_PATCH_MEMBERS)
                .count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineOutput {
    pub search: SearchParams,
    /// Seed actually used, drawn at random when the config has none.
    pub seed: u64,
    pub n_mc: usize,
    pub graph: GraphStats,
    pub patches: PatchSet,
    pub validation: ValidationTable,
}

/// Runs graph, resampling, patch estimation and validation in sequence.
///
/// The configuration is validated before any computation. Validation is
/// skipped, leaving every epsilon undefined, when it is disabled or no
/// mechanisms are given.
pub fn run_pipeline(
    config: &PipelineConfig,
    catalog: &CatalogStore,
    mechanisms: Option<&FocalCatalog>,
) -> Result<PipelineOutput> {
    config.validate()?;
    let search = config.search();

    let graph = ProximityGraph::build(catalog, search);
    let stats = GraphStats::of(&graph);
    debug!(
        "r_nn={} dt_nn={}: {} edges, {} clusters, {} with at least {} events",
        search.r_nn,
        search.dt_nn,
        stats.edges,
        stats.clusters,
        stats.patch_candidates,
        MIN_PATCH_MEMBERS
    );

    let resampler = Resampler::new(catalog, config.n_mc, config.uncertainty_model, config.seed);
    let patches =
        FaultPatchEstimator::new(config.patch_params()).estimate(catalog, &graph, &resampler);

    let validation = match mechanisms {
        Some(mechanisms) if config.validation => {
            FocalMechanismValidator::new(config.validation_params()).validate(
                catalog,
                &patches,
                mechanisms,
            )
        }
        _ => ValidationTable::unvalidated(catalog, &patches),
    };

    info!(
        "r_nn={} dt_nn={}: {} patches ({} low confidence), {} of {} events matched",
        search.r_nn,
        search.dt_nn,
        patches.len(),
        patches.low_confidence_count(),
        validation.matched_count(),
        catalog.len()
    );

    Ok(PipelineOutput {
        search,
        seed: resampler.seed(),
        n_mc: resampler.n_mc(),
        graph: stats,
        patches,
        validation,
    })
}
