//! Fault patches from clustered hypocenters.
//!
//! Every cluster with at least three members is fitted once per Monte Carlo
//! draw. The per-draw normals are reduced to an axial mean and an RMS angular
//! dispersion, which is what the validator compares against focal mechanisms.

use std::collections::{BTreeMap, HashMap};

use log::{debug, warn};
use nalgebra::Vector3;
use rayon::prelude::*;
use serde::Serialize;

use crate::catalog::{CatalogStore, HypoId};
use crate::geometry::{
    fit_plane, plane_basis, strike_dip_from_normal, AngularSpread, AxialMean, GeometryError,
    OrientationTensor,
};
use crate::proximity::{Cluster, ProximityGraph};
use crate::resample::Resampler;
use crate::FaultNetError;

/// Smallest cluster that defines a plane.
pub const MIN_PATCH_MEMBERS: usize = 3;

/// Draws fitted per parallel batch.
const DRAW_CHUNK: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatchParams {
    /// Patches whose normals scatter more than this [deg] are flagged.
    pub dispersion_ceiling_deg: f64,
    /// Minimum `(λmid - λmin) / λmax` for a usable plane fit.
    pub min_eigen_gap: f64,
}

impl Default for PatchParams {
    fn default() -> Self {
        Self {
            dispersion_ceiling_deg: 20.0,
            min_eigen_gap: 1.0e-6,
        }
    }
}

/// Size of a patch measured in its own plane [m].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PatchExtent {
    /// Range of member positions along strike.
    pub length: f64,
    /// Range of member positions down dip.
    pub width: f64,
    /// Twice the standard deviation of member positions along the normal.
    pub thickness: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaultPatch {
    pub cluster_id: usize,
    pub member_ids: Vec<HypoId>,
    /// Unit normal, upper hemisphere.
    pub mean_normal: Vector3<f64>,
    pub normal_dispersion_deg: f64,
    pub axial_concentration: f64,
    pub strike_deg: f64,
    pub dip_deg: f64,
    pub centroid: Vector3<f64>,
    pub extent: PatchExtent,
    pub valid_draws: usize,
    pub degenerate_draws: usize,
    pub low_confidence: bool,
}

impl FaultPatch {
    pub fn member_count(&self) -> usize {
        self.member_ids.len()
    }

    pub fn contains(&self, id: HypoId) -> bool {
        self.member_ids.contains(&id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    TooFewMembers { count: usize },
    DegenerateGeometry { detail: String },
}

/// A cluster that produced no patch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedCluster {
    pub cluster_id: usize,
    pub member_ids: Vec<HypoId>,
    pub reason: RejectReason,
}

impl RejectedCluster {
    pub fn is_degenerate(&self) -> bool {
        matches!(self.reason, RejectReason::DegenerateGeometry { .. })
    }

    pub fn to_error(&self) -> FaultNetError {
        let reason = match &self.reason {
            RejectReason::TooFewMembers { count } => {
                format!("{count} members, at least {MIN_PATCH_MEMBERS} needed")
            }
            RejectReason::DegenerateGeometry { detail } => detail.clone(),
        };
        FaultNetError::DegenerateGeometry {
            cluster_id: self.cluster_id,
            reason,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PatchSet {
    pub patches: BTreeMap<usize, FaultPatch>,
    pub rejected: Vec<RejectedCluster>,
}

impl PatchSet {
    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn get(&self, cluster_id: usize) -> Option<&FaultPatch> {
        self.patches.get(&cluster_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FaultPatch> {
        self.patches.values()
    }

    /// Hypocenter id to the cluster id of the patch containing it.
    pub fn membership(&self) -> HashMap<HypoId, usize> {
        self.patches
            .values()
            .flat_map(|patch| patch.member_ids.iter().map(|&id| (id, patch.cluster_id)))
            .collect()
    }

    pub fn low_confidence_count(&self) -> usize {
        self.patches.values().filter(|p| p.low_confidence).count()
    }

    pub fn degenerate_count(&self) -> usize {
        self.rejected.iter().filter(|r| r.is_degenerate()).count()
    }
}

#[derive(Debug, Clone)]
pub struct FaultPatchEstimator {
    params: PatchParams,
}

impl FaultPatchEstimator {
    pub fn new(params: PatchParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> PatchParams {
        self.params
    }

    /// Fits every cluster of `graph` under every draw of `resampler`.
    ///
    /// Draws are evaluated in parallel chunks, collected back in draw order
    /// and reduced sequentially, so a seeded run gives the same bits on any
    /// number of threads. Each draw is generated twice, once for the mean
    /// axis and once for the dispersion around it, which keeps memory
    /// independent of `n_mc`.
    pub fn estimate(
        &self,
        catalog: &CatalogStore,
        graph: &ProximityGraph,
        resampler: &Resampler<'_>,
    ) -> PatchSet {
        let ids: Vec<HypoId> = catalog.hypocenters().iter().map(|h| h.id).collect();
        let member_ids = |cluster: &Cluster| -> Vec<HypoId> {
            cluster.members.iter().map(|&i| ids[i]).collect()
        };

        let mut set = PatchSet::default();
        let mut candidates = Vec::new();
        for cluster in graph.clusters() {
            if cluster.len() < MIN_PATCH_MEMBERS {
                set.rejected.push(RejectedCluster {
                    cluster_id: cluster.id,
                    member_ids: member_ids(&cluster),
                    reason: RejectReason::TooFewMembers {
                        count: cluster.len(),
                    },
                });
            } else {
                candidates.push(cluster);
            }
        }

        if candidates.is_empty() {
            return set;
        }

        // First pass: orientation tensor, valid and degenerate draw counts.
        let mut tensors = vec![OrientationTensor::new(); candidates.len()];
        let mut first_failures: Vec<Option<GeometryError>> = vec![None; candidates.len()];
        self.for_each_draw_fit(resampler, &candidates, |fits| {
            for (k, fit) in fits.iter().enumerate() {
                match fit {
                    Ok(normal) => tensors[k].push(normal),
                    Err(err) => {
                        first_failures[k].get_or_insert_with(|| err.clone());
                    }
                }
            }
        });
        let axes: Vec<Option<(Vector3<f64>, f64)>> =
            tensors.iter().map(OrientationTensor::principal_axis).collect();

        // Second pass: spread of the same normals around each mean axis.
        let mut spreads: Vec<Option<AngularSpread>> = axes
            .iter()
            .map(|axis| axis.map(|(axis, _)| AngularSpread::new(axis)))
            .collect();
        if spreads.iter().any(Option::is_some) {
            self.for_each_draw_fit(resampler, &candidates, |fits| {
                for (fit, spread) in fits.iter().zip(spreads.iter_mut()) {
                    if let (Ok(normal), Some(spread)) = (fit, spread.as_mut()) {
                        spread.push(normal);
                    }
                }
            });
        }

        let n_mc = resampler.n_mc();
        for (k, cluster) in candidates.iter().enumerate() {
            let (Some((_, concentration)), Some(spread)) = (axes[k], spreads[k]) else {
                let detail = first_failures[k]
                    .take()
                    .map(|err| err.to_string())
                    .unwrap_or_else(|| "no draws evaluated".to_string());
                let rejected = RejectedCluster {
                    cluster_id: cluster.id,
                    member_ids: member_ids(cluster),
                    reason: RejectReason::DegenerateGeometry { detail },
                };
                warn!("{}", rejected.to_error());
                set.rejected.push(rejected);
                continue;
            };

            let valid_draws = tensors[k].count();
            let mean = spread.finish(concentration);
            let patch = self.assemble(
                catalog,
                cluster,
                member_ids(cluster),
                mean,
                valid_draws,
                n_mc - valid_draws,
            );
            set.patches.insert(cluster.id, patch);
        }

        debug!(
            "{} patches, {} low confidence, {} clusters rejected",
            set.len(),
            set.low_confidence_count(),
            set.rejected.len()
        );
        set
    }

    /// Fits every candidate under every draw and hands the fits to `visit`
    /// in draw order. Draws are fitted in parallel one chunk at a time, so at
    /// most `DRAW_CHUNK` draws of fits are held at once.
    fn for_each_draw_fit<F>(&self, resampler: &Resampler<'_>, candidates: &[Cluster], mut visit: F)
    where
        F: FnMut(&[Result<Vector3<f64>, GeometryError>]),
    {
        let min_gap = self.params.min_eigen_gap;
        let n_mc = resampler.n_mc();
        for start in (0..n_mc).step_by(DRAW_CHUNK) {
            let end = (start + DRAW_CHUNK).min(n_mc);
            let chunk: Vec<Vec<Result<Vector3<f64>, GeometryError>>> = (start..end)
                .into_par_iter()
                .map(|index| {
                    let draw = resampler.draw(index);
                    candidates
                        .iter()
                        .map(|cluster| {
                            let points = cluster.members.iter().map(|&i| draw.position(i));
                            fit_plane(points, min_gap).map(|fit| fit.normal)
                        })
                        .collect()
                })
                .collect();
            for fits in &chunk {
                visit(fits);
            }
        }
    }

    fn assemble(
        &self,
        catalog: &CatalogStore,
        cluster: &Cluster,
        member_ids: Vec<HypoId>,
        mean: AxialMean,
        valid_draws: usize,
        degenerate_draws: usize,
    ) -> FaultPatch {
        let positions: Vec<Vector3<f64>> = cluster
            .members
            .iter()
            .map(|&i| catalog.hypocenters()[i].position)
            .collect();
        let centroid = positions
            .iter()
            .fold(Vector3::<f64>::zeros(), |acc, p| acc + p)
            / positions.len() as f64;
        let (strike_deg, dip_deg) = strike_dip_from_normal(&mean.axis);

        let low_confidence =
            mean.dispersion_deg > self.params.dispersion_ceiling_deg || degenerate_draws > 0;

        FaultPatch {
            cluster_id: cluster.id,
            member_ids,
            mean_normal: mean.axis,
            normal_dispersion_deg: mean.dispersion_deg,
            axial_concentration: mean.concentration,
            strike_deg,
            dip_deg,
            centroid,
            extent: extent(&positions, &centroid, &mean.axis),
            valid_draws,
            degenerate_draws,
            low_confidence,
        }
    }
}

fn extent(
    positions: &[Vector3<f64>],
    centroid: &Vector3<f64>,
    normal: &Vector3<f64>,
) -> PatchExtent {
    let (along_strike, down_dip) = plane_basis(normal);
    let range = |axis: &Vector3<f64>| {
        let (lo, hi) = positions
            .iter()
            .map(|p| (p - centroid).dot(axis))
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
        hi - lo
    };
    let variance = positions
        .iter()
        .map(|p| (p - centroid).dot(normal).powi(2))
        .sum::<f64>()
        / positions.len() as f64;

    PatchExtent {
        length: range(&along_strike),
        width: range(&down_dip),
        thickness: 2.0 * variance.sqrt(),
    }
}
