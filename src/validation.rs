//! Patch orientation against focal mechanisms.
//!
//! Epsilon is the axial angle between a patch's mean normal and the nodal
//! plane normal it is compared with, so it always falls in [0°, 90°].

use std::collections::BTreeMap;
use std::fmt;

use log::{debug, warn};
use serde::Serialize;

use crate::catalog::{CatalogStore, HypoId, Hypocenter};
use crate::config::NodalPlaneRule;
use crate::focal::{FocalCatalog, FocalMechanism};
use crate::geometry::axial_angle_deg;
use crate::patch::{FaultPatch, PatchSet};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationParams {
    /// Require matching magnitude type and `|Δmag| <= mag_tolerance`.
    pub foc_mag_check: bool,
    /// Require the mechanism within `loc_tolerance_m` of the hypocenter.
    pub foc_loc_check: bool,
    pub mag_tolerance: f64,
    pub loc_tolerance_m: f64,
    pub nodal_plane_rule: NodalPlaneRule,
    /// Compare against patches flagged as low confidence.
    pub use_low_confidence: bool,
}

impl Default for ValidationParams {
    fn default() -> Self {
        Self {
            foc_mag_check: true,
            foc_loc_check: true,
            mag_tolerance: 0.3,
            loc_tolerance_m: 500.0,
            nodal_plane_rule: NodalPlaneRule::Nearest,
            use_low_confidence: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodalPlane {
    First,
    Second,
}

impl NodalPlane {
    pub fn number(&self) -> u8 {
        match self {
            Self::First => 1,
            Self::Second => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    NoPatch,
    NoFocalMechanism,
    LowConfidencePatch,
    MagnitudeMismatch,
    LocationMismatch,
    /// Validation was switched off or no mechanisms were supplied.
    NotValidated,
    Matched,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoPatch => "no_patch",
            Self::NoFocalMechanism => "no_focal_mechanism",
            Self::LowConfidencePatch => "low_confidence_patch",
            Self::MagnitudeMismatch => "magnitude_mismatch",
            Self::LocationMismatch => "location_mismatch",
            Self::NotValidated => "not_validated",
            Self::Matched => "matched",
        }
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationRecord {
    pub hypocenter_id: HypoId,
    pub cluster_id: Option<usize>,
    /// `None` when no comparison was made.
    pub epsilon_deg: Option<f64>,
    pub matched_plane: Option<NodalPlane>,
    pub status: MatchStatus,
}

impl ValidationRecord {
    fn undefined(hypocenter_id: HypoId, cluster_id: Option<usize>, status: MatchStatus) -> Self {
        Self {
            hypocenter_id,
            cluster_id,
            epsilon_deg: None,
            matched_plane: None,
            status,
        }
    }
}

/// Distribution summary of the defined epsilons [deg].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EpsilonSummary {
    pub count: usize,
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub p90: Option<f64>,
}

/// One record per catalog event, catalog order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationTable {
    records: Vec<ValidationRecord>,
    orphan_mechanisms: usize,
}

impl ValidationTable {
    /// Table with every epsilon undefined, for runs without validation.
    pub fn unvalidated(catalog: &CatalogStore, patches: &PatchSet) -> Self {
        let membership = patches.membership();
        let records = catalog
            .hypocenters()
            .iter()
            .map(|h| {
                let cluster_id = membership.get(&h.id).copied();
                let status = if cluster_id.is_some() {
                    MatchStatus::NotValidated
                } else {
                    MatchStatus::NoPatch
                };
                ValidationRecord::undefined(h.id, cluster_id, status)
            })
            .collect();
        Self {
            records,
            orphan_mechanisms: 0,
        }
    }

    pub fn records(&self) -> &[ValidationRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn orphan_mechanisms(&self) -> usize {
        self.orphan_mechanisms
    }

    /// Defined epsilons in catalog order.
    pub fn epsilons(&self) -> Vec<f64> {
        self.records.iter().filter_map(|r| r.epsilon_deg).collect()
    }

    pub fn matched_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.status == MatchStatus::Matched)
            .count()
    }

    pub fn status_counts(&self) -> BTreeMap<MatchStatus, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.records {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        counts
    }

    /// Ascending epsilons paired with their cumulative count `1..=n`.
    pub fn cumulative_distribution(&self) -> Vec<(f64, usize)> {
        let mut sorted = self.epsilons();
        sorted.sort_by(f64::total_cmp);
        sorted.into_iter().zip(1..).collect()
    }

    pub fn summary(&self) -> EpsilonSummary {
        let mut sorted = self.epsilons();
        sorted.sort_by(f64::total_cmp);
        let count = sorted.len();
        let mean = (count > 0).then(|| sorted.iter().sum::<f64>() / count as f64);
        EpsilonSummary {
            count,
            mean,
            median: quantile(&sorted, 0.5),
            p90: quantile(&sorted, 0.9),
        }
    }
}

/// Linear-interpolated quantile of ascending `sorted`.
fn quantile(sorted: &[f64], q: f64) -> Option<f64> {
    let last = sorted.len().checked_sub(1)?;
    let pos = q * last as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

#[derive(Debug, Clone)]
pub struct FocalMechanismValidator {
    params: ValidationParams,
}

impl FocalMechanismValidator {
    pub fn new(params: ValidationParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> ValidationParams {
        self.params
    }

    pub fn validate(
        &self,
        catalog: &CatalogStore,
        patches: &PatchSet,
        mechanisms: &FocalCatalog,
    ) -> ValidationTable {
        let orphans = mechanisms.orphans(catalog);
        if !orphans.is_empty() {
            warn!(
                "{} focal mechanisms have no catalog event (first: {})",
                orphans.len(),
                orphans[0]
            );
        }

        let membership = patches.membership();
        let records: Vec<ValidationRecord> = catalog
            .hypocenters()
            .iter()
            .map(|hypo| {
                let patch = membership
                    .get(&hypo.id)
                    .and_then(|&cluster_id| patches.get(cluster_id));
                self.compare(hypo, patch, mechanisms.by_id(hypo.id))
            })
            .collect();

        let table = ValidationTable {
            records,
            orphan_mechanisms: orphans.len(),
        };
        debug!("validation statuses: {:?}", table.status_counts());
        table
    }

    fn compare(
        &self,
        hypo: &Hypocenter,
        patch: Option<&FaultPatch>,
        mechanism: Option<&FocalMechanism>,
    ) -> ValidationRecord {
        let Some(patch) = patch else {
            return ValidationRecord::undefined(hypo.id, None, MatchStatus::NoPatch);
        };
        let cluster_id = Some(patch.cluster_id);
        let Some(mechanism) = mechanism else {
            return ValidationRecord::undefined(hypo.id, cluster_id, MatchStatus::NoFocalMechanism);
        };

        let params = &self.params;
        if patch.low_confidence && !params.use_low_confidence {
            return ValidationRecord::undefined(
                hypo.id,
                cluster_id,
                MatchStatus::LowConfidencePatch,
            );
        }

        if params.foc_mag_check
            && (mechanism.magnitude_type != hypo.magnitude_type
                || (mechanism.magnitude - hypo.magnitude).abs() > params.mag_tolerance)
        {
            return ValidationRecord::undefined(hypo.id, cluster_id, MatchStatus::MagnitudeMismatch);
        }

        if params.foc_loc_check
            && (mechanism.location - hypo.position).norm() > params.loc_tolerance_m
        {
            return ValidationRecord::undefined(hypo.id, cluster_id, MatchStatus::LocationMismatch);
        }

        let first = axial_angle_deg(&patch.mean_normal, &mechanism.nodal_plane_1);
        let (epsilon, plane) = match params.nodal_plane_rule {
            NodalPlaneRule::FirstPlane => (first, NodalPlane::First),
            NodalPlaneRule::Nearest => {
                let second = axial_angle_deg(&patch.mean_normal, &mechanism.nodal_plane_2);
                if second < first {
                    (second, NodalPlane::Second)
                } else {
                    (first, NodalPlane::First)
                }
            }
        };

        ValidationRecord {
            hypocenter_id: hypo.id,
            cluster_id,
            epsilon_deg: Some(epsilon),
            matched_plane: Some(plane),
            status: MatchStatus::Matched,
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use nalgebra::Vector3;
    use proptest::prelude::*;

    use super::*;
    use crate::catalog::tests::hypo;
    use crate::catalog::MagnitudeType;
    use crate::geometry::{normal_from_strike_dip, strike_dip_from_normal};
    use crate::patch::PatchExtent;

    fn patch(cluster_id: usize, member_ids: Vec<HypoId>, normal: Vector3<f64>) -> FaultPatch {
        let (strike_deg, dip_deg) = strike_dip_from_normal(&normal);
        FaultPatch {
            cluster_id,
            member_ids,
            mean_normal: normal.normalize(),
            normal_dispersion_deg: 1.0,
            axial_concentration: 0.99,
            strike_deg,
            dip_deg,
            centroid: Vector3::zeros(),
            extent: PatchExtent {
                length: 100.0,
                width: 50.0,
                thickness: 2.0,
            },
            valid_draws: 10,
            degenerate_draws: 0,
            low_confidence: false,
        }
    }

    fn setup() -> (CatalogStore, PatchSet) {
        let store = CatalogStore::new(vec![
            hypo(1, 0.0, 0.0, -1000.0, 0).with_magnitude(1.5, MagnitudeType::Ml),
            hypo(2, 10.0, 0.0, -1000.0, 0).with_magnitude(2.0, MagnitudeType::Ml),
            hypo(3, 0.0, 10.0, -1000.0, 0).with_magnitude(1.0, MagnitudeType::Ml),
            hypo(4, 9000.0, 0.0, -1000.0, 0).with_magnitude(1.0, MagnitudeType::Ml),
        ])
        .unwrap();
        let mut patches = PatchSet::default();
        patches
            .patches
            .insert(0, patch(0, vec![1, 2, 3], normal_from_strike_dip(0.0, 0.0)));
        (store, patches)
    }

    fn mechanism(id: HypoId, tilt: f64, at: Vector3<f64>, mag: f64) -> FocalMechanism {
        FocalMechanism::from_strike_dip(id, at, (0.0, tilt), (180.0, 90.0 - tilt))
            .unwrap()
            .with_magnitude(mag, MagnitudeType::Ml)
    }

    #[test]
    fn nearest_plane_wins_and_is_recorded() {
        let (store, patches) = setup();
        let focals =
            FocalCatalog::new(vec![mechanism(1, 75.0, Vector3::new(0.0, 0.0, -1000.0), 1.5)])
                .unwrap();

        let table = FocalMechanismValidator::new(ValidationParams::default())
            .validate(&store, &patches, &focals);
        let record = &table.records()[0];
        assert_eq!(record.status, MatchStatus::Matched);
        assert_eq!(record.matched_plane, Some(NodalPlane::Second));
        assert_relative_eq!(record.epsilon_deg.unwrap(), 15.0, epsilon = 1e-9);

        let first_only = FocalMechanismValidator::new(ValidationParams {
            nodal_plane_rule: NodalPlaneRule::FirstPlane,
            ..ValidationParams::default()
        })
        .validate(&store, &patches, &focals);
        assert_relative_eq!(first_only.records()[0].epsilon_deg.unwrap(), 75.0, epsilon = 1e-9);
        assert_eq!(first_only.records()[0].matched_plane, Some(NodalPlane::First));
    }

    #[test]
    fn every_event_gets_a_status_in_catalog_order() {
        let (store, patches) = setup();
        let focals = FocalCatalog::new(vec![
            mechanism(2, 10.0, Vector3::new(10.0, 0.0, -1000.0), 2.5),
            mechanism(3, 10.0, Vector3::new(0.0, 900.0, -1000.0), 1.0),
            mechanism(4, 10.0, Vector3::new(9000.0, 0.0, -1000.0), 1.0),
            mechanism(99, 10.0, Vector3::zeros(), 1.0),
        ])
        .unwrap();

        let table = FocalMechanismValidator::new(ValidationParams::default())
            .validate(&store, &patches, &focals);
        let statuses: Vec<_> = table.records().iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                MatchStatus::NoFocalMechanism,
                MatchStatus::MagnitudeMismatch,
                MatchStatus::LocationMismatch,
                MatchStatus::NoPatch,
            ]
        );
        assert_eq!(table.orphan_mechanisms(), 1);
        assert!(table.epsilons().is_empty());
        assert_eq!(table.records()[3].cluster_id, None);
        assert_eq!(table.records()[1].cluster_id, Some(0));
    }

    #[test]
    fn disabled_checks_let_mismatches_through() {
        let (store, patches) = setup();
        let focals = FocalCatalog::new(vec![
            mechanism(2, 10.0, Vector3::new(10.0, 0.0, -1000.0), 2.5)
                .with_magnitude(2.5, MagnitudeType::Mw),
            mechanism(3, 20.0, Vector3::new(0.0, 900.0, -1000.0), 1.0),
        ])
        .unwrap();
        let params = ValidationParams {
            foc_mag_check: false,
            foc_loc_check: false,
            ..ValidationParams::default()
        };
        let table = FocalMechanismValidator::new(params).validate(&store, &patches, &focals);
        assert_eq!(table.matched_count(), 2);
        assert_eq!(table.cumulative_distribution().len(), 2);
        assert_relative_eq!(table.cumulative_distribution()[1].0, 20.0, epsilon = 1e-9);
        assert_eq!(table.cumulative_distribution()[1].1, 2);
    }

    #[test]
    fn magnitude_type_mismatch_is_caught() {
        let (store, patches) = setup();
        let focals = FocalCatalog::new(vec![mechanism(1, 5.0, Vector3::new(0.0, 0.0, -1000.0), 1.5)
            .with_magnitude(1.5, MagnitudeType::Mw)])
        .unwrap();
        let table = FocalMechanismValidator::new(ValidationParams::default())
            .validate(&store, &patches, &focals);
        assert_eq!(table.records()[0].status, MatchStatus::MagnitudeMismatch);
    }

    #[test]
    fn low_confidence_patches_can_be_skipped() {
        let (store, mut patches) = setup();
        if let Some(p) = patches.patches.get_mut(&0) {
            p.low_confidence = true;
        }
        let focals =
            FocalCatalog::new(vec![mechanism(1, 5.0, Vector3::new(0.0, 0.0, -1000.0), 1.5)])
                .unwrap();

        let skipping = FocalMechanismValidator::new(ValidationParams {
            use_low_confidence: false,
            ..ValidationParams::default()
        });
        let table = skipping.validate(&store, &patches, &focals);
        assert_eq!(table.records()[0].status, MatchStatus::LowConfidencePatch);

        let using = FocalMechanismValidator::new(ValidationParams::default());
        assert_eq!(using.validate(&store, &patches, &focals).matched_count(), 1);
    }

    #[test]
    fn summary_uses_interpolated_quantiles() {
        let records = [4.0, 1.0, 3.0, 2.0, 10.0]
            .iter()
            .enumerate()
            .map(|(k, &eps)| ValidationRecord {
                hypocenter_id: k as HypoId,
                cluster_id: Some(0),
                epsilon_deg: Some(eps),
                matched_plane: Some(NodalPlane::First),
                status: MatchStatus::Matched,
            })
            .chain(std::iter::once(ValidationRecord::undefined(9, None, MatchStatus::NoPatch)))
            .collect();
        let table = ValidationTable {
            records,
            orphan_mechanisms: 0,
        };
        let summary = table.summary();
        assert_eq!(summary.count, 5);
        assert_relative_eq!(summary.mean.unwrap(), 4.0);
        assert_relative_eq!(summary.median.unwrap(), 3.0);
        assert_relative_eq!(summary.p90.unwrap(), 7.6, epsilon = 1e-12);
        assert_eq!(ValidationTable::default().summary().mean, None);
    }

    #[test]
    fn unvalidated_table_keeps_cluster_ids() {
        let (store, patches) = setup();
        let table = ValidationTable::unvalidated(&store, &patches);
        assert_eq!(table.len(), 4);
        assert_eq!(table.records()[0].status, MatchStatus::NotValidated);
        assert_eq!(table.records()[3].status, MatchStatus::NoPatch);
        assert!(table.epsilons().is_empty());
    }

    proptest! {
        #[test]
        fn epsilon_stays_within_a_right_angle(
            strike in 0.0f64..360.0,
            dip in 0.0f64..=90.0,
            rake in -180.0f64..180.0,
            px in -1.0f64..1.0,
            py in -1.0f64..1.0,
            pz in -1.0f64..1.0,
        ) {
            let normal = Vector3::new(px, py, pz);
            prop_assume!(normal.norm() > 1e-3);

            let (store, _) = setup();
            let mut patches = PatchSet::default();
            patches.patches.insert(0, patch(0, vec![1, 2, 3], normal));
            let focals = FocalCatalog::new(vec![FocalMechanism::from_strike_dip_rake(
                1,
                Vector3::new(0.0, 0.0, -1000.0),
                strike,
                dip,
                rake,
            )
            .unwrap()
            .with_magnitude(1.5, MagnitudeType::Ml)])
            .unwrap();

            let table = FocalMechanismValidator::new(ValidationParams::default())
                .validate(&store, &patches, &focals);
            let epsilon = table.records()[0].epsilon_deg.unwrap();
            prop_assert!((0.0..=90.0).contains(&epsilon));
        }
    }
}
