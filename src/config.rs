use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::catalog::MagnitudeType;
use crate::patch::PatchParams;
use crate::resample::UncertaintyModel;
use crate::validation::ValidationParams;
use crate::FaultNetError;

/// Time window [h] at or above which the temporal constraint is dropped.
///
/// 999999 h is a little over 114 years, longer than any instrumental catalog.
pub const DT_NN_UNBOUNDED: f64 = 999_999.0;

/// How the validator resolves the two-plane ambiguity of a focal mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodalPlaneRule {
    /// Compare against both nodal planes and keep the smaller angle.
    #[default]
    Nearest,
    /// Nodal plane 1 is taken to be the known fault plane.
    FirstPlane,
}

/// Nearest-neighbour search thresholds for one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    /// Search radius [m].
    pub r_nn: f64,
    /// Search time window [h].
    pub dt_nn: f64,
}

impl SearchParams {
    pub fn new(r_nn: f64, dt_nn: f64) -> Self {
        Self { r_nn, dt_nn }
    }

    /// Purely spatial search.
    pub fn spatial(r_nn: f64) -> Self {
        Self {
            r_nn,
            dt_nn: f64::INFINITY,
        }
    }

    pub fn time_unbounded(&self) -> bool {
        self.dt_nn >= DT_NN_UNBOUNDED
    }

    pub fn validate(&self) -> Result<(), FaultNetError> {
        if !self.r_nn.is_finite() || self.r_nn <= 0.0 {
            return Err(FaultNetError::InvalidConfig(format!(
                "r_nn must be a finite value greater than zero, got {}",
                self.r_nn
            )));
        }

        if self.dt_nn.is_nan() || self.dt_nn <= 0.0 {
            return Err(FaultNetError::InvalidConfig(format!(
                "dt_nn must be greater than zero, got {}",
                self.dt_nn
            )));
        }

        Ok(())
    }
}

/// Immutable run configuration.
///
/// A run never edits its configuration; per-run variations such as a sweep
/// combination are new values built with [`PipelineConfig::with_search`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub hypo_file: Option<PathBuf>,
    pub hypo_sep: String,
    pub foc_file: Option<PathBuf>,
    pub foc_sep: String,
    pub out_dir: PathBuf,
    pub n_mc: usize,
    pub r_nn: f64,
    pub dt_nn: f64,
    pub mag_type: MagnitudeType,
    pub validation: bool,
    pub foc_mag_check: bool,
    pub foc_loc_check: bool,
    pub mag_tolerance: f64,
    pub loc_tolerance_m: f64,
    pub seed: Option<u64>,
    pub uncertainty_model: UncertaintyModel,
    pub nodal_plane_rule: NodalPlaneRule,
    pub dispersion_ceiling_deg: f64,
    pub min_eigen_gap: f64,
    pub use_low_confidence: bool,
    pub r_nn_list: Option<Vec<f64>>,
    pub dt_nn_list: Option<Vec<f64>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            hypo_file: None,
            hypo_sep: "\t".to_string(),
            foc_file: None,
            foc_sep: ";".to_string(),
            out_dir: PathBuf::from("output-faultnet"),
            n_mc: 1000,
            r_nn: 100.0,
            dt_nn: 26_298.0,
            mag_type: MagnitudeType::Ml,
            validation: true,
            foc_mag_check: true,
            foc_loc_check: true,
            mag_tolerance: 0.3,
            loc_tolerance_m: 500.0,
            seed: None,
            uncertainty_model: UncertaintyModel::Gaussian,
            nodal_plane_rule: NodalPlaneRule::Nearest,
            dispersion_ceiling_deg: 20.0,
            min_eigen_gap: 1.0e-6,
            use_low_confidence: true,
            r_nn_list: None,
            dt_nn_list: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self, FaultNetError> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, FaultNetError> {
        let config: PipelineConfig = toml::from_str(raw)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FaultNetError> {
        self.search().validate()?;

        if self.n_mc == 0 {
            return Err(FaultNetError::InvalidConfig(
                "n_mc must be at least 1".to_string(),
            ));
        }

        parse_delimiter("hypo_sep", &self.hypo_sep)?;
        parse_delimiter("foc_sep", &self.foc_sep)?;

        if !self.mag_tolerance.is_finite() || self.mag_tolerance < 0.0 {
            return Err(FaultNetError::InvalidConfig(
                "mag_tolerance must be finite and non-negative".to_string(),
            ));
        }

        if !self.loc_tolerance_m.is_finite() || self.loc_tolerance_m < 0.0 {
            return Err(FaultNetError::InvalidConfig(
                "loc_tolerance_m must be finite and non-negative".to_string(),
            ));
        }

        if !(self.dispersion_ceiling_deg > 0.0 && self.dispersion_ceiling_deg <= 90.0) {
            return Err(FaultNetError::InvalidConfig(
                "dispersion_ceiling_deg must be in (0, 90]".to_string(),
            ));
        }

        if !(self.min_eigen_gap > 0.0 && self.min_eigen_gap < 1.0) {
            return Err(FaultNetError::InvalidConfig(
                "min_eigen_gap must be in (0, 1)".to_string(),
            ));
        }

        for (name, values) in [("r_nn_list", &self.r_nn_list), ("dt_nn_list", &self.dt_nn_list)] {
            if let Some(values) = values {
                if values.is_empty() {
                    return Err(FaultNetError::InvalidConfig(format!(
                        "{name} must not be empty when given"
                    )));
                }
            }
        }
        for &r_nn in self.r_nn_list.iter().flatten() {
            SearchParams::new(r_nn, self.dt_nn).validate()?;
        }
        for &dt_nn in self.dt_nn_list.iter().flatten() {
            SearchParams::new(self.r_nn, dt_nn).validate()?;
        }

        Ok(())
    }

    pub fn search(&self) -> SearchParams {
        SearchParams::new(self.r_nn, self.dt_nn)
    }

    /// Copy of this configuration with a different search radius and window.
    pub fn with_search(&self, r_nn: f64, dt_nn: f64) -> Self {
        Self {
            r_nn,
            dt_nn,
            ..self.clone()
        }
    }

    pub fn with_seed(&self, seed: u64) -> Self {
        Self {
            seed: Some(seed),
            ..self.clone()
        }
    }

    pub fn hypo_delimiter(&self) -> Result<u8, FaultNetError> {
        parse_delimiter("hypo_sep", &self.hypo_sep)
    }

    pub fn foc_delimiter(&self) -> Result<u8, FaultNetError> {
        parse_delimiter("foc_sep", &self.foc_sep)
    }

    pub fn patch_params(&self) -> PatchParams {
        PatchParams {
            dispersion_ceiling_deg: self.dispersion_ceiling_deg,
            min_eigen_gap: self.min_eigen_gap,
        }
    }

    pub fn validation_params(&self) -> ValidationParams {
        ValidationParams {
            foc_mag_check: self.foc_mag_check,
            foc_loc_check: self.foc_loc_check,
            mag_tolerance: self.mag_tolerance,
            loc_tolerance_m: self.loc_tolerance_m,
            nodal_plane_rule: self.nodal_plane_rule,
            use_low_confidence: self.use_low_confidence,
        }
    }
}

fn parse_delimiter(name: &str, raw: &str) -> Result<u8, FaultNetError> {
    match raw.as_bytes() {
        [byte] if byte.is_ascii() => Ok(*byte),
        _ => Err(FaultNetError::InvalidConfig(format!(
            "{name} must be a single ASCII character, got {raw:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn non_positive_radius_is_rejected() {
        let config = PipelineConfig {
            r_nn: 0.0,
            ..PipelineConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, FaultNetError::InvalidConfig(msg) if msg.contains("r_nn")));
    }

    #[test]
    fn zero_draws_is_rejected() {
        let config = PipelineConfig {
            n_mc: 0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn infinite_window_is_accepted_as_unbounded() {
        let search = SearchParams::new(50.0, f64::INFINITY);
        assert!(search.validate().is_ok());
        assert!(search.time_unbounded());
        assert!(SearchParams::new(50.0, DT_NN_UNBOUNDED).time_unbounded());
        assert!(!SearchParams::new(50.0, 8766.0).time_unbounded());
    }

    #[test]
    fn with_search_leaves_base_untouched() {
        let base = PipelineConfig::default();
        let derived = base.with_search(400.0, 48.0);
        assert_eq!(base.r_nn, 100.0);
        assert_eq!(base.dt_nn, 26_298.0);
        assert_eq!(derived.r_nn, 400.0);
        assert_eq!(derived.dt_nn, 48.0);
        assert_eq!(derived.n_mc, base.n_mc);
    }

    #[test]
    fn sweep_lists_are_checked_value_by_value() {
        let config = PipelineConfig {
            dt_nn_list: Some(vec![24.0, 0.0]),
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
        let empty = PipelineConfig {
            r_nn_list: Some(Vec::new()),
            ..PipelineConfig::default()
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn multi_character_separator_is_rejected() {
        let config = PipelineConfig {
            hypo_sep: ";;".to_string(),
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_overrides_defaults() {
        let raw = r#"
            n_mc = 25
            r_nn = 200.0
            dt_nn = 48.0
            mag_type = "Mw"
            seed = 7
            uncertainty_model = "uniform"
            nodal_plane_rule = "first_plane"
            hypo_sep = ","
        "#;
        let config = PipelineConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.n_mc, 25);
        assert_eq!(config.mag_type, MagnitudeType::Mw);
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.uncertainty_model, UncertaintyModel::Uniform);
        assert_eq!(config.nodal_plane_rule, NodalPlaneRule::FirstPlane);
        assert_eq!(config.hypo_delimiter().unwrap(), b',');
        assert!(config.foc_mag_check);
    }
}
