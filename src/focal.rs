//! Focal mechanisms and their loader.

use std::collections::HashMap;
use std::path::Path;

use csv::{ReaderBuilder, StringRecord, Trim};
use log::warn;
use nalgebra::Vector3;

use crate::catalog::{CatalogStore, GeoOrigin, HeaderMap, HypoId, LoadReport, MagnitudeType};
use crate::geometry::{canonical_hemisphere, normal_from_strike_dip, slip_vector};
use crate::{DataError, FaultNetError};

/// Double-couple solution for one catalog event.
///
/// Nodal-plane normals are stored as unit vectors in the upper hemisphere.
#[derive(Debug, Clone, PartialEq)]
pub struct FocalMechanism {
    pub hypocenter_id: HypoId,
    pub nodal_plane_1: Vector3<f64>,
    pub nodal_plane_2: Vector3<f64>,
    pub magnitude: f64,
    pub magnitude_type: MagnitudeType,
    /// Reported source location [m], same frame as the catalog.
    pub location: Vector3<f64>,
}

impl FocalMechanism {
    /// Builds a mechanism from explicit nodal-plane normals of any length and sign.
    pub fn from_normals(
        hypocenter_id: HypoId,
        location: Vector3<f64>,
        normal_1: Vector3<f64>,
        normal_2: Vector3<f64>,
    ) -> Result<Self, DataError> {
        let unit = |n: Vector3<f64>, plane: u8| -> Result<Vector3<f64>, DataError> {
            let norm = n.norm();
            if !norm.is_finite() || norm < 1.0e-9 {
                return Err(DataError::new(format!(
                    "nodal plane {plane} normal is zero or not finite"
                ))
                .with_id(hypocenter_id));
            }
            Ok(canonical_hemisphere(n / norm))
        };

        if !location.iter().all(|v| v.is_finite()) {
            return Err(DataError::new("mechanism location is not finite").with_id(hypocenter_id));
        }

        Ok(Self {
            hypocenter_id,
            nodal_plane_1: unit(normal_1, 1)?,
            nodal_plane_2: unit(normal_2, 2)?,
            magnitude: 0.0,
            magnitude_type: MagnitudeType::Ml,
            location,
        })
    }

    /// Builds a mechanism from the strike and dip [deg] of both nodal planes.
    pub fn from_strike_dip(
        hypocenter_id: HypoId,
        location: Vector3<f64>,
        plane_1: (f64, f64),
        plane_2: (f64, f64),
    ) -> Result<Self, DataError> {
        check_angles(hypocenter_id, 1, plane_1.0, plane_1.1)?;
        check_angles(hypocenter_id, 2, plane_2.0, plane_2.1)?;
        Self::from_normals(
            hypocenter_id,
            location,
            normal_from_strike_dip(plane_1.0, plane_1.1),
            normal_from_strike_dip(plane_2.0, plane_2.1),
        )
    }

    /// Builds a mechanism from strike, dip and rake [deg] of nodal plane 1.
    ///
    /// The auxiliary plane is the one normal to the slip vector.
    pub fn from_strike_dip_rake(
        hypocenter_id: HypoId,
        location: Vector3<f64>,
        strike: f64,
        dip: f64,
        rake: f64,
    ) -> Result<Self, DataError> {
        check_angles(hypocenter_id, 1, strike, dip)?;
        if !rake.is_finite() {
            return Err(DataError::new("rake is not finite").with_id(hypocenter_id));
        }
        Self::from_normals(
            hypocenter_id,
            location,
            normal_from_strike_dip(strike, dip),
            slip_vector(strike, dip, rake),
        )
    }

    pub fn with_magnitude(mut self, magnitude: f64, magnitude_type: MagnitudeType) -> Self {
        self.magnitude = magnitude;
        self.magnitude_type = magnitude_type;
        self
    }

    pub fn normals(&self) -> [Vector3<f64>; 2] {
        [self.nodal_plane_1, self.nodal_plane_2]
    }
}

fn check_angles(id: HypoId, plane: u8, strike: f64, dip: f64) -> Result<(), DataError> {
    if !strike.is_finite() {
        return Err(DataError::new(format!("strike{plane} is not finite")).with_id(id));
    }
    if !(0.0..=90.0).contains(&dip) {
        return Err(
            DataError::new(format!("dip{plane} must be within [0, 90], got {dip}")).with_id(id),
        );
    }
    Ok(())
}

/// Read-only set of focal mechanisms keyed by hypocenter id.
#[derive(Debug, Clone, Default)]
pub struct FocalCatalog {
    mechanisms: Vec<FocalMechanism>,
    index: HashMap<HypoId, usize>,
}

impl FocalCatalog {
    pub fn new(mechanisms: Vec<FocalMechanism>) -> Result<Self, FaultNetError> {
        let mut index = HashMap::with_capacity(mechanisms.len());
        for (idx, mechanism) in mechanisms.iter().enumerate() {
            if index.insert(mechanism.hypocenter_id, idx).is_some() {
                return Err(DataError::new("duplicate focal mechanism")
                    .with_id(mechanism.hypocenter_id)
                    .into());
            }
        }
        Ok(Self { mechanisms, index })
    }

    /// Loads a delimited mechanism file.
    ///
    /// Columns: `id`, `mag`, optional `mag_type`, `x, y, z` [m] or
    /// `lat, lon, depth` [deg, deg, km], `strike1`, `dip1`, and either
    /// `strike2, dip2` or `rake1`. Missing magnitude types fall back to
    /// `default_mag_type`, as in the catalog loader. Geographic files are
    /// projected with `origin`, which must be the catalog's so both share
    /// one frame.
    pub fn from_delimited(
        path: &Path,
        delimiter: u8,
        default_mag_type: MagnitudeType,
        origin: Option<GeoOrigin>,
    ) -> Result<(Self, LoadReport), FaultNetError> {
        let mut reader = ReaderBuilder::new()
            .delimiter(delimiter)
            .trim(Trim::All)
            .flexible(true)
            .from_path(path)?;
        let columns = HeaderMap::new(reader.headers()?);
        columns.require(&["id", "mag", "strike1", "dip1"], path)?;

        let frame = if columns.has_all(&["x", "y", "z"]) {
            Frame::Cartesian
        } else if columns.has_all(&["lat", "lon", "depth"]) {
            match origin {
                Some(origin) => Frame::Geographic(origin),
                None => {
                    return Err(DataError::new(
                        "geographic mechanism file needs the catalog projection origin",
                    )
                    .with_file(path)
                    .into())
                }
            }
        } else {
            return Err(DataError::new("mechanism file needs x, y, z or lat, lon, depth columns")
                .with_file(path)
                .into());
        };

        let mut report = LoadReport::default();
        let mut mechanisms = Vec::new();
        let mut seen = HashMap::new();

        for (row_idx, record) in reader.records().enumerate() {
            let row = row_idx + 1;
            report.rows_read += 1;
            let record = match record {
                Ok(record) => record,
                Err(err) => {
                    report
                        .errors
                        .push(DataError::new(err.to_string()).with_row(row).with_file(path));
                    continue;
                }
            };
            let mechanism = match parse_mechanism_row(&columns, &record, frame, default_mag_type) {
                Ok(mechanism) => mechanism,
                Err(err) => {
                    report.errors.push(err.with_row(row).with_file(path));
                    continue;
                }
            };
            if seen.insert(mechanism.hypocenter_id, row).is_some() {
                report.errors.push(
                    DataError::new("duplicate focal mechanism")
                        .with_id(mechanism.hypocenter_id)
                        .with_row(row)
                        .with_file(path),
                );
                continue;
            }
            mechanisms.push(mechanism);
        }

        for err in &report.errors {
            warn!("skipping focal mechanism: {err}");
        }
        report.accepted = mechanisms.len();

        Ok((Self::new(mechanisms)?, report))
    }

    pub fn len(&self) -> usize {
        self.mechanisms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mechanisms.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FocalMechanism> {
        self.mechanisms.iter()
    }

    pub fn by_id(&self, id: HypoId) -> Option<&FocalMechanism> {
        self.index.get(&id).map(|&idx| &self.mechanisms[idx])
    }

    /// Ids of mechanisms with no event in `catalog`, in file order.
    pub fn orphans(&self, catalog: &CatalogStore) -> Vec<HypoId> {
        self.mechanisms
            .iter()
            .map(|m| m.hypocenter_id)
            .filter(|&id| catalog.index_of(id).is_none())
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
enum Frame {
    Cartesian,
    Geographic(GeoOrigin),
}

fn parse_mechanism_row(
    columns: &HeaderMap,
    record: &StringRecord,
    frame: Frame,
    default_mag_type: MagnitudeType,
) -> Result<FocalMechanism, DataError> {
    let id = columns.parse_id(record)?;
    let annotate = |err: DataError| err.with_id(id);

    let location = match frame {
        Frame::Cartesian => Vector3::new(
            columns.parse_f64(record, "x").map_err(annotate)?,
            columns.parse_f64(record, "y").map_err(annotate)?,
            columns.parse_f64(record, "z").map_err(annotate)?,
        ),
        Frame::Geographic(origin) => origin.project(
            columns.parse_f64(record, "lat").map_err(annotate)?,
            columns.parse_f64(record, "lon").map_err(annotate)?,
            columns.parse_f64(record, "depth").map_err(annotate)?,
        ),
    };
    let magnitude = columns.parse_f64(record, "mag").map_err(annotate)?;
    let magnitude_type = columns
        .parse_mag_type(record)
        .map_err(annotate)?
        .unwrap_or(default_mag_type);

    let strike1 = columns.parse_f64(record, "strike1").map_err(annotate)?;
    let dip1 = columns.parse_f64(record, "dip1").map_err(annotate)?;
    let strike2 = columns.parse_optional_f64(record, "strike2").map_err(annotate)?;
    let dip2 = columns.parse_optional_f64(record, "dip2").map_err(annotate)?;
    let rake1 = columns.parse_optional_f64(record, "rake1").map_err(annotate)?;

    let mechanism = match (strike2, dip2, rake1) {
        (Some(strike2), Some(dip2), _) => {
            FocalMechanism::from_strike_dip(id, location, (strike1, dip1), (strike2, dip2))?
        }
        (_, _, Some(rake1)) => {
            FocalMechanism::from_strike_dip_rake(id, location, strike1, dip1, rake1)?
        }
        _ => {
            return Err(
                DataError::new("nodal plane 2 needs strike2 and dip2, or rake1").with_id(id),
            )
        }
    };

    Ok(mechanism.with_magnitude(magnitude, magnitude_type))
}
