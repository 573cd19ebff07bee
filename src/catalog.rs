//! Hypocenter catalog.
//!
//! Positions are local Cartesian metres (x east, y north, z up). Geographic
//! input is projected around the catalog mean with an equirectangular
//! projection, which is accurate to well below location uncertainty over the
//! few tens of kilometres a microseismicity study covers.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime};
use csv::{ReaderBuilder, StringRecord, Trim};
use log::warn;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::{DataError, FaultNetError};

pub type HypoId = u64;

const EARTH_RADIUS_M: f64 = 6_371_000.0;
const MS_PER_HOUR: f64 = 3_600_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MagnitudeType {
    /// Local magnitude.
    #[default]
    #[serde(rename = "ML", alias = "ml", alias = "Ml")]
    Ml,
    /// Moment magnitude.
    #[serde(rename = "Mw", alias = "MW", alias = "mw")]
    Mw,
}

impl MagnitudeType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ml" => Some(Self::Ml),
            "mw" => Some(Self::Mw),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ml => "ML",
            Self::Mw => "Mw",
        }
    }
}

impl fmt::Display for MagnitudeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One catalog event.
#[derive(Debug, Clone, PartialEq)]
pub struct Hypocenter {
    pub id: HypoId,
    /// Local position [m], x east, y north, z up.
    pub position: Vector3<f64>,
    pub time: NaiveDateTime,
    pub magnitude: f64,
    pub magnitude_type: MagnitudeType,
    /// 1σ horizontal location uncertainty [m].
    pub horizontal_uncertainty: f64,
    /// 1σ vertical location uncertainty [m].
    pub vertical_uncertainty: f64,
}

impl Hypocenter {
    pub fn new(id: HypoId, position: Vector3<f64>, time: NaiveDateTime) -> Self {
        Self {
            id,
            position,
            time,
            magnitude: 0.0,
            magnitude_type: MagnitudeType::Ml,
            horizontal_uncertainty: 0.0,
            vertical_uncertainty: 0.0,
        }
    }

    pub fn with_magnitude(mut self, magnitude: f64, magnitude_type: MagnitudeType) -> Self {
        self.magnitude = magnitude;
        self.magnitude_type = magnitude_type;
        self
    }

    pub fn with_uncertainty(mut self, horizontal: f64, vertical: f64) -> Self {
        self.horizontal_uncertainty = horizontal;
        self.vertical_uncertainty = vertical;
        self
    }

    pub fn check(&self) -> Result<(), DataError> {
        if !self.position.iter().all(|v| v.is_finite()) {
            return Err(DataError::new("location is not finite").with_id(self.id));
        }
        if !self.magnitude.is_finite() {
            return Err(DataError::new("magnitude is not finite").with_id(self.id));
        }
        for (name, value) in [
            ("horizontal uncertainty", self.horizontal_uncertainty),
            ("vertical uncertainty", self.vertical_uncertainty),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(DataError::new(format!(
                    "{name} must be finite and non-negative, got {value}"
                ))
                .with_id(self.id));
            }
        }
        Ok(())
    }
}

/// Reference point of the local projection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoOrigin {
    pub lat0: f64,
    pub lon0: f64,
}

impl GeoOrigin {
    pub fn project(&self, lat: f64, lon: f64, depth_km: f64) -> Vector3<f64> {
        let x = EARTH_RADIUS_M * (lon - self.lon0).to_radians() * self.lat0.to_radians().cos();
        let y = EARTH_RADIUS_M * (lat - self.lat0).to_radians();
        Vector3::new(x, y, -depth_km * 1000.0)
    }
}

/// Per-file loading outcome. Rejected rows never abort a load.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub rows_read: usize,
    pub accepted: usize,
    pub errors: Vec<DataError>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Immutable, ordered set of hypocenters.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    hypocenters: Vec<Hypocenter>,
    index: HashMap<HypoId, usize>,
    origin: Option<GeoOrigin>,
}

impl CatalogStore {
    pub fn new(hypocenters: Vec<Hypocenter>) -> Result<Self, FaultNetError> {
        let mut index = HashMap::with_capacity(hypocenters.len());
        for (idx, hypo) in hypocenters.iter().enumerate() {
            hypo.check()?;
            if index.insert(hypo.id, idx).is_some() {
                return Err(DataError::new("duplicate hypocenter id")
                    .with_id(hypo.id)
                    .into());
            }
        }

        Ok(Self {
            hypocenters,
            index,
            origin: None,
        })
    }

    pub fn with_origin(mut self, origin: GeoOrigin) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Loads a delimited text catalog.
    ///
    /// Required columns are `id`, `time`, `mag` and either `x, y, z` [m] or
    /// `lat, lon, depth` [deg, deg, km]. `mag_type`, `err_h` and `err_v` [m]
    /// are optional; missing magnitude types fall back to `default_mag_type`.
    pub fn from_delimited(
        path: &Path,
        delimiter: u8,
        default_mag_type: MagnitudeType,
    ) -> Result<(Self, LoadReport), FaultNetError> {
        let mut reader = ReaderBuilder::new()
            .delimiter(delimiter)
            .trim(Trim::All)
            .flexible(true)
            .from_path(path)?;
        let columns = HeaderMap::new(reader.headers()?);
        columns.require(&["id", "time", "mag"], path)?;
        let cartesian = columns.has_all(&["x", "y", "z"]);
        if !cartesian && !columns.has_all(&["lat", "lon", "depth"]) {
            return Err(DataError::new("catalog needs x, y, z or lat, lon, depth columns")
                .with_file(path)
                .into());
        }

        let mut report = LoadReport::default();
        let mut rows = Vec::new();

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
            match parse_catalog_row(&columns, &record, row, cartesian, default_mag_type) {
                Ok(parsed) => rows.push(parsed),
                Err(err) => report.errors.push(err.with_row(row).with_file(path)),
            }
        }

        let origin = if cartesian {
            None
        } else {
            mean_origin(rows.iter().map(|row| (row.coords[0], row.coords[1])))
        };

        let mut hypocenters = Vec::with_capacity(rows.len());
        let mut seen = HashMap::with_capacity(rows.len());
        for row in rows {
            let position = match origin {
                Some(origin) => origin.project(row.coords[0], row.coords[1], row.coords[2]),
                None => Vector3::new(row.coords[0], row.coords[1], row.coords[2]),
            };
            let hypo = Hypocenter {
                id: row.id,
                position,
                time: row.time,
                magnitude: row.magnitude,
                magnitude_type: row.magnitude_type,
                horizontal_uncertainty: row.err_h,
                vertical_uncertainty: row.err_v,
            };

            if let Err(err) = hypo.check() {
                report.errors.push(err.with_row(row.row).with_file(path));
                continue;
            }
            if seen.insert(hypo.id, row.row).is_some() {
                report.errors.push(
                    DataError::new("duplicate hypocenter id")
                        .with_id(hypo.id)
                        .with_row(row.row)
                        .with_file(path),
                );
                continue;
            }
            hypocenters.push(hypo);
        }

        for err in &report.errors {
            warn!("skipping catalog record: {err}");
        }
        report.accepted = hypocenters.len();

        let mut store = Self::new(hypocenters)?;
        store.origin = origin;
        Ok((store, report))
    }

    pub fn len(&self) -> usize {
        self.hypocenters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hypocenters.is_empty()
    }

    pub fn hypocenters(&self) -> &[Hypocenter] {
        &self.hypocenters
    }

    pub fn get(&self, idx: usize) -> Option<&Hypocenter> {
        self.hypocenters.get(idx)
    }

    pub fn index_of(&self, id: HypoId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    pub fn by_id(&self, id: HypoId) -> Option<&Hypocenter> {
        self.index_of(id).map(|idx| &self.hypocenters[idx])
    }

    pub fn origin(&self) -> Option<GeoOrigin> {
        self.origin
    }

    pub fn positions(&self) -> Vec<Vector3<f64>> {
        self.hypocenters.iter().map(|h| h.position).collect()
    }

    /// Event times in hours after the earliest event, catalog order.
    pub fn relative_hours(&self) -> Vec<f64> {
        let Some(t0) = self.hypocenters.iter().map(|h| h.time).min() else {
            return Vec::new();
        };
        self.hypocenters
            .iter()
            .map(|h| h.time.signed_duration_since(t0).num_milliseconds() as f64 / MS_PER_HOUR)
            .collect()
    }
}

struct CatalogRow {
    row: usize,
    id: HypoId,
    time: NaiveDateTime,
    coords: [f64; 3],
    magnitude: f64,
    magnitude_type: MagnitudeType,
    err_h: f64,
    err_v: f64,
}

fn parse_catalog_row(
    columns: &HeaderMap,
    record: &StringRecord,
    row: usize,
    cartesian: bool,
    default_mag_type: MagnitudeType,
) -> Result<CatalogRow, DataError> {
    let id = columns.parse_id(record)?;
    let annotate = |err: DataError| err.with_id(id);

    let time_raw = columns.required(record, "time").map_err(annotate)?;
    let time = parse_time(time_raw).map_err(annotate)?;
    let coords = if cartesian {
        [
            columns.parse_f64(record, "x").map_err(annotate)?,
            columns.parse_f64(record, "y").map_err(annotate)?,
            columns.parse_f64(record, "z").map_err(annotate)?,
        ]
    } else {
        [
            columns.parse_f64(record, "lat").map_err(annotate)?,
            columns.parse_f64(record, "lon").map_err(annotate)?,
            columns.parse_f64(record, "depth").map_err(annotate)?,
        ]
    };
    let magnitude = columns.parse_f64(record, "mag").map_err(annotate)?;
    let magnitude_type = columns
        .parse_mag_type(record)
        .map_err(annotate)?
        .unwrap_or(default_mag_type);

    Ok(CatalogRow {
        row,
        id,
        time,
        coords,
        magnitude,
        magnitude_type,
        err_h: columns.parse_optional_f64(record, "err_h").map_err(annotate)?.unwrap_or(0.0),
        err_v: columns.parse_optional_f64(record, "err_v").map_err(annotate)?.unwrap_or(0.0),
    })
}

pub(crate) fn mean_origin(points: impl Iterator<Item = (f64, f64)>) -> Option<GeoOrigin> {
    let (mut lat_sum, mut lon_sum, mut count) = (0.0, 0.0, 0usize);
    for (lat, lon) in points {
        lat_sum += lat;
        lon_sum += lon;
        count += 1;
    }
    (count > 0).then(|| GeoOrigin {
        lat0: lat_sum / count as f64,
        lon0: lon_sum / count as f64,
    })
}

pub(crate) fn parse_time(raw: &str) -> Result<NaiveDateTime, DataError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.naive_utc());
    }
    for format in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y/%m/%d %H:%M:%S%.f",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(dt);
        }
    }
    Err(DataError::new(format!("unparseable time {raw:?}")))
}

/// Case-insensitive header lookup with the column aliases the loaders accept.
pub(crate) struct HeaderMap {
    columns: HashMap<String, usize>,
}

impl HeaderMap {
    pub(crate) fn new(headers: &StringRecord) -> Self {
        let mut columns = HashMap::new();
        for (idx, name) in headers.iter().enumerate() {
            let canonical = canonical_column(&name.trim().to_ascii_lowercase());
            columns.entry(canonical).or_insert(idx);
        }
        Self { columns }
    }

    pub(crate) fn has(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub(crate) fn has_all(&self, names: &[&str]) -> bool {
        names.iter().all(|name| self.has(name))
    }

    pub(crate) fn require(&self, names: &[&str], path: &Path) -> Result<(), DataError> {
        let missing: Vec<&str> = names.iter().copied().filter(|n| !self.has(n)).collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(DataError::new(format!("missing columns: {}", missing.join(", "))).with_file(path))
    }

    pub(crate) fn field<'r>(&self, record: &'r StringRecord, name: &str) -> Option<&'r str> {
        self.columns
            .get(name)
            .and_then(|&idx| record.get(idx))
            .filter(|value| !value.is_empty())
    }

    pub(crate) fn required<'r>(
        &self,
        record: &'r StringRecord,
        name: &str,
    ) -> Result<&'r str, DataError> {
        self.field(record, name)
            .ok_or_else(|| DataError::new(format!("missing value for {name}")))
    }

    pub(crate) fn parse_f64(&self, record: &StringRecord, name: &str) -> Result<f64, DataError> {
        self.parse_optional_f64(record, name)?
            .ok_or_else(|| DataError::new(format!("missing value for {name}")))
    }

    pub(crate) fn parse_optional_f64(
        &self,
        record: &StringRecord,
        name: &str,
    ) -> Result<Option<f64>, DataError> {
        let Some(raw) = self.field(record, name) else {
            return Ok(None);
        };
        let value: f64 = raw
            .parse()
            .map_err(|_| DataError::new(format!("{name} is not a number: {raw:?}")))?;
        if !value.is_finite() {
            return Err(DataError::new(format!("{name} is not finite")));
        }
        Ok(Some(value))
    }

    pub(crate) fn parse_id(&self, record: &StringRecord) -> Result<HypoId, DataError> {
        let raw = self.required(record, "id")?;
        raw.parse()
            .map_err(|_| DataError::new(format!("id is not an unsigned integer: {raw:?}")))
    }

    pub(crate) fn parse_mag_type(
        &self,
        record: &StringRecord,
    ) -> Result<Option<MagnitudeType>, DataError> {
        match self.field(record, "mag_type") {
            None => Ok(None),
            Some(raw) => MagnitudeType::parse(raw)
                .map(Some)
                .ok_or_else(|| DataError::new(format!("unknown magnitude type {raw:?}"))),
        }
    }
}

fn canonical_column(name: &str) -> String {
    match name {
        "latitude" => "lat",
        "longitude" => "lon",
        "depth_km" => "depth",
        "magnitude" => "mag",
        "magtype" | "magnitude_type" => "mag_type",
        "eh" | "err_h_m" => "err_h",
        "ez" | "err_v_m" => "err_v",
        "datetime" | "origin_time" => "time",
        other => other,
    }
    .to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Write;

    use approx::assert_relative_eq;
    use chrono::{Duration, NaiveDate};

    use super::*;

    pub(crate) fn epoch() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2020, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap()
    }

    pub(crate) fn hypo(id: HypoId, x: f64, y: f64, z: f64, hours: i64) -> Hypocenter {
        Hypocenter::new(id, Vector3::new(x, y, z), epoch() + Duration::hours(hours))
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let result = CatalogStore::new(vec![hypo(1, 0.0, 0.0, 0.0, 0), hypo(1, 1.0, 0.0, 0.0, 0)]);
        assert!(matches!(result, Err(FaultNetError::Data(_))));
    }

    #[test]
    fn relative_hours_start_at_earliest_event() {
        let store =
            CatalogStore::new(vec![hypo(1, 0.0, 0.0, 0.0, 10), hypo(2, 0.0, 0.0, 0.0, 4)]).unwrap();
        assert_eq!(store.relative_hours(), vec![6.0, 0.0]);
        assert_eq!(store.index_of(2), Some(1));
    }

    #[test]
    fn projection_is_metric_near_origin() {
        let origin = GeoOrigin { lat0: 46.0, lon0: 7.0 };
        let p = origin.project(46.01, 7.0, 5.0);
        assert_relative_eq!(p.y, 1111.95, epsilon = 0.1);
        assert_relative_eq!(p.x, 0.0);
        assert_relative_eq!(p.z, -5000.0);
    }

    #[test]
    fn time_formats_are_accepted() {
        assert!(parse_time("2021-03-04T05:06:07.25").is_ok());
        assert!(parse_time("2021-03-04 05:06:07").is_ok());
        assert!(parse_time("2021/03/04 05:06:07.5").is_ok());
        assert!(parse_time("2021-03-04T05:06:07Z").is_ok());
        assert!(parse_time("yesterday").is_err());
    }

    #[test]
    fn loader_collects_bad_rows_and_keeps_good_ones() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "ID\tTime\tLatitude\tLongitude\tDepth\tMag\tEH\tEZ").unwrap();
        writeln!(file, "1\t2020-01-01T00:00:00\t46.30\t7.45\t4.0\t1.2\t30\t60").unwrap();
        writeln!(file, "2\t2020-01-01T01:00:00\t46.31\t7.46\t4.1\t0.8\t30\t60").unwrap();
        writeln!(file, "3\tnot-a-time\t46.31\t7.46\t4.1\t0.8\t30\t60").unwrap();
        writeln!(file, "4\t2020-01-01T02:00:00\t\t7.46\t4.1\t0.8\t30\t60").unwrap();
        writeln!(file, "2\t2020-01-01T03:00:00\t46.32\t7.47\t4.2\t0.9\t30\t60").unwrap();
        file.flush().unwrap();

        let (store, report) =
            CatalogStore::from_delimited(file.path(), b'\t', MagnitudeType::Ml).unwrap();
        assert_eq!(report.rows_read, 5);
        assert_eq!(report.accepted, 2);
        assert_eq!(report.errors.len(), 3);
        assert_eq!(store.len(), 2);
        assert!(store.origin().is_some());
        let first = store.by_id(1).unwrap();
        assert_eq!(first.magnitude_type, MagnitudeType::Ml);
        assert_relative_eq!(first.horizontal_uncertainty, 30.0);
        assert_relative_eq!(first.position.z, -4000.0);
    }

    #[test]
    fn undecodable_row_does_not_abort_the_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "id\ttime\tx\ty\tz\tmag").unwrap();
        writeln!(file, "1\t2020-01-01T00:00:00\t0\t0\t-2000\t1.0").unwrap();
        file.write_all(b"2\t2020-01-01T01:00:00\t\xff\xfe\t0\t-2000\t1.0\n")
            .unwrap();
        writeln!(file, "3\t2020-01-01T02:00:00\t20\t0\t-2000\t1.0").unwrap();
        file.flush().unwrap();

        let (store, report) =
            CatalogStore::from_delimited(file.path(), b'\t', MagnitudeType::Mw).unwrap();
        assert_eq!(report.rows_read, 3);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].row, Some(2));
        assert_eq!(store.len(), 2);
        assert!(store.by_id(2).is_none());
        assert_eq!(store.by_id(3).unwrap().magnitude_type, MagnitudeType::Mw);
    }

    #[test]
    fn loader_rejects_files_without_coordinates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "id;time;mag").unwrap();
        writeln!(file, "1;2020-01-01T00:00:00;1.0").unwrap();
        file.flush().unwrap();

        let result = CatalogStore::from_delimited(file.path(), b';', MagnitudeType::Ml);
        assert!(matches!(result, Err(FaultNetError::Data(_))));
    }
}
