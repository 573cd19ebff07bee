//! Plane fitting and axial statistics.
//!
//! Fault normals are axes: `n` and `-n` describe the same plane. Every
//! comparison and average in this module is sign-invariant, and normals are
//! reported in the upper hemisphere.
//!
//! Orientation conventions: x east, y north, z up; strike clockwise from
//! north in degrees, dip direction 90° clockwise from strike (right-hand
//! rule), rake in the Aki & Richards sense.

use nalgebra::{Matrix3, SymmetricEigen, Vector3};
use thiserror::Error;

/// Spread [m²] below which a point set is treated as a single point.
const COINCIDENT_VARIANCE: f64 = 1.0e-12;
const FLAT: f64 = 1.0e-12;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeometryError {
    #[error("plane fit needs at least 3 points, got {count}")]
    TooFewPoints { count: usize },
    #[error("points are coincident")]
    Coincident,
    #[error("no preferred plane: relative eigenvalue gap {relative_gap:.3e}")]
    IllConditioned { relative_gap: f64 },
}

/// Least-squares plane through a point set.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaneFit {
    /// Unit normal in the upper hemisphere.
    pub normal: Vector3<f64>,
    pub centroid: Vector3<f64>,
    /// Covariance eigenvalues, ascending [m²].
    pub eigenvalues: [f64; 3],
}

impl PlaneFit {
    /// `(λmid - λmin) / λmax`; near zero when the normal is undetermined.
    pub fn relative_gap(&self) -> f64 {
        let [min, mid, max] = self.eigenvalues;
        (mid - min) / max
    }
}

/// Eigenpairs of a symmetric 3×3 matrix sorted by ascending eigenvalue.
fn sorted_eigen(matrix: Matrix3<f64>) -> [(f64, Vector3<f64>); 3] {
    let eigen = SymmetricEigen::new(matrix);
    let mut pairs = [0usize, 1, 2].map(|k| {
        (
            eigen.eigenvalues[k],
            eigen.eigenvectors.column(k).into_owned(),
        )
    });
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    pairs
}

/// Fits a plane by taking the smallest-eigenvalue eigenvector of the point
/// covariance.
///
/// Coincident points, collinear points and isotropic blobs all leave the two
/// smallest eigenvalues (nearly) equal; they are refused once the relative
/// gap drops below `min_eigen_gap` instead of returning an arbitrary normal.
pub fn fit_plane<'p, I>(points: I, min_eigen_gap: f64) -> Result<PlaneFit, GeometryError>
where
    I: IntoIterator<Item = &'p Vector3<f64>>,
    I::IntoIter: Clone,
{
    let points = points.into_iter();
    let count = points.clone().count();
    if count < 3 {
        return Err(GeometryError::TooFewPoints { count });
    }

    let centroid = points.clone().fold(Vector3::<f64>::zeros(), |acc, p| acc + p) / count as f64;
    let covariance = points.fold(Matrix3::<f64>::zeros(), |acc, p| {
        let d = p - centroid;
        acc + d * d.transpose()
    }) / count as f64;

    let [(min, normal), (mid, _), (max, _)] = sorted_eigen(covariance);
    if max <= COINCIDENT_VARIANCE {
        return Err(GeometryError::Coincident);
    }

    let relative_gap = (mid - min) / max;
    if relative_gap < min_eigen_gap {
        return Err(GeometryError::IllConditioned { relative_gap });
    }

    Ok(PlaneFit {
        normal: canonical_hemisphere(normal.normalize()),
        centroid,
        eigenvalues: [min.max(0.0), mid, max],
    })
}

/// Picks the upper-hemisphere representative of `±v`.
///
/// Horizontal axes are resolved toward +y, then +x.
pub fn canonical_hemisphere(v: Vector3<f64>) -> Vector3<f64> {
    let flip = if v.z.abs() > FLAT {
        v.z < 0.0
    } else if v.y.abs() > FLAT {
        v.y < 0.0
    } else {
        v.x < 0.0
    };
    if flip {
        -v
    } else {
        v
    }
}

/// Angle between two axes in degrees, always within [0, 90].
pub fn axial_angle_deg(a: &Vector3<f64>, b: &Vector3<f64>) -> f64 {
    let cos = (a.dot(b) / (a.norm() * b.norm())).abs().min(1.0);
    cos.acos().to_degrees()
}

/// Sign-invariant mean of a set of axes.
#[derive(Debug, Clone, PartialEq)]
pub struct AxialMean {
    /// Principal eigenvector of the orientation tensor, upper hemisphere.
    pub axis: Vector3<f64>,
    /// RMS angle [deg] between the input axes and `axis`.
    pub dispersion_deg: f64,
    /// Largest eigenvalue of the normalised orientation tensor, in [1/3, 1].
    pub concentration: f64,
}

impl AxialMean {
    /// Mean axis from the orientation tensor `Σ n nᵀ / N`.
    ///
    /// Flipping any input's sign leaves the tensor unchanged, so axes that
    /// straddle the hemisphere boundary do not bias the result the way a
    /// plain vector sum would. The sum runs in input order.
    pub fn from_axes(axes: &[Vector3<f64>]) -> Option<Self> {
        let mut tensor = OrientationTensor::new();
        axes.iter().for_each(|n| tensor.push(n));
        let (axis, concentration) = tensor.principal_axis()?;

        let mut spread = AngularSpread::new(axis);
        axes.iter().for_each(|n| spread.push(n));
        Some(spread.finish(concentration))
    }
}

/// Running sum of `n nᵀ` over unit axes, fed in a fixed order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrientationTensor {
    sum: Matrix3<f64>,
    count: usize,
}

impl Default for OrientationTensor {
    fn default() -> Self {
        Self::new()
    }
}

impl OrientationTensor {
    pub fn new() -> Self {
        Self {
            sum: Matrix3::<f64>::zeros(),
            count: 0,
        }
    }

    pub fn push(&mut self, axis: &Vector3<f64>) {
        let u = axis.normalize();
        self.sum += u * u.transpose();
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Principal axis (upper hemisphere) and its eigenvalue, `None` when empty.
    pub fn principal_axis(&self) -> Option<(Vector3<f64>, f64)> {
        if self.count == 0 {
            return None;
        }
        let tensor = self.sum / self.count as f64;
        let [_, _, (concentration, principal)] = sorted_eigen(tensor);
        Some((canonical_hemisphere(principal.normalize()), concentration))
    }
}

/// Running RMS angle of axes around a fixed mean axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AngularSpread {
    axis: Vector3<f64>,
    sum_sq: f64,
    count: usize,
}

impl AngularSpread {
    pub fn new(axis: Vector3<f64>) -> Self {
        Self {
            axis,
            sum_sq: 0.0,
            count: 0,
        }
    }

    pub fn push(&mut self, axis: &Vector3<f64>) {
        self.sum_sq += axial_angle_deg(axis, &self.axis).powi(2);
        self.count += 1;
    }

    pub fn finish(self, concentration: f64) -> AxialMean {
        let dispersion_deg = if self.count == 0 {
            0.0
        } else {
            (self.sum_sq / self.count as f64).sqrt()
        };
        AxialMean {
            axis: self.axis,
            dispersion_deg,
            concentration,
        }
    }
}

/// Upward unit normal of the plane with the given strike and dip.
pub fn normal_from_strike_dip(strike_deg: f64, dip_deg: f64) -> Vector3<f64> {
    let (phi, delta) = (strike_deg.to_radians(), dip_deg.to_radians());
    Vector3::new(delta.sin() * phi.cos(), -delta.sin() * phi.sin(), delta.cos())
}

/// Strike and dip [deg] of the plane with normal `normal`.
pub fn strike_dip_from_normal(normal: &Vector3<f64>) -> (f64, f64) {
    let n = canonical_hemisphere(normal.normalize());
    let dip = n.z.clamp(-1.0, 1.0).acos().to_degrees();
    if n.x.abs() < FLAT && n.y.abs() < FLAT {
        return (0.0, dip);
    }
    let strike = (-n.y).atan2(n.x).to_degrees().rem_euclid(360.0);
    (strike, dip)
}

/// Unit vectors along strike and down dip for a plane with normal `normal`.
pub fn plane_basis(normal: &Vector3<f64>) -> (Vector3<f64>, Vector3<f64>) {
    let (strike, dip) = strike_dip_from_normal(normal);
    let (phi, delta) = (strike.to_radians(), dip.to_radians());
    let along_strike = Vector3::new(phi.sin(), phi.cos(), 0.0);
    let down_dip = Vector3::new(delta.cos() * phi.cos(), -delta.cos() * phi.sin(), -delta.sin());
    (along_strike, down_dip)
}

/// Hanging-wall slip direction for a nodal plane and rake.
///
/// This is the normal of the auxiliary nodal plane.
pub fn slip_vector(strike_deg: f64, dip_deg: f64, rake_deg: f64) -> Vector3<f64> {
    let (phi, delta, lambda) = (
        strike_deg.to_radians(),
        dip_deg.to_radians(),
        rake_deg.to_radians(),
    );
    let along_strike = Vector3::new(phi.sin(), phi.cos(), 0.0);
    let up_dip = -Vector3::new(delta.cos() * phi.cos(), -delta.cos() * phi.sin(), -delta.sin());
    along_strike * lambda.cos() + up_dip * lambda.sin()
}

/// Rotates `v` by `angle_deg` about `axis` (Rodrigues).
pub fn rotate_about(v: &Vector3<f64>, axis: &Vector3<f64>, angle_deg: f64) -> Vector3<f64> {
    let k = axis.normalize();
    let (sin, cos) = angle_deg.to_radians().sin_cos();
    v * cos + k.cross(v) * sin + k * k.dot(v) * (1.0 - cos)
}
