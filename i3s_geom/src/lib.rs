//! Oriented bounding boxes and bounding spheres for point sets.
//!
//! Computes an oriented bounding box (OBB) and a concentric minimum bounding
//! sphere (MBS) from an arbitrary point set using a projection-hull basis:
//! a fixed set of 16 candidate axis directions (the vertex pairs of a
//! rhombic triacontahedron, split across [`icosahedral_basis`] and
//! [`dodecahedral_basis`]) is projected against, plus the principal axes of
//! the point covariance, and the cheapest box (by the requested [`FitMetric`])
//! among all candidates wins.
//!
//! This covers the fixed-direction half of the documented candidate search;
//! it does not add the auxiliary disdyakis-dodecahedron basis or the
//! per-face "rolling" refinement over the point set's actual convex hull --
//! see `DESIGN.md`'s Open Question entry on bounding-volume fitting for why.

#![deny(unsafe_op_in_unsafe_fn)]

use glam::{DVec3, Mat3, Quat, Vec3};

/// The metric used to pick the best-fitting candidate orientation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FitMetric {
    MinDiameter,
    #[default]
    MinSurfaceArea,
    MinVolume,
}

/// An oriented bounding box: center, half-extents along the box's own axes,
/// and the unit quaternion rotating the box's local axes into world space.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Obb {
    pub center: DVec3,
    pub extents: Vec3,
    pub orientation: Quat,
}

/// Minimum bounding sphere, concentric with an [`Obb`]'s center.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BoundingSphere {
    pub center: DVec3,
    pub radius: f32,
}

/// Snap tolerance: an axis within this angle (in cosine terms) of a world
/// axis is replaced by that world axis, to avoid numerical jitter in
/// otherwise axis-aligned inputs.
const AXIS_SNAP_COS: f64 = 0.999999;

/// 6 unit vectors through opposite vertex pairs of an icosahedron.
fn icosahedral_basis() -> [Vec3; 6] {
    let phi = 1.618_034_f32;
    let n = (1.0 + phi * phi).sqrt();
    [
        Vec3::new(0.0, 1.0, phi) / n,
        Vec3::new(0.0, 1.0, -phi) / n,
        Vec3::new(1.0, phi, 0.0) / n,
        Vec3::new(1.0, -phi, 0.0) / n,
        Vec3::new(phi, 0.0, 1.0) / n,
        Vec3::new(phi, 0.0, -1.0) / n,
    ]
}

/// 10 unit vectors through opposite vertex pairs of a dodecahedron (the 4
/// cube-diagonal directions plus 6 more through its remaining vertices).
/// Combined with [`icosahedral_basis`], these 16 directions are the vertex
/// pairs of a rhombic triacontahedron -- see the module doc comment for why
/// the basis stops here instead of reproducing the full reference set.
fn dodecahedral_basis() -> [Vec3; 10] {
    let phi = 1.618_034_f32;
    let inv_phi = 1.0 / phi;
    let n_cube = 3.0f32.sqrt();
    let n_rect = (phi * phi + inv_phi * inv_phi).sqrt();
    [
        Vec3::new(1.0, 1.0, 1.0) / n_cube,
        Vec3::new(1.0, 1.0, -1.0) / n_cube,
        Vec3::new(1.0, -1.0, 1.0) / n_cube,
        Vec3::new(1.0, -1.0, -1.0) / n_cube,
        Vec3::new(0.0, inv_phi, phi) / n_rect,
        Vec3::new(0.0, inv_phi, -phi) / n_rect,
        Vec3::new(inv_phi, phi, 0.0) / n_rect,
        Vec3::new(inv_phi, -phi, 0.0) / n_rect,
        Vec3::new(phi, 0.0, inv_phi) / n_rect,
        Vec3::new(phi, 0.0, -inv_phi) / n_rect,
    ]
}

fn snap_axis(axis: Vec3) -> Vec3 {
    for world in [Vec3::X, Vec3::Y, Vec3::Z] {
        if (axis.dot(world).abs() as f64) >= AXIS_SNAP_COS {
            return world * axis.dot(world).signum();
        }
    }
    axis
}

/// Builds an orthonormal right-handed triple from a primary axis.
fn complete_basis(primary: Vec3) -> Mat3 {
    let primary = primary.normalize();
    let helper = if primary.x.abs() < 0.9 { Vec3::X } else { Vec3::Y };
    let second = (helper - primary * helper.dot(primary)).normalize();
    let third = primary.cross(second);
    Mat3::from_cols(primary, second, third)
}

/// Principal axes of the point covariance matrix (PCA), via Jacobi
/// eigenvalue iteration on the symmetric 3x3 covariance.
fn pca_axes(points: &[Vec3], centroid: Vec3) -> Mat3 {
    let mut cov = Mat3::ZERO;
    for &p in points {
        let d = p - centroid;
        cov.x_axis += d * d.x;
        cov.y_axis += d * d.y;
        cov.z_axis += d * d.z;
    }
    let n = points.len().max(1) as f32;
    cov.x_axis /= n;
    cov.y_axis /= n;
    cov.z_axis /= n;

    jacobi_eigenvectors(cov)
}

/// Classic cyclic Jacobi eigenvalue sweep for a symmetric 3x3 matrix.
/// Returns the eigenvectors as the columns of the result.
fn jacobi_eigenvectors(cov: Mat3) -> Mat3 {
    let mut a = [
        [cov.x_axis.x, cov.y_axis.x, cov.z_axis.x],
        [cov.x_axis.y, cov.y_axis.y, cov.z_axis.y],
        [cov.x_axis.z, cov.y_axis.z, cov.z_axis.z],
    ];
    let mut v = [[1.0f32, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

    for _ in 0..24 {
        let (mut p, mut q, mut max_off) = (0usize, 1usize, 0.0f32);
        for (i, j) in [(0usize, 1usize), (0, 2), (1, 2)] {
            if a[i][j].abs() > max_off {
                max_off = a[i][j].abs();
                p = i;
                q = j;
            }
        }
        if max_off < 1e-9 {
            break;
        }

        let theta = 0.5 * (2.0 * a[p][q]).atan2(a[q][q] - a[p][p]);
        let (s, c) = theta.sin_cos();

        for k in 0..3 {
            let akp = a[k][p];
            let akq = a[k][q];
            a[k][p] = c * akp - s * akq;
            a[k][q] = s * akp + c * akq;
        }
        for k in 0..3 {
            let apk = a[p][k];
            let aqk = a[q][k];
            a[p][k] = c * apk - s * aqk;
            a[q][k] = s * apk + c * aqk;
        }
        for k in 0..3 {
            let vkp = v[k][p];
            let vkq = v[k][q];
            v[k][p] = c * vkp - s * vkq;
            v[k][q] = s * vkp + c * vkq;
        }
    }

    Mat3::from_cols(
        Vec3::new(v[0][0], v[1][0], v[2][0]).normalize_or_zero(),
        Vec3::new(v[0][1], v[1][1], v[2][1]).normalize_or_zero(),
        Vec3::new(v[0][2], v[1][2], v[2][2]).normalize_or_zero(),
    )
}

fn project_extents(points: &[Vec3], center: Vec3, axes: Mat3) -> Vec3 {
    let mut min = Vec3::splat(f32::MAX);
    let mut max = Vec3::splat(f32::MIN);
    for &p in points {
        let d = p - center;
        let proj = Vec3::new(axes.x_axis.dot(d), axes.y_axis.dot(d), axes.z_axis.dot(d));
        min = min.min(proj);
        max = max.max(proj);
    }
    (max - min) * 0.5
}

fn metric_value(extents: Vec3, metric: FitMetric) -> f32 {
    match metric {
        FitMetric::MinDiameter => extents.x.max(extents.y).max(extents.z) * 2.0,
        FitMetric::MinSurfaceArea => {
            2.0 * (extents.x * extents.y + extents.y * extents.z + extents.z * extents.x)
        }
        FitMetric::MinVolume => 8.0 * extents.x * extents.y * extents.z,
    }
}

/// Computes an OBB and a concentric bounding sphere for `points` (in
/// cartesian space). Returns an invalid sentinel OBB (extents at
/// `f32::MAX`, zero center, identity orientation) for empty input -- callers
/// must treat that as a programming error, never as a geometric answer.
pub fn compute_obb(points: &[Vec3], metric: FitMetric) -> (Obb, BoundingSphere) {
    if points.is_empty() {
        return (
            Obb {
                center: DVec3::ZERO,
                extents: Vec3::splat(f32::MAX),
                orientation: Quat::IDENTITY,
            },
            BoundingSphere {
                center: DVec3::ZERO,
                radius: 0.0,
            },
        );
    }

    if points.len() == 1 {
        let p = points[0];
        return (
            Obb {
                center: p.as_dvec3(),
                extents: Vec3::ONE,
                orientation: Quat::IDENTITY,
            },
            BoundingSphere {
                center: p.as_dvec3(),
                radius: 1.0,
            },
        );
    }

    let mut sum = Vec3::ZERO;
    for &p in points {
        sum += p;
    }
    let centroid = sum / points.len() as f32;

    let span = {
        let mut min = Vec3::splat(f32::MAX);
        let mut max = Vec3::splat(f32::MIN);
        for &p in points {
            min = min.min(p);
            max = max.max(p);
        }
        max - min
    };
    if span.length_squared() < 1e-12 {
        return (
            Obb {
                center: centroid.as_dvec3(),
                extents: Vec3::ONE,
                orientation: Quat::IDENTITY,
            },
            BoundingSphere {
                center: centroid.as_dvec3(),
                radius: 1.0,
            },
        );
    }

    let mut candidates = vec![Mat3::IDENTITY, pca_axes(points, centroid)];
    for axis in icosahedral_basis() {
        candidates.push(complete_basis(axis));
    }
    for axis in dodecahedral_basis() {
        candidates.push(complete_basis(axis));
    }

    let mut best: Option<(Mat3, Vec3, f32)> = None;
    for axes in candidates {
        let extents = project_extents(points, centroid, axes);
        let score = metric_value(extents, metric);
        if best.as_ref().map_or(true, |(_, _, s)| score < *s) {
            best = Some((axes, extents, score));
        }
    }
    let (mut axes, extents, _) = best.expect("at least one candidate axis set");

    axes.x_axis = snap_axis(axes.x_axis);
    axes.y_axis = snap_axis(axes.y_axis);
    axes.z_axis = snap_axis(axes.z_axis);
    // Re-orthogonalize after snapping, preserving handedness.
    axes.y_axis = (axes.y_axis - axes.x_axis * axes.x_axis.dot(axes.y_axis)).normalize();
    axes.z_axis = axes.x_axis.cross(axes.y_axis);

    if Mat3::from_cols(axes.x_axis, axes.y_axis, axes.z_axis).determinant() < 0.0 {
        axes.z_axis = -axes.z_axis;
    }

    let extents = project_extents(points, centroid, axes);
    let orientation = Quat::from_mat3(&axes).normalize();

    let center = centroid.as_dvec3();
    let mut radius = 0.0f32;
    for &p in points {
        radius = radius.max((p.as_dvec3() - center).length() as f32);
    }

    (
        Obb {
            center,
            extents,
            orientation,
        },
        BoundingSphere { center, radius },
    )
}

/// Computes the OBB/MBS pair that contains a set of existing OBBs (used by
/// the node assembler to merge children bounding volumes into a parent's
/// when the parent carries no mesh of its own).
pub fn merge_obbs(children: &[Obb]) -> (Obb, BoundingSphere) {
    let mut corners = Vec::with_capacity(children.len() * 8);
    for obb in children {
        corners.extend(obb_corners(obb).map(|c| c.as_vec3()));
    }
    compute_obb(&corners, FitMetric::MinSurfaceArea)
}

/// The eight world-space corners of an OBB.
pub fn obb_corners(obb: &Obb) -> [DVec3; 8] {
    let axes = Mat3::from_quat(obb.orientation);
    let ex = axes.x_axis.as_dvec3() * obb.extents.x as f64;
    let ey = axes.y_axis.as_dvec3() * obb.extents.y as f64;
    let ez = axes.z_axis.as_dvec3() * obb.extents.z as f64;
    let mut out = [DVec3::ZERO; 8];
    let mut i = 0;
    for sx in [-1.0, 1.0] {
        for sy in [-1.0, 1.0] {
            for sz in [-1.0, 1.0] {
                out[i] = obb.center + ex * sx + ey * sy + ez * sz;
                i += 1;
            }
        }
    }
    out
}

/// Returns true if `outer` contains every corner of `inner` within
/// `tolerance`, after projecting the corner into `outer`'s local frame.
pub fn obb_contains(outer: &Obb, inner: &Obb, tolerance: f64) -> bool {
    let axes = Mat3::from_quat(outer.orientation);
    let extents = outer.extents.as_dvec3() + DVec3::splat(tolerance);
    for corner in obb_corners(inner) {
        let d = corner - outer.center;
        let local = DVec3::new(
            axes.x_axis.as_dvec3().dot(d),
            axes.y_axis.as_dvec3().dot(d),
            axes.z_axis.as_dvec3().dot(d),
        );
        if local.x.abs() > extents.x || local.y.abs() > extents.y || local.z.abs() > extents.z {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_point_yields_unit_box() {
        let (obb, sphere) = compute_obb(&[Vec3::new(1.0, 2.0, 3.0)], FitMetric::MinSurfaceArea);
        assert_eq!(obb.extents, Vec3::ONE);
        assert!((sphere.radius - 1.0).abs() < 1e-6);
    }

    #[test]
    fn empty_input_is_invalid_sentinel() {
        let (obb, _) = compute_obb(&[], FitMetric::MinSurfaceArea);
        assert_eq!(obb.extents, Vec3::splat(f32::MAX));
        assert_eq!(obb.center, DVec3::ZERO);
    }

    #[test]
    fn axis_aligned_cube_has_unit_axes() {
        let points = [
            Vec3::new(-1.0, -1.0, -1.0),
            Vec3::new(1.0, -1.0, -1.0),
            Vec3::new(-1.0, 1.0, -1.0),
            Vec3::new(1.0, 1.0, -1.0),
            Vec3::new(-1.0, -1.0, 1.0),
            Vec3::new(1.0, -1.0, 1.0),
            Vec3::new(-1.0, 1.0, 1.0),
            Vec3::new(1.0, 1.0, 1.0),
        ];
        let (obb, _) = compute_obb(&points, FitMetric::MinSurfaceArea);
        assert!((obb.orientation.length() - 1.0).abs() < 1e-6);
        let axes = Mat3::from_quat(obb.orientation);
        assert!((axes.x_axis.length() - 1.0).abs() < 1e-6);
        assert!((axes.y_axis.length() - 1.0).abs() < 1e-6);
        assert!((axes.z_axis.length() - 1.0).abs() < 1e-6);
        assert!((obb.extents.x - 1.0).abs() < 1e-3);
    }

    #[test]
    fn parent_obb_contains_children() {
        let a = Obb {
            center: DVec3::new(-2.0, 0.0, 0.0),
            extents: Vec3::ONE,
            orientation: Quat::IDENTITY,
        };
        let b = Obb {
            center: DVec3::new(2.0, 0.0, 0.0),
            extents: Vec3::ONE,
            orientation: Quat::IDENTITY,
        };
        let (parent, _) = merge_obbs(&[a, b]);
        assert!(obb_contains(&parent, &a, 1e-6));
        assert!(obb_contains(&parent, &b, 1e-6));
    }
}
