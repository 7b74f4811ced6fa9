//! In-memory conditioned-mesh representation (§4.2).
//!
//! Carries a mesh through the node assembler's conditioning steps (region
//! absorption, normal/color dropping, UV sanitization, coordinate re-origin)
//! without copying large buffers gratuitously.

use glam::{DVec3, Vec2, Vec3};

use crate::AttributeMask;

/// A value array plus a per-element index into it -- used for UV-regions
/// (deduplicated atlas rectangles) and feature IDs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IndexedValues<T> {
    pub values: Vec<T>,
    pub indices: Vec<u32>,
}

impl<T: Clone + PartialEq> IndexedValues<T> {
    /// Builds an indexed array from one raw value per element, deduplicating
    /// equal values into a single shared entry (spec: "reindexes UV-regions
    /// so the value array holds only unique quadruples").
    pub fn from_raw(raw: Vec<T>) -> Self {
        let mut values = Vec::new();
        let mut indices = Vec::with_capacity(raw.len());
        for item in raw {
            let idx = match values.iter().position(|v| *v == item) {
                Some(idx) => idx,
                None => {
                    values.push(item);
                    values.len() - 1
                }
            };
            indices.push(idx as u32);
        }
        Self { values, indices }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn resolved(&self) -> impl Iterator<Item = &T> + '_ {
        self.indices.iter().map(|&i| &self.values[i as usize])
    }
}

/// A UV-atlas sub-rectangle: `(umin, vmin, umax, vmax)`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct UvRegion {
    pub min: Vec2,
    pub max: Vec2,
}

/// Lazily-materialized relative/absolute position view, keyed by a mesh
/// origin. Reading one side from the other invalidates nothing; only
/// [`Positions::update_origin`] invalidates the absolute cache.
#[derive(Clone, Debug)]
pub struct Positions {
    origin: DVec3,
    relative: Vec<Vec3>,
    absolute: Option<Vec<DVec3>>,
}

impl Positions {
    pub fn from_relative(origin: DVec3, relative: Vec<Vec3>) -> Self {
        Self {
            origin,
            relative,
            absolute: None,
        }
    }

    pub fn origin(&self) -> DVec3 {
        self.origin
    }

    pub fn relative(&self) -> &[Vec3] {
        &self.relative
    }

    pub fn absolute(&mut self) -> &[DVec3] {
        if self.absolute.is_none() {
            let origin = self.origin;
            self.absolute = Some(self.relative.iter().map(|p| origin + p.as_dvec3()).collect());
        }
        self.absolute.as_ref().unwrap()
    }

    /// Replaces the relative-position array against a new origin, computed
    /// from the current absolute positions. Invalidates the absolute cache.
    pub fn update_origin(&mut self, new_origin: DVec3) {
        let absolute: Vec<DVec3> = {
            let origin = self.origin;
            self.relative.iter().map(|p| origin + p.as_dvec3()).collect()
        };
        self.relative = absolute
            .iter()
            .map(|p| (*p - new_origin).as_vec3())
            .collect();
        self.origin = new_origin;
        self.absolute = None;
    }

    pub fn len(&self) -> usize {
        self.relative.len()
    }
}

/// Whether UVs wrap beyond `[0, 1]` on either axis. Lazily computed from the
/// raw UV values on first query.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct WrapMode {
    pub wrap_x: bool,
    pub wrap_y: bool,
}

impl WrapMode {
    pub fn from_uvs(uvs: &[Vec2]) -> Self {
        let mut mode = WrapMode::default();
        for uv in uvs {
            if !(0.0..=1.0).contains(&uv.x) {
                mode.wrap_x = true;
            }
            if !(0.0..=1.0).contains(&uv.y) {
                mode.wrap_y = true;
            }
        }
        mode
    }

    pub fn none(self) -> bool {
        !self.wrap_x && !self.wrap_y
    }
}

/// A conditioned triangle mesh. Vertex count is always a multiple of 3.
#[derive(Clone, Debug)]
pub struct TriangleMesh {
    pub positions: Positions,
    pub uvs: Vec<Vec2>,
    pub normals: Option<Vec<Vec3>>,
    pub colors: Option<Vec<[u8; 4]>>,
    pub regions: Option<IndexedValues<UvRegion>>,
    pub feature_ids: Option<IndexedValues<u64>>,
    mask: AttributeMask,
    wrap_mode: Option<WrapMode>,
}

/// A point-cloud mesh: per-point position and feature ID.
#[derive(Clone, Debug)]
pub struct PointMesh {
    pub positions: Positions,
    pub feature_ids: Vec<u64>,
}

#[derive(Clone, Debug)]
pub enum Mesh {
    Triangles(TriangleMesh),
    Points(PointMesh),
}

impl Mesh {
    pub fn positions_mut(&mut self) -> &mut Positions {
        match self {
            Mesh::Triangles(m) => &mut m.positions,
            Mesh::Points(m) => &mut m.positions,
        }
    }

    pub fn positions(&self) -> &Positions {
        match self {
            Mesh::Triangles(m) => &m.positions,
            Mesh::Points(m) => &m.positions,
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.positions().len()
    }
}

impl TriangleMesh {
    /// Shallow-takes raw per-vertex buffers. Reindexes UV-regions so the
    /// value array holds only unique quadruples. Panics (programming error,
    /// not a writer-facing status) if the invariants in §3 are violated.
    #[allow(clippy::too_many_arguments)]
    pub fn assign_from_bulk(
        origin: DVec3,
        positions: Vec<Vec3>,
        uvs: Vec<Vec2>,
        normals: Option<Vec<Vec3>>,
        colors: Option<Vec<[u8; 4]>>,
        regions: Option<Vec<UvRegion>>,
        feature_ids: Option<Vec<u64>>,
    ) -> Self {
        assert_eq!(positions.len() % 3, 0, "triangle mesh vertex count must be a multiple of 3");
        assert_eq!(positions.len(), uvs.len());
        if let Some(n) = &normals {
            assert_eq!(n.len(), positions.len());
        }
        if let Some(c) = &colors {
            assert_eq!(c.len(), positions.len());
        }
        if let Some(r) = &regions {
            assert_eq!(r.len(), positions.len(), "region count must equal vertex count");
        }

        let mut mask = AttributeMask::POS.union(AttributeMask::UV0);
        if normals.is_some() {
            mask.insert(AttributeMask::NORMAL);
        }
        if colors.is_some() {
            mask.insert(AttributeMask::COLOR);
        }
        if regions.is_some() {
            mask.insert(AttributeMask::REGION);
        }

        let feature_ids = feature_ids.map(|raw| {
            assert_eq!(raw.len(), positions.len(), "feature-id count must equal vertex count");
            mask.insert(AttributeMask::FEATURE_ID);
            IndexedValues::from_raw(raw)
        });

        Self {
            positions: Positions::from_relative(origin, positions),
            uvs,
            normals,
            colors,
            regions: regions.map(IndexedValues::from_raw),
            feature_ids,
            mask,
            wrap_mode: None,
        }
    }

    pub fn mask(&self) -> AttributeMask {
        self.mask
    }

    pub fn wrap_mode(&mut self) -> WrapMode {
        if self.wrap_mode.is_none() {
            self.wrap_mode = Some(WrapMode::from_uvs(&self.uvs));
        }
        self.wrap_mode.unwrap()
    }

    /// Absorbs UV-regions into the UV array: `uv' = uv*(r.max-r.min) + r.min`.
    /// Precondition: UVs are not wrap-sampled (`wrap_mode() == None`).
    /// Clears the Region bit. No-op if regions or UVs are absent.
    pub fn drop_regions(&mut self) {
        let Some(regions) = self.regions.take() else {
            return;
        };
        assert!(
            self.wrap_mode().none(),
            "cannot drop UV regions while UVs are wrap-sampled"
        );

        for (uv, region) in self.uvs.iter_mut().zip(regions.resolved()) {
            *uv = *uv * (region.max - region.min) + region.min;
        }
        self.mask.remove(AttributeMask::REGION);
        self.wrap_mode = None;
    }

    pub fn drop_normals(&mut self) {
        self.normals = None;
        self.mask.remove(AttributeMask::NORMAL);
    }

    pub fn drop_colors(&mut self) {
        self.colors = None;
        self.mask.remove(AttributeMask::COLOR);
    }

    /// Populates flat per-face normals: every vertex of a triangle receives
    /// the triangle's face normal, `normalize(cross(p1-p0, p2-p1))` (negated
    /// for a left-handed reference frame).
    pub fn create_normals(&mut self, left_handed: bool) {
        let positions = self.positions.relative();
        let mut normals = vec![Vec3::ZERO; positions.len()];
        for tri in positions.chunks_exact(3).enumerate() {
            let (i, p) = tri;
            let mut n = (p[1] - p[0]).cross(p[2] - p[1]).normalize_or_zero();
            if left_handed {
                n = -n;
            }
            let base = i * 3;
            normals[base] = n;
            normals[base + 1] = n;
            normals[base + 2] = n;
        }
        self.normals = Some(normals);
        self.mask.insert(AttributeMask::NORMAL);
    }

    /// Replaces any non-finite UV component, or one exceeding `max_magnitude`,
    /// with `1.0`; then applies the downstream-renderer "skirt quad"
    /// workaround: a triangle whose u (or v) coordinate is exactly `1.0` on
    /// all three vertices textures incorrectly in at least one known reader,
    /// so that shared component is nudged to `0.9999` everywhere it occurs.
    /// Returns the number of fixed components.
    pub fn sanitize_uvs(&mut self, max_magnitude: f32) -> usize {
        let mut fixed = 0;
        for uv in &mut self.uvs {
            for c in [&mut uv.x, &mut uv.y] {
                if !c.is_finite() || c.abs() > max_magnitude {
                    *c = 1.0;
                    fixed += 1;
                }
            }
        }
        for tri in self.uvs.chunks_exact_mut(3) {
            if tri.iter().all(|uv| uv.x == 1.0) {
                for uv in tri.iter_mut() {
                    uv.x = 0.9999;
                }
                fixed += 3;
            }
            if tri.iter().all(|uv| uv.y == 1.0) {
                for uv in tri.iter_mut() {
                    uv.y = 0.9999;
                }
                fixed += 3;
            }
        }
        fixed
    }

    /// Replaces the relative-position array against `new_origin`.
    pub fn update_positions(&mut self, new_origin: DVec3) {
        self.positions.update_origin(new_origin);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad() -> TriangleMesh {
        let positions = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
        ];
        let uvs = vec![Vec2::new(0.0, 0.0); 6];
        TriangleMesh::assign_from_bulk(DVec3::ZERO, positions, uvs, None, None, None, None)
    }

    #[test]
    fn drop_regions_maps_into_unit_range() {
        let mut mesh = quad();
        let region = UvRegion {
            min: Vec2::new(0.25, 0.25),
            max: Vec2::new(0.75, 0.75),
        };
        mesh.regions = Some(IndexedValues::from_raw(vec![region; 6]));
        mesh.uvs = vec![Vec2::new(0.5, 0.5); 6];
        mesh.mask.insert(AttributeMask::REGION);

        mesh.drop_regions();

        assert!(mesh.regions.is_none());
        assert!(!mesh.mask().contains(AttributeMask::REGION));
        for uv in &mesh.uvs {
            assert!((0.0..=1.0).contains(&uv.x));
            assert!((0.0..=1.0).contains(&uv.y));
        }
    }

    #[test]
    fn create_normals_matches_face_normal() {
        let mut mesh = quad();
        mesh.create_normals(false);
        let normals = mesh.normals.as_ref().unwrap();
        assert_eq!(normals[0], normals[1]);
        assert_eq!(normals[1], normals[2]);
        assert!((normals[0].length() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn sanitize_uvs_replaces_bad_values() {
        let mut mesh = quad();
        mesh.uvs[0] = Vec2::new(f32::NAN, 2.5);
        let fixed = mesh.sanitize_uvs(1.0);
        assert_eq!(fixed, 2);
        assert_eq!(mesh.uvs[0], Vec2::new(1.0, 1.0));
    }

    #[test]
    fn sanitize_uvs_nudges_all_one_skirt_triangle_off_exactly_one() {
        let mut mesh = quad();
        // First triangle: all three vertices share u=1.0, the skirt-quad
        // renderer-bug trigger condition.
        mesh.uvs[0] = Vec2::new(1.0, 0.2);
        mesh.uvs[1] = Vec2::new(1.0, 0.5);
        mesh.uvs[2] = Vec2::new(1.0, 0.8);
        let fixed = mesh.sanitize_uvs(1.0);
        assert_eq!(fixed, 3);
        for uv in &mesh.uvs[0..3] {
            assert_eq!(uv.x, 0.9999);
        }
        // Untouched second triangle keeps its original (0,0) UVs.
        for uv in &mesh.uvs[3..6] {
            assert_eq!(uv.x, 0.0);
        }
    }

    #[test]
    fn indexed_values_dedups_equal_entries() {
        let iv = IndexedValues::from_raw(vec![1u64, 2, 1, 1, 3]);
        assert_eq!(iv.values, vec![1, 2, 3]);
        assert_eq!(iv.indices, vec![0, 1, 0, 0, 2]);
    }
}
