//! Legacy interleaved geometry buffer (§4.3): encodes/decodes the
//! header-prefixed binary buffer expected by older I3S readers.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use glam::{Vec2, Vec3};

use crate::codec::{Decode, Encode};
use crate::mesh::TriangleMesh;
use crate::AttributeMask;

/// A `(first_triangle_index, last_triangle_index)` pair, inclusive, mapping
/// one feature ID to a contiguous run of faces.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FaceRange {
    pub first: u32,
    pub last: u32,
}

/// The decoded contents of a legacy buffer, used by tests and by readers.
#[derive(Clone, Debug, Default)]
pub struct DecodedLegacyBuffer {
    pub vertex_count: u32,
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub uvs: Vec<Vec2>,
    pub colors: Vec<[u8; 4]>,
    pub feature_ids: Vec<u64>,
    pub face_ranges: Vec<FaceRange>,
    pub regions: Vec<[u16; 4]>,
    /// Count of face ranges that were out of bounds and got clamped.
    pub sanitized_ranges: u32,
}

/// Derives per-face `(first, last)` triangle runs from a per-face sequence
/// of feature-value indices (one entry per triangle). Feature IDs may
/// recur in multiple non-contiguous runs after compressed-mesh vertex
/// reordering; each maximal run becomes its own range.
pub fn face_ranges_from_per_face_index(per_face_index: &[u32]) -> Vec<(u32, FaceRange)> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < per_face_index.len() {
        let feature = per_face_index[i];
        let start = i;
        while i < per_face_index.len() && per_face_index[i] == feature {
            i += 1;
        }
        out.push((
            feature,
            FaceRange {
                first: start as u32,
                last: (i - 1) as u32,
            },
        ));
    }
    out
}

/// Encodes `mesh` into the legacy buffer layout for the given declared
/// attribute mask. `mask` may declare attributes the mesh itself doesn't
/// carry (e.g. Color declared but dropped): those are synthesized with
/// their documented defaults.
pub fn encode(mesh: &TriangleMesh, mask: AttributeMask) -> Bytes {
    let vertex_count = mesh.vertex_count() as u32;

    let (feature_values, per_face_feature): (Vec<u64>, Vec<u32>) = match &mesh.feature_ids {
        Some(fids) => {
            let per_face = fids.indices.iter().step_by(3).copied().collect();
            (fids.values.clone(), per_face)
        }
        None => (vec![0], vec![0; (vertex_count / 3) as usize]),
    };

    let face_ranges: Vec<FaceRange> = face_ranges_from_per_face_index(&per_face_feature)
        .into_iter()
        .map(|(_, range)| range)
        .collect();

    let mut buf = BytesMut::new();
    vertex_count.encode(&mut buf);
    (feature_values.len().max(1) as u32).encode(&mut buf);

    if mask.contains(AttributeMask::POS) {
        for p in mesh.positions.relative() {
            p.encode(&mut buf);
        }
    }
    if mask.contains(AttributeMask::NORMAL) {
        match &mesh.normals {
            Some(normals) => {
                for n in normals {
                    n.encode(&mut buf);
                }
            }
            None => {
                for _ in 0..vertex_count {
                    Vec3::ZERO.encode(&mut buf);
                }
            }
        }
    }
    if mask.contains(AttributeMask::UV0) {
        for uv in &mesh.uvs {
            uv.encode(&mut buf);
        }
    }
    if mask.contains(AttributeMask::COLOR) {
        match &mesh.colors {
            Some(colors) => {
                for c in colors {
                    buf.put_slice(c);
                }
            }
            None => {
                for _ in 0..vertex_count {
                    buf.put_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
                }
            }
        }
    }
    if mask.contains(AttributeMask::FEATURE_ID) {
        for f in &feature_values {
            f.encode(&mut buf);
        }
        for range in &face_ranges {
            range.first.encode(&mut buf);
            range.last.encode(&mut buf);
        }
    }
    if mask.contains(AttributeMask::REGION) {
        match &mesh.regions {
            Some(regions) => {
                for region in regions.resolved() {
                    for c in encode_region(*region) {
                        c.encode(&mut buf);
                    }
                }
            }
            None => {
                // Declared but absent from this node: omit entirely: the
                // residual-byte-count heuristic in `decode` relies on this.
            }
        }
    }

    buf.freeze()
}

fn encode_region(region: crate::mesh::UvRegion) -> [u16; 4] {
    let q = |v: f32| (v.clamp(0.0, 1.0) * 65535.0).round() as u16;
    [
        q(region.min.x),
        q(region.min.y),
        q(region.max.x),
        q(region.max.y),
    ]
}

/// Decodes a legacy buffer for the given declared mask. Out-of-range face
/// ranges are clamped to `[0, vertex_count/3 - 1]` and counted in
/// `sanitized_ranges` rather than rejected outright.
pub fn decode(mut bytes: Bytes, mask: AttributeMask) -> Result<DecodedLegacyBuffer, crate::codec::EofError> {
    let vertex_count = u32::decode(&mut bytes)?;
    let feature_count = u32::decode(&mut bytes)?;
    let max_face = if vertex_count >= 3 { vertex_count / 3 - 1 } else { 0 };

    let mut out = DecodedLegacyBuffer {
        vertex_count,
        ..Default::default()
    };

    if mask.contains(AttributeMask::POS) {
        for _ in 0..vertex_count {
            out.positions.push(Vec3::decode(&mut bytes)?);
        }
    }
    if mask.contains(AttributeMask::NORMAL) {
        for _ in 0..vertex_count {
            out.normals.push(Vec3::decode(&mut bytes)?);
        }
    }
    if mask.contains(AttributeMask::UV0) {
        for _ in 0..vertex_count {
            out.uvs.push(Vec2::decode(&mut bytes)?);
        }
    }
    if mask.contains(AttributeMask::COLOR) {
        for _ in 0..vertex_count {
            let mut c = [0u8; 4];
            for b in &mut c {
                *b = u8::decode(&mut bytes)?;
            }
            out.colors.push(c);
        }
    }
    if mask.contains(AttributeMask::FEATURE_ID) {
        for _ in 0..feature_count {
            out.feature_ids.push(u64::decode(&mut bytes)?);
        }
        // The face-range block's length isn't declared up front; the caller
        // is expected to know it from the node's feature layout. Here we
        // consume ranges until the declared Region block (if any) would no
        // longer evenly divide the remainder, matching the detection rule
        // in §4.3 for whether Region is actually present.
        let region_bytes_if_present = vertex_count as usize * 8;
        while bytes.remaining() > 0
            && !(mask.contains(AttributeMask::REGION)
                && (bytes.remaining() == region_bytes_if_present || bytes.remaining() == 0))
        {
            if bytes.remaining() < 8 {
                break;
            }
            let first = u32::decode(&mut bytes)?;
            let last = u32::decode(&mut bytes)?;
            let (first, last, clamped) = clamp_range(first, last, max_face);
            if clamped {
                tracing::warn!(first, last, max_face, "clamped out-of-range face range");
                out.sanitized_ranges += 1;
            }
            out.face_ranges.push(FaceRange { first, last });
        }
    }
    if mask.contains(AttributeMask::REGION) && bytes.remaining() > 0 {
        for _ in 0..vertex_count {
            let mut region = [0u16; 4];
            for c in &mut region {
                *c = u16::decode(&mut bytes)?;
            }
            out.regions.push(region);
        }
    }

    Ok(out)
}

fn clamp_range(first: u32, last: u32, max_face: u32) -> (u32, u32, bool) {
    let mut clamped = false;
    let first = if first > max_face {
        clamped = true;
        max_face
    } else {
        first
    };
    let last = if last > max_face {
        clamped = true;
        max_face
    } else {
        last
    };
    (first, last, clamped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::DVec3;

    fn unit_quad() -> TriangleMesh {
        let positions = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
        ];
        let uvs = vec![
            Vec2::new(0.0, 0.0),
            Vec2::new(1.0, 0.0),
            Vec2::new(1.0, 1.0),
            Vec2::new(0.0, 0.0),
            Vec2::new(1.0, 1.0),
            Vec2::new(0.0, 1.0),
        ];
        TriangleMesh::assign_from_bulk(DVec3::ZERO, positions, uvs, None, None, None, None)
    }

    #[test]
    fn header_matches_vertex_and_feature_count() {
        let mesh = unit_quad();
        let mask = mesh.mask();
        let bytes = encode(&mesh, mask);
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 6);
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 1);
    }

    #[test]
    fn round_trip_positions_and_uvs() {
        let mesh = unit_quad();
        let mask = mesh.mask();
        let bytes = encode(&mesh, mask);
        let decoded = decode(bytes, mask).unwrap();
        assert_eq!(decoded.positions, mesh.positions.relative());
        assert_eq!(decoded.uvs, mesh.uvs);
    }

    #[test]
    fn missing_feature_ids_produce_single_dummy_feature() {
        let mesh = unit_quad();
        let mask = mesh.mask().union(AttributeMask::FEATURE_ID);
        let bytes = encode(&mesh, mask);
        let decoded = decode(bytes, mask).unwrap();
        assert_eq!(decoded.feature_ids, vec![0]);
        assert_eq!(decoded.face_ranges, vec![FaceRange { first: 0, last: 1 }]);
    }

    #[test]
    fn face_ranges_group_non_contiguous_runs() {
        let per_face = [0, 0, 1, 1, 0, 0, 0, 1, 1, 1, 1, 1];
        let ranges = face_ranges_from_per_face_index(&per_face);
        assert_eq!(ranges.len(), 4);
    }
}
