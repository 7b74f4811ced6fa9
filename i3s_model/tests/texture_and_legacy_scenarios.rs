//! End-to-end scenarios against the texture-set encoder and the legacy
//! geometry buffer, exercised through their public APIs rather than their
//! own unit-test internals.

use glam::{DVec3, Vec2, Vec3};
use i3s_model::legacy::{decode, encode, face_ranges_from_per_face_index, FaceRange};
use i3s_model::mesh::{IndexedValues, TriangleMesh};
use i3s_model::texture::{
    build_texture_set, AlphaStatus, ImageCodecs, RasterFormat, RawImage, TextureBuffer,
    TextureImage, TextureMeta, TextureSetKey, TextureWrap,
};
use i3s_model::AttributeMask;

fn png_image(width: u32, height: u32) -> TextureImage {
    TextureImage {
        meta: TextureMeta {
            format: RasterFormat::Png,
            width,
            height,
            mip_count: 1,
            alpha: AlphaStatus::Opaque,
            wrap: TextureWrap::Clamp,
            is_atlas: false,
        },
        bytes: bytes::Bytes::from_static(b"stub-png"),
    }
}

/// An 8192x4096 raster with `max_texture_size=4096` resamples to 4096x2048,
/// preserving aspect ratio; the re-encoded entry's metadata records the
/// resampled dimensions, not the source ones.
#[test]
fn oversized_raster_resamples_preserving_aspect_and_reports_new_dimensions() {
    let source = TextureBuffer {
        images: vec![png_image(8192, 4096)],
        raw: None,
    };

    let mut codecs = ImageCodecs::default();
    codecs.decode_png = Some(Box::new(|_bytes| {
        Ok(RawImage {
            width: 8192,
            height: 4096,
            rgba: vec![255u8; 8192 * 4096 * 4],
        })
    }));
    codecs.encode_png = Some(Box::new(|raw: &RawImage| {
        Ok(TextureImage {
            meta: TextureMeta {
                format: RasterFormat::Png,
                width: raw.width,
                height: raw.height,
                mip_count: 1,
                alpha: AlphaStatus::Opaque,
                wrap: TextureWrap::Clamp,
                is_atlas: false,
            },
            bytes: bytes::Bytes::from_static(b"resampled-png"),
        })
    }));

    let mut desired = TextureSetKey::default();
    desired.insert(RasterFormat::Png);

    let built = build_texture_set(&source, desired, 4096, &codecs, false).unwrap();

    assert_eq!(built.images.len(), 1);
    let resized = built.get(RasterFormat::Png).unwrap();
    assert_eq!(resized.meta.width, 4096);
    assert_eq!(resized.meta.height, 2048);
}

/// A single textured triangle with only a PNG base color at 256x256: the
/// texture set passes through untouched (no resample needed) and carries
/// just the one format.
#[test]
fn single_png_triangle_texture_passes_through_unchanged() {
    let source = TextureBuffer {
        images: vec![png_image(256, 256)],
        raw: None,
    };
    let mut codecs = ImageCodecs::default();
    codecs.decode_png = Some(Box::new(|_bytes| {
        Ok(RawImage {
            width: 256,
            height: 256,
            rgba: vec![255u8; 256 * 256 * 4],
        })
    }));

    let built = build_texture_set(&source, source.key(), 4096, &codecs, false).unwrap();
    assert_eq!(built.images.len(), 1);
    let png = built.get(RasterFormat::Png).unwrap();
    assert_eq!((png.meta.width, png.meta.height), (256, 256));
    assert_eq!(png.meta.format.legacy_tag(), "0");
}

fn mesh_with_two_feature_blocks(vertices_per_feature: usize) -> TriangleMesh {
    let total_vertices = vertices_per_feature * 2;
    let positions: Vec<Vec3> = (0..total_vertices)
        .map(|i| Vec3::new(i as f32, 0.0, 0.0))
        .collect();
    let uvs = vec![Vec2::ZERO; total_vertices];
    let feature_ids: Vec<u64> = (0..total_vertices)
        .map(|i| if i < vertices_per_feature { 0 } else { 1 })
        .collect();
    TriangleMesh::assign_from_bulk(DVec3::ZERO, positions, uvs, None, None, None, Some(feature_ids))
}

/// 300 vertices (100 triangles), the first 150 vertices tagged feature 0 and
/// the last 150 tagged feature 1: the legacy buffer's face-range block
/// records two contiguous runs, `(0, 49)` then `(50, 99)`.
#[test]
fn two_contiguous_feature_blocks_emit_two_face_ranges() {
    let mesh = mesh_with_two_feature_blocks(150);
    let mask = mesh.mask().union(AttributeMask::FEATURE_ID);
    let bytes = encode(&mesh, mask);
    let decoded = decode(bytes, mask).unwrap();

    assert_eq!(decoded.feature_ids, vec![0, 1]);
    assert_eq!(
        decoded.face_ranges,
        vec![FaceRange { first: 0, last: 49 }, FaceRange { first: 50, last: 99 }]
    );
}

/// After Draco-style vertex reordering the per-face feature sequence can
/// recur in non-adjacent runs; each maximal run still becomes its own
/// face-range, however many there are.
#[test]
fn reordered_feature_sequence_emits_one_range_per_run() {
    let mut per_face = Vec::new();
    per_face.extend(std::iter::repeat(0u32).take(60));
    per_face.extend(std::iter::repeat(1u32).take(60));
    per_face.extend(std::iter::repeat(0u32).take(30));
    per_face.extend(std::iter::repeat(1u32).take(150));

    let ranges = face_ranges_from_per_face_index(&per_face);
    assert_eq!(ranges.len(), 4);
    assert_eq!(ranges[0].1, FaceRange { first: 0, last: 59 });
    assert_eq!(ranges[1].1, FaceRange { first: 60, last: 119 });
    assert_eq!(ranges[2].1, FaceRange { first: 120, last: 149 });
    assert_eq!(ranges[3].1, FaceRange { first: 150, last: 299 });
}

/// A mesh with no submitted feature IDs produces the single dummy feature
/// and a single face-range spanning every triangle.
#[test]
fn no_feature_ids_produces_single_whole_mesh_range() {
    let positions: Vec<Vec3> = (0..9).map(|i| Vec3::new(i as f32, 0.0, 0.0)).collect();
    let uvs = vec![Vec2::ZERO; 9];
    let mesh = TriangleMesh::assign_from_bulk(DVec3::ZERO, positions, uvs, None, None, None, None);
    let mask = mesh.mask().union(AttributeMask::FEATURE_ID);
    let bytes = encode(&mesh, mask);
    let decoded = decode(bytes, mask).unwrap();

    assert_eq!(decoded.feature_ids, vec![0]);
    assert_eq!(decoded.face_ranges, vec![FaceRange { first: 0, last: 2 }]);
}

/// UV-region absorption with no wrap sampling: for any UV already in
/// `[0, 1]`, `uv*(r.max-r.min)+r.min` lands back in `[0, 1]` to within the
/// documented tolerance, for an asymmetric region (not the 0.25..0.75
/// midpoint case already covered at the unit level).
#[test]
fn drop_regions_keeps_asymmetric_region_mapped_uvs_in_unit_range() {
    let positions: Vec<Vec3> = (0..6).map(|i| Vec3::new(i as f32, 0.0, 0.0)).collect();
    let uvs = vec![
        Vec2::new(0.0, 0.0),
        Vec2::new(0.2, 0.8),
        Vec2::new(1.0, 1.0),
        Vec2::new(0.5, 0.5),
        Vec2::new(0.1, 0.9),
        Vec2::new(0.9, 0.1),
    ];
    let mut mesh = TriangleMesh::assign_from_bulk(DVec3::ZERO, positions, uvs, None, None, None, None);

    let region = i3s_model::mesh::UvRegion {
        min: Vec2::new(0.1, 0.4),
        max: Vec2::new(0.6, 0.95),
    };
    mesh.regions = Some(IndexedValues::from_raw(vec![region; 6]));

    mesh.drop_regions();

    assert!(mesh.regions.is_none());
    for uv in &mesh.uvs {
        assert!(uv.x >= -1e-6 && uv.x <= 1.0 + 1e-6, "uv.x out of range: {}", uv.x);
        assert!(uv.y >= -1e-6 && uv.y <= 1.0 + 1e-6, "uv.y out of range: {}", uv.y);
    }
}
