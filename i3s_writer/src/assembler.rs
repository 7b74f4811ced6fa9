//! The node assembler (§4.6): for each client-submitted node, computes its
//! final record and appends its per-node artifacts to the archive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use glam::DVec3;
use i3s_geom::{compute_obb, merge_obbs, BoundingSphere, FitMetric, Obb};
use i3s_model::attribute::{encode_scalar_buffer, encode_string_buffer, AttrValue};
use i3s_model::legacy;
use i3s_model::material::{MaterialData, MaterialInterner};
use i3s_model::mesh::{Mesh, PointMesh, TriangleMesh};
use i3s_model::texture::{build_texture_set, RasterFormat, TextureSetInterner};
use i3s_model::{geometry_definition_key, AttributeMask};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error};

use crate::archive::{append_binary_gz, append_json, append_raw, Archive};
use crate::codecs::{east_north_steps, Codecs};
use crate::node::{InternalNode, LodThreshold, NodeBrief, NodeId, NodeKind, SimpleNode};
use crate::{Error, Warning, WarningTracker};

/// Below this side length (world units) a triangle is treated as degenerate
/// (§4.6, §8 boundary case).
const DEGENERATE_SIDE: f32 = 1e-3;

/// Per-vertex-normal vs. face-normal angle tolerance for the
/// normal-droppability test (§4.6).
const NORMAL_ANGLE_THRESHOLD_DEG: f64 = 1.0;

/// The frame in which stored vertex normals are expressed (GLOSSARY
/// "normal reference frame"), used by the normal-droppability test.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NormalFrame {
    Ecef,
    EastNorthUp,
    VertexLocal,
}

/// State shared across every node a [`crate::writer::LayerWriter`]
/// assembles: the material/texture interners, the attribute schema, the
/// injected codecs, and the geometry-definition usage / running
/// attribute-mask counters (§4.9 "shared-resource policy").
pub struct AssemblerContext {
    pub materials: MaterialInterner,
    pub textures: TextureSetInterner,
    pub attributes: Mutex<i3s_model::attribute::AttributeSchema>,
    pub codecs: Codecs,
    pub max_texture_size: u32,
    pub normal_frame: NormalFrame,
    geometry_usage: [AtomicU32; 8],
    running_mask: AtomicU8,
}

impl AssemblerContext {
    pub fn new(codecs: Codecs, max_texture_size: u32, normal_frame: NormalFrame) -> Self {
        Self {
            materials: MaterialInterner::new(),
            textures: TextureSetInterner::new(),
            attributes: Mutex::new(i3s_model::attribute::AttributeSchema::new()),
            codecs,
            max_texture_size,
            normal_frame,
            geometry_usage: std::array::from_fn(|_| AtomicU32::new(0)),
            running_mask: AtomicU8::new(0),
        }
    }

    pub fn running_mask(&self) -> AttributeMask {
        AttributeMask::from_bits(self.running_mask.load(Ordering::Relaxed))
    }

    /// Usage count per geometry-definition key, indexed `0..8` (§4.8
    /// "enumerate the 8 possible keys; for each key whose usage counter is
    /// nonzero, emit a definition record").
    pub fn geometry_definition_usage(&self) -> [u32; 8] {
        std::array::from_fn(|i| self.geometry_usage[i].load(Ordering::Relaxed))
    }

    fn record_usage(&self, mask: AttributeMask, key: u8) {
        self.running_mask.fetch_or(mask.bits(), Ordering::Relaxed);
        self.geometry_usage[key as usize].fetch_add(1, Ordering::Relaxed);
    }
}

fn sentinel_bounds() -> (Obb, BoundingSphere) {
    compute_obb(&[], FitMetric::MinSurfaceArea)
}

fn present_children(children: &[NodeId]) -> Vec<NodeId> {
    children.iter().copied().filter(|c| c.is_valid()).collect()
}

fn is_degenerate(mesh: &TriangleMesh) -> bool {
    let positions = mesh.positions.relative();
    if positions.is_empty() {
        return true;
    }
    positions.chunks_exact(3).all(|tri| {
        let a = (tri[1] - tri[0]).length();
        let b = (tri[2] - tri[1]).length();
        let c = (tri[0] - tri[2]).length();
        a < DEGENERATE_SIDE && b < DEGENERATE_SIDE && c < DEGENERATE_SIDE
    })
}

fn colors_are_all_opaque_white(mesh: &TriangleMesh) -> bool {
    match &mesh.colors {
        Some(colors) => !colors.is_empty() && colors.iter().all(|c| *c == [255, 255, 255, 255]),
        None => false,
    }
}

/// Positions expressed in the configured normal reference frame, relative
/// to `origin` (GLOSSARY "normal reference frame").
fn frame_positions(ctx: &AssemblerContext, mesh: &TriangleMesh, origin: DVec3) -> Vec<DVec3> {
    let relative: Vec<DVec3> = mesh.positions.relative().iter().map(|p| p.as_dvec3()).collect();
    match ctx.normal_frame {
        NormalFrame::VertexLocal | NormalFrame::EastNorthUp => relative,
        NormalFrame::Ecef => {
            let mut absolute: Vec<DVec3> = relative.iter().map(|p| origin + *p).collect();
            ctx.codecs.sr_transform.to_cartesian(&mut absolute);
            absolute
        }
    }
}

/// Transforms positions into the normal reference frame; for each
/// non-degenerate triangle compares its face normal to every submitted
/// vertex normal by angle. Droppable iff every angle is within
/// [`NORMAL_ANGLE_THRESHOLD_DEG`] (§4.6).
fn normals_are_droppable(ctx: &AssemblerContext, mesh: &TriangleMesh, origin: DVec3) -> bool {
    let Some(normals) = &mesh.normals else {
        return false;
    };
    let positions = frame_positions(ctx, mesh, origin);
    let threshold_cos = NORMAL_ANGLE_THRESHOLD_DEG.to_radians().cos();
    let side_threshold = DEGENERATE_SIDE as f64;

    for (i, tri) in positions.chunks_exact(3).enumerate() {
        let a = (tri[1] - tri[0]).length();
        let b = (tri[2] - tri[1]).length();
        let c = (tri[0] - tri[2]).length();
        if a < side_threshold || b < side_threshold || c < side_threshold {
            continue;
        }
        let face_normal = (tri[1] - tri[0]).cross(tri[2] - tri[1]).normalize_or_zero();
        if face_normal == DVec3::ZERO {
            continue;
        }
        for v in 0..3 {
            let n = normals[i * 3 + v].as_dvec3().normalize_or_zero();
            if face_normal.dot(n) < threshold_cos {
                return false;
            }
        }
    }
    true
}

#[derive(Serialize)]
struct FeatureData {
    #[serde(rename = "featureIds")]
    feature_ids: Vec<u64>,
}

fn encode_attribute_values(values: &[AttrValue]) -> bytes::Bytes {
    if matches!(values.first(), Some(AttrValue::Str(_))) {
        let strings: Vec<Option<String>> = values
            .iter()
            .map(|v| match v {
                AttrValue::Str(s) => s.clone(),
                _ => unreachable!("mixed-type attribute column rejected at schema.record"),
            })
            .collect();
        encode_string_buffer(&strings)
    } else {
        encode_scalar_buffer(values)
    }
}

fn write_attributes(
    ctx: &AssemblerContext,
    archive: &dyn Archive,
    node_id: NodeId,
    attributes: Vec<(u32, Vec<AttrValue>)>,
) -> Result<(), Error> {
    for (index, values) in attributes {
        ctx.attributes.lock().record(index, &values)?;
        let bytes = encode_attribute_values(&values);
        let path = format!("nodes/{}/attributes/f_{}/0.bin.gz", node_id.0, index);
        append_binary_gz(archive, &path, &bytes)?;
    }
    Ok(())
}

fn texture_extension(format: RasterFormat) -> &'static str {
    match format {
        RasterFormat::Jpeg => "jpg",
        RasterFormat::Png => "png",
        RasterFormat::Dxt => "bin.dds",
        RasterFormat::Etc2 => "ktx",
    }
}

/// Interns `material`'s texture buffer (if non-empty) against the context's
/// desired-format bitmask (source formats plus every format with a
/// registered encoder) and writes each resulting image payload under
/// `nodes/<id>/textures/<tag>` (§4.4, §4.5).
fn intern_material_and_textures(
    ctx: &AssemblerContext,
    archive: &dyn Archive,
    node_id: NodeId,
    material: MaterialData,
) -> Result<(u32, Option<u32>), Error> {
    let material_id = ctx.materials.intern(material.clone());
    let source = &material.metallic_roughness.textures;
    if source.images.is_empty() {
        return Ok((material_id, None));
    }

    let mut desired = source.key();
    if ctx.codecs.images.encode_jpeg.is_some() {
        desired.insert(RasterFormat::Jpeg);
    }
    if ctx.codecs.images.encode_png.is_some() {
        desired.insert(RasterFormat::Png);
    }
    if ctx.codecs.images.encode_dxt.is_some() {
        desired.insert(RasterFormat::Dxt);
    }
    if ctx.codecs.images.encode_etc2.is_some() {
        desired.insert(RasterFormat::Etc2);
    }

    let built = build_texture_set(
        source,
        desired,
        ctx.max_texture_size,
        &ctx.codecs.images,
        desired.is_atlas,
    )?;
    let texture_set_id = ctx.textures.intern(built.key());

    for image in &built.images {
        let path = format!(
            "nodes/{}/textures/{}.{}",
            node_id.0,
            image.meta.format.legacy_tag(),
            texture_extension(image.meta.format)
        );
        append_raw(archive, &path, &image.bytes)?;
    }

    Ok((material_id, Some(texture_set_id)))
}

/// Computes the node's bounding volume in the layer's spatial reference:
/// absolute positions → cartesian → OBB (§4.1) → inverse-transform the
/// chosen center back, re-origining the mesh's relative positions against
/// it (§4.6 step 2).
fn compute_and_recenter(
    ctx: &AssemblerContext,
    mesh: &mut TriangleMesh,
) -> Result<(Obb, BoundingSphere), Error> {
    let absolute: Vec<DVec3> = mesh.positions.absolute().to_vec();
    let mut cartesian = absolute;
    if !ctx.codecs.sr_transform.to_cartesian(&mut cartesian) {
        return Err(Error::InternalError("to_cartesian_space transform failed"));
    }
    let cartesian_f32: Vec<glam::Vec3> = cartesian.iter().map(|p| p.as_vec3()).collect();
    let (obb_cartesian, sphere_cartesian) = compute_obb(&cartesian_f32, FitMetric::MinSurfaceArea);

    let mut center_native = [obb_cartesian.center];
    if !ctx.codecs.sr_transform.from_cartesian(&mut center_native) {
        return Err(Error::InternalError("from_cartesian_space transform failed"));
    }
    let new_origin = center_native[0];
    mesh.update_positions(new_origin);

    let bounding_box = Obb {
        center: new_origin,
        ..obb_cartesian
    };
    let sphere = BoundingSphere {
        center: new_origin,
        radius: sphere_cartesian.radius,
    };
    Ok((bounding_box, sphere))
}

#[allow(clippy::too_many_arguments)]
fn assemble_triangle_node(
    ctx: &AssemblerContext,
    archive: &dyn Archive,
    tracker: &dyn WarningTracker,
    id: NodeId,
    depth: u32,
    lod_threshold: LodThreshold,
    mut mesh: TriangleMesh,
    material: Option<MaterialData>,
    attributes: Vec<(u32, Vec<AttrValue>)>,
    children: Vec<NodeId>,
) -> Result<InternalNode, Error> {
    if is_degenerate(&mesh) {
        tracker.warn(Warning::DegenerateMesh { node: id });
        let (bounding_box, sphere) = sentinel_bounds();
        return Ok(InternalNode {
            id,
            bounding_box,
            sphere,
            depth,
            lod_threshold,
            geometry_definition_key: None,
            material_id: None,
            texture_set_id: None,
            children: present_children(&children),
            parent: None,
            kind: NodeKind::Meshless,
        });
    }

    let (bounding_box, sphere) = compute_and_recenter(ctx, &mut mesh)?;
    let origin = mesh.positions.origin();

    let declared_mask = mesh.mask();
    let legacy_bytes = legacy::encode(&mesh, declared_mask);
    append_binary_gz(archive, &format!("nodes/{}/geometries/0.bin.gz", id.0), &legacy_bytes)?;

    let mut normals_dropped = false;
    let mut colors_dropped = false;

    if let Some(draco) = &ctx.codecs.draco {
        normals_dropped = normals_are_droppable(ctx, &mesh, origin);
        if normals_dropped {
            debug!(node = id.0, "dropping normals, reconstructable from face winding");
            mesh.drop_normals();
        }
        if colors_are_all_opaque_white(&mesh) {
            mesh.drop_colors();
            colors_dropped = true;
        }
        if mesh.regions.is_some() && mesh.wrap_mode().none() {
            mesh.drop_regions();
        }
        mesh.sanitize_uvs(1.0);

        let (east, north) = east_north_steps(ctx.codecs.sr_transform.as_ref(), origin);
        let (scale_x, scale_y) = (east.length(), north.length());

        match draco(&mesh, scale_x, scale_y) {
            Ok(bytes) => {
                append_raw(archive, &format!("nodes/{}/geometries/1.bin.gz", id.0), &bytes)?;
            }
            Err(_) if is_degenerate(&mesh) => {
                tracker.warn(Warning::DegenerateMesh { node: id });
            }
            Err(_) => {
                error!(node = id.0, "draco encoding failed for a non-degenerate mesh");
                return Err(Error::DracoEncodingError);
            }
        }
    }

    let regions_absent = mesh.regions.is_none();
    let key = geometry_definition_key(normals_dropped, colors_dropped, regions_absent);
    ctx.record_usage(declared_mask, key);

    let (material_id, texture_set_id) = match material {
        Some(material) => {
            let (mat_id, tex_id) = intern_material_and_textures(ctx, archive, id, material)?;
            (Some(mat_id), tex_id)
        }
        None => (None, None),
    };

    write_attributes(ctx, archive, id, attributes)?;

    Ok(InternalNode {
        id,
        bounding_box,
        sphere,
        depth,
        lod_threshold,
        geometry_definition_key: Some(key),
        material_id,
        texture_set_id,
        children: present_children(&children),
        parent: None,
        kind: NodeKind::Triangles,
    })
}

fn assemble_point_node(
    ctx: &AssemblerContext,
    archive: &dyn Archive,
    id: NodeId,
    depth: u32,
    lod_threshold: LodThreshold,
    mut mesh: PointMesh,
    attributes: Vec<(u32, Vec<AttrValue>)>,
    children: Vec<NodeId>,
) -> Result<InternalNode, Error> {
    let absolute: Vec<DVec3> = mesh.positions.absolute().to_vec();
    let mut cartesian = absolute;
    if !ctx.codecs.sr_transform.to_cartesian(&mut cartesian) {
        return Err(Error::InternalError("to_cartesian_space transform failed"));
    }
    let cartesian_f32: Vec<glam::Vec3> = cartesian.iter().map(|p| p.as_vec3()).collect();
    let (obb_cartesian, sphere_cartesian) = compute_obb(&cartesian_f32, FitMetric::MinSurfaceArea);

    let mut center_native = [obb_cartesian.center];
    if !ctx.codecs.sr_transform.from_cartesian(&mut center_native) {
        return Err(Error::InternalError("from_cartesian_space transform failed"));
    }
    let new_origin = center_native[0];
    mesh.positions.update_origin(new_origin);

    let bounding_box = Obb {
        center: new_origin,
        ..obb_cartesian
    };
    let sphere = BoundingSphere {
        center: new_origin,
        radius: sphere_cartesian.radius,
    };

    let feature_data = FeatureData {
        feature_ids: mesh.feature_ids.clone(),
    };
    append_json(archive, &format!("nodes/{}/features/0.json.gz", id.0), &feature_data)?;

    write_attributes(ctx, archive, id, attributes)?;

    Ok(InternalNode {
        id,
        bounding_box,
        sphere,
        depth,
        lod_threshold,
        geometry_definition_key: None,
        material_id: None,
        texture_set_id: None,
        children: present_children(&children),
        parent: None,
        kind: NodeKind::Points,
    })
}

/// `create_output_node` (§4.6): computes depth/ID/LOD, conditions and
/// encodes the mesh (if any), interns material/texture, and writes every
/// per-node artifact to the archive.
pub fn create_output_node(
    ctx: &AssemblerContext,
    archive: &dyn Archive,
    tracker: &dyn WarningTracker,
    mut node: SimpleNode,
) -> Result<InternalNode, Error> {
    let _span = tracing::trace_span!("assemble_node", node_id = node.id.0).entered();
    let id = node.id;
    let depth = node.depth;
    let lod_threshold = node.lod_threshold;
    let material = node.material.take();
    let attributes = std::mem::take(&mut node.attributes);
    let children = std::mem::take(&mut node.children);

    match node.mesh.take() {
        None => {
            let (bounding_box, sphere) = sentinel_bounds();
            write_attributes(ctx, archive, id, attributes)?;
            Ok(InternalNode {
                id,
                bounding_box,
                sphere,
                depth,
                lod_threshold,
                geometry_definition_key: None,
                material_id: None,
                texture_set_id: None,
                children: present_children(&children),
                parent: None,
                kind: NodeKind::Meshless,
            })
        }
        Some(Mesh::Triangles(tri)) => assemble_triangle_node(
            ctx, archive, tracker, id, depth, lod_threshold, tri, material, attributes, children,
        ),
        Some(Mesh::Points(pts)) => {
            assemble_point_node(ctx, archive, id, depth, lod_threshold, pts, attributes, children)
        }
    }
}

/// `process_children` (§4.6): absorbs each referenced child out of the
/// working set, assigns its now-known parent reference, and (for a
/// meshless parent) merges the children's OBBs into the parent's own.
/// Resolved children move into `resolved`, ready for paging.
pub fn process_children(
    parent: &mut InternalNode,
    working_set: &mut HashMap<NodeId, NodeBrief>,
    resolved: &mut Vec<InternalNode>,
) -> Result<(), Error> {
    let mut child_obbs = Vec::with_capacity(parent.children.len());
    for &child_id in &parent.children {
        match working_set.get(&child_id) {
            Some(brief) => child_obbs.push(brief.node.bounding_box),
            None => return Err(Error::InvalidTreeTopology(1)),
        }
    }

    if parent.kind == NodeKind::Meshless && !child_obbs.is_empty() {
        let (obb, sphere) = merge_obbs(&child_obbs);
        parent.bounding_box = obb;
        parent.sphere = sphere;
    }

    for &child_id in &parent.children {
        if let Some(mut brief) = working_set.remove(&child_id) {
            brief.node.parent = Some(parent.id);
            resolved.push(brief.node);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests_support::MemoryArchive;
    use glam::{DVec3, Vec2, Vec3};
    use i3s_model::mesh::TriangleMesh;

    fn quad_node(id: u32) -> SimpleNode {
        let positions = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
        ];
        let uvs = vec![Vec2::new(0.0, 0.0); 6];
        let mesh = TriangleMesh::assign_from_bulk(DVec3::ZERO, positions, uvs, None, None, None, None);
        SimpleNode::new(NodeId(id), 0, 1.0).with_mesh(Mesh::Triangles(mesh))
    }

    fn ctx() -> AssemblerContext {
        AssemblerContext::new(Codecs::default(), 4096, NormalFrame::VertexLocal)
    }

    #[test]
    fn two_node_tree_emits_regions_absent_geometry_definition() {
        let ctx = ctx();
        let archive = MemoryArchive::default();
        let tracker = crate::TracingWarningTracker;

        let child = create_output_node(&ctx, &archive, &tracker, quad_node(0)).unwrap();
        assert_eq!(child.geometry_definition_key, Some(4));
        assert!(archive.files.lock().contains_key("nodes/0/geometries/0.bin.gz"));
    }

    #[test]
    fn degenerate_mesh_becomes_meshless_with_warning() {
        struct CountingTracker(std::sync::atomic::AtomicUsize);
        impl WarningTracker for CountingTracker {
            fn warn(&self, _warning: Warning) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let ctx = ctx();
        let archive = MemoryArchive::default();
        let tracker = CountingTracker(std::sync::atomic::AtomicUsize::new(0));

        let tiny = vec![Vec3::ZERO; 6];
        let uvs = vec![Vec2::ZERO; 6];
        let mesh = TriangleMesh::assign_from_bulk(DVec3::ZERO, tiny, uvs, None, None, None, None);
        let node = SimpleNode::new(NodeId(1), 0, 1.0).with_mesh(Mesh::Triangles(mesh));

        let result = create_output_node(&ctx, &archive, &tracker, node).unwrap();
        assert_eq!(result.kind, NodeKind::Meshless);
        assert_eq!(tracker.0.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn process_children_merges_obbs_and_drains_working_set() {
        let ctx = ctx();
        let archive = MemoryArchive::default();
        let tracker = crate::TracingWarningTracker;

        let mut working_set = HashMap::new();
        let mut resolved = Vec::new();

        for i in 0..2 {
            let child = create_output_node(&ctx, &archive, &tracker, quad_node(i)).unwrap();
            working_set.insert(NodeId(i), NodeBrief { node: child });
        }

        let mut parent = InternalNode {
            id: NodeId(2),
            bounding_box: sentinel_bounds().0,
            sphere: sentinel_bounds().1,
            depth: 0,
            lod_threshold: LodThreshold::from_max_screen_area(1.0),
            geometry_definition_key: None,
            material_id: None,
            texture_set_id: None,
            children: vec![NodeId(0), NodeId(1)],
            parent: None,
            kind: NodeKind::Meshless,
        };

        process_children(&mut parent, &mut working_set, &mut resolved).unwrap();

        assert!(working_set.is_empty());
        assert_eq!(resolved.len(), 2);
        assert!(resolved.iter().all(|n| n.parent == Some(NodeId(2))));
    }

    #[test]
    fn unresolvable_child_is_invalid_topology() {
        let mut working_set = HashMap::new();
        let mut resolved = Vec::new();
        let mut parent = InternalNode {
            id: NodeId(9),
            bounding_box: sentinel_bounds().0,
            sphere: sentinel_bounds().1,
            depth: 0,
            lod_threshold: LodThreshold::from_max_screen_area(1.0),
            geometry_definition_key: None,
            material_id: None,
            texture_set_id: None,
            children: vec![NodeId(5)],
            parent: None,
            kind: NodeKind::Meshless,
        };
        let err = process_children(&mut parent, &mut working_set, &mut resolved);
        assert!(matches!(err, Err(Error::InvalidTreeTopology(_))));
    }
}
