//! The layer finalizer (§4.8): assembles the top-level scene-layer
//! document, the paged-index documents, the per-node legacy index
//! documents, and the attribute statistics documents.

use std::collections::HashMap;

use glam::DVec3;
use i3s_geom::obb_corners;
use i3s_model::attribute::AttributeSchema;
use i3s_model::material::{AlphaMode, CullMode, MaterialData};
use i3s_model::texture::{RasterFormat, TextureDefinitionEntry};
use i3s_model::ScalarType;
use serde::Serialize;

use crate::archive::{append_json, Archive};
use crate::codecs::Codecs;
use crate::node::{InternalNode, NodeId};
use crate::pages::Page;
use crate::Error;

pub const I3S_VERSION: &str = "1.7";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LodMetricType {
    MaxScreenArea,
    MaxScreenSize,
}

impl LodMetricType {
    fn wire_name(self) -> &'static str {
        match self {
            LodMetricType::MaxScreenArea => "maxScreenThresholdSQ",
            LodMetricType::MaxScreenSize => "maxScreenThreshold",
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct SpatialReference {
    pub wkid: u32,
}

/// Layer-level configuration the finalizer needs beyond what the node
/// assembler already accumulated.
pub struct LayerConfig {
    pub id: u32,
    pub layer_type: &'static str,
    pub spatial_reference: SpatialReference,
    pub page_size: usize,
    pub lod_metric: LodMetricType,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetadataDoc {
    i3s_version: &'static str,
    node_count: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpatialReferenceDoc {
    wkid: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StoreDescriptorDoc {
    version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NodePagesInfoDoc {
    nodes_per_page: usize,
    lod_selection_metric_type: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeometryAttributeDoc {
    name: &'static str,
    binding: &'static str,
    value_type: &'static str,
    values_per_element: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeometryBufferDoc {
    compressed: Option<&'static str>,
    attributes: Vec<GeometryAttributeDoc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeometryDefinitionDoc {
    geometry_buffers: Vec<GeometryBufferDoc>,
}

fn attribute_binding(name: &'static str) -> &'static str {
    match name {
        "featureId" | "faceRange" => "per-feature",
        _ => "per-vertex",
    }
}

/// The canonical attribute layout for a geometry-definition key, per §4.8:
/// position/normal/uv0/color/uv-region are per-vertex; feature-id/face-range
/// are per-feature.
fn geometry_definition_attributes(key: u8) -> Vec<GeometryAttributeDoc> {
    let normals_dropped = key & 0b001 != 0;
    let colors_dropped = key & 0b010 != 0;
    let regions_absent = key & 0b100 != 0;

    let mut names: Vec<(&'static str, &'static str, u32)> = vec![("position", "Float32", 3)];
    if !normals_dropped {
        names.push(("normal", "Float32", 3));
    }
    names.push(("uv0", "Float32", 2));
    if !colors_dropped {
        names.push(("color", "UInt8", 4));
    }
    names.push(("featureId", "UInt64", 1));
    names.push(("faceRange", "UInt32", 2));
    if !regions_absent {
        names.push(("uvRegion", "UInt16", 4));
    }

    names
        .into_iter()
        .map(|(name, value_type, values_per_element)| GeometryAttributeDoc {
            name,
            binding: attribute_binding(name),
            value_type,
            values_per_element,
        })
        .collect()
}

fn geometry_definition_doc(key: u8, draco_enabled: bool) -> GeometryDefinitionDoc {
    let attributes = geometry_definition_attributes(key);
    let mut buffers = vec![GeometryBufferDoc {
        compressed: None,
        attributes: attributes.clone(),
    }];
    if draco_enabled {
        buffers.push(GeometryBufferDoc {
            compressed: Some("draco"),
            attributes,
        });
    }
    GeometryDefinitionDoc { geometry_buffers: buffers }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PbrDoc {
    base_color_factor: [f32; 4],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MaterialDefinitionDoc {
    alpha_mode: &'static str,
    alpha_cutoff: f32,
    double_sided: bool,
    cull_mode: &'static str,
    emissive_factor: [f32; 3],
    pbr_metallic_roughness: PbrDoc,
}

fn alpha_mode_name(mode: AlphaMode) -> &'static str {
    match mode {
        AlphaMode::Opaque => "opaque",
        AlphaMode::Mask => "mask",
        AlphaMode::Blend => "blend",
    }
}

fn cull_mode_name(mode: CullMode) -> &'static str {
    match mode {
        CullMode::None => "none",
        CullMode::Front => "front",
        CullMode::Back => "back",
    }
}

fn material_definition_doc(material: &MaterialData) -> MaterialDefinitionDoc {
    MaterialDefinitionDoc {
        alpha_mode: alpha_mode_name(material.alpha_mode),
        alpha_cutoff: material.alpha_cutoff.0,
        double_sided: material.double_sided,
        cull_mode: cull_mode_name(material.cull_mode),
        emissive_factor: material.emissive_factor.map(|c| c.0),
        pbr_metallic_roughness: PbrDoc {
            base_color_factor: material.metallic_roughness.base_color_factor.map(|c| c.0),
        },
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TextureSetEntryDoc {
    format: &'static str,
    legacy_tag: &'static str,
}

fn raster_format_name(format: RasterFormat) -> &'static str {
    match format {
        RasterFormat::Jpeg => "jpg",
        RasterFormat::Png => "png",
        RasterFormat::Dxt => "dds",
        RasterFormat::Etc2 => "ktx",
    }
}

fn texture_set_entries_doc(entries: &[TextureDefinitionEntry]) -> Vec<TextureSetEntryDoc> {
    entries
        .iter()
        .map(|e| TextureSetEntryDoc {
            format: raster_format_name(e.format),
            legacy_tag: e.legacy_tag,
        })
        .collect()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AttributeStorageInfoDoc {
    name: String,
    alias: String,
    value_type: ScalarType,
    statistics_href: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatisticsDoc {
    count: u64,
    min: f64,
    max: f64,
    avg: f64,
    stddev: f64,
    most_frequent_values: HashMap<String, u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SceneLayerDocument {
    id: u32,
    version: &'static str,
    layer_type: &'static str,
    spatial_reference: SpatialReferenceDoc,
    store: StoreDescriptorDoc,
    node_pages: NodePagesInfoDoc,
    geometry_definitions: Vec<GeometryDefinitionDoc>,
    material_definitions: Vec<MaterialDefinitionDoc>,
    texture_set_definitions: Vec<Vec<TextureSetEntryDoc>>,
    attribute_storage_info: Vec<AttributeStorageInfoDoc>,
    extent: [f64; 6],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ObbDoc {
    center: [f64; 3],
    half_size: [f32; 3],
    quaternion: [f64; 4],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MbsDoc {
    center: [f64; 3],
    radius: f32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LodSelectionDoc {
    metric_type: &'static str,
    max_error: f64,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct HrefDoc {
    href: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NodeIndexDocument {
    index: u32,
    level: u32,
    obb: ObbDoc,
    mbs: MbsDoc,
    lod_selection: Vec<LodSelectionDoc>,
    children: Vec<u32>,
    parent_index: Option<u32>,
    geometry_definition: Option<u32>,
    material_definition: Option<u32>,
    texture_set_definition: Option<u32>,
    geometry_data: Vec<HrefDoc>,
    texture_data: Vec<HrefDoc>,
    attribute_data: Vec<HrefDoc>,
    shared_resource: Option<HrefDoc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NodePageRecord {
    index: u32,
    obb: ObbDoc,
    mbs: MbsDoc,
    lod_selection: Vec<LodSelectionDoc>,
    children: Vec<u32>,
    parent_index: Option<u32>,
}

/// Per-node legacy shared-resource document: reuses the same interned
/// material/texture tables the top-level layer document carries.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SharedResourceDoc {
    material_definition: Option<u32>,
    texture_set_definition: Option<u32>,
}

fn obb_doc(node: &InternalNode) -> ObbDoc {
    let q = node.bounding_box.orientation;
    ObbDoc {
        center: node.bounding_box.center.to_array(),
        half_size: node.bounding_box.extents.to_array(),
        quaternion: [q.x as f64, q.y as f64, q.z as f64, q.w as f64],
    }
}

fn mbs_doc(node: &InternalNode) -> MbsDoc {
    MbsDoc {
        center: node.sphere.center.to_array(),
        radius: node.sphere.radius,
    }
}

fn lod_selection_doc(node: &InternalNode, metric: LodMetricType) -> Vec<LodSelectionDoc> {
    let max_error = match metric {
        LodMetricType::MaxScreenArea => node.lod_threshold.max_screen_area,
        LodMetricType::MaxScreenSize => node.lod_threshold.max_screen_size,
    };
    vec![LodSelectionDoc {
        metric_type: metric.wire_name(),
        max_error,
    }]
}

/// Dense remapping of the 8 possible geometry-definition keys down to only
/// those actually used, in ascending key order (§4.8).
pub fn dense_geometry_definition_map(usage: [u32; 8]) -> HashMap<u8, u32> {
    let mut map = HashMap::new();
    let mut next = 0u32;
    for key in 0u8..8 {
        if usage[key as usize] > 0 {
            map.insert(key, next);
            next += 1;
        }
    }
    map
}

/// Transforms the root node's eight OBB corners into cartesian space, then
/// inverse-transforms and takes the axis-aligned min/max (§4.8 "extent
/// computation").
fn compute_extent(codecs: &Codecs, root: &InternalNode) -> Result<[f64; 6], Error> {
    let mut corners = obb_corners(&root.bounding_box);
    if !codecs.sr_transform.to_cartesian(&mut corners) {
        return Err(Error::InternalError("to_cartesian_space transform failed"));
    }
    if !codecs.sr_transform.from_cartesian(&mut corners) {
        return Err(Error::InternalError("from_cartesian_space transform failed"));
    }
    let mut min = DVec3::splat(f64::MAX);
    let mut max = DVec3::splat(f64::MIN);
    for c in corners {
        min = min.min(c);
        max = max.max(c);
    }
    Ok([min.x, min.y, min.z, max.x, max.y, max.z])
}

#[allow(clippy::too_many_arguments)]
pub fn finalize(
    archive: &dyn Archive,
    config: &LayerConfig,
    codecs: &Codecs,
    nodes: &HashMap<NodeId, InternalNode>,
    root: NodeId,
    pages: &[Page],
    geometry_usage: [u32; 8],
    materials: Vec<MaterialData>,
    texture_sets: Vec<Vec<TextureDefinitionEntry>>,
    attributes: &AttributeSchema,
) -> Result<(), Error> {
    let _span = tracing::trace_span!("finalize_layer", node_count = nodes.len(), page_count = pages.len()).entered();
    let root_node = nodes.get(&root).ok_or(Error::InvalidTreeTopology(nodes.len()))?;
    let extent = compute_extent(codecs, root_node)?;
    let dense_map = dense_geometry_definition_map(geometry_usage);

    let geometry_definitions: Vec<GeometryDefinitionDoc> = (0u8..8)
        .filter(|k| geometry_usage[*k as usize] > 0)
        .map(|k| geometry_definition_doc(k, codecs.draco_enabled()))
        .collect();

    let material_definitions: Vec<MaterialDefinitionDoc> =
        materials.iter().map(material_definition_doc).collect();
    let texture_set_definitions: Vec<Vec<TextureSetEntryDoc>> =
        texture_sets.iter().map(|entries| texture_set_entries_doc(entries)).collect();

    let attribute_storage_info: Vec<AttributeStorageInfoDoc> = (0..attributes.len() as u32)
        .filter_map(|i| attributes.slot(i))
        .enumerate()
        .map(|(i, slot)| AttributeStorageInfoDoc {
            name: slot.name.clone(),
            alias: slot.alias.clone(),
            value_type: slot.scalar_type.unwrap_or(ScalarType::String),
            statistics_href: Some(format!("statistics/f_{i}/0.json.gz")),
        })
        .collect();

    let layer_doc = SceneLayerDocument {
        id: config.id,
        version: I3S_VERSION,
        layer_type: config.layer_type,
        spatial_reference: SpatialReferenceDoc {
            wkid: config.spatial_reference.wkid,
        },
        store: StoreDescriptorDoc { version: I3S_VERSION },
        node_pages: NodePagesInfoDoc {
            nodes_per_page: config.page_size,
            lod_selection_metric_type: config.lod_metric.wire_name(),
        },
        geometry_definitions,
        material_definitions,
        texture_set_definitions,
        attribute_storage_info,
        extent,
    };
    append_json(archive, "3dSceneLayer.json.gz", &layer_doc)?;

    let metadata_json = serde_json::to_vec(&MetadataDoc {
        i3s_version: I3S_VERSION,
        node_count: nodes.len() as u32,
    })?;
    if !archive.append_file("metadata.json", &metadata_json) {
        return Err(Error::IoWriteFailed);
    }

    for (i, value) in attribute_statistics_docs(attributes).into_iter().enumerate() {
        append_json(archive, &format!("statistics/f_{i}/0.json.gz"), &value)?;
    }

    for (page_index, page) in pages.iter().enumerate() {
        let records: Vec<NodePageRecord> = page
            .nodes
            .iter()
            .map(|pn| NodePageRecord {
                index: pn.index,
                obb: obb_doc(&pn.node),
                mbs: mbs_doc(&pn.node),
                lod_selection: lod_selection_doc(&pn.node, config.lod_metric),
                children: pn.children.clone(),
                parent_index: pn.parent_index,
            })
            .collect();
        append_json(archive, &format!("nodepages/{page_index}.json.gz"), &records)?;

        for pn in &page.nodes {
            let node = &pn.node;
            let legacy_id = node.id.0;
            let mut geometry_data = vec![HrefDoc {
                href: "geometries/0".to_string(),
            }];
            if codecs.draco_enabled() && node.geometry_definition_key.is_some() {
                geometry_data.push(HrefDoc {
                    href: "geometries/1".to_string(),
                });
            }
            let texture_data = node
                .texture_set_id
                .map(|_| HrefDoc { href: "textures/0".to_string() })
                .into_iter()
                .collect();
            let attribute_data = (0..attribute_storage_info_len(attributes))
                .map(|i| HrefDoc {
                    href: format!("attributes/f_{i}/0"),
                })
                .collect();
            let shared_resource = (node.material_id.is_some() || node.texture_set_id.is_some())
                .then(|| HrefDoc { href: "shared/sharedResource".to_string() });

            let doc = NodeIndexDocument {
                index: pn.index,
                level: node.depth,
                obb: obb_doc(node),
                mbs: mbs_doc(node),
                lod_selection: lod_selection_doc(node, config.lod_metric),
                children: pn.children.clone(),
                parent_index: pn.parent_index,
                geometry_definition: node.geometry_definition_key.and_then(|k| dense_map.get(&k).copied()),
                material_definition: node.material_id,
                texture_set_definition: node.texture_set_id,
                geometry_data,
                texture_data,
                attribute_data,
                shared_resource: shared_resource.clone(),
            };
            append_json(archive, &format!("nodes/{legacy_id}/3dNodeIndexDocument.json.gz"), &doc)?;
            if node.id == root {
                append_json(archive, "nodes/root/3dNodeIndexDocument.json.gz", &doc)?;
            }

            if shared_resource.is_some() {
                let shared_doc = SharedResourceDoc {
                    material_definition: node.material_id,
                    texture_set_definition: node.texture_set_id,
                };
                append_json(
                    archive,
                    &format!("nodes/{legacy_id}/shared/sharedResource.json.gz"),
                    &shared_doc,
                )?;
            }
        }
    }

    tracing::debug!(node_count = nodes.len(), "wrote scene layer archive entries");
    Ok(())
}

fn attribute_storage_info_len(attributes: &AttributeSchema) -> usize {
    attributes.len()
}

fn attribute_statistics_docs(attributes: &AttributeSchema) -> Vec<StatisticsDoc> {
    (0..attributes.len() as u32)
        .filter_map(|i| attributes.slot(i))
        .map(|slot| StatisticsDoc {
            count: slot.statistics.count,
            min: slot.statistics.min,
            max: slot.statistics.max,
            avg: slot.statistics.avg(),
            stddev: slot.statistics.stddev(),
            most_frequent_values: slot.statistics.most_frequent_values.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests_support::MemoryArchive;
    use crate::codecs::Codecs;
    use crate::node::{LodThreshold, NodeKind};
    use crate::pages::{build_pages, PageStrategy};
    use i3s_geom::{compute_obb, FitMetric};

    fn leaf(id: u32) -> InternalNode {
        let (bounding_box, sphere) = compute_obb(&[], FitMetric::MinSurfaceArea);
        InternalNode {
            id: NodeId(id),
            bounding_box,
            sphere,
            depth: 0,
            lod_threshold: LodThreshold::from_max_screen_area(1.0),
            geometry_definition_key: Some(4),
            material_id: None,
            texture_set_id: None,
            children: vec![],
            parent: None,
            kind: NodeKind::Triangles,
        }
    }

    #[test]
    fn metadata_and_layer_document_are_written() {
        let archive = MemoryArchive::default();
        let mut nodes = HashMap::new();
        nodes.insert(NodeId(0), leaf(0));
        let pages = build_pages(&nodes, NodeId(0), 64, PageStrategy::BreadthFirst).unwrap();
        let config = LayerConfig {
            id: 0,
            layer_type: "3DObject",
            spatial_reference: SpatialReference { wkid: 4326 },
            page_size: 64,
            lod_metric: LodMetricType::MaxScreenArea,
        };
        let codecs = Codecs::default();
        let schema = AttributeSchema::new();

        finalize(
            &archive,
            &config,
            &codecs,
            &nodes,
            NodeId(0),
            &pages,
            [0, 0, 0, 0, 1, 0, 0, 0],
            vec![],
            vec![],
            &schema,
        )
        .unwrap();

        let files = archive.files.lock();
        assert!(files.contains_key("3dSceneLayer.json.gz"));
        assert!(files.contains_key("metadata.json"));
        assert!(files.contains_key("nodepages/0.json.gz"));
        assert!(files.contains_key("nodes/root/3dNodeIndexDocument.json.gz"));
    }

    #[test]
    fn dense_map_skips_unused_keys() {
        let map = dense_geometry_definition_map([0, 5, 0, 0, 2, 0, 0, 0]);
        assert_eq!(map.get(&1).copied(), Some(0));
        assert_eq!(map.get(&4).copied(), Some(1));
        assert_eq!(map.get(&0), None);
    }
}
