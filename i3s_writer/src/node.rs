//! Node identifiers, client-submitted "simple" nodes, and the internal node
//! record the writer builds from them (§3).

use i3s_geom::{BoundingSphere, Obb};
use i3s_model::attribute::AttrValue;
use i3s_model::material::MaterialData;
use i3s_model::mesh::Mesh;

/// A node identifier. Client-assigned on submission (the root receives the
/// largest ID in the submitted sequence); remapped to a dense page-relative
/// index by the page builder.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Sentinel denoting an empty leaf child slot (§3: "any may be the
    /// sentinel invalid to denote an empty leaf that must be skipped").
    pub const INVALID: NodeId = NodeId(u32::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// LOD threshold carried both as the client's max-screen-area metric and
/// the equivalent max-screen-size metric, kept for readers that expect
/// either (§4.6 step 1: `size = 2 * sqrt(area / pi)`).
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LodThreshold {
    pub max_screen_area: f64,
    pub max_screen_size: f64,
}

impl LodThreshold {
    pub fn from_max_screen_area(max_screen_area: f64) -> Self {
        Self {
            max_screen_area,
            max_screen_size: 2.0 * (max_screen_area / std::f64::consts::PI).sqrt(),
        }
    }
}

/// A client-submitted node, before assembly (§3 "simple node").
#[derive(Clone, Debug)]
pub struct SimpleNode {
    pub id: NodeId,
    pub mesh: Option<Mesh>,
    /// The mesh's material, interned by the node assembler (§4.4). Absent
    /// for a meshless node or a mesh with no material assignment.
    pub material: Option<MaterialData>,
    /// Per-slot attribute columns submitted for this node: one entry per
    /// declared attribute index, with one value per feature (§3 "attribute
    /// buffer layout").
    pub attributes: Vec<(u32, Vec<AttrValue>)>,
    pub lod_threshold: LodThreshold,
    pub children: Vec<NodeId>,
    pub depth: u32,
}

impl SimpleNode {
    pub fn new(id: NodeId, depth: u32, max_screen_area: f64) -> Self {
        Self {
            id,
            mesh: None,
            material: None,
            attributes: Vec::new(),
            lod_threshold: LodThreshold::from_max_screen_area(max_screen_area),
            children: Vec::new(),
            depth,
        }
    }

    pub fn with_mesh(mut self, mesh: Mesh) -> Self {
        self.mesh = Some(mesh);
        self
    }

    pub fn with_material(mut self, material: MaterialData) -> Self {
        self.material = Some(material);
        self
    }

    pub fn with_attributes(mut self, attributes: Vec<(u32, Vec<AttrValue>)>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_children(mut self, children: Vec<NodeId>) -> Self {
        self.children = children;
        self
    }

    /// Children with the invalid sentinel elided (§3, §8 "empty leaf"
    /// boundary case).
    pub fn present_children(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.children.iter().copied().filter(NodeId::is_valid)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Meshless,
    Triangles,
    Points,
}

/// The record the writer builds for each submitted node (§3 "internal node
/// record"). Produced by the node assembler, consumed by the page builder
/// and layer finalizer.
#[derive(Clone, Debug)]
pub struct InternalNode {
    pub id: NodeId,
    pub bounding_box: Obb,
    pub sphere: BoundingSphere,
    pub depth: u32,
    pub lod_threshold: LodThreshold,
    /// `None` for a meshless node; otherwise one of the 8 keys from
    /// [`i3s_model::geometry_definition_key`].
    pub geometry_definition_key: Option<u8>,
    pub material_id: Option<u32>,
    pub texture_set_id: Option<u32>,
    pub children: Vec<NodeId>,
    pub parent: Option<NodeId>,
    pub kind: NodeKind,
}

impl InternalNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// The working-set entry held between a node's submission and its
/// absorption as a child of a later submission, or its finalization as the
/// root (§3 "working set").
#[derive(Clone, Debug)]
pub struct NodeBrief {
    pub node: InternalNode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lod_threshold_derives_size_from_area() {
        let lod = LodThreshold::from_max_screen_area(std::f64::consts::PI);
        assert!((lod.max_screen_size - 2.0).abs() < 1e-9);
    }

    #[test]
    fn invalid_sentinel_is_filtered_from_present_children() {
        let node = SimpleNode::new(NodeId(0), 0, 1.0)
            .with_children(vec![NodeId(1), NodeId::INVALID, NodeId(2)]);
        let present: Vec<_> = node.present_children().collect();
        assert_eq!(present, vec![NodeId(1), NodeId(2)]);
    }
}
