//! Writer orchestration (§4.9): owns the shared assembler state, the
//! working set and the resolved-node accumulator, and drives `save`
//! through the page builder and layer finalizer.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::archive::Archive;
use crate::assembler::{self, AssemblerContext, NormalFrame};
use crate::codecs::Codecs;
use crate::finalizer::{self, LayerConfig};
use crate::node::{InternalNode, NodeBrief, NodeId, SimpleNode};
use crate::pages::{self, PageStrategy};
use crate::{Error, WarningTracker};

struct WriterState {
    working_set: HashMap<NodeId, NodeBrief>,
    resolved: Vec<InternalNode>,
}

/// The layer writer (§4.9): the entry point a client drives node-by-node,
/// then finalizes once with `save`.
pub struct LayerWriter {
    ctx: AssemblerContext,
    archive: Arc<dyn Archive>,
    tracker: Arc<dyn WarningTracker>,
    state: Mutex<WriterState>,
    config: LayerConfig,
}

impl LayerWriter {
    pub fn new(
        archive: Arc<dyn Archive>,
        tracker: Arc<dyn WarningTracker>,
        codecs: Codecs,
        max_texture_size: u32,
        normal_frame: NormalFrame,
        config: LayerConfig,
    ) -> Self {
        Self {
            ctx: AssemblerContext::new(codecs, max_texture_size, normal_frame),
            archive,
            tracker,
            state: Mutex::new(WriterState {
                working_set: HashMap::new(),
                resolved: Vec::new(),
            }),
            config,
        }
    }

    /// `create_output_node` (§4.6): conditions and encodes the node's mesh
    /// (if any), interns its material/textures, writes every per-node
    /// artifact, and returns the resulting record without touching the
    /// working set.
    pub fn create_output_node(&self, node: SimpleNode) -> Result<InternalNode, Error> {
        assembler::create_output_node(&self.ctx, self.archive.as_ref(), self.tracker.as_ref(), node)
    }

    /// `process_children` (§4.6): absorbs `parent`'s referenced children out
    /// of the working set into the resolved accumulator, merging their OBBs
    /// into `parent`'s own if it carries no mesh.
    pub fn process_children(&self, parent: &mut InternalNode) -> Result<(), Error> {
        let mut state = self.state.lock();
        let WriterState { working_set, resolved } = &mut *state;
        assembler::process_children(parent, working_set, resolved)
    }

    /// The convenience of `create_output_node` followed by
    /// `process_children`, leaving the resulting record staged in the
    /// working set under its own ID (§4.6).
    pub fn create_node(&self, node: SimpleNode) -> Result<NodeId, Error> {
        let id = node.id;
        let mut internal = self.create_output_node(node)?;
        self.process_children(&mut internal)?;
        self.state.lock().working_set.insert(id, NodeBrief { node: internal });
        Ok(id)
    }

    /// Finalizes the layer: pages the tree, then emits the scene-layer
    /// document, paged-index documents, per-node legacy documents and
    /// attribute statistics (§4.7, §4.8). Fails with
    /// [`Error::InvalidTreeTopology`] unless exactly one node — the root —
    /// remains unabsorbed in the working set (§4.9, §7).
    pub fn save(self, strategy: PageStrategy) -> Result<(), Error> {
        let mut state = self.state.into_inner();
        if state.working_set.len() != 1 {
            return Err(Error::InvalidTreeTopology(state.working_set.len()));
        }
        let (root_id, root_brief) = state.working_set.into_iter().next().expect("checked len == 1");
        state.resolved.push(root_brief.node);

        let nodes: HashMap<NodeId, InternalNode> =
            state.resolved.into_iter().map(|n| (n.id, n)).collect();

        let built_pages = pages::build_pages(&nodes, root_id, self.config.page_size, strategy)?;

        let attributes = self.ctx.attributes.lock();
        finalizer::finalize(
            self.archive.as_ref(),
            &self.config,
            &self.ctx.codecs,
            &nodes,
            root_id,
            &built_pages,
            self.ctx.geometry_definition_usage(),
            self.ctx.materials.definitions(),
            self.ctx.textures.definitions(),
            &attributes,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests_support::MemoryArchive;
    use crate::finalizer::{LodMetricType, SpatialReference};
    use glam::{DVec3, Vec2, Vec3};
    use i3s_model::mesh::{Mesh, TriangleMesh};
    use i3s_model::AttributeMask;

    fn quad_node(id: u32, depth: u32, children: Vec<NodeId>) -> SimpleNode {
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
        SimpleNode::new(NodeId(id), depth, 1.0)
            .with_mesh(Mesh::Triangles(mesh))
            .with_children(children)
    }

    fn config() -> LayerConfig {
        LayerConfig {
            id: 0,
            layer_type: "3DObject",
            spatial_reference: SpatialReference { wkid: 4326 },
            page_size: 64,
            lod_metric: LodMetricType::MaxScreenArea,
        }
    }

    #[test]
    fn two_node_tree_saves_one_page_with_root_first() {
        let archive = Arc::new(MemoryArchive::default());
        let tracker = Arc::new(crate::TracingWarningTracker);
        let writer = LayerWriter::new(
            archive.clone(),
            tracker,
            Codecs::default(),
            4096,
            NormalFrame::VertexLocal,
            config(),
        );

        writer.create_node(quad_node(0, 1, vec![])).unwrap();
        writer.create_node(quad_node(1, 0, vec![NodeId(0)])).unwrap();

        writer.save(PageStrategy::BreadthFirst).unwrap();

        let files = archive.files.lock();
        assert!(files.contains_key("3dSceneLayer.json.gz"));
        assert!(files.contains_key("metadata.json"));
        assert!(files.contains_key("nodepages/0.json.gz"));
        assert!(files.contains_key("nodes/root/3dNodeIndexDocument.json.gz"));
    }

    #[test]
    fn save_with_unabsorbed_nodes_is_invalid_topology() {
        let archive = Arc::new(MemoryArchive::default());
        let tracker = Arc::new(crate::TracingWarningTracker);
        let writer = LayerWriter::new(
            archive,
            tracker,
            Codecs::default(),
            4096,
            NormalFrame::VertexLocal,
            config(),
        );

        writer.create_node(quad_node(0, 0, vec![])).unwrap();
        writer.create_node(quad_node(1, 0, vec![])).unwrap();

        let err = writer.save(PageStrategy::BreadthFirst);
        assert!(matches!(err, Err(Error::InvalidTreeTopology(2))));
    }

    #[test]
    fn running_attribute_mask_reflects_submitted_geometry() {
        let archive = Arc::new(MemoryArchive::default());
        let tracker = Arc::new(crate::TracingWarningTracker);
        let writer = LayerWriter::new(
            archive,
            tracker,
            Codecs::default(),
            4096,
            NormalFrame::VertexLocal,
            config(),
        );
        writer.create_node(quad_node(0, 0, vec![])).unwrap();
        assert!(writer.ctx.running_mask().contains(AttributeMask::POS));
        assert!(writer.ctx.running_mask().contains(AttributeMask::UV0));
    }
}
