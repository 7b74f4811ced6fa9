//! The I3S layer-writer pipeline: tree-to-pages assembler, node assembler,
//! page builder and layer finalizer (§4.6–§4.9).

#![deny(unsafe_op_in_unsafe_fn)]
#![deny(unused_crate_dependencies)]

pub mod archive;
pub mod assembler;
pub mod codecs;
pub mod finalizer;
pub mod node;
pub mod pages;
pub mod writer;

use thiserror::Error;

pub use node::{NodeId, SimpleNode};
pub use writer::LayerWriter;

/// The writer's status codes (§7). Kinds are descriptive of the failure,
/// not a 1:1 mirror of any particular reader's exception hierarchy.
#[derive(Debug, Error)]
pub enum Error {
    #[error("archive append failed")]
    IoWriteFailed,
    #[error("invalid tree topology: {0} extra working-set entries remained at save")]
    InvalidTreeTopology(usize),
    #[error(transparent)]
    Model(#[from] i3s_model::Error),
    #[error("empty leaf node")]
    EmptyLeafNode,
    #[error("compression failed for format {0:?}")]
    CompressionError(&'static str),
    #[error("draco encoding failed")]
    DracoEncodingError,
    #[error("json serialization failed: {0}")]
    JsonParsingError(#[from] serde_json::Error),
    #[error("internal error: {0}")]
    InternalError(&'static str),
}

/// Warnings routed through an injected tracker; they never change a
/// call's returned status (§7, §4.9).
#[derive(Debug, Clone)]
pub enum Warning {
    DegenerateMesh { node: NodeId },
    BadUvs { node: NodeId, fixed: usize },
    OutOfRangeFaceRange { node: NodeId, count: u32 },
    MissingAttributeStatistics { node: NodeId, slot: u32 },
}

/// Receives warnings that don't fail the calling operation. The default
/// implementation logs through `tracing`, matching the rest of the
/// workspace's ambient logging.
pub trait WarningTracker: Send + Sync {
    fn warn(&self, warning: Warning);
}

#[derive(Default)]
pub struct TracingWarningTracker;

impl WarningTracker for TracingWarningTracker {
    fn warn(&self, warning: Warning) {
        tracing::warn!(?warning, "i3s writer warning");
    }
}
