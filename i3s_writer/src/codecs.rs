//! The external collaborator interfaces (§6): injected codec closures for
//! image formats, Draco mesh compression, and spatial-reference transforms.
//! The writer calls only the closures it finds present; absence of a
//! closure disables that path (e.g. no Draco closure ⇒ legacy-only
//! geometry).

use std::sync::Arc;

use glam::DVec3;
use i3s_model::mesh::TriangleMesh;

pub use i3s_model::texture::ImageCodecs;

use crate::Error;

/// Encodes a conditioned mesh into a Draco buffer, given the anisotropic
/// per-axis scale factors the node assembler derives from the local
/// cartesian frame (§4.6: "scale coordinates anisotropically ... invoke the
/// injected Draco encoder with the two scale values").
pub type DracoEncodeFn =
    Arc<dyn Fn(&TriangleMesh, f64, f64) -> Result<Vec<u8>, Error> + Send + Sync>;

/// Transforms points between a spatial reference's native coordinates and
/// cartesian space. Returns `false` on failure, matching the closure-style
/// boolean-return collaborator interface in §6.
pub trait SrTransform: Send + Sync {
    fn to_cartesian(&self, points: &mut [DVec3]) -> bool;
    fn from_cartesian(&self, points: &mut [DVec3]) -> bool;
}

/// An identity transform for a layer whose spatial reference is already
/// cartesian: no anisotropic Draco scaling is needed.
#[derive(Default)]
pub struct IdentitySrTransform;

impl SrTransform for IdentitySrTransform {
    fn to_cartesian(&self, _points: &mut [DVec3]) -> bool {
        true
    }

    fn from_cartesian(&self, _points: &mut [DVec3]) -> bool {
        true
    }
}

/// Cartesian displacement of a unit eastward / northward step at `origin`,
/// used to derive the Draco anisotropic scale on an ellipsoidal frame
/// (§4.6). Implemented against the trait rather than as a trait method so
/// non-ellipsoidal transforms don't need to reason about it.
pub fn east_north_steps(transform: &dyn SrTransform, origin: DVec3) -> (DVec3, DVec3) {
    let mut pts = [origin, origin + DVec3::X, origin + DVec3::Y];
    transform.to_cartesian(&mut pts);
    (pts[1] - pts[0], pts[2] - pts[0])
}

/// The full bundle of injected collaborators a [`crate::LayerWriter`] is
/// constructed with. Every field is optional except the SR transform, which
/// defaults to identity.
pub struct Codecs {
    pub images: ImageCodecs,
    pub draco: Option<DracoEncodeFn>,
    pub sr_transform: Arc<dyn SrTransform>,
}

impl Default for Codecs {
    fn default() -> Self {
        Self {
            images: ImageCodecs::default(),
            draco: None,
            sr_transform: Arc::new(IdentitySrTransform),
        }
    }
}

impl Codecs {
    pub fn draco_enabled(&self) -> bool {
        self.draco.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_transform_east_north_steps_are_unit_axes() {
        let (east, north) = east_north_steps(&IdentitySrTransform, DVec3::ZERO);
        assert_eq!(east, DVec3::X);
        assert_eq!(north, DVec3::Y);
    }
}
