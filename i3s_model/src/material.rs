//! Material data and the thread-safe material interner (§4.4).

use std::collections::HashMap;

use glam::Vec4;
use parking_lot::Mutex;

use crate::texture::TextureBuffer;

/// Default alpha cutoff, used to normalize Opaque materials so interner
/// equality stays meaningful regardless of what cutoff value a client sent.
pub const DEFAULT_ALPHA_CUTOFF: f32 = 0.25;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlphaMode {
    Opaque,
    Mask,
    Blend,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CullMode {
    None,
    Front,
    Back,
}

/// Bit-exact comparable representation of an f32, used so `MaterialData`
/// can derive `Eq`/`Hash` for interning.
#[derive(Copy, Clone, Debug)]
pub struct OrdF32(pub f32);

impl PartialEq for OrdF32 {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}
impl Eq for OrdF32 {}
impl std::hash::Hash for OrdF32 {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PbrMetallicRoughness {
    pub base_color_factor: [OrdF32; 4],
    pub textures: TextureBuffer,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MaterialData {
    pub alpha_mode: AlphaMode,
    pub alpha_cutoff: OrdF32,
    pub double_sided: bool,
    pub cull_mode: CullMode,
    pub emissive_factor: [OrdF32; 3],
    pub metallic_roughness: PbrMetallicRoughness,
}

impl MaterialData {
    pub fn new(
        alpha_mode: AlphaMode,
        alpha_cutoff: f32,
        double_sided: bool,
        cull_mode: CullMode,
        emissive_factor: [f32; 3],
        base_color_factor: Vec4,
        textures: TextureBuffer,
    ) -> Self {
        // Normalize the cutoff for Opaque materials so two otherwise-equal
        // materials that disagree only on an unused cutoff still intern to
        // the same ID.
        let alpha_cutoff = if alpha_mode == AlphaMode::Opaque {
            DEFAULT_ALPHA_CUTOFF
        } else {
            alpha_cutoff
        };

        Self {
            alpha_mode,
            alpha_cutoff: OrdF32(alpha_cutoff),
            double_sided,
            cull_mode,
            emissive_factor: emissive_factor.map(OrdF32),
            metallic_roughness: PbrMetallicRoughness {
                base_color_factor: base_color_factor.to_array().map(OrdF32),
                textures,
            },
        }
    }
}

/// Interns [`MaterialData`] values, assigning the first unused small
/// integer ID to each distinct normalized material. Safe to call
/// concurrently from multiple node-assembler threads.
#[derive(Debug, Default)]
pub struct MaterialInterner {
    inner: Mutex<InternerState>,
}

#[derive(Debug, Default)]
struct InternerState {
    by_value: HashMap<MaterialData, u32>,
    ordered: Vec<MaterialData>,
}

impl MaterialInterner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&self, material: MaterialData) -> u32 {
        let mut state = self.inner.lock();
        if let Some(&id) = state.by_value.get(&material) {
            return id;
        }
        let id = state.ordered.len() as u32;
        state.ordered.push(material.clone());
        state.by_value.insert(material, id);
        id
    }

    /// All interned materials in insertion (ID) order.
    pub fn definitions(&self) -> Vec<MaterialData> {
        self.inner.lock().ordered.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::texture::TextureBuffer;

    #[test]
    fn opaque_materials_normalize_cutoff() {
        let interner = MaterialInterner::new();
        let a = MaterialData::new(
            AlphaMode::Opaque,
            0.1,
            false,
            CullMode::Back,
            [0.0; 3],
            Vec4::ONE,
            TextureBuffer::default(),
        );
        let b = MaterialData::new(
            AlphaMode::Opaque,
            0.9,
            false,
            CullMode::Back,
            [0.0; 3],
            Vec4::ONE,
            TextureBuffer::default(),
        );
        assert_eq!(interner.intern(a), interner.intern(b));
        assert_eq!(interner.len(), 1);
    }

    #[test]
    fn distinct_materials_get_distinct_ids() {
        let interner = MaterialInterner::new();
        let a = MaterialData::new(
            AlphaMode::Opaque,
            0.25,
            false,
            CullMode::Back,
            [0.0; 3],
            Vec4::ONE,
            TextureBuffer::default(),
        );
        let b = MaterialData::new(
            AlphaMode::Mask,
            0.5,
            false,
            CullMode::Back,
            [0.0; 3],
            Vec4::ONE,
            TextureBuffer::default(),
        );
        assert_eq!(interner.intern(a), 0);
        assert_eq!(interner.intern(b), 1);
    }
}
