//! In-memory conditioned-mesh, material/texture and attribute representation
//! for an I3S scene layer, plus the binary encodings (legacy geometry
//! buffer, attribute buffers) and dedup tables the layer writer needs.

#![deny(unsafe_op_in_unsafe_fn)]
#![deny(unused_crate_dependencies)]

pub mod attribute;
pub mod codec;
pub mod legacy;
pub mod material;
pub mod mesh;
pub mod texture;

use thiserror::Error;

pub use codec::{Decode, Encode};

/// Errors shared across the model crate. The writer crate wraps these into
/// its own broader error kind (`i3s_writer::Error`).
#[derive(Debug, Error)]
pub enum Error {
    #[error("out of range {kind}: got {got}, max {max}")]
    OutOfRangeId {
        kind: &'static str,
        got: u32,
        max: u32,
    },
    #[error("attribute type mismatch for {kind}: got {got:?}, expected {expected:?}")]
    TypeMismatch {
        kind: &'static str,
        got: ScalarType,
        expected: ScalarType,
    },
    #[error("face range {first}..={last} is not triangle-aligned or out of bounds (max {max})")]
    InvalidFaceRange { first: u32, last: u32, max: u32 },
    #[error("missing jpeg or png source texture")]
    MissingJpgOrPng,
    #[error("image encoding failed for format {0:?}")]
    ImageEncodingError(texture::RasterFormat),
    #[error("image decoding failed for format {0:?}")]
    ImageDecodingError(texture::RasterFormat),
}

/// A bit set over the six mesh attribute channels. Modeled as a fixed-size
/// bitset rather than a general set type, matching the small, closed
/// universe of channels a conditioned mesh can carry.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct AttributeMask(u8);

impl AttributeMask {
    pub const POS: Self = Self(1 << 0);
    pub const NORMAL: Self = Self(1 << 1);
    pub const UV0: Self = Self(1 << 2);
    pub const COLOR: Self = Self(1 << 3);
    pub const REGION: Self = Self(1 << 4);
    pub const FEATURE_ID: Self = Self(1 << 5);

    pub const EMPTY: Self = Self(0);

    pub fn contains(self, bit: Self) -> bool {
        self.0 & bit.0 == bit.0
    }

    pub fn insert(&mut self, bit: Self) {
        self.0 |= bit.0;
    }

    pub fn remove(&mut self, bit: Self) {
        self.0 &= !bit.0;
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }
}

/// The scalar types an attribute-schema slot may hold.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScalarType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    String,
    Date,
    ObjectId,
    GlobalId,
    Guid,
}

impl ScalarType {
    /// Byte width of the fixed-size scalar encoding (ignored for `String`,
    /// which has its own variable-length layout).
    pub fn byte_width(self) -> usize {
        match self {
            ScalarType::Int8 | ScalarType::UInt8 => 1,
            ScalarType::Int16 | ScalarType::UInt16 => 2,
            ScalarType::Int32 | ScalarType::UInt32 | ScalarType::ObjectId => 4,
            ScalarType::Float32 => 4,
            ScalarType::Int64
            | ScalarType::UInt64
            | ScalarType::Float64
            | ScalarType::Date
            | ScalarType::GlobalId => 8,
            ScalarType::Guid => 16,
            ScalarType::String => 0,
        }
    }
}

/// Geometry-definition key: a dense index over the 8 combinations of
/// {normals dropped, colors dropped, regions absent}.
pub fn geometry_definition_key(normals_dropped: bool, colors_dropped: bool, regions_absent: bool) -> u8 {
    (normals_dropped as u8) | ((colors_dropped as u8) << 1) | ((regions_absent as u8) << 2)
}
