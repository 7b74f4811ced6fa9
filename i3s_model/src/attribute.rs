//! Attribute-schema aggregation, attribute-buffer encoding, and the
//! per-attribute statistics documents written alongside each node's
//! attribute buffer.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::Encode;
use crate::{Error, ScalarType};

/// A single attribute value. `Str(None)` is the JSON-`null` / zero-length
/// string distinguished from `Str(Some(String::new()))`, the empty string.
#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    /// Epoch-millisecond timestamp, sharing the 8-byte-aligned integer
    /// buffer layout rather than a string encoding.
    Date(i64),
    ObjectId(u32),
    GlobalId(u64),
    Guid([u8; 16]),
    Str(Option<String>),
}

impl AttrValue {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            AttrValue::Int8(_) => ScalarType::Int8,
            AttrValue::UInt8(_) => ScalarType::UInt8,
            AttrValue::Int16(_) => ScalarType::Int16,
            AttrValue::UInt16(_) => ScalarType::UInt16,
            AttrValue::Int32(_) => ScalarType::Int32,
            AttrValue::UInt32(_) => ScalarType::UInt32,
            AttrValue::Int64(_) => ScalarType::Int64,
            AttrValue::UInt64(_) => ScalarType::UInt64,
            AttrValue::Float32(_) => ScalarType::Float32,
            AttrValue::Float64(_) => ScalarType::Float64,
            AttrValue::Date(_) => ScalarType::Date,
            AttrValue::ObjectId(_) => ScalarType::ObjectId,
            AttrValue::GlobalId(_) => ScalarType::GlobalId,
            AttrValue::Guid(_) => ScalarType::Guid,
            AttrValue::Str(_) => ScalarType::String,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        Some(match self {
            AttrValue::Int8(v) => *v as f64,
            AttrValue::UInt8(v) => *v as f64,
            AttrValue::Int16(v) => *v as f64,
            AttrValue::UInt16(v) => *v as f64,
            AttrValue::Int32(v) => *v as f64,
            AttrValue::UInt32(v) => *v as f64,
            AttrValue::Int64(v) => *v as f64,
            AttrValue::UInt64(v) => *v as f64,
            AttrValue::Float32(v) => *v as f64,
            AttrValue::Float64(v) => *v,
            AttrValue::Date(v) => *v as f64,
            AttrValue::ObjectId(v) => *v as f64,
            AttrValue::GlobalId(v) => *v as f64,
            _ => return None,
        })
    }
}

/// Per logical field index: the tuple the writer requires all nodes to
/// agree on at each slot. The first non-null submission fixes the type.
#[derive(Clone, Debug)]
pub struct AttributeSlot {
    pub name: String,
    pub alias: String,
    pub scalar_type: Option<ScalarType>,
    pub statistics: Statistics,
}

impl AttributeSlot {
    pub fn new(name: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: alias.into(),
            scalar_type: None,
            statistics: Statistics::default(),
        }
    }
}

/// Aggregates per-field values across every node so the writer can emit
/// attribute buffers of a consistent type and the final statistics
/// documents (`statistics/f_<i>/0.json.gz`).
#[derive(Debug, Default)]
pub struct AttributeSchema {
    slots: Vec<AttributeSlot>,
}

impl AttributeSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, name: impl Into<String>, alias: impl Into<String>) -> u32 {
        self.slots.push(AttributeSlot::new(name, alias));
        (self.slots.len() - 1) as u32
    }

    pub fn slot(&self, index: u32) -> Option<&AttributeSlot> {
        self.slots.get(index as usize)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Validates (and, on first call for a slot, fixes) the type of a
    /// column of values, then folds them into that slot's running
    /// statistics.
    pub fn record(&mut self, index: u32, values: &[AttrValue]) -> Result<(), Error> {
        let len = self.slots.len() as u32;
        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or(Error::OutOfRangeId {
                kind: "attribute",
                got: index,
                max: len,
            })?;

        for value in values {
            let ty = value.scalar_type();
            match slot.scalar_type {
                None => slot.scalar_type = Some(ty),
                Some(expected) if expected != ty => {
                    return Err(Error::TypeMismatch {
                        kind: "attribute",
                        got: ty,
                        expected,
                    })
                }
                _ => {}
            }
            slot.statistics.observe(value);
        }
        Ok(())
    }
}

/// Per-field statistics document contents. Numeric fields track
/// min/max/avg/stddev incrementally (Welford's algorithm); string fields
/// track a bounded most-frequent-values histogram.
#[derive(Clone, Debug, Default)]
pub struct Statistics {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    mean: f64,
    m2: f64,
    pub most_frequent_values: HashMap<String, u64>,
}

const MAX_HISTOGRAM_ENTRIES: usize = 256;

impl Statistics {
    fn observe(&mut self, value: &AttrValue) {
        if let AttrValue::Str(s) = value {
            if let Some(s) = s {
                if self.most_frequent_values.len() < MAX_HISTOGRAM_ENTRIES
                    || self.most_frequent_values.contains_key(s)
                {
                    *self.most_frequent_values.entry(s.clone()).or_insert(0) += 1;
                }
            }
            return;
        }
        let Some(v) = value.as_f64() else { return };
        if self.count == 0 {
            self.min = v;
            self.max = v;
        } else {
            self.min = self.min.min(v);
            self.max = self.max.max(v);
        }
        self.count += 1;
        let delta = v - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = v - self.mean;
        self.m2 += delta * delta2;
    }

    pub fn avg(&self) -> f64 {
        self.mean
    }

    pub fn stddev(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / self.count as f64).sqrt()
        }
    }
}

/// 4-byte count header, 4-byte padding to 8-byte alignment inserted only
/// ahead of 8-byte scalars, then the contiguous array.
pub fn encode_scalar_buffer(values: &[AttrValue]) -> Bytes {
    let mut buf = BytesMut::new();
    (values.len() as u32).encode(&mut buf);

    let needs_padding = values
        .first()
        .map(|v| v.scalar_type().byte_width() == 8)
        .unwrap_or(false);
    if needs_padding {
        buf.put_slice(&[0u8; 4]);
    }

    for value in values {
        match value {
            AttrValue::Int8(v) => v.encode(&mut buf),
            AttrValue::UInt8(v) => v.encode(&mut buf),
            AttrValue::Int16(v) => v.encode(&mut buf),
            AttrValue::UInt16(v) => v.encode(&mut buf),
            AttrValue::Int32(v) => v.encode(&mut buf),
            AttrValue::UInt32(v) => v.encode(&mut buf),
            AttrValue::Int64(v) => v.encode(&mut buf),
            AttrValue::UInt64(v) => v.encode(&mut buf),
            AttrValue::Float32(v) => v.encode(&mut buf),
            AttrValue::Float64(v) => v.encode(&mut buf),
            AttrValue::Date(v) => v.encode(&mut buf),
            AttrValue::ObjectId(v) => v.encode(&mut buf),
            AttrValue::GlobalId(v) => v.encode(&mut buf),
            AttrValue::Guid(bytes) => buf.put_slice(bytes),
            AttrValue::Str(_) => unreachable!("string values use encode_string_buffer"),
        }
    }

    buf.freeze()
}

/// `(u32 count, u32 total_bytes, count*u32 lengths, concatenated bytes)`.
/// A `None` entry has length 0 (JSON `null`); an empty string is encoded as
/// a single NUL byte with length 1.
pub fn encode_string_buffer(values: &[Option<String>]) -> Bytes {
    let mut payload = BytesMut::new();
    let mut lengths = Vec::with_capacity(values.len());

    for value in values {
        match value {
            None => lengths.push(0u32),
            Some(s) if s.is_empty() => {
                payload.put_u8(0);
                lengths.push(1);
            }
            Some(s) => {
                payload.put_slice(s.as_bytes());
                payload.put_u8(0);
                lengths.push((s.len() + 1) as u32);
            }
        }
    }

    let mut buf = BytesMut::new();
    (values.len() as u32).encode(&mut buf);
    (payload.len() as u32).encode(&mut buf);
    for len in lengths {
        len.encode(&mut buf);
    }
    buf.put_slice(&payload);
    buf.freeze()
}
