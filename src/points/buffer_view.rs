//! Typed, bounds-checked views over interleaved geometry buffers.
//!
//! Sensor meshes arrive as raw byte buffers holding N fixed-stride records
//! (positions, normals, classification codes). A `BufferView` validates the
//! layout once at construction and then reads records by index.

use std::sync::Arc;

use nalgebra::Vector3;
use thiserror::Error;

/// Layout of a single record component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexFormat {
    /// Three little-endian f32 values.
    Float3,
    /// One unsigned byte.
    UChar,
}

impl VertexFormat {
    pub fn size(self) -> usize {
        match self {
            Self::Float3 => 12,
            Self::UChar => 1,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferViewError {
    #[error("stride {stride} is smaller than the {format:?} record size")]
    StrideTooSmall { stride: usize, format: VertexFormat },

    #[error("buffer holds {available} bytes but the view needs {required}")]
    OutOfBounds { required: usize, available: usize },
}

/// `count` records of `format`, the first at `offset`, spaced `stride` bytes.
#[derive(Debug, Clone)]
pub struct BufferView {
    data: Arc<[u8]>,
    offset: usize,
    stride: usize,
    count: usize,
    format: VertexFormat,
}

impl BufferView {
    pub fn new(
        data: Arc<[u8]>,
        offset: usize,
        stride: usize,
        count: usize,
        format: VertexFormat,
    ) -> Result<Self, BufferViewError> {
        if stride < format.size() {
            return Err(BufferViewError::StrideTooSmall { stride, format });
        }
        if count > 0 {
            let required = (count - 1)
                .checked_mul(stride)
                .and_then(|v| v.checked_add(offset))
                .and_then(|v| v.checked_add(format.size()))
                .unwrap_or(usize::MAX);
            if required > data.len() {
                return Err(BufferViewError::OutOfBounds {
                    required,
                    available: data.len(),
                });
            }
        }
        Ok(Self {
            data,
            offset,
            stride,
            count,
            format,
        })
    }

    /// Tightly packed view over `[x, y, z]` triples.
    pub fn from_vec3s(values: &[[f32; 3]]) -> Self {
        let mut bytes = Vec::with_capacity(values.len() * 12);
        for v in values {
            for c in v {
                bytes.extend_from_slice(&c.to_le_bytes());
            }
        }
        Self {
            data: bytes.into(),
            offset: 0,
            stride: 12,
            count: values.len(),
            format: VertexFormat::Float3,
        }
    }

    /// Tightly packed view over single bytes.
    pub fn from_bytes(values: &[u8]) -> Self {
        Self {
            data: Arc::from(values),
            offset: 0,
            stride: 1,
            count: values.len(),
            format: VertexFormat::UChar,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn format(&self) -> VertexFormat {
        self.format
    }

    fn record(&self, index: usize) -> Option<&[u8]> {
        if index >= self.count {
            return None;
        }
        let start = self.offset + index * self.stride;
        self.data.get(start..start + self.format.size())
    }

    /// Read record `index` as a vector. `None` when out of range or not `Float3`.
    pub fn read_vec3(&self, index: usize) -> Option<Vector3<f64>> {
        if self.format != VertexFormat::Float3 {
            return None;
        }
        let rec = self.record(index)?;
        let component = |i: usize| -> Option<f64> {
            let bytes: [u8; 4] = rec.get(i * 4..i * 4 + 4)?.try_into().ok()?;
            Some(f32::from_le_bytes(bytes) as f64)
        };
        Some(Vector3::new(component(0)?, component(1)?, component(2)?))
    }

    /// Read record `index` as a byte. `None` when out of range or not `UChar`.
    pub fn read_u8(&self, index: usize) -> Option<u8> {
        if self.format != VertexFormat::UChar {
            return None;
        }
        self.record(index).map(|rec| rec[0])
    }

    pub fn iter_vec3(&self) -> impl Iterator<Item = Vector3<f64>> + '_ {
        (0..self.count).filter_map(move |i| self.read_vec3(i))
    }
}
