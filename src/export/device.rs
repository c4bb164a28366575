//! Compute device used for mesh assembly.

use super::error::ExportError;
use super::packing::VERTEX_STRIDE_BYTES;

/// Packed mesh ready to be written.
#[derive(Debug, Clone)]
pub struct AssembledMesh {
    /// Interleaved vertex bytes, `VERTEX_STRIDE_BYTES` per vertex.
    pub vertices: Vec<u8>,
    /// Triangle list.
    pub indices: Vec<u32>,
    pub vertex_count: usize,
}

impl AssembledMesh {
    pub fn face_count(&self) -> usize {
        self.indices.len() / 3
    }
}

/// Builds a mesh from packed vertex and index buffers.
pub trait ComputeDevice: Send + Sync {
    fn name(&self) -> &str;

    fn assemble(
        &self,
        vertices: Vec<u8>,
        indices: Vec<u32>,
        vertex_count: usize,
    ) -> Result<AssembledMesh, ExportError>;
}

/// Assembles on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostDevice;

impl ComputeDevice for HostDevice {
    fn name(&self) -> &str {
        "host"
    }

    fn assemble(
        &self,
        vertices: Vec<u8>,
        indices: Vec<u32>,
        vertex_count: usize,
    ) -> Result<AssembledMesh, ExportError> {
        if vertices.len() != vertex_count * VERTEX_STRIDE_BYTES {
            return Err(ExportError::InvalidIndices(format!(
                "vertex buffer holds {} bytes, expected {}",
                vertices.len(),
                vertex_count * VERTEX_STRIDE_BYTES
            )));
        }
        Ok(AssembledMesh {
            vertices,
            indices,
            vertex_count,
        })
    }
}
