//! Interleaved vertex layout shared by the exporter and the PLY writer.
//!
//! One vertex is ten little-endian `f32`: position xyz, normal xyz, color
//! rgba.

use crate::points::Sample;

pub const FLOATS_PER_VERTEX: usize = 10;
pub const VERTEX_STRIDE_BYTES: usize = FLOATS_PER_VERTEX * 4;

pub fn pack_vertex(sample: &Sample, out: &mut Vec<u8>) {
    let p = &sample.position;
    let n = &sample.normal;
    let c = &sample.color;
    for v in [p.x, p.y, p.z, n.x, n.y, n.z, c.x, c.y, c.z, c.w] {
        out.extend_from_slice(&(v as f32).to_le_bytes());
    }
}

pub fn pack_vertices(samples: &[Sample], out: &mut Vec<u8>) {
    out.reserve(samples.len() * VERTEX_STRIDE_BYTES);
    for s in samples {
        pack_vertex(s, out);
    }
}

/// Consecutive-triplet triangulation: vertices `3k, 3k+1, 3k+2` form face
/// `k`. Trailing vertices that do not fill a triangle get no face.
///
/// This is a stand-in for surface reconstruction, not a real mesh.
pub fn triplet_indices(vertex_count: usize) -> Vec<u32> {
    let faces = vertex_count / 3;
    let mut indices = Vec::with_capacity(faces * 3);
    for k in 0..faces {
        let base = (k * 3) as u32;
        indices.extend_from_slice(&[base, base + 1, base + 2]);
    }
    indices
}
