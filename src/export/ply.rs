//! Binary little-endian PLY output through `ply-rs`.
//!
//! The header is written once; vertex and face payloads are then appended
//! chunk by chunk so the exporter can report progress and honour
//! cancellation between chunks.

use std::io::{self, Write};

use ply_rs::ply::{
    Addable, DefaultElement, ElementDef, Encoding, Header, Property, PropertyDef, PropertyType,
    ScalarType,
};
use ply_rs::writer::Writer;

use super::packing::FLOATS_PER_VERTEX;

/// Vertex properties in packed-buffer order.
const VERTEX_PROPERTIES: [&str; FLOATS_PER_VERTEX] = [
    "x", "y", "z", "nx", "ny", "nz", "red", "green", "blue", "alpha",
];

const FACE_PROPERTY: &str = "vertex_indices";

/// Bytes of one triangle record: list length byte plus three `u32`.
pub const FACE_RECORD_BYTES: usize = 13;

pub struct PlyLayout {
    header: Header,
    vertex_def: ElementDef,
    face_def: ElementDef,
    writer: Writer<DefaultElement>,
}

impl PlyLayout {
    /// Layout for `vertex_count` interleaved vertices and `face_count` triangles.
    pub fn new(vertex_count: usize, face_count: usize) -> Self {
        let mut vertex_def = ElementDef::new("vertex".to_string());
        vertex_def.count = vertex_count;
        for name in VERTEX_PROPERTIES {
            vertex_def.properties.add(PropertyDef::new(
                name.to_string(),
                PropertyType::Scalar(ScalarType::Float),
            ));
        }

        let mut face_def = ElementDef::new("face".to_string());
        face_def.count = face_count;
        face_def.properties.add(PropertyDef::new(
            FACE_PROPERTY.to_string(),
            PropertyType::List(ScalarType::UChar, ScalarType::UInt),
        ));

        let mut header = Header::new();
        header.encoding = Encoding::BinaryLittleEndian;
        header.comments.push("depthscan point cloud".to_string());
        header.elements.add(vertex_def.clone());
        header.elements.add(face_def.clone());

        Self {
            header,
            vertex_def,
            face_def,
            writer: Writer::new(),
        }
    }

    pub fn write_header<W: Write>(&self, w: &mut W) -> io::Result<usize> {
        self.writer.write_header(w, &self.header)
    }

    /// Append vertices from a packed little-endian `f32` buffer.
    pub fn write_vertices<W: Write>(&self, w: &mut W, packed: &[u8]) -> io::Result<usize> {
        let elements: Vec<DefaultElement> = packed
            .chunks_exact(FLOATS_PER_VERTEX * 4)
            .map(|record| {
                let mut vertex = DefaultElement::new();
                for (name, bytes) in VERTEX_PROPERTIES.iter().zip(record.chunks_exact(4)) {
                    let value = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                    vertex.insert(name.to_string(), Property::Float(value));
                }
                vertex
            })
            .collect();
        self.writer
            .write_payload_of_element(w, &elements, &self.vertex_def, &self.header)
    }

    /// Append triangles from a flat index list.
    pub fn write_faces<W: Write>(&self, w: &mut W, triangles: &[u32]) -> io::Result<usize> {
        let elements: Vec<DefaultElement> = triangles
            .chunks_exact(3)
            .map(|tri| {
                let mut face = DefaultElement::new();
                face.insert(FACE_PROPERTY.to_string(), Property::ListUInt(tri.to_vec()));
                face
            })
            .collect();
        self.writer
            .write_payload_of_element(w, &elements, &self.face_def, &self.header)
    }
}
