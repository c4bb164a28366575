//! Point samples and their extraction from capture frames.

pub mod buffer_view;
pub mod extraction;
pub mod frame;
pub mod sample;

pub use buffer_view::{BufferView, BufferViewError, VertexFormat};
pub use extraction::{ExtractionConfig, SampleExtractor};
pub use frame::{CaptureFrame, ColorSampler, MeshPayload, UniformColor};
pub use sample::{Classification, Sample, SampleBatch, SourceId, luminance};
