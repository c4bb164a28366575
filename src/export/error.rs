use std::path::PathBuf;

use thiserror::Error;

/// Failure modes of a point-cloud export.
///
/// `Cancelled` is an expected outcome, not a fault: the caller asked for it
/// and the exporter is ready for another run.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("no compute device available for mesh assembly")]
    NoComputeDevice,

    #[error("nothing to export: point set is empty")]
    EmptyInput,

    #[error("invalid index buffer: {0}")]
    InvalidIndices(String),

    #[error("failed to write {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("export cancelled")]
    Cancelled,

    #[error("an export is already in progress")]
    Busy,

    #[error("export lane is not running")]
    PipelineClosed,
}

impl ExportError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
