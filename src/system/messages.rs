//! Inter-thread message types.

use std::path::PathBuf;
use std::time::Instant;

use crossbeam_channel::Sender;

use crate::export::{ExportError, ExportOutcome};
use crate::points::CaptureFrame;

/// Frame handed from the frame-delivery lane to the extraction lane.
pub(crate) struct ExtractionJob {
    pub frame: CaptureFrame,
    pub frame_index: u64,
    /// When the frame was queued, for latency accounting.
    pub queued_at: Instant,
}

/// Request for the export lane. The result goes back on `reply`.
pub(crate) struct ExportJob {
    pub path: PathBuf,
    pub reply: Sender<Result<ExportOutcome, ExportError>>,
}

/// What `process_frame` did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDisposition {
    /// Pose updated; mesh work skipped by the throttle.
    Tracked,
    /// Pose updated and mesh payloads queued for extraction.
    Queued,
    /// Pose updated; extraction queue was full so the mesh work was dropped.
    Dropped,
    /// Pipeline not running; frame ignored.
    Stopped,
}
