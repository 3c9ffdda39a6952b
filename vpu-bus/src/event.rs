//! Notifications surfaced to the owner of a session.

use serde::Serialize;

use crate::hw::PicType;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum BufferStatus {
    Done,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum FrameType {
    Key,
    Inter,
    Bidirectional,
}

/// HEVC IDR_W_RADL / IDR_N_LP and H.264 IDR slice NAL unit types.
const IDR_NAL_TYPES: [u32; 3] = [19, 20, 5];

impl FrameType {
    /// Intra pictures are only keyframes when their slices are IDR.
    pub fn classify(pic_type: PicType, vcl_nut: u32) -> Self {
        match pic_type {
            PicType::I if IDR_NAL_TYPES.contains(&vcl_nut) => FrameType::Key,
            PicType::I | PicType::P => FrameType::Inter,
            PicType::B => FrameType::Bidirectional,
        }
    }
}

/// A bitstream buffer handed back to the caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EncodedBuffer {
    pub index: u32,
    pub sequence: u64,
    pub bytes_used: u32,
    pub timestamp: u64,
    pub frame_type: Option<FrameType>,
    /// Terminal buffer of the sequence.
    pub last: bool,
    pub status: BufferStatus,
}

impl EncodedBuffer {
    pub(crate) fn failed(index: u32, sequence: u64) -> Self {
        Self {
            index,
            sequence,
            bytes_used: 0,
            timestamp: 0,
            frame_type: None,
            last: false,
            status: BufferStatus::Error,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum SessionEvent {
    SourceDone {
        index: u32,
        sequence: u64,
        status: BufferStatus,
    },
    BitstreamDone(EncodedBuffer),
    EndOfStream,
    /// All outstanding work was flushed; no further output until re-armed.
    JobFinished,
}

impl SessionEvent {
    pub fn is_error(&self) -> bool {
        match self {
            SessionEvent::SourceDone { status, .. } => *status == BufferStatus::Error,
            SessionEvent::BitstreamDone(buf) => buf.status == BufferStatus::Error,
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub frames_submitted: u64,
    pub frames_completed: u64,
    pub keyframes: u64,
    pub bitstream_bytes: u64,
    pub queue_full_retries: u64,
    pub submit_failures: u64,
    pub unmatched_reports: u64,
    pub irq_dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyframe_needs_idr_nal() {
        assert_eq!(FrameType::classify(PicType::I, 19), FrameType::Key);
        assert_eq!(FrameType::classify(PicType::I, 20), FrameType::Key);
        assert_eq!(FrameType::classify(PicType::I, 5), FrameType::Key);
        // CRA intra picture
        assert_eq!(FrameType::classify(PicType::I, 21), FrameType::Inter);
        assert_eq!(FrameType::classify(PicType::P, 1), FrameType::Inter);
        assert_eq!(FrameType::classify(PicType::B, 0), FrameType::Bidirectional);
    }

    #[test]
    fn error_events() {
        assert!(SessionEvent::BitstreamDone(EncodedBuffer::failed(0, 0)).is_error());
        assert!(!SessionEvent::EndOfStream.is_error());
    }
}
