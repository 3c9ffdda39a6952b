//! Error types of the encode session engine.
//!
//! Only configuration and one-time setup failures surface as errors.
//! A full firmware queue and an empty report queue are normal flow, and a
//! rejected frame pair is reported through buffer events instead.

use std::time::Duration;

use thiserror::Error;

use crate::buffer::QueueKind;
use crate::format::PixelFormat;
use crate::state::SessionState;

/// Errors returned by a [`crate::hw::HardwareChannel`] primitive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HwError {
    #[error("no result ready")]
    NotReady,

    #[error("hardware timed out")]
    Timeout,

    #[error("firmware rejected command (reason {0:#x})")]
    Firmware(u32),

    #[error("out of DMA memory ({0} bytes requested)")]
    OutOfMemory(usize),

    #[error("instance is not open")]
    NotOpen,
}

/// Why `submit_frame` refused a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FailCode {
    /// The firmware command queue is full; retry once a command completes.
    #[error("command queue full")]
    QueueFull,

    #[error("encode command failed (reason {0:#x})")]
    Rejected(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unsupported source pixel format: {0}")]
    UnsupportedSourceFormat(PixelFormat),

    #[error("unsupported codec format: {0}")]
    UnsupportedCodec(PixelFormat),

    #[error("cannot configure while {0}")]
    AlreadyOpen(SessionState),

    #[error("parameter '{param}' value {value} out of range {min}..={max}")]
    OutOfRange {
        param: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("min qp {min} is greater than max qp {max}")]
    QpOrder { min: u32, max: u32 },

    #[error("rotation must be a multiple of 90 below 360, got {0}")]
    Rotation(u32),

    #[error("{what} does not apply to codec {codec}")]
    CodecMismatch {
        what: &'static str,
        codec: PixelFormat,
    },

    #[error("expected {expected} planes, got {actual}")]
    PlaneCount { expected: usize, actual: usize },

    #[error("plane {plane} size {size} is smaller than {required}")]
    PlaneTooSmall { plane: usize, size: u32, required: u32 },

    #[error("queue depth cap must be at least 1")]
    QueueDepth,
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no free encoder instance on device (max {0})")]
    NoFreeInstance(usize),

    #[error("failed to open encoder instance: {0}")]
    Open(HwError),

    #[error("failed to issue sequence init: {0}")]
    IssueSeqInit(HwError),

    #[error("sequence init timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to complete sequence init: {0}")]
    CompleteSeqInit(HwError),

    #[error("failed to allocate reference buffer {index} ({size} bytes): {source}")]
    Allocation {
        index: usize,
        size: usize,
        source: HwError,
    },

    #[error("failed to register reference buffers: {0}")]
    Register(HwError),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Init(#[from] InitError),

    #[error("invalid state transition {from} -> {to}")]
    Transition { from: SessionState, to: SessionState },

    #[error("operation requires state {expected}, session is {actual}")]
    InvalidState {
        expected: &'static str,
        actual: SessionState,
    },

    #[error("{queue} buffer {index} rejected: {reason}")]
    InvalidBuffer {
        queue: QueueKind,
        index: u32,
        reason: &'static str,
    },

    #[error("session is closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = ConfigError::OutOfRange {
            param: "vbv_size",
            value: 5,
            min: 10,
            max: 3000,
        };
        let msg = err.to_string();
        assert!(msg.contains("vbv_size"));
        assert!(msg.contains("3000"));
    }

    #[test]
    fn init_error_wraps_hw_error() {
        let err = InitError::Allocation {
            index: 2,
            size: 4096,
            source: HwError::OutOfMemory(4096),
        };
        assert!(err.to_string().contains("reference buffer 2"));
    }

    #[test]
    fn session_error_from_config() {
        let err = SessionError::from(ConfigError::UnsupportedCodec(PixelFormat::Nv12));
        assert!(matches!(err, SessionError::Config(_)));
        assert!(err.to_string().contains("NV12"));
    }

    #[test]
    fn fail_code_display() {
        assert_eq!(FailCode::QueueFull.to_string(), "command queue full");
        assert!(FailCode::Rejected(0x10).to_string().contains("0x10"));
    }
}
