//! Primitive operations of the encoder's hardware command channel.
//!
//! The session engine only talks to the accelerator through
//! [`HardwareChannel`]. Register layout and firmware command encoding live
//! behind it; [`crate::sim::SimVpu`] is the software model used by tests
//! and the demo runner.

use std::time::Duration;

use crate::error::{FailCode, HwError};
pub use crate::params::OpenParam;

/// Number of encode commands the firmware accepts before one must complete.
pub const COMMAND_QUEUE_DEPTH: usize = 2;

/// Interrupt status bits.
pub const INT_INIT_SEQ: u32 = 1 << 2;
pub const INT_ENC_PIC: u32 = 1 << 8;

pub type DmaAddr = u64;

/// A DMA-capable buffer owned by the encoder, never by the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaBuffer {
    pub addr: DmaAddr,
    pub size: usize,
}

/// Buffer requirements reported by sequence init.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InitialInfo {
    pub min_src_frame_count: u32,
    pub min_frame_buffer_count: u32,
}

/// Plane addresses of one raw frame handed to the encoder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SourceFrame {
    pub buf_y: DmaAddr,
    pub buf_cb: DmaAddr,
    pub buf_cr: DmaAddr,
    pub stride: u32,
}

/// One encode command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncodeCommand {
    pub bitstream_addr: DmaAddr,
    pub bitstream_size: u32,
    /// `None` on the final flush command.
    pub source: Option<SourceFrame>,
    pub src_index: Option<u32>,
    /// No more source frames follow; flush everything buffered.
    pub src_end: bool,
    pub implicit_header: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PicType {
    I,
    P,
    B,
}

/// Hardware report for one completed command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputInfo {
    pub bitstream_buffer: DmaAddr,
    pub consumed_source_index: Option<u32>,
    pub bitstream_size: u32,
    pub pic_type: PicType,
    /// NAL unit type of the coded slices.
    pub vcl_nut: u32,
    pub end_of_stream: bool,
    pub error_reason: u32,
    pub warn_info: u32,
    pub frame_cycle: u32,
}

/// Commands accepted by the firmware but not finished, and finished
/// commands whose report has not been read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStatus {
    pub instance_queue_count: u32,
    pub report_queue_count: u32,
}

impl QueueStatus {
    pub fn is_idle(&self) -> bool {
        self.instance_queue_count + self.report_queue_count == 0
    }
}

/// Out-of-band instance commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HwCommand {
    EnableMirroring,
    /// Bit 1 horizontal, bit 0 vertical.
    SetMirrorDirection(u32),
    EnableRotation,
    SetRotationAngle(u32),
}

pub trait HardwareChannel: Send {
    fn open(&mut self, param: &OpenParam) -> Result<(), HwError>;

    fn close(&mut self) -> Result<(), HwError>;

    fn issue_seq_init(&mut self) -> Result<(), HwError>;

    fn complete_seq_init(&mut self) -> Result<InitialInfo, HwError>;

    fn allocate_dma(&mut self, size: usize) -> Result<DmaBuffer, HwError>;

    fn free_dma(&mut self, buffer: DmaBuffer);

    fn register_frame_buffers(
        &mut self,
        buffers: &[DmaBuffer],
        stride: u32,
        height: u32,
    ) -> Result<(), HwError>;

    fn submit_frame(&mut self, cmd: &EncodeCommand) -> Result<(), FailCode>;

    /// Pops one report. [`HwError::NotReady`] means nothing has completed.
    fn query_output(&mut self) -> Result<OutputInfo, HwError>;

    fn send_command(&mut self, cmd: HwCommand) -> Result<(), HwError>;

    fn query_queue_status(&mut self) -> QueueStatus;

    /// Blocks until the instance raises an interrupt or `timeout` elapses.
    fn wait_for_interrupt(&mut self, timeout: Duration) -> bool;

    fn clear_interrupt(&mut self, status: u32);
}

impl<T: HardwareChannel + ?Sized> HardwareChannel for Box<T> {
    fn open(&mut self, param: &OpenParam) -> Result<(), HwError> {
        (**self).open(param)
    }

    fn close(&mut self) -> Result<(), HwError> {
        (**self).close()
    }

    fn issue_seq_init(&mut self) -> Result<(), HwError> {
        (**self).issue_seq_init()
    }

    fn complete_seq_init(&mut self) -> Result<InitialInfo, HwError> {
        (**self).complete_seq_init()
    }

    fn allocate_dma(&mut self, size: usize) -> Result<DmaBuffer, HwError> {
        (**self).allocate_dma(size)
    }

    fn free_dma(&mut self, buffer: DmaBuffer) {
        (**self).free_dma(buffer)
    }

    fn register_frame_buffers(
        &mut self,
        buffers: &[DmaBuffer],
        stride: u32,
        height: u32,
    ) -> Result<(), HwError> {
        (**self).register_frame_buffers(buffers, stride, height)
    }

    fn submit_frame(&mut self, cmd: &EncodeCommand) -> Result<(), FailCode> {
        (**self).submit_frame(cmd)
    }

    fn query_output(&mut self) -> Result<OutputInfo, HwError> {
        (**self).query_output()
    }

    fn send_command(&mut self, cmd: HwCommand) -> Result<(), HwError> {
        (**self).send_command(cmd)
    }

    fn query_queue_status(&mut self) -> QueueStatus {
        (**self).query_queue_status()
    }

    fn wait_for_interrupt(&mut self, timeout: Duration) -> bool {
        (**self).wait_for_interrupt(timeout)
    }

    fn clear_interrupt(&mut self, status: u32) {
        (**self).clear_interrupt(status)
    }
}
