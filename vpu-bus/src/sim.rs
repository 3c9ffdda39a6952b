//! Deterministic software model of the encoder hardware channel.
//!
//! A [`SimVpu`] is cheap to clone; all clones share one instance model, so
//! a test keeps a clone to drive completions and inspect what the session
//! did after handing the other clone to the session.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::error::{FailCode, HwError};
use crate::format::{PixelFormat, align_up};
use crate::hw::{
    COMMAND_QUEUE_DEPTH, DmaAddr, DmaBuffer, EncodeCommand, HardwareChannel, HwCommand,
    INT_ENC_PIC, INT_INIT_SEQ, InitialInfo, OpenParam, OutputInfo, PicType, QueueStatus,
};

const DMA_BASE: DmaAddr = 0x8000_0000;
const DMA_ALIGN: u32 = 4096;
const KEYFRAME_BYTES: u32 = 8192;
const INTER_BYTES: u32 = 2048;

#[derive(Clone, Debug)]
pub struct SimConfig {
    pub min_src_frame_count: u32,
    pub min_frame_buffer_count: u32,
    /// Firmware command queue depth.
    pub queue_depth: usize,
    /// Every accepted command completes at once and raises an interrupt.
    pub auto_complete: bool,
    /// Insert an IDR picture every N frames; 0 only makes the first one IDR.
    pub gop_size: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            min_src_frame_count: 1,
            min_frame_buffer_count: 2,
            queue_depth: COMMAND_QUEUE_DEPTH,
            auto_complete: false,
            gop_size: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Failures {
    open: Option<HwError>,
    issue_seq_init: Option<HwError>,
    seq_init_timeout: bool,
    complete_seq_init: Option<HwError>,
    allocation_at: Option<usize>,
    register: Option<HwError>,
    submit: VecDeque<FailCode>,
}

#[derive(Debug, Default)]
struct SimState {
    config: SimConfig,
    failures: Failures,
    open_param: Option<OpenParam>,
    seq_init_pending: bool,
    instance_queue: VecDeque<EncodeCommand>,
    report_queue: VecDeque<OutputInfo>,
    pending_irq: u32,
    cleared: Vec<u32>,
    submitted: Vec<EncodeCommand>,
    commands: Vec<HwCommand>,
    registered: Option<(usize, u32, u32)>,
    dma: HashMap<DmaAddr, usize>,
    next_dma: DmaAddr,
    allocations: usize,
    frames_encoded: u64,
    opened: u32,
    closed: u32,
    irq_tx: Option<UnboundedSender<u32>>,
}

impl SimState {
    fn ensure_open(&self) -> Result<(), HwError> {
        match self.open_param {
            Some(_) => Ok(()),
            None => Err(HwError::NotOpen),
        }
    }

    fn raise(&mut self, status: u32) {
        self.pending_irq |= status;
        if let Some(tx) = &self.irq_tx {
            let _ = tx.send(status);
        }
    }

    fn report_for(&mut self, cmd: &EncodeCommand) -> OutputInfo {
        if cmd.source.is_none() && cmd.src_end {
            return OutputInfo {
                bitstream_buffer: cmd.bitstream_addr,
                consumed_source_index: None,
                bitstream_size: 0,
                pic_type: PicType::I,
                vcl_nut: 0,
                end_of_stream: true,
                error_reason: 0,
                warn_info: 0,
                frame_cycle: 0,
            };
        }

        let gop = self.config.gop_size;
        let idr = self.frames_encoded == 0 || (gop > 0 && self.frames_encoded % gop == 0);
        self.frames_encoded += 1;
        let h264 = matches!(
            self.open_param.as_ref().map(|p| p.codec),
            Some(PixelFormat::H264)
        );
        let (pic_type, vcl_nut, bytes) = match (idr, h264) {
            (true, true) => (PicType::I, 5, KEYFRAME_BYTES),
            (true, false) => (PicType::I, 19, KEYFRAME_BYTES),
            (false, _) => (PicType::P, 1, INTER_BYTES),
        };
        OutputInfo {
            bitstream_buffer: cmd.bitstream_addr,
            consumed_source_index: cmd.src_index,
            bitstream_size: bytes.min(cmd.bitstream_size),
            pic_type,
            vcl_nut,
            end_of_stream: false,
            error_reason: 0,
            warn_info: 0,
            frame_cycle: 1000 + bytes / 8,
        }
    }

    fn complete_at(&mut self, pos: usize) -> Option<OutputInfo> {
        let cmd = self.instance_queue.remove(pos)?;
        let report = self.report_for(&cmd);
        self.report_queue.push_back(report.clone());
        self.raise(INT_ENC_PIC);
        Some(report)
    }
}

#[derive(Clone, Debug)]
pub struct SimVpu {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimVpu {
    fn default() -> Self {
        Self::new()
    }
}

impl SimVpu {
    pub fn new() -> Self {
        Self::with_config(SimConfig::default())
    }

    pub fn with_config(config: SimConfig) -> Self {
        let state = SimState {
            config,
            next_dma: DMA_BASE,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Forwards every raised interrupt status to `tx`.
    pub fn set_irq_sender(&self, tx: UnboundedSender<u32>) {
        self.lock().irq_tx = Some(tx);
    }

    pub fn fail_open(&self, err: HwError) {
        self.lock().failures.open = Some(err);
    }

    pub fn fail_issue_seq_init(&self, err: HwError) {
        self.lock().failures.issue_seq_init = Some(err);
    }

    pub fn time_out_seq_init(&self) {
        self.lock().failures.seq_init_timeout = true;
    }

    pub fn fail_complete_seq_init(&self, err: HwError) {
        self.lock().failures.complete_seq_init = Some(err);
    }

    /// The `n`th call to `allocate_dma` (0-based) runs out of memory.
    pub fn fail_allocation_at(&self, n: usize) {
        self.lock().failures.allocation_at = Some(n);
    }

    pub fn fail_register(&self, err: HwError) {
        self.lock().failures.register = Some(err);
    }

    /// Queues failure codes returned by the next `submit_frame` calls.
    pub fn fail_next_submit(&self, code: FailCode) {
        self.lock().failures.submit.push_back(code);
    }

    /// Finishes the oldest accepted command.
    pub fn complete_next(&self) -> Option<OutputInfo> {
        self.lock().complete_at(0)
    }

    /// Finishes the accepted command at `pos` in the firmware queue.
    pub fn complete_at(&self, pos: usize) -> Option<OutputInfo> {
        self.lock().complete_at(pos)
    }

    /// Finishes every accepted command in order.
    pub fn complete_all(&self) -> Vec<OutputInfo> {
        let mut state = self.lock();
        std::iter::from_fn(|| state.complete_at(0)).collect()
    }

    /// Appends an arbitrary report and raises an interrupt.
    pub fn push_report(&self, report: OutputInfo) {
        let mut state = self.lock();
        state.report_queue.push_back(report);
        state.raise(INT_ENC_PIC);
    }

    pub fn is_open(&self) -> bool {
        self.lock().open_param.is_some()
    }

    pub fn open_param(&self) -> Option<OpenParam> {
        self.lock().open_param.clone()
    }

    pub fn open_count(&self) -> u32 {
        self.lock().opened
    }

    pub fn close_count(&self) -> u32 {
        self.lock().closed
    }

    /// Every command the firmware accepted, in submission order.
    pub fn submitted(&self) -> Vec<EncodeCommand> {
        self.lock().submitted.clone()
    }

    pub fn commands(&self) -> Vec<HwCommand> {
        self.lock().commands.clone()
    }

    pub fn registered(&self) -> Option<(usize, u32, u32)> {
        self.lock().registered
    }

    pub fn in_flight(&self) -> usize {
        self.lock().instance_queue.len()
    }

    pub fn pending_reports(&self) -> usize {
        self.lock().report_queue.len()
    }

    /// DMA buffers allocated and not yet freed.
    pub fn live_dma(&self) -> usize {
        self.lock().dma.len()
    }

    pub fn cleared_interrupts(&self) -> Vec<u32> {
        self.lock().cleared.clone()
    }
}

impl HardwareChannel for SimVpu {
    fn open(&mut self, param: &OpenParam) -> Result<(), HwError> {
        let mut state = self.lock();
        if let Some(err) = state.failures.open.take() {
            return Err(err);
        }
        if state.open_param.is_some() {
            return Err(HwError::Firmware(0x1));
        }
        state.open_param = Some(param.clone());
        state.opened += 1;
        state.frames_encoded = 0;
        Ok(())
    }

    fn close(&mut self) -> Result<(), HwError> {
        let mut state = self.lock();
        state.ensure_open()?;
        state.open_param = None;
        state.seq_init_pending = false;
        state.instance_queue.clear();
        state.report_queue.clear();
        state.registered = None;
        state.closed += 1;
        Ok(())
    }

    fn issue_seq_init(&mut self) -> Result<(), HwError> {
        let mut state = self.lock();
        state.ensure_open()?;
        if let Some(err) = state.failures.issue_seq_init.take() {
            return Err(err);
        }
        state.seq_init_pending = true;
        Ok(())
    }

    fn complete_seq_init(&mut self) -> Result<InitialInfo, HwError> {
        let mut state = self.lock();
        state.ensure_open()?;
        if let Some(err) = state.failures.complete_seq_init.take() {
            return Err(err);
        }
        Ok(InitialInfo {
            min_src_frame_count: state.config.min_src_frame_count,
            min_frame_buffer_count: state.config.min_frame_buffer_count,
        })
    }

    fn allocate_dma(&mut self, size: usize) -> Result<DmaBuffer, HwError> {
        let mut state = self.lock();
        let n = state.allocations;
        state.allocations += 1;
        if state.failures.allocation_at == Some(n) {
            state.failures.allocation_at = None;
            return Err(HwError::OutOfMemory(size));
        }
        let addr = state.next_dma;
        state.next_dma += align_up(size as u32, DMA_ALIGN) as DmaAddr;
        state.dma.insert(addr, size);
        Ok(DmaBuffer { addr, size })
    }

    fn free_dma(&mut self, buffer: DmaBuffer) {
        if self.lock().dma.remove(&buffer.addr).is_none() {
            log::warn!("sim: free of unknown dma buffer {:#x}", buffer.addr);
        }
    }

    fn register_frame_buffers(
        &mut self,
        buffers: &[DmaBuffer],
        stride: u32,
        height: u32,
    ) -> Result<(), HwError> {
        let mut state = self.lock();
        state.ensure_open()?;
        if let Some(err) = state.failures.register.take() {
            return Err(err);
        }
        state.registered = Some((buffers.len(), stride, height));
        Ok(())
    }

    fn submit_frame(&mut self, cmd: &EncodeCommand) -> Result<(), FailCode> {
        let mut state = self.lock();
        if state.open_param.is_none() {
            return Err(FailCode::Rejected(0x2));
        }
        if let Some(code) = state.failures.submit.pop_front() {
            return Err(code);
        }
        if state.instance_queue.len() >= state.config.queue_depth {
            return Err(FailCode::QueueFull);
        }
        state.submitted.push(cmd.clone());
        state.instance_queue.push_back(cmd.clone());
        if state.config.auto_complete {
            let last = state.instance_queue.len() - 1;
            state.complete_at(last);
        }
        Ok(())
    }

    fn query_output(&mut self) -> Result<OutputInfo, HwError> {
        let mut state = self.lock();
        state.ensure_open()?;
        state.report_queue.pop_front().ok_or(HwError::NotReady)
    }

    fn send_command(&mut self, cmd: HwCommand) -> Result<(), HwError> {
        let mut state = self.lock();
        state.ensure_open()?;
        state.commands.push(cmd);
        Ok(())
    }

    fn query_queue_status(&mut self) -> QueueStatus {
        let state = self.lock();
        QueueStatus {
            instance_queue_count: state.instance_queue.len() as u32,
            report_queue_count: state.report_queue.len() as u32,
        }
    }

    /// Never sleeps: the model finishes outstanding work immediately, and a
    /// wait with nothing to finish reports a timeout.
    fn wait_for_interrupt(&mut self, _timeout: Duration) -> bool {
        let mut state = self.lock();
        if state.seq_init_pending {
            state.seq_init_pending = false;
            if state.failures.seq_init_timeout {
                state.failures.seq_init_timeout = false;
                return false;
            }
            state.raise(INT_INIT_SEQ);
            return true;
        }
        if !state.report_queue.is_empty() {
            return true;
        }
        state.complete_at(0).is_some()
    }

    fn clear_interrupt(&mut self, status: u32) {
        let mut state = self.lock();
        state.pending_irq &= !status;
        state.cleared.push(status);
    }
}
