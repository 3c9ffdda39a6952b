//! One encoder instance: formats, parameters, buffer queues and the
//! lifecycle that binds them to the hardware.
//!
//! A `Session` is plain owned state. Callers serialize access to it, either
//! directly (tests) or through [`crate::engine::EncoderEngine`], so the
//! scheduler and the completion processor never overlap.

use crate::buffer::{BufferQueue, DestinationBuffer, QueueKind, SourceBuffer};
use crate::config::EngineConfig;
use crate::device::{DeviceChannel, InstanceId, VpuDevice};
use crate::error::{ConfigError, InitError, SessionError};
use crate::event::{BufferStatus, EncodedBuffer, SessionEvent, SessionStats};
use crate::format::FrameFormat;
use crate::hw::{HardwareChannel, HwCommand, INT_INIT_SEQ, OpenParam};
use crate::irq::IrqFifo;
use crate::params::EncodeParams;
use crate::pool::ReferencePool;
use crate::state::SessionState;

/// Outcome of buffer negotiation for one queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferRequirements {
    pub count: u32,
    pub plane_sizes: Vec<u32>,
}

pub struct Session {
    pub(crate) label: String,
    pub(crate) state: SessionState,
    pub(crate) config: EngineConfig,
    pub(crate) src_format: FrameFormat,
    pub(crate) dst_format: FrameFormat,
    pub(crate) params: EncodeParams,
    /// Source buffers the caller must allocate at least.
    pub(crate) min_src_buffers: u32,
    pub(crate) min_dst_buffers: u32,
    pub(crate) src_buffer_budget: u32,
    pub(crate) timestamp: u64,
    pub(crate) src_queue: BufferQueue<SourceBuffer>,
    pub(crate) dst_queue: BufferQueue<DestinationBuffer>,
    pub(crate) src_streaming: bool,
    pub(crate) dst_streaming: bool,
    pub(crate) pool: ReferencePool,
    pub(crate) irq: IrqFifo,
    pub(crate) stats: SessionStats,
    pub(crate) events: Vec<SessionEvent>,
    pub(crate) device: VpuDevice,
    pub(crate) hw: DeviceChannel,
    pub(crate) instance: Option<InstanceId>,
    pub(crate) hw_open: bool,
    pub(crate) closed: bool,
}

impl Session {
    pub fn new<H>(device: &VpuDevice, hw: H, config: EngineConfig) -> Result<Self, SessionError>
    where
        H: HardwareChannel + 'static,
    {
        config.validate()?;
        let dst_format = FrameFormat::default_destination();
        Ok(Self {
            label: format!("{}/-", device.name()),
            state: SessionState::None,
            irq: IrqFifo::new(config.irq_fifo_capacity),
            config,
            src_format: FrameFormat::default_source(),
            params: EncodeParams::for_codec(dst_format.pixel_format),
            dst_format,
            min_src_buffers: 0,
            min_dst_buffers: 0,
            src_buffer_budget: 0,
            timestamp: 0,
            src_queue: BufferQueue::new(),
            dst_queue: BufferQueue::new(),
            src_streaming: false,
            dst_streaming: false,
            pool: ReferencePool::default(),
            stats: SessionStats::default(),
            events: Vec::new(),
            device: device.clone(),
            hw: device.attach(hw),
            instance: None,
            hw_open: false,
            closed: false,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn src_format(&self) -> &FrameFormat {
        &self.src_format
    }

    pub fn dst_format(&self) -> &FrameFormat {
        &self.dst_format
    }

    pub fn params(&self) -> &EncodeParams {
        &self.params
    }

    pub fn instance_id(&self) -> Option<u32> {
        self.instance.as_ref().map(|id| id.get())
    }

    pub fn src_buffer_budget(&self) -> u32 {
        self.src_buffer_budget
    }

    pub fn min_dst_buffers(&self) -> u32 {
        self.min_dst_buffers
    }

    pub fn is_streaming(&self, queue: QueueKind) -> bool {
        match queue {
            QueueKind::Source => self.src_streaming,
            QueueKind::Destination => self.dst_streaming,
        }
    }

    pub(crate) fn both_streaming(&self) -> bool {
        self.src_streaming && self.dst_streaming
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Buffers currently held in `queue`, submitted or not.
    pub fn queued(&self, queue: QueueKind) -> usize {
        match queue {
            QueueKind::Source => self.src_queue.len(),
            QueueKind::Destination => self.dst_queue.len(),
        }
    }

    /// Encode commands submitted and not completed.
    pub fn outstanding(&self) -> usize {
        self.dst_queue.consumed_count()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            irq_dropped: self.irq.dropped(),
            ..self.stats
        }
    }

    /// Takes the events produced since the last call.
    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    pub(crate) fn set_state(&mut self, to: SessionState) -> Result<(), SessionError> {
        let from = self.state;
        self.state = from.transition(to)?;
        if from != to {
            log::info!("[{}] state {} -> {}", self.label, from, to);
        }
        Ok(())
    }

    /// Sets formats and encode parameters. The destination takes the
    /// source geometry; both sizes are clamped into the encoder limits.
    pub fn configure(
        &mut self,
        src: FrameFormat,
        dst: FrameFormat,
        params: EncodeParams,
    ) -> Result<(), SessionError> {
        self.ensure_open()?;
        if self.state != SessionState::None {
            return Err(ConfigError::AlreadyOpen(self.state).into());
        }
        src.validate_raw()?;
        dst.validate_codec()?;
        params.validate(dst.pixel_format)?;

        self.src_format = FrameFormat::negotiate(src.pixel_format, src.width, src.height);
        self.dst_format = FrameFormat::negotiate(
            dst.pixel_format,
            self.src_format.width,
            self.src_format.height,
        );
        self.params = params;
        log::debug!(
            "[{}] configured {} {}x{} -> {}",
            self.label,
            self.src_format.pixel_format,
            self.src_format.width,
            self.src_format.height,
            self.dst_format.pixel_format
        );
        Ok(())
    }

    /// Negotiates buffer count and plane sizes for `queue`. The first
    /// source-queue negotiation brings the hardware up.
    pub fn request_buffers(
        &mut self,
        queue: QueueKind,
        count: u32,
        plane_sizes: &[u32],
    ) -> Result<BufferRequirements, SessionError> {
        self.ensure_open()?;
        let format = match queue {
            QueueKind::Source => &self.src_format,
            QueueKind::Destination => &self.dst_format,
        };
        let sizes = if plane_sizes.is_empty() {
            format.size_images()
        } else {
            if plane_sizes.len() != format.num_planes() {
                return Err(ConfigError::PlaneCount {
                    expected: format.num_planes(),
                    actual: plane_sizes.len(),
                }
                .into());
            }
            for (plane, (&size, required)) in plane_sizes.iter().zip(&format.planes).enumerate() {
                if size < required.size_image {
                    return Err(ConfigError::PlaneTooSmall {
                        plane,
                        size,
                        required: required.size_image,
                    }
                    .into());
                }
            }
            plane_sizes.to_vec()
        };

        let mut count = count;
        if queue == QueueKind::Source {
            if self.state == SessionState::None {
                self.setup(count.max(self.config.requested_source_buffers))?;
            }
            if self.state.is_initialized() {
                count = self.src_buffer_budget;
            }
        }
        log::debug!("[{}] {} queue: {} buffers {:?}", self.label, queue, count, sizes);
        Ok(BufferRequirements {
            count,
            plane_sizes: sizes,
        })
    }

    /// Binding minimum for the source queue, known after sequence init.
    pub fn min_source_buffers(&self) -> Result<u32, SessionError> {
        if !self.state.is_initialized() {
            return Err(SessionError::InvalidState {
                expected: "INIT_SEQ or later",
                actual: self.state,
            });
        }
        Ok(self.min_src_buffers)
    }

    /// Opens the hardware instance, runs sequence init and registers the
    /// reference pool. On failure nothing stays allocated and the session
    /// is back in NONE.
    fn setup(&mut self, requested: u32) -> Result<(), SessionError> {
        self.dst_format.validate_codec()?;
        let instance = self.device.acquire_instance()?;
        self.label = format!("{}/{}", self.device.name(), instance.get());

        let open = OpenParam::new(&self.src_format, &self.dst_format, &self.params);
        if let Err(e) = self.hw.open(&open) {
            log::error!("[{}] open failed: {}", self.label, e);
            self.label = format!("{}/-", self.device.name());
            return Err(InitError::Open(e).into());
        }
        self.instance = Some(instance);
        self.hw_open = true;
        self.set_state(SessionState::Open)?;

        if let Err(e) = self.init_sequence(requested) {
            log::error!("[{}] setup failed: {}", self.label, e);
            self.rollback();
            return Err(e);
        }
        log::info!(
            "[{}] ready: {} {}x{}, {} reference buffers, {} source buffers",
            self.label,
            self.dst_format.pixel_format,
            self.dst_format.width,
            self.dst_format.height,
            self.pool.len(),
            self.src_buffer_budget
        );
        Ok(())
    }

    fn init_sequence(&mut self, requested: u32) -> Result<(), SessionError> {
        let mirror = self.params.mirror_direction();
        if mirror != 0 {
            self.send_command(HwCommand::EnableMirroring);
            self.send_command(HwCommand::SetMirrorDirection(mirror));
        }
        if self.params.rotation != 0 {
            self.send_command(HwCommand::EnableRotation);
            self.send_command(HwCommand::SetRotationAngle(self.params.rotation));
        }

        self.hw.issue_seq_init().map_err(InitError::IssueSeqInit)?;
        let timeout = self.config.setup_timeout();
        if !self.hw.wait_for_interrupt(timeout) {
            return Err(InitError::Timeout(timeout).into());
        }
        self.hw.clear_interrupt(INT_INIT_SEQ);
        let info = self
            .hw
            .complete_seq_init()
            .map_err(InitError::CompleteSeqInit)?;
        self.set_state(SessionState::InitSeq)?;

        let cap = self.config.queue_depth_cap as u32;
        self.min_src_buffers = info.min_src_frame_count + cap;
        self.min_dst_buffers = info.min_frame_buffer_count;
        self.src_buffer_budget = requested.max(self.min_src_buffers);
        log::debug!(
            "[{}] min frame buffers {}, min source buffers {}",
            self.label,
            info.min_frame_buffer_count,
            info.min_src_frame_count
        );

        self.pool = ReferencePool::allocate(
            &mut self.hw,
            self.min_dst_buffers,
            self.dst_format.width,
            self.dst_format.height,
        )?;
        self.pool.register(&mut self.hw)?;
        self.set_state(SessionState::PicRun)
    }

    fn send_command(&mut self, cmd: HwCommand) {
        if let Err(e) = self.hw.send_command(cmd) {
            log::warn!("[{}] {:?} failed: {}", self.label, cmd, e);
        }
    }

    fn rollback(&mut self) {
        self.pool.release(&mut self.hw);
        self.close_hw();
        self.min_src_buffers = 0;
        self.min_dst_buffers = 0;
        self.src_buffer_budget = 0;
        self.state = match self.state.transition(SessionState::None) {
            Ok(state) => state,
            Err(e) => {
                log::error!("[{}] forcing reset: {}", self.label, e);
                SessionState::None
            }
        };
        self.label = format!("{}/-", self.device.name());
    }

    fn close_hw(&mut self) {
        if self.hw_open {
            if let Err(e) = self.hw.close() {
                log::warn!("[{}] close failed: {}", self.label, e);
            }
            self.hw_open = false;
        }
        self.instance = None;
    }

    /// Queues a raw frame. Returns its sequence number.
    pub fn enqueue_source(&mut self, buffer: SourceBuffer) -> Result<u64, SessionError> {
        self.ensure_open()?;
        let index = buffer.index;
        if buffer.planes.len() != self.src_format.num_planes() {
            return Err(SessionError::InvalidBuffer {
                queue: QueueKind::Source,
                index,
                reason: "plane count does not match the source format",
            });
        }
        if self.src_queue.contains_index(index) {
            return Err(SessionError::InvalidBuffer {
                queue: QueueKind::Source,
                index,
                reason: "already queued",
            });
        }
        let (_, sequence) = self.src_queue.push(buffer);
        log::debug!("[{}] queued source {} seq {}", self.label, index, sequence);
        if self.src_streaming {
            self.schedule();
        }
        Ok(sequence)
    }

    /// Queues a bitstream buffer. Returns its sequence number.
    pub fn enqueue_destination(&mut self, buffer: DestinationBuffer) -> Result<u64, SessionError> {
        self.ensure_open()?;
        let index = buffer.index;
        if buffer.size == 0 {
            return Err(SessionError::InvalidBuffer {
                queue: QueueKind::Destination,
                index,
                reason: "empty buffer",
            });
        }
        if self.dst_queue.contains_index(index) {
            return Err(SessionError::InvalidBuffer {
                queue: QueueKind::Destination,
                index,
                reason: "already queued",
            });
        }
        let (_, sequence) = self.dst_queue.push(buffer);
        log::debug!(
            "[{}] queued destination {} at {:#x} seq {}",
            self.label,
            index,
            buffer.addr,
            sequence
        );
        if self.dst_streaming {
            self.schedule();
        }
        Ok(sequence)
    }

    pub fn start_streaming(&mut self, queue: QueueKind) -> Result<(), SessionError> {
        self.ensure_open()?;
        if queue == QueueKind::Source && self.state == SessionState::None {
            self.setup(self.config.requested_source_buffers)?;
        }
        match queue {
            QueueKind::Source => self.src_streaming = true,
            QueueKind::Destination => self.dst_streaming = true,
        }
        log::debug!("[{}] {} streaming on", self.label, queue);
        self.schedule();
        Ok(())
    }

    /// Brings the hardware up if needed, arms both queues and schedules.
    pub fn start(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        if self.state == SessionState::None {
            self.setup(self.config.requested_source_buffers)?;
        }
        self.src_streaming = true;
        self.dst_streaming = true;
        self.schedule();
        Ok(())
    }

    /// Requests end of stream: no new frames are submitted, a flush command
    /// goes out once the source queue runs dry. Ignored unless both queues
    /// are streaming.
    pub fn stop(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        if !self.both_streaming() {
            log::debug!("[{}] stop ignored, queues not streaming", self.label);
            return Ok(());
        }
        self.set_state(SessionState::Stop)?;
        self.schedule();
        Ok(())
    }

    /// Tears one queue down: drains the hardware, then fails every buffer
    /// still held in that queue.
    pub fn stop_streaming(&mut self, queue: QueueKind) -> Result<(), SessionError> {
        self.ensure_open()?;
        if self.both_streaming() && self.state.can_encode() {
            self.set_state(SessionState::Stop)?;
        }
        self.drain();

        match queue {
            QueueKind::Source => {
                while let Some(slot) = self.src_queue.pop_front() {
                    log::debug!("[{}] failing source {}", self.label, slot.buffer.index);
                    self.events.push(SessionEvent::SourceDone {
                        index: slot.buffer.index,
                        sequence: slot.sequence,
                        status: BufferStatus::Error,
                    });
                }
                self.src_streaming = false;
            }
            QueueKind::Destination => {
                while let Some(slot) = self.dst_queue.pop_front() {
                    log::debug!("[{}] failing destination {}", self.label, slot.buffer.index);
                    self.events.push(SessionEvent::BitstreamDone(EncodedBuffer::failed(
                        slot.buffer.index,
                        slot.sequence,
                    )));
                }
                self.dst_streaming = false;
            }
        }
        log::debug!("[{}] {} streaming off", self.label, queue);
        Ok(())
    }

    /// Polls the hardware until both of its queues are empty, feeding every
    /// report through the completion processor without rescheduling.
    fn drain(&mut self) {
        if !self.hw_open {
            return;
        }
        let timeout = self.config.drain_timeout();
        loop {
            let status = self.hw.query_queue_status();
            if status.is_idle() {
                break;
            }
            if !self.hw.wait_for_interrupt(timeout) {
                log::warn!(
                    "[{}] drain timed out with {} queued, {} reports",
                    self.label,
                    status.instance_queue_count,
                    status.report_queue_count
                );
                break;
            }
            self.process_completion(false);
        }
    }

    /// Records an interrupt status and runs the completion processor.
    pub fn notify_interrupt(&mut self, status: u32) -> Result<(), SessionError> {
        self.ensure_open()?;
        if !self.hw_open {
            log::debug!("[{}] interrupt {:#x} before setup, ignored", self.label, status);
            return Ok(());
        }
        if !self.irq.push(status) {
            // Dropped from the FIFO: clear it now so the line does not stay raised.
            self.hw.clear_interrupt(status);
        }
        self.process_completion(true);
        Ok(())
    }

    /// Tears both queues down and releases every hardware resource.
    pub fn close(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        self.stop_streaming(QueueKind::Source)?;
        self.stop_streaming(QueueKind::Destination)?;
        self.pool.release(&mut self.hw);
        self.close_hw();
        self.irq.clear();
        self.closed = true;
        log::info!("[{}] closed", self.label);
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                log::error!("[{}] close on drop failed: {}", self.label, e);
            }
        }
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
