//! Reconciles hardware reports with the buffers they were produced for.

use crate::error::HwError;
use crate::event::{BufferStatus, EncodedBuffer, FrameType, SessionEvent};
use crate::hw::{HardwareChannel, OutputInfo};
use crate::session::Session;
use crate::state::SessionState;

impl Session {
    /// Handles one interrupt: clears it, reads one report and returns the
    /// buffers it names. Reschedules afterwards unless draining.
    pub(crate) fn process_completion(&mut self, reschedule: bool) {
        if let Some(status) = self.irq.pop() {
            self.hw.clear_interrupt(status);
        }

        let info = match self.hw.query_output() {
            Ok(info) => info,
            Err(HwError::NotReady) => {
                log::trace!("[{}] no report ready", self.label);
                return;
            }
            Err(e) => {
                log::debug!("[{}] query output: {}", self.label, e);
                return;
            }
        };
        if info.error_reason != 0 || info.warn_info != 0 {
            log::debug!(
                "[{}] report reason {:#x} warn {:#x}",
                self.label,
                info.error_reason,
                info.warn_info
            );
        }

        // Hardware may finish bitstreams out of submission order, so the
        // destination is found by address, never by position.
        let dst_key = self
            .dst_queue
            .find(|d| d.addr == info.bitstream_buffer);
        if dst_key.is_none() {
            self.stats.unmatched_reports += 1;
            log::error!(
                "[{}] report for unknown bitstream buffer {:#x}, discarded",
                self.label,
                info.bitstream_buffer
            );
        }

        if let Some(index) = info.consumed_source_index {
            match self.src_queue.find_index(index).and_then(|key| self.src_queue.remove(key)) {
                Some(slot) => {
                    self.timestamp = slot.buffer.timestamp;
                    self.events.push(SessionEvent::SourceDone {
                        index,
                        sequence: slot.sequence,
                        status: BufferStatus::Done,
                    });
                }
                None => log::warn!("[{}] consumed source {} not queued", self.label, index),
            }
        }

        let dst = dst_key.and_then(|key| self.dst_queue.remove(key));
        if info.end_of_stream {
            if let Some(slot) = dst {
                self.events.push(SessionEvent::BitstreamDone(EncodedBuffer {
                    index: slot.buffer.index,
                    sequence: slot.sequence,
                    bytes_used: 0,
                    timestamp: self.timestamp,
                    frame_type: None,
                    last: true,
                    status: BufferStatus::Done,
                }));
            }
            self.finish_stream();
        } else if let Some(slot) = dst {
            let buffer = self.finalize(&info, slot.buffer.index, slot.sequence);
            self.events.push(SessionEvent::BitstreamDone(buffer));
            log::debug!(
                "[{}] encoded {} bytes into {}, frame_cycle {}",
                self.label,
                info.bitstream_size,
                slot.buffer.index,
                info.frame_cycle
            );
        }

        if reschedule {
            self.schedule();
        }
    }

    fn finalize(&mut self, info: &OutputInfo, index: u32, sequence: u64) -> EncodedBuffer {
        let frame_type = FrameType::classify(info.pic_type, info.vcl_nut);
        self.stats.frames_completed += 1;
        self.stats.bitstream_bytes += info.bitstream_size as u64;
        if frame_type == FrameType::Key {
            self.stats.keyframes += 1;
        }
        EncodedBuffer {
            index,
            sequence,
            bytes_used: info.bitstream_size,
            timestamp: self.timestamp,
            frame_type: Some(frame_type),
            last: false,
            status: BufferStatus::Done,
        }
    }

    /// End of stream: encoding may resume with a new sequence.
    fn finish_stream(&mut self) {
        if let Err(e) = self.set_state(SessionState::PicRun) {
            log::error!("[{}] {}", self.label, e);
        }
        log::info!("[{}] end of stream", self.label);
        self.events.push(SessionEvent::EndOfStream);
        self.events.push(SessionEvent::JobFinished);
    }
}
