//! Turns queued buffer pairs into encode commands, keeping at most
//! `queue_depth_cap` commands in flight. While stopping, a command only
//! goes out once nothing else is outstanding.

use crate::buffer::{Plane, SlotKey};
use crate::error::FailCode;
use crate::event::{BufferStatus, EncodedBuffer, SessionEvent};
use crate::format::align_up;
use crate::hw::{EncodeCommand, HardwareChannel, SourceFrame};
use crate::session::Session;
use crate::state::SessionState;

/// Plane addresses of a source frame of the encoded size `width` x `height`.
///
/// A single plane holds Y, Cb and Cr back to back; with two planes Cb and
/// Cr share the second one.
pub fn source_frame(planes: &[Plane], width: u32, height: u32) -> SourceFrame {
    let stride = align_up(width, 32);
    let luma_size = stride as u64 * height as u64;
    let chroma_size = (stride / 2) as u64 * (height / 2) as u64;
    let mut frame = SourceFrame {
        stride,
        ..Default::default()
    };
    match planes {
        [y] => {
            frame.buf_y = y.addr;
            frame.buf_cb = y.addr + luma_size;
            frame.buf_cr = frame.buf_cb + chroma_size;
        }
        [y, cbcr] => {
            frame.buf_y = y.addr;
            frame.buf_cb = cbcr.addr;
            frame.buf_cr = cbcr.addr + chroma_size;
        }
        [y, cb, cr, ..] => {
            frame.buf_y = y.addr;
            frame.buf_cb = cb.addr;
            frame.buf_cr = cr.addr;
        }
        [] => {}
    }
    frame
}

impl Session {
    /// Commands that may still be issued this round.
    fn submit_budget(&self) -> usize {
        let cap = self.config.queue_depth_cap;
        let outstanding = self.dst_queue.consumed_count();
        if self.state == SessionState::Stop {
            // One command at a time until the flush completes.
            if outstanding == 0 { 1 } else { 0 }
        } else {
            (self.src_buffer_budget as usize)
                .min(cap)
                .saturating_sub(outstanding)
        }
    }

    pub(crate) fn schedule(&mut self) {
        if !self.state.can_encode() || !self.both_streaming() {
            return;
        }
        let mut budget = self.submit_budget();
        while budget > 0 {
            let Some(dst_key) = self.dst_queue.first_pending() else {
                log::debug!("[{}] no free destination buffer", self.label);
                break;
            };
            let src_key = self.src_queue.first_pending();
            if src_key.is_none() && self.state != SessionState::Stop {
                log::debug!("[{}] no source frame queued", self.label);
                break;
            }

            let cmd = self.build_command(dst_key, src_key);
            match self.hw.submit_frame(&cmd) {
                Ok(()) => {
                    self.dst_queue.mark_consumed(dst_key);
                    if let Some(key) = src_key {
                        self.src_queue.mark_consumed(key);
                        self.stats.frames_submitted += 1;
                    }
                    log::debug!(
                        "[{}] submitted src {:?} -> {:#x}{}",
                        self.label,
                        cmd.src_index,
                        cmd.bitstream_addr,
                        if cmd.src_end { " (flush)" } else { "" }
                    );
                }
                Err(FailCode::QueueFull) => {
                    self.stats.queue_full_retries += 1;
                    log::debug!("[{}] command queue full, retry later", self.label);
                    break;
                }
                Err(code) => self.fail_pair(dst_key, src_key, code),
            }
            budget -= 1;
        }
    }

    fn build_command(&self, dst_key: SlotKey, src_key: Option<SlotKey>) -> EncodeCommand {
        let mut cmd = EncodeCommand {
            implicit_header: true,
            ..Default::default()
        };
        if let Some(dst) = self.dst_queue.get(dst_key) {
            cmd.bitstream_addr = dst.buffer.addr;
            cmd.bitstream_size = dst.buffer.size;
        }
        match src_key.and_then(|key| self.src_queue.get(key)) {
            Some(src) => {
                cmd.source = Some(source_frame(
                    &src.buffer.planes,
                    self.dst_format.width,
                    self.dst_format.height,
                ));
                cmd.src_index = Some(src.buffer.index);
            }
            None => cmd.src_end = true,
        }
        cmd
    }

    /// The hardware refused this pair: both buffers go back failed and
    /// the session stops taking new frames.
    fn fail_pair(&mut self, dst_key: SlotKey, src_key: Option<SlotKey>, code: FailCode) {
        log::error!("[{}] encode command failed: {}", self.label, code);
        self.stats.submit_failures += 1;
        if let Err(e) = self.set_state(SessionState::Stop) {
            log::error!("[{}] {}", self.label, e);
        }
        if let Some(slot) = src_key.and_then(|key| self.src_queue.remove(key)) {
            self.events.push(SessionEvent::SourceDone {
                index: slot.buffer.index,
                sequence: slot.sequence,
                status: BufferStatus::Error,
            });
        }
        if let Some(slot) = self.dst_queue.remove(dst_key) {
            self.events.push(SessionEvent::BitstreamDone(EncodedBuffer::failed(
                slot.buffer.index,
                slot.sequence,
            )));
        }
    }
}

#[cfg(test)]
#[path = "scheduler_test.rs"]
mod scheduler_test;
