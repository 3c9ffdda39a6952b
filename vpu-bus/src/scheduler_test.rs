use std::collections::HashSet;

use proptest::prelude::*;

use super::source_frame;
use crate::buffer::{DestinationBuffer, Plane, QueueKind, SourceBuffer};
use crate::config::EngineConfig;
use crate::device::VpuDevice;
use crate::error::FailCode;
use crate::event::{BufferStatus, SessionEvent};
use crate::hw::INT_ENC_PIC;
use crate::session::Session;
use crate::sim::SimVpu;
use crate::state::SessionState;

#[test]
fn single_plane_offsets() {
    let planes = [Plane {
        addr: 0x10_0000,
        size: 149760,
    }];
    let f = source_frame(&planes, 416, 240);
    assert_eq!(f.stride, 416);
    assert_eq!(f.buf_y, 0x10_0000);
    assert_eq!(f.buf_cb, 0x10_0000 + 416 * 240);
    assert_eq!(f.buf_cr, f.buf_cb + 208 * 120);
}

#[test]
fn two_plane_offsets() {
    let planes = [
        Plane {
            addr: 0x10_0000,
            size: 99840,
        },
        Plane {
            addr: 0x20_0000,
            size: 49920,
        },
    ];
    let f = source_frame(&planes, 416, 240);
    assert_eq!(f.buf_y, 0x10_0000);
    assert_eq!(f.buf_cb, 0x20_0000);
    assert_eq!(f.buf_cr, 0x20_0000 + 208 * 120);
}

#[test]
fn three_plane_addresses_and_aligned_stride() {
    let planes = [
        Plane { addr: 0x1000, size: 0 },
        Plane { addr: 0x2000, size: 0 },
        Plane { addr: 0x3000, size: 0 },
    ];
    let f = source_frame(&planes, 1000, 100);
    assert_eq!(f.stride, 1024);
    assert_eq!((f.buf_y, f.buf_cb, f.buf_cr), (0x1000, 0x2000, 0x3000));
}

#[derive(Clone, Debug, PartialEq)]
enum Op {
    Source,
    Destination,
    /// Finish the in-flight command at this position (modulo in-flight count).
    Complete(usize),
    QueueFull,
    Stop,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Source),
        3 => Just(Op::Destination),
        4 => (0usize..4).prop_map(Op::Complete),
        1 => Just(Op::QueueFull),
        1 => Just(Op::Stop),
    ]
}

fn setup(cap: usize) -> (VpuDevice, SimVpu, Session) {
    let device = VpuDevice::new("vpu-prop");
    let sim = SimVpu::new();
    let config = EngineConfig {
        queue_depth_cap: cap,
        ..Default::default()
    };
    let mut session = Session::new(&device, sim.clone(), config).unwrap();
    session.request_buffers(QueueKind::Source, 0, &[]).unwrap();
    session.start().unwrap();
    (device, sim, session)
}

proptest! {
    #[test]
    fn cap_and_single_submission_hold(ops in prop::collection::vec(op(), 1..80), cap in 1usize..=2) {
        let (_device, sim, mut session) = setup(cap);
        let mut next_src = 0u32;
        let mut next_dst = 0u32;
        let mut in_flight_src: HashSet<u32> = HashSet::new();
        let mut in_flight_dst: HashSet<u64> = HashSet::new();
        let mut seen = 0usize;

        for op in &ops {
            match op {
                Op::Source => {
                    let planes = vec![Plane { addr: 0x100_0000 * (next_src as u64 + 1), size: 149760 }];
                    session.enqueue_source(SourceBuffer::new(next_src, planes, next_src as u64)).unwrap();
                    next_src += 1;
                }
                Op::Destination => {
                    let buf = DestinationBuffer { index: next_dst, addr: 0x1000 * (next_dst as u64 + 1), size: 0x10000 };
                    session.enqueue_destination(buf).unwrap();
                    next_dst += 1;
                }
                Op::Complete(pos) => {
                    let n = sim.in_flight();
                    if n > 0 {
                        let info = sim.complete_at(pos % n).unwrap();
                        prop_assert!(in_flight_dst.remove(&info.bitstream_buffer));
                        if let Some(idx) = info.consumed_source_index {
                            prop_assert!(in_flight_src.remove(&idx));
                        }
                        session.notify_interrupt(INT_ENC_PIC).unwrap();
                    }
                }
                Op::QueueFull => sim.fail_next_submit(FailCode::QueueFull),
                Op::Stop => session.stop().unwrap(),
            }

            // Transitions happen before rescheduling, so the state after
            // the op is the one the scheduler ran in.
            let submitted = sim.submitted();
            let fresh = &submitted[seen..];
            if session.state() == SessionState::Stop && !fresh.is_empty() {
                prop_assert_eq!(fresh.len(), 1);
                prop_assert_eq!(in_flight_dst.len(), 0, "command issued while stopping with work outstanding");
            }
            for cmd in fresh {
                if cmd.src_end {
                    prop_assert!(in_flight_dst.is_empty(), "flush issued with commands outstanding");
                }
                prop_assert!(in_flight_dst.insert(cmd.bitstream_addr), "destination {:#x} submitted twice", cmd.bitstream_addr);
                if let Some(idx) = cmd.src_index {
                    prop_assert!(in_flight_src.insert(idx), "source {} submitted twice", idx);
                }
            }
            seen = submitted.len();

            prop_assert!(sim.in_flight() <= cap);
            prop_assert!(session.outstanding() <= cap);
            prop_assert_eq!(session.outstanding(), sim.in_flight());
        }

        session.close().unwrap();
        let events = session.take_events();
        let mut src_reported: Vec<u32> = Vec::new();
        let mut dst_reported: Vec<u32> = Vec::new();
        for ev in &events {
            match ev {
                SessionEvent::SourceDone { index, .. } => src_reported.push(*index),
                SessionEvent::BitstreamDone(buf) => dst_reported.push(buf.index),
                _ => {}
            }
        }
        src_reported.sort();
        dst_reported.sort();
        prop_assert_eq!(src_reported, (0..next_src).collect::<Vec<_>>());
        prop_assert_eq!(dst_reported, (0..next_dst).collect::<Vec<_>>());
        let statuses_valid = events.iter().all(|e| match e {
            SessionEvent::SourceDone { status, .. } => {
                *status == BufferStatus::Done || *status == BufferStatus::Error
            }
            _ => true,
        });
        prop_assert!(statuses_valid);
    }
}
