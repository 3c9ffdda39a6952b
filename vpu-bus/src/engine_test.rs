use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use crate::buffer::{DestinationBuffer, Plane, QueueKind, SourceBuffer};
use crate::config::EngineConfig;
use crate::device::VpuDevice;
use crate::engine::EncoderEngine;
use crate::error::{ConfigError, SessionError};
use crate::event::{BufferStatus, FrameType, SessionEvent};
use crate::format::FrameFormat;
use crate::params::EncodeParams;
use crate::session::Session;
use crate::sim::{SimConfig, SimVpu};
use crate::state::SessionState;

fn src(index: u32) -> SourceBuffer {
    SourceBuffer::new(
        index,
        vec![Plane {
            addr: 0x100_0000 * (index as u64 + 1),
            size: 149760,
        }],
        33_000 * index as u64,
    )
}

fn dst(index: u32) -> DestinationBuffer {
    DestinationBuffer {
        index,
        addr: 0x4000_0000 + 0x10_0000 * index as u64,
        size: 0x10_0000,
    }
}

fn engine(device: &VpuDevice, sim: &SimVpu, id: &str) -> anyhow::Result<EncoderEngine> {
    let session = Session::new(device, sim.clone(), EngineConfig::default())?;
    Ok(EncoderEngine::new(id, session))
}

/// Hardware that finishes every command as soon as it is accepted, with
/// its interrupts routed back into the engine.
fn auto_engine(device: &VpuDevice) -> anyhow::Result<(Arc<EncoderEngine>, SimVpu, tokio::task::JoinHandle<()>)> {
    let sim = SimVpu::with_config(SimConfig {
        auto_complete: true,
        ..Default::default()
    });
    let (irq_tx, mut irq_rx) = tokio::sync::mpsc::unbounded_channel();
    sim.set_irq_sender(irq_tx);
    let engine = Arc::new(engine(device, &sim, "auto")?);
    let forward = engine.clone();
    let handle = tokio::spawn(async move {
        while let Some(status) = irq_rx.recv().await {
            forward.notify_interrupt(status);
        }
    });
    Ok((engine, sim, handle))
}

#[tokio::test]
async fn encodes_until_end_of_stream() -> anyhow::Result<()> {
    let device = VpuDevice::new("vpu0");
    let (engine, sim, irq) = auto_engine(&device)?;
    let mut events = engine.events()?;

    engine
        .configure(
            FrameFormat::default_source(),
            FrameFormat::default_destination(),
            EncodeParams::default(),
        )
        .await?;
    let req = engine.request_buffers(QueueKind::Source, 0, &[]).await?;
    assert!(req.count >= engine.min_source_buffers().await?);
    engine.start().await?;
    assert_eq!(engine.state().await?, SessionState::PicRun);

    for i in 0..6 {
        engine.enqueue_destination(dst(i)).await?;
    }
    for i in 0..5 {
        engine.enqueue_source(src(i)).await?;
    }
    engine.stop().await?;

    let mut collected = Vec::new();
    let wait = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.next().await {
            let done = event == SessionEvent::JobFinished;
            collected.push(event);
            if done {
                break;
            }
        }
    });
    wait.await?;

    let done_sources: Vec<u32> = collected
        .iter()
        .filter_map(|e| match e {
            SessionEvent::SourceDone { index, status: BufferStatus::Done, .. } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(done_sources, vec![0, 1, 2, 3, 4]);

    let bitstreams: Vec<_> = collected
        .iter()
        .filter_map(|e| match e {
            SessionEvent::BitstreamDone(buf) => Some(buf.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(bitstreams.len(), 6);
    assert_eq!(bitstreams[0].frame_type, Some(FrameType::Key));
    assert!(bitstreams[1..5].iter().all(|b| b.frame_type == Some(FrameType::Inter)));
    assert!(bitstreams[5].last);
    assert_eq!(bitstreams[5].bytes_used, 0);

    let tail = &collected[collected.len() - 2..];
    assert_eq!(tail, &[SessionEvent::EndOfStream, SessionEvent::JobFinished]);

    assert_eq!(engine.state().await?, SessionState::PicRun);
    let stats = engine.stats().await?;
    assert_eq!(stats.frames_submitted, 5);
    assert_eq!(stats.frames_completed, 5);
    assert_eq!(stats.keyframes, 1);

    engine.close().await?;
    assert!(!sim.is_open());
    irq.abort();
    Ok(())
}

#[tokio::test]
async fn session_errors_keep_their_type() -> anyhow::Result<()> {
    let device = VpuDevice::new("vpu0");
    let sim = SimVpu::new();
    let engine = engine(&device, &sim, "errors")?;

    let err = engine.min_source_buffers().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SessionError>(),
        Some(SessionError::InvalidState { .. })
    ));

    engine.request_buffers(QueueKind::Source, 0, &[]).await?;
    let err = engine
        .configure(
            FrameFormat::default_source(),
            FrameFormat::default_destination(),
            EncodeParams::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SessionError>(),
        Some(SessionError::Config(ConfigError::AlreadyOpen(SessionState::PicRun)))
    ));
    Ok(())
}

#[tokio::test]
async fn events_can_be_taken_once() -> anyhow::Result<()> {
    let device = VpuDevice::new("vpu0");
    let sim = SimVpu::new();
    let engine = engine(&device, &sim, "once")?;
    let _events = engine.events()?;
    assert!(engine.events().is_err());
    Ok(())
}

#[tokio::test]
async fn close_returns_every_buffer() -> anyhow::Result<()> {
    let device = VpuDevice::new("vpu0");
    let sim = SimVpu::new();
    let engine = engine(&device, &sim, "close")?;
    let events = engine.events()?;

    engine.request_buffers(QueueKind::Source, 0, &[]).await?;
    engine.start().await?;
    for i in 0..3 {
        engine.enqueue_destination(dst(i)).await?;
        engine.enqueue_source(src(i)).await?;
    }
    assert_eq!(sim.in_flight(), 2);

    engine.close().await?;
    let events: Vec<SessionEvent> =
        tokio::time::timeout(Duration::from_secs(5), events.collect()).await?;

    let mut statuses: Vec<(u32, BufferStatus)> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::SourceDone { index, status, .. } => Some((*index, *status)),
            _ => None,
        })
        .collect();
    statuses.sort_by_key(|(index, _)| *index);
    assert_eq!(
        statuses,
        vec![
            (0, BufferStatus::Done),
            (1, BufferStatus::Done),
            (2, BufferStatus::Error)
        ]
    );
    let failed_dst = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::BitstreamDone(b) if b.status == BufferStatus::Error))
        .count();
    assert_eq!(failed_dst, 1);

    assert_eq!(sim.close_count(), 1);
    assert!(engine.state().await.is_err());
    Ok(())
}

#[tokio::test]
async fn drop_closes_session() -> anyhow::Result<()> {
    let device = VpuDevice::new("vpu0");
    let sim = SimVpu::new();
    let engine = engine(&device, &sim, "drop")?;
    let events = engine.events()?;
    engine.request_buffers(QueueKind::Source, 0, &[]).await?;
    assert!(sim.is_open());
    assert_eq!(device.active_instances(), 1);

    drop(engine);
    let _: Vec<SessionEvent> = tokio::time::timeout(Duration::from_secs(5), events.collect()).await?;
    assert!(!sim.is_open());
    assert_eq!(sim.close_count(), 1);
    assert_eq!(device.active_instances(), 0);
    Ok(())
}
