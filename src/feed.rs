//! Synthetic frame feeder: runs one encode session on a simulated VPU and
//! recycles its buffers until the requested frame count is encoded.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use vpu_bus::{
    buffer::{DestinationBuffer, Plane, QueueKind, SourceBuffer},
    device::VpuDevice,
    event::{BufferStatus, SessionEvent, SessionStats},
    format::FrameFormat,
    sim::{SimConfig, SimVpu},
    EncoderEngine, Session,
};

use crate::config::JobConfig;

const SOURCE_BASE: u64 = 0x1000_0000;
const BITSTREAM_BASE: u64 = 0x4000_0000;
const NANOS_PER_SEC: u64 = 1_000_000_000;

pub struct Feeder {
    job: JobConfig,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl Feeder {
    pub fn new(job: JobConfig, cancel: CancellationToken) -> Self {
        Self {
            job,
            cancel,
            started: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.job.id
    }

    /// Encodes `job.frames` frames, returning the session statistics.
    pub async fn run(&self, device: &VpuDevice) -> anyhow::Result<SessionStats> {
        if self.started.swap(true, Ordering::Relaxed) {
            return Err(anyhow::anyhow!("feeder {} already started", self.job.id));
        }
        let job = &self.job;
        let sim = SimVpu::with_config(SimConfig {
            auto_complete: true,
            gop_size: job.gop_size,
            ..Default::default()
        });
        let (irq_tx, mut irq_rx) = tokio::sync::mpsc::unbounded_channel();
        sim.set_irq_sender(irq_tx);

        let session = Session::new(device, sim, job.engine.clone())?;
        let engine = Arc::new(EncoderEngine::new(&job.id, session));

        let irq_engine = engine.clone();
        let irq_cancel = self.cancel.child_token();
        let irq_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = irq_cancel.cancelled() => break,
                    status = irq_rx.recv() => match status {
                        Some(status) => irq_engine.notify_interrupt(status),
                        None => break,
                    },
                }
            }
        });

        let result = self.feed(&engine).await;
        if let Err(e) = engine.close().await {
            log::warn!("feeder {}: close: {:#}", job.id, e);
        }
        irq_task.abort();
        result
    }

    async fn feed(&self, engine: &EncoderEngine) -> anyhow::Result<SessionStats> {
        let job = &self.job;
        let mut events = engine.events()?;

        engine
            .configure(
                FrameFormat::new(job.source, job.width, job.height),
                FrameFormat::new(job.codec, job.width, job.height),
                job.encode_params(),
            )
            .await?;
        let src_req = engine.request_buffers(QueueKind::Source, 0, &[]).await?;
        let dst_req = engine
            .request_buffers(QueueKind::Destination, job.destination_buffers, &[])
            .await?;
        engine.start().await?;
        log::info!(
            "feeder {}: {} source x {:?}, {} destination x {:?}",
            job.id,
            src_req.count,
            src_req.plane_sizes,
            dst_req.count,
            dst_req.plane_sizes
        );

        let frame_interval = NANOS_PER_SEC / job.encode_params().frame_rate.max(1) as u64;
        let dst_size = dst_req.plane_sizes.first().copied().unwrap_or(0);
        let sources: Vec<Vec<Plane>> = (0..src_req.count)
            .map(|i| source_planes(i, &src_req.plane_sizes))
            .collect();

        for index in 0..dst_req.count {
            engine
                .enqueue_destination(DestinationBuffer {
                    index,
                    addr: BITSTREAM_BASE + index as u64 * dst_size as u64,
                    size: dst_size,
                })
                .await?;
        }

        let mut fed = 0u32;
        for (index, planes) in sources.iter().enumerate() {
            if fed == job.frames {
                break;
            }
            let buffer = SourceBuffer::new(index as u32, planes.clone(), fed as u64 * frame_interval);
            engine.enqueue_source(buffer).await?;
            fed += 1;
        }
        let mut stopping = false;
        if fed == job.frames {
            engine.stop().await?;
            stopping = true;
        }

        let mut bytes = 0u64;
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => {
                    log::info!("feeder {}: cancelled after {} frames", job.id, fed);
                    break;
                }
                event = events.next() => match event {
                    Some(event) => event,
                    None => return Err(anyhow::anyhow!("feeder {}: engine went away", job.id)),
                },
            };
            match event {
                SessionEvent::SourceDone { index, status, .. } => {
                    if status == BufferStatus::Error {
                        log::warn!("feeder {}: source {} failed", job.id, index);
                    }
                    if fed < job.frames {
                        let planes = sources[index as usize].clone();
                        let buffer = SourceBuffer::new(index, planes, fed as u64 * frame_interval);
                        engine.enqueue_source(buffer).await?;
                        fed += 1;
                    }
                    if fed == job.frames && !stopping {
                        engine.stop().await?;
                        stopping = true;
                    }
                }
                SessionEvent::BitstreamDone(buf) => {
                    if buf.status == BufferStatus::Error {
                        log::warn!("feeder {}: bitstream {} failed", job.id, buf.index);
                    } else {
                        bytes += buf.bytes_used as u64;
                        log::debug!(
                            "feeder {}: {:?} frame, {} bytes at {}",
                            job.id,
                            buf.frame_type,
                            buf.bytes_used,
                            buf.timestamp
                        );
                    }
                    if !buf.last {
                        engine
                            .enqueue_destination(DestinationBuffer {
                                index: buf.index,
                                addr: BITSTREAM_BASE + buf.index as u64 * dst_size as u64,
                                size: dst_size,
                            })
                            .await?;
                    }
                }
                SessionEvent::EndOfStream => {
                    log::info!("feeder {}: end of stream, {} bytes", job.id, bytes);
                }
                SessionEvent::JobFinished => break,
            }
        }

        engine.stats().await
    }
}

/// Non-overlapping fake DMA addresses for source buffer `index`.
fn source_planes(index: u32, sizes: &[u32]) -> Vec<Plane> {
    let frame_span: u64 = sizes.iter().map(|&s| s as u64).sum();
    let mut addr = SOURCE_BASE + index as u64 * frame_span;
    sizes
        .iter()
        .map(|&size| {
            let plane = Plane { addr, size };
            addr += size as u64;
            plane
        })
        .collect()
}
