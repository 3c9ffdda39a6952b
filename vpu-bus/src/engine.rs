//! Async front of a [`Session`].
//!
//! The session lives on a blocking worker thread that owns it exclusively.
//! Callers talk to it through commands with oneshot replies, and buffer
//! events come back on a stream. Dropping the engine closes the session.

use std::{
    pin::Pin,
    sync::{
        Mutex,
        mpsc::{self, RecvTimeoutError},
    },
    time::Duration,
};

use futures::Stream;
use tokio::sync::{mpsc::UnboundedSender, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::buffer::{DestinationBuffer, QueueKind, SourceBuffer};
use crate::event::{SessionEvent, SessionStats};
use crate::format::FrameFormat;
use crate::params::EncodeParams;
use crate::session::{BufferRequirements, Session};
use crate::state::SessionState;

const COMMAND_POLL: Duration = Duration::from_millis(10);

pub type SessionEventStream = Pin<Box<dyn Stream<Item = SessionEvent> + Send>>;

type Reply<T> = oneshot::Sender<anyhow::Result<T>>;

pub enum EngineCommand {
    Configure {
        src: FrameFormat,
        dst: FrameFormat,
        params: EncodeParams,
        result: Reply<()>,
    },
    RequestBuffers {
        queue: QueueKind,
        count: u32,
        plane_sizes: Vec<u32>,
        result: Reply<BufferRequirements>,
    },
    MinSourceBuffers {
        result: Reply<u32>,
    },
    EnqueueSource {
        buffer: SourceBuffer,
        result: Reply<u64>,
    },
    EnqueueDestination {
        buffer: DestinationBuffer,
        result: Reply<u64>,
    },
    StartStreaming {
        queue: QueueKind,
        result: Reply<()>,
    },
    StopStreaming {
        queue: QueueKind,
        result: Reply<()>,
    },
    Start {
        result: Reply<()>,
    },
    Stop {
        result: Reply<()>,
    },
    State {
        result: Reply<SessionState>,
    },
    Stats {
        result: Reply<SessionStats>,
    },
    Close {
        result: Reply<()>,
    },
    Interrupt(u32),
}

pub struct EncoderEngine {
    id: String,
    cancel: CancellationToken,
    tx: mpsc::Sender<EngineCommand>,
    events: Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<SessionEvent>>>,
}

impl EncoderEngine {
    /// Moves `session` onto a blocking worker. Must be called within a
    /// tokio runtime.
    pub fn new(id: &str, session: Session) -> Self {
        let id = id.to_string();
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel();
        let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel();

        let cancel_clone = cancel.clone();
        let worker_id = id.clone();
        tokio::task::spawn_blocking(move || {
            Self::worker_loop(&worker_id, session, cancel_clone, rx, event_tx)
        });
        Self {
            id,
            cancel,
            tx,
            events: Mutex::new(Some(event_rx)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn worker_loop(
        id: &str,
        mut session: Session,
        cancel: CancellationToken,
        rx: mpsc::Receiver<EngineCommand>,
        events: UnboundedSender<SessionEvent>,
    ) {
        log::debug!("engine {} worker started", id);
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match rx.recv_timeout(COMMAND_POLL) {
                Ok(cmd) => {
                    let closing = matches!(cmd, EngineCommand::Close { .. });
                    Self::handle_command(&mut session, cmd);
                    Self::forward_events(&mut session, &events);
                    if closing {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        if let Err(e) = session.close() {
            log::error!("engine {} close error: {:#}", id, e);
        }
        Self::forward_events(&mut session, &events);
        // Release the instance before the event stream ends.
        drop(session);
        log::debug!("engine {} worker exited", id);
    }

    fn forward_events(session: &mut Session, events: &UnboundedSender<SessionEvent>) {
        for event in session.take_events() {
            // Nobody listening is fine; the buffers are gone either way.
            let _ = events.send(event);
        }
    }

    fn handle_command(session: &mut Session, cmd: EngineCommand) {
        fn reply<T>(result: Reply<T>, value: anyhow::Result<T>) {
            if result.send(value).is_err() {
                log::debug!("engine reply dropped, caller went away");
            }
        }

        match cmd {
            EngineCommand::Configure {
                src,
                dst,
                params,
                result,
            } => reply(result, session.configure(src, dst, params).map_err(Into::into)),
            EngineCommand::RequestBuffers {
                queue,
                count,
                plane_sizes,
                result,
            } => reply(
                result,
                session
                    .request_buffers(queue, count, &plane_sizes)
                    .map_err(Into::into),
            ),
            EngineCommand::MinSourceBuffers { result } => {
                reply(result, session.min_source_buffers().map_err(Into::into))
            }
            EngineCommand::EnqueueSource { buffer, result } => {
                reply(result, session.enqueue_source(buffer).map_err(Into::into))
            }
            EngineCommand::EnqueueDestination { buffer, result } => {
                reply(result, session.enqueue_destination(buffer).map_err(Into::into))
            }
            EngineCommand::StartStreaming { queue, result } => {
                reply(result, session.start_streaming(queue).map_err(Into::into))
            }
            EngineCommand::StopStreaming { queue, result } => {
                reply(result, session.stop_streaming(queue).map_err(Into::into))
            }
            EngineCommand::Start { result } => reply(result, session.start().map_err(Into::into)),
            EngineCommand::Stop { result } => reply(result, session.stop().map_err(Into::into)),
            EngineCommand::State { result } => reply(result, Ok(session.state())),
            EngineCommand::Stats { result } => reply(result, Ok(session.stats())),
            EngineCommand::Close { result } => reply(result, session.close().map_err(Into::into)),
            EngineCommand::Interrupt(status) => {
                if let Err(e) = session.notify_interrupt(status) {
                    log::warn!("interrupt {:#x} ignored: {}", status, e);
                }
            }
        }
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> EngineCommand) -> anyhow::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .map_err(|_| anyhow::anyhow!("engine {} is stopped", self.id))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("engine {} dropped the request", self.id))?
    }

    pub async fn configure(
        &self,
        src: FrameFormat,
        dst: FrameFormat,
        params: EncodeParams,
    ) -> anyhow::Result<()> {
        self.request(|result| EngineCommand::Configure {
            src,
            dst,
            params,
            result,
        })
        .await
    }

    pub async fn request_buffers(
        &self,
        queue: QueueKind,
        count: u32,
        plane_sizes: &[u32],
    ) -> anyhow::Result<BufferRequirements> {
        let plane_sizes = plane_sizes.to_vec();
        self.request(|result| EngineCommand::RequestBuffers {
            queue,
            count,
            plane_sizes,
            result,
        })
        .await
    }

    pub async fn min_source_buffers(&self) -> anyhow::Result<u32> {
        self.request(|result| EngineCommand::MinSourceBuffers { result })
            .await
    }

    pub async fn enqueue_source(&self, buffer: SourceBuffer) -> anyhow::Result<u64> {
        self.request(|result| EngineCommand::EnqueueSource { buffer, result })
            .await
    }

    pub async fn enqueue_destination(&self, buffer: DestinationBuffer) -> anyhow::Result<u64> {
        self.request(|result| EngineCommand::EnqueueDestination { buffer, result })
            .await
    }

    pub async fn start_streaming(&self, queue: QueueKind) -> anyhow::Result<()> {
        self.request(|result| EngineCommand::StartStreaming { queue, result })
            .await
    }

    pub async fn stop_streaming(&self, queue: QueueKind) -> anyhow::Result<()> {
        self.request(|result| EngineCommand::StopStreaming { queue, result })
            .await
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.request(|result| EngineCommand::Start { result }).await
    }

    /// Asks for end of stream. The flush finishes asynchronously with
    /// [`SessionEvent::EndOfStream`].
    pub async fn stop(&self) -> anyhow::Result<()> {
        self.request(|result| EngineCommand::Stop { result }).await
    }

    pub async fn state(&self) -> anyhow::Result<SessionState> {
        self.request(|result| EngineCommand::State { result }).await
    }

    pub async fn stats(&self) -> anyhow::Result<SessionStats> {
        self.request(|result| EngineCommand::Stats { result }).await
    }

    /// Closes the session and stops the worker. Buffers still held are
    /// returned failed on the event stream before it ends.
    pub async fn close(&self) -> anyhow::Result<()> {
        self.request(|result| EngineCommand::Close { result }).await
    }

    /// Interrupt entry point; safe to call from any thread.
    pub fn notify_interrupt(&self, status: u32) {
        if self.tx.send(EngineCommand::Interrupt(status)).is_err() {
            log::debug!("engine {} gone, interrupt {:#x} dropped", self.id, status);
        }
    }

    /// Buffer events of this session. Can be taken once.
    pub fn events(&self) -> anyhow::Result<SessionEventStream> {
        let rx = self
            .events
            .lock()
            .map_err(|_| anyhow::anyhow!("event receiver poisoned"))?
            .take()
            .ok_or_else(|| anyhow::anyhow!("events of engine {} already taken", self.id))?;
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for EncoderEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
#[path = "engine_test.rs"]
mod engine_test;
