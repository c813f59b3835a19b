//! One session per accepted worker stream.
//!
//! A session registers its node, then runs a sender loop (outbound queue to
//! stream) and a receiver loop (stream to correlation table) until either loop
//! fails or the gateway shuts down. When a newer connection takes over the node
//! identity, the older session hands it the queue but keeps reading replies
//! until its own stream ends. Teardown deregisters the node unless a newer
//! connection owns it.

use crate::codec::{CodecError, FrameReader, FrameWriter};
use crate::command::Command;
use crate::correlation::{CorrelationTable, Delivery};
use crate::envelope::{ConnectionMetadata, NodeIdentity, StreamCommand};
use crate::metrics_defs::{
    FRAMES_DROPPED, NODES_REGISTERED, REPLIES_DROPPED, SESSIONS_ACTIVE, SESSIONS_CLOSED,
    STALE_DEREGISTRATIONS,
};
use crate::registry::{Deregistration, NodeRegistry, OutboundQueue};
use shared::{counter, gauge};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Notify, watch};
use tracing::Instrument;

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("stream closed by peer")]
    EndOfStream,

    #[error("stream read failed: {0}")]
    Read(CodecError),

    #[error("stream write failed: {0}")]
    Write(CodecError),

    #[error("no frame received within {0:?} of connecting")]
    HandshakeTimeout(Duration),

    #[error("gateway is shutting down")]
    Shutdown,
}

impl SessionError {
    fn reason(&self) -> &'static str {
        match self {
            SessionError::EndOfStream => "end_of_stream",
            SessionError::Read(_) => "read_error",
            SessionError::Write(_) => "write_error",
            SessionError::HandshakeTimeout(_) => "handshake_timeout",
            SessionError::Shutdown => "shutdown",
        }
    }
}

/// State shared by every session of one multiplexer.
pub struct SessionContext {
    pub(crate) registry: Arc<NodeRegistry>,
    pub(crate) correlations: Arc<CorrelationTable>,
    pub(crate) handshake_timeout: Duration,
    pub(crate) max_frame_bytes: usize,
    accept_seq: AtomicU64,
}

impl SessionContext {
    pub fn new(
        registry: Arc<NodeRegistry>,
        correlations: Arc<CorrelationTable>,
        handshake_timeout: Duration,
        max_frame_bytes: usize,
    ) -> Self {
        SessionContext {
            registry,
            correlations,
            handshake_timeout,
            max_frame_bytes,
            accept_seq: AtomicU64::new(1),
        }
    }

    /// A connection key no other physical connection in this process will share.
    fn next_conn_key(&self, conn_tag: &str) -> String {
        let seq = self.accept_seq.fetch_add(1, Ordering::Relaxed);
        format!("{conn_tag}-{seq}")
    }
}

/// Drives one worker stream from handshake to teardown.
///
/// Always ends with the reason the stream stopped; there is no successful
/// return because the worker is expected to hold the stream open indefinitely.
pub async fn run_session<R, W>(
    ctx: Arc<SessionContext>,
    reader: R,
    writer: W,
    shutdown: watch::Receiver<bool>,
) -> SessionError
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = FrameReader::new(reader, ctx.max_frame_bytes);
    let writer = FrameWriter::new(writer, ctx.max_frame_bytes);

    let first = tokio::select! {
        first = tokio::time::timeout(ctx.handshake_timeout, reader.read_frame()) => first,
        _ = shutdown_requested(shutdown.clone()) => return SessionError::Shutdown,
    };
    let first = match first {
        Ok(Ok(Some(frame))) => frame,
        Ok(Ok(None)) => return SessionError::EndOfStream,
        Ok(Err(e)) => return SessionError::Read(e),
        Err(_) => return SessionError::HandshakeTimeout(ctx.handshake_timeout),
    };

    // A stream that does not open with Register gets the default identity,
    // and its first frame is handled like any other inbound frame.
    let (metadata, pending_frame) = match first.command() {
        Command::Register => (ConnectionMetadata::from_register_frame(&first), None),
        _ => (ConnectionMetadata::default(), Some(first)),
    };
    let identity = metadata.resolve();
    let conn_key = ctx.next_conn_key(&identity.conn_tag);

    let span = tracing::info_span!(
        "session",
        node_id = %identity.node_id,
        group = %identity.group,
        conn_key = %conn_key,
    );

    async move {
        let session = Session::start(ctx, identity, conn_key);
        session.run(reader, writer, pending_frame, shutdown).await
    }
    .instrument(span)
    .await
}

async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    // A dropped sender also means the multiplexer is gone.
    let _ = shutdown.wait_for(|stopping| *stopping).await;
}

struct Session {
    ctx: Arc<SessionContext>,
    identity: NodeIdentity,
    conn_key: String,
    queue: OutboundQueue,
    superseded: Arc<Notify>,
    closed: AtomicBool,
}

impl Session {
    fn start(ctx: Arc<SessionContext>, identity: NodeIdentity, conn_key: String) -> Self {
        let registration = ctx
            .registry
            .register(&identity.group, &identity.node_id, &conn_key);
        gauge!(NODES_REGISTERED).set(ctx.registry.node_count() as f64);
        tracing::info!(members = ?ctx.registry.members(&identity.group), "node registered");

        Session {
            ctx,
            identity,
            conn_key,
            queue: registration.queue,
            superseded: registration.superseded,
            closed: AtomicBool::new(false),
        }
    }

    async fn run<R, W>(
        &self,
        reader: FrameReader<R>,
        writer: FrameWriter<W>,
        pending_frame: Option<StreamCommand>,
        shutdown: watch::Receiver<bool>,
    ) -> SessionError
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        gauge!(SESSIONS_ACTIVE).increment(1);

        let reason = tokio::select! {
            reason = self.send_loop(writer) => reason,
            reason = self.receive_loop(reader, pending_frame) => reason,
            _ = shutdown_requested(shutdown) => SessionError::Shutdown,
        };

        self.close();

        gauge!(SESSIONS_ACTIVE).decrement(1);
        counter!(SESSIONS_CLOSED, "reason" => reason.reason()).increment(1);
        tracing::info!(reason = %reason, "session closed");

        reason
    }

    /// Writes queued envelopes to the stream in FIFO order, one at a time,
    /// until a newer connection for the same node takes the queue over.
    async fn send_loop<W>(&self, mut writer: FrameWriter<W>) -> SessionError
    where
        W: AsyncWrite + Unpin,
    {
        // A reconnect of the same node waits for this lock until the session
        // that holds it is superseded.
        let receiver = self.queue.receiver();
        let guard = tokio::select! {
            guard = receiver.lock() => Some(guard),
            _ = self.superseded.notified() => None,
        };

        if let Some(mut rx) = guard {
            loop {
                // Frames are only written outside the select so a takeover
                // never cuts one off halfway.
                let frame = tokio::select! {
                    biased;
                    _ = self.superseded.notified() => break,
                    frame = rx.recv() => frame,
                };
                // The session holds a sender of its own queue, so the channel
                // cannot close while the session runs.
                let Some(frame) = frame else { break };

                match writer.write_frame(&frame).await {
                    Ok(()) => {}
                    Err(e @ (CodecError::FrameTooLarge { .. } | CodecError::Encode(_))) => {
                        // Nothing reached the stream, it is still in sync.
                        counter!(FRAMES_DROPPED).increment(1);
                        tracing::warn!(
                            error = %e,
                            command = %frame.command(),
                            correlation_id = frame.correlation_id(),
                            "dropping frame that cannot be written"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            correlation_id = frame.correlation_id(),
                            "write to worker failed"
                        );
                        return SessionError::Write(e);
                    }
                }
            }
        }

        tracing::info!("newer connection owns the queue, reading until the worker closes");
        std::future::pending().await
    }

    async fn receive_loop<R>(
        &self,
        mut reader: FrameReader<R>,
        mut pending_frame: Option<StreamCommand>,
    ) -> SessionError
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let frame = match pending_frame.take() {
                Some(frame) => frame,
                None => match reader.read_frame().await {
                    Ok(Some(frame)) => frame,
                    Ok(None) => return SessionError::EndOfStream,
                    Err(e) => {
                        tracing::warn!(error = %e, "read from worker failed");
                        return SessionError::Read(e);
                    }
                },
            };

            self.handle_inbound(frame);
        }
    }

    fn handle_inbound(&self, frame: StreamCommand) {
        if frame.command().is_control() {
            tracing::info!("worker announced graceful restart");
            self.close();
            return;
        }

        let correlation_id = frame.correlation_id();
        match self.ctx.correlations.deliver(frame) {
            Delivery::Delivered => {}
            Delivery::NoWaiter => {
                counter!(REPLIES_DROPPED).increment(1);
                tracing::debug!(correlation_id, "dropping reply with no waiting caller");
            }
            Delivery::Unsolicited => {
                tracing::trace!("ignoring frame without correlation id");
            }
        }
    }

    /// Deregisters this connection and, if it was still the current one,
    /// leaves a close marker on the node's queue. Runs at most once per session.
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let outcome = self.ctx.registry.deregister(
            &self.identity.group,
            &self.identity.node_id,
            &self.conn_key,
        );
        match outcome {
            Deregistration::Removed { members } => {
                // Best effort; a full queue already has plenty for the next connection.
                let _ = self.queue.try_enqueue(StreamCommand::keepalive());
                tracing::info!(?members, "node deregistered");
            }
            Deregistration::Stale { members } => {
                counter!(STALE_DEREGISTRATIONS).increment(1);
                tracing::info!(
                    ?members,
                    "newer connection owns this node, keeping its registration"
                );
            }
        }
        gauge!(NODES_REGISTERED).set(self.ctx.registry.node_count() as f64);
    }
}
