use crate::Multiplexer;
use crate::codec::{FrameReader, FrameWriter};
use crate::command::Command;
use crate::envelope::{ConnectionMetadata, StreamCommand};
use crate::session::SessionError;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

const MAX_FRAME_BYTES: usize = 1024 * 1024;
const WAIT: Duration = Duration::from_secs(5);

/// A worker speaking the real frame codec to a session over in-memory pipes,
/// one per direction so either can be closed on its own.
pub struct SimulatedNode {
    reader: Option<FrameReader<DuplexStream>>,
    writer: FrameWriter<DuplexStream>,
    session: JoinHandle<SessionError>,
}

impl SimulatedNode {
    /// Opens a stream without sending anything on it.
    pub fn open(mux: &Multiplexer) -> Self {
        let (worker_write, gateway_read) = tokio::io::duplex(64 * 1024);
        let (gateway_write, worker_read) = tokio::io::duplex(64 * 1024);

        let mux = mux.clone();
        let session =
            tokio::spawn(async move { mux.serve_stream(gateway_read, gateway_write).await });

        SimulatedNode {
            reader: Some(FrameReader::new(worker_read, MAX_FRAME_BYTES)),
            writer: FrameWriter::new(worker_write, MAX_FRAME_BYTES),
            session,
        }
    }

    /// Opens a stream, registers as `node_id` in `group` and waits until the
    /// registry shows this connection as current.
    pub async fn connect(mux: &Multiplexer, node_id: &str, group: &str) -> Self {
        let previous = mux.registry().conn_key(node_id);
        let mut node = Self::open(mux);

        let metadata = ConnectionMetadata {
            client_id: Some(node_id.into()),
            group: Some(group.into()),
            conn: Some("sim".into()),
        };
        node.send(&metadata.into_register_frame().unwrap()).await;

        wait_until(|| {
            let current = mux.registry().conn_key(node_id);
            current.is_some() && current != previous
        })
        .await;
        node
    }

    /// Next frame that is not a keepalive.
    pub async fn recv(&mut self) -> StreamCommand {
        loop {
            let frame = self.recv_any().await.expect("stream closed by gateway");
            if frame.command() != &Command::Pong {
                return frame;
            }
        }
    }

    /// Next frame of any kind. `None` once the gateway closed the stream.
    pub async fn recv_any(&mut self) -> Option<StreamCommand> {
        self.try_recv_any(WAIT)
            .await
            .expect("timed out waiting for a frame")
    }

    /// Like [`SimulatedNode::recv_any`], but `Err` if nothing arrives within `wait`.
    pub async fn try_recv_any(
        &mut self,
        wait: Duration,
    ) -> Result<Option<StreamCommand>, tokio::time::error::Elapsed> {
        let reader = self.reader.as_mut().expect("reader already closed");
        tokio::time::timeout(wait, reader.read_frame())
            .await
            .map(|frame| frame.expect("read frame"))
    }

    /// Stops reading, so every later gateway write fails with a broken pipe.
    pub fn close_reader(&mut self) {
        self.reader = None;
    }

    /// Writes bytes straight to the stream, bypassing the frame codec.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        let stream = self.writer.get_mut();
        stream.write_all(bytes).await.expect("write raw bytes");
        stream.flush().await.expect("flush raw bytes");
    }

    pub async fn send(&mut self, frame: &StreamCommand) {
        self.writer.write_frame(frame).await.expect("write frame");
    }

    pub async fn reply(&mut self, request: &StreamCommand, params: &str) {
        self.send(&StreamCommand::reply_to(request).with_params(params))
            .await;
    }

    /// Waits for the gateway side of the stream to finish on its own.
    pub async fn session_end(&mut self) -> SessionError {
        tokio::time::timeout(WAIT, &mut self.session)
            .await
            .expect("session did not end")
            .expect("session task panicked")
    }

    pub fn session_finished(&self) -> bool {
        self.session.is_finished()
    }

    /// Closes the worker end and waits for the session to finish.
    pub async fn disconnect(self) -> SessionError {
        let SimulatedNode {
            reader,
            writer,
            mut session,
        } = self;
        drop((reader, writer));

        tokio::time::timeout(WAIT, &mut session)
            .await
            .expect("session did not end")
            .expect("session task panicked")
    }
}

/// Polls `condition` until it holds, panicking after a few seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
