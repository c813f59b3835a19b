//! Backend connection multiplexer.
//!
//! Worker nodes dial in and keep one long-lived stream open each. Callers
//! [`Multiplexer::dispatch`] a command to a group of workers and get back the
//! reply correlated with it, or an error once the timeout elapses.

pub mod client;
pub mod codec;
pub mod command;
pub mod config;
pub mod correlation;
pub mod dispatcher;
pub mod envelope;
pub mod heartbeat;
mod listener;
pub mod metrics_defs;
pub mod registry;
pub mod session;

#[cfg(test)]
mod testutils;

use crate::config::{Config, ValidationError};
use crate::correlation::{CorrelationIdGenerator, CorrelationTable};
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::envelope::StreamCommand;
use crate::registry::NodeRegistry;
use crate::session::{SessionContext, SessionError};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;

pub use client::{AckReply, CallError, CallRequest, Client, JsonReply, RawReply, ReplyShape};
pub use command::{Command, TimeoutClass};

#[derive(thiserror::Error, Debug)]
pub enum MultiplexerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ValidationError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

struct MultiplexerInner {
    config: Config,
    registry: Arc<NodeRegistry>,
    dispatcher: Arc<Dispatcher>,
    sessions: Arc<SessionContext>,
    shutdown: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<MultiplexerInner>,
}

impl Multiplexer {
    pub fn new(config: Config) -> Result<Self, MultiplexerError> {
        config.validate()?;

        let instance_id = config.instance_id.unwrap_or_else(rand::random);
        let registry = Arc::new(NodeRegistry::new(config.queue_capacity));
        let correlations = Arc::new(CorrelationTable::new());
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            correlations.clone(),
            CorrelationIdGenerator::new(instance_id),
            config.max_frame_bytes,
        ));
        let sessions = Arc::new(SessionContext::new(
            registry.clone(),
            correlations,
            config.handshake_timeout(),
            config.max_frame_bytes,
        ));
        let (shutdown, _) = watch::channel(false);

        tracing::info!(instance_id, groups = ?config.groups, "multiplexer created");

        Ok(Multiplexer {
            inner: Arc::new(MultiplexerInner {
                config,
                registry,
                dispatcher,
                sessions,
                shutdown,
            }),
        })
    }

    /// Sends `envelope` to one node of `group` and waits up to `timeout` for its reply.
    pub async fn dispatch(
        &self,
        group: &str,
        envelope: StreamCommand,
        timeout: Duration,
    ) -> Result<StreamCommand, DispatchError> {
        self.inner.dispatcher.dispatch(group, envelope, timeout).await
    }

    pub fn client(&self) -> Client {
        Client::new(
            self.inner.dispatcher.clone(),
            self.inner.config.timeouts.clone(),
        )
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.inner.registry
    }

    /// True while every configured group has at least one registered node.
    pub fn is_ready(&self) -> bool {
        self.inner
            .config
            .groups
            .iter()
            .all(|group| self.inner.registry.has_members(group))
    }

    /// Binds the configured worker listener and serves it until [`Multiplexer::shutdown`].
    pub async fn serve(&self) -> Result<(), MultiplexerError> {
        let listener = &self.inner.config.listener;
        let listener = TcpListener::bind((listener.host.as_str(), listener.port)).await?;
        self.serve_listener(listener).await
    }

    /// Serves worker streams accepted on `listener` and runs the heartbeat,
    /// both until [`Multiplexer::shutdown`].
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<(), MultiplexerError> {
        let heartbeat = tokio::spawn(heartbeat::run_heartbeat(
            self.inner.registry.clone(),
            self.inner.config.heartbeat_interval(),
            self.shutdown_signal(),
        ));

        let result = listener::accept_workers(
            listener,
            self.inner.sessions.clone(),
            self.shutdown_signal(),
        )
        .await;

        if result.is_err() {
            heartbeat.abort();
        }
        Ok(result?)
    }

    /// Runs a session over an already established stream.
    pub async fn serve_stream<R, W>(&self, reader: R, writer: W) -> SessionError
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        session::run_session(
            self.inner.sessions.clone(),
            reader,
            writer,
            self.shutdown_signal(),
        )
        .await
    }

    /// Stops accepting workers, stops the heartbeat and ends every session.
    pub fn shutdown(&self) {
        tracing::info!("multiplexer shutting down");
        self.inner.shutdown.send_replace(true);
    }

    fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }
}
