//! The single entry point outer RPC handlers use to reach the workers.
//!
//! Every call follows the same steps: build the envelope, dispatch it with the
//! timeout of the command's class, and decode the reply with a [`ReplyShape`].
//! Failures are reduced to [`CallError`], which carries nothing about nodes,
//! groups or queues; those details only go to the logs.

use crate::command::Command;
use crate::config::Timeouts;
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::envelope::StreamCommand;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum CallError {
    #[error("system error")]
    System,

    #[error("request timed out")]
    Timeout,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid reply")]
    InvalidReply,
}

impl From<DispatchError> for CallError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Timeout(_) => CallError::Timeout,
            DispatchError::FrameTooLarge {
                max_frame_bytes,
                got_bytes,
            } => CallError::InvalidRequest(format!(
                "request is {got_bytes} bytes, the limit is {max_frame_bytes}"
            )),
            DispatchError::Unencodable(_) => {
                CallError::InvalidRequest("request cannot be encoded".into())
            }
            DispatchError::GroupNotFound(_)
            | DispatchError::DispatchFailed { .. }
            | DispatchError::CorrelationCollision(_) => CallError::System,
        }
    }
}

/// How a reply envelope is turned into a value for the caller.
pub trait ReplyShape {
    type Output;

    fn decode(reply: StreamCommand) -> Result<Self::Output, CallError>;
}

/// The reply's `params` hold JSON for `T`.
pub struct JsonReply<T>(PhantomData<fn() -> T>);

impl<T: DeserializeOwned> ReplyShape for JsonReply<T> {
    type Output = T;

    fn decode(reply: StreamCommand) -> Result<T, CallError> {
        serde_json::from_str(reply.params()).map_err(|e| {
            tracing::warn!(
                error = %e,
                command = %reply.command(),
                trace_id = reply.trace_id(),
                "reply params are not the expected JSON"
            );
            CallError::InvalidReply
        })
    }
}

/// The reply's binary payload, as is.
pub struct RawReply;

impl ReplyShape for RawReply {
    type Output = Vec<u8>;

    fn decode(reply: StreamCommand) -> Result<Vec<u8>, CallError> {
        Ok(reply.into_payload())
    }
}

/// Only the arrival of a reply matters.
pub struct AckReply;

impl ReplyShape for AckReply {
    type Output = ();

    fn decode(_reply: StreamCommand) -> Result<(), CallError> {
        Ok(())
    }
}

/// Everything a request envelope carries besides its command.
#[derive(Clone, Debug, Default)]
pub struct CallRequest {
    token: String,
    signature: String,
    params: String,
    payload: Vec<u8>,
    trace_id: String,
}

impl CallRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// A request whose params are `params` serialized as JSON.
    pub fn json<T: Serialize>(params: &T) -> Result<Self, CallError> {
        let params =
            serde_json::to_string(params).map_err(|e| CallError::InvalidRequest(e.to_string()))?;
        Ok(Self::new().with_params(params))
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = signature.into();
        self
    }

    pub fn with_params(mut self, params: impl Into<String>) -> Self {
        self.params = params.into();
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    fn into_envelope(self, command: Command) -> StreamCommand {
        StreamCommand::new(command)
            .with_token(self.token)
            .with_signature(self.signature)
            .with_params(self.params)
            .with_payload(self.payload)
            .with_trace_id(self.trace_id)
    }
}

#[derive(Clone)]
pub struct Client {
    dispatcher: Arc<Dispatcher>,
    timeouts: Timeouts,
}

impl Client {
    pub(crate) fn new(dispatcher: Arc<Dispatcher>, timeouts: Timeouts) -> Self {
        Client {
            dispatcher,
            timeouts,
        }
    }

    /// Calls `command` on a node of `group` with the timeout of the command's class.
    pub async fn call<S: ReplyShape>(
        &self,
        group: &str,
        command: Command,
        request: CallRequest,
    ) -> Result<S::Output, CallError> {
        let timeout = self.timeouts.for_class(command.timeout_class());
        self.call_with_timeout::<S>(group, command, request, timeout)
            .await
    }

    pub async fn call_with_timeout<S: ReplyShape>(
        &self,
        group: &str,
        command: Command,
        request: CallRequest,
        timeout: Duration,
    ) -> Result<S::Output, CallError> {
        if command.is_lifecycle() {
            return Err(CallError::InvalidRequest(format!(
                "command {command} cannot be sent as a request"
            )));
        }

        let envelope = request.into_envelope(command.clone());
        let trace_id = envelope.trace_id().to_string();

        let reply = self
            .dispatcher
            .dispatch(group, envelope, timeout)
            .await
            .map_err(|e| {
                tracing::error!(
                    error = %e,
                    group,
                    command = %command,
                    trace_id = %trace_id,
                    "call failed"
                );
                CallError::from(e)
            })?;

        S::decode(reply)
    }
}
