use crate::command::Command;
use serde::{Deserialize, Serialize};

pub type CorrelationId = u64;

/// Correlation id carried by frames that expect no reply.
pub const NO_REPLY: CorrelationId = 0;

pub const DEFAULT_NODE_ID: &str = "default_node";
pub const DEFAULT_GROUP: &str = "default_group";
pub const DEFAULT_CONN: &str = "default_conn";

/// The unit carried on a worker stream, in both directions.
///
/// Envelopes are built with the `with_*` methods and are not mutated afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamCommand {
    command: Command,
    token: String,
    correlation_id: CorrelationId,
    signature: String,
    params: String,
    payload: Vec<u8>,
    trace_id: String,
}

impl StreamCommand {
    pub fn new(command: Command) -> Self {
        StreamCommand {
            command,
            token: String::new(),
            correlation_id: NO_REPLY,
            signature: String::new(),
            params: String::new(),
            payload: Vec::new(),
            trace_id: String::new(),
        }
    }

    /// Protocol level keepalive. Also used as the close marker of a session.
    pub fn keepalive() -> Self {
        StreamCommand::new(Command::Pong)
    }

    /// An empty reply to `request`, correlated with it.
    pub fn reply_to(request: &StreamCommand) -> Self {
        StreamCommand::new(request.command.clone())
            .with_correlation_id(request.correlation_id)
            .with_trace_id(request.trace_id.clone())
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
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

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn expects_reply(&self) -> bool {
        self.correlation_id != NO_REPLY
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn params(&self) -> &str {
        &self.params
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }
}

/// Connection metadata a worker sends once, as the params of its `Register` frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conn: Option<String>,
}

impl ConnectionMetadata {
    /// Builds the `Register` frame that opens a worker stream.
    pub fn into_register_frame(self) -> Result<StreamCommand, serde_json::Error> {
        let params = serde_json::to_string(&self)?;
        Ok(StreamCommand::new(Command::Register).with_params(params))
    }

    /// Reads metadata out of a `Register` frame. Malformed params count as absent.
    pub fn from_register_frame(frame: &StreamCommand) -> Self {
        match serde_json::from_str(frame.params()) {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!(error = %e, "unreadable connection metadata, using defaults");
                ConnectionMetadata::default()
            }
        }
    }

    /// Resolves absent or empty fields to their defaults.
    pub fn resolve(self) -> NodeIdentity {
        fn or_default(value: Option<String>, default: &str) -> String {
            value
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        }

        NodeIdentity {
            node_id: or_default(self.client_id, DEFAULT_NODE_ID),
            group: or_default(self.group, DEFAULT_GROUP),
            conn_tag: or_default(self.conn, DEFAULT_CONN),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeIdentity {
    pub node_id: String,
    pub group: String,
    pub conn_tag: String,
}
