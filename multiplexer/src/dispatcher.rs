use crate::codec::encoded_len;
use crate::correlation::{CorrelationIdGenerator, CorrelationTable};
use crate::envelope::{CorrelationId, StreamCommand};
use crate::metrics_defs::{CORRELATIONS_PENDING, DISPATCH_DURATION, DISPATCH_OUTCOME};
use crate::registry::{Candidate, NodeRegistry};
use rand::seq::SliceRandom;
use shared::{counter, gauge, histogram};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::SendError;
use tokio::time::{Instant, timeout_at};

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum DispatchError {
    #[error("no nodes registered in group {0}")]
    GroupNotFound(String),

    #[error("no node in group {group} accepted the command after {attempts} attempts")]
    DispatchFailed { group: String, attempts: usize },

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("correlation id {0} is already pending")]
    CorrelationCollision(CorrelationId),

    #[error("envelope encodes to {got_bytes} bytes, the frame limit is {max_frame_bytes}")]
    FrameTooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },

    #[error("envelope cannot be encoded: {0}")]
    Unencodable(String),
}

impl DispatchError {
    fn outcome(&self) -> &'static str {
        match self {
            DispatchError::GroupNotFound(_) => "group_not_found",
            DispatchError::DispatchFailed { .. } => "dispatch_failed",
            DispatchError::Timeout(_) => "timeout",
            DispatchError::CorrelationCollision(_) => "collision",
            DispatchError::FrameTooLarge { .. } => "frame_too_large",
            DispatchError::Unencodable(_) => "unencodable",
        }
    }
}

/// Sends commands to a live node of a group and waits for the correlated reply.
pub struct Dispatcher {
    registry: Arc<NodeRegistry>,
    correlations: Arc<CorrelationTable>,
    ids: CorrelationIdGenerator,
    max_frame_bytes: usize,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<NodeRegistry>,
        correlations: Arc<CorrelationTable>,
        ids: CorrelationIdGenerator,
        max_frame_bytes: usize,
    ) -> Self {
        Dispatcher {
            registry,
            correlations,
            ids,
            max_frame_bytes,
        }
    }

    /// Stamps `envelope` with a fresh correlation id, hands it to one node of
    /// `group` and waits up to `timeout` for the reply.
    ///
    /// A successful enqueue only means some node's queue accepted the envelope.
    /// A node that stops draining its queue shows up here as `Timeout`.
    pub async fn dispatch(
        &self,
        group: &str,
        envelope: StreamCommand,
        timeout: Duration,
    ) -> Result<StreamCommand, DispatchError> {
        let started = Instant::now();
        let result = self.dispatch_until(group, envelope, started, timeout).await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.outcome(),
        };
        counter!(DISPATCH_OUTCOME, "group" => group.to_string(), "outcome" => outcome)
            .increment(1);
        histogram!(DISPATCH_DURATION, "group" => group.to_string(), "outcome" => outcome)
            .record(started.elapsed().as_secs_f64());
        gauge!(CORRELATIONS_PENDING).set(self.correlations.len() as f64);

        result
    }

    async fn dispatch_until(
        &self,
        group: &str,
        envelope: StreamCommand,
        started: Instant,
        timeout: Duration,
    ) -> Result<StreamCommand, DispatchError> {
        let deadline = started + timeout;
        let correlation_id = self.ids.next_id();
        // Open the slot before enqueueing so a fast reply always finds it.
        let mut pending = self.correlations.open(correlation_id)?;
        gauge!(CORRELATIONS_PENDING).set(self.correlations.len() as f64);

        let envelope = envelope.with_correlation_id(correlation_id);
        // A frame over the limit could never be written to any node.
        self.check_frame_size(&envelope)?;
        let trace_id = envelope.trace_id().to_string();
        let command = envelope.command().to_string();

        let mut candidates = self
            .registry
            .candidates(group)
            .ok_or_else(|| DispatchError::GroupNotFound(group.to_string()))?;
        candidates.shuffle(&mut rand::thread_rng());

        let node_id = match timeout_at(deadline, enqueue_any(group, candidates, envelope)).await {
            Ok(node_id) => node_id?,
            Err(_) => return Err(DispatchError::Timeout(timeout)),
        };

        tracing::debug!(
            group,
            node_id = %node_id,
            correlation_id,
            trace_id = %trace_id,
            command = %command,
            "command enqueued"
        );

        match timeout_at(deadline, pending.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) | Err(_) => {
                tracing::warn!(
                    group,
                    node_id = %node_id,
                    correlation_id,
                    trace_id = %trace_id,
                    command = %command,
                    "timed out waiting for reply"
                );
                Err(DispatchError::Timeout(timeout))
            }
        }
    }
}

impl Dispatcher {
    fn check_frame_size(&self, envelope: &StreamCommand) -> Result<(), DispatchError> {
        let got_bytes =
            encoded_len(envelope).map_err(|e| DispatchError::Unencodable(e.to_string()))?;
        if got_bytes > self.max_frame_bytes {
            return Err(DispatchError::FrameTooLarge {
                max_frame_bytes: self.max_frame_bytes,
                got_bytes,
            });
        }
        Ok(())
    }
}

/// Tries each candidate once, in order, until a queue accepts the envelope.
/// A send only fails when the node was deregistered after the snapshot was taken.
async fn enqueue_any(
    group: &str,
    candidates: Vec<Candidate>,
    mut envelope: StreamCommand,
) -> Result<String, DispatchError> {
    let attempts = candidates.len();

    for candidate in candidates {
        match candidate.enqueue(envelope).await {
            Ok(()) => return Ok(candidate.node_id),
            Err(SendError(returned)) => {
                tracing::debug!(group, node_id = %candidate.node_id, "node queue closed");
                envelope = returned;
            }
        }
    }

    Err(DispatchError::DispatchFailed {
        group: group.to_string(),
        attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use tokio::sync::mpsc;

    fn dispatcher() -> (Arc<NodeRegistry>, Arc<CorrelationTable>, Dispatcher) {
        let registry = Arc::new(NodeRegistry::new(64));
        let correlations = Arc::new(CorrelationTable::new());
        let dispatcher = Dispatcher::new(
            registry.clone(),
            correlations.clone(),
            CorrelationIdGenerator::new(1),
            4096,
        );
        (registry, correlations, dispatcher)
    }

    /// Answers every request on the node's queue with a reply echoing its params.
    fn spawn_echo_worker(
        registry: &NodeRegistry,
        correlations: Arc<CorrelationTable>,
        group: &str,
        node_id: &str,
    ) {
        let queue = registry.register(group, node_id, "conn-1").queue;
        tokio::spawn(async move {
            let rx = queue.receiver();
            let mut rx = rx.lock().await;
            while let Some(request) = rx.recv().await {
                let reply = StreamCommand::reply_to(&request).with_params(request.params());
                correlations.deliver(reply);
            }
        });
    }

    #[tokio::test]
    async fn test_group_not_found_is_immediate() {
        let (_registry, correlations, dispatcher) = dispatcher();
        let started = std::time::Instant::now();

        let result = dispatcher
            .dispatch(
                "storage",
                StreamCommand::new(Command::StatFile),
                Duration::from_secs(12),
            )
            .await;

        assert_eq!(result, Err(DispatchError::GroupNotFound("storage".into())));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(correlations.is_empty());
    }

    #[tokio::test]
    async fn test_reply_matches_request() {
        let (registry, correlations, dispatcher) = dispatcher();
        spawn_echo_worker(&registry, correlations.clone(), "general", "n1");

        let reply = dispatcher
            .dispatch(
                "general",
                StreamCommand::new(Command::GetItem).with_params(r#"{"id":1}"#),
                Duration::from_secs(2),
            )
            .await
            .unwrap();

        assert_eq!(reply.params(), r#"{"id":1}"#);
        assert_ne!(reply.correlation_id(), 0);
        assert!(correlations.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_releases_slot() {
        let (registry, correlations, dispatcher) = dispatcher();
        // Registered, but nothing drains the queue
        let _registration = registry.register("general", "n1", "conn-1");

        let started = std::time::Instant::now();
        let result = dispatcher
            .dispatch(
                "general",
                StreamCommand::new(Command::GetItem),
                Duration::from_millis(200),
            )
            .await;

        let elapsed = started.elapsed();
        assert_eq!(result, Err(DispatchError::Timeout(Duration::from_millis(200))));
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(1));
        assert!(correlations.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_envelope_rejected_before_enqueue() {
        let (registry, correlations, dispatcher) = dispatcher();
        let queue = registry.register("storage", "s1", "conn-1").queue;

        let started = std::time::Instant::now();
        let result = dispatcher
            .dispatch(
                "storage",
                StreamCommand::new(Command::UploadFile).with_payload(vec![0; 8192]),
                Duration::from_secs(5),
            )
            .await;

        assert!(matches!(
            result,
            Err(DispatchError::FrameTooLarge { max_frame_bytes: 4096, got_bytes }) if got_bytes > 8192
        ));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(correlations.is_empty());
        // Nothing reached the node
        assert!(queue.receiver().lock().await.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_queues_fail_dispatch() {
        let (tx_a, rx_a) = mpsc::channel(1);
        let (tx_b, rx_b) = mpsc::channel(1);
        drop((rx_a, rx_b));

        let candidates = vec![
            Candidate {
                node_id: "a".into(),
                tx: tx_a,
            },
            Candidate {
                node_id: "b".into(),
                tx: tx_b,
            },
        ];

        let result = enqueue_any("index", candidates, StreamCommand::new(Command::IndexItem)).await;
        assert_eq!(
            result,
            Err(DispatchError::DispatchFailed {
                group: "index".into(),
                attempts: 2
            })
        );
    }

    #[tokio::test]
    async fn test_falls_through_to_live_candidate() {
        let (tx_dead, rx_dead) = mpsc::channel(1);
        drop(rx_dead);
        let (tx_live, mut rx_live) = mpsc::channel(1);

        let candidates = vec![
            Candidate {
                node_id: "dead".into(),
                tx: tx_dead,
            },
            Candidate {
                node_id: "live".into(),
                tx: tx_live,
            },
        ];

        let node_id = enqueue_any("index", candidates, StreamCommand::new(Command::IndexItem))
            .await
            .unwrap();
        assert_eq!(node_id, "live");
        assert_eq!(rx_live.recv().await.unwrap().command(), &Command::IndexItem);
    }

    #[tokio::test]
    async fn test_spreads_over_group_members() {
        let (registry, correlations, dispatcher) = dispatcher();
        let q1 = registry.register("index", "n1", "conn-1").queue;
        let q2 = registry.register("index", "n2", "conn-1").queue;

        for _ in 0..40 {
            // Nobody replies; only the placement matters here
            let _ = dispatcher
                .dispatch(
                    "index",
                    StreamCommand::new(Command::SearchItems),
                    Duration::from_millis(1),
                )
                .await;
        }

        let drain = |queue: crate::registry::OutboundQueue| async move {
            let rx = queue.receiver();
            let mut rx = rx.lock().await;
            let mut count = 0;
            while rx.try_recv().is_ok() {
                count += 1;
            }
            count
        };
        let (n1, n2) = (drain(q1).await, drain(q2).await);
        assert_eq!(n1 + n2, 40);
        assert!(n1 > 0 && n2 > 0, "n1={n1} n2={n2}");
        assert!(correlations.is_empty());
    }
}
