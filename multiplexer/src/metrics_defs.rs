//! Metrics definitions for the multiplexer.

use shared::metrics_defs::{MetricDef, MetricType};

pub const DISPATCH_DURATION: MetricDef = MetricDef {
    name: "dispatch.duration",
    metric_type: MetricType::Histogram,
    description: "Time from dispatch to reply or failure in seconds. Tagged with group, outcome.",
};

pub const DISPATCH_OUTCOME: MetricDef = MetricDef {
    name: "dispatch.outcome",
    metric_type: MetricType::Counter,
    description: "Number of dispatches. Tagged with group, outcome (ok, timeout, group_not_found, dispatch_failed, collision, frame_too_large, unencodable).",
};

pub const CORRELATIONS_PENDING: MetricDef = MetricDef {
    name: "correlations.pending",
    metric_type: MetricType::Gauge,
    description: "Number of dispatches currently waiting for a reply",
};

pub const REPLIES_DROPPED: MetricDef = MetricDef {
    name: "replies.dropped",
    metric_type: MetricType::Counter,
    description: "Replies that arrived with no caller waiting, usually after a timeout",
};

pub const NODES_REGISTERED: MetricDef = MetricDef {
    name: "nodes.registered",
    metric_type: MetricType::Gauge,
    description: "Number of node identities currently registered across all groups",
};

pub const SESSIONS_ACTIVE: MetricDef = MetricDef {
    name: "sessions.active",
    metric_type: MetricType::Gauge,
    description: "Number of open worker streams",
};

pub const SESSIONS_CLOSED: MetricDef = MetricDef {
    name: "sessions.closed",
    metric_type: MetricType::Counter,
    description: "Worker streams that ended. Tagged with reason.",
};

pub const STALE_DEREGISTRATIONS: MetricDef = MetricDef {
    name: "deregistrations.stale",
    metric_type: MetricType::Counter,
    description: "Deregistrations ignored because a newer connection owns the node identity",
};

pub const HEARTBEAT_ENQUEUE_FAILED: MetricDef = MetricDef {
    name: "heartbeat.enqueue_failed",
    metric_type: MetricType::Counter,
    description: "Keepalives that could not be queued because the node queue was full",
};

pub const FRAMES_DROPPED: MetricDef = MetricDef {
    name: "frames.dropped",
    metric_type: MetricType::Counter,
    description: "Queued envelopes a session could not encode within the frame limit and skipped",
};

pub const ALL_METRICS: &[MetricDef] = &[
    DISPATCH_DURATION,
    DISPATCH_OUTCOME,
    CORRELATIONS_PENDING,
    REPLIES_DROPPED,
    NODES_REGISTERED,
    SESSIONS_ACTIVE,
    SESSIONS_CLOSED,
    STALE_DEREGISTRATIONS,
    HEARTBEAT_ENQUEUE_FAILED,
    FRAMES_DROPPED,
];
