//! Metrics definitions for the distribution engine.

use shared::metrics_defs::{MetricDef, MetricType};

pub const RESPONSE_CACHE_HIT: MetricDef = MetricDef {
    name: "response_cache.hit",
    metric_type: MetricType::Counter,
    description: "Update checks answered from the response cache",
};

pub const RESPONSE_CACHE_MISS: MetricDef = MetricDef {
    name: "response_cache.miss",
    metric_type: MetricType::Counter,
    description: "Update checks that had to resolve the release history",
};

pub const RESPONSE_CACHE_INVALIDATION: MetricDef = MetricDef {
    name: "response_cache.invalidation",
    metric_type: MetricType::Counter,
    description: "Deployments whose cached update checks were dropped",
};

pub const UPDATE_CHECK: MetricDef = MetricDef {
    name: "update_check",
    metric_type: MetricType::Counter,
    description: "Update checks served, tagged by whether an update was available",
};

pub const AGGREGATOR_FLUSH_DURATION: MetricDef = MetricDef {
    name: "metrics_aggregator.flush.duration",
    metric_type: MetricType::Histogram,
    description: "Time to flush the metric event queue in seconds",
};

pub const AGGREGATOR_FLUSH_EVENTS: MetricDef = MetricDef {
    name: "metrics_aggregator.flush.events",
    metric_type: MetricType::Histogram,
    description: "Number of queued events written by one flush",
};

pub const AGGREGATOR_REQUEUED: MetricDef = MetricDef {
    name: "metrics_aggregator.requeued",
    metric_type: MetricType::Counter,
    description: "Events returned to the queue after a failed flush",
};

pub const AGGREGATOR_UNKNOWN_RELEASE: MetricDef = MetricDef {
    name: "metrics_aggregator.unknown_release",
    metric_type: MetricType::Counter,
    description: "Events dropped because their deployment key and label matched no release",
};

pub const AGGREGATOR_QUEUE_SIZE: MetricDef = MetricDef {
    name: "metrics_aggregator.queue_size",
    metric_type: MetricType::Gauge,
    description: "Events waiting for the next flush",
};

pub const RELEASES_PRUNED: MetricDef = MetricDef {
    name: "releases.pruned",
    metric_type: MetricType::Counter,
    description: "Releases removed to keep deployment history bounded",
};

pub const RELEASE_COMMITTED: MetricDef = MetricDef {
    name: "releases.committed",
    metric_type: MetricType::Counter,
    description: "Releases made visible to clients, tagged by release method",
};

pub const ALL_METRICS: &[MetricDef] = &[
    RESPONSE_CACHE_HIT,
    RESPONSE_CACHE_MISS,
    RESPONSE_CACHE_INVALIDATION,
    UPDATE_CHECK,
    AGGREGATOR_FLUSH_DURATION,
    AGGREGATOR_FLUSH_EVENTS,
    AGGREGATOR_REQUEUED,
    AGGREGATOR_UNKNOWN_RELEASE,
    AGGREGATOR_QUEUE_SIZE,
    RELEASES_PRUNED,
    RELEASE_COMMITTED,
];
