//! Metrics definitions for the treatment service.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Histogram,
}

#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub description: &'static str,
}

#[macro_export]
macro_rules! counter {
    ($def:expr $(, $key:expr => $value:expr)* $(,)?) => {
        metrics::counter!($def.name $(, $key => $value)*)
    };
}

#[macro_export]
macro_rules! histogram {
    ($def:expr $(, $key:expr => $value:expr)* $(,)?) => {
        metrics::histogram!($def.name $(, $key => $value)*)
    };
}

pub const NEGATIVE_CACHE_HIT: MetricDef = MetricDef {
    name: "negative_cache.hit",
    metric_type: MetricType::Counter,
    description: "Number of project settings lookups that hit the negative cache",
};

pub const NEGATIVE_CACHE_MISS: MetricDef = MetricDef {
    name: "negative_cache.miss",
    metric_type: MetricType::Counter,
    description: "Number of project settings lookups that missed the negative cache",
};

pub const BOOTSTRAP_DURATION: MetricDef = MetricDef {
    name: "store.bootstrap.duration",
    metric_type: MetricType::Histogram,
    description: "Time to load a full snapshot from the management service in seconds",
};

pub const BOOTSTRAP_EXPERIMENTS: MetricDef = MetricDef {
    name: "store.bootstrap.experiments",
    metric_type: MetricType::Histogram,
    description: "Number of active experiments loaded by a snapshot",
};

pub const RESOLVER_OUTCOME: MetricDef = MetricDef {
    name: "resolver.outcome",
    metric_type: MetricType::Counter,
    description: "Experiment resolutions, tagged by outcome (matched, none, ambiguous)",
};

pub const FEED_MESSAGE_APPLIED: MetricDef = MetricDef {
    name: "feed.message.applied",
    metric_type: MetricType::Counter,
    description: "Update feed messages applied to the store, tagged by event type",
};

pub const FEED_MESSAGE_DROPPED: MetricDef = MetricDef {
    name: "feed.message.dropped",
    metric_type: MetricType::Counter,
    description: "Update feed messages acknowledged without being applied",
};

pub const ALL_METRICS: &[MetricDef] = &[
    NEGATIVE_CACHE_HIT,
    NEGATIVE_CACHE_MISS,
    BOOTSTRAP_DURATION,
    BOOTSTRAP_EXPERIMENTS,
    RESOLVER_OUTCOME,
    FEED_MESSAGE_APPLIED,
    FEED_MESSAGE_DROPPED,
];
