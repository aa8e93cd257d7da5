//! Per-endpoint request statistics and the health signal derived from them.

pub mod aggregator;
pub mod window;

pub use aggregator::{
    AggregateSnapshot, EndpointSnapshot, HealthObserver, HealthPoint, HealthThresholds,
    HealthUpdate, MetricsAggregator, OutcomeKind, TrackingHandle, METRICS_KEY,
};
pub use window::RingBuffer;
