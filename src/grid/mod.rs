//! The grid trading core: configuration, placement pipeline, event
//! ingestion, reconciliation, safety gates, and the supervisor that wires
//! them together.

pub mod breaker;
pub mod config;
pub mod controller;
pub mod ingest;
pub mod notify;
pub mod pipeline;
pub mod reconcile;
pub mod supervisor;
pub mod volatility;

pub use breaker::CircuitBreaker;
pub use config::AppConfig;
pub use controller::GridController;
pub use ingest::EventIngestor;
pub use notify::{AlertClass, AlertGate, LogMetricsSink, LogNotifier, MetricsSink, Notifier};
pub use pipeline::OrderPipeline;
pub use reconcile::Reconciler;
pub use supervisor::Supervisor;
pub use volatility::{VolRegime, VolatilityEstimator, VolatilitySnapshot};
