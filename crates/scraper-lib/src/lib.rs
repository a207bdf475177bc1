//! Library for the Kubernetes container usage scraper
//!
//! This crate provides the core functionality for:
//! - Parsing Prometheus text exposition from cAdvisor and kube-state-metrics
//! - Resolving container identity across label schemes
//! - Turning CPU counters into rates and joining usage with declared resources
//! - Port-forward tunnels to exporter pods
//! - The sampling loop, record delivery, health checks and observability

pub mod cluster;
pub mod correlate;
pub mod exposition;
pub mod health;
pub mod models;
pub mod observability;
pub mod scheduler;
pub mod scrape;
pub mod sink;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testing;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ScraperMetrics, StructuredLogger};
