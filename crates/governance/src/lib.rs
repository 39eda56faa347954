#![deny(unused)]
//! Observability for capgraph.
//!
//! This crate provides:
//! - Structured logging setup (plain or JSON)
//! - Prometheus metrics recorder and capability/routing/turn counters

pub mod metrics;
pub mod tracing_layer;

pub use metrics::{
    setup_metrics_recorder, track_capability, track_request, track_route_decision, track_turn,
};
pub use tracing_layer::configure_tracing;
