#![deny(unused)]
//! Capability plugins for capgraph.
//!
//! This crate provides:
//! - The capability registry with immutable, swappable snapshots
//! - Built-in capability modules (basic, greeting, human, links, visualize)
//! - The HTTP remote workflow provider

pub mod builtin;
pub mod registry;
pub mod remote;

pub use builtin::*;
pub use registry::{workflow_delegate_descriptor, CapabilityRegistry, ContextView, RegistrySnapshot, RemoteWorkflowCapability};
pub use remote::HttpWorkflowProvider;
