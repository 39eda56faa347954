#![deny(unused)]
//! Core types, traits, and error definitions for capgraph.
//!
//! This crate provides the foundational building blocks shared across all layers
//! of the dispatch engine: capability descriptors, conversation state, the chat
//! protocol surface, and the collaborator traits (completion provider, remote
//! workflow provider, conversation and checkpoint stores).

pub mod config;
pub mod error;
pub mod mocks;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use traits::*;
pub use types::*;
