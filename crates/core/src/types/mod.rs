//! Core type definitions for capgraph.
//!
//! Broken down into submodules:
//! - `capability`: descriptors, outputs and special edges
//! - `message`: chat messages and tool calls
//! - `state`: per-turn conversation state
//! - `chat`: the chat-completion protocol surface
//! - `record`: execution records persisted by the conversation store

pub mod capability;
pub mod chat;
pub mod message;
pub mod record;
pub mod state;

pub use capability::*;
pub use chat::*;
pub use message::*;
pub use record::*;
pub use state::*;
