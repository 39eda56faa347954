//! Core traits for capgraph.
//!
//! Traits are organized by the collaborator they describe:
//! - `completion`: chat/completion API (CompletionProvider)
//! - `capability`: capability plugins (Capability, CapabilityModule)
//! - `remote`: remote workflow catalog (ExternalCapabilityProvider)
//! - `store`: persistence (ConversationStore, CheckpointStore)
//! - `routing`: decision step (CapabilityRouter, AutoRouter)

pub mod capability;
pub mod completion;
pub mod remote;
pub mod routing;
pub mod store;

pub use capability::*;
pub use completion::*;
pub use remote::*;
pub use routing::*;
pub use store::*;
