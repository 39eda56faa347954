#![deny(unused)]
//! Orchestration for capgraph.
//!
//! This crate provides the conversation graph, the dispatch coordinator for
//! graph-less contexts, the function-calling flow, execution tracking and
//! in-memory stores.

pub mod dispatch;
pub mod function_calling;
pub mod graph;
pub mod persistence;
pub mod tracker;

pub use dispatch::{DispatchCoordinator, DispatchOutcome};
pub use function_calling::{merge_tool_schemas, FunctionCallOptions, FunctionCallOutcome, FunctionCallingFlow};
pub use graph::{ConversationGraph, GraphBuilder, GraphNode, GraphRun, RunStatus, TerminalKind};
pub use persistence::{InMemoryCheckpointStore, InMemoryConversationStore};
pub use tracker::{preview, ExecutionTracker, TrackedInvocation};
