#![deny(unused)]
//! HTTP gateway for capgraph.
//!
//! This crate provides the model-backed router decision engine, the keyword
//! auto-router, the chat service that picks a protocol per request, the
//! streaming responder and the Axum server.

pub mod auto_router;
pub mod router;
pub mod server;
pub mod service;
pub mod streaming;

pub use auto_router::KeywordAutoRouter;
pub use router::{routing_prompt, RouterDecisionEngine, ROUTER_NAME};
pub use server::{ApiError, GatewayServer};
pub use service::{shorten_for_log, AppContext, ChatService, TurnMode, TurnReply, NO_REPLY_TEXT};
pub use streaming::{StreamingResponder, DONE_SENTINEL, FINISH_STOP, FINISH_TOOL_CALLS};
