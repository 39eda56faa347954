#![deny(unused)]
//! Model gateway for capgraph.
//!
//! This crate provides the [`OpenAiCompatProvider`], a `CompletionProvider`
//! for any endpoint speaking the OpenAI chat-completions protocol, including
//! tool schemas, tool choice and JSON response mode.

pub mod config;
pub mod openai_compat;

pub use config::OpenAiCompatConfig;
pub use openai_compat::OpenAiCompatProvider;
