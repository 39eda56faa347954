#![deny(unused)]
//! capgraph - capability dispatch and conversation orchestration service.
//!
//! Serves an OpenAI-compatible chat-completion endpoint that routes each turn
//! through a capability graph, a context dispatcher or the function-calling flow.

use std::sync::Arc;

use capgraph_core::config::AppConfig;
use capgraph_gateway::{AppContext, ChatService, GatewayServer};
use capgraph_model_gateway::{OpenAiCompatConfig, OpenAiCompatProvider};
use capgraph_skills::{builtin_modules, CapabilityRegistry, HttpWorkflowProvider};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().unwrap_or_else(|e| {
        eprintln!("Configuration not loaded ({}); using defaults", e);
        AppConfig::default()
    });

    capgraph_governance::configure_tracing(config.governance.json_logs);
    tracing::info!("Starting capgraph v{}", env!("CARGO_PKG_VERSION"));

    // =========================================================================
    // Completion provider
    // =========================================================================
    let provider_config = OpenAiCompatConfig::from(&config.provider);
    if provider_config.api_key.is_none() {
        tracing::warn!("No provider API key configured; requests will be sent unauthenticated");
    }
    tracing::info!(base_url = %provider_config.base_url, model = %provider_config.default_model, "Completion provider configured");
    let provider = Arc::new(OpenAiCompatProvider::new(provider_config)?);

    // =========================================================================
    // Capabilities
    // =========================================================================
    let mut registry = CapabilityRegistry::new(builtin_modules());
    if config.remote.base_url.is_some() {
        let remote = HttpWorkflowProvider::new(&config.remote)?;
        tracing::info!(workflows = config.remote.workflows.len(), "Remote workflow catalog enabled");
        registry = registry.with_remote(Arc::new(remote));
    }

    // =========================================================================
    // Chat service and gateway
    // =========================================================================
    let ctx = AppContext::from_config(&config, provider, Arc::new(registry))?;
    let service = Arc::new(ChatService::new(ctx).await?);

    let mut server = GatewayServer::new(config.server.clone(), service);
    if config.governance.metrics {
        let handle = capgraph_governance::setup_metrics_recorder()?;
        server = server.with_metrics(handle);
    }

    tracing::info!(host = %config.server.host, port = config.server.port, "Gateway configured");
    server.run().await?;

    Ok(())
}
