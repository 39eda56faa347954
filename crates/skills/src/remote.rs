//! HTTP-backed remote workflow catalog.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use capgraph_core::{
    config::{RemoteConfig, WorkflowEntry},
    traits::ExternalCapabilityProvider,
    types::RemoteWorkflow,
    Error, Result,
};

/// Runs configured workflows with `POST {base_url}/flows/run/{endpoint}`.
pub struct HttpWorkflowProvider {
    client: reqwest::Client,
    base_url: Option<String>,
    workflows: Vec<WorkflowEntry>,
}

impl HttpWorkflowProvider {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::configuration(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.as_ref().map(|u| u.trim_end_matches('/').to_string()),
            workflows: config.workflows.clone(),
        })
    }

    fn entry(&self, name: &str) -> Option<&WorkflowEntry> {
        self.workflows.iter().find(|w| w.name == name)
    }
}

fn allowed(list: &[String], value: Option<&str>) -> bool {
    list.is_empty() || value.is_some_and(|v| list.iter().any(|x| x == v))
}

#[async_trait]
impl ExternalCapabilityProvider for HttpWorkflowProvider {
    async fn list_active(&self, context: Option<&str>, group: Option<&str>) -> Result<Vec<RemoteWorkflow>> {
        if self.base_url.is_none() {
            return Ok(Vec::new());
        }
        Ok(self
            .workflows
            .iter()
            .filter(|w| allowed(&w.contexts, context) && allowed(&w.groups, group))
            .map(|w| RemoteWorkflow {
                name: w.name.clone(),
                description: w.description.clone(),
            })
            .collect())
    }

    async fn invoke(&self, name: &str, args: Value) -> Result<Value> {
        let base = self
            .base_url
            .as_deref()
            .ok_or_else(|| Error::remote_workflow("no remote workflow base URL configured"))?;
        let entry = self
            .entry(name)
            .ok_or_else(|| Error::remote_workflow(format!("unknown workflow '{}'", name)))?;

        let url = format!("{}/flows/run/{}", base, entry.endpoint.trim_start_matches('/'));
        tracing::info!(workflow = %name, url = %url, "Invoking remote workflow");

        let response = self
            .client
            .post(&url)
            .json(&json!({ "user_input": args }))
            .send()
            .await
            .map_err(|e| Error::remote_workflow(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::remote_workflow(format!(
                "workflow '{}' returned {}: {}",
                name, status, body
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| Error::remote_workflow(format!("invalid response from '{}': {}", name, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Path, routing::post, Json, Router};

    fn entry(name: &str, contexts: &[&str]) -> WorkflowEntry {
        WorkflowEntry {
            name: name.into(),
            description: format!("{} workflow", name),
            endpoint: format!("{}-flow", name),
            contexts: contexts.iter().map(|c| c.to_string()).collect(),
            groups: Vec::new(),
        }
    }

    fn config(base_url: Option<String>) -> RemoteConfig {
        RemoteConfig {
            base_url,
            timeout_ms: 5_000,
            workflows: vec![entry("billing", &["support"]), entry("shipping", &["support"]), entry("global", &[])],
        }
    }

    #[tokio::test]
    async fn test_list_active_filters_by_context() {
        let provider = HttpWorkflowProvider::new(&config(Some("http://localhost:1".into()))).unwrap();
        let support = provider.list_active(Some("support"), None).await.unwrap();
        assert_eq!(support.len(), 3);
        let other = provider.list_active(Some("sales"), None).await.unwrap();
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].name, "global");
    }

    #[tokio::test]
    async fn test_no_base_url_lists_nothing() {
        let provider = HttpWorkflowProvider::new(&config(None)).unwrap();
        assert!(provider.list_active(Some("support"), None).await.unwrap().is_empty());
        assert!(provider.invoke("billing", json!("x")).await.is_err());
    }

    #[tokio::test]
    async fn test_invoke_posts_user_input() {
        let app = Router::new().route(
            "/flows/run/:endpoint",
            post(|Path(endpoint): Path<String>, Json(body): Json<Value>| async move {
                Json(json!({"endpoint": endpoint, "echo": body["user_input"]}))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let provider = HttpWorkflowProvider::new(&config(Some(format!("http://{}/", addr)))).unwrap();
        let result = provider.invoke("shipping", json!("where is my package")).await.unwrap();
        assert_eq!(result["endpoint"], "shipping-flow");
        assert_eq!(result["echo"], "where is my package");

        assert!(provider.invoke("unknown", json!("x")).await.is_err());
    }
}
