use config::{Config, ConfigError, Environment, File};
use secrecy::Secret;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub provider: ProviderConfig,
    pub router: RouterConfig,
    pub tracker: TrackerConfig,
    pub streaming: StreamingConfig,
    pub remote: RemoteConfig,
    pub graph: GraphConfig,
    pub governance: GovernanceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    /// Number of prior messages loaded from the conversation store per turn.
    pub history_window: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: Option<Secret<String>>,
    pub default_model: String,
    pub timeout_ms: u64,
}

/// Deterministic router override: a URL plus one of these keywords forces
/// `override_capability` without consulting the model.
#[derive(Debug, Deserialize, Clone)]
pub struct RouterConfig {
    pub override_keywords: Vec<String>,
    pub override_capability: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrackerConfig {
    /// Characters of output kept in the record preview.
    pub preview_limit: usize,
    /// Characters of output kept in the record content.
    pub content_limit: usize,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamingConfig {
    pub pacing_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RemoteConfig {
    pub base_url: Option<String>,
    pub timeout_ms: u64,
    #[serde(default)]
    pub workflows: Vec<WorkflowEntry>,
}

/// One remotely hosted workflow in the configured catalog.
#[derive(Debug, Deserialize, Clone)]
pub struct WorkflowEntry {
    pub name: String,
    pub description: String,
    pub endpoint: String,
    #[serde(default)]
    pub contexts: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GraphConfig {
    pub approval_capabilities: Vec<String>,
    pub max_steps: usize,
    pub visualize_capability: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GovernanceConfig {
    pub json_logs: bool,
    pub metrics: bool,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("CAPGRAPH_ENV").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(File::with_name("config/local").required(false))
            // Map APP__SERVER__PORT=3000 to server.port
            .add_source(Environment::with_prefix("APP").separator("__"))
            .build()?;

        s.try_deserialize()
    }

    /// Load layered configuration, falling back to defaults for missing sections.
    pub fn load_or_default() -> Self {
        match Self::load() {
            Ok(cfg) => cfg,
            Err(_) => Self::default(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".into(),
                port: 3000,
                allowed_origins: vec!["*".into()],
                history_window: 20,
            },
            provider: ProviderConfig {
                base_url: "https://api.openai.com/v1".into(),
                api_key: None,
                default_model: "gpt-4o-mini".into(),
                timeout_ms: 60_000,
            },
            router: RouterConfig {
                override_keywords: vec![
                    "link".into(),
                    "url".into(),
                    "website".into(),
                    "page".into(),
                ],
                override_capability: "inspect_link".into(),
            },
            tracker: TrackerConfig {
                preview_limit: 100,
                content_limit: 200,
                timeout_ms: 60_000,
            },
            streaming: StreamingConfig { pacing_ms: 50 },
            remote: RemoteConfig {
                base_url: None,
                timeout_ms: 60_000,
                workflows: Vec::new(),
            },
            graph: GraphConfig {
                approval_capabilities: vec!["human_approval".into()],
                max_steps: 16,
                visualize_capability: "visualize_conversation".into(),
            },
            governance: GovernanceConfig {
                json_logs: false,
                metrics: true,
            },
        }
    }
}
