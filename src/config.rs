use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure for the deployment agent
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    /// Paths and deployment mode
    pub app: AppConfig,
    /// LLM provider settings
    pub llm: LlmConfig,
    /// Workflow state persistence
    pub state: StateConfig,
    /// Terraform invocation settings
    pub terraform: TerraformConfig,
    /// kubectl invocation settings
    pub kubernetes: KubernetesConfig,
    /// Monitoring stack defaults
    pub monitoring: MonitoringConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// Collaborators are simulated, nothing is provisioned
    Demo,
    /// Terraform and kubectl are actually invoked
    Real,
}

impl DeploymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentMode::Demo => "demo",
            DeploymentMode::Real => "real",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub deployment_mode: DeploymentMode,
    /// Generated workspaces, manifests, kubeconfigs and docs land here
    pub output_dir: PathBuf,
    /// Per-platform Terraform modules (`<terraform_dir>/<platform>`)
    pub terraform_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Ollama,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "openai",
            LlmProvider::Anthropic => "anthropic",
            LlmProvider::Ollama => "ollama",
        }
    }

    fn default_base_url(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "https://api.openai.com/v1",
            LlmProvider::Anthropic => "https://api.anthropic.com/v1",
            LlmProvider::Ollama => "http://localhost:11434",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// API key (can be set via OPENAI_API_KEY / ANTHROPIC_API_KEY)
    pub api_key: Option<String>,
    /// Override for the provider endpoint
    pub base_url: Option<String>,
    pub timeout_seconds: u64,
}

impl LlmConfig {
    pub fn endpoint(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.provider.default_base_url())
            .trim_end_matches('/')
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackendKind {
    Sqlite,
    Postgres,
    /// Single JSON document, debug only
    File,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StateConfig {
    pub backend: StateBackendKind,
    /// SQLite database file
    pub sqlite_path: PathBuf,
    /// PostgreSQL connection string
    pub postgres_url: Option<String>,
    /// JSON document used by the file backend
    pub file_path: PathBuf,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Enable automatic migrations
    pub auto_migrate: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TerraformConfig {
    pub binary: String,
    pub parallelism: u32,
    /// Exported as TF_LOG
    pub log_level: String,
    pub command_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KubernetesConfig {
    pub kubectl_binary: String,
    /// Fallback kubeconfig when the infrastructure step did not produce one
    pub kubeconfig: Option<String>,
    pub command_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    pub prometheus_retention: String,
    pub grafana_url: String,
    pub prometheus_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level used when RUST_LOG is not set
    pub log_level: String,
    /// Emit JSON lines instead of human-readable logs
    pub json_logs: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            app: AppConfig {
                deployment_mode: DeploymentMode::Demo, // Never touch real infrastructure by default
                output_dir: PathBuf::from("./output"),
                terraform_dir: PathBuf::from("./terraform"),
            },
            llm: LlmConfig {
                provider: LlmProvider::OpenAi,
                model: "gpt-4-turbo-preview".to_string(),
                temperature: 0.7,
                max_tokens: 4096,
                api_key: None,
                base_url: None,
                timeout_seconds: 120,
            },
            state: StateConfig {
                backend: StateBackendKind::Sqlite,
                sqlite_path: PathBuf::from("./data/state.db"),
                postgres_url: None,
                file_path: PathBuf::from("./data/state.json"),
                max_connections: 5,
                auto_migrate: true,
            },
            terraform: TerraformConfig {
                binary: "terraform".to_string(),
                parallelism: 10,
                log_level: "INFO".to_string(),
                command_timeout_seconds: 1800, // 30 minutes
            },
            kubernetes: KubernetesConfig {
                kubectl_binary: "kubectl".to_string(),
                kubeconfig: None,
                command_timeout_seconds: 180,
            },
            monitoring: MonitoringConfig {
                prometheus_retention: "15d".to_string(),
                grafana_url: "http://localhost:3000".to_string(),
                prometheus_url: "http://localhost:9090".to_string(),
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                json_logs: false,
            },
        }
    }
}

impl AgentConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (terraform-k8s-agent.toml, .terraform-k8s-agent-rc)
    /// 3. Environment variables (prefixed with TK8S__, nested with `__`)
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if Path::new("terraform-k8s-agent.toml").exists() {
            builder = builder.add_source(File::with_name("terraform-k8s-agent"));
        }

        if Path::new(".terraform-k8s-agent-rc").exists() {
            builder = builder.add_source(
                File::with_name(".terraform-k8s-agent-rc").format(config::FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            Environment::with_prefix("TK8S")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let mut agent_config: AgentConfig = builder.build()?.try_deserialize()?;
        agent_config.apply_well_known_env();
        Ok(agent_config)
    }

    /// Load from an explicit file layered over the defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut agent_config: AgentConfig = Config::builder()
            .add_source(Config::try_from(&Self::default())?)
            .add_source(File::from(path.as_ref()).format(config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        agent_config.apply_well_known_env();
        Ok(agent_config)
    }

    /// Credentials and kubeconfig fall back to the conventional variables
    fn apply_well_known_env(&mut self) {
        if self.llm.api_key.is_none() {
            let var = match self.llm.provider {
                LlmProvider::OpenAi => Some("OPENAI_API_KEY"),
                LlmProvider::Anthropic => Some("ANTHROPIC_API_KEY"),
                LlmProvider::Ollama => None,
            };
            if let Some(key) = var.and_then(|name| std::env::var(name).ok()) {
                self.llm.api_key = Some(key);
            }
        }

        if self.kubernetes.kubeconfig.is_none() {
            self.kubernetes.kubeconfig = std::env::var("KUBECONFIG").ok();
        }
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_safe_for_local_runs() {
        let config = AgentConfig::default();
        assert_eq!(config.app.deployment_mode, DeploymentMode::Demo);
        assert_eq!(config.state.backend, StateBackendKind::Sqlite);
        assert!(config.state.auto_migrate);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(
            &path,
            r#"
[app]
deployment_mode = "real"

[state]
backend = "file"
file_path = "/tmp/state.json"

[llm]
provider = "ollama"
model = "llama3"
"#,
        )
        .unwrap();

        let config = AgentConfig::load_from_file(&path).unwrap();
        assert_eq!(config.app.deployment_mode, DeploymentMode::Real);
        assert_eq!(config.state.backend, StateBackendKind::File);
        assert_eq!(config.state.file_path, PathBuf::from("/tmp/state.json"));
        assert_eq!(config.llm.provider, LlmProvider::Ollama);
        assert_eq!(config.llm.model, "llama3");
        // Untouched sections keep their defaults
        assert_eq!(config.terraform.parallelism, 10);
    }

    #[test]
    fn saved_config_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.toml");
        let mut config = AgentConfig::default();
        config.monitoring.prometheus_retention = "30d".to_string();
        config.save_to_file(&path).unwrap();

        let reloaded = AgentConfig::load_from_file(&path).unwrap();
        assert_eq!(reloaded.monitoring.prometheus_retention, "30d");
    }

    #[test]
    fn endpoint_defaults_per_provider() {
        let mut llm = AgentConfig::default().llm;
        assert_eq!(llm.endpoint(), "https://api.openai.com/v1");
        llm.provider = LlmProvider::Anthropic;
        assert_eq!(llm.endpoint(), "https://api.anthropic.com/v1");
        llm.base_url = Some("http://127.0.0.1:8080/".to_string());
        assert_eq!(llm.endpoint(), "http://127.0.0.1:8080");
    }
}
