use anyhow::Result;

use super::Command;
use crate::config::AgentConfig;

pub struct ConfigCommand {
    pub output: Option<String>,
    config: AgentConfig,
}

impl ConfigCommand {
    pub fn new(output: Option<String>, config: AgentConfig) -> Self {
        Self { output, config }
    }

    /// Effective configuration with credentials masked
    pub fn redacted(&self) -> AgentConfig {
        let mut config = self.config.clone();
        if config.llm.api_key.is_some() {
            config.llm.api_key = Some("***".to_string());
        }
        config
    }
}

impl Command for ConfigCommand {
    async fn execute(&self) -> Result<()> {
        let config = self.redacted();
        match &self.output {
            Some(path) => {
                config.save_to_file(path)?;
                println!("💾 Configuration written to {path}");
            }
            None => print!("{}", toml::to_string_pretty(&config)?),
        }
        Ok(())
    }
}
