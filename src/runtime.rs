//! Service bootstrap: build the dependency graph once at startup and hand
//! the wired agent to the HTTP layer.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::agent::ChatAgent;
use crate::config::ServiceConfig;
use crate::database::SessionDatabase;
use crate::llm::{HttpLlmClient, LanguageBackend};
use crate::server;
use crate::tools::wellness;

pub struct ServiceRuntime {
    pub config: ServiceConfig,
    pub agent: Arc<ChatAgent>,
}

impl ServiceRuntime {
    /// Wire config -> database -> backend -> tools -> agent.
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self> {
        let db = Arc::new(
            SessionDatabase::new(&config.database_path)
                .with_context(|| format!("Failed to open database at {}", config.database_path))?,
        );

        let backend: Arc<dyn LanguageBackend> = Arc::new(HttpLlmClient::new(
            config.llm_api_url.clone(),
            config.llm_api_key.clone(),
        ));
        tracing::info!("LLM endpoint: {}", config.llm_api_url);

        let registry = Arc::new(wellness::default_registry().await);
        let agent = Arc::new(ChatAgent::new(backend, registry, db, config.clone()));

        Ok(Self { config, agent })
    }

    pub async fn serve(self) -> Result<()> {
        server::serve(self.agent, &self.config.bind_addr).await
    }
}
