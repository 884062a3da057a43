//! Production [`ClientFactory`] that spawns real ACP agent processes.
//!
//! The credential is resolved once from configuration (keychain, then
//! environment) and injected into every child under the configured variable
//! name.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, info_span};

use crate::acp::client::AcpClient;
use crate::acp::spawner::SpawnConfig;
use crate::config::GlobalConfig;
use crate::driver::{AgentClient, BoxFuture, ClientFactory};
use crate::Result;

/// Spawns one [`AcpClient`] per workspace.
#[derive(Debug, Clone)]
pub struct AcpClientFactory {
    spawn: Arc<SpawnConfig>,
}

impl AcpClientFactory {
    /// Build a factory from an explicit spawn configuration.
    #[must_use]
    pub fn new(spawn: SpawnConfig) -> Self {
        Self {
            spawn: Arc::new(spawn),
        }
    }

    /// Build a factory from global configuration, resolving the shared
    /// credential.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the credential is in neither the
    /// keychain nor the environment.
    pub async fn from_config(config: &GlobalConfig) -> Result<Self> {
        let credential = config.load_credential().await?;
        let mut spawn = config.spawn_config();
        spawn
            .env
            .push((config.agent.credential_env.clone(), credential));
        Ok(Self::new(spawn))
    }

    /// Spawn configuration shared by every client.
    #[must_use]
    pub fn spawn_config(&self) -> &SpawnConfig {
        &self.spawn
    }
}

impl ClientFactory for AcpClientFactory {
    fn new_client<'a>(&'a self, workspace: &'a Path) -> BoxFuture<'a, Result<Arc<dyn AgentClient>>> {
        Box::pin(async move {
            let _guard = info_span!("new_client", workspace = %workspace.display()).entered();
            let client = AcpClient::spawn(&self.spawn, workspace)?;
            info!(agent = client.label(), "acp client ready");
            Ok(Arc::new(client) as Arc<dyn AgentClient>)
        })
    }
}
