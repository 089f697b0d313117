use std::collections::HashMap;
use std::sync::Arc;

use octocrab::Octocrab;
use octocrab::models::InstallationId;
use tokio::sync::Mutex;

use super::host::GithubHost;

/// Cache of installation-authenticated hosts, one per installation id.
///
/// Deriving an installation client involves token exchange state inside
/// octocrab, so each identity is computed once and shared. Get-or-create runs
/// under a single critical section.
pub struct InstallationClients {
    hosts: Mutex<HashMap<i64, Arc<GithubHost>>>,
}

impl InstallationClients {
    pub fn new() -> Self {
        Self {
            hosts: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(
        &self,
        app: &Octocrab,
        install_id: i64,
    ) -> Result<Arc<GithubHost>, octocrab::Error> {
        let mut hosts = self.hosts.lock().await;
        if let Some(host) = hosts.get(&install_id) {
            return Ok(host.clone());
        }
        tracing::debug!(install_id, "creating new installation client");
        let client = app.installation(InstallationId(install_id as u64))?;
        let host = Arc::new(GithubHost::new(client));
        hosts.insert(install_id, host.clone());
        Ok(host)
    }
}

impl Default for InstallationClients {
    fn default() -> Self {
        Self::new()
    }
}
