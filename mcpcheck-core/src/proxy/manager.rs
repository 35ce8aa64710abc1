//! Runs one recording proxy per configured downstream server

use crate::config::{McpConfig, ProxySettings, ServerConfig};
use crate::error::{McpCheckError, Result};
use crate::history::{CallHistory, Recorder};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::server::ProxyServer;

/// All proxies of one task run, sharing one [`Recorder`]
pub struct ServerManager {
    proxies: BTreeMap<String, Arc<ProxyServer>>,
    tasks: Vec<(String, JoinHandle<Result<()>>)>,
    recorder: Recorder,
    cancel: CancellationToken,
    stopped: CancellationToken,
}

impl std::fmt::Debug for ServerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerManager")
            .field("proxies", &self.proxies.keys().collect::<Vec<_>>())
            .field("run_id", &self.recorder.run_id())
            .finish()
    }
}

impl ServerManager {
    /// Connect to every configured server and start its proxy
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration or the first downstream that cannot
    /// be connected; proxies already started are stopped again.
    pub async fn start(config: &McpConfig) -> Result<Self> {
        Self::start_with_recorder(config, Recorder::new()).await
    }

    pub async fn start_with_recorder(config: &McpConfig, recorder: Recorder) -> Result<Self> {
        config.validate()?;

        let mut manager = Self {
            proxies: BTreeMap::new(),
            tasks: Vec::new(),
            recorder,
            cancel: CancellationToken::new(),
            stopped: CancellationToken::new(),
        };

        for (index, (name, server)) in config.servers.iter().enumerate() {
            let settings = settings_for(&config.proxy, index)?;
            match ProxyServer::connect(name.as_str(), server.clone(), settings, manager.recorder.clone()).await {
                Ok(proxy) => manager.spawn(Arc::new(proxy)),
                Err(e) => {
                    error!(server = %name, "{}", e);
                    if let Err(shutdown) = manager.stop().await {
                        error!("Failed to stop started proxies: {}", shutdown);
                    }
                    return Err(e);
                }
            }
        }

        info!(run_id = %manager.recorder.run_id(), proxies = manager.proxies.len(), "Proxies started");
        Ok(manager)
    }

    fn spawn(&mut self, proxy: Arc<ProxyServer>) {
        let name = proxy.name().to_string();
        let cancel = self.cancel.child_token();
        let stopped = self.stopped.clone();
        let runner = Arc::clone(&proxy);
        let server = name.clone();

        let task = tokio::spawn(async move {
            let result = runner.run(cancel).await;
            if let Err(e) = &result {
                error!(server = %server, "Proxy stopped with error: {}", e);
            }
            stopped.cancel();
            result
        });

        self.tasks.push((name.clone(), task));
        self.proxies.insert(name, proxy);
    }

    /// Wait until every proxy is listening
    ///
    /// # Errors
    ///
    /// [`McpCheckError::Cancelled`] if `cancel` fires first; an error if a
    /// proxy stops before it becomes ready.
    pub async fn wait_ready(&self, cancel: &CancellationToken) -> Result<()> {
        for proxy in self.proxies.values() {
            tokio::select! {
                biased;
                result = proxy.wait_ready(cancel) => result?,
                _ = self.stopped.cancelled() => {
                    if !proxy.readiness().is_ready() {
                        return Err(McpCheckError::Other(format!(
                            "Proxy for '{}' stopped before it was ready",
                            proxy.name()
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn proxies(&self) -> impl Iterator<Item = &Arc<ProxyServer>> {
        self.proxies.values()
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// Endpoint URL per server, for proxies that are listening
    pub fn endpoints(&self) -> BTreeMap<String, String> {
        self.proxies
            .iter()
            .filter_map(|(name, proxy)| proxy.url().map(|url| (name.clone(), url)))
            .collect()
    }

    /// Configuration an agent should be given: every server replaced by its
    /// proxy endpoint
    pub fn agent_config(&self) -> McpConfig {
        McpConfig {
            servers: self
                .endpoints()
                .into_iter()
                .map(|(name, url)| (name, ServerConfig::http(url)))
                .collect(),
            proxy: ProxySettings::default(),
        }
    }

    /// Allowed tool names per server
    pub async fn allowed_tools(&self) -> Result<BTreeMap<String, Vec<String>>> {
        let mut allowed = BTreeMap::new();
        for (name, proxy) in &self.proxies {
            allowed.insert(name.clone(), proxy.allowed_tools().await?);
        }
        Ok(allowed)
    }

    /// Stop every proxy and hand back what was recorded
    ///
    /// # Errors
    ///
    /// The first proxy shutdown error, such as
    /// [`McpCheckError::ShutdownTimeout`]. Clone [`ServerManager::recorder`]
    /// beforehand to keep the history in that case.
    pub async fn shutdown(mut self) -> Result<CallHistory> {
        self.stop().await?;
        Ok(self.recorder.snapshot())
    }

    async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        let mut first_error = None;
        for (name, task) in self.tasks.drain(..) {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => Err(McpCheckError::Other(format!("Proxy task for '{}' failed: {}", name, e))),
            };
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }

        info!(run_id = %self.recorder.run_id(), calls = self.recorder.len(), "Proxies stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ServerManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// With a fixed base port, each server gets the next port up
fn settings_for(base: &ProxySettings, index: usize) -> Result<ProxySettings> {
    let mut settings = base.clone();
    if base.port != 0 {
        let offset = u16::try_from(index).ok();
        settings.port = offset
            .and_then(|offset| base.port.checked_add(offset))
            .ok_or_else(|| McpCheckError::Configuration("Proxy port range overflows".to_string()))?;
    }
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ephemeral_port_is_shared() {
        let base = ProxySettings::default();
        assert_eq!(settings_for(&base, 3).unwrap().port, 0);
    }

    #[test]
    fn test_fixed_ports_are_consecutive() {
        let base = ProxySettings {
            port: 9100,
            ..ProxySettings::default()
        };
        assert_eq!(settings_for(&base, 0).unwrap().port, 9100);
        assert_eq!(settings_for(&base, 2).unwrap().port, 9102);

        let top = ProxySettings {
            port: u16::MAX,
            ..ProxySettings::default()
        };
        assert!(settings_for(&top, 1).is_err());
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let err = ServerManager::start(&McpConfig::default()).await.unwrap_err();
        assert!(matches!(err, McpCheckError::Configuration(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_reports_subprocess_stderr() {
        let mut config = McpConfig::default();
        config.servers.insert(
            "broken".to_string(),
            ServerConfig::subprocess(
                "sh",
                vec!["-c".to_string(), "echo 'cannot load kubeconfig' >&2; exit 1".to_string()],
            ),
        );
        config.proxy.request_timeout = std::time::Duration::from_secs(5);

        let err = ServerManager::start(&config).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("cannot load kubeconfig"));
    }
}
