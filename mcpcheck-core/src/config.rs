//! Configuration types for the recording proxy

use crate::error::{McpCheckError, Result};
use figment::Figment;
use figment::providers::{Env, Format, Json, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Proxy configuration: the downstream servers and how to publish them
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    /// Downstream servers keyed by server name
    #[serde(rename = "mcpServers", default)]
    pub servers: BTreeMap<String, ServerConfig>,

    /// Published endpoint settings
    #[serde(default)]
    pub proxy: ProxySettings,
}

/// One downstream server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Declared transport; inferred from the connection fields when omitted
    #[serde(rename = "transport", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<TransportKind>,

    #[serde(flatten)]
    pub transport: TransportConfig,

    /// Publish every downstream tool
    #[serde(default = "default_enable_all_tools")]
    pub enable_all_tools: bool,

    /// Tools to publish when `enable_all_tools` is off
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub static_allow_list: Vec<String>,
}

fn default_enable_all_tools() -> bool {
    true
}

/// Transport names accepted in the `transport` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[serde(alias = "stdio")]
    Subprocess,
    Http,
}

/// How to reach a downstream server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransportConfig {
    /// Long-lived child process speaking over stdin/stdout
    Subprocess {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
    /// Streamable-HTTP endpoint
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Subprocess { .. } => TransportKind::Subprocess,
            TransportConfig::Http { .. } => TransportKind::Http,
        }
    }
}

impl ServerConfig {
    /// Subprocess server publishing all tools
    pub fn subprocess(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            kind: Some(TransportKind::Subprocess),
            transport: TransportConfig::Subprocess {
                command: command.into(),
                args,
                env: BTreeMap::new(),
            },
            enable_all_tools: true,
            static_allow_list: Vec::new(),
        }
    }

    /// HTTP server publishing all tools
    pub fn http(url: impl Into<String>) -> Self {
        Self {
            kind: Some(TransportKind::Http),
            transport: TransportConfig::Http {
                url: url.into(),
                headers: BTreeMap::new(),
            },
            enable_all_tools: true,
            static_allow_list: Vec::new(),
        }
    }

    /// Restrict the published tools to `tools`
    pub fn with_allow_list<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enable_all_tools = false;
        self.static_allow_list = tools.into_iter().map(Into::into).collect();
        self
    }

    fn validate(&self, name: &str) -> Result<()> {
        if let Some(kind) = self.kind {
            if kind != self.transport.kind() {
                return Err(McpCheckError::Configuration(format!(
                    "Server '{}' declares transport {:?} but is configured for {:?}",
                    name,
                    kind,
                    self.transport.kind()
                )));
            }
        }

        match &self.transport {
            TransportConfig::Subprocess { command, .. } => {
                if command.trim().is_empty() {
                    return Err(McpCheckError::Configuration(format!(
                        "Server '{}' has an empty command",
                        name
                    )));
                }
            }
            TransportConfig::Http { url, .. } => {
                reqwest::Url::parse(url).map_err(|e| {
                    McpCheckError::Configuration(format!(
                        "Server '{}' has an invalid url '{}': {}",
                        name, url, e
                    ))
                })?;
            }
        }

        if self.enable_all_tools && !self.static_allow_list.is_empty() {
            return Err(McpCheckError::Configuration(format!(
                "Server '{}' sets staticAllowList while enableAllTools is true",
                name
            )));
        }

        Ok(())
    }
}

/// Published endpoint settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Interface to bind
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind; 0 picks an ephemeral port
    #[serde(default)]
    pub port: u16,

    /// How long shutdown waits for in-flight calls
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,

    /// Per-request timeout toward the downstream server
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Conversational endpoint path
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_path() -> String {
    "/mcp".to_string()
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            shutdown_grace: default_shutdown_grace(),
            request_timeout: default_request_timeout(),
            path: default_path(),
        }
    }
}

impl ProxySettings {
    /// `host:port` to bind
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Figment provider for a document, picked by file extension
pub(crate) fn document_figment(path: &Path) -> Result<Figment> {
    if !path.exists() {
        return Err(McpCheckError::Configuration(format!(
            "Configuration file not found: {}",
            path.display()
        )));
    }

    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    let figment = match extension.as_deref() {
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("toml") => Figment::new().merge(Toml::file(path)),
        _ => {
            return Err(McpCheckError::Configuration(format!(
                "Unsupported configuration format: {}",
                path.display()
            )));
        }
    };
    Ok(figment)
}

impl McpConfig {
    /// Load configuration from a file, then apply `MCPCHECK_PROXY_*`
    /// environment overrides to the proxy section.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let figment = document_figment(path.as_ref())?.merge(
            Env::prefixed("MCPCHECK_PROXY_").map(|key| format!("proxy.{}", key).into()),
        );

        let config: McpConfig = figment.extract().map_err(|e| {
            McpCheckError::Configuration(format!("Failed to load configuration: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML or JSON document held in memory
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: McpConfig = Figment::new().merge(Yaml::string(text)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as YAML or JSON, picked by file extension
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::to_string(self)
                .map_err(|e| McpCheckError::Configuration(format!("Failed to encode YAML: {}", e)))?,
            _ => serde_json::to_string_pretty(self)?,
        };
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(McpCheckError::Configuration(
                "No downstream servers configured".to_string(),
            ));
        }

        for (name, server) in &self.servers {
            server.validate(name)?;
        }

        if !self.proxy.path.starts_with('/') {
            return Err(McpCheckError::Configuration(format!(
                "Proxy path must start with '/': {}",
                self.proxy.path
            )));
        }

        Ok(())
    }
}
