//! Configuration file structures for edge-compute.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`ServerConfigFile`]: HTTP server settings
//! - [`AdminConfig`]: Admin API settings
//! - [`BackendEntry`]: Statically registered backend
//! - [`ServiceEntry`]: Service bound to a request path
//! - [`PolicyConfig`]: Which targets dynamic backends may reach

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::RuntimeConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [runtime.streams]
/// read_chunk_size = 8192
///
/// [runtime.dispatch]
/// default_backend = "origin"
/// allow_dynamic_backends = false
///
/// [server]
/// bind_addr = "0.0.0.0:8080"
/// request_timeout_secs = 30
///
/// [admin]
/// enabled = true
/// token = "your-secret-token"
/// prefix = "/admin"
///
/// [[backends]]
/// name = "origin"
/// url = "http://127.0.0.1:9000"
///
/// [[services]]
/// id = "site"
/// kind = "proxy"
/// backend = "origin"
///
/// [policy]
/// allowed_dynamic_hosts = ["*.example.com"]
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration (streams, dispatch, cache).
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfigFile,

    /// Admin API configuration.
    #[serde(default)]
    pub admin: AdminConfig,

    /// Backends registered at startup.
    #[serde(default)]
    pub backends: Vec<BackendEntry>,

    /// Services exposed at startup.
    #[serde(default)]
    pub services: Vec<ServiceEntry>,

    /// Dynamic backend policy.
    #[serde(default)]
    pub policy: PolicyConfig,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        let config = Self::from_toml(&content)?;
        tracing::debug!(
            path = %path.as_ref().display(),
            backends = config.backends.len(),
            services = config.services.len(),
            "Loaded config file"
        );
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML, or if two
    /// backends or two services share a name.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigFileError> {
        let mut names = std::collections::HashSet::new();
        for backend in &self.backends {
            if !names.insert(backend.name.as_str()) {
                return Err(ConfigFileError::Duplicate {
                    kind: "backend",
                    name: backend.name.clone(),
                });
            }
        }

        let mut ids = std::collections::HashSet::new();
        for service in &self.services {
            if !ids.insert(service.id.as_str()) {
                return Err(ConfigFileError::Duplicate {
                    kind: "service",
                    name: service.id.clone(),
                });
            }
        }

        Ok(())
    }
}

/// HTTP server configuration from config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfigFile {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "defaults::bind_addr")]
    pub bind_addr: String,

    /// Request timeout in seconds.
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Enable graceful shutdown.
    #[serde(default = "defaults::graceful_shutdown")]
    pub graceful_shutdown: bool,
}

impl Default for ServerConfigFile {
    fn default() -> Self {
        Self {
            bind_addr: defaults::bind_addr(),
            request_timeout_secs: defaults::request_timeout_secs(),
            graceful_shutdown: defaults::graceful_shutdown(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdminConfig {
    /// Enable Admin API.
    #[serde(default)]
    pub enabled: bool,

    /// Authentication token (required when enabled).
    ///
    /// Clients must include this token in the `X-Admin-Token` header.
    pub token: Option<String>,

    /// URL prefix for Admin API endpoints.
    #[serde(default = "defaults::admin_prefix")]
    pub prefix: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token: None,
            prefix: defaults::admin_prefix(),
        }
    }
}

impl AdminConfig {
    /// Check if Admin API is properly configured.
    ///
    /// Returns `true` if enabled and token is set.
    pub fn is_configured(&self) -> bool {
        self.enabled && self.token.is_some()
    }
}

/// A backend registered at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendEntry {
    /// Name requests use to target this backend.
    pub name: String,

    /// Base URL requests are forwarded to.
    pub url: String,

    /// Host header sent instead of the one derived from `url`.
    #[serde(default)]
    pub override_host: Option<String>,

    /// Connection timeout in milliseconds.
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,

    /// Time to wait for the first response byte, in milliseconds.
    #[serde(default)]
    pub first_byte_timeout_ms: Option<u64>,

    /// Maximum gap between response body bytes, in milliseconds.
    #[serde(default)]
    pub between_bytes_timeout_ms: Option<u64>,
}

/// Built-in service behaviors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// Forward the request to a backend and stream the response back.
    Proxy,
    /// Echo the request body back.
    Echo,
    /// Forward to a backend and upper-case the response body.
    Uppercase,
    /// Forward to a backend and gzip the response body.
    Gzip,
}

/// A service exposed under `/services/{id}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceEntry {
    /// Unique identifier for the service.
    pub id: String,

    /// What the service does with each exchange.
    pub kind: ServiceKind,

    /// Backend the service forwards to, if it forwards.
    #[serde(default)]
    pub backend: Option<String>,
}

/// Dynamic backend policy.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PolicyConfig {
    /// Host patterns dynamic backends may target (`*` and `*.suffix` allowed).
    #[serde(default)]
    pub allowed_dynamic_hosts: Vec<String>,
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },

    /// Two entries share a name.
    #[error("Duplicate {kind} '{name}' in config file")]
    Duplicate { kind: &'static str, name: String },
}

/// Default value functions for serde.
mod defaults {
    pub fn bind_addr() -> String {
        "0.0.0.0:8080".to_string()
    }

    pub const fn request_timeout_secs() -> u64 {
        30
    }

    pub const fn graceful_shutdown() -> bool {
        true
    }

    pub fn admin_prefix() -> String {
        "/admin".to_string()
    }
}
