//! Shared application state.
//!
//! This module provides [`AppState`], which holds the backends, services
//! and cache shared by every exchange the server runs.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::runtime::Handle;
use tracing::info;

use edge_compute_common::{BackendEntry, ConfigFile, RuntimeConfig, RuntimeError, ServiceEntry};
use edge_compute_core::Dispatcher;
use edge_compute_host::{
    Backend, BackendPolicy, BackendRegistry, CacheStore, DownstreamRequest, DownstreamResponse,
    HttpOrigin, OriginFactory, Session, http_outbound::backend_config,
};

use crate::services::service_handler;

/// A registered service and the dispatcher running its exchanges.
#[derive(Clone)]
pub struct Service {
    pub entry: ServiceEntry,
    dispatcher: Arc<Dispatcher>,
}

impl Service {
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}

/// Shared state across all request handlers.
///
/// This struct is cloned for each request, so it uses `Arc` for shared data.
#[derive(Clone)]
pub struct AppState {
    /// Services by id.
    services: Arc<DashMap<String, Service>>,

    /// Backends every session can reach.
    backends: Arc<BackendRegistry>,

    /// Cache shared by every session.
    cache: Arc<CacheStore>,

    /// Which targets dynamic backends may reach.
    policy: BackendPolicy,

    /// Builds origins for dynamic backends.
    origin_factory: OriginFactory,

    /// Runtime configuration handed to each exchange.
    config: RuntimeConfig,

    /// Runtime outbound HTTP runs on.
    runtime: Handle,
}

impl AppState {
    /// Create empty state.
    ///
    /// `runtime` is where outbound HTTP requests run; exchanges themselves
    /// run on blocking threads.
    pub fn new(config: RuntimeConfig, policy: BackendPolicy, runtime: Handle) -> Self {
        Self {
            services: Arc::new(DashMap::new()),
            backends: Arc::new(BackendRegistry::new()),
            cache: Arc::new(CacheStore::new(config.cache.default_max_age())),
            policy,
            origin_factory: HttpOrigin::factory(runtime.clone()),
            config,
            runtime,
        }
    }

    /// Create state with the backends and services of a config file.
    ///
    /// # Errors
    ///
    /// Returns an error if a backend target or a service is invalid.
    pub fn from_config_file(file: &ConfigFile, runtime: Handle) -> Result<Self, RuntimeError> {
        let policy = if file.policy.allowed_dynamic_hosts.is_empty() {
            BackendPolicy::none()
        } else {
            BackendPolicy::builder()
                .allow_hosts(file.policy.allowed_dynamic_hosts.iter().cloned())
                .build()
        };
        let state = Self::new(file.runtime.clone(), policy, runtime);
        for backend in &file.backends {
            state.register_backend(backend)?;
        }
        for service in &file.services {
            state.register_service(service.clone())?;
        }
        Ok(state)
    }

    /// Get the runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn backends(&self) -> &Arc<BackendRegistry> {
        &self.backends
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// Register (or replace) a backend forwarding over HTTP.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend URL is invalid.
    pub fn register_backend(&self, entry: &BackendEntry) -> Result<(), RuntimeError> {
        let config = backend_config(
            entry.override_host.clone(),
            entry.connect_timeout_ms,
            entry.first_byte_timeout_ms,
            entry.between_bytes_timeout_ms,
        );
        let origin = HttpOrigin::new(&entry.url, config.clone(), self.runtime.clone())?;
        self.backends
            .register(Backend::new(&entry.name, &entry.url, Arc::new(origin)).with_config(config));
        info!(backend = %entry.name, url = %entry.url, "Backend registered");
        Ok(())
    }

    /// Register a backend with a custom origin.
    pub fn register_backend_with(&self, backend: Backend) {
        self.backends.register(backend);
    }

    pub fn remove_backend(&self, name: &str) -> Option<Backend> {
        self.backends.remove(name)
    }

    /// Register (or replace) a service.
    ///
    /// # Errors
    ///
    /// Returns an error if the service needs a backend and names none.
    pub fn register_service(&self, entry: ServiceEntry) -> Result<(), RuntimeError> {
        let handler = service_handler(&entry)?;
        let dispatcher = Arc::new(Dispatcher::new(handler, self.config.clone()));
        info!(service = %entry.id, kind = ?entry.kind, "Service registered");
        self.services
            .insert(entry.id.clone(), Service { entry, dispatcher });
        Ok(())
    }

    /// Get a registered service.
    pub fn get_service(&self, id: &str) -> Option<Service> {
        self.services.get(id).map(|v| v.clone())
    }

    /// Remove a service.
    pub fn remove_service(&self, id: &str) -> Option<Service> {
        self.services.remove(id).map(|(_, v)| v)
    }

    /// List all service ids, sorted.
    pub fn list_services(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.services.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Build the host session for one exchange.
    pub fn session(
        &self,
        request: DownstreamRequest,
        request_id: &str,
    ) -> (Session, tokio::sync::oneshot::Receiver<DownstreamResponse>) {
        Session::builder(request)
            .request_id(request_id)
            .backends(Arc::clone(&self.backends))
            .cache(Arc::clone(&self.cache))
            .policy(self.policy.clone())
            .origin_factory(Arc::clone(&self.origin_factory))
            .build()
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("services_count", &self.services.len())
            .field("backends_count", &self.backends.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_compute_common::ServiceKind;

    fn echo(id: &str) -> ServiceEntry {
        ServiceEntry {
            id: id.to_string(),
            kind: ServiceKind::Echo,
            backend: None,
        }
    }

    #[tokio::test]
    async fn test_app_state_creation() {
        let state = AppState::new(RuntimeConfig::default(), BackendPolicy::none(), Handle::current());
        assert!(state.list_services().is_empty());
        assert!(state.backends().is_empty());
    }

    #[tokio::test]
    async fn test_register_and_remove_service() {
        let state = AppState::new(RuntimeConfig::default(), BackendPolicy::none(), Handle::current());
        state.register_service(echo("b")).unwrap();
        state.register_service(echo("a")).unwrap();

        assert_eq!(state.list_services(), vec!["a", "b"]);
        assert!(state.get_service("a").is_some());
        assert!(state.remove_service("a").is_some());
        assert!(state.get_service("a").is_none());
    }

    #[tokio::test]
    async fn test_proxy_service_needs_backend() {
        let state = AppState::new(RuntimeConfig::default(), BackendPolicy::none(), Handle::current());
        let entry = ServiceEntry {
            id: "site".to_string(),
            kind: ServiceKind::Proxy,
            backend: None,
        };
        assert!(state.register_service(entry).is_err());
    }

    #[tokio::test]
    async fn test_from_config_file() {
        let file = ConfigFile::from_toml(
            r#"
            [[backends]]
            name = "origin"
            url = "http://127.0.0.1:9000"

            [[services]]
            id = "site"
            kind = "proxy"
            backend = "origin"
            "#,
        )
        .unwrap();

        let state = AppState::from_config_file(&file, Handle::current()).unwrap();
        assert!(state.backends().contains("origin"));
        assert_eq!(state.list_services(), vec!["site"]);
    }

    #[tokio::test]
    async fn test_invalid_backend_url() {
        let state = AppState::new(RuntimeConfig::default(), BackendPolicy::none(), Handle::current());
        let entry = BackendEntry {
            name: "broken".to_string(),
            url: "not a url".to_string(),
            override_host: None,
            connect_timeout_ms: None,
            first_byte_timeout_ms: None,
            between_bytes_timeout_ms: None,
        };
        assert!(state.register_backend(&entry).is_err());
    }
}
