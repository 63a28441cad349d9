//! HTTP server implementation.
//!
//! This module provides the main [`EdgeServer`] struct for running
//! the edge compute HTTP server.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{info, warn};

use edge_compute_common::{ConfigFile, RuntimeError};

use crate::router::{AdminRouterConfig, build_router_with_admin};
use crate::state::AppState;

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server.
    pub bind_addr: SocketAddr,
    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Enable graceful shutdown on SIGTERM/SIGINT.
    pub graceful_shutdown: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            request_timeout_secs: 30,
            graceful_shutdown: true,
        }
    }
}

impl ServerConfig {
    /// Create a new server config with custom bind address.
    #[must_use]
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Create a new server config with custom timeout.
    #[must_use]
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    /// Get the request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Edge compute HTTP server.
///
/// # Example
///
/// ```ignore
/// use edge_compute_server::{AppState, EdgeServer, ServerConfig};
///
/// let state = AppState::new(RuntimeConfig::default(), BackendPolicy::none(), Handle::current());
/// state.register_service(ServiceEntry { id: "echo".into(), kind: ServiceKind::Echo, backend: None })?;
///
/// EdgeServer::new(state, ServerConfig::default()).run().await?;
/// ```
pub struct EdgeServer {
    /// Application state.
    state: AppState,
    /// Server configuration.
    config: ServerConfig,
    /// Admin API, when enabled.
    admin: Option<AdminRouterConfig>,
}

impl EdgeServer {
    pub fn new(state: AppState, config: ServerConfig) -> Self {
        Self {
            state,
            config,
            admin: None,
        }
    }

    /// Create a server from a parsed config file.
    ///
    /// Backends and services are registered from the file; outbound HTTP
    /// runs on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the bind address is invalid, or if a backend or
    /// service entry is rejected.
    pub fn from_config_file(file: &ConfigFile) -> Result<Self, RuntimeError> {
        let bind_addr: SocketAddr = file.server.bind_addr.parse().map_err(|e| {
            RuntimeError::invalid_config(format!(
                "Invalid bind address '{}': {e}",
                file.server.bind_addr
            ))
        })?;
        let config = ServerConfig {
            bind_addr,
            request_timeout_secs: file.server.request_timeout_secs,
            graceful_shutdown: file.server.graceful_shutdown,
        };

        let state = AppState::from_config_file(file, tokio::runtime::Handle::current())?;
        let mut server = Self::new(state, config);

        match (&file.admin.token, file.admin.enabled) {
            (Some(token), true) => server = server.with_admin(&file.admin.prefix, token),
            (None, true) => warn!("Admin API enabled without a token, leaving it disabled"),
            _ => {}
        }
        Ok(server)
    }

    /// Enable the Admin API under `prefix`.
    #[must_use]
    pub fn with_admin(mut self, prefix: &str, token: &str) -> Self {
        self.admin = Some(AdminRouterConfig {
            prefix: prefix.to_string(),
            token: token.to_string(),
        });
        self
    }

    /// Get a reference to the application state.
    ///
    /// Use this to register backends and services before starting the server.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Run the server until shutdown.
    ///
    /// This will block until the server is shut down via signal
    /// (SIGTERM/SIGINT) if graceful shutdown is enabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot bind to the address.
    pub async fn run(self) -> Result<(), RuntimeError> {
        let admin_enabled = self.admin.is_some();
        let app = build_router_with_admin(self.state, self.config.request_timeout(), self.admin);

        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to bind: {e}")))?;

        info!(
            addr = %self.config.bind_addr,
            admin = admin_enabled,
            "Starting HTTP server"
        );

        let app = app.into_make_service_with_connect_info::<SocketAddr>();
        if self.config.graceful_shutdown {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        } else {
            axum::serve(listener, app).await?;
        }

        info!("Server shutdown complete");
        Ok(())
    }

    /// Start a server for `state` and return a handle for testing.
    ///
    /// The server binds to an ephemeral port (127.0.0.1:0) and
    /// returns a handle that can be used to get the actual address
    /// and shut down the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn start_test(
        state: AppState,
        admin_token: Option<&str>,
    ) -> Result<TestHandle, RuntimeError> {
        let admin = admin_token.map(|token| AdminRouterConfig {
            prefix: "/admin".to_string(),
            token: token.to_string(),
        });
        let app = build_router_with_admin(state.clone(), Duration::from_secs(30), admin);

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let handle = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
        });

        Ok(TestHandle {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }
}

impl std::fmt::Debug for EdgeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeServer")
            .field("state", &self.state)
            .field("config", &self.config)
            .field("admin", &self.admin.is_some())
            .finish()
    }
}

/// Handle for a test server instance.
pub struct TestHandle {
    /// The address the server is bound to.
    addr: SocketAddr,
    /// Application state (for registering backends and services).
    state: AppState,
    /// Shutdown signal sender.
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    /// Server task handle.
    handle: tokio::task::JoinHandle<Result<(), std::io::Error>>,
}

impl TestHandle {
    /// Get the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the server URL.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Get the application state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Shutdown the server gracefully.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.handle.await;
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
///
/// If a handler cannot be installed, that signal is never awaited; the other
/// one still shuts the server down.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
