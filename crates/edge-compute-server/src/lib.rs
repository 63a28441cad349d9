//! HTTP server for edge-compute.
//!
//! This crate puts the exchange core behind an HTTP interface. It handles:
//!
//! - Routing `/services/{id}/...` calls to registered services
//! - Turning each call into a host session and dispatching its exchange
//! - Streaming the exchange's response back to the client
//! - Health, readiness and an optional token-protected Admin API
//!
//! # Quick Start
//!
//! ```ignore
//! use edge_compute_common::ConfigFile;
//! use edge_compute_server::EdgeServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let file = ConfigFile::from_file("edge-compute.toml")?;
//!     EdgeServer::from_config_file(&file)?.run().await?;
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod handler;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod services;
pub mod state;

pub use router::{AdminRouterConfig, build_router, build_router_with_admin};
pub use server::{EdgeServer, ServerConfig, TestHandle};
pub use services::{SharedHandler, service_handler};
pub use state::{AppState, Service};
