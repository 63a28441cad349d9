//! Common types, errors, and configuration for edge-compute.
//!
//! This crate provides shared functionality used across the edge-compute workspace:
//! - Error types using `thiserror`, from host-call status codes up to
//!   process-level failures
//! - Configuration structures for the exchange core
//! - TOML configuration file loading

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{CacheConfig, DispatchConfig, RuntimeConfig, StreamConfig};
pub use config_file::{
    AdminConfig, BackendEntry, ConfigFile, ConfigFileError, PolicyConfig, ServerConfigFile,
    ServiceEntry, ServiceKind,
};
pub use error::{
    HostError, HostErrorCode, ReasonCode, RuntimeError, ScriptError, SendError, SendErrorDetail,
};
