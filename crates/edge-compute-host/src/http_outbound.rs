//! HTTP origin for backends that point at real servers.
//!
//! [`HttpOrigin`] forwards outbound requests with `reqwest` on a tokio
//! runtime, so sends complete while the exchange thread waits in `select`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::Client;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use edge_compute_common::{HostError, RuntimeError, SendErrorDetail};

use crate::backend::{Origin, OriginFactory, OriginRequest, OriginResponse, Reply};
use crate::permissions::parse_target;
use crate::types::BackendConfig;

/// Headers that describe one hop and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "content-length",
    "host",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forwards requests to a base URL over HTTP.
#[derive(Debug, Clone)]
pub struct HttpOrigin {
    /// HTTP client (shared, connection pooled).
    client: Client,
    base: url::Url,
    config: BackendConfig,
    runtime: Handle,
}

impl HttpOrigin {
    /// Create an origin for `target` running on `runtime`.
    ///
    /// # Errors
    ///
    /// Returns an error if `target` is not a valid URL or `host[:port]`, or
    /// if the HTTP client cannot be built.
    pub fn new(target: &str, config: BackendConfig, runtime: Handle) -> Result<Self, RuntimeError> {
        let base = parse_target(target)
            .ok_or_else(|| RuntimeError::invalid_config(format!("Invalid backend target: {target}")))?;

        let mut builder = Client::builder()
            .pool_max_idle_per_host(10)
            .user_agent(concat!("edge-compute/", env!("CARGO_PKG_VERSION")));
        if let Some(timeout) = config.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        if let Some(timeout) = config.between_bytes_timeout {
            builder = builder.read_timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base,
            config,
            runtime,
        })
    }

    /// A factory building HTTP origins for dynamically registered backends.
    pub fn factory(runtime: Handle) -> OriginFactory {
        Arc::new(
            move |target: &str, config: &BackendConfig| -> Result<Arc<dyn Origin>, HostError> {
                let origin = Self::new(target, config.clone(), runtime.clone())
                    .map_err(|_| HostError::invalid_argument("backend_register_dynamic"))?;
                Ok(Arc::new(origin))
            },
        )
    }

    /// Where a request for `uri` goes: the path and query of `uri` on the
    /// base URL.
    fn destination(&self, uri: &str) -> url::Url {
        let mut destination = self.base.clone();
        if let Ok(parsed) = url::Url::parse(uri) {
            let base_path = self.base.path().trim_end_matches('/');
            destination.set_path(&format!("{base_path}{}", parsed.path()));
            destination.set_query(parsed.query());
        }
        destination
    }

    async fn fetch(&self, request: OriginRequest) -> Result<OriginResponse, SendErrorDetail> {
        let destination = self.destination(&request.uri);
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| SendErrorDetail::HttpRequestUriInvalid)?;

        debug!(
            backend = %request.backend,
            method = %method,
            uri = %destination,
            "Executing HTTP request"
        );

        let mut builder = self.client.request(method, destination.as_str());
        if let Some(timeout) = self.config.first_byte_timeout {
            builder = builder.timeout(timeout);
        }
        for (name, value) in &request.headers {
            if !HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }
        if let Some(host) = &self.config.override_host {
            builder = builder.header(reqwest::header::HOST, host.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder.send().await.map_err(|e| send_error_detail(&e))?;
        let status = response.status().as_u16();

        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter(|(k, _)| !HOP_BY_HOP.contains(&k.as_str()))
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_string(), v.to_string()))
            })
            .collect();

        let body: Bytes = response
            .bytes()
            .await
            .map_err(|_| SendErrorDetail::HttpIncompleteResponse)?;

        info!(
            backend = %request.backend,
            status = status,
            body_size = body.len(),
            "HTTP request completed"
        );

        Ok(OriginResponse {
            status,
            headers,
            body,
        })
    }
}

impl Origin for HttpOrigin {
    fn dispatch(&self, request: OriginRequest, reply: Reply) {
        let origin = self.clone();
        self.runtime.spawn(async move {
            let backend = request.backend.clone();
            let outcome = origin.fetch(request).await;
            if let Err(detail) = &outcome {
                warn!(backend = %backend, error = detail.message(), "HTTP request failed");
            }
            reply.send(outcome);
        });
    }
}

fn send_error_detail(err: &reqwest::Error) -> SendErrorDetail {
    if err.is_timeout() {
        if err.is_connect() {
            SendErrorDetail::ConnectionTimeout
        } else {
            SendErrorDetail::HttpResponseTimeout
        }
    } else if err.is_connect() {
        SendErrorDetail::ConnectionRefused
    } else if err.is_builder() || err.is_request() {
        SendErrorDetail::HttpRequestUriInvalid
    } else if err.is_body() || err.is_decode() {
        SendErrorDetail::HttpIncompleteResponse
    } else {
        SendErrorDetail::InternalError
    }
}

/// Convert millisecond settings from a config file entry.
pub fn backend_config(
    override_host: Option<String>,
    connect_timeout_ms: Option<u64>,
    first_byte_timeout_ms: Option<u64>,
    between_bytes_timeout_ms: Option<u64>,
) -> BackendConfig {
    BackendConfig {
        override_host,
        connect_timeout: connect_timeout_ms.map(Duration::from_millis),
        first_byte_timeout: first_byte_timeout_ms.map(Duration::from_millis),
        between_bytes_timeout: between_bytes_timeout_ms.map(Duration::from_millis),
        use_ssl: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin(target: &str) -> HttpOrigin {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        HttpOrigin::new(target, BackendConfig::default(), runtime.handle().clone()).unwrap()
    }

    #[test]
    fn test_destination_keeps_path_and_query() {
        let origin = origin("http://127.0.0.1:9000");
        let destination = origin.destination("https://example.com/a/b?x=1");
        assert_eq!(destination.as_str(), "http://127.0.0.1:9000/a/b?x=1");
    }

    #[test]
    fn test_destination_prefixes_base_path() {
        let origin = origin("http://127.0.0.1:9000/api/");
        let destination = origin.destination("http://example.com/users");
        assert_eq!(destination.as_str(), "http://127.0.0.1:9000/api/users");
    }

    #[test]
    fn test_bare_host_target() {
        let origin = origin("127.0.0.1:9000");
        assert_eq!(origin.base.scheme(), "http");
    }

    #[test]
    fn test_invalid_target_rejected() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let result = HttpOrigin::new("http://", BackendConfig::default(), runtime.handle().clone());
        assert!(result.is_err());
    }

    #[test]
    fn test_backend_config_conversion() {
        let config = backend_config(Some("example.com".into()), Some(100), None, Some(5));
        assert_eq!(config.override_host.as_deref(), Some("example.com"));
        assert_eq!(config.connect_timeout, Some(Duration::from_millis(100)));
        assert!(config.first_byte_timeout.is_none());
        assert_eq!(config.between_bytes_timeout, Some(Duration::from_millis(5)));
    }

    #[tokio::test]
    async fn test_unreachable_origin_fails_send() {
        let origin = HttpOrigin::new(
            "http://127.0.0.1:1",
            BackendConfig::default(),
            Handle::current(),
        )
        .unwrap();

        let result = origin
            .fetch(OriginRequest {
                backend: "dead".into(),
                method: "GET".into(),
                uri: "http://example.com/".into(),
                ..Default::default()
            })
            .await;

        assert_eq!(result.unwrap_err(), SendErrorDetail::ConnectionRefused);
    }
}
