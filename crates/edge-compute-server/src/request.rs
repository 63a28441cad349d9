//! HTTP request conversion for exchanges.
//!
//! This module turns an inbound axum request into the
//! [`DownstreamRequest`] an exchange session starts from.

use axum::http::request::Parts;
use bytes::Bytes;

use edge_compute_host::DownstreamRequest;

/// Build the downstream request for a service call.
///
/// `path` is what follows `/services/{id}`; the exchange sees it as the
/// request path on the original host.
pub fn downstream_request(parts: &Parts, path: &str, body: Bytes) -> DownstreamRequest {
    let host = parts
        .headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let mut uri = format!("http://{host}/{}", path.trim_start_matches('/'));
    if let Some(query) = parts.uri.query() {
        uri.push('?');
        uri.push_str(query);
    }

    let mut request = DownstreamRequest::new(parts.method.as_str(), uri).with_body(body);
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            request = request.with_header(name.as_str(), value);
        }
    }
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Method, Request as HttpRequest};

    fn parts(request: HttpRequest<()>) -> Parts {
        request.into_parts().0
    }

    #[test]
    fn test_downstream_request() {
        let parts = parts(
            HttpRequest::builder()
                .method(Method::POST)
                .uri("/services/site/api/users?page=2")
                .header("Host", "edge.test:8080")
                .header("Content-Type", "application/json")
                .body(())
                .unwrap(),
        );

        let body = Bytes::from(r#"{"name": "test"}"#);
        let request = downstream_request(&parts, "api/users", body.clone());

        assert_eq!(request.method, "POST");
        assert_eq!(request.uri, "http://edge.test:8080/api/users?page=2");
        assert_eq!(request.headers.len(), 2);
        assert_eq!(request.body, body);
    }

    #[test]
    fn test_missing_host_and_empty_path() {
        let parts = parts(HttpRequest::builder().uri("/services/site").body(()).unwrap());
        let request = downstream_request(&parts, "", Bytes::new());

        assert_eq!(request.method, "GET");
        assert_eq!(request.uri, "http://localhost/");
        assert!(request.body.is_empty());
    }

    #[test]
    fn test_non_utf8_header_skipped() {
        let parts = parts(
            HttpRequest::builder()
                .uri("/")
                .header("x-binary", &b"\xff\xfe"[..])
                .header("x-text", "ok")
                .body(())
                .unwrap(),
        );
        let request = downstream_request(&parts, "", Bytes::new());

        assert_eq!(request.headers, vec![("x-text".to_string(), "ok".to_string())]);
    }
}
