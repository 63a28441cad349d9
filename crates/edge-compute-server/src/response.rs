//! HTTP response conversion for exchanges.
//!
//! An exchange delivers its response head first and its body as chunks on a
//! channel; [`into_axum_response`] streams those chunks to the client as
//! they arrive.

use std::convert::Infallible;

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Response, StatusCode};
use bytes::Bytes;
use futures_util::stream;

use edge_compute_host::DownstreamResponse;

/// Convert an exchange's downstream response to an axum response.
pub fn into_axum_response(response: DownstreamResponse) -> Response<Body> {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);

    for (name, value) in &response.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            builder = builder.header(name, value);
        }
    }

    let chunks = stream::unfold(response.body, |mut body| async move {
        body.recv()
            .await
            .map(|chunk| (Ok::<Bytes, Infallible>(chunk), body))
    });

    builder
        .body(Body::from_stream(chunks))
        .unwrap_or_else(|_| error(500, "Internal server error"))
}

/// Create an error response with JSON body.
pub fn error(status: u16, message: &str) -> Response<Body> {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::json!({ "error": message }).to_string();
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_streams_body_chunks() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Bytes::from_static(b"hello ")).unwrap();
        tx.send(Bytes::from_static(b"world")).unwrap();
        drop(tx);

        let response = into_axum_response(DownstreamResponse {
            status: 201,
            headers: vec![
                ("content-type".to_string(), "text/plain".to_string()),
                ("bad header".to_string(), "skipped".to_string()),
            ],
            body: rx,
        });

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().len(), 1);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"hello world");
    }

    #[tokio::test]
    async fn test_error_response() {
        let response = error(404, "Service not found: nope");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&body).contains("Service not found"));
    }
}
