//! Per-request correlation id plus error-envelope finishing.
//!
//! Generates or propagates `x-request-id`, and rewrites error responses so
//! the envelope carries the request path and the correlation id travels back
//! in the response header.

use axum::{
    extract::Request,
    http::{header::HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use uuid::Uuid;

use crate::error::{ErrorContext, ErrorEnvelope};

const REQUEST_ID_HEADER: &str = "x-request-id";
const CORRELATION_ID_HEADER: &str = "x-correlation-id";
const RETRY_AFTER_HEADER: &str = "retry-after";

#[derive(Clone, Debug)]
pub struct RequestId(pub String);

pub async fn request_context(mut req: Request, next: Next) -> Response {
    let header_name = HeaderName::from_static(REQUEST_ID_HEADER);

    let id = req
        .headers()
        .get(&header_name)
        .or_else(|| {
            req.headers()
                .get(HeaderName::from_static(CORRELATION_ID_HEADER))
        })
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let path = req.uri().path().to_string();
    req.extensions_mut().insert(RequestId(id.clone()));

    let mut response = next.run(req).await;

    // Errors rendered by AppError carry their context in an extension; re-emit
    // the envelope with the request path filled in.
    if let Some(ctx) = response.extensions().get::<ErrorContext>().cloned() {
        let retry_after = response.headers().get(RETRY_AFTER_HEADER).cloned();
        let envelope = ErrorEnvelope::new(ctx.code, ctx.message, path);
        let mut rebuilt = (ctx.code, Json(envelope)).into_response();
        if let Some(retry_after) = retry_after {
            rebuilt
                .headers_mut()
                .insert(HeaderName::from_static(RETRY_AFTER_HEADER), retry_after);
        }
        response = rebuilt;
    }

    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(header_name, value);
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use axum::{body::Body, middleware, routing::get, Router};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route("/ok", get(|| async { "ok" }))
            .route(
                "/missing",
                get(|| async { Err::<&'static str, _>(AppError::NotFound("gone".into())) }),
            )
            .layer(middleware::from_fn(request_context))
    }

    #[tokio::test]
    async fn generates_request_id_when_absent() {
        let response = app()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/ok")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.headers().get(REQUEST_ID_HEADER).is_some());
    }

    #[tokio::test]
    async fn propagates_caller_request_id() {
        let response = app()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/ok")
                    .header(REQUEST_ID_HEADER, "req-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers().get(REQUEST_ID_HEADER).unwrap(),
            "req-123"
        );
    }

    #[tokio::test]
    async fn error_envelope_carries_the_request_path() {
        let response = app()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::NOT_FOUND);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["code"], 404);
        assert_eq!(value["error"]["message"], "gone");
        assert_eq!(value["error"]["path"], "/missing");
        assert!(value["error"]["timestamp"].is_i64());
    }
}
