use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Serialize;

/// Wire format for every error response:
/// `{"error": {"code": <int>, "message": <string>, "path": <string>, "timestamp": <unix>}}`.
///
/// The `path` field is empty when the error is rendered outside the
/// envelope middleware; the middleware rewrites the body with the matched
/// request path before it reaches the client.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,
    pub path: String,
    pub timestamp: i64,
}

impl ErrorEnvelope {
    pub fn new(code: StatusCode, message: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                code: code.as_u16(),
                message: message.into(),
                path: path.into(),
                timestamp: Utc::now().timestamp(),
            },
        }
    }
}

/// Response extension carrying the error details so the envelope middleware
/// can re-render the body with the request path filled in.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub code: StatusCode,
    pub message: String,
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    Locked(String),
    RateLimited { message: String, retry_after: u64 },
    Unavailable(String),
    Validation(Vec<String>),
    InternalServerError(anyhow::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Locked(_) => StatusCode::LOCKED,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            AppError::BadRequest(msg)
            | AppError::Unauthorized(msg)
            | AppError::Forbidden(msg)
            | AppError::NotFound(msg)
            | AppError::Conflict(msg)
            | AppError::Locked(msg)
            | AppError::Unavailable(msg) => msg.clone(),
            AppError::RateLimited { message, .. } => message.clone(),
            AppError::Validation(errors) => format!("Validation failed: {}", errors.join("; ")),
            // Internal error text stays in the logs; the correlation id travels
            // back to the caller in the x-request-id response header.
            AppError::InternalServerError(_) => "Internal server error".to_string(),
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.message();

        if let AppError::InternalServerError(err) = &self {
            tracing::error!("Internal server error: {:?}", err);
        }

        let retry_after = match &self {
            AppError::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        };

        let envelope = ErrorEnvelope::new(status, message.clone(), "");
        let mut response = (status, Json(envelope)).into_response();
        response.extensions_mut().insert(ErrorContext {
            code: status,
            message,
        });
        if let Some(retry_after) = retry_after {
            if let Ok(value) = retry_after.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::InternalServerError(err)
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::NotFound("Resource not found".to_string()),
            _ => AppError::InternalServerError(err.into()),
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let messages = errors
            .field_errors()
            .into_iter()
            .flat_map(|(field, errors)| {
                errors.iter().map(move |error| {
                    let detail = error
                        .message
                        .as_ref()
                        .map(|msg| msg.to_string())
                        .unwrap_or_else(|| error.code.to_string());
                    format!("{field}: {detail}")
                })
            })
            .collect();
        AppError::Validation(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_error_kinds() {
        assert_eq!(
            AppError::Locked("account locked".into()).status(),
            StatusCode::LOCKED
        );
        assert_eq!(
            AppError::RateLimited {
                message: "slow down".into(),
                retry_after: 30
            }
            .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            AppError::Unavailable("upstream down".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn internal_error_hides_details() {
        let err = AppError::InternalServerError(anyhow::anyhow!("connection refused to 10.0.0.3"));
        assert_eq!(err.message(), "Internal server error");
    }

    #[test]
    fn envelope_serializes_with_nested_error_object() {
        let envelope = ErrorEnvelope::new(StatusCode::NOT_FOUND, "missing", "/api/v1/none");
        let value = serde_json::to_value(&envelope).expect("serialize envelope");
        assert_eq!(value["error"]["code"], 404);
        assert_eq!(value["error"]["message"], "missing");
        assert_eq!(value["error"]["path"], "/api/v1/none");
        assert!(value["error"]["timestamp"].is_i64());
    }
}
