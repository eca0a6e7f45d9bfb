use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Failures surfaced by the outbound protection layer.
///
/// Every call through [`crate::executor::CachedFetcher`] resolves to a value
/// or exactly one of these variants.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// The endpoint is currently blocked, either by a stored flag or a fresh 429.
    #[error("rate limited, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    /// Transport failure or missing/invalid configuration.
    #[error("connection error: {0}")]
    Connection(String),

    /// Any other non-2xx answer from the upstream.
    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Error::RateLimited { .. })
    }
}

/// Backend failure inside the shared cache store. Never leaves `store`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Errors rendered to dashboard callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    ValidationError(String),
    RateLimited { retry_after: u64 },
    BadGateway(String),
    InternalServerError(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            ApiError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            ApiError::NotFound(msg) => write!(f, "Not found: {}", msg),
            ApiError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            ApiError::RateLimited { retry_after } => {
                write!(f, "Rate limited, retry after {}s", retry_after)
            }
            ApiError::BadGateway(msg) => write!(f, "Bad gateway: {}", msg),
            ApiError::InternalServerError(msg) => write!(f, "Internal server error: {}", msg),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::RateLimited { retry_after } => ApiError::RateLimited { retry_after },
            Error::Connection(msg) => ApiError::BadGateway(msg),
            Error::Upstream { status, message } => {
                ApiError::BadGateway(format!("Discord returned {}: {}", status, message))
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
            retry_after: None,
        }
    }

    pub fn from_api_error(err: &ApiError) -> Self {
        match err {
            ApiError::Unauthorized(msg) => Self::new("unauthorized", msg, 401),
            ApiError::Forbidden(msg) => Self::new("forbidden", msg, 403),
            ApiError::NotFound(msg) => Self::new("not_found", msg, 404),
            ApiError::ValidationError(msg) => Self::new("validation_error", msg, 422),
            ApiError::RateLimited { retry_after } => Self {
                retry_after: Some(*retry_after),
                ..Self::new("rate_limited", "Discord is rate limiting us, try again shortly", 429)
            },
            ApiError::BadGateway(msg) => Self::new("bad_gateway", msg, 502),
            ApiError::InternalServerError(msg) => Self::new("internal_error", msg, 500),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_api_error(&self);
        let status =
            StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, Json(body)).into_response();

        if let ApiError::RateLimited { retry_after } = self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_maps_to_429_with_header() {
        let response = ApiError::from(Error::RateLimited { retry_after: 30 }).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "30");
    }

    #[test]
    fn test_upstream_and_connection_map_to_502() {
        let upstream = ApiError::from(Error::Upstream {
            status: 404,
            message: "Unknown Guild".into(),
        });
        let connection = ApiError::from(Error::Connection("dns".into()));
        assert_eq!(upstream.into_response().status(), StatusCode::BAD_GATEWAY);
        assert_eq!(connection.into_response().status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_error_response_serialization() {
        let body = ErrorResponse::from_api_error(&ApiError::NotFound("guild".into()));
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["code"], 404);
        assert!(json.get("retry_after").is_none());
    }
}
