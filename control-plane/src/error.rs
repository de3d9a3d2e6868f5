//! Typed error kinds shared by every component, mapped to HTTP status codes
//! at the axum boundary.

use core::fmt;
use core::panic::Location;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// The closed set of error kinds a leaf component may fail with.
///
/// Background workers never let these escape to a request handler: they log
/// and retry on the next tick instead (see the `Task` impls in each
/// component module).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Authentication,
    Authorization,
    NotFound,
    Conflict,
    RateLimited,
    Unavailable,
    Crypto,
    Store,
    Cache,
}

impl ErrorKind {
    fn status_code(self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
            ErrorKind::Authorization => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Crypto | ErrorKind::Store | ErrorKind::Cache => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub struct ControlPlaneError {
    pub kind: ErrorKind,
    pub loc: &'static Location<'static>,
    pub message: String,
    pub retry_after: Option<u64>,
    pub source: Option<Box<dyn std::error::Error + Sync + Send + 'static>>,
}

impl ControlPlaneError {
    #[track_caller]
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            loc: Location::caller(),
            message: message.into(),
            retry_after: None,
            source: None,
        }
    }

    #[track_caller]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    #[track_caller]
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, message)
    }

    #[track_caller]
    pub fn authorization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authorization, message)
    }

    #[track_caller]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    #[track_caller]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    #[track_caller]
    pub fn rate_limited(message: impl Into<String>, retry_after_secs: u64) -> Self {
        let mut err = Self::new(ErrorKind::RateLimited, message);
        err.retry_after = Some(retry_after_secs);
        err
    }

    #[track_caller]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    #[track_caller]
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Crypto, message)
    }

    #[track_caller]
    pub fn store(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Store, message)
    }

    #[track_caller]
    pub fn cache(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cache, message)
    }

    #[track_caller]
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Sync + Send + 'static>>,
    {
        self.source = Some(source.into());
        self
    }
}

impl fmt::Debug for ControlPlaneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} at {}: {}", self.kind, self.loc, self.message)
    }
}

impl fmt::Display for ControlPlaneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}: {}", self.kind.status_code(), self.loc, self.message)?;

        if let Some(source) = self.source.as_deref() {
            write!(f, " [source: {source}")?;
            for cause in anyhow::Chain::new(source).skip(1) {
                write!(f, ", because {cause}")?;
            }
            write!(f, "]")?;
        }

        Ok(())
    }
}

impl std::error::Error for ControlPlaneError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|e| e as _)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    status: u16,
}

impl IntoResponse for ControlPlaneError {
    fn into_response(self) -> Response {
        let status = self.kind.status_code();

        tracing::error!(error = %self, "request failed");

        let body = Json(ErrorBody {
            error: self.message,
            status: status.as_u16(),
        });

        let mut response = (status, body).into_response();

        if let Some(secs) = self.retry_after {
            if let Ok(value) = axum::http::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(axum::http::header::RETRY_AFTER, value);
            }
        }

        response
    }
}

/// Generic `{success, data}` wrapper for handlers that return a payload
/// directly, matching the spec's `{success, data}` / `{error, status}`
/// response shape.
#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self { success: true, data }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

pub type Result<T> = core::result::Result<T, ControlPlaneError>;
