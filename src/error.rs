//! Error types for the reclamation core and the HTTP serving layer.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Failures of the reclamation core.
///
/// Everything except `Config` aborts the current pass only; the scheduler
/// retries on the next tick. `Config` is fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum CleanerError {
    #[error("connection to {backend} failed: {message}")]
    Connection {
        backend: &'static str,
        message: String,
    },
    #[error("query on {source_name} failed: {message}")]
    Query {
        source_name: String,
        message: String,
    },
    #[error("i/o error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

impl CleanerError {
    pub fn connection(backend: &'static str, err: impl fmt::Display) -> Self {
        Self::Connection {
            backend,
            message: err.to_string(),
        }
    }

    pub fn query(source_name: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::Query {
            source_name: source_name.into(),
            message: err.to_string(),
        }
    }

    pub fn io(path: impl fmt::Display, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_string(),
            source,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Short label used as Sentry fingerprint and log field.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Query { .. } => "query",
            Self::Io { .. } => "io",
            Self::Config(_) => "config",
            Self::Timeout { .. } => "timeout",
        }
    }

    /// Capture an aborted pass to Sentry.
    pub fn report_to_sentry(&self) {
        sentry::with_scope(
            |scope| {
                scope.set_fingerprint(Some(&["reclamation_pass", self.kind()]));
                scope.set_tag("operation", "reclamation_pass");
                scope.set_tag("error_kind", self.kind());
            },
            || {
                sentry::capture_message(
                    &format!("Reclamation pass aborted: {self}"),
                    sentry::Level::Error,
                );
            },
        );
    }
}

/// Error category determines whether an error should be reported to Sentry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Actual bugs that need investigation - ALWAYS report to Sentry
    Bug,
    /// Expected failures (validation, not found, conflicts) - never report to Sentry
    Expected,
    /// Operational issues (disk full, permissions) - report as warnings
    Operational,
}

/// A structured HTTP error with full context for debugging.
#[derive(Debug)]
pub struct AppError {
    /// The HTTP status code to return
    pub status: StatusCode,
    /// User-facing error message (sanitized)
    pub message: String,
    /// Internal error details for logging (not exposed to users)
    pub internal_message: Option<String>,
    /// The operation/endpoint that failed
    pub operation: &'static str,
    pub category: ErrorCategory,
    /// Additional context as key-value pairs
    pub context: Vec<(&'static str, String)>,
}

impl AppError {
    /// Create a new bug error (will be reported to Sentry as Error)
    pub fn bug(operation: &'static str, internal_msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error".to_string(),
            internal_message: Some(internal_msg.into()),
            operation,
            category: ErrorCategory::Bug,
            context: Vec::new(),
        }
    }

    /// Create an expected error (will NOT be reported to Sentry)
    pub fn expected(
        status: StatusCode,
        operation: &'static str,
        user_msg: impl Into<String>,
    ) -> Self {
        Self {
            status,
            message: user_msg.into(),
            internal_message: None,
            operation,
            category: ErrorCategory::Expected,
            context: Vec::new(),
        }
    }

    /// Create an operational error (will be reported to Sentry as Warning)
    pub fn operational(
        status: StatusCode,
        operation: &'static str,
        user_msg: impl Into<String>,
        internal_msg: impl Into<String>,
    ) -> Self {
        Self {
            status,
            message: user_msg.into(),
            internal_message: Some(internal_msg.into()),
            operation,
            category: ErrorCategory::Operational,
            context: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.push((key, value.into()));
        self
    }

    pub fn report_to_sentry(&self) {
        match self.category {
            ErrorCategory::Bug => self.capture(sentry::Level::Error, "bug"),
            ErrorCategory::Operational => self.capture(sentry::Level::Warning, "operational"),
            ErrorCategory::Expected => self.add_sentry_breadcrumb(),
        }
    }

    fn capture(&self, level: sentry::Level, category: &'static str) {
        sentry::with_scope(
            |scope| {
                scope.set_fingerprint(Some(&[self.operation, self.status.as_str()]));
                for (key, value) in &self.context {
                    scope.set_extra(*key, value.clone().into());
                }
                scope.set_tag("operation", self.operation);
                scope.set_tag("status_code", self.status.as_str());
                scope.set_tag("error_category", category);
            },
            || {
                let msg = format!(
                    "[{}] {} - {}",
                    self.operation,
                    self.status,
                    self.internal_message.as_deref().unwrap_or(&self.message)
                );
                sentry::capture_message(&msg, level);
            },
        );
    }

    fn add_sentry_breadcrumb(&self) {
        sentry::add_breadcrumb(sentry::Breadcrumb {
            category: Some("expected_error".into()),
            message: Some(format!(
                "[{}] {} - {}",
                self.operation, self.status, self.message
            )),
            level: sentry::Level::Info,
            ..Default::default()
        });
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.operation, self.status, self.message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {internal})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Some(internal) = &self.internal_message {
            tracing::warn!(operation = self.operation, status = %self.status, "{internal}");
        }
        self.report_to_sentry();

        let body = Json(ErrorResponse {
            error: self.message.clone(),
            code: Some(self.operation.to_string()),
        });

        (self.status, body).into_response()
    }
}

// Convenience constructors for common error types
impl AppError {
    pub fn bad_request(operation: &'static str, message: impl Into<String>) -> Self {
        Self::expected(StatusCode::BAD_REQUEST, operation, message)
    }

    pub fn not_found(operation: &'static str, message: impl Into<String>) -> Self {
        Self::expected(StatusCode::NOT_FOUND, operation, message)
    }

    pub fn conflict(operation: &'static str, message: impl Into<String>) -> Self {
        Self::expected(StatusCode::CONFLICT, operation, message)
    }

    pub fn payload_too_large(operation: &'static str) -> Self {
        Self::expected(StatusCode::PAYLOAD_TOO_LARGE, operation, "file too big")
    }

    pub fn unsupported_media_type(operation: &'static str) -> Self {
        Self::expected(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            operation,
            "unsupported media type",
        )
    }

    /// Filesystem failure on the upload root (operational - disk or permission issue)
    pub fn storage(operation: &'static str, err: impl fmt::Display) -> Self {
        Self::operational(
            StatusCode::INTERNAL_SERVER_ERROR,
            operation,
            "internal error",
            format!("Storage error: {err}"),
        )
    }

    pub fn internal(operation: &'static str, err: impl fmt::Display) -> Self {
        Self::bug(operation, format!("Internal error: {err}"))
    }
}
