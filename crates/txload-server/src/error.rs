//! Server-specific error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Structural errors that reject a whole export file
///
/// Field content never produces one of these: malformed numbers and dates are
/// coerced by the decoder and reported as diagnostics instead.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Unsupported transaction type: {0}")]
    UnsupportedType(i64),

    #[error("Truncated header: expected 3 lines, found {found}")]
    TruncatedHeader { found: usize },

    #[error("Line {line}: missing transaction type field")]
    MissingTypeCode { line: usize },

    #[error("Line {line}: invalid transaction type '{value}'")]
    InvalidTypeCode { line: usize, value: String },

    #[error("Line {line}: {source}")]
    Line {
        line: usize,
        #[source]
        source: Box<DecodeError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DecodeError {
    /// Attach a line number to an error raised while decoding that line
    pub fn at_line(self, line: usize) -> Self {
        match self {
            DecodeError::Line { .. }
            | DecodeError::MissingTypeCode { .. }
            | DecodeError::InvalidTypeCode { .. } => self,
            other => DecodeError::Line {
                line,
                source: Box::new(other),
            },
        }
    }
}

/// Errors returned by the HTTP surface
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Database(ref e) => {
                tracing::error!(error = ?e, "Database error");
                (StatusCode::SERVICE_UNAVAILABLE, "Database unavailable".to_string())
            },
            AppError::NotFound(ref message) => (StatusCode::NOT_FOUND, message.clone()),
        };

        let body = Json(json!({
            "error": {
                "message": message,
                "status": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_at_line_wraps_once() {
        let err = DecodeError::UnsupportedType(9999).at_line(7);
        assert_eq!(err.to_string(), "Line 7: Unsupported transaction type: 9999");

        let again = err.at_line(8);
        assert_eq!(again.to_string(), "Line 7: Unsupported transaction type: 9999");
    }

    #[test]
    fn test_not_found_status() {
        let response = AppError::NotFound("no run yet".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
