use std::time::SystemTime;

use axum::response::{IntoResponse, Response};
use thiserror::Error;
use time::OffsetDateTime;

use bulkport_api::ApiError;
use bulkport_core::CoreError;
use bulkport_storage::StorageError;

use super::watermark::WatermarkError;

pub const FAILED_JOB_MESSAGE: &str =
    "Service encountered numerous errors.  Unable to complete the request.";

/// Failures of the export endpoints, by how a client should react to them.
#[derive(Debug, Error)]
pub enum ExportError {
    /// Bad client input; nothing was persisted.
    #[error(transparent)]
    Validation(CoreError),

    /// A request header the export endpoints require is missing or wrong.
    #[error(transparent)]
    Header(ApiError),

    /// The tenant already has an overlapping export in flight.
    #[error("Export already in progress; retry after {retry_after_secs}s")]
    Throttled { retry_after_secs: u64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Gone: {message}")]
    Gone {
        message: String,
        expires: Option<OffsetDateTime>,
    },

    /// The job failed; no partial manifest is served.
    #[error("Job failed")]
    JobFailed,

    /// Store, queue or upstream failure.
    #[error("Dependency failure: {0}")]
    Dependency(String),

    /// Unexpected invariant violation.
    #[error("Internal error: {0}")]
    Fatal(String),
}

impl ExportError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn gone(msg: impl Into<String>, expires: Option<OffsetDateTime>) -> Self {
        Self::Gone {
            message: msg.into(),
            expires,
        }
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }
}

impl From<CoreError> for ExportError {
    fn from(e: CoreError) -> Self {
        if e.is_client_error() {
            Self::Validation(e)
        } else {
            Self::Fatal(e.to_string())
        }
    }
}

impl From<StorageError> for ExportError {
    fn from(e: StorageError) -> Self {
        Self::Dependency(e.to_string())
    }
}

impl From<WatermarkError> for ExportError {
    fn from(e: WatermarkError) -> Self {
        Self::Dependency(format!("transaction time probe failed: {e}"))
    }
}

pub fn http_date(t: OffsetDateTime) -> String {
    httpdate::fmt_http_date(SystemTime::from(t))
}

impl From<ExportError> for ApiError {
    fn from(e: ExportError) -> Self {
        match e {
            ExportError::Validation(core) => ApiError::invalid(core.kind(), core.to_string()),
            ExportError::Header(api) => api,
            ExportError::Throttled { retry_after_secs } => {
                ApiError::too_many_requests("Too Many Requests", retry_after_secs)
            }
            ExportError::NotFound(msg) => ApiError::not_found(msg),
            ExportError::Gone {
                message,
                expires: Some(expires),
            } => ApiError::gone_since(message, http_date(expires)),
            ExportError::Gone {
                message,
                expires: None,
            } => ApiError::gone(message),
            ExportError::JobFailed => ApiError::internal(FAILED_JOB_MESSAGE),
            ExportError::Dependency(detail) => {
                tracing::error!(error = %detail, "Export dependency failure");
                ApiError::internal("An internal error occurred")
            }
            ExportError::Fatal(detail) => {
                tracing::error!(error = %detail, "Export internal error");
                ApiError::internal("An internal error occurred")
            }
        }
    }
}

impl IntoResponse for ExportError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{StatusCode, header};
    use time::macros::datetime;

    #[test]
    fn taxonomy_maps_to_status_codes() {
        let cases: Vec<(ExportError, StatusCode)> = vec![
            (
                CoreError::repeated_resource_type("Patient").into(),
                StatusCode::BAD_REQUEST,
            ),
            (
                ExportError::Throttled { retry_after_secs: 3 },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (ExportError::not_found("x"), StatusCode::NOT_FOUND),
            (ExportError::gone("x", None), StatusCode::GONE),
            (ExportError::JobFailed, StatusCode::INTERNAL_SERVER_ERROR),
            (
                StorageError::internal("boom").into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status_code(), status);
        }
    }

    #[test]
    fn validation_kind_reaches_outcome() {
        let api = ApiError::from(ExportError::from(CoreError::repeated_resource_type("Patient")));
        let outcome = api.to_operation_outcome();
        assert_eq!(
            outcome.issue[0].details.as_ref().unwrap().text,
            "repeated_resource_type"
        );
    }

    #[test]
    fn dependency_details_are_not_exposed() {
        let api = ApiError::from(ExportError::Dependency("password=hunter2".into()));
        let outcome = api.to_operation_outcome();
        assert!(!outcome.issue[0].diagnostics.as_ref().unwrap().contains("hunter2"));
    }

    #[test]
    fn gone_carries_http_date() {
        let resp = ExportError::gone("expired", Some(datetime!(2024-01-02 00:00:00 UTC)))
            .into_response();
        assert_eq!(
            resp.headers().get(header::EXPIRES).unwrap(),
            "Tue, 02 Jan 2024 00:00:00 GMT"
        );
    }

    #[test]
    fn throttled_carries_retry_after() {
        let resp = ExportError::Throttled { retry_after_secs: 4 }.into_response();
        assert_eq!(resp.headers().get(header::RETRY_AFTER).unwrap(), "4");
    }
}
