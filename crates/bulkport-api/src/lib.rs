//! HTTP-facing error and response types shared by the bulkport server.
//!
//! Every failure leaves the server as a FHIR `OperationOutcome` with
//! `Content-Type: application/fhir+json`, whichever component raised it.

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const FHIR_JSON: &str = "application/fhir+json";
pub const FHIR_NDJSON: &str = "application/fhir+ndjson";
pub const RESPOND_ASYNC: &str = "respond-async";

/// Header carrying the progress of a running export.
pub const X_PROGRESS: HeaderName = HeaderName::from_static("x-progress");

/// Minimal FHIR OperationOutcome representation for API error responses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationOutcome {
    #[serde(rename = "resourceType")]
    pub resource_type: String,
    pub issue: Vec<OperationOutcomeIssue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationOutcomeIssue {
    /// FHIR issue severity: fatal | error | warning | information
    pub severity: String,
    /// FHIR issue type code: invalid | login | not-found | expired | throttled | exception ...
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<IssueDetails>,
    /// Human-readable description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

/// Machine-readable error kind, rendered as `issue.details.text`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IssueDetails {
    pub text: String,
}

impl OperationOutcome {
    pub fn single(severity: &str, code: &str, diagnostics: impl Into<String>) -> Self {
        Self {
            resource_type: "OperationOutcome".to_string(),
            issue: vec![OperationOutcomeIssue {
                severity: severity.to_string(),
                code: code.to_string(),
                details: None,
                diagnostics: Some(diagnostics.into()),
            }],
        }
    }

    #[must_use]
    pub fn with_kind(mut self, kind: &str) -> Self {
        for issue in &mut self.issue {
            issue.details = Some(IssueDetails {
                text: kind.to_string(),
            });
        }
        self
    }
}

/// High-level API errors mapped to HTTP responses and FHIR OperationOutcome
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {message}")]
    BadRequest { message: String, kind: Option<String> },
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Gone: {message}")]
    Gone {
        message: String,
        /// HTTP date after which the content stopped being available.
        expires: Option<String>,
    },
    #[error("Too many requests: {message}")]
    TooManyRequests { message: String, retry_after_secs: u64 },
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest {
            message: msg.into(),
            kind: None,
        }
    }
    /// Bad request carrying a machine-readable error kind.
    pub fn invalid(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::BadRequest {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
    pub fn gone(msg: impl Into<String>) -> Self {
        Self::Gone {
            message: msg.into(),
            expires: None,
        }
    }
    pub fn gone_since(msg: impl Into<String>, expires: impl Into<String>) -> Self {
        Self::Gone {
            message: msg.into(),
            expires: Some(expires.into()),
        }
    }
    pub fn too_many_requests(msg: impl Into<String>, retry_after_secs: u64) -> Self {
        Self::TooManyRequests {
            message: msg.into(),
            retry_after_secs,
        }
    }
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Gone { .. } => StatusCode::GONE,
            ApiError::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_operation_outcome(&self) -> OperationOutcome {
        match self {
            ApiError::BadRequest { message, kind } => {
                let outcome = OperationOutcome::single("error", "invalid", message);
                match kind {
                    Some(kind) => outcome.with_kind(kind),
                    None => outcome,
                }
            }
            ApiError::Unauthorized(msg) => OperationOutcome::single("error", "login", msg),
            ApiError::NotFound(msg) => OperationOutcome::single("error", "not-found", msg),
            ApiError::Gone { message, .. } => OperationOutcome::single("error", "expired", message),
            ApiError::TooManyRequests { message, .. } => {
                OperationOutcome::single("error", "throttled", message)
            }
            ApiError::Internal(msg) => OperationOutcome::single("fatal", "exception", msg),
        }
    }

    fn extra_headers(&self) -> Vec<(HeaderName, HeaderValue)> {
        match self {
            ApiError::TooManyRequests {
                retry_after_secs, ..
            } => vec![(header::RETRY_AFTER, HeaderValue::from(*retry_after_secs))],
            ApiError::Gone {
                expires: Some(expires),
                ..
            } => HeaderValue::from_str(expires)
                .map(|v| vec![(header::EXPIRES, v)])
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let headers = self.extra_headers();
        let mut response = ApiResponse::new(self.to_operation_outcome(), status);
        response.headers.extend(headers);
        response.into_response()
    }
}

// -------------------------
// API Response Wrapper
// -------------------------

#[derive(Debug, Clone)]
pub struct ApiResponse<T> {
    pub value: T,
    pub status: StatusCode,
    pub headers: Vec<(HeaderName, HeaderValue)>,
}

impl<T> ApiResponse<T> {
    pub fn new(value: T, status: StatusCode) -> Self {
        Self {
            value,
            status,
            headers: Vec::new(),
        }
    }

    pub fn ok(value: T) -> Self {
        Self::new(value, StatusCode::OK)
    }

    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.push((name, value));
        self
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let body = serde_json::to_vec(&self.value).unwrap_or_else(|_| {
            serde_json::to_vec(&OperationOutcome::single(
                "fatal",
                "exception",
                "Serialization failure",
            ))
            .unwrap_or_else(|_| b"{}".to_vec())
        });

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = self.status;
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(FHIR_JSON));
        for (name, value) in self.headers {
            headers.insert(name, value);
        }
        response
    }
}

/// An empty-bodied response carrying only status and headers.
pub fn empty_response(status: StatusCode, headers: Vec<(HeaderName, HeaderValue)>) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    for (name, value) in headers {
        response.headers_mut().insert(name, value);
    }
    response
}

// -------------------------
// Async request negotiation
// -------------------------

/// Validates the headers a bulk `$export` kick-off request must carry:
/// `Accept: application/fhir+json` and `Prefer: respond-async`.
pub fn validate_export_headers(headers: &HeaderMap) -> Result<(), ApiError> {
    require_header(
        headers,
        header::ACCEPT,
        FHIR_JSON,
        "Accept header is required",
        "application/fhir+json is the only supported response format",
    )?;
    require_header(
        headers,
        HeaderName::from_static("prefer"),
        RESPOND_ASYNC,
        "The Prefer header is required and must be set to respond-async",
        "Only respond-async is supported by the Prefer header",
    )
}

fn require_header(
    headers: &HeaderMap,
    name: HeaderName,
    expected: &str,
    missing: &str,
    unsupported: &str,
) -> Result<(), ApiError> {
    let Some(value) = headers.get(&name) else {
        return Err(ApiError::invalid("missing_header", missing));
    };
    let matches = value
        .to_str()
        .unwrap_or("")
        .split(',')
        .any(|v| v.trim().eq_ignore_ascii_case(expected));
    if !matches {
        return Err(ApiError::invalid("unsupported_header", unsupported));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn export_headers(accept: Option<&'static str>, prefer: Option<&'static str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(v) = accept {
            headers.insert(header::ACCEPT, HeaderValue::from_static(v));
        }
        if let Some(v) = prefer {
            headers.insert("prefer", HeaderValue::from_static(v));
        }
        headers
    }

    #[test]
    fn into_response_sets_status_and_content_type() {
        let resp = ApiError::bad_request("Invalid parameter").into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            &HeaderValue::from_static(FHIR_JSON)
        );
    }

    #[test]
    fn too_many_requests_carries_retry_after() {
        let resp = ApiError::too_many_requests("busy", 5).into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get(header::RETRY_AFTER).unwrap(), "5");
    }

    #[test]
    fn gone_carries_expires() {
        let resp = ApiError::gone_since("expired", "Tue, 02 Jan 2024 00:00:00 GMT").into_response();
        assert_eq!(resp.status(), StatusCode::GONE);
        assert_eq!(
            resp.headers().get(header::EXPIRES).unwrap(),
            "Tue, 02 Jan 2024 00:00:00 GMT"
        );
    }

    #[test]
    fn api_error_variants_map_to_status_and_codes() {
        let cases: Vec<(ApiError, StatusCode, &str)> = vec![
            (ApiError::bad_request("x"), StatusCode::BAD_REQUEST, "invalid"),
            (ApiError::unauthorized("x"), StatusCode::UNAUTHORIZED, "login"),
            (ApiError::not_found("x"), StatusCode::NOT_FOUND, "not-found"),
            (ApiError::gone("x"), StatusCode::GONE, "expired"),
            (
                ApiError::too_many_requests("x", 1),
                StatusCode::TOO_MANY_REQUESTS,
                "throttled",
            ),
            (
                ApiError::internal("x"),
                StatusCode::INTERNAL_SERVER_ERROR,
                "exception",
            ),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status_code(), status);
            assert_eq!(err.to_operation_outcome().issue[0].code, code);
        }
    }

    #[test]
    fn error_kind_is_rendered_as_details() {
        let outcome = ApiError::invalid("repeated_resource_type", "Repeated resource type Patient")
            .to_operation_outcome();
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["issue"][0]["details"]["text"], "repeated_resource_type");
        assert_eq!(json["issue"][0]["diagnostics"], "Repeated resource type Patient");
    }

    #[test]
    fn export_headers_required() {
        assert!(
            validate_export_headers(&export_headers(Some(FHIR_JSON), Some(RESPOND_ASYNC))).is_ok()
        );

        let err = validate_export_headers(&export_headers(None, Some(RESPOND_ASYNC))).unwrap_err();
        assert_eq!(err.to_string(), "Bad request: Accept header is required");

        let err = validate_export_headers(&export_headers(Some("application/json"), Some(RESPOND_ASYNC)))
            .unwrap_err();
        assert!(err.to_string().contains("only supported response format"));

        let err = validate_export_headers(&export_headers(Some(FHIR_JSON), None)).unwrap_err();
        assert!(err.to_string().contains("Prefer header is required"));

        let err = validate_export_headers(&export_headers(Some(FHIR_JSON), Some("return=minimal")))
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn empty_response_has_no_body_headers() {
        let resp = empty_response(StatusCode::ACCEPTED, vec![(X_PROGRESS, HeaderValue::from_static("Pending"))]);
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(resp.headers().get(X_PROGRESS).unwrap(), "Pending");
        assert!(resp.headers().get(header::CONTENT_TYPE).is_none());
    }
}
