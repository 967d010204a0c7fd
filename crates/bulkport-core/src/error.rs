use thiserror::Error;

use crate::job::JobStatus;

/// Core error types for bulk export requests and job bookkeeping
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid resource type {resource_type}. Supported types: {supported}.")]
    InvalidResourceType {
        resource_type: String,
        supported: String,
    },

    #[error("Repeated resource type {0}")]
    RepeatedResourceType(String),

    #[error("Invalid date format supplied in _since parameter. {0}")]
    InvalidDateFormat(String),

    #[error("_outputFormat parameter must be application/fhir+ndjson, application/ndjson, or ndjson")]
    UnsupportedFormat(String),

    #[error("Invalid parameter: this server does not support the {0} parameter.")]
    UnsupportedParameter(String),

    #[error("Malformed query: {0}")]
    MalformedQuery(String),

    #[error("Invalid group ID")]
    InvalidGroupId(String),

    #[error("Unsupported API version: {0}")]
    UnsupportedVersion(String),

    #[error("Invalid job status transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Invalid job status: {0}")]
    InvalidStatus(String),

    #[error("Invalid job ID: {0}")]
    InvalidJobId(#[from] uuid::Error),

    #[error("Invalid request URL: {0}")]
    InvalidRequestUrl(String),
}

impl CoreError {
    /// Create a new InvalidResourceType error
    pub fn invalid_resource_type(resource_type: impl Into<String>, supported: &[String]) -> Self {
        Self::InvalidResourceType {
            resource_type: resource_type.into(),
            supported: supported.join(", "),
        }
    }

    /// Create a new RepeatedResourceType error
    pub fn repeated_resource_type(resource_type: impl Into<String>) -> Self {
        Self::RepeatedResourceType(resource_type.into())
    }

    /// Create a new InvalidDateFormat error
    pub fn invalid_date_format(detail: impl Into<String>) -> Self {
        Self::InvalidDateFormat(detail.into())
    }

    /// Create a new UnsupportedFormat error
    pub fn unsupported_format(format: impl Into<String>) -> Self {
        Self::UnsupportedFormat(format.into())
    }

    /// Create a new UnsupportedParameter error
    pub fn unsupported_parameter(name: impl Into<String>) -> Self {
        Self::UnsupportedParameter(name.into())
    }

    /// Create a new MalformedQuery error
    pub fn malformed_query(message: impl Into<String>) -> Self {
        Self::MalformedQuery(message.into())
    }

    pub fn invalid_group_id(group_id: impl Into<String>) -> Self {
        Self::InvalidGroupId(group_id.into())
    }

    pub fn unsupported_version(version: impl Into<String>) -> Self {
        Self::UnsupportedVersion(version.into())
    }

    pub fn invalid_request_url(message: impl Into<String>) -> Self {
        Self::InvalidRequestUrl(message.into())
    }

    /// Stable machine-readable code for this error.
    ///
    /// Codes are part of the external contract and are rendered into
    /// error responses alongside the human-readable message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidResourceType { .. } => "invalid_resource_type",
            Self::RepeatedResourceType(_) => "repeated_resource_type",
            Self::InvalidDateFormat(_) => "invalid_date_format",
            Self::UnsupportedFormat(_) => "unsupported_format",
            Self::UnsupportedParameter(_) => "unsupported_parameter",
            Self::MalformedQuery(_) => "malformed_query",
            Self::InvalidGroupId(_) => "invalid_group_id",
            Self::UnsupportedVersion(_) => "unsupported_version",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::InvalidStatus(_) => "invalid_status",
            Self::InvalidJobId(_) => "invalid_job_id",
            Self::InvalidRequestUrl(_) => "invalid_request_url",
        }
    }

    /// Check if this error was caused by client input (4xx category)
    pub fn is_client_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Validation)
    }

    /// Get error category for logging/monitoring
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidResourceType { .. }
            | Self::RepeatedResourceType(_)
            | Self::InvalidDateFormat(_)
            | Self::UnsupportedFormat(_)
            | Self::UnsupportedParameter(_)
            | Self::MalformedQuery(_)
            | Self::InvalidGroupId(_)
            | Self::UnsupportedVersion(_)
            | Self::InvalidJobId(_) => ErrorCategory::Validation,
            Self::InvalidTransition { .. } => ErrorCategory::Conflict,
            Self::InvalidStatus(_) | Self::InvalidRequestUrl(_) => ErrorCategory::Internal,
        }
    }
}

/// Error categories for monitoring and classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Conflict,
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Conflict => write!(f, "conflict"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Convenience result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_resource_type_lists_supported() {
        let supported = vec!["Patient".to_string(), "Coverage".to_string()];
        let err = CoreError::invalid_resource_type("Practitioner", &supported);
        assert_eq!(
            err.to_string(),
            "Invalid resource type Practitioner. Supported types: Patient, Coverage."
        );
        assert!(err.is_client_error());
        assert_eq!(err.kind(), "invalid_resource_type");
    }

    #[test]
    fn test_repeated_resource_type_message() {
        let err = CoreError::repeated_resource_type("Patient");
        assert_eq!(err.to_string(), "Repeated resource type Patient");
        assert_eq!(err.category(), ErrorCategory::Validation);
    }

    #[test]
    fn test_elements_rejection_message() {
        let err = CoreError::unsupported_parameter("_elements");
        assert_eq!(
            err.to_string(),
            "Invalid parameter: this server does not support the _elements parameter."
        );
        assert_eq!(err.kind(), "unsupported_parameter");
    }

    #[test]
    fn test_transition_error_is_conflict() {
        let err = CoreError::InvalidTransition {
            from: JobStatus::Expired,
            to: JobStatus::Completed,
        };
        assert_eq!(
            err.to_string(),
            "Invalid job status transition: Expired -> Completed"
        );
        assert!(!err.is_client_error());
        assert_eq!(err.category(), ErrorCategory::Conflict);
    }

    #[test]
    fn test_uuid_error_conversion() {
        let err: CoreError = uuid::Uuid::parse_str("not-a-uuid").unwrap_err().into();
        assert!(matches!(err, CoreError::InvalidJobId(_)));
        assert!(err.is_client_error());
    }

    #[test]
    fn test_error_categories_display() {
        assert_eq!(ErrorCategory::Validation.to_string(), "validation");
        assert_eq!(ErrorCategory::Conflict.to_string(), "conflict");
        assert_eq!(ErrorCategory::Internal.to_string(), "internal");
    }
}
